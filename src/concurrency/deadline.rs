//! Cancellation tokens with an optional wall-clock bound.
//!
//! A `Deadline` fires either when its expiry instant passes or when someone
//! calls [`Deadline::cancel`]. Children observe their parent, so cancelling
//! a session deadline also stops every task deadline derived from it, while
//! cancelling a child (e.g. to end packet capture) leaves the parent running.

use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The time budget ran out.
    DeadlineExceeded,
    /// An explicit stop signal was sent.
    Stopped,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::DeadlineExceeded => f.write_str("deadline exceeded"),
            CancelReason::Stopped => f.write_str("stopped"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Deadline {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    expires_at: Option<Instant>,
    state: watch::Sender<Option<CancelReason>>,
    parent: Option<Deadline>,
}

impl Deadline {
    /// A deadline that fires `budget` from now.
    pub fn after(budget: Duration) -> Self {
        Self::build(Some(Instant::now() + budget), None)
    }

    /// A deadline that only fires when cancelled.
    pub fn never() -> Self {
        Self::build(None, None)
    }

    /// Derive a deadline that fires with this one, or earlier when cancelled itself.
    pub fn child(&self) -> Self {
        Self::build(None, Some(self.clone()))
    }

    /// Derive a deadline bounded both by this one and by `budget`.
    pub fn child_after(&self, budget: Duration) -> Self {
        Self::build(Some(Instant::now() + budget), Some(self.clone()))
    }

    fn build(expires_at: Option<Instant>, parent: Option<Deadline>) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                expires_at,
                state,
                parent,
            }),
        }
    }

    /// Send the stop signal. Has no effect once the deadline has fired.
    pub fn cancel(&self) {
        if self.is_cancelled() {
            return;
        }
        self.inner.state.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(CancelReason::Stopped);
                true
            } else {
                false
            }
        });
    }

    /// Why the deadline fired, or `None` while it is still live.
    pub fn reason(&self) -> Option<CancelReason> {
        let own = *self.inner.state.borrow();
        if own.is_some() {
            return own;
        }
        if let Some(at) = self.inner.expires_at
            && Instant::now() >= at
        {
            return Some(CancelReason::DeadlineExceeded);
        }
        self.inner.parent.as_ref().and_then(|p| p.reason())
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Time left before expiry, taking ancestors into account.
    /// `None` means unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        let own = self
            .inner
            .expires_at
            .map(|at| at.saturating_duration_since(Instant::now()));
        let parent = self.inner.parent.as_ref().and_then(|p| p.remaining());
        match (own, parent) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Resolves once the deadline fires.
    pub fn cancelled(&self) -> Pin<Box<dyn Future<Output = CancelReason> + Send + '_>> {
        Box::pin(async move {
            if let Some(reason) = self.reason() {
                return reason;
            }

            let mut rx = self.inner.state.subscribe();
            let signalled = async move {
                loop {
                    let current = *rx.borrow_and_update();
                    if let Some(reason) = current {
                        return reason;
                    }
                    if rx.changed().await.is_err() {
                        return std::future::pending().await;
                    }
                }
            };

            let expired = async {
                match self.inner.expires_at {
                    Some(at) => {
                        tokio::time::sleep_until(at).await;
                        CancelReason::DeadlineExceeded
                    }
                    None => std::future::pending().await,
                }
            };

            let inherited = async {
                match &self.inner.parent {
                    Some(parent) => parent.cancelled().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                reason = signalled => reason,
                reason = expired => reason,
                reason = inherited => reason,
            }
        })
    }
}
