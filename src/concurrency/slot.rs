//! Single-occupancy guard for analysis sessions.
//!
//! The guest can only detonate one sample at a time: the staged binary,
//! the harness output and the capture file all live at fixed paths.
//! `SessionSlot::begin` hands out a lease; a second `begin` while a lease is
//! held fails with [`Error::Conflict`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::control::SessionId;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SlotState {
    Idle {
        last_session: Option<SessionId>,
        last_finished: Option<DateTime<Utc>>,
    },
    Running {
        session: SessionId,
        started_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
pub struct SessionSlot {
    state: Arc<Mutex<SlotState>>,
}

impl Default for SessionSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionSlot {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SlotState::Idle {
                last_session: None,
                last_finished: None,
            })),
        }
    }

    /// Claim the slot for `session`.
    pub fn begin(&self, session: &SessionId) -> Result<SessionLease> {
        let mut state = lock(&self.state);
        if let SlotState::Running { session: active, .. } = &*state {
            return Err(Error::Conflict(format!(
                "session {} is already running",
                active
            )));
        }

        *state = SlotState::Running {
            session: session.clone(),
            started_at: Utc::now(),
        };

        Ok(SessionLease {
            state: Arc::clone(&self.state),
            session: session.clone(),
            released: false,
        })
    }

    pub fn snapshot(&self) -> SlotState {
        lock(&self.state).clone()
    }

    pub fn is_busy(&self) -> bool {
        matches!(*lock(&self.state), SlotState::Running { .. })
    }
}

/// RAII lease that frees the slot on drop.
#[derive(Debug)]
pub struct SessionLease {
    state: Arc<Mutex<SlotState>>,
    session: SessionId,
    released: bool,
}

impl SessionLease {
    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Release the slot explicitly.
    pub fn finish(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        *lock(&self.state) = SlotState::Idle {
            last_session: Some(self.session.clone()),
            last_finished: Some(Utc::now()),
        };
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.release();
    }
}

// A panic while holding the lock cannot leave the state half-written.
fn lock(state: &Mutex<SlotState>) -> MutexGuard<'_, SlotState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
