//! Host side of the control channel: receives status lines, artifacts and the
//! finished signal for the one session currently being driven.

use axum::{
    Form, Router,
    extract::{
        DefaultBodyLimit, Multipart, Path, State, multipart::MultipartRejection,
        rejection::FormRejection,
    },
    http::{Method, StatusCode},
    routing::{any, get, post},
};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use super::store::ArtifactStore;
use crate::control::{
    COLLECTION_PATH, FILE_FIELD, FINISHED_PATH, HEALTH_BODY, HEALTH_PATH, STATUS_PATH, SessionId,
    StatusForm,
};
use crate::error::{self, AppError, Error};

pub struct CollectionState {
    session: SessionId,
    store: Arc<ArtifactStore>,
    received: Mutex<BTreeSet<String>>,
    finished: Mutex<Option<oneshot::Sender<SessionId>>>,
}

impl CollectionState {
    /// State for `session` plus the receiver that fires on its finished signal.
    pub fn new(
        session: SessionId,
        store: Arc<ArtifactStore>,
    ) -> (Arc<Self>, oneshot::Receiver<SessionId>) {
        let (tx, rx) = oneshot::channel();
        let state = Arc::new(Self {
            session,
            store,
            received: Mutex::new(BTreeSet::new()),
            finished: Mutex::new(Some(tx)),
        });
        (state, rx)
    }

    /// Filenames stored so far for this session.
    pub fn received(&self) -> BTreeSet<String> {
        lock(&self.received).clone()
    }

    fn check_session(&self, raw: &str) -> error::Result<SessionId> {
        let id = SessionId::parse(raw)?;
        if id != self.session {
            return Err(Error::UnknownSession(id.to_string()));
        }
        Ok(id)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn router(state: Arc<CollectionState>, max_upload: usize) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(health))
        .route(
            &format!("{}/{{uuid}}", STATUS_PATH),
            post(status_update).fallback(post_only),
        )
        .route(
            &format!("{}/{{uuid}}", COLLECTION_PATH),
            post(collect)
                .layer(DefaultBodyLimit::max(max_upload))
                .fallback(post_only),
        )
        .route(
            &format!("{}/{{uuid}}", FINISHED_PATH),
            get(finished).fallback(get_only),
        )
        .route(&format!("{}/", STATUS_PATH), any(missing_uuid))
        .route(&format!("{}/", COLLECTION_PATH), any(missing_uuid))
        .route(&format!("{}/", FINISHED_PATH), any(missing_uuid))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// A running collection server bound for a single session.
pub struct CollectionServer {
    addr: SocketAddr,
    state: Arc<CollectionState>,
    finished_rx: oneshot::Receiver<SessionId>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    serve: JoinHandle<std::io::Result<()>>,
}

impl CollectionServer {
    pub async fn bind(
        addr: SocketAddr,
        session: SessionId,
        store: Arc<ArtifactStore>,
        max_upload: usize,
    ) -> error::Result<Self> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        let (state, finished_rx) = CollectionState::new(session, store);
        let app = router(Arc::clone(&state), max_upload);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        info!(
            "Collection server for {} listening on http://{}",
            state.session, addr
        );

        let serve = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        Ok(Self {
            addr,
            state,
            finished_rx,
            shutdown_tx: Some(shutdown_tx),
            serve,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn session(&self) -> &SessionId {
        &self.state.session
    }

    pub fn received(&self) -> BTreeSet<String> {
        self.state.received()
    }

    /// Resolves once the guest reports the session finished.
    pub fn finished_signal(&mut self) -> &mut oneshot::Receiver<SessionId> {
        &mut self.finished_rx
    }

    /// Stop accepting requests and give in-flight ones up to `drain` to complete.
    pub async fn shutdown(mut self, drain: Duration) -> BTreeSet<String> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        match tokio::time::timeout(drain, &mut self.serve).await {
            Ok(Ok(Ok(()))) => debug!("Collection server drained"),
            Ok(Ok(Err(e))) => warn!("Collection server stopped with error: {}", e),
            Ok(Err(e)) => warn!("Collection server task failed: {}", e),
            Err(_) => {
                warn!(
                    "Collection server did not drain within {:?}; closing remaining connections",
                    drain
                );
                self.serve.abort();
            }
        }

        self.state.received()
    }
}

async fn health() -> &'static str {
    HEALTH_BODY
}

async fn status_update(
    State(state): State<Arc<CollectionState>>,
    Path(uuid): Path<String>,
    form: Result<Form<StatusForm>, FormRejection>,
) -> Result<StatusCode, AppError> {
    let Form(form) = form.map_err(|e| {
        debug!("Rejected status update for {}: {}", uuid, e.body_text());
        AppError(StatusCode::BAD_REQUEST, e.body_text())
    })?;

    let message = form.message.as_deref().map(str::trim).unwrap_or_default();
    if message.is_empty() {
        debug!("Rejected status update for {} without message", uuid);
        return Err(AppError(
            StatusCode::BAD_REQUEST,
            "Expected message to be set, got nothing".to_string(),
        ));
    }

    let session = state.check_session(&uuid).inspect_err(|e| {
        debug!("Rejected status update: {}", e);
    })?;

    info!(
        "Received status update for {}. Message: {}",
        session, message
    );
    if let Some(detail) = form.error.as_deref().map(str::trim).filter(|e| !e.is_empty()) {
        warn!("Session {} reported error: {}", session, detail);
    }

    Ok(StatusCode::OK)
}

async fn collect(
    State(state): State<Arc<CollectionState>>,
    Path(uuid): Path<String>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<StatusCode, AppError> {
    let session = state.check_session(&uuid).inspect_err(|e| {
        debug!("Rejected artifact upload: {}", e);
    })?;
    let mut multipart = multipart.map_err(|e| upload_failed(&session, e.body_text()))?;

    loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|e| upload_failed(&session, e.body_text()))?;
        let Some(field) = field else {
            return Err(upload_failed(
                &session,
                format!("missing '{}' field", FILE_FIELD),
            ));
        };
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let filename = field.file_name().unwrap_or_default().to_string();
        if filename.is_empty() {
            return Err(upload_failed(&session, "upload has no filename".to_string()));
        }
        let bytes = field
            .bytes()
            .await
            .map_err(|e| upload_failed(&session, e.body_text()))?;

        let path = state
            .store
            .write_artifact(&session, &filename, &bytes)
            .await
            .inspect_err(|e| warn!("Could not store {} for {}: {}", filename, session, e))?;

        info!(
            "Collected {} for {} ({} bytes)",
            path.display(),
            session,
            bytes.len()
        );
        lock(&state.received).insert(filename);
        return Ok(StatusCode::OK);
    }
}

async fn finished(
    State(state): State<Arc<CollectionState>>,
    Path(uuid): Path<String>,
) -> Result<StatusCode, AppError> {
    let session = state.check_session(&uuid)?;

    let sender = lock(&state.finished).take().ok_or_else(|| {
        warn!("Duplicate finished signal for {}", session);
        Error::Conflict(format!("session {} already finished", session))
    })?;

    info!("Session {} reported finished", session);
    if sender.send(session).is_err() {
        debug!("Finished signal arrived after the driver stopped waiting");
    }

    Ok(StatusCode::OK)
}

async fn missing_uuid() -> AppError {
    debug!("Rejected control request without session id");
    AppError(
        StatusCode::BAD_REQUEST,
        "Expected session id in path, got nothing".to_string(),
    )
}

async fn post_only(method: Method) -> AppError {
    AppError(
        StatusCode::BAD_REQUEST,
        format!("'{}' http method is not supported. Please use POST.", method),
    )
}

async fn get_only(method: Method) -> AppError {
    AppError(
        StatusCode::BAD_REQUEST,
        format!("'{}' http method is not supported. Please use GET.", method),
    )
}

fn upload_failed(session: &SessionId, detail: String) -> AppError {
    warn!("Artifact upload for {} failed: {}", session, detail);
    AppError(StatusCode::INTERNAL_SERVER_ERROR, detail)
}
