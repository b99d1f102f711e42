//! HTTP endpoints of the in-guest agent.

use axum::{
    Json, Router,
    extract::{
        DefaultBodyLimit, Multipart, Query, State, multipart::MultipartRejection,
        rejection::QueryRejection,
    },
    http::{Method, StatusCode},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use super::filetype::FileType;
use super::orchestrator::{Orchestrator, SessionReport, SessionRequest};
use crate::concurrency::{SessionSlot, SlotState};
use crate::config::AgentConfig;
use crate::control::{
    AGENT_STATUS_PATH, FILE_FIELD, HEALTH_BODY, HEALTH_PATH, Reporter, START_PATH, SessionId,
    StartQuery, TRANSFER_PATH,
};
use crate::error::AppError;
use crate::exec::CommandRunner;

/// The sample currently sitting in the staging directory.
#[derive(Debug, Clone, Serialize)]
pub struct StagedSample {
    pub original_name: String,
    pub file_type: FileType,
    pub size: usize,
    pub received_at: DateTime<Utc>,
}

pub struct AgentState {
    config: AgentConfig,
    slot: SessionSlot,
    orchestrator: Arc<Orchestrator>,
    staged: RwLock<Option<StagedSample>>,
    last_report: RwLock<Option<SessionReport>>,
}

impl AgentState {
    pub fn new(config: AgentConfig, orchestrator: Orchestrator) -> Arc<Self> {
        Arc::new(Self {
            config,
            slot: SessionSlot::new(),
            orchestrator: Arc::new(orchestrator),
            staged: RwLock::new(None),
            last_report: RwLock::new(None),
        })
    }

    pub fn slot(&self) -> &SessionSlot {
        &self.slot
    }

    pub async fn last_report(&self) -> Option<SessionReport> {
        self.last_report.read().await.clone()
    }
}

#[derive(Debug, Serialize)]
struct AgentStatus {
    slot: SlotState,
    staged: Option<StagedSample>,
    last_session: Option<SessionReport>,
}

pub fn router(state: Arc<AgentState>) -> Router {
    let max_sample = state.config.max_sample_mb.saturating_mul(1024 * 1024);

    Router::new()
        .route(HEALTH_PATH, get(health))
        .route(START_PATH, get(start).post(start))
        .route(
            TRANSFER_PATH,
            post(transfer)
                .layer(DefaultBodyLimit::max(max_sample))
                .fallback(post_only),
        )
        .route(AGENT_STATUS_PATH, get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub struct AgentServer {
    bind: String,
    port: u16,
    state: Arc<AgentState>,
}

impl AgentServer {
    pub fn new(
        config: &AgentConfig,
        runner: Arc<dyn CommandRunner>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        let orchestrator = Orchestrator::new(config.clone(), runner, reporter);
        Self {
            bind: config.bind.clone(),
            port: config.port,
            state: AgentState::new(config.clone(), orchestrator),
        }
    }

    /// Serve until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr: SocketAddr = format!("{}:{}", self.bind, self.port).parse()?;

        info!("Starting agent on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

async fn health() -> &'static str {
    HEALTH_BODY
}

async fn start(
    State(state): State<Arc<AgentState>>,
    query: Result<Query<StartQuery>, QueryRejection>,
) -> Result<(StatusCode, String), AppError> {
    let Query(query) = query.map_err(|e| AppError(StatusCode::BAD_REQUEST, e.body_text()))?;

    let raw = query.uuid.as_deref().map(str::trim).unwrap_or_default();
    if raw.is_empty() {
        debug!("Rejected start request without uuid");
        return Err(AppError(
            StatusCode::BAD_REQUEST,
            "Expected uuid parameter to be set, got nothing".to_string(),
        ));
    }
    let session = SessionId::parse(raw)?;

    let lease = state.slot.begin(&session).inspect_err(|e| {
        warn!("Refusing to start {}: {}", session, e);
    })?;

    let file_type = match state.staged.read().await.as_ref() {
        Some(staged) => staged.file_type,
        None => {
            warn!("Starting {} without a transferred sample", session);
            FileType::Unknown
        }
    };

    let request = SessionRequest {
        session: session.clone(),
        file_type,
        executor: query.executor.filter(|e| !e.trim().is_empty()),
    };

    let task_state = Arc::clone(&state);
    tokio::spawn(async move {
        let report = task_state.orchestrator.run(request).await;
        *task_state.last_report.write().await = Some(report);
        lease.finish();
    });

    Ok((StatusCode::OK, session.to_string()))
}

async fn transfer(
    State(state): State<Arc<AgentState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<StatusCode, AppError> {
    let mut multipart = multipart.map_err(|e| internal(e.body_text()))?;

    let (original_name, bytes) = loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|e| internal(e.body_text()))?;
        match field {
            Some(field) if field.name() == Some(FILE_FIELD) => {
                let name = field.file_name().unwrap_or("sample").to_string();
                let bytes = field.bytes().await.map_err(|e| internal(e.body_text()))?;
                break (name, bytes);
            }
            Some(_) => continue,
            None => return Err(internal(format!("missing '{}' field", FILE_FIELD))),
        }
    };

    if state.slot.is_busy() {
        return Err(AppError(
            StatusCode::CONFLICT,
            "an analysis is running; sample not replaced".to_string(),
        ));
    }

    let file_type = FileType::detect(&bytes);
    let path = state.config.sample_path();
    stage_sample(&path, &bytes)
        .await
        .map_err(|e| internal(format!("could not write {}: {}", path.display(), e)))?;

    info!(
        "Staged sample '{}' ({} bytes, {}) at {}",
        original_name,
        bytes.len(),
        file_type,
        path.display()
    );
    *state.staged.write().await = Some(StagedSample {
        original_name,
        file_type,
        size: bytes.len(),
        received_at: Utc::now(),
    });

    Ok(StatusCode::OK)
}

async fn status(State(state): State<Arc<AgentState>>) -> Json<AgentStatus> {
    Json(AgentStatus {
        slot: state.slot.snapshot(),
        staged: state.staged.read().await.clone(),
        last_session: state.last_report().await,
    })
}

async fn post_only(method: Method) -> AppError {
    AppError(
        StatusCode::BAD_REQUEST,
        format!("'{}' http method is not supported. Please use POST.", method),
    )
}

fn internal(detail: impl Into<String>) -> AppError {
    let detail = detail.into();
    warn!("Sample transfer failed: {}", detail);
    AppError(StatusCode::INTERNAL_SERVER_ERROR, detail)
}

/// Write the sample and make it executable.
async fn stage_sample(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    }

    Ok(())
}
