//! Processor daemon: accepts deploy triggers and runs pipelines.
//!
//! ## Endpoints
//!
//! - `GET /status` - active run, last report and a short log tail
//! - `POST /deploy` - start a run; replies with its id right away
//! - `POST /webhook` - same as `/deploy`, for repository hooks
//! - `GET /runs/current` - id and state of the active run
//! - `POST /stop` - abort the active run
//! - `POST /shutdown` - abort the active run, let it unwind, then exit
//! - `POST /terminate` - abort and exit without waiting

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Bytes,
    extract::State,
    response::Json,
    routing::{get, post},
};
use tokio::sync::Mutex;
use tracing::{info, warn};

use rotor_core::{DeployConfig, Result as CoreResult, ResultExt, Slot};
use rotor_events::LogWriter;
use rotor_pipeline::{GitCli, Pipeline, RunId, RunReport, RunRequest, resolve_repository};

use crate::client::{ControlClient, ManagerSwapper};
use crate::daemon::DaemonContext;
use crate::error::{AppError, Result};
use crate::protocol::{ControlResponse, Role, StatusReport};
use crate::server::{BindPolicy, bind_with_replacement, claim_lease, serve, socket_addr};

/// Bound on a single git invocation.
const GIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Handler state; clones share the daemon and its pipeline.
#[derive(Debug, Clone)]
pub struct ProcessorState {
    pub ctx: Arc<DaemonContext>,
    pub pipeline: Pipeline,
    last: Arc<Mutex<Option<RunReport>>>,
}

impl ProcessorState {
    #[must_use]
    pub fn new(ctx: Arc<DaemonContext>, pipeline: Pipeline) -> Self {
        Self {
            ctx,
            pipeline,
            last: Arc::new(Mutex::new(None)),
        }
    }

    /// Report of the most recently finished run.
    pub async fn last_run(&self) -> Option<RunReport> {
        self.last.lock().await.clone()
    }
}

/// Create the Processor router.
pub fn router(state: ProcessorState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/deploy", post(deploy))
        .route("/webhook", post(deploy))
        .route("/runs/current", get(current_run))
        .route("/stop", post(stop))
        .route("/shutdown", post(shutdown))
        .route("/terminate", post(terminate))
        .with_state(state)
}

/// GET /status
async fn status(State(state): State<ProcessorState>) -> Json<ControlResponse> {
    let ctx = &state.ctx;
    Json(ControlResponse::Status(StatusReport {
        role: Role::Processor,
        pid: ctx.pid,
        alive: true,
        terminating: ctx.is_terminating(),
        current_slot: ctx.layout.slot(Slot::Current).to_path_buf(),
        supervised: None,
        active_run: state.pipeline.current_run(),
        last_run: state.last_run().await,
        log_tail: ctx.log_tail(),
    }))
}

/// POST /deploy, POST /webhook
async fn deploy(State(state): State<ProcessorState>, body: Bytes) -> Result<Json<ControlResponse>> {
    let mut request: RunRequest =
        serde_json::from_slice(&body).map_err(|e| AppError::BadRequest(e.to_string()))?;
    if request.repository_path.as_os_str().is_empty() {
        return Err(AppError::BadRequest("repositoryPath is required".to_string()));
    }
    let ctx = &state.ctx;
    ctx.ensure_owner()?;
    if ctx.is_terminating() {
        return Err(AppError::ServiceUnavailable("processor is shutting down".to_string()));
    }

    let id = request.id.unwrap_or_default();
    request.id = Some(id);
    request.repository_path = resolve_repository(ctx.layout.root(), &request.repository_path);
    info!(
        run_id = %id,
        repository = %request.repository_path.display(),
        reference = request.reference(),
        "deploy accepted"
    );

    let pipeline = state.pipeline.clone();
    let last = Arc::clone(&state.last);
    tokio::spawn(async move {
        let report = pipeline.run(request).await;
        *last.lock().await = Some(report);
    });

    Ok(Json(ControlResponse::ack("deploy accepted").with_run_id(id)))
}

/// GET /runs/current
async fn current_run(State(state): State<ProcessorState>) -> Json<ControlResponse> {
    Json(match state.pipeline.current_run() {
        Some(run) => ControlResponse::ack(run.state.as_str()).with_run_id(run.id),
        None => ControlResponse::ack("idle"),
    })
}

/// POST /stop
async fn stop(State(state): State<ProcessorState>) -> Result<Json<ControlResponse>> {
    state.ctx.ensure_owner()?;
    Ok(Json(stopped(state.pipeline.stop())))
}

/// POST /shutdown
async fn shutdown(State(state): State<ProcessorState>) -> Json<ControlResponse> {
    let ctx = &state.ctx;
    if !ctx.begin_terminate() {
        return Json(ControlResponse::ack("shutdown already in progress").with_pid(ctx.pid));
    }
    let aborted = state.pipeline.stop();
    state
        .pipeline
        .preemption()
        .wait_idle(ctx.config.timeouts.preempt_wait)
        .await
        .log_best_effort("wait for active run to unwind");
    ctx.exit();
    Json(stopped(aborted).with_pid(ctx.pid))
}

/// POST /terminate
async fn terminate(State(state): State<ProcessorState>) -> Json<ControlResponse> {
    let ctx = &state.ctx;
    if ctx.begin_terminate() {
        warn!(pid = ctx.pid, "terminate requested");
        state.pipeline.stop();
        ctx.exit();
    }
    Json(ControlResponse::ack("terminating").with_pid(ctx.pid))
}

fn stopped(aborted: Option<RunId>) -> ControlResponse {
    match aborted {
        Some(id) => ControlResponse::ack("run aborted").with_run_id(id),
        None => ControlResponse::ack("no active run"),
    }
}

/// Build the daemon's pipeline: git on the command line, swaps through the
/// Manager.
#[must_use]
pub fn default_pipeline(config: &DeployConfig, log_file: &std::path::Path) -> Pipeline {
    let vcs = GitCli::new(GIT_TIMEOUT).log_to(LogWriter::new(log_file, "git", 0));
    let manager = ControlClient::new(config.manager_url()).with_retries(config.status_retries);
    Pipeline::new(config.clone(), Arc::new(vcs), Arc::new(ManagerSwapper::new(manager)))
}

/// Run the Processor in the foreground until it is shut down or replaced.
///
/// # Errors
///
/// Returns lease, bind or serve errors.
pub async fn run_processor(config: DeployConfig) -> CoreResult<()> {
    let addr = socket_addr(&config.host, config.processor_port)?;
    let ctx = Arc::new(DaemonContext::new(Role::Processor, config.clone()));
    claim_lease(&ctx, &config.processor_url()).await?;

    let outcome = serve_processor(Arc::clone(&ctx), addr).await;
    ctx.release_lease();
    outcome
}

async fn serve_processor(ctx: Arc<DaemonContext>, addr: SocketAddr) -> CoreResult<()> {
    let listener = bind_with_replacement(addr, BindPolicy::default()).await?;
    let pipeline = default_pipeline(&ctx.config, &ctx.layout.log_file());
    let app = router(ProcessorState::new(Arc::clone(&ctx), pipeline));
    serve(listener, app, ctx).await
}
