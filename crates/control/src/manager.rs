//! Manager daemon: owns the application instance.
//!
//! ## Endpoints
//!
//! - `GET /status` - slot, supervised child and a short log tail
//! - `POST /restart` - optional `{upcomingPath}` swap, then restart
//! - `POST /start` - start `current` if nothing is supervised
//! - `POST /stop` - stop the application
//! - `POST /shutdown` - stop the application and exit
//! - `POST /terminate` - exit; the application is stopped on the way out
//!
//! Whatever ends the serve loop (`/terminate`, a replacement or an
//! interrupt), the application this Manager started goes through the
//! termination ladder before the process exits.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    body::Bytes,
    extract::State,
    response::Json,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tracing::{info, warn};

use rotor_core::{DeployConfig, Result as CoreResult, ResultExt, Slot};
use rotor_pipeline::{LocalSwapper, Swapper};
use rotor_supervisor::{Supervisor, SupervisorSettings};

use crate::daemon::DaemonContext;
use crate::error::{AppError, Result};
use crate::protocol::{ControlResponse, RestartRequest, Role, StatusReport};
use crate::server::{BindPolicy, bind_with_replacement, claim_lease, serve, socket_addr};

/// Handler state; clones share the daemon.
#[derive(Debug, Clone)]
pub struct ManagerState {
    pub ctx: Arc<DaemonContext>,
    pub supervisor: Supervisor,
    swapper: LocalSwapper,
}

impl ManagerState {
    #[must_use]
    pub fn new(ctx: Arc<DaemonContext>, supervisor: Supervisor) -> Self {
        let swapper = LocalSwapper::new(ctx.layout.clone(), Some(supervisor.clone()));
        Self {
            ctx,
            supervisor,
            swapper,
        }
    }
}

/// Create the Manager router.
pub fn router(state: ManagerState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/restart", post(restart))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/shutdown", post(shutdown))
        .route("/terminate", post(terminate))
        .with_state(state)
}

/// GET /status
async fn status(State(state): State<ManagerState>) -> Json<ControlResponse> {
    let ctx = &state.ctx;
    Json(ControlResponse::Status(StatusReport {
        role: Role::Manager,
        pid: ctx.pid,
        alive: true,
        terminating: ctx.is_terminating(),
        current_slot: ctx.layout.slot(Slot::Current).to_path_buf(),
        supervised: Some(state.supervisor.snapshot().await),
        active_run: None,
        last_run: None,
        log_tail: ctx.log_tail(),
    }))
}

/// POST /restart
async fn restart(State(state): State<ManagerState>, body: Bytes) -> Result<Json<ControlResponse>> {
    let request: RestartRequest = if body.is_empty() {
        RestartRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| AppError::BadRequest(e.to_string()))?
    };
    let ctx = &state.ctx;
    ctx.ensure_owner()?;
    if ctx.is_terminating() {
        return Err(AppError::ServiceUnavailable("manager is shutting down".to_string()));
    }

    let pid = match request.upcoming_path {
        Some(upcoming) => {
            info!(upcoming = %upcoming.display(), "swap requested");
            state.swapper.swap(&upcoming).await?;
            state.supervisor.snapshot().await.pid
        }
        None => Some(state.supervisor.replace(ctx.layout.slot(Slot::Current)).await?),
    };
    let ack = ControlResponse::ack("restarted");
    Ok(Json(match pid {
        Some(pid) => ack.with_pid(pid),
        None => ack,
    }))
}

/// POST /start
async fn start(State(state): State<ManagerState>) -> Result<Json<ControlResponse>> {
    state.ctx.ensure_owner()?;
    let snapshot = state.supervisor.snapshot().await;
    if let (true, Some(pid)) = (snapshot.state.has_process(), snapshot.pid) {
        return Ok(Json(ControlResponse::ack("already running").with_pid(pid)));
    }
    let pid = state
        .supervisor
        .spawn(state.ctx.layout.slot(Slot::Current))
        .await?;
    Ok(Json(ControlResponse::ack("started").with_pid(pid)))
}

/// POST /stop
async fn stop(State(state): State<ManagerState>) -> Result<Json<ControlResponse>> {
    state.ctx.ensure_owner()?;
    let Some(_guard) = state.ctx.begin_stop() else {
        return Ok(Json(ControlResponse::ack("stop already in progress")));
    };
    state.supervisor.stop(true).await?;
    Ok(Json(ControlResponse::ack("stopped")))
}

/// POST /shutdown
async fn shutdown(State(state): State<ManagerState>) -> Json<ControlResponse> {
    let ctx = &state.ctx;
    if !ctx.begin_terminate() {
        return Json(ControlResponse::ack("shutdown already in progress").with_pid(ctx.pid));
    }
    state
        .supervisor
        .stop(false)
        .await
        .log_best_effort("stop application on shutdown");
    ctx.exit();
    Json(ControlResponse::ack("shutting down").with_pid(ctx.pid))
}

/// POST /terminate
async fn terminate(State(state): State<ManagerState>) -> Json<ControlResponse> {
    let ctx = &state.ctx;
    if ctx.begin_terminate() {
        warn!(pid = ctx.pid, "terminate requested");
        ctx.exit();
    }
    Json(ControlResponse::ack("terminating").with_pid(ctx.pid))
}

/// Run the Manager in the foreground until it is shut down or replaced.
///
/// # Errors
///
/// Returns lease, bind or serve errors.
pub async fn run_manager(config: DeployConfig) -> CoreResult<()> {
    let addr = socket_addr(&config.host, config.manager_port)?;
    let ctx = Arc::new(DaemonContext::new(Role::Manager, config.clone()));
    claim_lease(&ctx, &config.manager_url()).await?;

    let outcome = serve_manager(Arc::clone(&ctx), addr).await;
    ctx.release_lease();
    outcome
}

async fn serve_manager(ctx: Arc<DaemonContext>, addr: SocketAddr) -> CoreResult<()> {
    let listener = bind_with_replacement(addr, BindPolicy::default()).await?;
    let supervisor = Supervisor::new(SupervisorSettings::from_config(&ctx.config, &ctx.layout));
    let restarter = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.run_restart_loop().await })
    };

    let current = ctx.layout.slot(Slot::Current);
    if current.is_dir() {
        supervisor
            .spawn(current)
            .await
            .map(drop)
            .log_best_effort("start current instance");
    } else {
        info!(current = %current.display(), "nothing deployed yet");
    }

    let served = serve_state(listener, ManagerState::new(ctx, supervisor)).await;
    restarter.abort();
    served
}

/// Serve the Manager router until the daemon exits, then stop the
/// application it started.
///
/// # Errors
///
/// Returns serve errors; a failed stop is only logged.
pub async fn serve_state(listener: TcpListener, state: ManagerState) -> CoreResult<()> {
    let ctx = Arc::clone(&state.ctx);
    let supervisor = state.supervisor.clone();
    let served = serve(listener, router(state), ctx).await;
    supervisor
        .release()
        .await
        .log_best_effort("stop application on exit");
    served
}
