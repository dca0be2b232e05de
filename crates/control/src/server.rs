//! Listener setup, the replacement handshake and the serve loop.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use rotor_core::{Error, Result, ResultExt};
use rotor_lease::Lease;

use crate::client::ControlClient;
use crate::daemon::DaemonContext;

/// Bind retry budget after asking the squatter to terminate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for BindPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_millis(500),
        }
    }
}

/// Bind `addr`; if it is taken, assume a predecessor daemon is listening,
/// send it one `POST /terminate`, and retry within the policy's budget.
///
/// # Errors
///
/// Returns `PortInUse` once the budget is spent, or the bind error if it is
/// anything other than "address in use".
pub async fn bind_with_replacement(addr: SocketAddr, policy: BindPolicy) -> Result<TcpListener> {
    let mut asked = false;
    for attempt in 1..=policy.attempts {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                if attempt > 1 {
                    info!(%addr, attempt, "bound after replacing previous daemon");
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                if !asked {
                    asked = true;
                    warn!(%addr, "address in use, asking the current listener to terminate");
                    ControlClient::new(format!("http://{addr}"))
                        .with_timeout(policy.delay.max(Duration::from_secs(1)))
                        .terminate()
                        .await
                        .map(drop)
                        .log_best_effort("terminate previous daemon");
                }
                tokio::time::sleep(policy.delay).await;
            }
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Err(Error::PortInUse {
        addr: addr.to_string(),
        attempts: policy.attempts,
    })
}

/// Parse the configured host and port.
///
/// # Errors
///
/// Returns `InvalidConfig` for a host that is not an IP address.
pub fn socket_addr(host: &str, port: u16) -> Result<SocketAddr> {
    format!("{host}:{port}")
        .parse()
        .map_err(|e| Error::invalid_config("host", format!("{host:?}: {e}")))
}

/// Take the daemon lease, asking a live predecessor at `url` to terminate
/// first.
///
/// # Errors
///
/// Returns `Timeout` if the predecessor never lets go, or `LockContention`
/// if another daemon wins the claim.
pub async fn claim_lease(ctx: &DaemonContext, url: &str) -> Result<Lease> {
    let name = ctx.role.lease();
    let wait = ctx.config.timeouts.lease_wait;
    if let Some(owner) = ctx.leases.live_owner(name).await? {
        if owner != ctx.pid {
            warn!(role = %ctx.role, owner, "replacing running daemon");
            ControlClient::new(url).terminate().await?;
            ctx.leases.wait_released(name, wait).await?;
        }
    }
    let lease = ctx.leases.acquire_within(name, ctx.pid, wait).await?;
    info!(role = %ctx.role, pid = ctx.pid, "daemon lease acquired");
    Ok(lease)
}

/// Serve `router` until the daemon is told to exit or interrupted.
///
/// # Errors
///
/// Returns an I/O error if the server loop fails.
pub async fn serve(listener: TcpListener, router: Router, ctx: Arc<DaemonContext>) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(role = %ctx.role, pid = ctx.pid, %addr, "control plane listening");

    let app = router.layer(TraceLayer::new_for_http());
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                () = ctx.shutdown_signal() => {}
                _ = tokio::signal::ctrl_c() => {
                    info!(role = %ctx.role, pid = ctx.pid, "interrupted");
                    ctx.exit();
                }
            }
        })
        .await?;
    Ok(())
}
