//! HTTP client for the daemons' control planes.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use rotor_core::{Error, Result};
use rotor_pipeline::{RunId, RunRequest, Swapper};

use crate::protocol::{ControlResponse, RestartRequest, StatusReport};

/// Bound on quick requests (status, stop, terminate).
const SHORT_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on a restart, which may walk the whole termination ladder.
const RESTART_TIMEOUT: Duration = Duration::from_secs(120);

/// Pause between status retries.
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Talks to one daemon at `base_url`.
#[derive(Debug, Clone)]
pub struct ControlClient {
    base_url: String,
    http: reqwest::Client,
    retries: u32,
    short_timeout: Duration,
}

impl ControlClient {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            retries: 5,
            short_timeout: SHORT_TIMEOUT,
        }
    }

    #[must_use]
    pub const fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.short_timeout = timeout;
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// `GET /status`, retried while the daemon is unreachable.
    ///
    /// # Errors
    ///
    /// Returns `ControlPlaneUnreachable` once the retries are spent.
    pub async fn status(&self) -> Result<StatusReport> {
        let mut attempt = 0;
        loop {
            match self.status_once().await {
                Err(Error::ControlPlaneUnreachable { .. }) if attempt < self.retries => {
                    attempt += 1;
                    debug!(url = %self.base_url, attempt, "status unreachable, retrying");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                other => return other,
            }
        }
    }

    /// `GET /status` without retries; the cheap "is it up" probe.
    ///
    /// # Errors
    ///
    /// Returns `ControlPlaneUnreachable` or `ControlPlaneRejected`.
    pub async fn status_once(&self) -> Result<StatusReport> {
        let url = self.url("/status");
        let request = self.http.get(&url);
        match self.send(&url, request, self.short_timeout).await? {
            ControlResponse::Status(report) => Ok(report),
            other => Err(unexpected(&url, &other)),
        }
    }

    /// `POST /restart`: swap in `upcoming` when given, then restart.
    ///
    /// # Errors
    ///
    /// Returns the daemon's error payload as `ControlPlaneRejected`.
    pub async fn restart(&self, upcoming: Option<&Path>) -> Result<ControlResponse> {
        let body = RestartRequest {
            upcoming_path: upcoming.map(Path::to_path_buf),
        };
        self.post("/restart", &body, RESTART_TIMEOUT).await
    }

    /// `POST /start`
    ///
    /// # Errors
    ///
    /// Returns `ControlPlaneUnreachable` or `ControlPlaneRejected`.
    pub async fn start(&self) -> Result<ControlResponse> {
        self.post("/start", &serde_json::json!({}), RESTART_TIMEOUT).await
    }

    /// `POST /stop`
    ///
    /// # Errors
    ///
    /// Returns `ControlPlaneUnreachable` or `ControlPlaneRejected`.
    pub async fn stop(&self) -> Result<ControlResponse> {
        self.post("/stop", &serde_json::json!({}), RESTART_TIMEOUT).await
    }

    /// `POST /shutdown`
    ///
    /// # Errors
    ///
    /// Returns `ControlPlaneUnreachable` or `ControlPlaneRejected`.
    pub async fn shutdown(&self) -> Result<ControlResponse> {
        self.post("/shutdown", &serde_json::json!({}), RESTART_TIMEOUT).await
    }

    /// `POST /terminate`. A daemon that is not there is already terminated.
    ///
    /// # Errors
    ///
    /// Returns `ControlPlaneRejected` or `Timeout`.
    pub async fn terminate(&self) -> Result<ControlResponse> {
        match self.post("/terminate", &serde_json::json!({}), self.short_timeout).await {
            Err(Error::ControlPlaneUnreachable { .. }) => {
                info!(url = %self.base_url, "daemon already offline");
                Ok(ControlResponse::ack("not running"))
            }
            other => other,
        }
    }

    /// `POST /deploy`
    ///
    /// # Errors
    ///
    /// Returns `ControlPlaneUnreachable` or `ControlPlaneRejected`.
    pub async fn deploy(&self, request: &RunRequest) -> Result<RunId> {
        let url = self.url("/deploy");
        match self.post("/deploy", request, self.short_timeout).await? {
            ControlResponse::Ack {
                run_id: Some(run_id), ..
            } => Ok(run_id),
            other => Err(unexpected(&url, &other)),
        }
    }

    async fn post<B: Serialize + Sync>(&self, path: &str, body: &B, timeout: Duration) -> Result<ControlResponse> {
        let url = self.url(path);
        let request = self.http.post(&url).json(body);
        self.send(&url, request, timeout).await
    }

    async fn send(
        &self,
        url: &str,
        request: reqwest::RequestBuilder,
        timeout: Duration,
    ) -> Result<ControlResponse> {
        let response = request
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| transport_error(url, &e, timeout))?;
        let status = response.status();
        let body = response
            .json::<ControlResponse>()
            .await
            .map_err(|e| Error::ControlPlaneRejected {
                url: url.to_string(),
                status: status.as_u16(),
                reason: format!("unreadable response: {e}"),
            })?;

        match body {
            ControlResponse::Error { kind, message } => Err(Error::ControlPlaneRejected {
                url: url.to_string(),
                status: status.as_u16(),
                reason: format!("{kind}: {message}"),
            }),
            body if status.is_success() => Ok(body),
            body => Err(unexpected(url, &body)),
        }
    }
}

fn transport_error(url: &str, error: &reqwest::Error, timeout: Duration) -> Error {
    if error.is_connect() {
        Error::unreachable(url, error.to_string())
    } else if error.is_timeout() {
        Error::timeout(format!("request to {url}"), timeout.as_secs())
    } else {
        Error::unreachable(url, error.to_string())
    }
}

fn unexpected(url: &str, body: &ControlResponse) -> Error {
    Error::ControlPlaneRejected {
        url: url.to_string(),
        status: 200,
        reason: format!("unexpected response: {body:?}"),
    }
}

/// Swap carried out by the Manager over its control plane.
#[derive(Debug, Clone)]
pub struct ManagerSwapper {
    client: ControlClient,
}

impl ManagerSwapper {
    #[must_use]
    pub const fn new(client: ControlClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Swapper for ManagerSwapper {
    async fn swap(&self, upcoming: &Path) -> Result<()> {
        self.client.restart(Some(upcoming)).await.map(drop)
    }
}
