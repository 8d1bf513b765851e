//! Client access to a monitoring engine.
//!
//! [`MonitorApi`] abstracts the transport: [`LocalApi`] calls an
//! in-process [`MonitoringContext`], [`HttpApi`] talks to a daemon over
//! HTTP. The [`view::SessionView`] view-model works with either.

pub mod view;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::{MonitoringConfig, MonitoringConfigPatch};
use crate::models::control::{SessionControlRequest, SessionControlResult};
use crate::models::monitoring::{MonitoringData, MonitoringUpdate};
use crate::monitor::MonitoringContext;
use crate::{AppError, Result};

/// Boxed future returned by [`MonitorApi`] methods.
pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Transport-neutral access to snapshots and session control.
pub trait MonitorApi: Send + Sync {
    /// Latest snapshot for a project; `None` if it has none yet or is not monitored.
    fn snapshot<'a>(&'a self, project_id: &'a str) -> ApiFuture<'a, Option<MonitoringData>>;

    /// Submit a control request.
    ///
    /// Illegal transitions come back as `success = false` results.
    fn control<'a>(&'a self, request: &'a SessionControlRequest) -> ApiFuture<'a, SessionControlResult>;
}

/// In-process access to a [`MonitoringContext`].
#[derive(Clone)]
pub struct LocalApi {
    ctx: Arc<MonitoringContext>,
}

impl LocalApi {
    /// Wrap a shared context.
    #[must_use]
    pub fn new(ctx: Arc<MonitoringContext>) -> Self {
        Self { ctx }
    }
}

impl MonitorApi for LocalApi {
    fn snapshot<'a>(&'a self, project_id: &'a str) -> ApiFuture<'a, Option<MonitoringData>> {
        Box::pin(async move {
            Ok(self
                .ctx
                .snapshot(project_id)
                .map(|data| data.as_ref().clone()))
        })
    }

    fn control<'a>(&'a self, request: &'a SessionControlRequest) -> ApiFuture<'a, SessionControlResult> {
        Box::pin(self.ctx.control(request))
    }
}

/// Error body returned by the daemon.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// `?action=status` response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringStatus {
    /// Whether the project has a live poller.
    pub is_monitoring: bool,
    /// Queried project.
    pub project_id: String,
    /// Every project with a live poller.
    pub active_projects: Vec<String>,
}

/// HTTP client for a running daemon.
#[derive(Debug, Clone)]
pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpApi {
    /// Client for the daemon at `base_url` (e.g. `http://127.0.0.1:3000`).
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        }
    }

    /// `/projects/{id}/monitoring` with `query` appended, every part
    /// percent-encoded.
    fn monitoring_url(&self, project_id: &str, query: &[(&str, &str)]) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|err| AppError::Config(format!("invalid daemon url {}: {err}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|()| AppError::Config(format!("daemon url {} cannot take a path", self.base_url)))?
            .pop_if_empty()
            .extend(["projects", project_id, "monitoring"]);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    /// Monitoring status of a project.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the daemon is unreachable.
    pub async fn status(&self, project_id: &str) -> Result<MonitoringStatus> {
        let url = self.monitoring_url(project_id, &[("action", "status")])?;
        let response = self.client.get(url).send().await.map_err(transport_error)?;
        decode(response).await
    }

    /// Latest update for one session, `None` if unknown.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the daemon is unreachable.
    pub async fn session_update(
        &self,
        project_id: &str,
        session_id: &str,
    ) -> Result<Option<MonitoringUpdate>> {
        let url = self.monitoring_url(
            project_id,
            &[("action", "session-update"), ("sessionId", session_id)],
        )?;
        let response = self.client.get(url).send().await.map_err(transport_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode(response).await.map(Some)
    }

    /// Start monitoring a project, optionally with a config patch.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidConfig`-style errors reported by the
    /// daemon, or `AppError::Io` if it is unreachable.
    pub async fn start(
        &self,
        project_id: &str,
        patch: Option<&MonitoringConfigPatch>,
    ) -> Result<Value> {
        self.post(project_id, json!({ "action": "start-monitoring", "config": patch }))
            .await
    }

    /// Stop monitoring a project.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the daemon is unreachable.
    pub async fn stop(&self, project_id: &str) -> Result<Value> {
        self.post(project_id, json!({ "action": "stop-monitoring" }))
            .await
    }

    /// Merge a config patch into a running monitor.
    ///
    /// # Errors
    ///
    /// Returns the daemon's error for unmonitored projects or invalid values.
    pub async fn update_config(
        &self,
        project_id: &str,
        patch: &MonitoringConfigPatch,
    ) -> Result<MonitoringConfig> {
        #[derive(Deserialize)]
        struct ConfigBody {
            config: MonitoringConfig,
        }
        let response = self
            .client
            .put(self.monitoring_url(project_id, &[])?)
            .json(patch)
            .send()
            .await
            .map_err(transport_error)?;
        let body: ConfigBody = decode(response).await?;
        Ok(body.config)
    }

    async fn post(&self, project_id: &str, body: Value) -> Result<Value> {
        let response = self
            .client
            .post(self.monitoring_url(project_id, &[])?)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        decode(response).await
    }
}

impl MonitorApi for HttpApi {
    fn snapshot<'a>(&'a self, project_id: &'a str) -> ApiFuture<'a, Option<MonitoringData>> {
        Box::pin(async move {
            let response = self
                .client
                .get(self.monitoring_url(project_id, &[])?)
                .send()
                .await
                .map_err(transport_error)?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            decode(response).await.map(Some)
        })
    }

    fn control<'a>(&'a self, request: &'a SessionControlRequest) -> ApiFuture<'a, SessionControlResult> {
        Box::pin(async move {
            let body = json!({
                "action": "session-control",
                "sessionId": request.session_id,
                "controlAction": request.action,
                "reason": request.reason,
                "force": request.force,
            });
            let response = self
                .client
                .post(self.monitoring_url(&request.project_id, &[])?)
                .json(&body)
                .send()
                .await
                .map_err(transport_error)?;

            let status = response.status();
            let raw = response.bytes().await.map_err(transport_error)?;
            // Rejections arrive as 400 with a full result body.
            if status.is_success() || status == StatusCode::BAD_REQUEST {
                if let Ok(result) = serde_json::from_slice::<SessionControlResult>(&raw) {
                    return Ok(result);
                }
            }
            Err(error_from_body(status, &raw))
        })
    }
}

fn transport_error(err: reqwest::Error) -> AppError {
    AppError::Io(format!("daemon request failed: {err}"))
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let raw = response.bytes().await.map_err(transport_error)?;
    if !status.is_success() {
        return Err(error_from_body(status, &raw));
    }
    serde_json::from_slice(&raw)
        .map_err(|err| AppError::Internal(format!("unexpected response body: {err}")))
}

fn error_from_body(status: StatusCode, raw: &[u8]) -> AppError {
    let message = serde_json::from_slice::<ErrorBody>(raw)
        .map_or_else(|_| String::from_utf8_lossy(raw).into_owned(), |body| body.error);
    match status {
        StatusCode::NOT_FOUND => AppError::NotFound(message),
        StatusCode::BAD_REQUEST => AppError::InvalidRequest(message),
        StatusCode::SERVICE_UNAVAILABLE => AppError::DetectionFailure(message),
        _ => AppError::Internal(format!("{status}: {message}")),
    }
}
