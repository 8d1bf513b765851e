//! Handlers for `/projects/{id}/monitoring`.
//!
//! Request bodies are parsed from raw bytes so malformed JSON maps to the
//! same `{success: false, error}` 400 response as every other bad request.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::error::ApiError;
use crate::config::MonitoringConfigPatch;
use crate::models::control::SessionControlRequest;
use crate::models::session::ControlAction;
use crate::monitor::MonitoringContext;
use crate::AppError;

type HandlerResult = std::result::Result<Response, ApiError>;

/// `POST /projects/{id}/monitoring` body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MonitoringCommand {
    action: String,
    #[serde(default)]
    config: Option<MonitoringConfigPatch>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    control_action: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    force: Option<bool>,
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> crate::Result<T> {
    serde_json::from_slice(body)
        .map_err(|err| AppError::InvalidRequest(format!("malformed request body: {err}")))
}

fn require(field: Option<String>, name: &str) -> crate::Result<String> {
    field
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AppError::InvalidRequest(format!("missing required field '{name}'")))
}

/// `GET /projects/{id}/monitoring[?action=status|session-update&sessionId=]`
pub(super) async fn get_monitoring(
    State(ctx): State<Arc<MonitoringContext>>,
    Path(project_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> HandlerResult {
    match params.get("action").map(String::as_str) {
        None => {
            let data = ctx.snapshot(&project_id).ok_or_else(|| {
                AppError::NotFound(format!("no monitoring data for project {project_id}"))
            })?;
            Ok(Json(data.as_ref()).into_response())
        }
        Some("status") => Ok(Json(json!({
            "isMonitoring": ctx.is_monitoring(&project_id),
            "projectId": project_id,
            "activeProjects": ctx.active_projects(),
        }))
        .into_response()),
        Some("session-update") => {
            let session_id = require(params.get("sessionId").cloned(), "sessionId")?;
            let update = ctx.session_update(&project_id, &session_id).ok_or_else(|| {
                AppError::NotFound(format!(
                    "session {session_id} not found in project {project_id}"
                ))
            })?;
            Ok(Json(update).into_response())
        }
        Some(other) => Err(AppError::InvalidRequest(format!("unknown action '{other}'")).into()),
    }
}

/// `POST /projects/{id}/monitoring`
pub(super) async fn post_monitoring(
    State(ctx): State<Arc<MonitoringContext>>,
    Path(project_id): Path<String>,
    body: Bytes,
) -> HandlerResult {
    let command: MonitoringCommand = parse_body(&body)?;
    debug!(project_id, action = %command.action, "monitoring command received");

    match command.action.as_str() {
        "start-monitoring" => {
            if let Some(ref patch) = command.config {
                patch.validate()?;
            }
            let snapshot = ctx.start_monitoring(&project_id, command.config).await?;
            Ok(Json(json!({
                "success": true,
                "message": format!("monitoring started for project {project_id}"),
                "data": snapshot.as_deref(),
            }))
            .into_response())
        }
        "stop-monitoring" => {
            let stopped = ctx.stop_monitoring(&project_id).await;
            let message = if stopped {
                format!("monitoring stopped for project {project_id}")
            } else {
                format!("project {project_id} was not monitored")
            };
            Ok(Json(json!({ "success": true, "message": message })).into_response())
        }
        "update-config" => {
            let patch = command.config.ok_or_else(|| {
                AppError::InvalidRequest("missing required field 'config'".into())
            })?;
            apply_config(&ctx, &project_id, &patch)
        }
        "session-control" => {
            let session_id = require(command.session_id, "sessionId")?;
            let action = ControlAction::parse(&require(command.control_action, "controlAction")?)?;
            let request = SessionControlRequest {
                project_id: project_id.clone(),
                session_id,
                action,
                reason: command.reason,
                force: command.force,
            };
            let result = ctx.control(&request).await?;
            let status = if result.success {
                StatusCode::OK
            } else {
                StatusCode::BAD_REQUEST
            };
            Ok((status, Json(result)).into_response())
        }
        other => Err(AppError::InvalidRequest(format!("unknown action '{other}'")).into()),
    }
}

/// `PUT /projects/{id}/monitoring` with a `MonitoringConfigPatch` body.
pub(super) async fn put_monitoring(
    State(ctx): State<Arc<MonitoringContext>>,
    Path(project_id): Path<String>,
    body: Bytes,
) -> HandlerResult {
    let patch: MonitoringConfigPatch = parse_body(&body)?;
    apply_config(&ctx, &project_id, &patch)
}

/// `DELETE /projects/{id}/monitoring`
pub(super) async fn delete_monitoring(
    State(ctx): State<Arc<MonitoringContext>>,
    Path(project_id): Path<String>,
) -> Response {
    let stopped = ctx.stop_monitoring(&project_id).await;
    Json(json!({
        "success": true,
        "message": if stopped { "monitoring stopped" } else { "project was not monitored" },
    }))
    .into_response()
}

fn apply_config(
    ctx: &MonitoringContext,
    project_id: &str,
    patch: &MonitoringConfigPatch,
) -> HandlerResult {
    patch.validate()?;
    let config = ctx.update_config(project_id, patch)?;
    Ok(Json(json!({ "success": true, "config": config })).into_response())
}
