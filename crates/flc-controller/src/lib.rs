// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Fleetcheck controller: HTTP surface, artifact store, result relay.
//!
//! The controller is stateless between requests; the fleet configuration is
//! re-read on every request, so edits take effect without a restart.

pub mod relay;

pub use relay::{InfluxSink, ResultSink, line_protocol};

use axum::{
    Json, Router,
    extract::{Path as AxPath, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use flc_config::FleetConfig;
use flc_core::ResultRecord;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::{error, info, warn};

/// Shared request-handler state.
pub struct AppState {
    /// Path of the fleet configuration file, read per request.
    pub config_path: PathBuf,
    /// Directory the check artifacts and `.sig` companions are served from.
    pub checks_dir: PathBuf,
    /// Destination for relayed result batches.
    pub sink: Arc<dyn ResultSink>,
}

/// Error reply carrying the HTTP status and the `{status:"error"}` body.
#[derive(Debug)]
pub struct ApiError {
    /// HTTP status to reply with.
    pub status: StatusCode,
    /// Human-readable message for the body.
    pub message: String,
}

impl ApiError {
    /// Build an error reply.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "status": "error", "message": self.message }));
        (self.status, body).into_response()
    }
}

/// Build the Axum router with all controller routes.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/config", get(cmd_config))
        .route("/callhome", post(cmd_callhome))
        .route("/checks/{filename}", get(cmd_check_artifact))
        .with_state(state)
}

fn require_uuid(params: &HashMap<String, String>) -> Result<&str, ApiError> {
    match params.get("uuid").map(String::as_str) {
        Some(uuid) if !uuid.is_empty() => Ok(uuid),
        _ => Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "missing uuid parameter",
        )),
    }
}

fn load_config(state: &AppState) -> Result<FleetConfig, ApiError> {
    FleetConfig::load(&state.config_path).map_err(|err| {
        error!(target: "flc.controller", error = %err, "configuration unreadable");
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "configuration unreadable",
        )
    })
}

async fn cmd_config(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let uuid = require_uuid(&params)?;
    let config = load_config(&state)?;

    let tests = config.tests_for(uuid, &state.checks_dir);
    if tests.is_empty() {
        // Known endpoint, empty assignment: an error body on a 200.
        return Ok(Json(json!({
            "status": "error",
            "message": format!("no tests assigned to {uuid}"),
        }))
        .into_response());
    }

    info!(target: "flc.controller", uuid = %uuid, tests = tests.len(), "config served");
    Ok(Json(json!({ "status": "ok", "data": tests })).into_response())
}

async fn cmd_callhome(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
    Json(mut records): Json<Vec<ResultRecord>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let uuid = require_uuid(&params)?;
    let config = load_config(&state)?;

    if config.groups_for(uuid).is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("uuid {uuid} is not a member of any group"),
        ));
    }

    let alias = config.alias_for(uuid);
    for record in &mut records {
        record.tags.insert("uuid".to_string(), uuid.to_string());
        record.tags.insert("alias".to_string(), alias.clone());
    }

    if state.sink.write_points(&records).await {
        info!(target: "flc.controller", uuid = %uuid, points = records.len(), "results relayed");
        Ok(Json(json!({ "status": "ok" })))
    } else {
        warn!(target: "flc.controller", uuid = %uuid, "backend write failed");
        Err(ApiError::new(StatusCode::BAD_REQUEST, "backend write failed"))
    }
}

async fn cmd_check_artifact(
    AxPath(filename): AxPath<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    // Artifact names carry no path components.
    if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "invalid check name"));
    }

    let bytes = fs::read(state.checks_dir.join(&filename))
        .await
        .map_err(|_| ApiError::new(StatusCode::NOT_FOUND, "no such check"))?;

    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    )
        .into_response())
}
