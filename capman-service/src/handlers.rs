//! # HTTP Request Handlers
//!
//! Thin axum handlers over the orchestrator, registry, and context
//! manager. Failure bodies follow one rule everywhere: `executeAction`
//! answers with a single-element `PluginOutput` failure list carrying the
//! structured error, and every other endpoint answers with the structured
//! error under an `error` key. Statuses come from the error's own
//! mapping, never from ad-hoc handler decisions.

use crate::context::ContextConstraints;
use crate::orchestrator::Orchestrator;
use crate::server::AppState;
use crate::service_error::ServiceError;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use capman_plugin_sdk::manifest::{PluginManifest, RepositoryType};
use capman_plugin_sdk::models::Step;
use serde::Deserialize;
use serde_json::{json, Value};

/// Run one step. 200 with outputs on success; on failure, the status the
/// structured error carries and the one-element failure list as the body.
pub async fn execute_action(State(state): State<AppState>, Json(step): Json<Step>) -> Response {
    if step.action_verb.trim().is_empty() {
        return ServiceError::InvalidRequest {
            message: "actionVerb is required".to_string(),
        }
        .into_response();
    }

    match state.orchestrator.execute_action(step).await {
        Ok(outputs) => (StatusCode::OK, Json(outputs)).into_response(),
        Err(error) => {
            let status = StatusCode::from_u16(error.status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(Orchestrator::failure_body(error))).into_response()
        }
    }
}

/// Register or update a handler manifest.
pub async fn store_plugin(
    State(state): State<AppState>,
    Json(manifest): Json<PluginManifest>,
) -> Result<Response, ServiceError> {
    let outcome = state.registry.store(manifest).await?;
    let status = if outcome.is_update {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(outcome)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct RepositoryFilter {
    pub repository: Option<RepositoryType>,
}

pub async fn list_plugins(
    State(state): State<AppState>,
    Query(filter): Query<RepositoryFilter>,
) -> Json<Value> {
    let locators = state.registry.list(filter.repository).await;
    Json(json!({ "plugins": locators }))
}

#[derive(Debug, Deserialize)]
pub struct GetPluginQuery {
    pub version: Option<semver::Version>,
    pub repository: Option<RepositoryType>,
}

pub async fn get_plugin(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<GetPluginQuery>,
) -> Result<Json<PluginManifest>, ServiceError> {
    let manifest = state
        .registry
        .fetch_one(&id, query.version.as_ref(), query.repository)
        .await
        .ok_or_else(|| ServiceError::NotFound {
            message: match &query.version {
                Some(version) => format!("plugin {id} has no version {version}"),
                None => format!("no plugin with id {id}"),
            },
        })?;
    Ok(Json(manifest.as_ref().clone()))
}

pub async fn delete_plugin(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<GetPluginQuery>,
) -> Result<Json<Value>, ServiceError> {
    state
        .registry
        .delete(&id, query.version.as_ref(), query.repository)
        .await?;
    Ok(Json(json!({ "deleted": true, "pluginId": id })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextRequest {
    pub goal: String,
    #[serde(default)]
    pub constraints: ContextConstraints,
}

pub async fn generate_plugin_context(
    State(state): State<AppState>,
    Json(request): Json<ContextRequest>,
) -> Result<Json<Value>, ServiceError> {
    if request.goal.trim().is_empty() {
        return Err(ServiceError::InvalidRequest {
            message: "goal is required".to_string(),
        });
    }
    let context = state
        .context_manager
        .generate_context(&request.goal, &request.constraints)
        .await;
    Ok(Json(serde_json::to_value(context)?))
}

/// Per-plugin usage statistics for operators.
pub async fn statistics(State(state): State<AppState>) -> Json<Value> {
    let statistics: Vec<Value> = state
        .context_manager
        .statistics()
        .into_iter()
        .map(|(plugin_id, stats)| {
            json!({
                "pluginId": plugin_id,
                "totalUses": stats.total_uses,
                "successRate": stats.success_rate,
                "avgExecutionTimeMs": stats.avg_execution_time_ms,
                "lastUsed": stats.last_used,
            })
        })
        .collect();
    Json(json!({ "plugins": statistics }))
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "initialization": state.is_ready(),
    }))
}

pub async fn ready(State(state): State<AppState>) -> Response {
    if state.is_ready() {
        (StatusCode::OK, Json(json!({ "ready": true }))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ready": false })),
        )
            .into_response()
    }
}
