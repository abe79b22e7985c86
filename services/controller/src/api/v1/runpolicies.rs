//! RunPolicy endpoints: CRUD plus the start/stop/restart machine actions.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::Value;
use vmctl_model::{InstanceTemplate, ResourceVersion, RunMode, RunPolicy, RunPolicySpec};

use super::{key, ListResponse};
use crate::actions::RestartOptions;
use crate::api::error::HttpError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_policies).post(create_policy))
        .route(
            "/{name}",
            get(get_policy)
                .put(update_policy)
                .patch(patch_policy)
                .delete(delete_policy),
        )
        .route("/{name}/start", put(start))
        .route("/{name}/stop", put(stop))
        .route("/{name}/restart", put(restart))
}

// =============================================================================
// Request Types
// =============================================================================

/// Request to create a RunPolicy.
#[derive(Debug, Deserialize)]
pub struct CreateRunPolicyRequest {
    pub name: String,

    /// Legacy boolean form; mutually exclusive with `run_mode`.
    #[serde(default)]
    pub running: Option<bool>,

    #[serde(default)]
    pub run_mode: Option<RunMode>,

    #[serde(default)]
    pub template: Option<InstanceTemplate>,
}

/// Full spec replacement, guarded by the version the caller read.
#[derive(Debug, Deserialize)]
pub struct UpdateRunPolicyRequest {
    pub resource_version: ResourceVersion,
    pub spec: RunPolicySpec,
}

#[derive(Debug, Default, Deserialize)]
pub struct StopParams {
    pub grace_period_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RestartParams {
    pub grace_period_secs: Option<u64>,
    #[serde(default)]
    pub force: bool,
}

// =============================================================================
// Handlers
// =============================================================================

/// POST /v1/namespaces/{namespace}/runpolicies
async fn create_policy(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    Json(req): Json<CreateRunPolicyRequest>,
) -> Result<impl IntoResponse, HttpError> {
    let mut policy = RunPolicy::new(namespace, req.name, RunMode::Halted);
    policy.spec = RunPolicySpec {
        running: req.running,
        run_mode: req.run_mode,
        template: req.template.unwrap_or_default(),
    };
    let created = state.actions().create_policy(policy).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// GET /v1/namespaces/{namespace}/runpolicies
async fn list_policies(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
) -> impl IntoResponse {
    let items = state.actions().list_policies(&namespace).await;
    Json(ListResponse { items })
}

/// GET /v1/namespaces/{namespace}/runpolicies/{name}
async fn get_policy(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<RunPolicy>, HttpError> {
    Ok(Json(state.actions().get_policy(&key(namespace, name)).await?))
}

/// PUT /v1/namespaces/{namespace}/runpolicies/{name}
async fn update_policy(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(req): Json<UpdateRunPolicyRequest>,
) -> Result<Json<RunPolicy>, HttpError> {
    let actions = state.actions();
    let mut policy = actions.get_policy(&key(namespace, name)).await?;
    policy.meta.resource_version = req.resource_version;
    policy.spec = req.spec;
    Ok(Json(actions.update_policy(policy).await?))
}

/// PATCH /v1/namespaces/{namespace}/runpolicies/{name}
///
/// Body is a JSON merge patch of the spec.
async fn patch_policy(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(patch): Json<Value>,
) -> Result<Json<RunPolicy>, HttpError> {
    if !patch.is_object() {
        return Err(HttpError::bad_request("merge patch must be a JSON object"));
    }
    Ok(Json(
        state
            .actions()
            .patch_policy(&key(namespace, name), &patch)
            .await?,
    ))
}

/// DELETE /v1/namespaces/{namespace}/runpolicies/{name}
async fn delete_policy(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<StatusCode, HttpError> {
    state.actions().delete_policy(&key(namespace, name)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT /v1/namespaces/{namespace}/runpolicies/{name}/start
async fn start(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<impl IntoResponse, HttpError> {
    let policy = state.actions().start(&key(namespace, name)).await?;
    Ok((StatusCode::ACCEPTED, Json(policy)))
}

/// PUT /v1/namespaces/{namespace}/runpolicies/{name}/stop
async fn stop(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Query(params): Query<StopParams>,
) -> Result<impl IntoResponse, HttpError> {
    let policy = state
        .actions()
        .stop(&key(namespace, name), params.grace_period_secs)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(policy)))
}

/// PUT /v1/namespaces/{namespace}/runpolicies/{name}/restart
async fn restart(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Query(params): Query<RestartParams>,
) -> Result<impl IntoResponse, HttpError> {
    let options = RestartOptions {
        grace_period_secs: params.grace_period_secs,
        force: params.force,
    };
    let policy = state
        .actions()
        .restart(&key(namespace, name), options)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(policy)))
}
