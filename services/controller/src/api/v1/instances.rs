//! Instance endpoints: read, delete and the guest-level actions.

use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};
use serde::Deserialize;
use vmctl_model::{Instance, MigrationConfig};

use super::{key, ListResponse};
use crate::api::error::HttpError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_instances))
        .route("/{name}", get(get_instance).delete(delete_instance))
        .route("/{name}/pause", put(pause))
        .route("/{name}/unpause", put(unpause))
        .route("/{name}/freeze", put(freeze))
        .route("/{name}/unfreeze", put(unfreeze))
        .route("/{name}/softreboot", put(soft_reboot))
        .route("/{name}/migrate", put(migrate))
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteParams {
    pub grace_period_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FreezeParams {
    /// Thaw automatically after this many seconds.
    pub unfreeze_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MigrateParams {
    pub progress_timeout_secs: Option<u64>,
    pub completion_timeout_per_gib_secs: Option<u64>,
}

/// GET /v1/namespaces/{namespace}/instances
async fn list_instances(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
) -> impl IntoResponse {
    let items = state.actions().list_instances(&namespace).await;
    Json(ListResponse { items })
}

/// GET /v1/namespaces/{namespace}/instances/{name}
async fn get_instance(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Instance>, HttpError> {
    Ok(Json(state.actions().get_instance(&key(namespace, name)).await?))
}

/// DELETE /v1/namespaces/{namespace}/instances/{name}
async fn delete_instance(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Query(params): Query<DeleteParams>,
) -> Result<StatusCode, HttpError> {
    state
        .actions()
        .delete_instance(&key(namespace, name), params.grace_period_secs)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

async fn pause(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Instance>, HttpError> {
    Ok(Json(state.actions().pause(&key(namespace, name)).await?))
}

async fn unpause(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Instance>, HttpError> {
    Ok(Json(state.actions().unpause(&key(namespace, name)).await?))
}

async fn freeze(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Query(params): Query<FreezeParams>,
) -> Result<Json<Instance>, HttpError> {
    let timeout = params.unfreeze_timeout_secs.map(Duration::from_secs);
    Ok(Json(
        state
            .actions()
            .freeze(&key(namespace, name), timeout)
            .await?,
    ))
}

async fn unfreeze(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Instance>, HttpError> {
    Ok(Json(state.actions().unfreeze(&key(namespace, name)).await?))
}

async fn soft_reboot(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Instance>, HttpError> {
    Ok(Json(state.actions().soft_reboot(&key(namespace, name)).await?))
}

/// PUT /v1/namespaces/{namespace}/instances/{name}/migrate
///
/// Creates a MigrationRequest for the instance.
async fn migrate(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Query(params): Query<MigrateParams>,
) -> Result<impl IntoResponse, HttpError> {
    let config = (params.progress_timeout_secs.is_some()
        || params.completion_timeout_per_gib_secs.is_some())
    .then_some(MigrationConfig {
        completion_timeout_per_gib_secs: params.completion_timeout_per_gib_secs,
        progress_timeout_secs: params.progress_timeout_secs,
    });
    let request = state
        .actions()
        .migrate(&key(namespace, name), config)
        .await?;
    Ok((StatusCode::CREATED, Json(request)))
}
