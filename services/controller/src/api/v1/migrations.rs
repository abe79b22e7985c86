//! MigrationRequest endpoints. Deleting an in-flight request cancels it.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use vmctl_model::{MigrationConfig, MigrationRequest};

use super::{key, ListResponse};
use crate::api::error::HttpError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_migrations).post(create_migration))
        .route("/{name}", get(get_migration).delete(delete_migration))
}

/// Request to relocate an instance.
#[derive(Debug, Deserialize)]
pub struct CreateMigrationRequest {
    pub name: String,
    pub instance_name: String,
    #[serde(default)]
    pub config: Option<MigrationConfig>,
}

/// POST /v1/namespaces/{namespace}/migrations
async fn create_migration(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    Json(req): Json<CreateMigrationRequest>,
) -> Result<impl IntoResponse, HttpError> {
    let mut request = MigrationRequest::new(namespace, req.name, req.instance_name);
    request.spec.config = req.config;
    let created = state.actions().create_migration(request).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// GET /v1/namespaces/{namespace}/migrations
async fn list_migrations(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
) -> impl IntoResponse {
    let items = state.actions().list_migrations(&namespace).await;
    Json(ListResponse { items })
}

/// GET /v1/namespaces/{namespace}/migrations/{name}
async fn get_migration(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<MigrationRequest>, HttpError> {
    Ok(Json(state.actions().get_migration(&key(namespace, name)).await?))
}

/// DELETE /v1/namespaces/{namespace}/migrations/{name}
async fn delete_migration(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<StatusCode, HttpError> {
    state
        .actions()
        .delete_migration(&key(namespace, name))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
