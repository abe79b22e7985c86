//! API v1 routes.

mod instances;
mod migrations;
mod runpolicies;

use axum::Router;
use vmctl_model::ObjectKey;

use crate::state::AppState;

/// Create API v1 routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/namespaces/{namespace}/runpolicies", runpolicies::routes())
        .nest("/namespaces/{namespace}/instances", instances::routes())
        .nest("/namespaces/{namespace}/migrations", migrations::routes())
}

/// List response envelope.
#[derive(Debug, serde::Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
}

fn key(namespace: String, name: String) -> ObjectKey {
    ObjectKey::new(namespace, name)
}
