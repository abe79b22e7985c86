//! HTTP API handlers and routing.

pub mod error;
mod health;
mod v1;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the main API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::routes())
        .nest("/v1", v1::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::error::ProblemDetails;
    use super::health::HealthResponse;
    use super::*;
    use crate::actions::Actions;
    use crate::cluster::Cluster;
    use crate::runtime::SimulatedRuntime;

    fn router() -> Router {
        let cluster = Arc::new(Cluster::new(["node-a", "node-b"]));
        let actions = Actions::new(cluster, Arc::new(SimulatedRuntime::new()));
        create_router(AppState::new(actions))
    }

    async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    #[tokio::test]
    async fn test_healthz() {
        let router = router();
        let (status, body) = send(&router, Method::GET, "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.service, "vmctl-controller");
    }

    #[tokio::test]
    async fn test_create_and_get_policy() {
        let router = router();
        let (status, _) = send(
            &router,
            Method::POST,
            "/v1/namespaces/default/runpolicies",
            Some(json!({"name": "vm1", "run_mode": "Manual"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = send(&router, Method::GET, "/v1/namespaces/default/runpolicies/vm1", None).await;
        assert_eq!(status, StatusCode::OK);
        let policy: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(policy["spec"]["run_mode"], "Manual");
        assert_eq!(policy["status"]["printable_status"], "Stopped");

        let (status, body) = send(&router, Method::GET, "/v1/namespaces/default/runpolicies", None).await;
        assert_eq!(status, StatusCode::OK);
        let list: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(list["items"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_policy_is_problem() {
        let router = router();
        let (status, body) = send(
            &router,
            Method::POST,
            "/v1/namespaces/default/runpolicies",
            Some(json!({"name": "vm1", "running": true, "run_mode": "Always"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let problem: ProblemDetails = serde_json::from_slice(&body).unwrap();
        assert_eq!(problem.code, "Invalid");
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let router = router();
        send(
            &router,
            Method::POST,
            "/v1/namespaces/default/runpolicies",
            Some(json!({"name": "vm1", "run_mode": "Halted"})),
        )
        .await;
        let (_, body) = send(&router, Method::GET, "/v1/namespaces/default/runpolicies/vm1", None).await;
        let policy: Value = serde_json::from_slice(&body).unwrap();
        let version = policy["meta"]["resource_version"].clone();
        let spec = policy["spec"].clone();

        let (status, _) = send(
            &router,
            Method::PUT,
            "/v1/namespaces/default/runpolicies/vm1",
            Some(json!({"resource_version": version, "spec": spec})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            &router,
            Method::PUT,
            "/v1/namespaces/default/runpolicies/vm1",
            Some(json!({"resource_version": version, "spec": spec})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        let problem: ProblemDetails = serde_json::from_slice(&body).unwrap();
        assert_eq!(problem.code, "Conflict");
    }

    #[tokio::test]
    async fn test_missing_objects_are_not_found() {
        let router = router();
        for uri in [
            "/v1/namespaces/default/runpolicies/ghost",
            "/v1/namespaces/default/instances/ghost",
            "/v1/namespaces/default/migrations/ghost",
        ] {
            let (status, body) = send(&router, Method::GET, uri, None).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
            let problem: ProblemDetails = serde_json::from_slice(&body).unwrap();
            assert_eq!(problem.code, "NotFound");
        }
    }

    #[tokio::test]
    async fn test_stop_without_instance_is_not_running() {
        let router = router();
        send(
            &router,
            Method::POST,
            "/v1/namespaces/default/runpolicies",
            Some(json!({"name": "vm1", "run_mode": "Manual"})),
        )
        .await;
        let (status, body) = send(
            &router,
            Method::PUT,
            "/v1/namespaces/default/runpolicies/vm1/stop?grace_period_secs=5",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        let problem: ProblemDetails = serde_json::from_slice(&body).unwrap();
        assert_eq!(problem.code, "NotRunning");
    }
}
