//! RFC 7807 problem responses.

use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use vmctl_model::{ApiError, ErrorKind};

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub code: String,
    pub retryable: bool,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: &str, detail: impl Into<String>) -> Self {
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("https://vmctl.dev/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            code: code.to_string(),
            retryable: false,
        }
    }
}

/// HTTP status for each error kind.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::AlreadyExists
        | ErrorKind::Conflict
        | ErrorKind::AlreadyRunning
        | ErrorKind::NotRunning
        | ErrorKind::AlreadyPaused
        | ErrorKind::NotPaused
        | ErrorKind::VMIPaused => StatusCode::CONFLICT,
        ErrorKind::Invalid => StatusCode::BAD_REQUEST,
        ErrorKind::AgentNotConnected
        | ErrorKind::NeitherAgentNorACPI
        | ErrorKind::DisksNotLiveMigratable => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// An [`ApiError`] rendered as `application/problem+json`.
#[derive(Debug)]
pub struct HttpError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl HttpError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::invalid(message).into()
    }
}

impl From<ApiError> for HttpError {
    fn from(err: ApiError) -> Self {
        let status = status_for(err.kind);
        let mut problem = Box::new(ProblemDetails::new(status, err.kind.as_str(), err.message));
        problem.retryable = matches!(err.kind, ErrorKind::Unavailable | ErrorKind::Timeout);
        Self { status, problem }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(code = %self.problem.code, detail = %self.problem.detail, "Request failed");
        }
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}
