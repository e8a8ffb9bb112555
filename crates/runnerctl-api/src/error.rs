use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::BAD_REQUEST, message: msg.into() }
    }

    pub fn unprocessable(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::UNPROCESSABLE_ENTITY, message: msg.into() }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::NOT_FOUND, message: msg.into() }
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::UNAUTHORIZED, message: msg.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ApiError { status: StatusCode::INTERNAL_SERVER_ERROR, message: msg.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

impl From<runnerctl_reconciler::PipelineError> for ApiError {
    fn from(e: runnerctl_reconciler::PipelineError) -> Self {
        use runnerctl_reconciler::PipelineError as P;
        match e {
            P::InvalidRequest(_) => ApiError::bad_request(e.to_string()),
            P::NotFound(_) => ApiError::not_found(e.to_string()),
            P::ScriptFailed(_) | P::ProvisioningFailed(_) => ApiError::unprocessable(e.to_string()),
            P::AllocationTimeout => ApiError { status: StatusCode::GATEWAY_TIMEOUT, message: e.to_string() },
            P::Domain(_) => ApiError::unprocessable(e.to_string()),
            P::Store(inner) => ApiError::from(inner),
            P::Driver(_) | P::Events(_) | P::Crypto(_) | P::Internal(_) => ApiError::internal(e.to_string()),
        }
    }
}

impl From<runnerctl_store::StoreError> for ApiError {
    fn from(e: runnerctl_store::StoreError) -> Self {
        use runnerctl_store::StoreError as S;
        match e {
            S::RunnerNotFound(_) | S::ImageNotFound(_) | S::SecurityGroupNotFound(_) => {
                ApiError::not_found(e.to_string())
            }
            S::Conflict { .. } => ApiError { status: StatusCode::CONFLICT, message: e.to_string() },
            S::UniqueViolation(_) => ApiError { status: StatusCode::CONFLICT, message: e.to_string() },
            S::Serialization(_) | S::Internal(_) => ApiError::internal(e.to_string()),
        }
    }
}
