use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::error::CoordinationError;

#[derive(Debug)]
pub enum ApiError {
    Coordination(CoordinationError),
    Internal(anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Coordination(e) => match e {
                _ if e.is_not_found() => StatusCode::NOT_FOUND,
                CoordinationError::Validation(_) | CoordinationError::TaskDependencyCycle(_) => {
                    StatusCode::BAD_REQUEST
                }
                CoordinationError::InvalidTransition { .. }
                | CoordinationError::TaskAssignmentFailed(_)
                | CoordinationError::QualityGateExhausted { .. } => StatusCode::CONFLICT,
                CoordinationError::MaxAgentsReached(_) | CoordinationError::SystemOverload(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                CoordinationError::CommunicationTimeout { .. }
                | CoordinationError::TaskExecutionTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
                CoordinationError::Execution(_) => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<CoordinationError> for ApiError {
    fn from(err: CoordinationError) -> Self {
        ApiError::Coordination(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (kind, message) = match &self {
            ApiError::Coordination(e) => (e.kind(), e.to_string()),
            ApiError::Internal(e) => ("Internal", e.to_string()),
        };
        if status.is_server_error() {
            log::error!("request failed: {}", message);
        }
        (status, Json(json!({ "error": kind, "message": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_not_found_is_distinct_from_validation() {
        let not_found = ApiError::from(CoordinationError::TaskNotFound(Uuid::new_v4()));
        let invalid = ApiError::from(CoordinationError::Validation("bad".into()));
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::from(CoordinationError::MaxAgentsReached(10)).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
