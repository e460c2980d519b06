use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;
use vm_orchestrator::OrchestratorError;
use vm_ssh::SshError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    /// The cloud provider or an instance's SSH server failed the request
    BadGateway(String),
    GatewayTimeout(String),
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            ApiError::BadRequest(msg)
            | ApiError::Unauthorized(msg)
            | ApiError::Forbidden(msg)
            | ApiError::NotFound(msg)
            | ApiError::Conflict(msg)
            | ApiError::BadGateway(msg)
            | ApiError::GatewayTimeout(msg) => msg,
            ApiError::Internal(msg) => {
                error!("Internal error: {}", msg);
                msg
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::NotFound(_) => ApiError::NotFound(err.to_string()),
            OrchestratorError::Validation(_)
            | OrchestratorError::BadRequest(_)
            | OrchestratorError::InvalidCredentials => ApiError::BadRequest(err.to_string()),
            OrchestratorError::Unauthorized(_) => ApiError::Unauthorized(err.to_string()),
            OrchestratorError::Forbidden(_) => ApiError::Forbidden(err.to_string()),
            OrchestratorError::Conflict(_) => ApiError::Conflict(err.to_string()),
            OrchestratorError::Provider(_) => ApiError::BadGateway(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<SshError> for ApiError {
    fn from(err: SshError) -> Self {
        match err {
            SshError::Orchestrator(inner) => inner.into(),
            SshError::BadRequest(_) => ApiError::BadRequest(err.to_string()),
            SshError::Timeout(_) => ApiError::GatewayTimeout(err.to_string()),
            SshError::Connect(_)
            | SshError::Authentication(_)
            | SshError::Channel(_)
            | SshError::RemoteExecution { .. } => ApiError::BadGateway(err.to_string()),
            SshError::KeyFile(_) => ApiError::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use vm_core::VmError;
    use vm_provider::ProviderError;

    #[test]
    fn test_orchestrator_error_statuses() {
        let cases = [
            (OrchestratorError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (
                OrchestratorError::Validation(VmError::Validation("bad url".into())),
                StatusCode::BAD_REQUEST,
            ),
            (OrchestratorError::InvalidCredentials, StatusCode::BAD_REQUEST),
            (OrchestratorError::Unauthorized("x".into()), StatusCode::UNAUTHORIZED),
            (OrchestratorError::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (OrchestratorError::Conflict("x".into()), StatusCode::CONFLICT),
            (
                OrchestratorError::Provider(ProviderError::api(Some("Throttling"), "slow down")),
                StatusCode::BAD_GATEWAY,
            ),
            (OrchestratorError::Crypto("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status(), expected);
        }
    }

    #[test]
    fn test_ssh_error_statuses() {
        assert_eq!(
            ApiError::from(SshError::Timeout(Duration::from_secs(2))).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ApiError::from(SshError::Connect("refused".into())).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::from(SshError::Orchestrator(OrchestratorError::NotFound("x".into())))
                .status(),
            StatusCode::NOT_FOUND
        );
    }
}
