use core::error::Error;

use api_types::ApiResponse;
use poem::error::ResponseError;
use poem::http::StatusCode;
use poem::web::Json;
use poem::{IntoResponse, Response};

use crate::core::OrchestratorError;

/// API errors
#[derive(Debug, derive_more::Display)]
pub enum ApiError {
    #[display("{_0}")]
    Command(OrchestratorError),
    #[display("Server error: {message}")]
    ServerError { message: String },
}

impl Error for ApiError {}

impl From<OrchestratorError> for ApiError {
    fn from(error: OrchestratorError) -> Self {
        Self::Command(error)
    }
}

impl ResponseError for ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Command(error) => match error {
                OrchestratorError::NotFound { .. } => StatusCode::NOT_FOUND,
                OrchestratorError::InvalidTransition { .. } => StatusCode::CONFLICT,
                OrchestratorError::InvalidInput { .. } => StatusCode::BAD_REQUEST,
                OrchestratorError::Unsupported { .. } => StatusCode::NOT_IMPLEMENTED,
                OrchestratorError::NotInitialized { .. }
                | OrchestratorError::ProviderUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
                OrchestratorError::TimeoutExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
                OrchestratorError::ExternalOperation { .. } => StatusCode::BAD_GATEWAY,
            },
            ApiError::ServerError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Errors keep the response envelope of successful calls.
    fn as_response(&self) -> Response
    where
        Self: Error + Send + Sync + 'static,
    {
        Json(ApiResponse::<()>::failed(self.to_string()))
            .with_status(self.status())
            .into_response()
    }
}
