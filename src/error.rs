use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Failures that can surface before the first response byte is sent.
///
/// Once a body is streaming, errors are only logged and the connection is
/// closed; they never become one of these values.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("upstream responded with {status}")]
    UpstreamBadStatus { status: StatusCode },

    #[error("failed to start transcoder: {0}")]
    EncoderSpawnFailure(String),

    #[error("transcoder exited before producing output: {0}")]
    EncoderRuntimeFailure(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamBadStatus { status }
                if status.is_client_error() || status.is_server_error() =>
            {
                *status
            }
            GatewayError::UpstreamBadStatus { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::EncoderSpawnFailure(_) | GatewayError::EncoderRuntimeFailure(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        match err
            .status()
            .and_then(|s| StatusCode::from_u16(s.as_u16()).ok())
        {
            Some(status) => GatewayError::UpstreamBadStatus { status },
            None => GatewayError::UpstreamUnreachable(err.to_string()),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(ErrorBody {
                success: false,
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}
