use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Domain-specific error types for Midroll
///
/// The taxonomy separates errors the client must see (bad request, auth)
/// from errors the rewriter recovers from locally (decision outage, skip-plan
/// infeasibility). Recoverable kinds are handled inside the rewrite pipeline
/// and only reach `IntoResponse` when recovery itself is impossible.
#[derive(Error, Debug)]
pub enum MidrollError {
    #[error("Invalid request: {0}")]
    InvalidInput(String),

    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    #[error("Failed to fetch playlist from origin: {0}")]
    OriginUnavailable(#[from] reqwest::Error),

    #[error("Origin returned status {0}")]
    OriginStatus(u16),

    #[error("Decision service unavailable: {0}")]
    DecisionUnavailable(String),

    #[error("SCTE-35 payload corrupt: {0}")]
    Scte35Corrupt(String),

    #[error("Skip plan infeasible: {0}")]
    SkipPlanInfeasible(String),

    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invariant violated: {0}")]
    InternalInvariantViolation(String),
}

impl IntoResponse for MidrollError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            MidrollError::InvalidInput(ref e) => {
                tracing::warn!("Invalid input: {}", e);
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            MidrollError::AuthFailure(ref reason) => {
                // Log the reason code only, never the token itself
                tracing::warn!("Auth failure: {}", reason);
                (StatusCode::FORBIDDEN, self.to_string())
            }
            MidrollError::OriginUnavailable(ref e) => {
                tracing::error!("Origin fetch error: {:?}", e);
                (StatusCode::BAD_GATEWAY, self.to_string())
            }
            MidrollError::OriginStatus(code) => {
                tracing::error!("Origin returned status {}", code);
                let status = if code == 504 {
                    StatusCode::GATEWAY_TIMEOUT
                } else {
                    StatusCode::BAD_GATEWAY
                };
                (status, self.to_string())
            }
            MidrollError::DecisionUnavailable(ref e) => {
                tracing::error!("Decision service error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            MidrollError::Scte35Corrupt(ref e) => {
                tracing::warn!("SCTE-35 corrupt: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            MidrollError::SkipPlanInfeasible(ref e) => {
                tracing::warn!("Skip plan infeasible: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            MidrollError::ChannelNotFound(ref e) => {
                tracing::warn!("Channel not found: {}", e);
                (StatusCode::NOT_FOUND, self.to_string())
            }
            MidrollError::ConfigError(ref e) => {
                tracing::error!("Configuration error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            MidrollError::InternalInvariantViolation(ref e) => {
                tracing::error!("Invariant violation: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
        };

        (status, error_message).into_response()
    }
}

// Convenience type alias for Results
pub type Result<T> = std::result::Result<T, MidrollError>;
