//! Gateway error taxonomy.
//!
//! Each variant maps to an HTTP status and, where the UI needs to
//! distinguish failure modes, a machine-readable wire code. Transient
//! upstream failures additionally degrade to an in-character payload
//! (see `persona`) instead of surfacing as an error status.

use thiserror::Error;
use warp::http::StatusCode;

#[derive(Debug, Clone, Error)]
pub enum ChatError {
    #[error("Origin is not allowed.")]
    OriginRejected,

    #[error("Method not allowed")]
    MethodRejected,

    #[error("Too many requests. Please try again later.")]
    RateLimited { retry_after_secs: u64 },

    #[error("API key not configured. Please set GOOGLE_API_KEY in the gateway environment.")]
    MissingApiKey,

    #[error("{0}")]
    InvalidRequest(String),

    #[error("Function timeout budget exceeded before model response.")]
    BudgetExceeded,

    #[error("Request timeout on model {model} ({timeout_ms}ms).")]
    UpstreamTimeout { model: String, timeout_ms: u64 },

    #[error("Failed to connect to Gemini API. Please try again later.")]
    UpstreamConnection,

    /// Auth/quota/region/malformed-request failures reported by the provider.
    /// Not retried — these do not change within a single request's lifetime.
    #[error("{message}")]
    UpstreamModel {
        status: u16,
        message: String,
        location_unsupported: bool,
    },

    #[error("Gemini API returned no usable response text.")]
    UpstreamEmpty,

    #[error("Invalid response from Gemini API.")]
    UpstreamInvalidResponse,
}

impl ChatError {
    /// Wire code carried in the JSON body, where the UI cares which
    /// failure mode it was. `None` for plain request-shape errors.
    pub fn error_code(&self) -> Option<&'static str> {
        match self {
            ChatError::MissingApiKey => Some("MISSING_API_KEY"),
            ChatError::BudgetExceeded => Some("FUNCTION_BUDGET_TIMEOUT"),
            ChatError::UpstreamTimeout { .. } => Some("UPSTREAM_TIMEOUT"),
            ChatError::UpstreamConnection => Some("UPSTREAM_CONNECTION_FAILED"),
            ChatError::UpstreamModel {
                location_unsupported: true,
                ..
            } => Some("UPSTREAM_LOCATION_UNSUPPORTED"),
            ChatError::UpstreamModel { .. } => Some("UPSTREAM_MODEL_ERROR"),
            ChatError::UpstreamEmpty => Some("UPSTREAM_EMPTY_RESPONSE"),
            ChatError::UpstreamInvalidResponse => Some("UPSTREAM_INVALID_RESPONSE"),
            _ => None,
        }
    }

    /// HTTP status used when the error is surfaced directly (non-degraded).
    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::OriginRejected => StatusCode::FORBIDDEN,
            ChatError::MethodRejected => StatusCode::METHOD_NOT_ALLOWED,
            ChatError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ChatError::MissingApiKey => StatusCode::INTERNAL_SERVER_ERROR,
            ChatError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ChatError::BudgetExceeded | ChatError::UpstreamTimeout { .. } => {
                StatusCode::GATEWAY_TIMEOUT
            }
            ChatError::UpstreamConnection => StatusCode::SERVICE_UNAVAILABLE,
            ChatError::UpstreamModel { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            ChatError::UpstreamEmpty | ChatError::UpstreamInvalidResponse => {
                StatusCode::BAD_GATEWAY
            }
        }
    }

    /// Whether the failure degrades to a 200 with an in-character payload.
    /// Hard provider failures (auth/quota/region) stay visible — masking
    /// them as "the character is being evasive" would hide operator work.
    pub fn is_degradable(&self) -> bool {
        matches!(
            self,
            ChatError::BudgetExceeded
                | ChatError::UpstreamTimeout { .. }
                | ChatError::UpstreamConnection
                | ChatError::UpstreamEmpty
        )
    }
}
