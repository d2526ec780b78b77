use axum::http::StatusCode;
use std::io;

/// Custom error type for agent_gateway operations
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("No credentials configured for '{0}'")]
    NotConfigured(String),

    #[error("Agent access secret is not configured")]
    AgentNotConfigured,

    #[error("Malformed event payload: {0}")]
    BadEvent(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Credential sealing failed: {0}")]
    Crypto(String),

    #[error("Platform API call failed: {0}")]
    Platform(String),

    #[error("Execution unit unreachable: {0}")]
    DispatchTransport(String),

    #[error("Execution unit reported failure: {0}")]
    ExecutionFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParseError(#[from] toml::de::Error),
}

impl GatewayError {
    /// HTTP status returned to the source platform for this error.
    ///
    /// Authentication problems are 401, unknown projects 404, faults in the
    /// inbound data 400, and everything local or downstream 500. The source
    /// platform's own retry policy is the only retry authority, so nothing
    /// here signals "try again later".
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Authentication(_) => StatusCode::UNAUTHORIZED,
            GatewayError::NotConfigured(_) => StatusCode::NOT_FOUND,
            GatewayError::BadEvent(_) => StatusCode::BAD_REQUEST,
            GatewayError::AgentNotConfigured
            | GatewayError::Config(_)
            | GatewayError::Store(_)
            | GatewayError::Crypto(_)
            | GatewayError::Platform(_)
            | GatewayError::DispatchTransport(_)
            | GatewayError::ExecutionFailed(_)
            | GatewayError::IoError(_)
            | GatewayError::TomlParseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Helper type for Results that use GatewayError
pub type Result<T> = std::result::Result<T, GatewayError>;
