use thiserror::Error;

/// Main error type for the market quote cache
#[derive(Error, Debug)]
pub enum MqError {
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("No cached record for symbol: {symbol}")]
    NotFound { symbol: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised by a quote source (network, HTTP status, payload parsing)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("Request failed for {symbol}: {message}")]
    Request { symbol: String, message: String },

    #[error("HTTP status {status} for {symbol}")]
    Status { symbol: String, status: u16 },

    #[error("Rate limited by provider: {message}")]
    RateLimited { message: String },

    #[error("Provider rejected request for {symbol}: {message}")]
    Api { symbol: String, message: String },

    #[error("Unparseable payload for {symbol}: {message}")]
    Parse { symbol: String, message: String },
}

/// Errors raised by the persistent quote store
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {message}")]
    Database { message: String },

    #[error("Stored data is corrupt: {message}")]
    Corruption { message: String },
}

/// Coarse outcome class surfaced to callers at the service boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    NotFound,
    BadRequest,
    Unavailable,
    Internal,
}

impl MqError {
    pub fn not_found(symbol: impl Into<String>) -> Self {
        MqError::NotFound {
            symbol: symbol.into(),
        }
    }

    pub fn client_status(&self) -> ClientStatus {
        match self {
            MqError::NotFound { .. } => ClientStatus::NotFound,
            MqError::InvalidArgument(_) => ClientStatus::BadRequest,
            MqError::Upstream(_) => ClientStatus::Unavailable,
            _ => ClientStatus::Internal,
        }
    }

    /// Generic message safe to hand to clients. Never carries upstream or
    /// storage detail.
    pub fn client_message(&self) -> &'static str {
        match self.client_status() {
            ClientStatus::NotFound => "not found",
            ClientStatus::BadRequest => "bad request",
            ClientStatus::Unavailable => "quote service unavailable",
            ClientStatus::Internal => "internal error",
        }
    }
}

/// Result type alias for quote cache operations
pub type MqResult<T> = Result<T, MqError>;

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::MqError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::MqError::Config(format!($($arg)*))
    };
}
