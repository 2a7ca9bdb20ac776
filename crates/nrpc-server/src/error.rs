use nrpc_common::ErrorCode;
use nrpc_transport::TransportError;
use nrpc_wire::{DataMap, ErrorInfo};

pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("handler {0} already registered")]
    DuplicateHandler(String),
    #[error("method {method} already registered on service {service}")]
    DuplicateMethod { service: String, method: String },
    #[error("service {0} already registered")]
    DuplicateService(String),
    #[error("service name {0} is reserved")]
    ReservedName(String),
    #[error("invalid service name: {0:?}")]
    InvalidName(String),
    #[error("transport not ready")]
    TransportNotReady,
    #[error("failed to subscribe to {subject}")]
    Subscribe {
        subject: String,
        #[source]
        source: TransportError,
    },
}

/// Failure returned by a handler or middleware; becomes an `error` message.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("{code}: {message}")]
pub struct HandlerError {
    pub code: String,
    pub message: String,
    pub details: DataMap,
}

impl HandlerError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.as_str().to_string(),
            message: message.into(),
            details: DataMap::new(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    pub fn not_found(service: &str, method: &str) -> Self {
        Self::new(
            ErrorCode::MethodNotFound,
            format!("method {method} not found in service {service}"),
        )
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthenticated, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RateLimited, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unavailable, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    pub fn with_details(mut self, details: DataMap) -> Self {
        self.details = details;
        self
    }

    pub fn into_error_info(self) -> ErrorInfo {
        ErrorInfo {
            code: self.code,
            message: self.message,
            details: self.details,
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_argument(err.to_string())
    }
}
