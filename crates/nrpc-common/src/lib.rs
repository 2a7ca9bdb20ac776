// Shared data types and small helpers used across the nrpc crates.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid id: {0}")]
    InvalidId(String),
    #[error("unknown error code: {0}")]
    UnknownCode(String),
}

pub mod ids {
    // Message ids double as subject tokens, so they must never contain dots.
    use super::{Error, Result};
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use std::str::FromStr;
    use uuid::Uuid;

    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
    pub struct MessageId(Uuid);

    impl MessageId {
        // Random v4 id; unique per process for any realistic pending window.
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }

        pub fn from_uuid(uuid: Uuid) -> Self {
            Self(uuid)
        }

        pub fn as_uuid(&self) -> Uuid {
            self.0
        }
    }

    impl Default for MessageId {
        fn default() -> Self {
            Self::new()
        }
    }

    impl fmt::Display for MessageId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            // Simple form: 32 hex chars, safe as a single subject token.
            write!(f, "{}", self.0.simple())
        }
    }

    impl FromStr for MessageId {
        type Err = Error;

        fn from_str(input: &str) -> Result<Self> {
            let uuid = Uuid::parse_str(input).map_err(|_| Error::InvalidId(input.into()))?;
            Ok(Self(uuid))
        }
    }

    /// Mint a fresh message id in its wire form.
    pub fn new_message_id() -> String {
        MessageId::new().to_string()
    }
}

/// Error codes carried in `error` messages.
///
/// The wire field is a free-form string so peers may send codes this enum does
/// not know; [`ErrorCode::from_str`] rejects those and callers keep the raw string.
///
/// ```
/// use nrpc_common::ErrorCode;
///
/// assert_eq!(ErrorCode::ParseError.as_str(), "parse_error");
/// assert_eq!("timeout".parse::<ErrorCode>().expect("code"), ErrorCode::Timeout);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ParseError,
    InternalError,
    Timeout,
    Closed,
    QueueFull,
    TransportError,
    Cancelled,
    MethodNotFound,
    InvalidArgument,
    Unauthenticated,
    RateLimited,
    Unavailable,
}

impl ErrorCode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ParseError => "parse_error",
            ErrorCode::InternalError => "internal_error",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Closed => "closed",
            ErrorCode::QueueFull => "queue_full",
            ErrorCode::TransportError => "transport_error",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::MethodNotFound => "method_not_found",
            ErrorCode::InvalidArgument => "invalid_argument",
            ErrorCode::Unauthenticated => "unauthenticated",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let code = match input {
            "parse_error" => ErrorCode::ParseError,
            "internal_error" => ErrorCode::InternalError,
            "timeout" => ErrorCode::Timeout,
            "closed" => ErrorCode::Closed,
            "queue_full" => ErrorCode::QueueFull,
            "transport_error" => ErrorCode::TransportError,
            "cancelled" => ErrorCode::Cancelled,
            "method_not_found" => ErrorCode::MethodNotFound,
            "invalid_argument" => ErrorCode::InvalidArgument,
            "unauthenticated" => ErrorCode::Unauthenticated,
            "rate_limited" => ErrorCode::RateLimited,
            "unavailable" => ErrorCode::Unavailable,
            other => return Err(Error::UnknownCode(other.to_string())),
        };
        Ok(code)
    }
}

pub mod clock {
    use chrono::{DateTime, Utc};

    pub fn now() -> DateTime<Utc> {
        Utc::now()
    }

    // Whole seconds since the unix epoch, as reported by ping.
    pub fn unix_seconds() -> i64 {
        Utc::now().timestamp()
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorCode, ids::MessageId};
    use std::str::FromStr;

    #[test]
    fn message_id_round_trip() {
        let id = MessageId::new();
        let parsed = MessageId::from_str(&id.to_string()).expect("parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn message_id_is_a_single_subject_token() {
        let id = super::ids::new_message_id();
        assert_eq!(id.len(), 32);
        assert!(!id.contains('.'));
        assert!(!id.contains('-'));
    }

    #[test]
    fn message_id_rejects_invalid_input() {
        let err = MessageId::from_str("not-a-uuid").expect_err("invalid");
        assert!(matches!(err, Error::InvalidId(s) if s == "not-a-uuid"));
    }

    #[test]
    fn error_codes_parse_their_wire_names() {
        for code in [
            ErrorCode::ParseError,
            ErrorCode::InternalError,
            ErrorCode::Timeout,
            ErrorCode::Closed,
            ErrorCode::QueueFull,
            ErrorCode::TransportError,
            ErrorCode::Cancelled,
            ErrorCode::MethodNotFound,
            ErrorCode::InvalidArgument,
            ErrorCode::Unauthenticated,
            ErrorCode::RateLimited,
            ErrorCode::Unavailable,
        ] {
            assert_eq!(ErrorCode::from_str(code.as_str()).expect("parse"), code);
        }
        let err = ErrorCode::from_str("teapot").expect_err("unknown");
        assert!(matches!(err, Error::UnknownCode(s) if s == "teapot"));
    }
}
