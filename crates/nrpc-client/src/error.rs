use nrpc_common::ErrorCode;
use nrpc_transport::TransportError;
use nrpc_wire::{DataMap, MessageType};

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("client closed")]
    Closed,
    #[error("call {service}.{method} timed out after {attempts} attempt(s)")]
    Timeout {
        service: String,
        method: String,
        attempts: u32,
    },
    #[error("call cancelled")]
    Cancelled,
    #[error("remote error {code}: {message}")]
    Remote {
        code: String,
        message: String,
        details: DataMap,
    },
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("encode request: {0}")]
    Encode(#[from] nrpc_wire::Error),
    #[error("unexpected reply type {}", .0.as_str())]
    UnexpectedReply(MessageType),
    #[error("request id {0} already pending")]
    DuplicateRequestId(String),
}

impl ClientError {
    /// Error-code string for this failure, as carried on the wire.
    pub fn code(&self) -> &str {
        match self {
            ClientError::Closed => ErrorCode::Closed.as_str(),
            ClientError::Timeout { .. } => ErrorCode::Timeout.as_str(),
            ClientError::Cancelled => ErrorCode::Cancelled.as_str(),
            ClientError::Remote { code, .. } => code,
            ClientError::Transport(TransportError::QueueFull { .. }) => ErrorCode::QueueFull.as_str(),
            ClientError::Transport(TransportError::Closed) => ErrorCode::Closed.as_str(),
            ClientError::Transport(_) => ErrorCode::TransportError.as_str(),
            ClientError::Encode(_)
            | ClientError::UnexpectedReply(_)
            | ClientError::DuplicateRequestId(_) => ErrorCode::InternalError.as_str(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_wire_taxonomy() {
        let timeout = ClientError::Timeout {
            service: "echo".into(),
            method: "upper".into(),
            attempts: 4,
        };
        assert_eq!(timeout.code(), "timeout");
        assert!(timeout.is_timeout());
        assert_eq!(timeout.to_string(), "call echo.upper timed out after 4 attempt(s)");

        let full = ClientError::Transport(TransportError::QueueFull {
            subject: "ns.x".into(),
        });
        assert_eq!(full.code(), "queue_full");
        assert_eq!(
            ClientError::Transport(TransportError::NotReady).code(),
            "transport_error"
        );
        let remote = ClientError::Remote {
            code: "rate_limited".into(),
            message: "slow down".into(),
            details: DataMap::new(),
        };
        assert_eq!(remote.code(), "rate_limited");
        assert_eq!(ClientError::Closed.code(), "closed");
    }
}
