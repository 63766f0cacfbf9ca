use std::time::Duration;

use thiserror::Error;
use uranus_protocol::{ErrorCode, ProtocolError, SessionId};

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("session already exists: {0}")]
    SessionAlreadyExists(SessionId),

    #[error("session closed: {0}")]
    SessionClosed(SessionId),

    #[error("input queue full for session {0}")]
    QueueFull(SessionId),

    #[error("invalid command payload: {0}")]
    ProtocolParse(#[from] ProtocolError),

    #[error("transport disconnected: {0}")]
    TransportDisconnected(String),

    #[error("failed to start process: {0}")]
    ProcessSpawn(String),

    #[error("resize failed: {0}")]
    Resize(String),

    #[error("command timeout after {}s", .0.as_secs_f64())]
    ExecutionTimeout(Duration),

    #[error("command rejected: {0}")]
    CommandRejected(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Convert to protocol error code and sanitized message.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self {
            AgentError::SessionNotFound(_) => {
                (ErrorCode::SessionNotFound, "session id not found".to_string())
            }
            AgentError::SessionAlreadyExists(_) => {
                (ErrorCode::SessionAlreadyExists, self.to_string())
            }
            AgentError::SessionClosed(_) => (ErrorCode::SessionClosed, self.to_string()),
            AgentError::QueueFull(_) => (ErrorCode::QueueFull, self.to_string()),
            AgentError::ProtocolParse(inner @ ProtocolError::UnknownCommand(_)) => {
                (ErrorCode::UnknownCommand, inner.to_string())
            }
            AgentError::ProtocolParse(_) => (ErrorCode::ProtocolParse, self.to_string()),
            AgentError::TransportDisconnected(_) => {
                (ErrorCode::TransportDisconnected, self.to_string())
            }
            AgentError::ProcessSpawn(_) => (ErrorCode::ProcessSpawn, self.to_string()),
            AgentError::Resize(_) => (ErrorCode::Resize, self.to_string()),
            AgentError::ExecutionTimeout(_) => (ErrorCode::ExecutionTimeout, self.to_string()),
            AgentError::CommandRejected(_) => (ErrorCode::CommandRejected, self.to_string()),
            AgentError::Io(_) => (ErrorCode::ServerError, "internal I/O error".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_uses_operator_facing_message() {
        let (code, message) = AgentError::SessionNotFound("t1".to_string()).to_error_code();
        assert_eq!(code, ErrorCode::SessionNotFound);
        assert_eq!(message, "session id not found");
    }

    #[test]
    fn unknown_command_gets_its_own_code() {
        let err = AgentError::from(ProtocolError::UnknownCommand("reboot".to_string()));
        let (code, message) = err.to_error_code();
        assert_eq!(code, ErrorCode::UnknownCommand);
        assert_eq!(message, "unknown command: reboot");
    }

    #[test]
    fn timeout_message_mentions_timeout() {
        let err = AgentError::ExecutionTimeout(Duration::from_secs(30));
        let (code, message) = err.to_error_code();
        assert_eq!(code, ErrorCode::ExecutionTimeout);
        assert!(message.contains("timeout"));
    }

    #[test]
    fn io_errors_are_sanitized() {
        let err = AgentError::from(std::io::Error::other("/secret/path exploded"));
        let (code, message) = err.to_error_code();
        assert_eq!(code, ErrorCode::ServerError);
        assert!(!message.contains("secret"));
    }
}
