use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

mod command;
pub mod topics;

pub use command::{Command, NginxAction, ProtocolError, Request, TerminalOp};
pub use topics::{Topics, topic_matches};

/// Session identifiers are opaque strings chosen by the caller.
pub type SessionId = String;

pub const DEFAULT_ROWS: u16 = 24;
pub const DEFAULT_COLS: u16 = 80;

/// Inbound command envelope.
///
/// Two shapes arrive on the wire and both deserialize into this struct:
/// a flat one (`{"command":"resize","sessionId":..,"data":{..}}`) and a
/// wrapped one where `command` is `"terminal"` and the terminal operation
/// lives in `type`. [`CommandMessage::into_request`] folds both into a
/// single typed [`Request`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandMessage {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
    #[serde(default)]
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Reply to a [`CommandMessage`], correlated through `request_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMessage {
    pub command: String,
    pub request_id: String,
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    pub timestamp: i64,
}

impl ResponseMessage {
    pub fn ok(command: impl Into<String>, request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            request_id: request_id.into(),
            success: true,
            message: message.into(),
            output: None,
            data: None,
            session_id: None,
            kind: None,
            code: None,
            timestamp: now_millis(),
        }
    }

    pub fn error(
        command: impl Into<String>,
        request_id: impl Into<String>,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            kind: Some("error".to_string()),
            code: Some(code),
            ..Self::ok(command, request_id, message)
        }
    }

    pub fn with_session(mut self, session_id: impl Into<SessionId>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }
}

/// Frame exchanged on the direct socket, distinguished from raw terminal
/// bytes by being a JSON object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ControlMessage {
    pub fn new(kind: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            kind: kind.into(),
            session_id: None,
            data,
        }
    }

    pub fn pong() -> Self {
        Self::new("pong", Some(Value::String("pong".to_string())))
    }

    /// Rewrap a terminal control frame as a `terminal` command envelope so it
    /// can travel through the same dispatcher as broker commands.
    pub fn into_command_message(self, request_id: impl Into<String>) -> CommandMessage {
        CommandMessage {
            command: "terminal".to_string(),
            request_id: request_id.into(),
            session_id: self.session_id,
            kind: Some(self.kind),
            data: self.data,
            timestamp: Some(now_millis()),
            ..CommandMessage::default()
        }
    }
}

/// One batch of terminal output for a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutputMessage {
    pub session_id: SessionId,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: String,
    pub timestamp: i64,
}

impl OutputMessage {
    pub fn new(session_id: impl Into<SessionId>, data: String, timestamp: i64) -> Self {
        Self {
            session_id: session_id.into(),
            kind: "output".to_string(),
            data,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Offline,
}

/// Retained presence announcement on `<prefix>/status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusMessage {
    pub uuid: String,
    pub status: AgentStatus,
    pub timestamp: i64,
}

impl StatusMessage {
    pub fn new(uuid: impl Into<String>, status: AgentStatus) -> Self {
        Self {
            uuid: uuid.into(),
            status,
            timestamp: now_millis(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatMessage {
    pub uuid: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub version: String,
    pub timestamp: i64,
}

/// Error codes attached to failed responses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    SessionNotFound,
    SessionAlreadyExists,
    SessionClosed,
    ProtocolParse,
    UnknownCommand,
    TransportDisconnected,
    ProcessSpawn,
    Resize,
    ExecutionTimeout,
    CommandRejected,
    QueueFull,
    ServerError,
}

/// Milliseconds since the unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
