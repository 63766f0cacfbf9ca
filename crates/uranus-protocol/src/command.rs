use serde_json::{Map, Value};
use thiserror::Error;

use crate::{CommandMessage, SessionId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid json: {0}")]
    InvalidJson(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("unknown command: {0}")]
    UnknownCommand(String),
}

/// Operation on a single terminal session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalOp {
    Create {
        shell: Option<String>,
        rows: Option<u16>,
        cols: Option<u16>,
    },
    Input {
        data: Vec<u8>,
    },
    Resize {
        rows: u16,
        cols: u16,
    },
    Close,
}

impl TerminalOp {
    pub fn name(&self) -> &'static str {
        match self {
            TerminalOp::Create { .. } => "create",
            TerminalOp::Input { .. } => "input",
            TerminalOp::Resize { .. } => "resize",
            TerminalOp::Close => "close",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NginxAction {
    Reload,
    Start,
    Stop,
    Restart,
}

impl NginxAction {
    pub fn as_str(self) -> &'static str {
        match self {
            NginxAction::Reload => "reload",
            NginxAction::Start => "start",
            NginxAction::Stop => "stop",
            NginxAction::Restart => "restart",
        }
    }
}

/// Decoded command, one variant per command kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Terminal { session_id: SessionId, op: TerminalOp },
    Nginx(NginxAction),
    Status,
    Execute { command: String },
    Update { url: Option<String> },
    Sessions,
}

impl Command {
    /// Commands that may take seconds to finish. Closing a session counts:
    /// the signal escalation can take most of a second.
    pub fn is_long_running(&self) -> bool {
        matches!(
            self,
            Command::Nginx(_)
                | Command::Execute { .. }
                | Command::Update { .. }
                | Command::Terminal {
                    op: TerminalOp::Close,
                    ..
                }
        )
    }
}

/// A command together with its correlation metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub request_id: String,
    pub client_id: Option<String>,
    /// Command name as it will be echoed in the response.
    pub name: String,
    pub command: Command,
}

impl CommandMessage {
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(payload).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
    }

    /// Normalize either envelope shape into a typed [`Request`].
    pub fn into_request(self) -> Result<Request, ProtocolError> {
        let command = self.command.trim().to_ascii_lowercase();
        let name = if command == "terminal" {
            self.kind
                .as_deref()
                .map(|k| k.trim().to_ascii_lowercase())
                .filter(|k| !k.is_empty())
                .ok_or(ProtocolError::MissingField("type"))?
        } else {
            command
        };

        let fields = Fields {
            raw: self.data.as_ref(),
            object: self.data.as_ref().and_then(object_view),
            params: self.params.as_ref(),
        };

        let command = match name.as_str() {
            "create" | "input" | "resize" | "close" => {
                let session_id = self
                    .session_id
                    .clone()
                    .or_else(|| fields.param_str("sessionId"))
                    .or_else(|| fields.param_str("session_id"))
                    .filter(|id| !id.is_empty())
                    .ok_or(ProtocolError::MissingField("sessionId"))?;
                Command::Terminal {
                    session_id,
                    op: terminal_op(&name, &fields)?,
                }
            }
            "reload" => Command::Nginx(NginxAction::Reload),
            "start" => Command::Nginx(NginxAction::Start),
            "stop" => Command::Nginx(NginxAction::Stop),
            "restart" => Command::Nginx(NginxAction::Restart),
            "status" => Command::Status,
            "sessions" => Command::Sessions,
            "execute" => {
                let command = fields
                    .lookup_str("command")
                    .or_else(|| fields.data_str())
                    .filter(|c| !c.trim().is_empty())
                    .ok_or(ProtocolError::MissingField("command"))?;
                Command::Execute { command }
            }
            "update" => Command::Update {
                url: fields.lookup_str("url").filter(|u| !u.is_empty()),
            },
            _ => return Err(ProtocolError::UnknownCommand(name)),
        };

        Ok(Request {
            request_id: self.request_id,
            client_id: self.client_id,
            name,
            command,
        })
    }
}

fn terminal_op(name: &str, fields: &Fields<'_>) -> Result<TerminalOp, ProtocolError> {
    match name {
        "create" => Ok(TerminalOp::Create {
            shell: fields.lookup_str("shell").filter(|s| !s.is_empty()),
            rows: fields.lookup_u16("rows")?,
            cols: fields.lookup_u16("cols")?,
        }),
        "input" => {
            let data = fields
                .data_str()
                .or_else(|| fields.lookup_str("input"))
                .or_else(|| fields.lookup_str("data"))
                .ok_or(ProtocolError::MissingField("data"))?;
            Ok(TerminalOp::Input {
                data: data.into_bytes(),
            })
        }
        "resize" => {
            let rows = fields
                .lookup_u16("rows")?
                .ok_or(ProtocolError::MissingField("rows"))?;
            let cols = fields
                .lookup_u16("cols")?
                .ok_or(ProtocolError::MissingField("cols"))?;
            if rows == 0 || cols == 0 {
                return Err(ProtocolError::InvalidField {
                    field: if rows == 0 { "rows" } else { "cols" },
                    reason: "must be greater than zero".to_string(),
                });
            }
            Ok(TerminalOp::Resize { rows, cols })
        }
        _ => Ok(TerminalOp::Close),
    }
}

/// Field lookup across `data` (preferred) and `params`.
struct Fields<'a> {
    raw: Option<&'a Value>,
    object: Option<Map<String, Value>>,
    params: Option<&'a Map<String, Value>>,
}

impl Fields<'_> {
    fn lookup(&self, key: &str) -> Option<&Value> {
        self.object
            .as_ref()
            .and_then(|d| d.get(key))
            .or_else(|| self.params.and_then(|p| p.get(key)))
    }

    fn lookup_str(&self, key: &str) -> Option<String> {
        self.lookup(key).and_then(|v| v.as_str()).map(str::to_string)
    }

    fn param_str(&self, key: &str) -> Option<String> {
        self.params
            .and_then(|p| p.get(key))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    fn data_str(&self) -> Option<String> {
        self.raw.and_then(|v| v.as_str()).map(str::to_string)
    }

    fn lookup_u16(&self, key: &'static str) -> Result<Option<u16>, ProtocolError> {
        let Some(value) = self.lookup(key) else {
            return Ok(None);
        };
        let number = match value {
            Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64)),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        };
        let number = number.ok_or_else(|| ProtocolError::InvalidField {
            field: key,
            reason: format!("expected a number, got {value}"),
        })?;
        u16::try_from(number)
            .map(Some)
            .map_err(|_| ProtocolError::InvalidField {
                field: key,
                reason: format!("{number} is out of range"),
            })
    }
}

/// Object view of `data`. Some clients send it as a JSON-encoded string.
fn object_view(value: &Value) -> Option<Map<String, Value>> {
    match value {
        Value::Object(map) => Some(map.clone()),
        Value::String(raw) if raw.trim_start().starts_with('{') => {
            match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => Some(map),
                _ => None,
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(value: Value) -> Result<Request, ProtocolError> {
        let msg: CommandMessage = serde_json::from_value(value).expect("envelope");
        msg.into_request()
    }

    #[test]
    fn flat_and_wrapped_create_normalize_to_same_command() {
        let flat = decode(json!({
            "command": "create",
            "requestId": "r1",
            "sessionId": "t1",
            "params": {"shell": "/bin/sh"}
        }))
        .expect("flat");
        let wrapped = decode(json!({
            "command": "terminal",
            "type": "create",
            "requestId": "r1",
            "sessionId": "t1",
            "data": {"shell": "/bin/sh"}
        }))
        .expect("wrapped");
        assert_eq!(flat.command, wrapped.command);
        assert_eq!(flat.name, "create");
        assert_eq!(wrapped.name, "create");
    }

    #[test]
    fn session_id_can_come_from_params() {
        let req = decode(json!({
            "command": "close",
            "requestId": "r2",
            "params": {"sessionId": "t9"}
        }))
        .expect("close");
        assert_eq!(
            req.command,
            Command::Terminal {
                session_id: "t9".to_string(),
                op: TerminalOp::Close
            }
        );
        assert!(req.command.is_long_running());
    }

    #[test]
    fn input_carries_raw_bytes() {
        let req = decode(json!({
            "command": "terminal",
            "type": "input",
            "sessionId": "t1",
            "data": "echo hi\n"
        }))
        .expect("input");
        assert!(!req.command.is_long_running());
        match req.command {
            Command::Terminal {
                op: TerminalOp::Input { data },
                ..
            } => assert_eq!(data, b"echo hi\n"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn resize_accepts_stringified_object() {
        let req = decode(json!({
            "command": "resize",
            "sessionId": "t1",
            "data": "{\"rows\":40,\"cols\":120}"
        }))
        .expect("resize");
        match req.command {
            Command::Terminal {
                op: TerminalOp::Resize { rows, cols },
                ..
            } => {
                assert_eq!(rows, 40);
                assert_eq!(cols, 120);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn resize_with_non_numeric_rows_is_parse_error() {
        let err = decode(json!({
            "command": "resize",
            "sessionId": "t1",
            "data": {"rows": "tall", "cols": 80}
        }))
        .expect_err("should fail");
        assert!(matches!(err, ProtocolError::InvalidField { field: "rows", .. }));
    }

    #[test]
    fn resize_without_cols_is_missing_field() {
        let err = decode(json!({
            "command": "resize",
            "sessionId": "t1",
            "data": {"rows": 10}
        }))
        .expect_err("should fail");
        assert_eq!(err, ProtocolError::MissingField("cols"));
    }

    #[test]
    fn terminal_wrapper_requires_type() {
        let err = decode(json!({"command": "terminal", "sessionId": "t1"})).expect_err("fail");
        assert_eq!(err, ProtocolError::MissingField("type"));
    }

    #[test]
    fn terminal_ops_require_session_id() {
        let err = decode(json!({"command": "input", "data": "ls\n"})).expect_err("fail");
        assert_eq!(err, ProtocolError::MissingField("sessionId"));
    }

    #[test]
    fn execute_reads_command_param() {
        let req = decode(json!({
            "command": "execute",
            "requestId": "r3",
            "params": {"command": "uptime"}
        }))
        .expect("execute");
        assert_eq!(
            req.command,
            Command::Execute {
                command: "uptime".to_string()
            }
        );
        assert!(req.command.is_long_running());
    }

    #[test]
    fn nginx_and_misc_commands() {
        for (name, expected) in [
            ("reload", Command::Nginx(NginxAction::Reload)),
            ("start", Command::Nginx(NginxAction::Start)),
            ("stop", Command::Nginx(NginxAction::Stop)),
            ("restart", Command::Nginx(NginxAction::Restart)),
            ("status", Command::Status),
            ("sessions", Command::Sessions),
            ("update", Command::Update { url: None }),
        ] {
            let req = decode(json!({"command": name, "requestId": "r"})).expect(name);
            assert_eq!(req.command, expected);
        }
    }

    #[test]
    fn unknown_command_is_reported_by_name() {
        let err = decode(json!({"command": "reboot"})).expect_err("fail");
        assert_eq!(err, ProtocolError::UnknownCommand("reboot".to_string()));
        assert_eq!(err.to_string(), "unknown command: reboot");
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = CommandMessage::decode(b"not json").expect_err("fail");
        assert!(matches!(err, ProtocolError::InvalidJson(_)));
    }
}
