//! Wire-protocol message types
//!
//! Two kinds of text message travel alongside the binary data plane:
//!
//! - Control envelopes on a multiplexed control connection, distinguished by
//!   the reserved `control:` prefix and carrying `op.start` / `op.complete` /
//!   `op.error` JSON bodies.
//! - Out-of-band TTY messages (`resize`, `signal`, `exit`, `session_info`),
//!   sent as plain JSON text on both per-command transports and TTY ops.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SpriteError};

/// Reserved prefix marking a text message as a control envelope
pub const CONTROL_PREFIX: &str = "control:";

/// Envelope type for starting an operation (client -> server)
pub const OP_START: &str = "op.start";
/// Envelope type completing the current operation (server -> client)
pub const OP_COMPLETE: &str = "op.complete";
/// Envelope type failing the current operation (server -> client)
pub const OP_ERROR: &str = "op.error";

/// JSON control-plane message on a control connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlEnvelope {
    /// Envelope type: `op.start`, `op.complete`, or `op.error`
    #[serde(rename = "type")]
    pub kind: String,

    /// Operation name (op.start only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,

    /// String-keyed argument map
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<HashMap<String, Value>>,
}

impl ControlEnvelope {
    /// Serialize to the on-wire text form: the reserved prefix plus JSON
    pub fn to_text(&self) -> Result<String> {
        Ok(format!("{}{}", CONTROL_PREFIX, serde_json::to_string(self)?))
    }

    /// Parse a text message as a control envelope, if it carries the prefix
    ///
    /// Returns `None` for text without the prefix (a data-plane message).
    pub fn parse(text: &str) -> Option<Result<ControlEnvelope>> {
        let body = text.strip_prefix(CONTROL_PREFIX)?;
        Some(serde_json::from_str(body).map_err(SpriteError::from))
    }

    /// Read `args.exitCode`, accepting both string and number encodings
    pub fn exit_code(&self) -> Option<i32> {
        let value = self.args.as_ref()?.get("exitCode")?;
        match value {
            Value::Number(n) => n.as_i64().map(|n| n as i32),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Read `args.error`, the server-supplied failure message
    pub fn error_message(&self) -> Option<&str> {
        self.args.as_ref()?.get("error")?.as_str()
    }
}

/// Out-of-band JSON text message on a TTY transport
///
/// `resize` and `signal` are client -> server; `exit` and `session_info`
/// (attach handshake only) are server -> client. Unknown `type` values are
/// forwarded to the caller as generic messages, so this enum is only used
/// after inspecting the `type` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TtyMessage {
    /// Terminal resize request
    Resize { cols: u16, rows: u16 },
    /// Signal delivery request (best-effort, server decides)
    Signal { signal: String },
    /// Remote process exit notification
    Exit { exit_code: i32 },
    /// Session metadata sent by the server during an attach handshake
    SessionInfo { tty: bool },
}

/// Session descriptor, immutable once a session or operation starts
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Command and arguments (argv form)
    pub cmd: Vec<String>,

    /// Environment pairs as `KEY=VALUE` strings
    pub env: Vec<String>,

    /// Working directory on the remote sandbox
    pub dir: Option<String>,

    /// Allocate a TTY for the remote process
    pub tty: bool,

    /// Terminal rows (TTY only)
    pub rows: u16,

    /// Terminal columns (TTY only)
    pub cols: u16,

    /// Caller will supply stdin data
    pub stdin: bool,

    /// Session keeps running after the client disconnects
    pub detachable: bool,

    /// Session id to attach to (attach instead of starting a new command)
    pub session_id: Option<String>,

    /// Keepalive check interval
    pub keepalive_interval: std::time::Duration,

    /// Treat the transport as dead after this much inbound silence
    pub keepalive_timeout: std::time::Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            cmd: Vec::new(),
            env: Vec::new(),
            dir: None,
            tty: false,
            rows: 24,
            cols: 80,
            stdin: false,
            detachable: false,
            session_id: None,
            keepalive_interval: std::time::Duration::from_secs(15),
            keepalive_timeout: std::time::Duration::from_secs(45),
        }
    }
}

impl SessionOptions {
    /// Build the stringified `op.start` argument map from this descriptor
    pub fn to_op_args(&self) -> HashMap<String, Value> {
        let mut args = HashMap::new();
        args.insert(
            "cmd".to_string(),
            Value::Array(self.cmd.iter().cloned().map(Value::String).collect()),
        );
        args.insert(
            "env".to_string(),
            Value::Array(self.env.iter().cloned().map(Value::String).collect()),
        );
        if let Some(dir) = &self.dir {
            args.insert("dir".to_string(), Value::String(dir.clone()));
        }
        args.insert("tty".to_string(), Value::String(self.tty.to_string()));
        args.insert("rows".to_string(), Value::String(self.rows.to_string()));
        args.insert("cols".to_string(), Value::String(self.cols.to_string()));
        args.insert("stdin".to_string(), Value::String(self.stdin.to_string()));
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_to_text_has_prefix() {
        let envelope = ControlEnvelope {
            kind: OP_START.to_string(),
            op: Some("exec".to_string()),
            args: Some(SessionOptions::default().to_op_args()),
        };
        let text = envelope.to_text().unwrap();
        assert!(text.starts_with("control:{"));
    }

    #[test]
    fn test_envelope_parse_round_trip() {
        let envelope = ControlEnvelope {
            kind: OP_START.to_string(),
            op: Some("exec".to_string()),
            args: None,
        };
        let text = envelope.to_text().unwrap();
        let parsed = ControlEnvelope::parse(&text).unwrap().unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_envelope_parse_without_prefix_is_data() {
        assert!(ControlEnvelope::parse(r#"{"type":"resize"}"#).is_none());
        assert!(ControlEnvelope::parse("plain output").is_none());
    }

    #[test]
    fn test_envelope_parse_bad_json_is_error() {
        let result = ControlEnvelope::parse("control:{not json").unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn test_exit_code_accepts_string_and_number() {
        let from_string: ControlEnvelope =
            serde_json::from_str(r#"{"type":"op.complete","args":{"exitCode":"42"}}"#).unwrap();
        assert_eq!(from_string.exit_code(), Some(42));

        let from_number: ControlEnvelope =
            serde_json::from_str(r#"{"type":"op.complete","args":{"exitCode":7}}"#).unwrap();
        assert_eq!(from_number.exit_code(), Some(7));
    }

    #[test]
    fn test_error_message() {
        let envelope: ControlEnvelope =
            serde_json::from_str(r#"{"type":"op.error","args":{"error":"boom"}}"#).unwrap();
        assert_eq!(envelope.error_message(), Some("boom"));
    }

    #[test]
    fn test_op_args_are_stringified() {
        let opts = SessionOptions {
            cmd: vec!["echo".to_string(), "hi".to_string()],
            env: vec!["FOO=bar".to_string()],
            dir: Some("/workspace".to_string()),
            tty: true,
            rows: 40,
            cols: 120,
            stdin: false,
            ..Default::default()
        };
        let args = opts.to_op_args();
        assert_eq!(args["tty"], Value::String("true".to_string()));
        assert_eq!(args["rows"], Value::String("40".to_string()));
        assert_eq!(args["cols"], Value::String("120".to_string()));
        assert_eq!(args["stdin"], Value::String("false".to_string()));
        assert_eq!(args["dir"], Value::String("/workspace".to_string()));
    }

    #[test]
    fn test_tty_message_serde() {
        let resize = TtyMessage::Resize { cols: 80, rows: 24 };
        let json = serde_json::to_string(&resize).unwrap();
        assert!(json.contains(r#""type":"resize""#));

        let info: TtyMessage =
            serde_json::from_str(r#"{"type":"session_info","tty":false,"name":"dev"}"#).unwrap();
        assert_eq!(info, TtyMessage::SessionInfo { tty: false });
    }
}
