use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A command received from the control plane. Created remotely, consumed
/// exactly once by the supervisor, never mutated.
///
/// `tool` selects the target service (`mm`, `sysconfig`, `qan`, `log`,
/// `data`, `agent`); `verb` and `payload` are interpreted by that service.
/// Both are kept as strings so an unrecognized value can be echoed back in
/// the error reply instead of failing to deserialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub user: String,
    pub tool: String,
    pub verb: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// The single reply produced for a [`Command`]. `id` equals the originating
/// command's id; an empty `error` string denotes success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub id: String,
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Reply {
    pub fn ok(cmd: &Command, payload: serde_json::Value) -> Self {
        Self {
            id: cmd.id.clone(),
            ts: Utc::now(),
            error: String::new(),
            payload,
        }
    }

    pub fn err(cmd: &Command, error: impl std::fmt::Display) -> Self {
        Self {
            id: cmd.id.clone(),
            ts: Utc::now(),
            error: error.to_string(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_empty()
    }
}

/// Log severity, ordered from lowest to highest.
///
/// # Examples
///
/// ```
/// use sqlmon_common::types::LogLevel;
///
/// let lvl: LogLevel = "warn".parse().unwrap();
/// assert_eq!(lvl, LogLevel::Warn);
/// assert!(LogLevel::Error > LogLevel::Debug);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
            LogLevel::Fatal => write!(f, "fatal"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "fatal" => Ok(LogLevel::Fatal),
            _ => Err(format!("unknown log level: {s}")),
        }
    }
}

/// One structured log event produced by the agent itself.
///
/// Consumers may only assume per-producer FIFO ordering, never ordering
/// across producers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub ts: DateTime<Utc>,
    pub level: LogLevel,
    pub service: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd_id: Option<String>,
}

impl LogEvent {
    pub fn new(level: LogLevel, service: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            level,
            service: service.into(),
            message: message.into(),
            cmd_id: None,
        }
    }
}

/// One telemetry sample, tagged with its origin, written once to the
/// spooler and deleted after a successful send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleEnvelope {
    /// Tick timestamp, whole UTC seconds. Non-decreasing per monitor.
    pub created_ts: DateTime<Utc>,
    pub hostname: String,
    /// Internal service kind: `mm`, `sysconfig` or `qan`.
    pub service: String,
    pub instance_uuid: String,
    pub payload: serde_json::Value,
}

/// Kind of entity the agent monitors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceKind {
    Os,
    Database,
    Agent,
}

/// An entity the agent monitors. The control plane owns the truth; the
/// agent treats fetched records as immutable and caches them on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_uuid: Option<String>,
    pub kind: InstanceKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dsn: Option<String>,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

/// Message kinds carried on the control-plane link.
pub mod wire_kind {
    pub const HELLO: &str = "hello";
    pub const CMD: &str = "cmd";
    pub const REPLY: &str = "reply";
    pub const LOG: &str = "log";
    pub const DATA: &str = "data";
    pub const ACK: &str = "ack";
    pub const PING: &str = "ping";
}

/// The wire envelope every control-plane message travels in. The transport
/// applies framing and per-stream ordering; the envelope only says what the
/// body is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub body: serde_json::Value,
}

impl WireMessage {
    pub fn new(kind: &str, id: Option<String>, body: serde_json::Value) -> Self {
        Self {
            kind: kind.to_string(),
            id,
            ts: Utc::now(),
            body,
        }
    }

    pub fn hello(agent_uuid: &str, api_key: &str, hostname: &str, version: &str) -> Self {
        Self::new(
            wire_kind::HELLO,
            Some(agent_uuid.to_string()),
            serde_json::json!({
                "agent_uuid": agent_uuid,
                "api_key": api_key,
                "hostname": hostname,
                "version": version,
            }),
        )
    }

    pub fn reply(reply: &Reply) -> serde_json::Result<Self> {
        Ok(Self::new(
            wire_kind::REPLY,
            Some(reply.id.clone()),
            serde_json::to_value(reply)?,
        ))
    }

    pub fn log(event: &LogEvent) -> serde_json::Result<Self> {
        Ok(Self::new(wire_kind::LOG, None, serde_json::to_value(event)?))
    }

    pub fn data(batch_id: &str, envelopes: &[SampleEnvelope]) -> serde_json::Result<Self> {
        Ok(Self::new(
            wire_kind::DATA,
            Some(batch_id.to_string()),
            serde_json::json!({ "envelopes": envelopes }),
        ))
    }

    pub fn ping() -> Self {
        Self::new(wire_kind::PING, None, serde_json::Value::Null)
    }
}

/// Host name as the kernel reports it, for tagging sample envelopes.
pub fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "localhost".to_string())
}
