/// Agent-wide error taxonomy.
///
/// Monitors surface errors via log + status only; service managers surface
/// lifecycle errors via command replies; the supervisor surfaces its own
/// errors via replies and may escalate to [`AgentError::Fatal`]. Transport
/// errors are never surfaced to the caller of a command.
///
/// # Examples
///
/// ```rust
/// use sqlmon_common::error::AgentError;
///
/// let err = AgentError::UnknownCommand("Pontificate".to_string());
/// assert_eq!(err.to_string(), "Unknown command: Pontificate");
/// ```
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// A required config field is missing or a value is malformed. Fatal at
    /// startup, a command reply otherwise.
    #[error("Invalid config: {0}")]
    ConfigInvalid(String),

    /// `Start` on an instance that is already running.
    #[error("Service already running: {0}")]
    ServiceAlreadyRunning(String),

    /// `Stop` on an instance that is not running. Idempotent: repeating the
    /// stop yields the same error.
    #[error("Service not running: {0}")]
    ServiceNotRunning(String),

    /// The command's `tool` does not name any registered service.
    #[error("Unknown service: {0}")]
    UnknownService(String),

    /// The command's `verb` is not understood by the target service.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// An instance uuid that no cached instance record matches.
    #[error("Unknown instance: {0}")]
    UnknownInstance(String),

    /// The per-command handler deadline elapsed. The supervisor continues;
    /// the abandoned handler cleans up on its own.
    #[error("Command timeout: {0}")]
    CommandTimeout(String),

    /// Inbound command queue saturation; the command is rejected up front.
    #[error("Command queue full")]
    QueueFull,

    /// A handler refused the command for a structural reason.
    #[error("Command rejected: {0}")]
    CommandRejected(String),

    /// Transient link loss; the transport reconnects in the background and
    /// no user-visible reply is generated.
    #[error("Transport disconnected")]
    TransportDisconnected,

    /// Bounded-queue overflow on the sample path. Logged at warn, never
    /// surfaced to a command caller.
    #[error("Sample dropped: {0}")]
    SampleDropped(String),

    /// Bounded-queue overflow on the log path.
    #[error("Log event dropped")]
    LogDropped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Unrecoverable internal invariant violation. The log relay flushes,
    /// the PID file is removed and the process exits nonzero.
    #[error("Fatal: {0}")]
    Fatal(String),
}

/// Convenience `Result` alias for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;
