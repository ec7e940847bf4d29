//! Error types for the runner daemon.

use std::time::Duration;

/// Top-level error type for the runner.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Container engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid label {label:?}: {reason}")]
    InvalidLabel { label: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transport-level failures on the connection to the coordination server.
///
/// All of these are recoverable from the daemon's point of view except
/// `Stalled`, which is only surfaced when the stall policy is `exit`.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("Connecting to {endpoint} timed out after {timeout:?}")]
    ConnectTimeout { endpoint: String, timeout: Duration },

    #[error("Not connected")]
    NotConnected,

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Connection reset without closing handshake")]
    Reset,

    #[error("IO error: {0}")]
    Io(String),

    #[error("Session stalled after {failures} consecutive read failures")]
    Stalled { failures: u32 },
}

/// Protocol errors: the message could not be understood or acted upon.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Received a message with unsupported version {version}, consider upgrading your runner")]
    UnsupportedVersion { version: i64 },

    #[error("Received a message with unsupported type {code}")]
    UnsupportedType { code: i64 },

    #[error("Received an unexpected inbound {kind} message")]
    UnexpectedType { kind: String },

    #[error("Unknown event {event} with payload {payload}")]
    UnknownEvent { event: String, payload: String },
}

/// Errors raised while running a single task.
///
/// These never escape the task: the supervisor turns them into an outcome.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Runner at capacity ({capacity} tasks in flight)")]
    CapacityExhausted { capacity: usize },

    /// Failure reported by the workload itself; displayed verbatim.
    #[error("{0}")]
    Failed(String),

    #[error("Task cancelled")]
    Cancelled,

    #[error("Failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Container engine errors (fatal at startup).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Unsupported container engine host: {0}")]
    UnsupportedHost(String),

    #[error("Container engine at {endpoint} is unreachable: {reason}")]
    Unreachable { endpoint: String, reason: String },
}

/// Result type alias for the runner.
pub type Result<T> = std::result::Result<T, Error>;
