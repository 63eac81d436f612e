//! Error types for procgroup.
//!
//! Local failures (an unknown information kind, a missing gather target) are
//! reported to the caller on the process that hit them. Nothing in this enum
//! is ever sent to another process: cross-process signaling only happens
//! through the protocol frames themselves.

use thiserror::Error;

use crate::stream::ObjectId;
use crate::transport::Rank;

/// Main error type for the process group core.
#[derive(Debug, Error)]
pub enum ProcessError {
    // Startup errors
    #[error("Process group startup failed: {message}")]
    Startup { message: String },

    // Transport errors
    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Transport channel closed")]
    ChannelClosed,

    #[error("Rank {rank} is outside of a group of {size}")]
    InvalidRank { rank: Rank, size: usize },

    #[error("Frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Decode error: {message}")]
    Decode { message: String },

    // Information gathering errors
    #[error("Could not create information object {kind}")]
    UnknownInformationKind { kind: String },

    #[error("No object with id {object}")]
    NullTarget { object: ObjectId },

    #[error("Information kind mismatch: expected {expected}, got {actual}")]
    InformationMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    // Execution errors
    #[error("Interpreter error: {message}")]
    Interpreter { message: String },

    #[error("Operation is only available on the controller process")]
    NotController,

    // Request and configuration errors
    #[error("Method not found: {method}")]
    UnknownMethod { method: String },

    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Controller returned error {code}: {message}")]
    Rpc { code: i32, message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for process group operations.
pub type Result<T> = std::result::Result<T, ProcessError>;

impl From<std::io::Error> for ProcessError {
    fn from(err: std::io::Error) -> Self {
        ProcessError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ProcessError {
    fn from(err: serde_json::Error) -> Self {
        ProcessError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl ProcessError {
    /// Create a transport error from any displayable cause.
    pub fn transport(message: impl Into<String>) -> Self {
        ProcessError::Transport {
            message: message.into(),
        }
    }

    /// Create an interpreter error from any displayable cause.
    pub fn interpreter(message: impl Into<String>) -> Self {
        ProcessError::Interpreter {
            message: message.into(),
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Standard JSON-RPC error codes:
    /// - -32601: Method not found
    /// - -32602: Invalid params
    /// - -32603: Internal error
    ///
    /// Custom error codes (application-defined, -32000 to -32099):
    /// - -32000: Transport/connectivity error
    /// - -32001: Unknown information kind
    /// - -32002: Gather target not found
    /// - -32003: Command execution failed
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            ProcessError::Startup { .. }
            | ProcessError::Transport { .. }
            | ProcessError::ChannelClosed
            | ProcessError::InvalidRank { .. }
            | ProcessError::FrameTooLarge { .. } => -32000,

            ProcessError::UnknownInformationKind { .. } => -32001,

            ProcessError::NullTarget { .. } => -32002,

            ProcessError::Interpreter { .. } | ProcessError::Decode { .. } => -32003,

            ProcessError::UnknownMethod { .. } => -32601,

            ProcessError::Rpc { code, .. } => *code,

            ProcessError::InvalidParams { .. } => -32602,

            // All other errors are internal errors
            _ => -32603,
        }
    }

    /// Whether this error leaves the group unusable.
    ///
    /// Local errors (bad kind, bad target, a failed command) leave every
    /// process in a consistent state; transport errors do not.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProcessError::Startup { .. }
                | ProcessError::Transport { .. }
                | ProcessError::ChannelClosed
                | ProcessError::Io { .. }
        )
    }
}
