//! Error types for remote session operations
//!
//! Every variant that refers to a connection carries the masked URI only;
//! the raw descriptor (with its secret) never reaches an error message.

use thiserror::Error;

use crate::ssh::transport::ChannelKind;

/// Main error type for remote session operations
#[derive(Debug, Error)]
pub enum RemoteError {
    /// No password in the descriptor and no private key file could be found
    #[error("No credentials for {uri}: no password given and key file '{key_name}' not found")]
    CredentialsUnspecified { uri: String, key_name: String },

    /// Transport-level connect or authentication failure (or timeout)
    #[error("Cannot create session for {uri}: {reason}")]
    SessionInstantiation { uri: String, reason: String },

    /// The remote side rejected the channel
    #[error("Cannot create {kind} channel for {uri}: {reason}")]
    ChannelInstantiation {
        kind: ChannelKind,
        uri: String,
        reason: String,
    },

    /// Remote task finished with a non-zero exit status
    #[error("Exit status {} for {}{}", .exit_status, .masked_uri, output_hint(.output))]
    ExecutionFailed {
        exit_status: i32,
        masked_uri: String,
        output: String,
    },

    /// A channel input/output stream could not be obtained
    #[error("Stream acquisition failed: {0}")]
    StreamAcquisition(String),

    /// Byte copy failed while uploading
    #[error("Cannot upload file to {uri}: {source}")]
    Upload {
        uri: String,
        #[source]
        source: std::io::Error,
    },

    /// Byte copy failed while downloading
    #[error("Cannot download file from {uri}: {source}")]
    Download {
        uri: String,
        #[source]
        source: std::io::Error,
    },

    /// Invalid arguments provided
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Connection descriptor could not be parsed
    #[error("Invalid connection descriptor: {0}")]
    InvalidDescriptor(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON report could not be produced
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using RemoteError
pub type Result<T> = std::result::Result<T, RemoteError>;

fn output_hint(output: &str) -> &'static str {
    if output.is_empty() {
        ""
    } else {
        " => check task output for details"
    }
}

impl RemoteError {
    /// Create an invalid argument error from a string
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        RemoteError::InvalidArgument(msg.into())
    }

    /// Create an invalid descriptor error from a string
    pub fn invalid_descriptor(msg: impl Into<String>) -> Self {
        RemoteError::InvalidDescriptor(msg.into())
    }

    /// Create a stream acquisition error from a string
    pub fn stream(msg: impl Into<String>) -> Self {
        RemoteError::StreamAcquisition(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        RemoteError::Config(msg.into())
    }

    /// Exit status of a failed remote task, if this is an execution failure
    pub fn exit_status(&self) -> Option<i32> {
        match self {
            RemoteError::ExecutionFailed { exit_status, .. } => Some(*exit_status),
            _ => None,
        }
    }

    /// Output captured from a failed remote task, if this is an execution failure
    pub fn task_output(&self) -> Option<&str> {
        match self {
            RemoteError::ExecutionFailed { output, .. } => Some(output),
            _ => None,
        }
    }
}
