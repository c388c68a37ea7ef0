//! Error types for rootgate

use std::path::PathBuf;

use thiserror::Error;

/// rootgate error types
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid option or option combination, detected before anything is launched
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Error message
        message: String,
    },

    /// State directory could not be created, locked or written
    #[error("State directory {}: {message}", path.display())]
    StateDir {
        /// Offending path
        path: PathBuf,
        /// Error message
        message: String,
    },

    /// A backend executable could not be found
    #[error("Executable not found: {name}")]
    BinaryNotFound {
        /// Name or path that was looked up
        name: String,
    },

    /// Namespace operation failed
    #[error("Namespace error: {message}")]
    Namespace {
        /// Error message
        message: String,
    },

    /// Network driver failure
    #[error("Network driver {driver}: {message}")]
    Network {
        /// Driver name
        driver: &'static str,
        /// Error message
        message: String,
    },

    /// Port driver failure
    #[error("Port driver {driver}: {message}")]
    Port {
        /// Driver name
        driver: &'static str,
        /// Error message
        message: String,
    },

    /// Listening socket could not be established
    #[error("Cannot listen on {addr}: {source}")]
    Bind {
        /// Requested address
        addr: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// A mapping already claims the same protocol and host address
    #[error("Port conflict: {spec} overlaps with port {existing}")]
    PortConflict {
        /// Rejected request
        spec: String,
        /// Id of the mapping that owns the address
        existing: u64,
    },

    /// Unknown port id
    #[error("Port not found: {id}")]
    PortNotFound {
        /// Requested id
        id: u64,
    },

    /// Copy-up of a path failed
    #[error("Failed to copy-up {}: {message}", path.display())]
    CopyUp {
        /// Path that could not be copied up
        path: PathBuf,
        /// Error message
        message: String,
    },

    /// The peer closed the control channel before an expected message
    #[error("Control channel desynchronized: {message}")]
    Desync {
        /// Error message
        message: String,
    },

    /// Malformed or unexpected handshake payload
    #[error("Handshake error: {message}")]
    Handshake {
        /// Error message
        message: String,
    },

    /// The child reported a failure of its own setup
    #[error("Child setup failed: {message}")]
    ChildSetupFailed {
        /// Message sent by the child
        message: String,
    },

    /// The target command could not be executed
    #[error("{message}")]
    ExecFailed {
        /// Human-readable reason
        message: String,
        /// Exit code reported for the failure (126 or 127)
        code: i32,
    },

    /// The operation was cancelled by the caller
    #[error("Cancelled")]
    Cancelled,

    /// System error from nix
    #[error("System error: {0}")]
    System(#[from] nix::Error),

    /// JSON encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Task join error
    #[error("Task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl Error {
    /// Shorthand for [`Error::InvalidConfig`]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Shorthand for [`Error::Desync`]
    pub fn desync(message: impl Into<String>) -> Self {
        Self::Desync {
            message: message.into(),
        }
    }

    /// Shorthand for [`Error::Handshake`]
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::Handshake {
            message: message.into(),
        }
    }

    /// Exit code a session ending with this error reports
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::ExecFailed { code, .. } => *code,
            _ => crate::process::EXIT_BOOTSTRAP_FAILURE,
        }
    }

    /// Short machine-readable kind, used on the port control socket
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::PortConflict { .. } => "conflict",
            Self::PortNotFound { .. } => "not_found",
            Self::InvalidConfig { .. } => "invalid",
            _ => "internal",
        }
    }
}

/// Result type alias for rootgate operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind() {
        assert_eq!(Error::PortNotFound { id: 3 }.kind(), "not_found");
        assert_eq!(
            Error::PortConflict {
                spec: "tcp".into(),
                existing: 1
            }
            .kind(),
            "conflict"
        );
        assert_eq!(Error::invalid_config("x").kind(), "invalid");
        assert_eq!(Error::desync("gone").kind(), "internal");
    }

    #[test]
    fn test_exit_code() {
        let exec = Error::ExecFailed {
            message: "cannot execute nope: No such file or directory".into(),
            code: 127,
        };
        assert_eq!(exec.exit_code(), 127);
        assert_eq!(Error::Cancelled.exit_code(), 125);
    }

    #[test]
    fn test_state_dir_message_names_path() {
        let err = Error::StateDir {
            path: PathBuf::from("/run/user/1000/rootgate"),
            message: "not writable".into(),
        };
        assert!(err.to_string().contains("/run/user/1000/rootgate"));
    }
}
