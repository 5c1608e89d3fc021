//! Error types for guest operations.
//!
//! Errors are categorized so callers can tell a transient connection problem
//! (worth polling again) from a command that ran and failed.

use std::path::PathBuf;
use thiserror::Error;

/// Categories of guest errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Guest unreachable, often transient
    Connection,
    /// Command executed but exited non-zero
    Run,
    /// Guest could not be set up or used as requested
    Provision,
    /// Malformed guest data
    Specification,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    /// Whether polling again may help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection | Self::Run)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Connection => "Guest connection issue",
            Self::Run => "Command failed on the guest",
            Self::Provision => "Guest provisioning failed",
            Self::Specification => "Invalid guest configuration",
            Self::Other => "Unexpected error",
        }
    }

    pub fn advice(&self) -> &'static str {
        match self {
            Self::Connection => "Check that the guest is running and reachable over the network",
            Self::Run => "Inspect the command output captured with the error",
            Self::Provision => "Check the guest configuration and login credentials",
            Self::Specification => "Fix the guest data in the plan or in guests.yaml",
            Self::Other => "Check the error details for more information",
        }
    }
}

/// Errors that can occur while talking to a guest.
#[derive(Debug, Error)]
pub enum Error {
    /// Command exited with a non-zero code (or was killed)
    #[error("Command '{command}' {}.", describe_exit(.exit_code))]
    Run {
        /// Rendered command line
        command: String,
        /// Exit code, `None` when terminated by a signal
        exit_code: Option<i32>,
        /// Captured standard output
        stdout: String,
        /// Captured standard error
        stderr: String,
    },

    /// Guest cannot be reached
    #[error("connection to guest '{guest}' failed: {message}")]
    Connection {
        /// Guest name
        guest: String,
        /// What went wrong
        message: String,
    },

    /// Requested reboot mode is not implemented by the driver
    #[error("Guest '{guest}' does not support {mode} reboot.")]
    RebootModeNotSupported {
        /// Guest name
        guest: String,
        /// Requested mode
        mode: crate::guest::RebootMode,
    },

    /// Guest setup or file synchronization failed
    #[error("{message}")]
    Provision {
        /// Guidance for the user
        message: String,
    },

    /// Invalid guest data
    #[error("invalid guest data: {message}")]
    Specification {
        /// What is wrong
        message: String,
    },

    /// A local program could not be started
    #[error("failed to execute '{command}': {source}")]
    Spawn {
        /// Rendered command line
        command: String,
        /// Underlying OS error
        source: std::io::Error,
    },

    /// SSH socket directory could not be prepared
    #[error("cannot prepare socket directory {}: {source}", path.display())]
    SocketDir {
        /// Socket directory
        path: PathBuf,
        /// Underlying OS error
        source: std::io::Error,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

fn describe_exit(exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("returned {code}"),
        None => "was terminated by a signal".to_string(),
    }
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Run { .. } => ErrorCategory::Run,
            Error::Connection { .. } => ErrorCategory::Connection,
            Error::RebootModeNotSupported { .. } | Error::Provision { .. } => {
                ErrorCategory::Provision
            }
            Error::Specification { .. } => ErrorCategory::Specification,
            _ => ErrorCategory::Other,
        }
    }

    /// Whether polling again may help.
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    /// Exit code of a failed command, if this is a run error.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Error::Run { exit_code, .. } => *exit_code,
            _ => None,
        }
    }

    /// Build a run error from a finished process.
    pub fn run(
        command: impl Into<String>,
        exit_code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) -> Self {
        Error::Run {
            command: command.into(),
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }
}

/// Result type for guest operations.
pub type Result<T> = std::result::Result<T, Error>;
