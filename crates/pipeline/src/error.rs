//! Error types for step and phase execution.
//!
//! Failures of individual phases are contained in task outcomes; a step turns
//! them into a single [`Error::StepFailed`] only after every batch ran, so no
//! cause is ever dropped.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Categories of pipeline errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Guest unreachable
    Connection,
    /// A command failed on a guest
    Run,
    /// A step failed as a whole
    Step,
    /// Malformed plan data, never retried
    Specification,
    /// The run was interrupted
    Interrupted,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Connection => "Guest connection issue",
            Self::Run => "Command failed on a guest",
            Self::Step => "Step failed",
            Self::Specification => "Invalid plan",
            Self::Interrupted => "Interrupted",
            Self::Other => "Unexpected error",
        }
    }

    pub fn advice(&self) -> &'static str {
        match self {
            Self::Connection => "Check that the guests are running and reachable",
            Self::Run => "Inspect the command output in the step log",
            Self::Step => "Review every listed cause, each phase failure is reported",
            Self::Specification => "Fix the plan file and run again",
            Self::Interrupted => "Run the plan again to continue, provisioned guests were kept",
            Self::Other => "Check the error details for more information",
        }
    }
}

/// Errors raised by steps, phases and the queue.
#[derive(Debug, Error)]
pub enum Error {
    /// Aggregate failure of a step, carrying every underlying error
    #[error("{step} step failed{}", Causes(.causes))]
    StepFailed {
        /// Step name
        step: String,
        /// Every error that caused the failure
        causes: Vec<Error>,
    },

    /// Plan metadata does not make sense at runtime
    #[error("{0}")]
    Metadata(String),

    /// Malformed plan data
    #[error("invalid plan: {0}")]
    Specification(String),

    /// Interrupted by the user, with the guests known at that moment
    #[error("interrupted, {} guest(s) known", guests.len())]
    Interrupted {
        /// Names of guests provisioned before the interruption
        guests: Vec<String>,
    },

    /// A phase panicked instead of returning
    #[error("phase '{phase}' panicked: {message}")]
    PhasePanicked {
        /// Phase name
        phase: String,
        /// Panic payload, when printable
        message: String,
    },

    /// Guest operation failed
    #[error(transparent)]
    Guest(#[from] guestkit::Error),

    /// Step workdir could not be read or written
    #[error("cannot access {}: {source}", path.display())]
    Workdir {
        /// File or directory
        path: PathBuf,
        /// Underlying OS error
        source: std::io::Error,
    },

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

struct Causes<'a>(&'a Vec<Error>);

impl fmt::Display for Causes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, cause) in self.0.iter().enumerate() {
            write!(f, "\n  cause {}: {cause}", index + 1)?;
        }
        Ok(())
    }
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::StepFailed { .. } => ErrorCategory::Step,
            Error::Metadata(_) | Error::Specification(_) => ErrorCategory::Specification,
            Error::Interrupted { .. } => ErrorCategory::Interrupted,
            Error::Guest(e) => match e.category() {
                guestkit::ErrorCategory::Connection => ErrorCategory::Connection,
                guestkit::ErrorCategory::Run => ErrorCategory::Run,
                guestkit::ErrorCategory::Specification => ErrorCategory::Specification,
                _ => ErrorCategory::Other,
            },
            _ => ErrorCategory::Other,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    pub fn step_failed(step: impl Into<String>, causes: Vec<Error>) -> Self {
        Error::StepFailed {
            step: step.into(),
            causes,
        }
    }

    /// Underlying causes of an aggregate failure.
    pub fn causes(&self) -> &[Error] {
        match self {
            Error::StepFailed { causes, .. } => causes,
            _ => &[],
        }
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_failed_lists_every_cause() {
        let err = Error::step_failed(
            "provision",
            vec![
                Error::Other("guest one failed".to_string()),
                Error::Other("guest two failed".to_string()),
            ],
        );

        assert_eq!(
            err.to_string(),
            "provision step failed\n  cause 1: guest one failed\n  cause 2: guest two failed"
        );
        assert_eq!(err.causes().len(), 2);
        assert_eq!(err.category(), ErrorCategory::Step);
    }

    #[test]
    fn test_step_failed_without_causes() {
        let err = Error::step_failed("push", Vec::new());
        assert_eq!(err.to_string(), "push step failed");
    }

    #[test]
    fn test_guest_error_category() {
        let err: Error = guestkit::Error::Connection {
            guest: "g".to_string(),
            message: "refused".to_string(),
        }
        .into();
        assert_eq!(err.category(), ErrorCategory::Connection);
        assert!(err.is_retryable());
    }
}
