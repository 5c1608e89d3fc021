//! Small value types shared by every step.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Plan context used to evaluate `when` rules, e.g. `distro = fedora`.
pub type Context = BTreeMap<String, String>;

/// A deliberate request to stop the whole run, e.g. after listing images.
///
/// Not an error: the binary exits with `code` without reporting a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitRequest {
    pub code: i32,
    pub reason: String,
}

impl ExitRequest {
    pub fn new(code: i32, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// Value of a phase that either finished or asked the run to stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow<T> {
    Done(T),
    Exit(ExitRequest),
}

impl<T> Flow<T> {
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Flow<U> {
        match self {
            Flow::Done(value) => Flow::Done(f(value)),
            Flow::Exit(request) => Flow::Exit(request),
        }
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, Flow::Exit(_))
    }
}

/// What a step's `go` reports when it did not fail.
pub type StepOutcome = Flow<()>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Todo,
    Done,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Todo => write!(f, "todo"),
            StepStatus::Done => write!(f, "done"),
        }
    }
}

/// A package the guest needs, by name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dependency(pub String);

impl Dependency {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Dependency {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}
