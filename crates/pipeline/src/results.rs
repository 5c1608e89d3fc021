//! Results recorded by prepare, execute and finish phases.

use guestkit::Guest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultOutcome {
    Pass,
    Fail,
    Info,
    Warn,
    Error,
    Skip,
}

impl ResultOutcome {
    pub const ALL: [ResultOutcome; 6] = [
        ResultOutcome::Pass,
        ResultOutcome::Fail,
        ResultOutcome::Info,
        ResultOutcome::Warn,
        ResultOutcome::Error,
        ResultOutcome::Skip,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResultOutcome::Pass => "pass",
            ResultOutcome::Fail => "fail",
            ResultOutcome::Info => "info",
            ResultOutcome::Warn => "warn",
            ResultOutcome::Error => "error",
            ResultOutcome::Skip => "skip",
        }
    }

    /// Whether the outcome makes the overall run unsuccessful.
    pub fn is_failure(&self) -> bool {
        matches!(self, ResultOutcome::Fail | ResultOutcome::Error)
    }
}

impl fmt::Display for ResultOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Guest a result was produced on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultGuest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub name: String,
    pub result: ResultOutcome,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub note: Vec<String>,
    #[serde(default)]
    pub guest: ResultGuest,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log: Vec<PathBuf>,
}

impl PhaseResult {
    pub fn new(name: impl Into<String>, result: ResultOutcome) -> Self {
        Self {
            name: name.into(),
            result,
            note: Vec::new(),
            guest: ResultGuest::default(),
            log: Vec::new(),
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note.push(note.into());
        self
    }

    pub fn with_guest(mut self, guest: &dyn Guest) -> Self {
        self.guest = ResultGuest {
            name: guest.name().to_string(),
            role: guest.role(),
        };
        self
    }

    pub fn with_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.log.push(path.into());
        self
    }
}

/// Count of results per outcome, every outcome present.
pub fn summarize(results: &[PhaseResult]) -> BTreeMap<ResultOutcome, usize> {
    let mut counts: BTreeMap<ResultOutcome, usize> =
        ResultOutcome::ALL.iter().map(|outcome| (*outcome, 0)).collect();
    for result in results {
        *counts.entry(result.result).or_insert(0) += 1;
    }
    counts
}
