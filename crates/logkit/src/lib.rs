//! # logkit
//!
//! An explicit logger capability handed to every step, phase and worker thread.
//!
//! There is no ambient or thread-local logging context: whoever needs to log
//! receives a [`Logger`] value, and concurrent workers each get their own
//! labelled clone so interleaved lines remain attributable.
//!
//! ## Quick Start
//!
//! ```no_run
//! use logkit::Logger;
//!
//! let logger = Logger::new("provision").with_verbosity(1);
//! logger.info("how", "local");
//!
//! let phase = logger.descend("default-0");
//! phase.verbose("primary address", "127.0.0.1", 1);
//! phase.debug("Synced facts.", 1);
//! ```
//!
//! ## Output
//!
//! Every line is emitted through the `log` facade with the `testrun` target.
//! Indentation grows with each [`Logger::descend`], and an optional `[label]`
//! prefix is rendered in front of the message.

use colored::{Color, Colorize};
use std::collections::BTreeMap;
use std::fmt::Display;

/// Target used for all records emitted by [`Logger`].
pub const LOG_TARGET: &str = "testrun";

const INDENT: &str = "    ";

/// Hierarchical logger passed explicitly to workers.
#[derive(Debug, Clone, Default)]
pub struct Logger {
    names: Vec<String>,
    indent: usize,
    verbosity: u8,
    debug_level: u8,
    label: Option<String>,
}

impl Logger {
    /// Create a root logger named after a step or component.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            names: vec![name.into()],
            ..Self::default()
        }
    }

    /// Set how many `verbose` levels are shown.
    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Set how many `debug` levels are shown.
    pub fn with_debug_level(mut self, debug_level: u8) -> Self {
        self.debug_level = debug_level;
        self
    }

    /// Create a child logger one indentation level deeper.
    pub fn descend(&self, name: impl Into<String>) -> Self {
        let mut child = self.clone();
        child.names.push(name.into());
        child.indent += 1;
        child
    }

    /// Clone this logger with a `[label]` prefix.
    pub fn clone_with_label(&self, label: impl Into<String>) -> Self {
        let mut child = self.clone();
        child.label = Some(label.into());
        child
    }

    /// Dotted name chain, e.g. `provision.default-0`.
    pub fn name(&self) -> String {
        self.names.join(".")
    }

    /// Current label, if any.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn verbosity(&self) -> u8 {
        self.verbosity
    }

    pub fn debug_level(&self) -> u8 {
        self.debug_level
    }

    fn render(&self, key: &str, value: Option<&str>, color: Option<Color>) -> String {
        let mut line = INDENT.repeat(self.indent);
        if let Some(label) = &self.label {
            line.push_str(&format!("[{label}] ").cyan().to_string());
        }
        match value {
            Some(value) => {
                let value = match color {
                    Some(color) => value.color(color).to_string(),
                    None => value.to_string(),
                };
                line.push_str(&format!("{}: {}", key.green(), value));
            }
            None => line.push_str(key),
        }
        line
    }

    /// Log a key/value pair at the info level.
    pub fn info(&self, key: &str, value: impl Display) {
        let line = self.render(key, Some(&value.to_string()), None);
        log::info!(target: LOG_TARGET, "{line}");
    }

    /// Log a key/value pair with a colored value.
    pub fn info_colored(&self, key: &str, value: impl Display, color: Color) {
        let line = self.render(key, Some(&value.to_string()), Some(color));
        log::info!(target: LOG_TARGET, "{line}");
    }

    /// Log a key/value pair shown only when verbosity reaches `level`.
    pub fn verbose(&self, key: &str, value: impl Display, level: u8) {
        if self.verbosity < level {
            return;
        }
        let line = self.render(key, Some(&value.to_string()), None);
        log::info!(target: LOG_TARGET, "{line}");
    }

    /// Log a free-form message shown only when the debug level reaches `level`.
    pub fn debug(&self, message: impl Display, level: u8) {
        if self.debug_level < level {
            return;
        }
        let line = self.render(&message.to_string(), None, None);
        log::debug!(target: LOG_TARGET, "{}", line.dimmed());
    }

    /// Print a plain line, indented and labelled.
    pub fn print(&self, text: impl Display) {
        let line = self.render(&text.to_string(), None, None);
        log::info!(target: LOG_TARGET, "{line}");
    }

    pub fn warn(&self, message: impl Display) {
        let line = self.render("warn", Some(&message.to_string()), Some(Color::Yellow));
        log::warn!(target: LOG_TARGET, "{line}");
    }

    pub fn fail(&self, message: impl Display) {
        let line = self.render("fail", Some(&message.to_string()), Some(Color::Red));
        log::error!(target: LOG_TARGET, "{line}");
    }
}

/// Build one labelled logger per label, padding labels to a common width.
///
/// Used when several guests or phases run concurrently so their lines line up.
pub fn prepare_loggers<S: AsRef<str>>(base: &Logger, labels: &[S]) -> BTreeMap<String, Logger> {
    let width = labels
        .iter()
        .map(|label| label.as_ref().chars().count())
        .max()
        .unwrap_or(0);

    labels
        .iter()
        .map(|label| {
            let label = label.as_ref();
            let padded = format!("{label:<width$}");
            (label.to_string(), base.clone_with_label(padded))
        })
        .collect()
}
