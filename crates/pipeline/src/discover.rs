//! Tests known to the run and their requirements.

use crate::error::{Error, Result};
use crate::phase::{Phase, PhaseData};
use crate::types::Dependency;
use guestkit::Guest;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Duration of tests that do not set one.
pub const DEFAULT_TEST_DURATION: &str = "5m";

/// How a test is run, which decides what the guest needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framework {
    #[default]
    Shell,
    Beakerlib,
    Pytest,
}

impl Framework {
    pub fn essential_requires(&self) -> Vec<Dependency> {
        match self {
            Framework::Shell => Vec::new(),
            Framework::Beakerlib => vec![Dependency::from("beakerlib")],
            Framework::Pytest => vec![Dependency::from("uv")],
        }
    }
}

/// Checks watching a test while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    Avc,
    Dmesg,
    Coredump,
    Watchdog,
}

impl CheckKind {
    pub fn essential_requires(&self) -> Vec<Dependency> {
        match self {
            CheckKind::Avc => vec![Dependency::from("audit"), Dependency::from("policycoreutils")],
            CheckKind::Dmesg | CheckKind::Coredump | CheckKind::Watchdog => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TestCase {
    pub name: String,
    /// Shell command running the test
    pub test: String,
    /// Working directory on the guest
    pub path: Option<PathBuf>,
    pub require: Vec<Dependency>,
    pub recommend: Vec<Dependency>,
    pub framework: Framework,
    pub check: Vec<CheckKind>,
    pub r#where: Vec<String>,
    pub duration: String,
    pub enabled: bool,
}

impl Default for TestCase {
    fn default() -> Self {
        Self {
            name: String::new(),
            test: String::new(),
            path: None,
            require: Vec::new(),
            recommend: Vec::new(),
            framework: Framework::default(),
            check: Vec::new(),
            r#where: Vec::new(),
            duration: DEFAULT_TEST_DURATION.to_string(),
            enabled: true,
        }
    }
}

impl TestCase {
    pub fn new(name: impl Into<String>, test: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            test: test.into(),
            ..Self::default()
        }
    }

    pub fn enabled_on_guest(&self, guest: &dyn Guest) -> bool {
        let role = guest.role();
        self.r#where.is_empty()
            || self
                .r#where
                .iter()
                .any(|target| target == guest.name() || Some(target) == role.as_ref())
    }

    /// Packages the framework and the checks of this test need.
    pub fn essential_requires(&self) -> Vec<Dependency> {
        let mut requires = self.framework.essential_requires();
        for check in &self.check {
            requires.extend(check.essential_requires());
        }
        requires
    }

    pub fn timeout(&self) -> Result<Duration> {
        parse_duration(&self.duration)
    }
}

/// Parse durations like `90`, `5m`, `1h 30m` or `2d`.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let invalid = || Error::Specification(format!("invalid duration '{value}'"));

    let mut total = 0u64;
    let mut parts = value.split_whitespace().peekable();
    if parts.peek().is_none() {
        return Err(invalid());
    }

    for part in parts {
        let (number, multiplier) = match part.char_indices().last() {
            Some((index, 's')) => (&part[..index], 1),
            Some((index, 'm')) => (&part[..index], 60),
            Some((index, 'h')) => (&part[..index], 60 * 60),
            Some((index, 'd')) => (&part[..index], 24 * 60 * 60),
            _ => (part, 1),
        };
        let number: u64 = number.parse().map_err(|_| invalid())?;
        total = total.saturating_add(number.saturating_mul(multiplier));
    }

    Ok(Duration::from_secs(total))
}

/// The discover phase of a plan, holding the tests it found.
#[derive(Debug, Clone)]
pub struct Discover {
    data: PhaseData,
    tests: Vec<TestCase>,
}

impl Discover {
    pub fn new(data: PhaseData, tests: Vec<TestCase>) -> Self {
        Self { data, tests }
    }

    /// Tests, optionally only the enabled ones.
    pub fn tests(&self, enabled_only: bool) -> Vec<&TestCase> {
        self.tests
            .iter()
            .filter(|test| !enabled_only || test.enabled)
            .collect()
    }

    pub fn summary(&self) -> String {
        format!("{} test(s) selected", self.tests(true).len())
    }
}

impl Phase for Discover {
    fn data(&self) -> &PhaseData {
        &self.data
    }
}
