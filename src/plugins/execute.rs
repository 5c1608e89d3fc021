//! The `shell` execute plugin: run each test command on the guest.

use guestkit::command::TIMEOUT_EXIT_CODE;
use guestkit::{Command, ErrorCategory, ExecuteOptions, GuestRef};
use logkit::Logger;
use pipeline::{
    Dependency, ExecutePlugin, Flow, Phase, PhaseData, PhaseResult, Result, ResultOutcome, TestCase,
};

pub struct ExecuteShell {
    data: PhaseData,
}

impl ExecuteShell {
    pub fn new(data: PhaseData) -> Self {
        Self { data }
    }

    /// Stop after the first test that does not pass.
    fn exit_first(&self) -> bool {
        self.data.option_bool("exit-first").unwrap_or(false)
    }

    fn run_test(&self, guest: &GuestRef, test: &TestCase, logger: &Logger) -> Result<PhaseResult> {
        let mut options = ExecuteOptions::default().with_timeout(test.timeout()?);
        if let Some(path) = &test.path {
            options = options.with_cwd(path);
        }

        logger.verbose("test", &test.name, 1);
        let result = match guest.execute(&Command::shell(&test.test), &options) {
            Ok(output) => {
                for line in output.stdout.lines() {
                    logger.verbose("out", line, 3);
                }
                PhaseResult::new(&test.name, ResultOutcome::Pass)
            }
            Err(e) if e.exit_code() == Some(TIMEOUT_EXIT_CODE) => {
                PhaseResult::new(&test.name, ResultOutcome::Fail)
                    .with_note(format!("timeout after {}", test.duration))
            }
            Err(e) => match e.category() {
                ErrorCategory::Run => PhaseResult::new(&test.name, ResultOutcome::Fail)
                    .with_note(e.to_string()),
                ErrorCategory::Connection => PhaseResult::new(&test.name, ResultOutcome::Error)
                    .with_note(e.to_string()),
                _ => return Err(e.into()),
            },
        };
        Ok(result.with_guest(guest.as_ref()))
    }
}

impl Phase for ExecuteShell {
    fn data(&self) -> &PhaseData {
        &self.data
    }

    /// Tests run as bash scripts.
    fn essential_requires(&self) -> Vec<Dependency> {
        vec![Dependency::from("/bin/bash")]
    }
}

impl ExecutePlugin for ExecuteShell {
    fn go(&self, guest: &GuestRef, tests: &[TestCase], logger: &Logger) -> Result<Flow<Vec<PhaseResult>>> {
        let mut results = Vec::with_capacity(tests.len());
        for test in tests {
            let result = self.run_test(guest, test, logger)?;
            let passed = result.result == ResultOutcome::Pass;
            results.push(result);
            if !passed && self.exit_first() {
                logger.warn("Stopping after the first failing test.");
                break;
            }
        }
        Ok(Flow::Done(results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guestkit::MockGuest;
    use serde_json::json;
    use std::sync::Arc;

    fn tests() -> Vec<TestCase> {
        vec![
            TestCase::new("/pass", "true"),
            TestCase::new("/fail", "exit 1"),
            TestCase::new("/slow", "sleep 600"),
        ]
    }

    fn outcomes(results: &[PhaseResult]) -> Vec<(&str, ResultOutcome)> {
        results.iter().map(|r| (r.name.as_str(), r.result)).collect()
    }

    #[test]
    fn test_outcome_per_test() {
        let guest: GuestRef = Arc::new(
            MockGuest::new("a")
                .fail("exit 1", 1)
                .fail("sleep 600", TIMEOUT_EXIT_CODE),
        );
        let plugin = ExecuteShell::new(PhaseData::new("default-0", "shell"));

        let Flow::Done(results) = plugin.go(&guest, &tests(), &Logger::new("a")).unwrap() else {
            panic!("unexpected exit");
        };
        assert_eq!(
            outcomes(&results),
            vec![
                ("/pass", ResultOutcome::Pass),
                ("/fail", ResultOutcome::Fail),
                ("/slow", ResultOutcome::Fail),
            ]
        );
        assert_eq!(results[2].note, vec!["timeout after 5m"]);
        assert!(results.iter().all(|r| r.guest.name == "a"));
    }

    #[test]
    fn test_exit_first() {
        let mock = Arc::new(MockGuest::new("a").fail("exit 1", 1));
        let guest: GuestRef = mock.clone();
        let plugin = ExecuteShell::new(
            PhaseData::new("default-0", "shell").with_option("exit-first", json!(true)),
        );

        let Flow::Done(results) = plugin.go(&guest, &tests(), &Logger::new("a")).unwrap() else {
            panic!("unexpected exit");
        };
        assert_eq!(results.len(), 2);
        assert_eq!(mock.count_executed("sleep 600"), 0);
    }

    #[test]
    fn test_requires_bash() {
        let plugin = ExecuteShell::new(PhaseData::new("default-0", "shell"));
        assert_eq!(plugin.essential_requires(), vec![Dependency::from("/bin/bash")]);
    }

    #[test]
    fn test_invalid_duration_is_an_error() {
        let guest: GuestRef = Arc::new(MockGuest::new("a"));
        let mut test = TestCase::new("/broken", "true");
        test.duration = "soon".to_string();

        let plugin = ExecuteShell::new(PhaseData::new("default-0", "shell"));
        assert!(plugin.go(&guest, &[test], &Logger::new("a")).is_err());
    }
}
