use super::run_script;
use guestkit::GuestRef;
use logkit::Logger;
use pipeline::{Error, FinishPlugin, Flow, Phase, PhaseData, Result};

/// Run shell scripts on every guest before it is stopped.
pub struct FinishShell {
    data: PhaseData,
    scripts: Vec<String>,
}

impl FinishShell {
    pub fn new(data: PhaseData) -> Result<Self> {
        let scripts = data.option_strings("script");
        if scripts.is_empty() {
            return Err(Error::Specification(format!(
                "finish phase '{}' has no 'script'",
                data.name
            )));
        }
        Ok(Self { data, scripts })
    }
}

impl Phase for FinishShell {
    fn data(&self) -> &PhaseData {
        &self.data
    }
}

impl FinishPlugin for FinishShell {
    fn go(&self, guest: &GuestRef, logger: &Logger) -> Result<Flow<()>> {
        for script in &self.scripts {
            run_script(guest, script, logger)?;
        }
        Ok(Flow::Done(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guestkit::MockGuest;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_scripts_run_in_order() {
        let mock = Arc::new(MockGuest::new("a"));
        let guest: GuestRef = mock.clone();
        let plugin = FinishShell::new(
            PhaseData::new("collect", "shell").with_option("script", json!(["journalctl -b", "sync"])),
        )
        .unwrap();

        plugin.go(&guest, &Logger::new("a")).unwrap();
        assert_eq!(mock.executed(), vec!["journalctl -b", "sync"]);
    }

    #[test]
    fn test_failing_script_fails_the_phase() {
        let guest: GuestRef = Arc::new(MockGuest::new("a").fail("false", 1));
        let plugin =
            FinishShell::new(PhaseData::new("collect", "shell").with_option("script", json!("false")))
                .unwrap();
        let err = plugin.go(&guest, &Logger::new("a")).unwrap_err();
        assert_eq!(err.to_string(), "Command 'false' returned 1.");
    }
}
