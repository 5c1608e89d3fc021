//! Prepare plugins: `install` packages, run `shell` scripts.

use super::run_script;
use guestkit::{ExecuteOptions, GuestRef};
use logkit::Logger;
use pipeline::{
    Error, Flow, Phase, PhaseData, PhaseResult, PluginOutcome, PreparePlugin, Result, ResultOutcome,
};

/// Outcome of a phase that ran a command and either passed or failed.
fn outcome(name: &str, guest: &GuestRef, result: guestkit::Result<()>) -> Result<Flow<PluginOutcome>> {
    match result {
        Ok(()) => Ok(Flow::Done(PluginOutcome::default().with_result(
            PhaseResult::new(name, ResultOutcome::Pass).with_guest(guest.as_ref()),
        ))),
        Err(e @ guestkit::Error::Run { .. }) => Ok(Flow::Done(
            PluginOutcome::default()
                .with_result(
                    PhaseResult::new(name, ResultOutcome::Fail)
                        .with_note(e.to_string())
                        .with_guest(guest.as_ref()),
                )
                .with_exception(e.into()),
        )),
        Err(e) => Err(e.into()),
    }
}

/// Install packages with the guest's package manager.
pub struct PrepareInstall {
    data: PhaseData,
}

impl PrepareInstall {
    pub fn new(data: PhaseData) -> Self {
        Self { data }
    }

    fn packages(&self) -> Vec<String> {
        self.data.option_strings("package")
    }

    fn skip_missing(&self) -> bool {
        self.data.option_str("missing") == Some("skip")
    }
}

impl Phase for PrepareInstall {
    fn data(&self) -> &PhaseData {
        &self.data
    }
}

impl PreparePlugin for PrepareInstall {
    fn go(&self, guest: &GuestRef, logger: &Logger) -> Result<Flow<PluginOutcome>> {
        let packages = self.packages();
        if packages.is_empty() {
            return Ok(Flow::Done(PluginOutcome::default()));
        }

        let facts = guest.facts();
        let manager = facts.package_manager.ok_or_else(|| guestkit::Error::Provision {
            message: format!("No package manager detected on guest '{}'.", guest.name()),
        })?;
        let sudo = guest.data().r#become && facts.is_superuser != Some(true);

        logger.info("package", packages.join(", "));
        logger.verbose("package manager", manager, 1);
        let command = manager.install_command(packages.as_slice(), self.skip_missing(), sudo);
        logger.debug(format!("Install command: {command}"), 2);

        let result = guest
            .execute(&command, &ExecuteOptions::default())
            .map(|_| ());
        outcome(self.name(), guest, result)
    }
}

/// Run shell scripts on the guest, stopping at the first failure.
pub struct PrepareShell {
    data: PhaseData,
    scripts: Vec<String>,
}

impl PrepareShell {
    pub fn new(data: PhaseData) -> Result<Self> {
        let scripts = data.option_strings("script");
        if scripts.is_empty() {
            return Err(Error::Specification(format!(
                "prepare phase '{}' has no 'script'",
                data.name
            )));
        }
        Ok(Self { data, scripts })
    }
}

impl Phase for PrepareShell {
    fn data(&self) -> &PhaseData {
        &self.data
    }
}

impl PreparePlugin for PrepareShell {
    fn go(&self, guest: &GuestRef, logger: &Logger) -> Result<Flow<PluginOutcome>> {
        let result = self
            .scripts
            .iter()
            .try_for_each(|script| run_script(guest, script, logger).map(|_| ()));
        outcome(self.name(), guest, result)
    }
}
