//! Plugins available in plan files, keyed by step and `how`.

pub mod execute;
pub mod finish;
pub mod prepare;
pub mod provision;
pub mod report;

use execute::ExecuteShell;
use finish::FinishShell;
use guestkit::{Command, CommandOutput, ExecuteOptions, GuestRef, SshConfig};
use logkit::Logger;
use pipeline::{
    ExecutePlugin, FinishPlugin, PluginRegistry, PreparePlugin, ProvisionPlugin, ReportPlugin,
};
use prepare::{PrepareInstall, PrepareShell};
use provision::{ProvisionConnect, ProvisionLocal};
use report::{ReportDisplay, ReportJson};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// One plugin registry per step.
pub struct Registries {
    pub provision: Arc<PluginRegistry<dyn ProvisionPlugin>>,
    pub prepare: Arc<PluginRegistry<dyn PreparePlugin>>,
    pub execute: Arc<PluginRegistry<dyn ExecutePlugin>>,
    pub finish: Arc<PluginRegistry<dyn FinishPlugin>>,
    pub report: Arc<PluginRegistry<dyn ReportPlugin>>,
}

impl Registries {
    pub fn new(run_workdir: &Path, ssh: SshConfig) -> Self {
        let mut provision: PluginRegistry<dyn ProvisionPlugin> = PluginRegistry::new("provision");
        provision.register("local", |data| {
            Ok(Arc::new(ProvisionLocal::new(data)) as Arc<dyn ProvisionPlugin>)
        });
        provision.register("connect", move |data| {
            Ok(Arc::new(ProvisionConnect::new(data, ssh.clone())?) as Arc<dyn ProvisionPlugin>)
        });

        let mut prepare: PluginRegistry<dyn PreparePlugin> = PluginRegistry::new("prepare");
        prepare.register(pipeline::prepare::INSTALL_HOW, |data| {
            Ok(Arc::new(PrepareInstall::new(data)) as Arc<dyn PreparePlugin>)
        });
        prepare.register("shell", |data| {
            Ok(Arc::new(PrepareShell::new(data)?) as Arc<dyn PreparePlugin>)
        });

        let mut execute: PluginRegistry<dyn ExecutePlugin> = PluginRegistry::new("execute");
        execute.register("shell", |data| {
            Ok(Arc::new(ExecuteShell::new(data)) as Arc<dyn ExecutePlugin>)
        });

        let mut finish: PluginRegistry<dyn FinishPlugin> = PluginRegistry::new("finish");
        finish.register("shell", |data| {
            Ok(Arc::new(FinishShell::new(data)?) as Arc<dyn FinishPlugin>)
        });

        let mut report: PluginRegistry<dyn ReportPlugin> = PluginRegistry::new("report");
        report.register("display", |data| {
            Ok(Arc::new(ReportDisplay::new(data)) as Arc<dyn ReportPlugin>)
        });
        let default_json = run_workdir.join("report").join("results.json");
        report.register("json", move |data| {
            Ok(Arc::new(ReportJson::new(data, &default_json)) as Arc<dyn ReportPlugin>)
        });

        Self {
            provision: Arc::new(provision),
            prepare: Arc::new(prepare),
            execute: Arc::new(execute),
            finish: Arc::new(finish),
            report: Arc::new(report),
        }
    }
}

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Run one shell script on the guest, logging its output.
pub(crate) fn run_script(guest: &GuestRef, script: &str, logger: &Logger) -> guestkit::Result<CommandOutput> {
    logger.info("script", script);
    let output = guest.execute(&Command::shell(script), &ExecuteOptions::default())?;
    for line in output.stdout.lines() {
        logger.verbose("out", line, 2);
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline::PhaseData;

    fn registries() -> Registries {
        Registries::new(Path::new("/tmp/run-001"), SshConfig::new("/tmp/sockets", "/tmp/run-001"))
    }

    #[test]
    fn test_every_step_has_plugins() {
        let registries = registries();
        assert_eq!(registries.provision.names(), vec!["connect", "local"]);
        assert_eq!(registries.prepare.names(), vec!["install", "shell"]);
        assert_eq!(registries.execute.names(), vec!["shell"]);
        assert_eq!(registries.finish.names(), vec!["shell"]);
        assert_eq!(registries.report.names(), vec!["display", "json"]);
    }

    #[test]
    fn test_unknown_how() {
        let err = registries()
            .execute
            .create(PhaseData::new("default-0", "beaker"))
            .err()
            .unwrap();
        assert_eq!(
            err.to_string(),
            "invalid plan: unsupported execute method 'beaker', expected one of: shell"
        );
    }
}
