//! Prepare step: install what guests need, then run prepare phases.
//!
//! Requirements are collected per guest in three classes: essential
//! requires (what phases, test frameworks and checks need to work at all),
//! requires and recommends (declared by tests). Guests with an identical
//! package set share a single install phase limited to them via `where`.

use crate::dependency::{DependencyCollection, prune};
use crate::discover::TestCase;
use crate::error::{Error, Result};
use crate::phase::{
    PHASE_ORDER_PREPARE_INSTALL_ESSENTIAL_REQUIRES, PHASE_ORDER_PREPARE_INSTALL_RECOMMENDS,
    PHASE_ORDER_PREPARE_INSTALL_REQUIRES, Phase, PhaseData, StepPhase, select_phases,
};
use crate::queue::{Outcome, Queue, SyncAction, sync_with_guests};
use crate::registry::PluginRegistry;
use crate::results::{PhaseResult, ResultOutcome};
use crate::types::{Context, ExitRequest, Flow, StepOutcome, StepStatus};
use crate::workdir::StepWorkdir;
use guestkit::{GuestRef, SyncRequest};
use logkit::Logger;
use std::sync::Arc;

pub const STEP_NAME: &str = "prepare";

/// `how` of the plugin installing packages.
pub const INSTALL_HOW: &str = "install";

/// Note attached to results of phases that failed outright.
pub const UNHANDLED_EXCEPTION_NOTE: &str = "Plugin raised an unhandled exception.";

/// What a prepare plugin reports for one guest.
#[derive(Debug, Default)]
pub struct PluginOutcome {
    pub results: Vec<PhaseResult>,
    /// Errors the plugin handled itself but which still fail the step
    pub exceptions: Vec<Error>,
}

impl PluginOutcome {
    pub fn with_result(mut self, result: PhaseResult) -> Self {
        self.results.push(result);
        self
    }

    pub fn with_exception(mut self, exception: Error) -> Self {
        self.exceptions.push(exception);
        self
    }
}

/// A plugin preparing one guest at a time.
pub trait PreparePlugin: Phase {
    fn go(&self, guest: &GuestRef, logger: &Logger) -> Result<Flow<PluginOutcome>>;
}

pub type PreparePhase = StepPhase<dyn PreparePlugin>;

/// Everything outside the prepare step contributing requirements.
#[derive(Default)]
pub struct DependencySources<'a> {
    /// Phases of all other steps
    pub phases: Vec<&'a dyn Phase>,
    pub tests: Vec<&'a TestCase>,
}

/// Per-guest collections of the three requirement classes.
#[derive(Debug)]
pub struct CollectedDependencies {
    pub essential_requires: Vec<DependencyCollection<GuestRef>>,
    pub requires: Vec<DependencyCollection<GuestRef>>,
    pub recommends: Vec<DependencyCollection<GuestRef>>,
}

impl CollectedDependencies {
    /// Group guests with identical package sets, class by class.
    pub fn pruned(self) -> Self {
        Self {
            essential_requires: prune(self.essential_requires),
            requires: prune(self.requires),
            recommends: prune(self.recommends),
        }
    }
}

/// Collect requirements of `phases` and `tests` for every guest.
pub fn collect_dependencies(
    guests: &[GuestRef],
    phases: &[&dyn Phase],
    tests: &[&TestCase],
    context: &Context,
) -> Result<CollectedDependencies> {
    let mut collected = CollectedDependencies {
        essential_requires: Vec::with_capacity(guests.len()),
        requires: Vec::with_capacity(guests.len()),
        recommends: Vec::with_capacity(guests.len()),
    };

    for guest in guests {
        let mut essential_requires = DependencyCollection::new(Arc::clone(guest));
        let mut requires = DependencyCollection::new(Arc::clone(guest));
        let mut recommends = DependencyCollection::new(Arc::clone(guest));

        for phase in phases {
            if phase.enabled_by_when(context)? && phase.enabled_on_guest(guest.as_ref()) {
                essential_requires.extend(phase.essential_requires());
            }
        }

        for test in tests {
            if !test.enabled_on_guest(guest.as_ref()) {
                continue;
            }
            requires.extend(test.require.iter().cloned());
            recommends.extend(test.recommend.iter().cloned());
            essential_requires.extend(test.essential_requires());
        }

        collected.essential_requires.push(essential_requires);
        collected.requires.push(requires);
        collected.recommends.push(recommends);
    }

    Ok(collected)
}

/// Phase data of the install phases serving `collections`.
///
/// Empty package sets need no phase.
pub fn install_phase_data(collected: &CollectedDependencies) -> Vec<PhaseData> {
    let classes = [
        (
            "essential-requires",
            "Install essential required packages",
            PHASE_ORDER_PREPARE_INSTALL_ESSENTIAL_REQUIRES,
            &collected.essential_requires,
            "fail",
        ),
        (
            "requires",
            "Install required packages",
            PHASE_ORDER_PREPARE_INSTALL_REQUIRES,
            &collected.requires,
            "fail",
        ),
        (
            "recommends",
            "Install recommended packages",
            PHASE_ORDER_PREPARE_INSTALL_RECOMMENDS,
            &collected.recommends,
            "skip",
        ),
    ];

    let mut phases = Vec::new();
    for (name, summary, order, collections, missing) in classes {
        for collection in collections.iter().filter(|c| !c.is_empty()) {
            let packages: Vec<serde_json::Value> = collection
                .dependencies
                .iter()
                .map(|dependency| serde_json::Value::String(dependency.to_string()))
                .collect();
            phases.push(
                PhaseData::new(name, INSTALL_HOW)
                    .with_order(order)
                    .with_summary(summary)
                    .with_where(collection.guests.iter().map(|guest| guest.name().to_string()))
                    .with_option("package", serde_json::Value::Array(packages))
                    .with_option("missing", serde_json::Value::String(missing.to_string())),
            );
        }
    }
    phases
}

fn go_plugin(plugin: &dyn PreparePlugin, guest: &GuestRef, logger: &Logger) -> Result<Flow<PluginOutcome>> {
    plugin.go(guest, logger)
}

/// The prepare step of one run.
pub struct Prepare {
    logger: Logger,
    workdir: StepWorkdir,
    phases: Vec<PreparePhase>,
    registry: Arc<PluginRegistry<dyn PreparePlugin>>,
    context: Context,
    status: StepStatus,
    results: Vec<PhaseResult>,
    preparations_applied: usize,
}

impl Prepare {
    pub fn new(
        phases: Vec<PreparePhase>,
        registry: Arc<PluginRegistry<dyn PreparePlugin>>,
        workdir: StepWorkdir,
        logger: Logger,
    ) -> Self {
        Self {
            logger,
            workdir,
            phases,
            registry,
            context: Context::new(),
            status: StepStatus::Todo,
            results: Vec::new(),
            preparations_applied: 0,
        }
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    pub fn phases(&self) -> &[PreparePhase] {
        &self.phases
    }

    pub fn status(&self) -> StepStatus {
        self.status
    }

    pub fn results(&self) -> &[PhaseResult] {
        &self.results
    }

    pub fn preparations_applied(&self) -> usize {
        self.preparations_applied
    }

    pub fn wake(&mut self) -> Result<()> {
        self.status = self.workdir.load_status()?;
        self.results = self.workdir.load_results()?;
        Ok(())
    }

    /// Prepare every guest in `guests`.
    pub fn go(&mut self, guests: &[GuestRef], sources: &DependencySources<'_>) -> Result<StepOutcome> {
        if self.status == StepStatus::Done {
            self.logger.info("status", "done");
            self.summary();
            return Ok(Flow::Done(()));
        }

        let mut phases = self.phases.clone();
        for data in self.install_phases(guests, sources)? {
            self.logger.debug(
                format!("Adding install phase '{}' for {}.", data.name, data.r#where.join(", ")),
                2,
            );
            phases.push(StepPhase::Plugin(self.registry.create(data)?));
        }
        let phases = select_phases(&phases, &self.context)?;

        let request = SyncRequest::default();
        if !phases.is_empty() {
            sync_with_guests(STEP_NAME, SyncAction::Push, guests, &request, &self.logger)?;
        }

        let mut queue: Queue<PluginOutcome> = Queue::new(STEP_NAME, self.logger.clone());
        for phase in &phases {
            match phase {
                StepPhase::Action(action) => queue.enqueue_action(Arc::clone(action), guests),
                StepPhase::Plugin(plugin) => {
                    let enabled: Vec<GuestRef> = guests
                        .iter()
                        .filter(|guest| plugin.enabled_on_guest(guest.as_ref()))
                        .cloned()
                        .collect();
                    queue.enqueue_plugin(Arc::clone(plugin), &enabled, go_plugin)?;
                }
            }
        }

        self.results.clear();
        self.preparations_applied = 0;
        let mut exceptions: Vec<Error> = Vec::new();
        let mut exits: Vec<ExitRequest> = Vec::new();

        for outcome in queue.run() {
            match outcome.outcome {
                Outcome::Err(e) => {
                    outcome.logger.fail(&e);
                    let mut result = PhaseResult::new(&outcome.phase, ResultOutcome::Error)
                        .with_note(UNHANDLED_EXCEPTION_NOTE);
                    if let Some(guest) = &outcome.guest {
                        result = result.with_guest(guest.as_ref());
                    }
                    self.results.push(result);
                    exceptions.push(e);
                }
                Outcome::Exit(request) => exits.push(request),
                Outcome::Ok(plugin_outcome) => {
                    self.results.extend(plugin_outcome.results);
                    if plugin_outcome.exceptions.is_empty() {
                        self.preparations_applied += 1;
                    } else {
                        for exception in &plugin_outcome.exceptions {
                            outcome.logger.fail(exception);
                        }
                        exceptions.extend(plugin_outcome.exceptions);
                    }
                }
            }
        }

        self.workdir.save_results(&self.results)?;

        if let Some(request) = exits.into_iter().next() {
            return Ok(Flow::Exit(request));
        }

        if !exceptions.is_empty() {
            return Err(Error::step_failed(STEP_NAME, exceptions));
        }

        if !phases.is_empty() {
            sync_with_guests(STEP_NAME, SyncAction::Pull, guests, &request, &self.logger)?;
        }

        self.summary();
        self.status = StepStatus::Done;
        self.workdir.save_status(self.status)?;
        Ok(Flow::Done(()))
    }

    fn install_phases(&self, guests: &[GuestRef], sources: &DependencySources<'_>) -> Result<Vec<PhaseData>> {
        let mut phases: Vec<&dyn Phase> = sources.phases.clone();
        for phase in &self.phases {
            if let StepPhase::Plugin(plugin) = phase {
                let plugin: &dyn Phase = &**plugin;
                phases.push(plugin);
            }
        }

        let collected = collect_dependencies(guests, &phases, &sources.tests, &self.context)?;
        Ok(install_phase_data(&collected.pruned()))
    }

    fn summary(&self) {
        self.logger.info(
            "summary",
            format!("{} preparation(s) applied", self.preparations_applied),
        );
    }
}
