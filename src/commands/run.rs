//! `testrun run`: walk a plan through all six steps.
//!
//! Provision, prepare and execute stop the run at the first failing step,
//! but finish and report always run so guests are cleaned up and whatever
//! results exist are shown. A requested exit ends the run immediately with
//! its own exit code.

use anyhow::{Context as _, Result};
use guestkit::{GuestRef, SshConfig};
use logkit::Logger;
use pipeline::{
    Action, ActionSpec, DependencySources, Discover, Error, Execute, ExecutePhase, ExitRequest,
    Finish, FinishPhase, Flow, Interrupt, Login, Phase, PhaseData, PhaseResult, PluginRegistry, Prepare,
    PreparePhase, Provision, ProvisionPhase, Reboot, Report, ReportPhase, ResultOutcome,
    StepOutcome, StepPhase, StepStatus, StepWorkdir, summarize,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::Context;
use crate::cli::RunArgs;
use crate::config::Plan;
use crate::paths;
use crate::plugins::Registries;
use crate::state::RunState;
use crate::ui;

/// Exit code when a test failed
const EXIT_FAILED: i32 = 1;

/// Exit code when a test or phase errored
const EXIT_ERRORED: i32 = 2;

/// Exit code when there were no results at all
const EXIT_NO_RESULTS: i32 = 3;

/// Exit code of a finished run, derived from its results
pub fn results_exit_code(results: &[PhaseResult]) -> i32 {
    if results.is_empty() {
        return EXIT_NO_RESULTS;
    }
    let totals = summarize(results);
    if totals[&ResultOutcome::Error] > 0 {
        EXIT_ERRORED
    } else if totals[&ResultOutcome::Fail] > 0 {
        EXIT_FAILED
    } else {
        0
    }
}

/// `--reboot` and `--login` actions, with the step they belong to
fn parse_actions(args: &RunArgs) -> Result<Vec<(String, Arc<dyn Action>)>> {
    let mut actions: Vec<(String, Arc<dyn Action>)> = Vec::new();
    for spec in &args.reboot {
        let spec: ActionSpec = spec.parse().context("Invalid --reboot")?;
        actions.push((spec.step, Arc::new(Reboot::new(spec.order))));
    }
    for spec in &args.login {
        let spec: ActionSpec = spec.parse().context("Invalid --login")?;
        actions.push((spec.step, Arc::new(Login::new(spec.order))));
    }
    Ok(actions)
}

/// Plugin phases of one step, followed by the actions scheduled into it
fn step_phases<P: ?Sized>(
    step: &str,
    registry: &PluginRegistry<P>,
    data: &[PhaseData],
    actions: &[(String, Arc<dyn Action>)],
) -> Result<Vec<StepPhase<P>>> {
    let mut phases = Vec::with_capacity(data.len());
    for phase in data {
        let plugin = registry
            .create(phase.clone())
            .with_context(|| format!("Invalid {step} phase '{}'", phase.name))?;
        phases.push(StepPhase::Plugin(plugin));
    }
    phases.extend(
        actions
            .iter()
            .filter(|(target, _)| target == step)
            .map(|(_, action)| StepPhase::Action(Arc::clone(action))),
    );
    Ok(phases)
}

/// Phases of the steps that act on guests
struct Phases {
    provision: Vec<ProvisionPhase>,
    prepare: Vec<PreparePhase>,
    execute: Vec<ExecutePhase>,
    finish: Vec<FinishPhase>,
    report: Vec<ReportPhase>,
}

impl Phases {
    fn build(plan: &Plan, registries: &Registries, actions: &[(String, Arc<dyn Action>)]) -> Result<Self> {
        Ok(Self {
            provision: step_phases("provision", &registries.provision, &plan.provision, actions)?,
            prepare: step_phases("prepare", &registries.prepare, &plan.prepare, actions)?,
            execute: step_phases("execute", &registries.execute, &plan.execute, actions)?,
            finish: step_phases("finish", &registries.finish, &plan.finish, actions)?,
            report: step_phases("report", &registries.report, &plan.report, actions)?,
        })
    }

    /// Phases of the steps other than prepare, asked for essential requires
    fn dependency_phases<'a>(&'a self, discover: &'a Discover) -> Vec<&'a dyn Phase> {
        let mut phases: Vec<&dyn Phase> = Vec::new();
        phases.push(discover);
        for plugin in self.provision.iter().filter_map(StepPhase::plugin) {
            let phase: &dyn Phase = &**plugin;
            phases.push(phase);
        }
        for plugin in self.execute.iter().filter_map(StepPhase::plugin) {
            let phase: &dyn Phase = &**plugin;
            phases.push(phase);
        }
        for plugin in self.finish.iter().filter_map(StepPhase::plugin) {
            let phase: &dyn Phase = &**plugin;
            phases.push(phase);
        }
        for plugin in self.report.iter().filter_map(StepPhase::plugin) {
            let phase: &dyn Phase = &**plugin;
            phases.push(phase);
        }
        phases
    }
}

fn show_plan(plan: &Plan, phases: &Phases) {
    ui::header(plan.summary.as_deref().unwrap_or("Plan"));
    for (key, value) in &plan.context {
        ui::kv(&format!("context {key}"), value);
    }
    ui::kv("discover", &format!("{} test(s)", plan.discover.tests.len()));
    for test in &plan.discover.tests {
        ui::dim(&format!("{} ({})", test.name, test.test));
    }

    let steps: [(&str, Vec<(String, i32)>); 5] = [
        ("provision", describe(&phases.provision)),
        ("prepare", describe(&phases.prepare)),
        ("execute", describe(&phases.execute)),
        ("finish", describe(&phases.finish)),
        ("report", describe(&phases.report)),
    ];
    for (step, phases) in steps {
        ui::kv(step, &format!("{} phase(s)", phases.len()));
        for (name, order) in phases {
            ui::dim(&format!("{name} (order {order})"));
        }
    }
}

fn describe<P: Phase + ?Sized>(phases: &[StepPhase<P>]) -> Vec<(String, i32)> {
    phases
        .iter()
        .map(|phase| (phase.name().to_string(), phase.order()))
        .collect()
}

/// Bookkeeping shared by all steps of one run
struct Tracker<'a> {
    workdir: &'a Path,
    state: RunState,
    failure: Option<Error>,
}

impl Tracker<'_> {
    /// Record a step outcome, returning the exit request if there was one.
    fn record(&mut self, step: &str, outcome: pipeline::Result<StepOutcome>) -> Result<Option<ExitRequest>> {
        let exit = match outcome {
            Ok(Flow::Done(())) => {
                self.state.set_step(step, StepStatus::Done);
                None
            }
            Ok(Flow::Exit(request)) => Some(request),
            Err(e) => {
                if self.failure.is_some() {
                    ui::error(&e.to_string());
                } else {
                    self.failure = Some(e);
                }
                None
            }
        };
        self.state.save(self.workdir)?;
        Ok(exit)
    }

    fn failed(&self) -> bool {
        self.failure.is_some()
    }

    fn interrupted(&self) -> bool {
        matches!(self.failure, Some(Error::Interrupted { .. }))
    }
}

fn requested_exit(request: &ExitRequest) -> i32 {
    ui::info(&format!("Run stopped: {}", request.reason));
    request.code
}

pub fn run(ctx: &Context, args: RunArgs) -> Result<i32> {
    let mut plan = Plan::load(&args.plan)?;
    plan.override_context(&args.context)?;
    let actions = parse_actions(&args)?;

    let root = paths::workdir_root();
    let workdir = match &args.id.id {
        Some(id) => paths::resolve_run(&root, id),
        None => paths::next_run(&root)?,
    };

    let ssh = SshConfig::new(paths::socket_dir(&workdir), &workdir);
    let registries = Registries::new(&workdir, ssh);
    let phases = Phases::build(&plan, &registries, &actions)?;

    if args.dry {
        show_plan(&plan, &phases);
        return Ok(0);
    }

    if args.force && workdir.exists() {
        log::info!("Removing previous run state in {}", workdir.display());
        fs::remove_dir_all(&workdir)
            .with_context(|| format!("Could not remove {}", workdir.display()))?;
    }
    let state = if RunState::exists(&workdir) {
        RunState::load(&workdir)?
    } else {
        RunState::new(&args.plan)
    };
    state.save(&workdir)?;
    if !ctx.quiet {
        ui::header(&format!("Run {}", workdir.display()));
    }

    let logger = ctx.logger(&workdir.display().to_string());
    let mut tracker = Tracker {
        workdir: &workdir,
        state,
        failure: None,
    };

    // Discover
    let discover = Discover::new(PhaseData::new("default-0", "shell"), plan.discover.tests.clone());
    let discover_logger = logger.descend("discover");
    discover_logger.info("summary", discover.summary());
    if actions.iter().any(|(step, _)| step == "discover") {
        discover_logger.warn("No guests exist yet, ignoring actions scheduled for discover.");
    }
    tracker.record("discover", Ok(Flow::Done(())))?;

    let provision = match provision_step(&ctx.interrupt, &workdir, &logger, &plan, &phases, &mut tracker)? {
        Flow::Done(provision) => provision,
        Flow::Exit(request) => return Ok(requested_exit(&request)),
    };
    let guests = provision.ready_guests();

    // Prepare and execute, skipped once a step failed
    let mut execute = Execute::new(
        phases.execute.clone(),
        StepWorkdir::create(&workdir, pipeline::execute::STEP_NAME)?,
        logger.descend("execute"),
    )
    .with_context(plan.context.clone());
    execute.wake()?;

    if !tracker.failed() {
        let mut prepare = Prepare::new(
            phases.prepare.clone(),
            Arc::clone(&registries.prepare),
            StepWorkdir::create(&workdir, pipeline::prepare::STEP_NAME)?,
            logger.descend("prepare"),
        )
        .with_context(plan.context.clone());
        prepare.wake()?;
        let sources = DependencySources {
            phases: phases.dependency_phases(&discover),
            tests: discover.tests(true),
        };
        if let Some(request) = tracker.record("prepare", prepare.go(&guests, &sources))? {
            return Ok(requested_exit(&request));
        }
    }

    if !tracker.failed() && !ctx.interrupt.is_set() {
        if let Some(request) = tracker.record("execute", execute.go(&guests, &plan.discover.tests))? {
            return Ok(requested_exit(&request));
        }
    }

    // Finish and report always run
    finish_step(
        &workdir,
        &logger,
        &plan,
        &phases,
        provision.guests(),
        args.keep || ctx.interrupt.is_set(),
        &mut tracker,
    )?;

    let mut report = Report::new(
        phases.report.clone(),
        StepWorkdir::create(&workdir, pipeline::report::STEP_NAME)?,
        logger.descend("report"),
    )
    .with_context(plan.context.clone());
    report.wake()?;
    if let Some(request) = tracker.record("report", report.go(&guests, execute.results()))? {
        return Ok(requested_exit(&request));
    }

    if let Some(e) = tracker.failure {
        return Err(e.into());
    }
    if ctx.interrupt.is_set() {
        return Err(Error::Interrupted {
            guests: guests.iter().map(|guest| guest.name().to_string()).collect(),
        }
        .into());
    }
    Ok(results_exit_code(execute.results()))
}

/// Provision guests.
///
/// An interrupted provision still runs finish, keeping whatever guests were
/// created so a later invocation can pick them up.
fn provision_step(
    interrupt: &Interrupt,
    workdir: &Path,
    logger: &Logger,
    plan: &Plan,
    phases: &Phases,
    tracker: &mut Tracker<'_>,
) -> Result<Flow<Provision>> {
    let mut provision = Provision::new(
        phases.provision.clone(),
        StepWorkdir::create(workdir, pipeline::provision::STEP_NAME)?,
        logger.descend("provision"),
    )
    .with_context(plan.context.clone())
    .with_interrupt(interrupt.clone());
    provision.wake()?;
    if let Some(request) = tracker.record("provision", provision.go())? {
        return Ok(Flow::Exit(request));
    }
    if tracker.interrupted() {
        finish_step(workdir, logger, plan, phases, provision.guests(), true, tracker)?;
        return Err(tracker.failure.take().map_or_else(|| anyhow::anyhow!("Interrupted"), Into::into));
    }
    Ok(Flow::Done(provision))
}

/// Run the finish step on `guests`, suspending instead of stopping them
/// with `keep`.
fn finish_step(
    workdir: &Path,
    logger: &Logger,
    plan: &Plan,
    phases: &Phases,
    guests: &[GuestRef],
    keep: bool,
    tracker: &mut Tracker<'_>,
) -> Result<()> {
    let finish_logger = logger.descend("finish");
    if guests.is_empty() {
        finish_logger.info("summary", "no guests to finish");
        return Ok(());
    }

    let mut finish = Finish::new(
        phases.finish.clone(),
        StepWorkdir::create(workdir, pipeline::finish::STEP_NAME)?,
        finish_logger,
    )
    .with_context(plan.context.clone())
    .with_keep(keep);
    finish.wake()?;
    if let Some(request) = tracker.record("finish", finish.go(guests))? {
        log::debug!("Exit requested during finish: {}", request.reason);
    }
    Ok(())
}
