//! # pipeline
//!
//! The step engine of the test run orchestrator.
//!
//! A run walks six steps in order: discover, provision, prepare, execute,
//! finish and report. Each step owns a list of phases, either plugins
//! configured in the plan or built-in [`Action`]s such as [`Reboot`] and
//! [`Login`]. Phases are filtered by their `when` rules, sorted by order and
//! fed to a [`Queue`], which runs every phase on the guests it applies to,
//! possibly in parallel, and yields one [`TaskOutcome`] per guest as soon as
//! it is available.
//!
//! Failures of individual phases never abort a step early: they are
//! collected and reported together as [`Error::StepFailed`]. A phase may
//! also ask the whole run to stop with a [`Flow::Exit`], which takes
//! priority over failures.
//!
//! Step state lives in a per-step directory managed by [`StepWorkdir`], so
//! a later invocation can wake a step up and skip work already done.

pub mod actions;
pub mod dependency;
pub mod discover;
pub mod error;
pub mod execute;
pub mod finish;
pub mod interrupt;
pub mod phase;
pub mod prepare;
pub mod provision;
pub mod queue;
pub mod registry;
pub mod report;
pub mod results;
pub mod types;
pub mod workdir;

pub use actions::{ActionSpec, Login, Reboot, STEPS};
pub use dependency::{DependencyCollection, dedup_dependencies, prune};
pub use discover::{CheckKind, Discover, Framework, TestCase, parse_duration};
pub use error::{Error, ErrorCategory, Result};
pub use execute::{Execute, ExecutePhase, ExecutePlugin};
pub use finish::{Finish, FinishPhase, FinishPlugin};
pub use interrupt::Interrupt;
pub use phase::{
    Action, PHASE_ORDER_DEFAULT, PHASE_ORDER_END, PHASE_ORDER_PREPARE_INSTALL_ESSENTIAL_REQUIRES,
    PHASE_ORDER_PREPARE_INSTALL_RECOMMENDS, PHASE_ORDER_PREPARE_INSTALL_REQUIRES, PHASE_ORDER_START,
    Phase, PhaseData, StepPhase, WhenRule, evaluate_when, select_phases,
};
pub use prepare::{
    CollectedDependencies, DependencySources, PluginOutcome, Prepare, PreparePhase, PreparePlugin,
    collect_dependencies, install_phase_data,
};
pub use provision::{Batch, Provision, ProvisionPhase, ProvisionPlugin, plan_batches};
pub use queue::{Job, Outcome, Queue, SyncAction, Task, TaskOutcome, sync_with_guests};
pub use registry::PluginRegistry;
pub use report::{Report, ReportPhase, ReportPlugin};
pub use results::{PhaseResult, ResultGuest, ResultOutcome, summarize};
pub use types::{Context, Dependency, ExitRequest, Flow, StepOutcome, StepStatus};
pub use workdir::StepWorkdir;
