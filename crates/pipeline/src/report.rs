//! Report step: hand the collected results to report plugins.

use crate::error::{Error, Result};
use crate::phase::{Phase, StepPhase, select_phases};
use crate::queue::{Job, Outcome, Queue, Task};
use crate::results::PhaseResult;
use crate::types::{Context, ExitRequest, Flow, StepOutcome, StepStatus};
use crate::workdir::StepWorkdir;
use guestkit::GuestRef;
use logkit::Logger;
use std::sync::Arc;

pub const STEP_NAME: &str = "report";

pub trait ReportPlugin: Phase {
    fn go(&self, results: &[PhaseResult], logger: &Logger) -> Result<Flow<()>>;
}

pub type ReportPhase = StepPhase<dyn ReportPlugin>;

struct ReportJob {
    plugin: Arc<dyn ReportPlugin>,
    results: Arc<Vec<PhaseResult>>,
}

impl Job<()> for ReportJob {
    fn phase(&self) -> &str {
        self.plugin.name()
    }

    fn run(&self, logger: &Logger) -> Result<Flow<()>> {
        self.plugin.go(&self.results, logger)
    }

    fn guest(&self) -> Option<GuestRef> {
        None
    }
}

/// The report step of one run.
pub struct Report {
    logger: Logger,
    workdir: StepWorkdir,
    phases: Vec<ReportPhase>,
    context: Context,
    status: StepStatus,
}

impl Report {
    pub fn new(phases: Vec<ReportPhase>, workdir: StepWorkdir, logger: Logger) -> Self {
        Self {
            logger,
            workdir,
            phases,
            context: Context::new(),
            status: StepStatus::Todo,
        }
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    pub fn phases(&self) -> &[ReportPhase] {
        &self.phases
    }

    pub fn status(&self) -> StepStatus {
        self.status
    }

    pub fn wake(&mut self) -> Result<()> {
        self.status = self.workdir.load_status()?;
        Ok(())
    }

    /// Run every report plugin, one after another.
    ///
    /// Reports are always regenerated, results may have changed since the
    /// last invocation.
    pub fn go(&mut self, guests: &[GuestRef], results: &[PhaseResult]) -> Result<StepOutcome> {
        let phases = select_phases(&self.phases, &self.context)?;
        let results = Arc::new(results.to_vec());

        let mut queue: Queue<()> = Queue::new(STEP_NAME, self.logger.clone());
        for phase in &phases {
            match phase {
                StepPhase::Action(action) => queue.enqueue_action(Arc::clone(action), guests),
                StepPhase::Plugin(plugin) => {
                    let job: Box<dyn Job<()>> = Box::new(ReportJob {
                        plugin: Arc::clone(plugin),
                        results: Arc::clone(&results),
                    });
                    queue.enqueue(Task::sequential(plugin.name(), vec![job]));
                }
            }
        }

        let mut failures: Vec<Error> = Vec::new();
        let mut exits: Vec<ExitRequest> = Vec::new();
        for outcome in queue.run() {
            match outcome.outcome {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => {
                    outcome.logger.fail(&e);
                    failures.push(e);
                }
                Outcome::Exit(request) => exits.push(request),
            }
        }

        if let Some(request) = exits.into_iter().next() {
            return Ok(Flow::Exit(request));
        }

        if !failures.is_empty() {
            return Err(Error::step_failed(STEP_NAME, failures));
        }

        self.status = StepStatus::Done;
        self.workdir.save_status(self.status)?;
        Ok(Flow::Done(()))
    }
}
