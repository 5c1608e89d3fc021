//! Execute step: run the discovered tests on every guest.

use crate::discover::TestCase;
use crate::error::{Error, Result};
use crate::phase::{Phase, StepPhase, select_phases};
use crate::prepare::UNHANDLED_EXCEPTION_NOTE;
use crate::queue::{Job, Outcome, Queue, SyncAction, sync_with_guests};
use crate::results::{PhaseResult, ResultOutcome};
use crate::types::{Context, ExitRequest, Flow, StepOutcome, StepStatus};
use crate::workdir::StepWorkdir;
use guestkit::{GuestRef, SyncRequest};
use logkit::Logger;
use std::sync::Arc;

pub const STEP_NAME: &str = "execute";

/// A plugin running tests on one guest.
pub trait ExecutePlugin: Phase {
    /// Run `tests` on `guest`, returning one result per test.
    fn go(&self, guest: &GuestRef, tests: &[TestCase], logger: &Logger) -> Result<Flow<Vec<PhaseResult>>>;
}

pub type ExecutePhase = StepPhase<dyn ExecutePlugin>;

struct ExecuteJob {
    plugin: Arc<dyn ExecutePlugin>,
    guest: GuestRef,
    tests: Arc<Vec<TestCase>>,
}

impl Job<Vec<PhaseResult>> for ExecuteJob {
    fn phase(&self) -> &str {
        self.plugin.name()
    }

    fn label(&self) -> String {
        self.guest.name().to_string()
    }

    fn run(&self, logger: &Logger) -> Result<Flow<Vec<PhaseResult>>> {
        let tests: Vec<TestCase> = self
            .tests
            .iter()
            .filter(|test| test.enabled && test.enabled_on_guest(self.guest.as_ref()))
            .cloned()
            .collect();
        logger.verbose("tests", tests.len(), 1);
        self.plugin.go(&self.guest, &tests, logger)
    }

    fn guest(&self) -> Option<GuestRef> {
        Some(Arc::clone(&self.guest))
    }
}

/// The execute step of one run.
pub struct Execute {
    logger: Logger,
    workdir: StepWorkdir,
    phases: Vec<ExecutePhase>,
    context: Context,
    status: StepStatus,
    results: Vec<PhaseResult>,
}

impl Execute {
    pub fn new(phases: Vec<ExecutePhase>, workdir: StepWorkdir, logger: Logger) -> Self {
        Self {
            logger,
            workdir,
            phases,
            context: Context::new(),
            status: StepStatus::Todo,
            results: Vec::new(),
        }
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    pub fn phases(&self) -> &[ExecutePhase] {
        &self.phases
    }

    pub fn status(&self) -> StepStatus {
        self.status
    }

    pub fn results(&self) -> &[PhaseResult] {
        &self.results
    }

    pub fn wake(&mut self) -> Result<()> {
        self.status = self.workdir.load_status()?;
        self.results = self.workdir.load_results()?;
        Ok(())
    }

    pub fn go(&mut self, guests: &[GuestRef], tests: &[TestCase]) -> Result<StepOutcome> {
        if self.status == StepStatus::Done {
            self.logger.info("status", "done");
            self.summary();
            return Ok(Flow::Done(()));
        }

        let phases = select_phases(&self.phases, &self.context)?;
        let request = SyncRequest::default();
        sync_with_guests(STEP_NAME, SyncAction::Push, guests, &request, &self.logger)?;

        let tests = Arc::new(tests.to_vec());
        let mut queue: Queue<Vec<PhaseResult>> = Queue::new(STEP_NAME, self.logger.clone());
        for phase in &phases {
            match phase {
                StepPhase::Action(action) => queue.enqueue_action(Arc::clone(action), guests),
                StepPhase::Plugin(plugin) => {
                    let jobs: Vec<Box<dyn Job<Vec<PhaseResult>>>> = guests
                        .iter()
                        .filter(|guest| plugin.enabled_on_guest(guest.as_ref()))
                        .map(|guest| {
                            let job: Box<dyn Job<Vec<PhaseResult>>> = Box::new(ExecuteJob {
                                plugin: Arc::clone(plugin),
                                guest: Arc::clone(guest),
                                tests: Arc::clone(&tests),
                            });
                            job
                        })
                        .collect();
                    queue.enqueue_guest_jobs(plugin.name(), jobs)?;
                }
            }
        }

        self.results.clear();
        let mut exceptions: Vec<Error> = Vec::new();
        let mut exits: Vec<ExitRequest> = Vec::new();

        for outcome in queue.run() {
            match outcome.outcome {
                Outcome::Ok(results) => {
                    for result in &results {
                        let color = if result.result.is_failure() {
                            colored::Color::Red
                        } else {
                            colored::Color::Green
                        };
                        outcome
                            .logger
                            .info_colored(&result.name, result.result, color);
                    }
                    self.results.extend(results);
                }
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
            }
        }

        self.workdir.save_results(&self.results)?;

        if let Some(request) = exits.into_iter().next() {
            return Ok(Flow::Exit(request));
        }

        sync_with_guests(STEP_NAME, SyncAction::Pull, guests, &request, &self.logger)?;

        if !exceptions.is_empty() {
            return Err(Error::step_failed(STEP_NAME, exceptions));
        }

        self.summary();
        self.status = StepStatus::Done;
        self.workdir.save_status(self.status)?;
        Ok(Flow::Done(()))
    }

    fn summary(&self) {
        self.logger
            .info("summary", format!("{} test(s) executed", self.results.len()));
    }
}
