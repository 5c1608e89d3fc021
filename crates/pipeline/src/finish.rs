//! Finish step: run cleanup phases, then stop or suspend every guest.

use crate::error::{Error, Result};
use crate::phase::{Phase, StepPhase, select_phases};
use crate::queue::{Outcome, Queue};
use crate::types::{Context, ExitRequest, Flow, StepOutcome, StepStatus};
use crate::workdir::StepWorkdir;
use guestkit::GuestRef;
use logkit::Logger;
use std::sync::Arc;

pub const STEP_NAME: &str = "finish";

pub trait FinishPlugin: Phase {
    fn go(&self, guest: &GuestRef, logger: &Logger) -> Result<Flow<()>>;
}

pub type FinishPhase = StepPhase<dyn FinishPlugin>;

fn go_plugin(plugin: &dyn FinishPlugin, guest: &GuestRef, logger: &Logger) -> Result<Flow<()>> {
    plugin.go(guest, logger)
}

/// The finish step of one run.
pub struct Finish {
    logger: Logger,
    workdir: StepWorkdir,
    phases: Vec<FinishPhase>,
    context: Context,
    status: StepStatus,
    keep: bool,
    tasks_completed: usize,
}

impl Finish {
    pub fn new(phases: Vec<FinishPhase>, workdir: StepWorkdir, logger: Logger) -> Self {
        Self {
            logger,
            workdir,
            phases,
            context: Context::new(),
            status: StepStatus::Todo,
            keep: false,
            tasks_completed: 0,
        }
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    /// Suspend guests instead of removing them.
    pub fn with_keep(mut self, keep: bool) -> Self {
        self.keep = keep;
        self
    }

    pub fn phases(&self) -> &[FinishPhase] {
        &self.phases
    }

    pub fn status(&self) -> StepStatus {
        self.status
    }

    pub fn wake(&mut self) -> Result<()> {
        self.status = self.workdir.load_status()?;
        Ok(())
    }

    fn queue(&self, guests: &[GuestRef]) -> Result<Queue<()>> {
        let phases = select_phases(&self.phases, &self.context)?;
        let mut queue: Queue<()> = Queue::new(STEP_NAME, self.logger.clone());
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
        Ok(queue)
    }

    /// Run finish phases, then release `guests`.
    ///
    /// Guests are released even when a phase failed or could not be queued.
    pub fn go(&mut self, guests: &[GuestRef]) -> Result<StepOutcome> {
        if self.status == StepStatus::Done {
            self.logger.info("status", "done");
            return Ok(Flow::Done(()));
        }

        let mut failures: Vec<Error> = Vec::new();
        let mut exits: Vec<ExitRequest> = Vec::new();
        self.tasks_completed = 0;

        match self.queue(guests) {
            Ok(queue) => {
                for outcome in queue.run() {
                    match outcome.outcome {
                        Outcome::Ok(()) => self.tasks_completed += 1,
                        Outcome::Err(e) => {
                            outcome.logger.fail(&e);
                            failures.push(e);
                        }
                        Outcome::Exit(request) => exits.push(request),
                    }
                }
            }
            Err(e) => {
                self.logger.fail(&e);
                failures.push(e);
            }
        }

        for guest in guests {
            let logger = self.logger.descend(guest.name());
            let released = if self.keep {
                logger.verbose("guest", "suspend", 1);
                guest.suspend()
            } else {
                logger.verbose("guest", "stop and remove", 1);
                guest.stop().and_then(|()| guest.remove())
            };
            if let Err(e) = released {
                logger.fail(&e);
                failures.push(e.into());
            }
        }

        if let Some(request) = exits.into_iter().next() {
            return Ok(Flow::Exit(request));
        }

        if !failures.is_empty() {
            return Err(Error::step_failed(STEP_NAME, failures));
        }

        self.logger
            .info("summary", format!("{} task(s) completed", self.tasks_completed));
        self.status = StepStatus::Done;
        self.workdir.save_status(self.status)?;
        Ok(Flow::Done(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::PhaseData;
    use guestkit::MockGuest;

    struct Cleanup(PhaseData);

    impl Phase for Cleanup {
        fn data(&self) -> &PhaseData {
            &self.0
        }
    }

    impl FinishPlugin for Cleanup {
        fn go(&self, guest: &GuestRef, _logger: &Logger) -> Result<Flow<()>> {
            let script = self.0.option_str("script").unwrap_or("true");
            guest.execute(&guestkit::Command::shell(script), &guestkit::ExecuteOptions::default())?;
            Ok(Flow::Done(()))
        }
    }

    fn step(script: &str, dir: &tempfile::TempDir) -> Finish {
        let data = PhaseData::new("cleanup", "shell").with_option("script", serde_json::json!(script));
        let phase: FinishPhase = StepPhase::Plugin(Arc::new(Cleanup(data)));
        let workdir = StepWorkdir::create(dir.path(), STEP_NAME).unwrap();
        Finish::new(vec![phase], workdir, Logger::new(STEP_NAME))
    }

    #[test]
    fn test_phases_run_on_every_guest() {
        let dir = tempfile::tempdir().unwrap();
        let a = Arc::new(MockGuest::new("a"));
        let b = Arc::new(MockGuest::new("b"));
        let guests: Vec<GuestRef> = vec![a.clone(), b.clone()];

        let mut finish = step("rm -rf /tmp/scratch", &dir);
        assert_eq!(finish.go(&guests).unwrap(), Flow::Done(()));

        assert_eq!(a.count_executed("rm -rf /tmp/scratch"), 1);
        assert_eq!(b.count_executed("rm -rf /tmp/scratch"), 1);
        assert_eq!(a.lifecycle(), vec!["stop", "remove"]);
        assert_eq!(b.lifecycle(), vec!["stop", "remove"]);
        assert_eq!(finish.status(), StepStatus::Done);
    }

    #[test]
    fn test_keep_suspends_guests() {
        let dir = tempfile::tempdir().unwrap();
        let guest = Arc::new(MockGuest::new("a"));
        let guests: Vec<GuestRef> = vec![guest.clone()];

        let mut finish = step("true", &dir).with_keep(true);
        finish.go(&guests).unwrap();
        assert_eq!(guest.lifecycle(), vec!["suspend"]);
    }

    #[test]
    fn test_guests_released_when_phase_matches_no_guest() {
        let dir = tempfile::tempdir().unwrap();
        let guest = Arc::new(MockGuest::new("a"));
        let guests: Vec<GuestRef> = vec![guest.clone()];
        let data = PhaseData::new("cleanup", "shell").with_where(["serevr"]);
        let phase: FinishPhase = StepPhase::Plugin(Arc::new(Cleanup(data)));
        let workdir = StepWorkdir::create(dir.path(), STEP_NAME).unwrap();

        let mut finish = Finish::new(vec![phase], workdir, Logger::new(STEP_NAME));
        let err = finish.go(&guests).unwrap_err();

        assert!(matches!(&err, Error::StepFailed { step, causes }
            if step == "finish" && matches!(causes.as_slice(), [Error::Metadata(_)])));
        assert_eq!(guest.lifecycle(), vec!["stop", "remove"]);
        assert!(guest.executed().is_empty());
    }

    #[test]
    fn test_failed_phase_fails_the_step() {
        let dir = tempfile::tempdir().unwrap();
        let guest = Arc::new(MockGuest::new("a").fail("exit 1", 1));
        let guests: Vec<GuestRef> = vec![guest.clone()];

        let mut finish = step("exit 1", &dir);
        let err = finish.go(&guests).unwrap_err();
        assert!(matches!(&err, Error::StepFailed { step, causes } if step == "finish" && causes.len() == 1));
        assert_eq!(finish.status(), StepStatus::Todo);
        assert_eq!(guest.lifecycle(), vec!["stop", "remove"]);
    }
}
