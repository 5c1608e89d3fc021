//! Provision step: turn provisioning phases into guests.
//!
//! Phases are sorted by order and cut into batches of adjacent entries:
//! consecutive actions form one batch run one by one, consecutive
//! thread-safe plugins form one batch provisioned in parallel, and any other
//! plugin is a batch of its own. Batching never reorders phases. A batch is
//! finished, all outcomes known, before the next one starts.

use crate::error::{Error, Result};
use crate::interrupt::Interrupt;
use crate::phase::{Action, Phase, StepPhase, select_phases};
use crate::queue::{Job, Outcome, Queue, Task};
use crate::types::{Context, ExitRequest, Flow, StepOutcome, StepStatus};
use crate::workdir::StepWorkdir;
use guestkit::{GuestRecord, GuestRef};
use logkit::Logger;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const STEP_NAME: &str = "provision";

/// A plugin bringing up one guest.
pub trait ProvisionPlugin: Phase {
    /// Whether the plugin may run in parallel with other thread-safe plugins.
    fn is_thread_safe(&self) -> bool {
        false
    }

    /// Provision the guest.
    fn go(&self, logger: &Logger) -> Result<Flow<()>>;

    /// The guest, once the plugin created it, even if provisioning failed
    /// half way.
    fn guest(&self) -> Option<GuestRef>;

    /// Re-attach to the guest of a previous invocation.
    fn wake(&self, record: &GuestRecord, logger: &Logger) -> Result<()>;
}

pub type ProvisionPhase = StepPhase<dyn ProvisionPlugin>;

/// A run of adjacent phases executed together.
#[derive(Debug, Clone)]
pub enum Batch {
    Actions(Vec<Arc<dyn Action>>),
    Plugins(Vec<Arc<dyn ProvisionPlugin>>),
}

impl Batch {
    pub fn len(&self) -> usize {
        match self {
            Batch::Actions(actions) => actions.len(),
            Batch::Plugins(plugins) => plugins.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for dyn ProvisionPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionPlugin")
            .field("name", &self.name())
            .field("how", &self.how())
            .finish()
    }
}

/// Cut order-sorted phases into batches, keeping their order.
pub fn plan_batches(phases: &[ProvisionPhase]) -> Vec<Batch> {
    let mut batches: Vec<Batch> = Vec::new();

    for phase in phases {
        match (phase, batches.last_mut()) {
            (StepPhase::Action(action), Some(Batch::Actions(actions))) => {
                actions.push(Arc::clone(action));
            }
            (StepPhase::Action(action), _) => {
                batches.push(Batch::Actions(vec![Arc::clone(action)]));
            }
            (StepPhase::Plugin(plugin), Some(Batch::Plugins(plugins)))
                if plugin.is_thread_safe() && plugins.iter().all(|p| p.is_thread_safe()) =>
            {
                plugins.push(Arc::clone(plugin));
            }
            (StepPhase::Plugin(plugin), _) => {
                batches.push(Batch::Plugins(vec![Arc::clone(plugin)]));
            }
        }
    }

    batches
}

struct ProvisionJob {
    plugin: Arc<dyn ProvisionPlugin>,
    announce: bool,
}

impl Job<()> for ProvisionJob {
    fn phase(&self) -> &str {
        self.plugin.name()
    }

    fn run(&self, logger: &Logger) -> Result<Flow<()>> {
        if self.announce {
            logger.info("phase", "started");
        }
        self.plugin.go(logger)
    }

    fn guest(&self) -> Option<GuestRef> {
        self.plugin.guest()
    }
}

/// The provision step of one run.
pub struct Provision {
    logger: Logger,
    workdir: StepWorkdir,
    phases: Vec<ProvisionPhase>,
    context: Context,
    interrupt: Interrupt,
    dry: bool,
    status: StepStatus,
    guests: Vec<GuestRef>,
}

impl Provision {
    pub fn new(phases: Vec<ProvisionPhase>, workdir: StepWorkdir, logger: Logger) -> Self {
        Self {
            logger,
            workdir,
            phases,
            context: Context::new(),
            interrupt: Interrupt::new(),
            dry: false,
            status: StepStatus::Todo,
            guests: Vec::new(),
        }
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn with_dry(mut self, dry: bool) -> Self {
        self.dry = dry;
        self
    }

    pub fn phases(&self) -> &[ProvisionPhase] {
        &self.phases
    }

    pub fn plugins(&self) -> impl Iterator<Item = &Arc<dyn ProvisionPlugin>> {
        self.phases.iter().filter_map(StepPhase::plugin)
    }

    pub fn status(&self) -> StepStatus {
        self.status
    }

    /// Every guest known to the step.
    pub fn guests(&self) -> &[GuestRef] {
        &self.guests
    }

    /// Guests able to accept commands. In dry mode every guest counts.
    pub fn ready_guests(&self) -> Vec<GuestRef> {
        self.guests
            .iter()
            .filter(|guest| self.dry || guest.is_ready())
            .cloned()
            .collect()
    }

    /// Load the step status and re-attach guests saved by a previous run.
    pub fn wake(&mut self) -> Result<()> {
        self.status = self.workdir.load_status()?;
        let records = self.workdir.load_guests()?;
        if records.is_empty() {
            return Ok(());
        }

        self.guests.clear();
        for phase in &self.phases {
            let StepPhase::Plugin(plugin) = phase else {
                continue;
            };
            let Some(record) = records.get(plugin.name()) else {
                continue;
            };
            let logger = self.logger.descend(plugin.name());
            plugin.wake(record, &logger)?;
            if let Some(guest) = plugin.guest() {
                logger.debug(format!("Woke up guest '{}'.", guest.full_name()), 1);
                self.guests.push(guest);
            }
        }
        Ok(())
    }

    /// Provision all guests.
    pub fn go(&mut self) -> Result<StepOutcome> {
        if self.status == StepStatus::Done {
            self.logger.info("status", "done");
            self.summary();
            return Ok(Flow::Done(()));
        }

        let phases = select_phases(&self.phases, &self.context)?;
        let batches = plan_batches(&phases);
        self.logger.debug(
            format!("Provisioning in {} batch(es).", batches.len()),
            2,
        );

        self.guests.clear();
        let mut failures: Vec<Error> = Vec::new();
        let mut exits: Vec<ExitRequest> = Vec::new();

        for batch in batches {
            if self.interrupt.is_set() {
                return Err(self.interrupted());
            }

            let multiple = batch.len() > 1;
            let mut queue: Queue<()> = Queue::new(STEP_NAME, self.logger.clone());
            match batch {
                Batch::Actions(actions) => {
                    for action in actions {
                        queue.enqueue_action(action, &self.guests);
                    }
                }
                Batch::Plugins(plugins) => {
                    let jobs = plugins
                        .into_iter()
                        .map(|plugin| {
                            let job: Box<dyn Job<()>> = Box::new(ProvisionJob {
                                plugin,
                                announce: multiple,
                            });
                            job
                        })
                        .collect();
                    queue.enqueue(Task::parallel(STEP_NAME, jobs));
                }
            }

            for outcome in queue.run() {
                if multiple {
                    outcome.logger.info("phase", "finished");
                }

                match outcome.outcome {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => {
                        outcome.logger.fail(&e);
                        failures.push(e);
                    }
                    Outcome::Exit(request) => exits.push(request),
                }

                if let Some(guest) = outcome.guest {
                    self.show_guest(&outcome.logger, &guest);
                    self.guests.push(guest);
                }

                if self.interrupt.is_set() {
                    return Err(self.interrupted());
                }
            }
        }

        if let Some(request) = exits.into_iter().next() {
            return Ok(Flow::Exit(request));
        }

        if !failures.is_empty() {
            return Err(Error::step_failed(STEP_NAME, failures));
        }

        self.summary();
        self.status = StepStatus::Done;
        self.save()?;
        Ok(Flow::Done(()))
    }

    fn show_guest(&self, logger: &Logger, guest: &GuestRef) {
        let data = guest.data();
        logger.info("guest", guest.full_name());
        if let Some(address) = &data.primary_address {
            logger.verbose("primary address", address, 1);
        }
        if let Some(address) = &data.topology_address {
            logger.verbose("topology address", address, 2);
        }
    }

    fn summary(&self) {
        self.logger
            .info("summary", format!("{} guest(s) provisioned", self.guests.len()));
    }

    /// Keep every guest a plugin already holds, then report the interruption.
    fn interrupted(&mut self) -> Error {
        self.guests = self.plugins().filter_map(|plugin| plugin.guest()).collect();
        self.logger.warn(format!(
            "Interrupted, keeping {} provisioned guest(s).",
            self.guests.len()
        ));
        if let Err(e) = self.save_guests() {
            self.logger.warn(format!("Cannot save guests: {e}"));
        }
        Error::Interrupted {
            guests: self.guests.iter().map(|guest| guest.name().to_string()).collect(),
        }
    }

    fn save_guests(&self) -> Result<()> {
        let records: BTreeMap<String, GuestRecord> = self
            .guests
            .iter()
            .map(|guest| {
                (
                    guest.name().to_string(),
                    GuestRecord {
                        how: guest.how().to_string(),
                        data: guest.data(),
                    },
                )
            })
            .collect();
        self.workdir.save_guests(&records)
    }

    /// Persist the step status and guests.
    pub fn save(&self) -> Result<()> {
        self.workdir.save_status(self.status)?;
        self.save_guests()
    }
}
