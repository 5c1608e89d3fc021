//! Task queue running phases against guests.
//!
//! A [`Queue`] is filled with tasks before [`Queue::run`] is called. Each task
//! is a list of jobs, one per (phase, guest) combination, or a single job for
//! an action. `run` returns a lazy iterator: a task starts only when the
//! iterator reaches it, and every job yields exactly one [`TaskOutcome`].
//!
//! Jobs of a parallel task run on a dedicated thread pool sized to the job
//! count, and their outcomes arrive in completion order. Failures, panics and
//! exit requests are captured in the outcome instead of being propagated, so
//! the caller always sees every job of a task.

use crate::error::{Error, Result};
use crate::phase::{Action, Phase};
use crate::types::{ExitRequest, Flow};
use guestkit::{GuestRef, SyncRequest};
use logkit::{Logger, prepare_loggers};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};

/// What one job ended with.
#[derive(Debug)]
pub enum Outcome<T> {
    Ok(T),
    Err(Error),
    /// The phase asked the whole run to stop
    Exit(ExitRequest),
}

impl<T> Outcome<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok(_))
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            Outcome::Err(e) => Some(e),
            _ => None,
        }
    }

    pub fn exit(&self) -> Option<&ExitRequest> {
        match self {
            Outcome::Exit(request) => Some(request),
            _ => None,
        }
    }
}

impl<T> From<Result<Flow<T>>> for Outcome<T> {
    fn from(result: Result<Flow<T>>) -> Self {
        match result {
            Ok(Flow::Done(value)) => Outcome::Ok(value),
            Ok(Flow::Exit(request)) => Outcome::Exit(request),
            Err(e) => Outcome::Err(e),
        }
    }
}

/// Record of one finished job.
pub struct TaskOutcome<T> {
    /// Name of the task the job belonged to
    pub task: String,
    pub phase: String,
    pub guest: Option<GuestRef>,
    /// Logger the job ran with
    pub logger: Logger,
    pub outcome: Outcome<T>,
}

impl<T: fmt::Debug> fmt::Debug for TaskOutcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskOutcome")
            .field("task", &self.task)
            .field("phase", &self.phase)
            .field("guest", &self.guest.as_ref().map(|guest| guest.name().to_string()))
            .field("outcome", &self.outcome)
            .finish()
    }
}

/// One unit of work inside a task.
pub trait Job<T>: Send + Sync {
    fn phase(&self) -> &str;

    /// Label used for the job's logger when the task has several jobs.
    fn label(&self) -> String {
        self.phase().to_string()
    }

    fn run(&self, logger: &Logger) -> Result<Flow<T>>;

    /// Guest the outcome is attributed to, read after `run` returned.
    fn guest(&self) -> Option<GuestRef>;
}

/// A named group of jobs, run in parallel or one by one.
pub struct Task<T> {
    name: String,
    jobs: Vec<Box<dyn Job<T>>>,
    parallel: bool,
}

impl<T> Task<T> {
    pub fn parallel(name: impl Into<String>, jobs: Vec<Box<dyn Job<T>>>) -> Self {
        Self {
            name: name.into(),
            jobs,
            parallel: true,
        }
    }

    pub fn sequential(name: impl Into<String>, jobs: Vec<Box<dyn Job<T>>>) -> Self {
        Self {
            name: name.into(),
            jobs,
            parallel: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Per-guest entry point of a plugin.
pub type PluginGo<P, T> = fn(&P, &GuestRef, &Logger) -> Result<Flow<T>>;

struct ActionJob {
    action: Arc<dyn Action>,
    guests: Vec<GuestRef>,
}

impl<T: Default> Job<T> for ActionJob {
    fn phase(&self) -> &str {
        self.action.name()
    }

    fn run(&self, logger: &Logger) -> Result<Flow<T>> {
        Ok(self
            .action
            .go(&self.guests, logger)?
            .map(|()| T::default()))
    }

    fn guest(&self) -> Option<GuestRef> {
        None
    }
}

struct PluginJob<P: ?Sized, T> {
    phase: Arc<P>,
    guest: GuestRef,
    go: PluginGo<P, T>,
}

impl<P: Phase + ?Sized, T> Job<T> for PluginJob<P, T> {
    fn phase(&self) -> &str {
        self.phase.name()
    }

    fn label(&self) -> String {
        self.guest.name().to_string()
    }

    fn run(&self, logger: &Logger) -> Result<Flow<T>> {
        (self.go)(&*self.phase, &self.guest, logger)
    }

    fn guest(&self) -> Option<GuestRef> {
        Some(Arc::clone(&self.guest))
    }
}

/// Ordered list of tasks.
pub struct Queue<T> {
    name: String,
    logger: Logger,
    tasks: Vec<Task<T>>,
}

impl<T: Send + 'static> Queue<T> {
    pub fn new(name: impl Into<String>, logger: Logger) -> Self {
        Self {
            name: name.into(),
            logger,
            tasks: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn enqueue(&mut self, task: Task<T>) {
        self.logger.debug(
            format!("Queued {} task '{}' with {} job(s).", self.name, task.name, task.len()),
            3,
        );
        self.tasks.push(task);
    }

    /// Queue an action, run once for all `guests`.
    pub fn enqueue_action(&mut self, action: Arc<dyn Action>, guests: &[GuestRef])
    where
        T: Default,
    {
        let name = action.name().to_string();
        let job: Box<dyn Job<T>> = Box::new(ActionJob {
            action,
            guests: guests.to_vec(),
        });
        self.enqueue(Task::sequential(name, vec![job]));
    }

    /// Queue a plugin, run by `go` once per guest, guests in parallel.
    pub fn enqueue_plugin<P>(&mut self, phase: Arc<P>, guests: &[GuestRef], go: PluginGo<P, T>) -> Result<()>
    where
        P: Phase + ?Sized + 'static,
    {
        let name = phase.name().to_string();
        let jobs = guests
            .iter()
            .map(|guest| {
                let job: Box<dyn Job<T>> = Box::new(PluginJob {
                    phase: Arc::clone(&phase),
                    guest: Arc::clone(guest),
                    go,
                });
                job
            })
            .collect();
        self.enqueue_guest_jobs(name, jobs)
    }

    /// Queue per-guest jobs of one phase, run in parallel.
    ///
    /// A phase left with no guests is a plan error, most likely a typo in `where`.
    pub fn enqueue_guest_jobs(&mut self, phase: impl Into<String>, jobs: Vec<Box<dyn Job<T>>>) -> Result<()> {
        let phase = phase.into();
        if jobs.is_empty() {
            return Err(Error::Metadata(format!(
                "No guests queued for phase \"{phase}\". A typo in \"where\" key?"
            )));
        }
        self.enqueue(Task::parallel(phase, jobs));
        Ok(())
    }

    /// Start iterating over outcomes, running tasks as they are reached.
    pub fn run(self) -> QueueRun<T> {
        QueueRun {
            logger: self.logger,
            tasks: self.tasks.into(),
            current: None,
        }
    }
}

/// Lazy iterator over the outcomes of a queue.
pub struct QueueRun<T> {
    logger: Logger,
    tasks: VecDeque<Task<T>>,
    current: Option<TaskRun<T>>,
}

enum TaskRun<T> {
    Inline {
        task: String,
        jobs: VecDeque<(Box<dyn Job<T>>, Logger)>,
    },
    Pooled {
        receiver: Receiver<TaskOutcome<T>>,
        // Kept alive until every outcome was received.
        _pool: ThreadPool,
    },
}

impl<T: Send + 'static> TaskRun<T> {
    fn start(task: Task<T>, base: &Logger) -> Self {
        let Task {
            name,
            jobs,
            parallel,
        } = task;

        let labels: Vec<String> = jobs.iter().map(|job| job.label()).collect();
        let loggers = if jobs.len() > 1 {
            prepare_loggers(base, &labels)
        } else {
            BTreeMap::new()
        };
        let jobs: VecDeque<(Box<dyn Job<T>>, Logger)> = jobs
            .into_iter()
            .zip(labels)
            .map(|(job, label)| {
                let logger = loggers.get(&label).cloned().unwrap_or_else(|| base.clone());
                (job, logger)
            })
            .collect();

        if !parallel || jobs.len() < 2 {
            return TaskRun::Inline { task: name, jobs };
        }

        let pool = match ThreadPoolBuilder::new()
            .num_threads(jobs.len())
            .thread_name(|index| format!("testrun-worker-{index}"))
            .build()
        {
            Ok(pool) => pool,
            Err(e) => {
                base.warn(format!("Cannot start worker threads for '{name}', running jobs one by one: {e}"));
                return TaskRun::Inline { task: name, jobs };
            }
        };

        let (sender, receiver) = mpsc::channel();
        for (job, logger) in jobs {
            let sender = sender.clone();
            let task = name.clone();
            pool.spawn(move || {
                let outcome = run_job(&task, job.as_ref(), logger);
                if sender.send(outcome).is_err() {
                    log::debug!("Outcome of task '{task}' dropped, nobody is listening.");
                }
            });
        }

        TaskRun::Pooled {
            receiver,
            _pool: pool,
        }
    }

    fn next_outcome(&mut self) -> Option<TaskOutcome<T>> {
        match self {
            TaskRun::Inline { task, jobs } => {
                let (job, logger) = jobs.pop_front()?;
                Some(run_job(task, job.as_ref(), logger))
            }
            TaskRun::Pooled { receiver, .. } => receiver.recv().ok(),
        }
    }
}

impl<T: Send + 'static> Iterator for QueueRun<T> {
    type Item = TaskOutcome<T>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(current) = &mut self.current {
                if let Some(outcome) = current.next_outcome() {
                    return Some(outcome);
                }
                self.current = None;
            }

            let task = self.tasks.pop_front()?;
            self.current = Some(TaskRun::start(task, &self.logger));
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn run_job<T>(task: &str, job: &dyn Job<T>, logger: Logger) -> TaskOutcome<T> {
    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| job.run(&logger))) {
        Ok(result) => Outcome::from(result),
        Err(payload) => Outcome::Err(Error::PhasePanicked {
            phase: job.phase().to_string(),
            message: panic_message(payload.as_ref()),
        }),
    };

    TaskOutcome {
        task: task.to_string(),
        phase: job.phase().to_string(),
        guest: job.guest(),
        logger,
        outcome,
    }
}

/// Direction of a workdir synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Push,
    Pull,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::Push => "push",
            SyncAction::Pull => "pull",
        }
    }
}

struct SyncJob {
    action: SyncAction,
    guest: GuestRef,
    request: SyncRequest,
}

impl Job<()> for SyncJob {
    fn phase(&self) -> &str {
        self.action.as_str()
    }

    fn label(&self) -> String {
        self.guest.name().to_string()
    }

    fn run(&self, _logger: &Logger) -> Result<Flow<()>> {
        match self.action {
            SyncAction::Push => self.guest.push(&self.request)?,
            SyncAction::Pull => self.guest.pull(&self.request)?,
        }
        Ok(Flow::Done(()))
    }

    fn guest(&self) -> Option<GuestRef> {
        Some(Arc::clone(&self.guest))
    }
}

/// Push to or pull from every guest in parallel.
///
/// Fails with `"{step} step failed"` carrying one cause per failed guest.
pub fn sync_with_guests(
    step: &str,
    action: SyncAction,
    guests: &[GuestRef],
    request: &SyncRequest,
    logger: &Logger,
) -> Result<()> {
    if guests.is_empty() {
        return Ok(());
    }

    let jobs = guests
        .iter()
        .map(|guest| {
            let job: Box<dyn Job<()>> = Box::new(SyncJob {
                action,
                guest: Arc::clone(guest),
                request: request.clone(),
            });
            job
        })
        .collect();

    let mut queue = Queue::new(action.as_str(), logger.clone());
    queue.enqueue(Task::parallel(action.as_str(), jobs));

    let mut failures = Vec::new();
    for outcome in queue.run() {
        if let Outcome::Err(e) = outcome.outcome {
            outcome.logger.fail(&e);
            failures.push(e);
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(Error::step_failed(step, failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::PhaseData;
    use guestkit::MockGuest;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    struct Recorder {
        data: PhaseData,
        calls: AtomicUsize,
    }

    impl Recorder {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                data: PhaseData::new(name, "recorder"),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl Phase for Recorder {
        fn data(&self) -> &PhaseData {
            &self.data
        }
    }

    fn record(plugin: &Recorder, guest: &GuestRef, _logger: &Logger) -> Result<Flow<String>> {
        plugin.calls.fetch_add(1, Ordering::SeqCst);
        match guest.name() {
            "broken" => Err(Error::Other("guest is broken".to_string())),
            "quitter" => Ok(Flow::Exit(ExitRequest::new(0, "done listing"))),
            "panicky" => panic!("phase exploded"),
            "slow" => {
                thread::sleep(Duration::from_millis(300));
                Ok(Flow::Done(format!("{}@slow", plugin.name())))
            }
            name => Ok(Flow::Done(format!("{}@{name}", plugin.name()))),
        }
    }

    fn guests(names: &[&str]) -> Vec<GuestRef> {
        names
            .iter()
            .map(|name| {
                let guest: GuestRef = Arc::new(MockGuest::new(*name));
                guest
            })
            .collect()
    }

    #[derive(Debug)]
    struct Marker {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl Action for Marker {
        fn name(&self) -> &str {
            "marker"
        }

        fn order(&self) -> i32 {
            50
        }

        fn go(&self, guests: &[GuestRef], _logger: &Logger) -> Result<Flow<()>> {
            let mut events = self.events.lock().unwrap();
            events.push(format!("marker on {} guest(s)", guests.len()));
            Ok(Flow::Done(()))
        }
    }

    #[test]
    fn test_plugin_yields_one_outcome_per_guest() {
        let mut queue = Queue::new("prepare", Logger::new("prepare"));
        let plugin = Recorder::new("setup");
        queue
            .enqueue_plugin(Arc::clone(&plugin), &guests(&["a", "b", "c"]), record)
            .unwrap();

        let outcomes: Vec<_> = queue.run().collect();
        assert_eq!(outcomes.len(), 3);
        assert_eq!(plugin.calls.load(Ordering::SeqCst), 3);

        let mut values: Vec<String> = outcomes
            .into_iter()
            .map(|outcome| match outcome.outcome {
                Outcome::Ok(value) => value,
                other => panic!("unexpected outcome {other:?}"),
            })
            .collect();
        values.sort();
        assert_eq!(values, vec!["setup@a", "setup@b", "setup@c"]);
    }

    #[test]
    fn test_action_runs_once_without_guest() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut queue: Queue<String> = Queue::new("provision", Logger::new("provision"));
        queue.enqueue_action(
            Arc::new(Marker {
                events: Arc::clone(&events),
            }),
            &guests(&["a", "b"]),
        );

        let outcomes: Vec<_> = queue.run().collect();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].phase, "marker");
        assert!(outcomes[0].guest.is_none());
        assert!(matches!(&outcomes[0].outcome, Outcome::Ok(value) if value.is_empty()));
        assert_eq!(*events.lock().unwrap(), vec!["marker on 2 guest(s)"]);
    }

    #[test]
    fn test_failures_and_exit_requests_are_contained() {
        let mut queue = Queue::new("prepare", Logger::new("prepare"));
        queue
            .enqueue_plugin(Recorder::new("setup"), &guests(&["ok", "broken", "quitter"]), record)
            .unwrap();

        let outcomes: Vec<_> = queue.run().collect();
        assert_eq!(outcomes.len(), 3);

        let by_guest = |name: &str| {
            outcomes
                .iter()
                .find(|o| o.guest.as_ref().is_some_and(|g| g.name() == name))
                .unwrap()
        };
        assert!(by_guest("ok").outcome.is_ok());
        assert_eq!(
            by_guest("broken").outcome.error().unwrap().to_string(),
            "guest is broken"
        );
        assert_eq!(by_guest("quitter").outcome.exit().unwrap().reason, "done listing");
    }

    #[test]
    fn test_panic_becomes_an_outcome() {
        let mut queue = Queue::new("prepare", Logger::new("prepare"));
        queue
            .enqueue_plugin(Recorder::new("setup"), &guests(&["panicky", "fine"]), record)
            .unwrap();

        let outcomes: Vec<_> = queue.run().collect();
        assert_eq!(outcomes.len(), 2);

        let panicked = outcomes
            .iter()
            .find_map(|o| o.outcome.error())
            .unwrap();
        assert!(matches!(
            panicked,
            Error::PhasePanicked { phase, message } if phase == "setup" && message == "phase exploded"
        ));
    }

    #[test]
    fn test_no_guests_for_plugin() {
        let mut queue: Queue<String> = Queue::new("prepare", Logger::new("prepare"));
        let err = queue
            .enqueue_plugin(Recorder::new("setup"), &[], record)
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "No guests queued for phase \"setup\". A typo in \"where\" key?"
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_outcomes_arrive_in_completion_order() {
        let mut queue = Queue::new("prepare", Logger::new("prepare"));
        queue
            .enqueue_plugin(Recorder::new("setup"), &guests(&["slow", "fast"]), record)
            .unwrap();

        let order: Vec<String> = queue
            .run()
            .filter_map(|o| o.guest.map(|g| g.name().to_string()))
            .collect();
        assert_eq!(order, vec!["fast", "slow"]);
    }

    #[test]
    fn test_tasks_start_lazily() {
        let first = Recorder::new("first");
        let second = Recorder::new("second");
        let mut queue = Queue::new("prepare", Logger::new("prepare"));
        queue
            .enqueue_plugin(Arc::clone(&first), &guests(&["a"]), record)
            .unwrap();
        queue
            .enqueue_plugin(Arc::clone(&second), &guests(&["a"]), record)
            .unwrap();

        let mut run = queue.run();
        assert!(run.next().is_some());
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);

        drop(run);
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_loggers_are_labelled_per_guest() {
        let mut queue = Queue::new("prepare", Logger::new("prepare"));
        queue
            .enqueue_plugin(Recorder::new("multi"), &guests(&["a", "bbb"]), record)
            .unwrap();
        queue
            .enqueue_plugin(Recorder::new("single"), &guests(&["a"]), record)
            .unwrap();

        for outcome in queue.run() {
            let label = outcome.logger.label().map(str::to_string);
            match outcome.phase.as_str() {
                "multi" => {
                    let guest = outcome.guest.unwrap();
                    assert_eq!(label.unwrap().trim_end(), guest.name());
                }
                _ => assert!(label.is_none()),
            }
        }
    }

    #[test]
    fn test_sync_with_guests() {
        let a = Arc::new(MockGuest::new("a"));
        let b = Arc::new(MockGuest::new("b"));
        let all: Vec<GuestRef> = vec![a.clone(), b.clone()];
        let logger = Logger::new("prepare");

        sync_with_guests("prepare", SyncAction::Push, &all, &SyncRequest::default(), &logger).unwrap();
        sync_with_guests("prepare", SyncAction::Pull, &all, &SyncRequest::default(), &logger).unwrap();
        sync_with_guests("prepare", SyncAction::Push, &[], &SyncRequest::default(), &logger).unwrap();

        assert_eq!(a.syncs(), vec!["push", "pull"]);
        assert_eq!(b.syncs(), vec!["push", "pull"]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_one_outcome_per_phase_and_guest(
            guest_counts in proptest::collection::vec(1usize..5, 1..4),
        ) {
            let mut queue = Queue::new("prepare", Logger::new("prepare"));
            let mut expected = HashSet::new();

            for (index, count) in guest_counts.iter().enumerate() {
                let phase = format!("phase-{index}");
                let names: Vec<String> = (0..*count).map(|g| format!("guest-{g}")).collect();
                let refs: Vec<&str> = names.iter().map(String::as_str).collect();
                for name in &names {
                    expected.insert((phase.clone(), name.clone()));
                }
                queue.enqueue_plugin(Recorder::new(&phase), &guests(&refs), record).unwrap();
            }

            let seen: Vec<(String, String)> = queue
                .run()
                .map(|o| (o.phase, o.guest.map(|g| g.name().to_string()).unwrap_or_default()))
                .collect();

            prop_assert_eq!(seen.len(), guest_counts.iter().sum::<usize>());
            let unique: HashSet<_> = seen.into_iter().collect();
            prop_assert_eq!(unique, expected);
        }
    }
}
