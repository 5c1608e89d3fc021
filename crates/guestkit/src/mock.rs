//! Scripted in-memory guest for testing without real machines.
//!
//! ```
//! use guestkit::{Command, ExecuteOptions, Guest, MockGuest};
//!
//! let guest = MockGuest::new("default-0").respond("arch", "x86_64\n");
//! let output = guest.execute(&Command::new("arch"), &ExecuteOptions::default()).unwrap();
//! assert_eq!(output.stdout, "x86_64\n");
//! ```

use crate::command::{Command, CommandOutput, ExecuteOptions};
use crate::data::GuestData;
use crate::error::{Error, Result};
use crate::facts::{FactsCache, GuestFacts};
use crate::guest::{Guest, SyncRequest};
use crate::lock;
use logkit::Logger;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

type Response = std::result::Result<String, i32>;

/// Guest answering commands from a script.
///
/// Each command string maps to a queue of responses; the last response is
/// repeated once the queue is drained. Unknown commands succeed with empty
/// output.
#[derive(Debug)]
pub struct MockGuest {
    name: String,
    data: GuestData,
    logger: Logger,
    ready: AtomicBool,
    facts: FactsCache,
    responses: Mutex<HashMap<String, VecDeque<Response>>>,
    executed: Mutex<Vec<String>>,
    syncs: Mutex<Vec<String>>,
    fail_syncs: AtomicBool,
    lifecycle: Mutex<Vec<String>>,
}

impl MockGuest {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            logger: Logger::new(name.clone()),
            name,
            data: GuestData::default(),
            ready: AtomicBool::new(true),
            facts: FactsCache::default(),
            responses: Mutex::new(HashMap::new()),
            executed: Mutex::new(Vec::new()),
            syncs: Mutex::new(Vec::new()),
            fail_syncs: AtomicBool::new(false),
            lifecycle: Mutex::new(Vec::new()),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.data.role = Some(role.into());
        self
    }

    pub fn with_data(mut self, data: GuestData) -> Self {
        self.data = data;
        self
    }

    pub fn with_facts(self, facts: GuestFacts) -> Self {
        Self {
            facts: FactsCache::new(facts),
            ..self
        }
    }

    pub fn respond_results<I>(self, command: &str, responses: I) -> Self
    where
        I: IntoIterator<Item = Response>,
    {
        lock(&self.responses).insert(command.to_string(), responses.into_iter().collect());
        self
    }

    pub fn respond(self, command: &str, stdout: &str) -> Self {
        self.respond_results(command, [Ok(stdout.to_string())])
    }

    pub fn respond_sequence<'a, I>(self, command: &str, outputs: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let responses: Vec<Response> = outputs.into_iter().map(|o| Ok(o.to_string())).collect();
        self.respond_results(command, responses)
    }

    pub fn fail(self, command: &str, exit_code: i32) -> Self {
        self.respond_results(command, [Err(exit_code)])
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Every command executed so far, in order.
    pub fn executed(&self) -> Vec<String> {
        lock(&self.executed).clone()
    }

    pub fn count_executed(&self, command: &str) -> usize {
        lock(&self.executed).iter().filter(|c| *c == command).count()
    }

    /// Make every `push` and `pull` fail.
    pub fn fail_syncs(self) -> Self {
        self.fail_syncs.store(true, Ordering::SeqCst);
        self
    }

    /// Recorded `stop`/`suspend`/`remove` calls.
    pub fn lifecycle(&self) -> Vec<String> {
        lock(&self.lifecycle).clone()
    }

    fn sync(&self, action: &str) -> Result<()> {
        lock(&self.syncs).push(action.to_string());
        if self.fail_syncs.load(Ordering::SeqCst) {
            return Err(Error::Provision {
                message: format!("Failed to {action} workdir of guest '{}'.", self.name),
            });
        }
        Ok(())
    }

    /// Recorded `push`/`pull` calls.
    pub fn syncs(&self) -> Vec<String> {
        lock(&self.syncs).clone()
    }

    fn next_response(&self, command: &str) -> Response {
        let mut responses = lock(&self.responses);
        match responses.get_mut(command) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(Ok(String::new())),
            Some(queue) => queue.front().cloned().unwrap_or(Ok(String::new())),
            None => Ok(String::new()),
        }
    }
}

impl Guest for MockGuest {
    fn name(&self) -> &str {
        &self.name
    }

    fn how(&self) -> &str {
        "mock"
    }

    fn data(&self) -> GuestData {
        GuestData {
            facts: self.facts.snapshot(),
            ..self.data.clone()
        }
    }

    fn logger(&self) -> &Logger {
        &self.logger
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn execute(&self, command: &Command, _options: &ExecuteOptions) -> Result<CommandOutput> {
        let rendered = command.to_string();
        lock(&self.executed).push(rendered.clone());

        match self.next_response(&rendered) {
            Ok(stdout) => Ok(CommandOutput {
                stdout,
                stderr: String::new(),
            }),
            Err(code) => Err(Error::run(rendered, Some(code), "", "")),
        }
    }

    fn push(&self, _request: &SyncRequest) -> Result<()> {
        self.sync("push")
    }

    fn pull(&self, _request: &SyncRequest) -> Result<()> {
        self.sync("pull")
    }

    fn facts(&self) -> GuestFacts {
        self.facts.get(self, &self.logger)
    }

    fn invalidate_facts(&self) {
        self.facts.invalidate();
    }

    fn stop(&self) -> Result<()> {
        lock(&self.lifecycle).push("stop".to_string());
        Ok(())
    }

    fn suspend(&self) -> Result<()> {
        lock(&self.lifecycle).push("suspend".to_string());
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        lock(&self.lifecycle).push("remove".to_string());
        Ok(())
    }
}
