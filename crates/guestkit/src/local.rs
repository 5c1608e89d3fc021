//! The machine running the orchestrator, used as a guest.

use crate::command::{self, Command, CommandOutput, ExecuteOptions};
use crate::data::GuestData;
use crate::error::Result;
use crate::facts::{FactsCache, GuestFacts};
use crate::guest::{Guest, RebootMode, SyncRequest};
use logkit::Logger;
use waiting::Waiting;

/// Guest executing commands directly on localhost.
#[derive(Debug)]
pub struct GuestLocal {
    name: String,
    data: GuestData,
    logger: Logger,
    facts: FactsCache,
}

impl GuestLocal {
    pub fn new(name: impl Into<String>, data: GuestData, logger: Logger) -> Self {
        let facts = FactsCache::new(data.facts.clone());
        Self {
            name: name.into(),
            data: GuestData {
                primary_address: Some("localhost".to_string()),
                ..data
            },
            logger,
            facts,
        }
    }
}

impl Guest for GuestLocal {
    fn name(&self) -> &str {
        &self.name
    }

    fn how(&self) -> &str {
        "local"
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
        true
    }

    fn execute(&self, command: &Command, options: &ExecuteOptions) -> Result<CommandOutput> {
        command::run_local(&command.to_argv(), options, &self.logger)
    }

    fn push(&self, _request: &SyncRequest) -> Result<()> {
        self.logger.debug("Nothing to push to the local guest.", 2);
        Ok(())
    }

    fn pull(&self, _request: &SyncRequest) -> Result<()> {
        self.logger.debug("Nothing to pull from the local guest.", 2);
        Ok(())
    }

    fn facts(&self) -> GuestFacts {
        self.facts.get(self, &self.logger)
    }

    fn invalidate_facts(&self) {
        self.facts.invalidate();
    }

    fn reboot(&self, _mode: RebootMode, _command: Option<&Command>, _waiting: Option<Waiting>) -> Result<bool> {
        self.logger.warn("Refusing to reboot the machine running the tests.");
        Ok(false)
    }
}
