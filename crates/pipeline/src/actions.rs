//! Built-in actions inserted into steps from the command line.

use crate::error::{Error, Result};
use crate::phase::{Action, PHASE_ORDER_END, PHASE_ORDER_START};
use crate::types::Flow;
use guestkit::{Command, ExecuteOptions, GuestRef, RebootMode};
use logkit::Logger;
use std::fmt;
use std::str::FromStr;

/// Steps of a run, in execution order.
pub const STEPS: [&str; 6] = ["discover", "provision", "prepare", "execute", "finish", "report"];

/// Where to insert an action: `STEP`, `STEP:ORDER`, `STEP:start` or `STEP:end`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionSpec {
    pub step: String,
    pub order: i32,
}

impl FromStr for ActionSpec {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        let (step, order) = match value.split_once(':') {
            Some((step, order)) => (step, Some(order)),
            None => (value, None),
        };

        if !STEPS.contains(&step) {
            return Err(Error::Specification(format!(
                "unknown step '{step}', expected one of: {}",
                STEPS.join(", ")
            )));
        }

        let order = match order {
            None | Some("end") => PHASE_ORDER_END,
            Some("start") => PHASE_ORDER_START,
            Some(order) => order.parse().map_err(|_| {
                Error::Specification(format!(
                    "invalid order '{order}' in '{value}', expected a number, 'start' or 'end'"
                ))
            })?,
        };

        Ok(Self {
            step: step.to_string(),
            order,
        })
    }
}

impl fmt::Display for ActionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.step, self.order)
    }
}

/// Reboot every guest and wait for it to come back.
#[derive(Debug, Clone)]
pub struct Reboot {
    order: i32,
    mode: RebootMode,
}

impl Reboot {
    pub fn new(order: i32) -> Self {
        Self {
            order,
            mode: RebootMode::Soft,
        }
    }

    pub fn with_mode(mut self, mode: RebootMode) -> Self {
        self.mode = mode;
        self
    }
}

impl Action for Reboot {
    fn name(&self) -> &str {
        "reboot"
    }

    fn order(&self) -> i32 {
        self.order
    }

    fn go(&self, guests: &[GuestRef], logger: &Logger) -> Result<Flow<()>> {
        for guest in guests {
            logger.info("reboot", format!("{} ({} reboot)", guest.full_name(), self.mode));
            if !guest.reboot(self.mode, None, None)? {
                return Err(Error::Other(format!(
                    "Guest '{}' did not come back after reboot.",
                    guest.name()
                )));
            }
        }
        Ok(Flow::Done(()))
    }
}

/// Open an interactive shell on every guest.
#[derive(Debug, Clone)]
pub struct Login {
    order: i32,
    command: Command,
}

impl Login {
    pub fn new(order: i32) -> Self {
        Self {
            order,
            command: Command::new("bash"),
        }
    }

    pub fn with_command(mut self, command: Command) -> Self {
        self.command = command;
        self
    }
}

impl Action for Login {
    fn name(&self) -> &str {
        "login"
    }

    fn order(&self) -> i32 {
        self.order
    }

    fn go(&self, guests: &[GuestRef], logger: &Logger) -> Result<Flow<()>> {
        let options = ExecuteOptions {
            interactive: true,
            ..ExecuteOptions::default()
        };
        for guest in guests {
            logger.info("login", format!("Starting interactive shell on {}", guest.full_name()));
            match guest.execute(&self.command, &options) {
                Ok(_) => {}
                // The shell exits with whatever the user ran last.
                Err(e @ guestkit::Error::Run { .. }) => logger.debug(e, 1),
                Err(e) => return Err(e.into()),
            }
            logger.info("login", "Interactive shell finished");
        }
        Ok(Flow::Done(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guestkit::MockGuest;
    use std::sync::Arc;

    #[test]
    fn test_parse_action_spec() {
        let spec: ActionSpec = "prepare".parse().unwrap();
        assert_eq!(spec, ActionSpec { step: "prepare".into(), order: 90 });

        let spec: ActionSpec = "provision:start".parse().unwrap();
        assert_eq!(spec.order, 10);

        let spec: ActionSpec = "execute:45".parse().unwrap();
        assert_eq!(spec.order, 45);
        assert_eq!(spec.to_string(), "execute:45");
    }

    #[test]
    fn test_invalid_action_spec() {
        assert!(matches!(
            "deploy".parse::<ActionSpec>(),
            Err(Error::Specification(_))
        ));
        let err = "prepare:soon".parse::<ActionSpec>().unwrap_err();
        assert!(err.to_string().contains("invalid order 'soon'"));
    }

    #[test]
    fn test_login_ignores_shell_exit_code() {
        let guest = Arc::new(MockGuest::new("a").fail("bash", 130));
        let guests: Vec<GuestRef> = vec![guest.clone()];

        let outcome = Login::new(PHASE_ORDER_END)
            .go(&guests, &Logger::new("login"))
            .unwrap();
        assert_eq!(outcome, Flow::Done(()));
        assert_eq!(guest.count_executed("bash"), 1);
    }

    #[test]
    fn test_reboot_on_refusing_guest_fails() {
        let guest = guestkit::GuestLocal::new("local", guestkit::GuestData::default(), Logger::new("local"));
        let guests: Vec<GuestRef> = vec![Arc::new(guest)];

        let err = Reboot::new(PHASE_ORDER_START)
            .go(&guests, &Logger::new("reboot"))
            .unwrap_err();
        assert_eq!(err.to_string(), "Guest 'local' did not come back after reboot.");
    }

    #[test]
    fn test_reboot_mock_guest_waits_for_new_boot_time() {
        let guest = Arc::new(
            MockGuest::new("a").respond_sequence("cat /proc/stat", ["btime 100\n", "btime 200\n"]),
        );
        let guests: Vec<GuestRef> = vec![guest.clone()];

        let outcome = Reboot::new(PHASE_ORDER_START)
            .go(&guests, &Logger::new("reboot"))
            .unwrap();
        assert_eq!(outcome, Flow::Done(()));
        assert_eq!(guest.count_executed("reboot"), 1);
    }
}
