//! The guest contract driven by the orchestrator.
//!
//! Every method may block on a subprocess or a network round trip. The
//! orchestrator never hands the same guest to two concurrent tasks, so drivers
//! only need to guard state they share with their own helper threads.

use crate::command::{Command, CommandOutput, ExecuteOptions};
use crate::data::GuestData;
use crate::error::{Error, Result};
use crate::facts::GuestFacts;
use logkit::Logger;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use waiting::{Deadline, ProbeError, WaitError, Waiting};

/// Shared handle to a guest.
pub type GuestRef = Arc<dyn Guest>;

/// Environment variable overriding the reboot timeout, in seconds.
pub const REBOOT_TIMEOUT_ENV: &str = "TESTRUN_REBOOT_TIMEOUT";

/// Environment variable overriding the connection timeout, in seconds.
pub const CONNECT_TIMEOUT_ENV: &str = "TESTRUN_CONNECT_TIMEOUT";

pub const DEFAULT_REBOOT_TIMEOUT: f64 = 10.0 * 60.0;
pub const DEFAULT_CONNECT_TIMEOUT: f64 = 4.0 * 60.0;

/// Pause between reconnection attempts.
pub const RECONNECT_WAIT_TICK: Duration = Duration::from_secs(5);
pub const RECONNECT_WAIT_TICK_INCREASE: f64 = 1.0;

/// Exit code of ssh when the connection drops, expected while rebooting.
pub const CONNECTION_DROPPED_EXIT_CODE: i32 = 255;

static BOOT_TIME_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"btime\s+(\d+)").ok());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebootMode {
    /// Reboot from inside the guest
    Soft,
    /// Power-cycle through an out-of-band mechanism
    Hard,
}

impl fmt::Display for RebootMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebootMode::Soft => write!(f, "soft"),
            RebootMode::Hard => write!(f, "hard"),
        }
    }
}

/// What to transfer in a push or pull.
///
/// Unset fields fall back to driver defaults (usually the run workdir).
#[derive(Debug, Clone, Default)]
pub struct SyncRequest {
    pub source: Option<PathBuf>,
    pub destination: Option<PathBuf>,
    pub options: Option<Vec<String>>,
}

fn timeout_from_env(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<f64>().ok())
        .unwrap_or(default)
}

/// Waiting used after a reboot, honoring [`REBOOT_TIMEOUT_ENV`].
pub fn default_reboot_waiting() -> Waiting {
    Waiting::new(Deadline::from_seconds(timeout_from_env(
        REBOOT_TIMEOUT_ENV,
        DEFAULT_REBOOT_TIMEOUT,
    )))
    .with_tick(RECONNECT_WAIT_TICK)
    .with_tick_increase(RECONNECT_WAIT_TICK_INCREASE)
}

/// Waiting used by reconnect, honoring [`CONNECT_TIMEOUT_ENV`].
pub fn default_connect_waiting() -> Waiting {
    Waiting::new(Deadline::from_seconds(timeout_from_env(
        CONNECT_TIMEOUT_ENV,
        DEFAULT_CONNECT_TIMEOUT,
    )))
    .with_tick(RECONNECT_WAIT_TICK)
    .with_tick_increase(RECONNECT_WAIT_TICK_INCREASE)
}

/// `name (role)` or just `name`.
pub fn format_guest_full_name(name: &str, role: Option<&str>) -> String {
    match role {
        Some(role) => format!("{name} ({role})"),
        None => name.to_string(),
    }
}

/// Capability surface of an execution target.
pub trait Guest: Send + Sync + fmt::Debug {
    /// Unique guest name, usually the provisioning phase name.
    fn name(&self) -> &str;

    /// Driver key, stored in `guests.yaml`.
    fn how(&self) -> &str;

    /// Snapshot of the data needed to re-attach later.
    fn data(&self) -> GuestData;

    fn logger(&self) -> &Logger;

    fn role(&self) -> Option<String> {
        self.data().role
    }

    fn full_name(&self) -> String {
        format_guest_full_name(self.name(), self.role().as_deref())
    }

    /// Whether the guest can accept commands.
    fn is_ready(&self) -> bool;

    /// Run a command, failing with [`Error::Run`] on non-zero exit.
    fn execute(&self, command: &Command, options: &ExecuteOptions) -> Result<CommandOutput>;

    fn push(&self, request: &SyncRequest) -> Result<()>;

    fn pull(&self, request: &SyncRequest) -> Result<()>;

    /// Facts, probed on first access and cached afterwards.
    fn facts(&self) -> GuestFacts;

    /// Drop cached facts so the next access probes the guest again.
    fn invalidate_facts(&self);

    fn supports_hard_reboot(&self) -> bool {
        false
    }

    /// Issue the reboot without waiting for the guest to come back.
    fn reboot_action(&self, mode: RebootMode, command: Option<&Command>) -> Result<()> {
        match mode {
            RebootMode::Hard => Err(Error::RebootModeNotSupported {
                guest: self.name().to_string(),
                mode,
            }),
            RebootMode::Soft => {
                let default = Command::new("reboot");
                let command = command.unwrap_or(&default);
                match self.execute(command, &ExecuteOptions::default()) {
                    Err(e) if e.exit_code() == Some(CONNECTION_DROPPED_EXIT_CODE) => {
                        self.logger()
                            .debug("Connection dropped by the reboot, as expected.", 2);
                        Ok(())
                    }
                    other => other.map(|_| ()),
                }
            }
        }
    }

    /// Reboot and wait until the boot time changes.
    ///
    /// Returns `false` when the guest did not come back before the deadline.
    fn reboot(&self, mode: RebootMode, command: Option<&Command>, waiting: Option<Waiting>) -> Result<bool> {
        reboot_and_wait(self, mode, command, waiting)
    }

    /// Poll a trivial command until it succeeds.
    ///
    /// Returns `false` on timeout.
    fn reconnect(&self, waiting: Option<Waiting>) -> Result<bool> {
        reconnect(self, waiting)
    }

    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        Ok(())
    }

    /// Disconnect but keep the guest around for a later invocation.
    fn suspend(&self) -> Result<()> {
        Ok(())
    }

    /// Destroy the guest.
    fn remove(&self) -> Result<()> {
        Ok(())
    }
}

/// Read the boot time marker from `/proc/stat`.
pub fn read_boot_time<G: Guest + ?Sized>(guest: &G) -> Result<u64> {
    let output = guest.execute(&Command::new("cat").arg("/proc/stat"), &ExecuteOptions::silent())?;

    BOOT_TIME_PATTERN
        .as_ref()
        .and_then(|pattern| pattern.captures(&output.stdout))
        .and_then(|captures| captures.get(1))
        .and_then(|btime| btime.as_str().parse().ok())
        .ok_or_else(|| Error::Other("Failed to retrieve boot time from guest.".to_string()))
}

fn reboot_and_wait<G: Guest + ?Sized>(
    guest: &G,
    mode: RebootMode,
    command: Option<&Command>,
    waiting: Option<Waiting>,
) -> Result<bool> {
    if mode == RebootMode::Hard && !guest.supports_hard_reboot() {
        return Err(Error::RebootModeNotSupported {
            guest: guest.name().to_string(),
            mode,
        });
    }

    let logger = guest.logger();
    let waiting = waiting.unwrap_or_else(default_reboot_waiting);
    let boot_time = read_boot_time(guest)?;

    logger.debug(format!("Reboot the guest ({mode})."), 1);
    guest.reboot_action(mode, command)?;

    let waited = waiting.wait(
        || match read_boot_time(guest) {
            Ok(current) if current != boot_time => Ok(()),
            Ok(_) => Err(ProbeError::Incomplete),
            Err(e) if e.is_retryable() => Err(ProbeError::Incomplete),
            Err(e) => Err(ProbeError::Failed(e)),
        },
        logger,
    );

    match waited {
        Ok(()) => {
            logger.debug("Connection to guest succeeded after reboot.", 1);
            guest.invalidate_facts();
            Ok(true)
        }
        Err(WaitError::TimedOut { .. }) => {
            logger.debug("Connection to guest failed after reboot.", 1);
            Ok(false)
        }
        Err(WaitError::Failed(e)) => Err(e),
    }
}

fn reconnect<G: Guest + ?Sized>(guest: &G, waiting: Option<Waiting>) -> Result<bool> {
    let logger = guest.logger();
    let waiting = waiting.unwrap_or_else(default_connect_waiting);
    logger.debug("Wait for a connection to the guest.", 1);

    let waited = waiting.wait(
        || match guest.execute(&Command::new("whoami"), &ExecuteOptions::silent()) {
            Ok(_) => Ok(()),
            Err(e) if e.is_retryable() => Err(ProbeError::Incomplete),
            Err(e) => Err(ProbeError::Failed(e)),
        },
        logger,
    );

    match waited {
        Ok(()) => Ok(true),
        Err(WaitError::TimedOut { .. }) => {
            logger.debug("Connection to guest failed.", 1);
            Ok(false)
        }
        Err(WaitError::Failed(e)) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockGuest;

    fn quick_waiting() -> Waiting {
        Waiting::new(Deadline::from_seconds(2.0)).with_tick(Duration::from_millis(10))
    }

    #[test]
    fn test_format_guest_full_name() {
        assert_eq!(format_guest_full_name("default-0", None), "default-0");
        assert_eq!(
            format_guest_full_name("client-1", Some("client")),
            "client-1 (client)"
        );
    }

    #[test]
    fn test_read_boot_time() {
        let guest = MockGuest::new("g").respond("cat /proc/stat", "cpu 1 2 3\nbtime 1700000000\nprocesses 4\n");
        assert_eq!(read_boot_time(&guest).unwrap(), 1_700_000_000);

        let broken = MockGuest::new("g").respond("cat /proc/stat", "cpu 1 2 3\n");
        assert!(read_boot_time(&broken).is_err());
    }

    #[test]
    fn test_soft_reboot_waits_for_new_boot_time() {
        let guest = MockGuest::new("g")
            .respond_sequence(
                "cat /proc/stat",
                ["btime 100\n", "btime 100\n", "btime 200\n"],
            )
            .fail("reboot", CONNECTION_DROPPED_EXIT_CODE);

        let rebooted = guest
            .reboot(RebootMode::Soft, None, Some(quick_waiting()))
            .unwrap();

        assert!(rebooted);
        assert_eq!(guest.count_executed("reboot"), 1);
        assert_eq!(guest.count_executed("cat /proc/stat"), 3);
    }

    #[test]
    fn test_soft_reboot_custom_command() {
        let guest = MockGuest::new("g").respond_sequence("cat /proc/stat", ["btime 1\n", "btime 2\n"]);
        let command = Command::shell("shutdown -r now");

        assert!(guest
            .reboot(RebootMode::Soft, Some(&command), Some(quick_waiting()))
            .unwrap());
        assert_eq!(guest.count_executed("shutdown -r now"), 1);
        assert_eq!(guest.count_executed("reboot"), 0);
    }

    #[test]
    fn test_reboot_timeout_returns_false() {
        let guest = MockGuest::new("g").respond("cat /proc/stat", "btime 100\n");
        let waiting = Waiting::new(Deadline::from_seconds(0.2)).with_tick(Duration::from_millis(20));

        assert!(!guest.reboot(RebootMode::Soft, None, Some(waiting)).unwrap());
    }

    #[test]
    fn test_hard_reboot_not_supported() {
        let guest = MockGuest::new("default-0");
        let err = guest
            .reboot(RebootMode::Hard, None, Some(quick_waiting()))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Guest 'default-0' does not support hard reboot."
        );
        assert_eq!(guest.count_executed("reboot"), 0);
    }

    #[test]
    fn test_reconnect_tolerates_transient_failures() {
        let guest = MockGuest::new("g").respond_results(
            "whoami",
            [Err(255), Err(255), Ok("root\n".to_string())],
        );

        assert!(guest.reconnect(Some(quick_waiting())).unwrap());
        assert_eq!(guest.count_executed("whoami"), 3);
    }

    #[test]
    fn test_reconnect_timeout() {
        let guest = MockGuest::new("g").fail("whoami", 255);
        let waiting = Waiting::new(Deadline::from_seconds(0.1)).with_tick(Duration::from_millis(10));

        assert!(!guest.reconnect(Some(waiting)).unwrap());
    }
}
