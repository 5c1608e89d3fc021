//! Poll a probe until it succeeds or a deadline expires.
//!
//! The probe signals "not ready yet" with [`ProbeError::Incomplete`]; any other
//! failure is reported through [`ProbeError::Failed`] and ends the wait
//! immediately. Only the incomplete case is retried.
//!
//! ```no_run
//! use std::time::Duration;
//! use waiting::{Deadline, ProbeError, Waiting};
//!
//! let waiting = Waiting::new(Deadline::from_seconds(60.0)).with_tick(Duration::from_secs(5));
//! let logger = logkit::Logger::new("reconnect");
//!
//! let ready: Result<(), waiting::WaitError<String>> = waiting.wait(
//!     || Err(ProbeError::Incomplete),
//!     &logger,
//! );
//! ```

use logkit::Logger;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default pause between two probe attempts.
pub const DEFAULT_TICK: Duration = Duration::from_secs(30);

/// Default multiplier applied to the pause after each attempt.
pub const DEFAULT_TICK_INCREASE: f64 = 1.0;

/// A point in time computed once from a duration.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    until: Instant,
}

impl Deadline {
    /// Deadline `duration` from now.
    pub fn from_duration(duration: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            until: started + duration,
        }
    }

    /// Deadline `seconds` from now. Negative or invalid values mean "now".
    pub fn from_seconds(seconds: f64) -> Self {
        let duration = Duration::try_from_secs_f64(seconds).unwrap_or(Duration::ZERO);
        Self::from_duration(duration)
    }

    /// Remaining time, zero once the deadline passed.
    pub fn time_left(&self) -> Duration {
        self.until.saturating_duration_since(Instant::now())
    }

    pub fn is_due(&self) -> bool {
        self.time_left().is_zero()
    }

    /// Time since the deadline was created.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// What a probe reports when it did not succeed.
#[derive(Debug)]
pub enum ProbeError<E> {
    /// Not ready yet, try again after a tick.
    Incomplete,
    /// Hard failure, stop waiting.
    Failed(E),
}

/// Why [`Waiting::wait`] gave up.
#[derive(Debug, Error)]
pub enum WaitError<E> {
    /// The deadline expired while the probe was still incomplete.
    #[error("timed out after {:.1}s ({attempts} attempts)", elapsed.as_secs_f64())]
    TimedOut {
        /// Time spent waiting
        elapsed: Duration,
        /// Number of probe invocations
        attempts: u32,
    },

    /// The probe failed with an error other than "incomplete".
    #[error("{0}")]
    Failed(E),
}

impl<E> WaitError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }
}

/// Deadline plus polling cadence.
#[derive(Debug, Clone, Copy)]
pub struct Waiting {
    pub deadline: Deadline,
    pub tick: Duration,
    pub tick_increase: f64,
}

impl Waiting {
    /// Wait until `deadline` with the default cadence.
    pub fn new(deadline: Deadline) -> Self {
        Self {
            deadline,
            tick: DEFAULT_TICK,
            tick_increase: DEFAULT_TICK_INCREASE,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_tick_increase(mut self, tick_increase: f64) -> Self {
        self.tick_increase = tick_increase;
        self
    }

    /// Invoke `probe` until it succeeds, fails hard, or the deadline expires.
    ///
    /// The probe always runs at least once. The pause between attempts never
    /// exceeds the time left before the deadline.
    pub fn wait<T, E, F>(&self, mut probe: F, logger: &Logger) -> Result<T, WaitError<E>>
    where
        F: FnMut() -> Result<T, ProbeError<E>>,
    {
        let mut tick = self.tick;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;

            match probe() {
                Ok(value) => {
                    logger.debug(format!("Probe succeeded after {attempts} attempt(s)."), 3);
                    return Ok(value);
                }
                Err(ProbeError::Failed(e)) => return Err(WaitError::Failed(e)),
                Err(ProbeError::Incomplete) => {}
            }

            let left = self.deadline.time_left();
            if left.is_zero() {
                return Err(WaitError::TimedOut {
                    elapsed: self.deadline.elapsed(),
                    attempts,
                });
            }

            let nap = tick.min(left);
            logger.debug(
                format!(
                    "Probe incomplete, sleeping {:.1}s ({:.1}s left).",
                    nap.as_secs_f64(),
                    left.as_secs_f64()
                ),
                3,
            );
            thread::sleep(nap);

            tick = Duration::try_from_secs_f64(tick.as_secs_f64() * self.tick_increase)
                .unwrap_or(tick);
        }
    }
}
