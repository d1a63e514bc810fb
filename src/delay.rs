//! Delay selector: four ways to wait a fixed number of ticks
//!
//! | Policy             | Endpoint     | Suspends?            | Interruptible |
//! |--------------------|--------------|----------------------|---------------|
//! | `BusySpin`         | `jitbusy`    | never                | no            |
//! | `CooperativeYield` | `jitsched`   | only by yielding     | no            |
//! | `QueuedTimeout`    | `jitqueue`   | blocks on a wait     | yes           |
//! | `SleepUntil`       | `jitschedto` | sleeps on an alarm   | yes           |
//!
//! Each wait reports the tick count sampled on entry and right after the
//! wait ends. For a completed wait `end - start >= duration` always holds.

use crate::clock::Clock;
use crate::config::JitConfig;
use crate::error::{JitError, Result};
use crate::signal::SignalToken;
use crossbeam::channel;
use crossbeam::select;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// How the calling thread waits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayPolicy {
    /// Poll the tick counter without ever giving up the processor
    BusySpin,
    /// Yield to the scheduler in a loop until the ticks have elapsed
    CooperativeYield,
    /// Block on a condition that never becomes true, with a timeout
    QueuedTimeout,
    /// Sleep until a one-shot alarm fires
    SleepUntil,
}

impl DelayPolicy {
    /// Whether a raised signal can cut this wait short
    pub fn is_interruptible(&self) -> bool {
        matches!(self, DelayPolicy::QueuedTimeout | DelayPolicy::SleepUntil)
    }
}

impl fmt::Display for DelayPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DelayPolicy::BusySpin => "busy_spin",
            DelayPolicy::CooperativeYield => "cooperative_yield",
            DelayPolicy::QueuedTimeout => "queued_timeout",
            DelayPolicy::SleepUntil => "sleep_until",
        };
        f.write_str(name)
    }
}

/// Tick counts sampled around one wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelaySample {
    pub start: u64,
    pub end: u64,
}

impl DelaySample {
    /// Ticks actually waited
    pub fn elapsed(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }
}

/// The processor-level hooks the polling policies use
pub trait Scheduler: Send + Sync {
    /// Hint that the caller is spinning (never gives up the processor)
    fn cpu_relax(&self);

    /// Voluntarily give the processor to another runnable thread
    fn yield_now(&self);
}

/// Scheduler hooks backed by the host OS
#[derive(Debug, Default, Clone, Copy)]
pub struct OsScheduler;

impl Scheduler for OsScheduler {
    fn cpu_relax(&self) {
        std::hint::spin_loop();
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }
}

/// Waits for the configured number of ticks using a chosen policy
pub struct DelaySelector {
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    duration: u64,
}

impl DelaySelector {
    /// Create a selector waiting `config.delay` ticks, using OS scheduler hooks
    pub fn new(config: &JitConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_scheduler(config, clock, Arc::new(OsScheduler))
    }

    /// Create a selector with custom scheduler hooks
    pub fn with_scheduler(
        config: &JitConfig,
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            clock,
            scheduler,
            duration: config.delay,
        }
    }

    /// Configured wait length in ticks
    pub fn duration(&self) -> u64 {
        self.duration
    }

    /// Wait the configured duration with `policy`
    pub fn wait(&self, policy: DelayPolicy, signal: &SignalToken) -> Result<DelaySample> {
        self.wait_for(policy, self.duration, signal)
    }

    /// Wait `ticks` with `policy`
    ///
    /// Only [`DelayPolicy::QueuedTimeout`] and [`DelayPolicy::SleepUntil`]
    /// observe `signal`; they return [`JitError::Interrupted`] when it is
    /// raised before the wait ends.
    ///
    /// # Example
    /// ```
    /// use jitprobe::clock::{Clock, TickClock};
    /// use jitprobe::config::JitConfig;
    /// use jitprobe::delay::{DelayPolicy, DelaySelector};
    /// use jitprobe::signal::SignalToken;
    /// use std::sync::Arc;
    ///
    /// let config = JitConfig::new().with_hz(1000);
    /// let clock: Arc<dyn Clock> = Arc::new(TickClock::new(config.tick()));
    /// let selector = DelaySelector::new(&config, clock);
    /// let sample = selector
    ///     .wait_for(DelayPolicy::SleepUntil, 5, &SignalToken::new())
    ///     .unwrap();
    /// assert!(sample.elapsed() >= 5);
    /// ```
    pub fn wait_for(
        &self,
        policy: DelayPolicy,
        ticks: u64,
        signal: &SignalToken,
    ) -> Result<DelaySample> {
        let start = self.clock.ticks();
        let target = start.saturating_add(ticks);

        match policy {
            DelayPolicy::BusySpin => {
                while self.clock.ticks() < target {
                    self.scheduler.cpu_relax();
                }
            }
            DelayPolicy::CooperativeYield => {
                while self.clock.ticks() < target {
                    self.scheduler.yield_now();
                }
            }
            DelayPolicy::QueuedTimeout => {
                let condition = channel::never::<()>();
                let timeout = self.clock.ticks_to_duration(ticks);
                select! {
                    recv(condition) -> _ => {}
                    recv(signal.receiver()) -> _ => return Err(self.interrupted(policy, start)),
                    default(timeout) => {}
                }
            }
            DelayPolicy::SleepUntil => {
                let alarm = channel::after(self.clock.ticks_to_duration(ticks));
                select! {
                    recv(alarm) -> _ => {}
                    recv(signal.receiver()) -> _ => return Err(self.interrupted(policy, start)),
                }
            }
        }

        let end = self.clock.ticks();
        tracing::trace!(%policy, start, end, "delay complete");
        Ok(DelaySample { start, end })
    }

    fn interrupted(&self, policy: DelayPolicy, start: u64) -> JitError {
        tracing::debug!(
            %policy,
            start,
            now = self.clock.ticks(),
            "delay interrupted"
        );
        JitError::Interrupted
    }
}
