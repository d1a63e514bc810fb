//! Tick counter and wall clock sources
//!
//! A [`Clock`] provides the two time bases every endpoint reads: a monotonic
//! tick counter (the equivalent of jiffies, at `hz` ticks per second) and the
//! wall clock, both precise and coarse. The deferred-callback engine also uses
//! it to convert absolute tick expiries into wake-up instants.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A wall clock reading split into seconds and sub-second nanoseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WallTime {
    pub secs: u64,
    pub nanos: u32,
}

impl WallTime {
    /// Microsecond part, as printed by `currentime`
    pub fn micros(&self) -> u32 {
        self.nanos / 1_000
    }

    fn from_system(time: SystemTime) -> Self {
        let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            secs: since_epoch.as_secs(),
            nanos: since_epoch.subsec_nanos(),
        }
    }
}

/// Monotonic tick counter plus wall clock
pub trait Clock: Send + Sync {
    /// Length of one tick
    fn tick(&self) -> Duration;

    /// Ticks elapsed since the clock was started
    fn ticks(&self) -> u64;

    /// Monotonic nanoseconds since the clock was started
    fn nanos(&self) -> u64;

    /// The instant at which `ticks()` first reaches `ticks`
    fn instant_of(&self, ticks: u64) -> Instant;

    /// Precise wall clock
    fn wall(&self) -> WallTime;

    /// Wall clock as of the most recent tick boundary
    fn wall_coarse(&self) -> WallTime;

    /// Convert a tick count to a duration, saturating at `u64::MAX` nanoseconds
    fn ticks_to_duration(&self, ticks: u64) -> Duration {
        let nanos = self.tick().as_nanos().saturating_mul(u128::from(ticks));
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

/// Tick clock driven by the host's monotonic clock
///
/// # Example
/// ```
/// use jitprobe::clock::{Clock, TickClock};
/// use std::time::Duration;
///
/// let clock = TickClock::new(Duration::from_millis(1));
/// let before = clock.ticks();
/// std::thread::sleep(Duration::from_millis(3));
/// assert!(clock.ticks() >= before + 3);
/// ```
#[derive(Debug, Clone)]
pub struct TickClock {
    origin: Instant,
    tick: Duration,
}

impl TickClock {
    /// Start a tick clock with the given tick length
    ///
    /// # Panics
    ///
    /// Panics if `tick` is zero.
    pub fn new(tick: Duration) -> Self {
        assert!(!tick.is_zero(), "Tick length must be > 0");
        Self {
            origin: Instant::now(),
            tick,
        }
    }

    /// Start a tick clock running at `hz` ticks per second
    pub fn with_hz(hz: u32) -> Self {
        Self::new(Duration::from_nanos(
            1_000_000_000 / u64::from(hz.clamp(1, 1_000_000_000)),
        ))
    }

    fn elapsed_nanos(&self) -> u128 {
        self.origin.elapsed().as_nanos()
    }
}

impl Clock for TickClock {
    fn tick(&self) -> Duration {
        self.tick
    }

    fn ticks(&self) -> u64 {
        (self.elapsed_nanos() / self.tick.as_nanos()) as u64
    }

    fn nanos(&self) -> u64 {
        self.elapsed_nanos() as u64
    }

    fn instant_of(&self, ticks: u64) -> Instant {
        let offset = self.tick.as_nanos().saturating_mul(u128::from(ticks));
        let offset = Duration::from_nanos(u64::try_from(offset).unwrap_or(u64::MAX));
        self.origin + offset
    }

    fn wall(&self) -> WallTime {
        WallTime::from_system(SystemTime::now())
    }

    fn wall_coarse(&self) -> WallTime {
        let now = SystemTime::now();
        let into_tick = self.elapsed_nanos() % self.tick.as_nanos();
        let into_tick = Duration::from_nanos(into_tick as u64);
        WallTime::from_system(now.checked_sub(into_tick).unwrap_or(now))
    }
}
