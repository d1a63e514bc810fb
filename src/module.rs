//! The loaded module and its endpoint table
//!
//! [`JitModule`] plays the role of the loaded kernel module: it owns the
//! configuration, the tick clock, the deferred callback engine and both
//! components, and serves reads of the eight read-only endpoints. Every read
//! is an independent computation; no state is carried from one read to the
//! next apart from the configuration.

use crate::clock::{Clock, TickClock, WallTime};
use crate::collector::{TraceCollector, TraceRecord, TraceVariant};
use crate::config::{ConfigError, JitConfig};
use crate::delay::{DelayPolicy, DelaySample, DelaySelector};
use crate::error::{JitError, Result};
use crate::signal::SignalToken;
use crate::softirq::SoftirqEngine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Read-only endpoints served by the module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    CurrentTime,
    JitBusy,
    JitSched,
    JitQueue,
    JitSchedTo,
    JitTimer,
    JitTasklet,
    JitTaskletHi,
}

impl Endpoint {
    /// Every endpoint, in registration order
    pub const ALL: [Endpoint; 8] = [
        Endpoint::CurrentTime,
        Endpoint::JitBusy,
        Endpoint::JitSched,
        Endpoint::JitQueue,
        Endpoint::JitSchedTo,
        Endpoint::JitTimer,
        Endpoint::JitTasklet,
        Endpoint::JitTaskletHi,
    ];

    /// File name of the endpoint
    pub fn name(&self) -> &'static str {
        match self {
            Endpoint::CurrentTime => "currentime",
            Endpoint::JitBusy => "jitbusy",
            Endpoint::JitSched => "jitsched",
            Endpoint::JitQueue => "jitqueue",
            Endpoint::JitSchedTo => "jitschedto",
            Endpoint::JitTimer => "jitimer",
            Endpoint::JitTasklet => "jitasklet",
            Endpoint::JitTaskletHi => "jitasklethi",
        }
    }

    /// One-line description for `--list`
    pub fn description(&self) -> &'static str {
        match self {
            Endpoint::CurrentTime => "tick counters and wall clock (precise and coarse)",
            Endpoint::JitBusy => "busy-wait for `delay` ticks",
            Endpoint::JitSched => "yield in a loop for `delay` ticks",
            Endpoint::JitQueue => "wait on a never-true condition with a `delay` timeout",
            Endpoint::JitSchedTo => "sleep on a `delay`-tick alarm",
            Endpoint::JitTimer => "timer re-armed every `tdelay` ticks",
            Endpoint::JitTasklet => "self-rescheduling tasklet",
            Endpoint::JitTaskletHi => "self-rescheduling high-priority tasklet",
        }
    }

    /// Delay policy behind this endpoint, if it is a delay endpoint
    pub fn delay_policy(&self) -> Option<DelayPolicy> {
        match self {
            Endpoint::JitBusy => Some(DelayPolicy::BusySpin),
            Endpoint::JitSched => Some(DelayPolicy::CooperativeYield),
            Endpoint::JitQueue => Some(DelayPolicy::QueuedTimeout),
            Endpoint::JitSchedTo => Some(DelayPolicy::SleepUntil),
            _ => None,
        }
    }

    /// Trace variant behind this endpoint, if it is a trace endpoint
    pub fn trace_variant(&self) -> Option<TraceVariant> {
        match self {
            Endpoint::JitTimer => Some(TraceVariant::Timer),
            Endpoint::JitTasklet => Some(TraceVariant::TaskletNormal),
            Endpoint::JitTaskletHi => Some(TraceVariant::TaskletHigh),
            _ => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Endpoint {
    type Err = JitError;

    /// Accepts bare names and `/proc/`-style paths
    ///
    /// # Example
    /// ```
    /// use jitprobe::module::Endpoint;
    ///
    /// assert_eq!("jitbusy".parse::<Endpoint>().unwrap(), Endpoint::JitBusy);
    /// assert_eq!("/proc/jitimer".parse::<Endpoint>().unwrap(), Endpoint::JitTimer);
    /// assert!("jitfoo".parse::<Endpoint>().is_err());
    /// ```
    fn from_str(s: &str) -> Result<Self> {
        let name = s.rsplit('/').next().unwrap_or(s);
        Endpoint::ALL
            .into_iter()
            .find(|endpoint| endpoint.name() == name)
            .ok_or_else(|| JitError::UnknownEndpoint(s.to_string()))
    }
}

/// Both clock sources and both tick counters, sampled together
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSample {
    /// Tick counter truncated to 32 bits
    pub ticks32: u32,
    /// Full 64-bit tick counter
    pub ticks64: u64,
    /// Precise wall clock
    pub wall: WallTime,
    /// Wall clock at the last tick boundary
    pub coarse: WallTime,
}

/// A completed trace run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceReport {
    pub variant: TraceVariant,
    pub records: Vec<TraceRecord>,
}

/// Result of one endpoint read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reading {
    Time(TimeSample),
    Delay(DelaySample),
    Trace(TraceReport),
}

/// The loaded module: configuration, clock, engine and both components
pub struct JitModule {
    config: JitConfig,
    clock: Arc<dyn Clock>,
    engine: Arc<SoftirqEngine>,
    selector: DelaySelector,
    collector: TraceCollector,
}

impl JitModule {
    /// Validate `config` and load the module with it
    ///
    /// Fails with [`ConfigError::Invalid`] before any thread is started if
    /// a field is out of range.
    ///
    /// # Example
    /// ```
    /// use jitprobe::config::JitConfig;
    /// use jitprobe::module::{Endpoint, JitModule, Reading};
    /// use jitprobe::signal::SignalToken;
    ///
    /// let module = JitModule::load(JitConfig::new().with_hz(1000)).unwrap();
    /// let reading = module.read(Endpoint::JitBusy, &SignalToken::new()).unwrap();
    /// match reading {
    ///     Reading::Delay(sample) => assert!(sample.end - sample.start >= 1),
    ///     other => panic!("unexpected reading {:?}", other),
    /// }
    /// ```
    pub fn load(config: JitConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(TickClock::new(config.tick()));
        Self::with_clock(config, clock)
    }

    /// Validate `config` and load the module on an existing clock
    pub fn with_clock(
        config: JitConfig,
        clock: Arc<dyn Clock>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let engine = Arc::new(SoftirqEngine::start(clock.clone()));
        let selector = DelaySelector::new(&config, clock.clone());
        let collector = TraceCollector::new(&config, clock.clone(), engine.clone());
        tracing::debug!(
            delay = config.delay,
            tdelay = config.tdelay,
            hz = config.hz,
            "module loaded"
        );
        Ok(Self {
            config,
            clock,
            engine,
            selector,
            collector,
        })
    }

    /// Load-time configuration
    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    /// The module's clock
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The deferred callback engine trace runs are armed on
    pub fn engine(&self) -> &Arc<SoftirqEngine> {
        &self.engine
    }

    /// The trace collector
    pub fn collector(&self) -> &TraceCollector {
        &self.collector
    }

    /// The delay selector
    pub fn selector(&self) -> &DelaySelector {
        &self.selector
    }

    /// Sample both tick counters and both wall clocks
    pub fn current_time(&self) -> TimeSample {
        let ticks64 = self.clock.ticks();
        TimeSample {
            ticks32: ticks64 as u32,
            ticks64,
            wall: self.clock.wall(),
            coarse: self.clock.wall_coarse(),
        }
    }

    /// Serve one read of `endpoint`
    pub fn read(&self, endpoint: Endpoint, signal: &SignalToken) -> Result<Reading> {
        tracing::debug!(%endpoint, "endpoint read");
        if let Some(policy) = endpoint.delay_policy() {
            return self.selector.wait(policy, signal).map(Reading::Delay);
        }
        if let Some(variant) = endpoint.trace_variant() {
            let records = self.collector.collect(variant, signal)?;
            return Ok(Reading::Trace(TraceReport { variant, records }));
        }
        Ok(Reading::Time(self.current_time()))
    }
}
