//! Deferred-execution trace collector
//!
//! A trace run arms one deferred callback and lets it fire
//! [`JIT_ASYNC_LOOPS`] times, each firing appending one [`TraceRecord`] that
//! captures the firing context. The reader blocks once, on completion, and
//! then takes the whole buffer.
//!
//! ```text
//!  start_run ──► Armed ──► Firing ──► remaining > 0 ──► ReArmed ──┐
//!  (baseline     (timer      │                                     │
//!   record)       or          │◄────────────────────────────────────┘
//!                 tasklet)    └──► remaining == 0 ──► Completed ──► drain
//! ```
//!
//! The timer and tasklet variants share one state machine and differ only in
//! how the next firing is requested: the timer advances its absolute expiry
//! by `tdelay` ticks, tasklets queue themselves again on their priority queue.
//!
//! # Ownership
//!
//! The run is reference counted and shared by the engine callback and the
//! reader's [`TraceRunHandle`]. Its state sits behind a mutex that is never
//! contended in practice: the callback only touches it during a firing and
//! the reader only after the completion signal (or after cancelling).
//!
//! # Interruption
//!
//! If the reader is interrupted while draining, the run is marked cancelled
//! and the pending activation is cancelled synchronously before the reader
//! lets go of its reference. A firing that was already in flight completes
//! first; nothing fires afterwards. Whoever drops the last reference frees
//! the run, so there is neither a leak nor a use after release.

use crate::clock::Clock;
use crate::config::JitConfig;
use crate::context::ExecContext;
use crate::error::{JitError, Result};
use crate::signal::SignalToken;
use crate::softirq::{Activation, Deferral, SoftirqEngine, TaskletPriority};
use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Number of deferred firings per trace run
pub const JIT_ASYNC_LOOPS: u32 = 5;

/// Records in a completed run: the baseline plus one per firing
pub const RECORDS_PER_RUN: usize = JIT_ASYNC_LOOPS as usize + 1;

/// Which deferred-execution primitive drives a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceVariant {
    /// Timer re-armed `tdelay` ticks after its previous expiry
    Timer,
    /// Tasklet on the normal-priority queue
    TaskletNormal,
    /// Tasklet on the high-priority queue
    TaskletHigh,
}

impl fmt::Display for TraceVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TraceVariant::Timer => "timer",
            TraceVariant::TaskletNormal => "tasklet",
            TraceVariant::TaskletHigh => "tasklet_hi",
        };
        f.write_str(name)
    }
}

/// One line of a trace: when it fired and in what context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRecord {
    /// Tick count at firing
    pub ticks: u64,
    /// Ticks since the previous record (zero for the baseline)
    pub delta: u64,
    /// Written from the deferred callback engine
    pub in_interrupt: bool,
    /// Thread id of the writer
    pub pid: i32,
    /// Processor the writer ran on
    pub cpu: u32,
    /// Thread name of the writer
    pub command: String,
    /// Monotonic nanoseconds at firing, finer than `ticks`
    pub nanos: u64,
}

impl TraceRecord {
    fn capture(clock: &dyn Clock, ticks: u64, delta: u64) -> Self {
        let ctx = ExecContext::current();
        Self {
            ticks,
            delta,
            in_interrupt: ctx.in_interrupt,
            pid: ctx.pid,
            cpu: ctx.cpu,
            command: ctx.command,
            nanos: clock.nanos(),
        }
    }
}

struct RunState {
    remaining: u32,
    prev_ticks: u64,
    expires: u64,
    records: Vec<TraceRecord>,
    cancelled: bool,
}

struct TraceRun {
    variant: TraceVariant,
    tdelay: u64,
    clock: Arc<dyn Clock>,
    state: Mutex<RunState>,
    done: Sender<()>,
}

impl TraceRun {
    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Body of every firing
    fn fire(&self, activation: &Activation<'_>) {
        let mut state = self.lock();
        if state.cancelled || state.remaining == 0 {
            return;
        }

        let now = self.clock.ticks();
        let delta = now.saturating_sub(state.prev_ticks);
        state
            .records
            .push(TraceRecord::capture(self.clock.as_ref(), now, delta));
        state.remaining -= 1;

        if state.remaining > 0 {
            state.prev_ticks = now;
            match self.variant {
                TraceVariant::Timer => {
                    state.expires = state.expires.saturating_add(self.tdelay);
                    activation.add_timer(state.expires);
                }
                TraceVariant::TaskletNormal => activation.schedule(TaskletPriority::Normal),
                TraceVariant::TaskletHigh => activation.schedule(TaskletPriority::High),
            }
        } else {
            tracing::trace!(variant = %self.variant, "trace run complete");
            let _ = self.done.try_send(());
        }
    }
}

/// Slot in the bounded set of in-flight runs, released on drop
struct RunPermit {
    inflight: Arc<AtomicUsize>,
}

impl RunPermit {
    fn acquire(inflight: &Arc<AtomicUsize>, max: usize) -> Result<Self> {
        inflight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .map_err(|n| {
                JitError::ResourceExhausted(format!("{} trace runs already in flight", n))
            })?;
        Ok(Self {
            inflight: inflight.clone(),
        })
    }
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        self.inflight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Weak view of a run, for checking that it has been released
#[derive(Clone)]
pub struct RunObserver {
    run: Weak<TraceRun>,
}

impl RunObserver {
    /// Whether anything still holds the run
    pub fn is_alive(&self) -> bool {
        self.run.strong_count() > 0
    }

    /// Records written so far, if the run is still alive
    pub fn records_written(&self) -> Option<usize> {
        self.run.upgrade().map(|run| run.lock().records.len())
    }
}

/// The reader's side of an armed trace run
pub struct TraceRunHandle {
    run: Arc<TraceRun>,
    deferral: Deferral,
    done: Receiver<()>,
    _permit: RunPermit,
}

impl TraceRunHandle {
    /// Variant driving this run
    pub fn variant(&self) -> TraceVariant {
        self.run.variant
    }

    /// Weak observer that outlives the handle
    pub fn observer(&self) -> RunObserver {
        RunObserver {
            run: Arc::downgrade(&self.run),
        }
    }

    /// Block until the run completes, then take all records
    ///
    /// Returns [`JitError::Interrupted`] if `signal` is raised first. In that
    /// case no records are returned and the pending activation has been
    /// cancelled by the time this returns.
    pub fn drain(self, signal: &SignalToken) -> Result<Vec<TraceRecord>> {
        select! {
            recv(self.done) -> _ => {
                let records = std::mem::take(&mut self.run.lock().records);
                tracing::debug!(
                    variant = %self.run.variant,
                    records = records.len(),
                    "trace run drained"
                );
                Ok(records)
            }
            recv(signal.receiver()) -> _ => {
                self.cancel();
                Err(JitError::Interrupted)
            }
        }
    }

    /// Stop the run: no firing appends or re-arms after this returns
    fn cancel(&self) {
        self.run.lock().cancelled = true;
        let was_pending = self.deferral.cancel_sync();
        tracing::debug!(
            variant = %self.run.variant,
            was_pending,
            "trace run cancelled"
        );
    }
}

/// Arms trace runs on a deferred callback engine
pub struct TraceCollector {
    clock: Arc<dyn Clock>,
    engine: Arc<SoftirqEngine>,
    tdelay: u64,
    max_inflight: usize,
    inflight: Arc<AtomicUsize>,
}

impl TraceCollector {
    /// Create a collector using `config.tdelay` and `config.max_inflight_runs`
    pub fn new(config: &JitConfig, clock: Arc<dyn Clock>, engine: Arc<SoftirqEngine>) -> Self {
        Self {
            clock,
            engine,
            tdelay: config.tdelay,
            max_inflight: config.max_inflight_runs,
            inflight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Runs currently armed and not yet drained or dropped
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    /// Allocate a run, write the baseline record and arm the first firing
    ///
    /// Fails with [`JitError::ResourceExhausted`] before anything is
    /// scheduled if the run cannot be allocated.
    pub fn start_run(&self, variant: TraceVariant) -> Result<TraceRunHandle> {
        let permit = RunPermit::acquire(&self.inflight, self.max_inflight)?;

        let mut records = Vec::new();
        records.try_reserve_exact(RECORDS_PER_RUN)?;

        let now = self.clock.ticks();
        let first_expiry = now.saturating_add(self.tdelay);
        records.push(TraceRecord::capture(self.clock.as_ref(), now, 0));

        let (done_tx, done_rx) = channel::bounded(1);
        let run = Arc::new(TraceRun {
            variant,
            tdelay: self.tdelay,
            clock: self.clock.clone(),
            state: Mutex::new(RunState {
                remaining: JIT_ASYNC_LOOPS,
                prev_ticks: now,
                expires: first_expiry,
                records,
                cancelled: false,
            }),
            done: done_tx,
        });

        let fired = run.clone();
        let deferral = self
            .engine
            .register(Arc::new(move |activation: &Activation<'_>| {
                fired.fire(activation)
            }));

        match variant {
            TraceVariant::Timer => deferral.add_timer(first_expiry),
            TraceVariant::TaskletNormal => deferral.schedule(TaskletPriority::Normal),
            TraceVariant::TaskletHigh => deferral.schedule(TaskletPriority::High),
        }
        tracing::debug!(%variant, start = now, tdelay = self.tdelay, "trace run armed");

        Ok(TraceRunHandle {
            run,
            deferral,
            done: done_rx,
            _permit: permit,
        })
    }

    /// Arm a run and drain it
    ///
    /// # Example
    /// ```
    /// use jitprobe::clock::{Clock, TickClock};
    /// use jitprobe::collector::{TraceCollector, TraceVariant};
    /// use jitprobe::config::JitConfig;
    /// use jitprobe::signal::SignalToken;
    /// use jitprobe::softirq::SoftirqEngine;
    /// use std::sync::Arc;
    ///
    /// let config = JitConfig::new().with_hz(1000).with_tdelay(2);
    /// let clock: Arc<dyn Clock> = Arc::new(TickClock::new(config.tick()));
    /// let engine = Arc::new(SoftirqEngine::start(clock.clone()));
    /// let collector = TraceCollector::new(&config, clock, engine);
    ///
    /// let records = collector
    ///     .collect(TraceVariant::TaskletHigh, &SignalToken::new())
    ///     .unwrap();
    /// assert_eq!(records.len(), 6);
    /// assert_eq!(records[0].delta, 0);
    /// assert!(records[1..].iter().all(|r| r.in_interrupt));
    /// ```
    pub fn collect(&self, variant: TraceVariant, signal: &SignalToken) -> Result<Vec<TraceRecord>> {
        self.start_run(variant)?.drain(signal)
    }
}
