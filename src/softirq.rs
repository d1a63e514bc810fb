//! Deferred callback engine (timers and tasklets)
//!
//! This is the substrate trace runs are armed on. It runs registered
//! callbacks on one dedicated worker thread, in "interrupt context"
//! ([`crate::context::in_interrupt`] is true while a callback runs):
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ READER THREAD                                                 │
//! │   engine.register(cb) → Deferral                              │
//! │   deferral.add_timer(expires) | deferral.schedule(priority)   │
//! └───────────────────────────────────────────────────────────────┘
//!                          │
//!                          │ Mutex<EngineState> + Condvar
//!                          ▼
//! ┌───────────────────────────────────────────────────────────────┐
//! │ WORKER THREAD ("ksoftirqd/0")                                 │
//! │   loop {                                                      │
//! │     1. high-priority tasklets                                 │
//! │     2. normal tasklets                                        │
//! │     3. timers whose expiry tick has been reached              │
//! │     4. sleep until the next expiry or a new activation        │
//! │   }                                                           │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Activations are serialized: a callback never runs concurrently with
//! itself or with any other callback. A callback re-arms itself through the
//! [`Activation`] it receives. [`Deferral::cancel_sync`] disables an entry,
//! removes any pending activation and waits out a firing in progress, after
//! which the callback is guaranteed not to run again.

use crate::clock::Clock;
use crate::context::{in_interrupt, InterruptGuard};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Callback invoked on every activation of an entry
pub type Callback = Arc<dyn Fn(&Activation<'_>) + Send + Sync>;

/// Which tasklet queue an activation goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskletPriority {
    Normal,
    High,
}

struct Entry {
    callback: Callback,
    timer_expires: Option<u64>,
    tasklet_queued: bool,
    disabled: bool,
}

#[derive(Default)]
struct EngineState {
    next_id: u64,
    entries: HashMap<u64, Entry>,
    timers: BinaryHeap<Reverse<(u64, u64)>>,
    high: VecDeque<u64>,
    normal: VecDeque<u64>,
    running: Option<u64>,
    shutdown: bool,
    fired: u64,
}

enum Next {
    Run(u64, Callback),
    WaitUntil(Instant),
    Idle,
}

impl EngineState {
    fn pop_tasklet(&mut self, priority: TaskletPriority) -> Option<(u64, Callback)> {
        loop {
            let queue = match priority {
                TaskletPriority::High => &mut self.high,
                TaskletPriority::Normal => &mut self.normal,
            };
            let id = queue.pop_front()?;
            if let Some(entry) = self.entries.get_mut(&id) {
                if entry.tasklet_queued && !entry.disabled {
                    entry.tasklet_queued = false;
                    return Some((id, entry.callback.clone()));
                }
            }
        }
    }

    fn next(&mut self, clock: &dyn Clock) -> Next {
        if let Some((id, callback)) = self.pop_tasklet(TaskletPriority::High) {
            return Next::Run(id, callback);
        }
        if let Some((id, callback)) = self.pop_tasklet(TaskletPriority::Normal) {
            return Next::Run(id, callback);
        }

        let now = clock.ticks();
        while let Some(&Reverse((expires, id))) = self.timers.peek() {
            let live = self
                .entries
                .get(&id)
                .is_some_and(|entry| entry.timer_expires == Some(expires) && !entry.disabled);
            if !live {
                self.timers.pop();
                continue;
            }
            if expires > now {
                return Next::WaitUntil(clock.instant_of(expires));
            }
            self.timers.pop();
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.timer_expires = None;
                return Next::Run(id, entry.callback.clone());
            }
        }
        Next::Idle
    }

    fn add_timer(&mut self, id: u64, expires: u64) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) if !entry.disabled => {
                entry.timer_expires = Some(expires);
                self.timers.push(Reverse((expires, id)));
                true
            }
            _ => false,
        }
    }

    fn schedule(&mut self, id: u64, priority: TaskletPriority) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) if !entry.disabled => {
                if !entry.tasklet_queued {
                    entry.tasklet_queued = true;
                    match priority {
                        TaskletPriority::High => self.high.push_back(id),
                        TaskletPriority::Normal => self.normal.push_back(id),
                    }
                }
                true
            }
            _ => false,
        }
    }
}

struct Shared {
    clock: Arc<dyn Clock>,
    state: Mutex<EngineState>,
    /// Signalled when new work is queued or on shutdown
    wake: Condvar,
    /// Signalled after every activation finishes
    idle: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add_timer(&self, id: u64, expires: u64) {
        let armed = self.lock().add_timer(id, expires);
        if armed {
            tracing::trace!(id, expires, "timer armed");
            self.wake.notify_one();
        }
    }

    fn schedule(&self, id: u64, priority: TaskletPriority) {
        let queued = self.lock().schedule(id, priority);
        if queued {
            tracing::trace!(id, ?priority, "tasklet scheduled");
            self.wake.notify_one();
        }
    }
}

/// Engine statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    /// Registered entries
    pub entries: usize,
    /// Activations run since start
    pub fired: u64,
}

/// Deferred callback engine with one worker thread
///
/// # Example
///
/// ```
/// use jitprobe::clock::TickClock;
/// use jitprobe::softirq::{SoftirqEngine, TaskletPriority};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let engine = SoftirqEngine::start(Arc::new(TickClock::new(Duration::from_millis(1))));
/// let (tx, rx) = crossbeam::channel::bounded(1);
/// let tasklet = engine.register(Arc::new(move |_act: &jitprobe::softirq::Activation<'_>| {
///     let _ = tx.try_send(jitprobe::context::in_interrupt());
/// }));
/// tasklet.schedule(TaskletPriority::Normal);
/// assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
/// ```
pub struct SoftirqEngine {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SoftirqEngine {
    /// Start the engine and its worker thread
    ///
    /// # Panics
    ///
    /// Panics if the worker thread cannot be spawned.
    pub fn start(clock: Arc<dyn Clock>) -> Self {
        let shared = Arc::new(Shared {
            clock,
            state: Mutex::new(EngineState::default()),
            wake: Condvar::new(),
            idle: Condvar::new(),
        });

        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("ksoftirqd/0".to_string())
            .spawn(move || Self::worker_loop(worker_shared))
            .expect("failed to spawn softirq worker");
        tracing::debug!("softirq engine started");

        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Register a callback; it does not run until armed
    pub fn register(&self, callback: Callback) -> Deferral {
        let mut state = self.shared.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.entries.insert(
            id,
            Entry {
                callback,
                timer_expires: None,
                tasklet_queued: false,
                disabled: false,
            },
        );
        Deferral {
            id,
            shared: self.shared.clone(),
        }
    }

    /// Current tick count of the engine's clock
    pub fn now(&self) -> u64 {
        self.shared.clock.ticks()
    }

    /// Snapshot of engine counters
    pub fn stats(&self) -> EngineStats {
        let state = self.shared.lock();
        EngineStats {
            entries: state.entries.len(),
            fired: state.fired,
        }
    }

    /// Stop the worker thread; pending activations are discarded
    pub fn shutdown(&self) {
        self.shared.lock().shutdown = true;
        self.shared.wake.notify_all();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = worker {
            let _ = handle.join();
            tracing::debug!("softirq engine stopped");
        }
    }

    fn worker_loop(shared: Arc<Shared>) {
        let mut state = shared.lock();
        loop {
            if state.shutdown {
                break;
            }
            match state.next(shared.clock.as_ref()) {
                Next::Run(id, callback) => {
                    state.running = Some(id);
                    drop(state);

                    let outcome = {
                        let _irq = InterruptGuard::enter();
                        let activation = Activation {
                            id,
                            shared: shared.as_ref(),
                        };
                        catch_unwind(AssertUnwindSafe(|| callback(&activation)))
                    };
                    if outcome.is_err() {
                        tracing::warn!(id, "deferred callback panicked");
                    }
                    drop(callback);

                    state = shared.lock();
                    state.running = None;
                    state.fired += 1;
                    shared.idle.notify_all();
                }
                Next::WaitUntil(deadline) => {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    state = shared
                        .wake
                        .wait_timeout(state, timeout)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                Next::Idle => {
                    state = shared
                        .wake
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }
}

impl Drop for SoftirqEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle passed to a running callback, used to re-arm itself
pub struct Activation<'a> {
    id: u64,
    shared: &'a Shared,
}

impl Activation<'_> {
    /// Current tick count
    pub fn now(&self) -> u64 {
        self.shared.clock.ticks()
    }

    /// Re-arm this entry as a timer expiring at absolute tick `expires`
    pub fn add_timer(&self, expires: u64) {
        self.shared.add_timer(self.id, expires);
    }

    /// Queue this entry for another run on the given tasklet queue
    pub fn schedule(&self, priority: TaskletPriority) {
        self.shared.schedule(self.id, priority);
    }
}

/// Owner handle of a registered callback
///
/// Dropping it cancels any pending activation and unregisters the callback.
pub struct Deferral {
    id: u64,
    shared: Arc<Shared>,
}

impl Deferral {
    /// Engine-wide identifier of this entry
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Arm (or move) the timer to fire at absolute tick `expires`
    pub fn add_timer(&self, expires: u64) {
        self.shared.add_timer(self.id, expires);
    }

    /// Queue one tasklet activation
    pub fn schedule(&self, priority: TaskletPriority) {
        self.shared.schedule(self.id, priority);
    }

    /// Whether an activation is queued or armed
    pub fn is_pending(&self) -> bool {
        self.shared.lock().entries.get(&self.id).is_some_and(|entry| {
            !entry.disabled && (entry.tasklet_queued || entry.timer_expires.is_some())
        })
    }

    /// Disable the entry and wait until it is quiescent
    ///
    /// Returns whether an activation was pending. Once this returns the
    /// callback is not running and will never run again, even if it tried to
    /// re-arm itself while the cancel was in progress.
    pub fn cancel_sync(&self) -> bool {
        let mut state = self.shared.lock();
        let was_pending = match state.entries.get_mut(&self.id) {
            Some(entry) => {
                let pending = entry.tasklet_queued || entry.timer_expires.is_some();
                entry.disabled = true;
                entry.tasklet_queued = false;
                entry.timer_expires = None;
                pending
            }
            None => false,
        };

        // A callback cancelling its own entry must not wait for itself
        let self_cancel = in_interrupt() && state.running == Some(self.id);
        while !self_cancel && state.running == Some(self.id) {
            state = self
                .shared
                .idle
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if was_pending {
            tracing::debug!(id = self.id, "pending activation cancelled");
        }
        was_pending
    }
}

impl Drop for Deferral {
    fn drop(&mut self) {
        self.cancel_sync();
        let removed = self.shared.lock().entries.remove(&self.id);
        drop(removed);
    }
}
