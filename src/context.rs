//! Per-thread execution context
//!
//! Every trace record captures who was running when it was written: thread
//! id, processor, thread name, and whether the code ran from the deferred
//! callback engine ("interrupt context") rather than a normal reader thread.

use serde::{Deserialize, Serialize};
use std::cell::Cell;

/// Maximum command name length, matching the kernel's 16-byte `comm` field
pub const COMM_LEN: usize = 15;

thread_local! {
    static IN_INTERRUPT: Cell<bool> = const { Cell::new(false) };
}

/// Whether the calling thread is currently running a deferred callback
pub fn in_interrupt() -> bool {
    IN_INTERRUPT.with(Cell::get)
}

/// Marks the current thread as running in interrupt context until dropped
#[derive(Debug)]
pub(crate) struct InterruptGuard {
    previous: bool,
}

impl InterruptGuard {
    pub(crate) fn enter() -> Self {
        let previous = IN_INTERRUPT.with(|flag| flag.replace(true));
        Self { previous }
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        IN_INTERRUPT.with(|flag| flag.set(self.previous));
    }
}

/// Identity of the code currently executing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecContext {
    /// Kernel thread id of the running thread
    pub pid: i32,
    /// Processor the thread was running on when sampled
    pub cpu: u32,
    /// Thread name, truncated to [`COMM_LEN`] bytes
    pub command: String,
    /// Running inside a deferred callback
    pub in_interrupt: bool,
}

impl ExecContext {
    /// Sample the calling thread's context
    pub fn current() -> Self {
        Self {
            pid: nix::unistd::gettid().as_raw(),
            cpu: nix::sched::sched_getcpu()
                .ok()
                .and_then(|cpu| u32::try_from(cpu).ok())
                .unwrap_or(0),
            command: current_command(),
            in_interrupt: in_interrupt(),
        }
    }
}

fn current_command() -> String {
    let name = match std::thread::current().name() {
        Some(name) => name.to_string(),
        None => std::fs::read_to_string("/proc/thread-self/comm")
            .map(|comm| comm.trim_end().to_string())
            .unwrap_or_else(|_| "?".to_string()),
    };
    truncate_comm(&name)
}

fn truncate_comm(name: &str) -> String {
    if name.len() <= COMM_LEN {
        return name.to_string();
    }
    let mut end = COMM_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

/// Voluntary context switches performed by the calling thread so far
///
/// A thread that spins without blocking or yielding leaves this counter
/// untouched, which is how busy-wait tests tell spinning from sleeping.
pub fn voluntary_switches() -> Option<i64> {
    use nix::sys::resource::{getrusage, UsageWho};
    getrusage(UsageWho::RUSAGE_THREAD)
        .ok()
        .map(|usage| usage.voluntary_context_switches() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_in_interrupt_by_default() {
        assert!(!in_interrupt());
        assert!(!ExecContext::current().in_interrupt);
    }

    #[test]
    fn test_guard_sets_and_restores() {
        {
            let _guard = InterruptGuard::enter();
            assert!(in_interrupt());
            assert!(ExecContext::current().in_interrupt);
        }
        assert!(!in_interrupt());
    }

    #[test]
    fn test_pid_is_thread_id() {
        let main = ExecContext::current().pid;
        let other = std::thread::spawn(|| ExecContext::current().pid)
            .join()
            .unwrap();
        assert!(main > 0);
        assert_ne!(main, other);
    }

    #[test]
    fn test_command_uses_thread_name() {
        let ctx = std::thread::Builder::new()
            .name("probe-reader".to_string())
            .spawn(ExecContext::current)
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(ctx.command, "probe-reader");
    }

    #[test]
    fn test_truncate_comm() {
        assert_eq!(truncate_comm("short"), "short");
        assert_eq!(truncate_comm("a-very-long-thread-name"), "a-very-long-thr");
        // 'é' is two bytes, must not split it
        let name = "aaaaaaaaaaaaaaé";
        assert_eq!(truncate_comm(name), "aaaaaaaaaaaaaa");
    }

    #[test]
    fn test_voluntary_switches_readable() {
        assert!(voluntary_switches().is_some());
    }
}
