//! jitprobe - how delays, timers and tasklets behave under the scheduler
//!
//! This library provides the pieces behind the `jitprobe` endpoints: a delay
//! selector with four waiting disciplines, a trace collector that chains
//! deferred callbacks on a timer/tasklet engine, and the module that serves
//! the endpoint reads.

pub mod cli;
pub mod clock;
pub mod collector;
pub mod config;
pub mod context;
pub mod delay;
pub mod error;
pub mod format;
pub mod module;
pub mod signal;
pub mod softirq;
