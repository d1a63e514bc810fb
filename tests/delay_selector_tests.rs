//! Integration tests for the delay selector
//!
//! # Test Coverage
//!
//! - ✅ Every policy waits at least the configured ticks
//! - ✅ BusySpin never voluntarily gives up the processor (rusage)
//! - ✅ Only QueuedTimeout and SleepUntil report interruption
//! - ✅ Endpoint mapping for jitbusy / jitsched / jitqueue / jitschedto

use jitprobe::clock::{Clock, TickClock};
use jitprobe::config::JitConfig;
use jitprobe::context::voluntary_switches;
use jitprobe::delay::{DelayPolicy, DelaySelector};
use jitprobe::error::JitError;
use jitprobe::module::{Endpoint, JitModule, Reading};
use jitprobe::signal::SignalToken;
use serial_test::serial;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const POLICIES: [DelayPolicy; 4] = [
    DelayPolicy::BusySpin,
    DelayPolicy::CooperativeYield,
    DelayPolicy::QueuedTimeout,
    DelayPolicy::SleepUntil,
];

fn selector(config: &JitConfig) -> DelaySelector {
    let clock: Arc<dyn Clock> = Arc::new(TickClock::new(config.tick()));
    DelaySelector::new(config, clock)
}

#[test]
fn test_every_policy_waits_at_least_duration() {
    let config = JitConfig::new().with_hz(1000).with_delay(10);
    let selector = selector(&config);
    for policy in POLICIES {
        for _ in 0..3 {
            let sample = selector.wait(policy, &SignalToken::new()).unwrap();
            assert!(
                sample.end - sample.start >= 10,
                "{} returned after {} ticks",
                policy,
                sample.end - sample.start
            );
        }
    }
}

#[test]
#[serial]
fn test_busy_spin_hundred_ticks_without_yielding() {
    let config = JitConfig::new().with_hz(1000).with_delay(100);
    let selector = selector(&config);

    let before = voluntary_switches().unwrap();
    let sample = selector
        .wait(DelayPolicy::BusySpin, &SignalToken::new())
        .unwrap();
    let after = voluntary_switches().unwrap();

    let elapsed = sample.end - sample.start;
    assert!(elapsed >= 100);
    assert!(elapsed <= 150, "busy spin overshot: {} ticks", elapsed);
    assert_eq!(after, before, "busy spin must never block or yield");
}

#[test]
#[serial]
fn test_sleeping_policies_do_yield() {
    let config = JitConfig::new().with_hz(1000).with_delay(20);
    let selector = selector(&config);
    for policy in [DelayPolicy::QueuedTimeout, DelayPolicy::SleepUntil] {
        let before = voluntary_switches().unwrap();
        selector.wait(policy, &SignalToken::new()).unwrap();
        let after = voluntary_switches().unwrap();
        assert!(after > before, "{} should have slept", policy);
    }
}

#[test]
fn test_polling_policies_complete_despite_pending_signal() {
    let config = JitConfig::new().with_hz(1000).with_delay(5);
    let selector = selector(&config);
    let signal = SignalToken::new();
    signal.raise();
    for policy in [DelayPolicy::BusySpin, DelayPolicy::CooperativeYield] {
        let sample = selector.wait(policy, &signal).unwrap();
        assert!(sample.end - sample.start >= 5);
    }
}

#[test]
fn test_only_blocking_policies_are_interrupted() {
    let config = JitConfig::new().with_hz(1000).with_delay(60_000);
    let selector = selector(&config);
    for policy in POLICIES.into_iter().filter(DelayPolicy::is_interruptible) {
        let signal = SignalToken::new();
        let raiser = signal.clone();
        let started = Instant::now();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            raiser.raise();
        });
        assert_eq!(selector.wait(policy, &signal), Err(JitError::Interrupted));
        t.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}

#[test]
fn test_already_pending_signal_interrupts_immediately() {
    let config = JitConfig::new().with_hz(1000).with_delay(60_000);
    let selector = selector(&config);
    let signal = SignalToken::new();
    signal.raise();
    for policy in [DelayPolicy::QueuedTimeout, DelayPolicy::SleepUntil] {
        assert_eq!(selector.wait(policy, &signal), Err(JitError::Interrupted));
    }
}

#[test]
fn test_delay_endpoints_map_to_policies() {
    let module = JitModule::load(JitConfig::new().with_hz(1000).with_delay(2)).unwrap();
    for endpoint in [
        Endpoint::JitBusy,
        Endpoint::JitSched,
        Endpoint::JitQueue,
        Endpoint::JitSchedTo,
    ] {
        assert!(endpoint.delay_policy().is_some());
        match module.read(endpoint, &SignalToken::new()).unwrap() {
            Reading::Delay(sample) => assert!(sample.elapsed() >= 2),
            other => panic!("{} returned {:?}", endpoint, other),
        }
    }
}
