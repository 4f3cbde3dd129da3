/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Module drivers and their lifecycle guard.
//!
//! A driver is one attached hardware module behind the capability set
//! {prepare, start, stop}.  The orchestrator never calls a driver directly;
//! it goes through a [`ModuleLifecycleGuard`], which enforces
//!
//! ```text
//!            start (forwarded)             stop (forwarded)
//! NotStarted ──────────────────► Started ──────────────────► Stopped
//!     │                                                          ▲
//!     └──────────────── stop (not forwarded) ────────────────────┘
//! ```
//!
//! Every other transition is absorbed: a start after a stop never reaches
//! the driver, a second start or stop is a no-op.  The driver therefore sees
//! at most one start, exactly one stop if it was started, and never a start
//! after a stop, no matter which thread's call wins the lock.

pub mod command;
pub mod factory;

pub use factory::ModuleFactory;

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::descriptor::ModuleKind;
use crate::logs::ExperimentLogger;
use crate::orchestrator::{DriverOp, ExperimentError};

// ── Driver capability interface ───────────────────────────────────────────────

/// One attached hardware module.
///
/// Implementations are opaque to the orchestrator; a returned error halts the
/// experiment timeline.
pub trait ModuleDriver: Send {
    fn prepare(&mut self) -> anyhow::Result<()>;
    fn start(&mut self) -> anyhow::Result<()>;
    fn stop(&mut self) -> anyhow::Result<()>;
}

/// Everything a driver needs to know about its module, resolved by the
/// [`ModuleFactory`].
#[derive(Debug, Clone)]
pub struct ModuleSettings {
    pub kind: ModuleKind,
    pub firmware: PathBuf,
    pub log_path: PathBuf,
    pub serial_dump: bool,
    pub serial_forward: bool,
    pub gpio_tracer: bool,
    pub logger: ExperimentLogger,
}

/// Constructs the driver variant for a module kind.
///
/// The set of kinds is closed ([`ModuleKind`]); a provider that has no driver
/// for a kind returns [`ExperimentError::UnsupportedModuleKind`].
pub trait DriverProvider: Send + Sync {
    fn create(&self, settings: ModuleSettings) -> Result<Box<dyn ModuleDriver>, ExperimentError>;
}

// ── Lifecycle state ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    #[default]
    NotStarted,
    Started,
    Stopped,
}

impl LifecycleState {
    /// Next state after a start request, and whether the driver must be
    /// called.
    fn on_start(self) -> (Self, bool) {
        match self {
            LifecycleState::NotStarted => (LifecycleState::Started, true),
            other => (other, false),
        }
    }

    /// Next state after a stop request, and whether the driver must be
    /// called.
    fn on_stop(self) -> (Self, bool) {
        match self {
            LifecycleState::Started => (LifecycleState::Stopped, true),
            _ => (LifecycleState::Stopped, false),
        }
    }
}

// ── ModuleLifecycleGuard ──────────────────────────────────────────────────────

struct GuardInner {
    state: LifecycleState,
    prepared: bool,
    driver: Box<dyn ModuleDriver>,
}

/// Serialises prepare / start / stop on one driver.
///
/// The guard lock is held across the driver call, so a stop issued while a
/// start is in progress waits for the start to finish and then tears the
/// module down.
pub struct ModuleLifecycleGuard {
    label: String,
    inner: Mutex<GuardInner>,
}

impl ModuleLifecycleGuard {
    pub fn new(label: impl Into<String>, driver: Box<dyn ModuleDriver>) -> Self {
        Self {
            label: label.into(),
            inner: Mutex::new(GuardInner {
                state: LifecycleState::NotStarted,
                prepared: false,
                driver,
            }),
        }
    }

    /// Human-readable module label, e.g. `NRF52#0`.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> LifecycleState {
        self.lock().state
    }

    pub fn has_prepared(&self) -> bool {
        self.lock().prepared
    }

    /// Run the driver's one-time setup.  Not gated by the lifecycle state.
    pub fn prepare(&self) -> Result<(), ExperimentError> {
        let mut inner = self.lock();
        inner.prepared = true;
        debug!(module = %self.label, "prepare");
        inner.driver.prepare().map_err(|e| self.driver_error(DriverOp::Prepare, e))
    }

    /// Start the module unless it was already started or stopped.
    pub fn start(&self) -> Result<(), ExperimentError> {
        let mut inner = self.lock();
        let (next, forward) = inner.state.on_start();
        let prev = std::mem::replace(&mut inner.state, next);
        if !forward {
            info!(module = %self.label, state = ?prev, "start suppressed");
            return Ok(());
        }
        info!(module = %self.label, "start");
        inner.driver.start().map_err(|e| self.driver_error(DriverOp::Start, e))
    }

    /// Stop the module.  Only reaches the driver if it was started.
    pub fn stop(&self) -> Result<(), ExperimentError> {
        let mut inner = self.lock();
        let (next, forward) = inner.state.on_stop();
        let prev = std::mem::replace(&mut inner.state, next);
        if !forward {
            debug!(module = %self.label, state = ?prev, "stop not forwarded");
            return Ok(());
        }
        info!(module = %self.label, "stop");
        inner.driver.stop().map_err(|e| self.driver_error(DriverOp::Stop, e))
    }

    fn driver_error(&self, op: DriverOp, source: anyhow::Error) -> ExperimentError {
        ExperimentError::Driver {
            module: self.label.clone(),
            op,
            source: source.into(),
        }
    }

    // The state is a plain value written before the driver call; it is
    // consistent even if a driver panicked while the lock was held.
    fn lock(&self) -> MutexGuard<'_, GuardInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ModuleLifecycleGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("ModuleLifecycleGuard")
            .field("label", &self.label)
            .field("state", &inner.state)
            .field("prepared", &inner.prepared)
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    use proptest::prelude::*;

    /// Driver that records every call it receives.
    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<&'static str>>>,
        start_delay: Duration,
        fail_start: bool,
    }

    impl Recorder {
        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ModuleDriver for Recorder {
        fn prepare(&mut self) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push("prepare");
            Ok(())
        }
        fn start(&mut self) -> anyhow::Result<()> {
            thread::sleep(self.start_delay);
            self.calls.lock().unwrap().push("start");
            if self.fail_start {
                anyhow::bail!("flash failed");
            }
            Ok(())
        }
        fn stop(&mut self) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push("stop");
            Ok(())
        }
    }

    fn guard(rec: &Recorder) -> ModuleLifecycleGuard {
        ModuleLifecycleGuard::new("NRF52#0", Box::new(rec.clone()))
    }

    #[test]
    fn start_then_stop_reaches_driver_once_each() {
        let rec = Recorder::default();
        let g = guard(&rec);
        g.prepare().unwrap();
        g.start().unwrap();
        g.stop().unwrap();
        g.stop().unwrap();
        g.start().unwrap();

        assert!(g.has_prepared());
        assert_eq!(g.state(), LifecycleState::Stopped);
        assert_eq!(rec.calls(), vec!["prepare", "start", "stop"]);
    }

    #[test]
    fn stop_before_start_never_calls_driver() {
        let rec = Recorder::default();
        let g = guard(&rec);
        g.stop().unwrap();
        assert_eq!(g.state(), LifecycleState::Stopped);
        assert!(rec.calls().is_empty());
    }

    #[test]
    fn start_after_stop_is_suppressed() {
        let rec = Recorder::default();
        let g = guard(&rec);
        g.stop().unwrap();
        g.start().unwrap();
        assert_eq!(g.state(), LifecycleState::Stopped);
        assert!(rec.calls().is_empty());
    }

    #[test]
    fn prepare_is_not_gated_by_state() {
        let rec = Recorder::default();
        let g = guard(&rec);
        g.stop().unwrap();
        g.prepare().unwrap();
        assert_eq!(rec.calls(), vec!["prepare"]);
    }

    #[test]
    fn failed_start_still_counts_as_started() {
        let rec = Recorder {
            fail_start: true,
            ..Default::default()
        };
        let g = guard(&rec);
        let err = g.start().unwrap_err();
        assert!(matches!(err, ExperimentError::Driver { op: DriverOp::Start, .. }));
        // the module may be half-flashed; a stop must still tear it down
        g.stop().unwrap();
        assert_eq!(rec.calls(), vec!["start", "stop"]);
    }

    #[test]
    fn stop_waits_for_in_flight_start() {
        let rec = Recorder {
            start_delay: Duration::from_millis(150),
            ..Default::default()
        };
        let g = Arc::new(guard(&rec));

        let starter = {
            let g = Arc::clone(&g);
            thread::spawn(move || g.start().unwrap())
        };
        thread::sleep(Duration::from_millis(50));
        g.stop().unwrap();
        starter.join().unwrap();

        assert_eq!(rec.calls(), vec!["start", "stop"]);
    }

    /// Driver calls must satisfy: ≤ 1 start, no start after a stop, and
    /// exactly one stop iff a start happened.
    fn assert_driver_invariant(calls: &[&str]) {
        let starts = calls.iter().filter(|c| **c == "start").count();
        let stops = calls.iter().filter(|c| **c == "stop").count();
        assert!(starts <= 1, "more than one start: {calls:?}");
        assert_eq!(stops, starts, "stop count must match start count: {calls:?}");
        if let (Some(s), Some(t)) = (
            calls.iter().position(|c| *c == "start"),
            calls.iter().position(|c| *c == "stop"),
        ) {
            assert!(s < t, "start after stop: {calls:?}");
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Property: a scheduled start racing an external stop never breaks
        /// the driver invariant, whatever the interleaving.
        #[test]
        fn prop_concurrent_start_stop_keeps_driver_invariant(
            start_delay_us in 0u64..2_000,
            stop_delay_us in 0u64..2_000,
            driver_delay_us in 0u64..500,
            extra_stops in 0usize..3,
        ) {
            let rec = Recorder {
                start_delay: Duration::from_micros(driver_delay_us),
                ..Default::default()
            };
            let g = Arc::new(guard(&rec));
            let barrier = Arc::new(Barrier::new(2));

            let scheduled_start = {
                let (g, b) = (Arc::clone(&g), Arc::clone(&barrier));
                thread::spawn(move || {
                    b.wait();
                    thread::sleep(Duration::from_micros(start_delay_us));
                    g.start().unwrap();
                })
            };
            let external_stop = {
                let (g, b) = (Arc::clone(&g), Arc::clone(&barrier));
                thread::spawn(move || {
                    b.wait();
                    thread::sleep(Duration::from_micros(stop_delay_us));
                    for _ in 0..=extra_stops {
                        g.stop().unwrap();
                    }
                })
            };
            scheduled_start.join().unwrap();
            external_stop.join().unwrap();

            prop_assert_eq!(g.state(), LifecycleState::Stopped);
            assert_driver_invariant(&rec.calls());
        }
    }
}
