/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Experiment orchestration.
//!
//! [`ExperimentOrchestrator`] turns one [`ExperimentDescriptor`] into a
//! timeline on this node and drives it to exactly one terminal outcome.
//!
//! ```text
//! Idle ──run()──► FirmwareRetrieval ──► Armed ──► Running ──► Terminated
//!   │                                                            ▲
//!   └──────────── stop()/cancel() before run() ──────────────────┘
//! ```
//!
//! # Timeline
//!
//! All "now" events share one anchor instant, so equal-time events are
//! ordered purely by priority:
//!
//! | Priority | Event | Due |
//! |---|---|---|
//! | 0 | firmware readiness wait | now |
//! | 1 | `prepare` per module | now |
//! | 2 | `start` per module | `max(start, now)` |
//! | 3 | GPIO tracer start (once per node) | `max(start, now)` |
//! | 4 | GPIO tracer stop | `max(end, now)` |
//! | 5 | `stop` per module | `max(end, now)` |
//! | 6 | logger teardown + log retrieval | `max(end, now)` |
//!
//! The firmware deadline is `max(start - grace, now + grace)`.
//!
//! # Early termination
//!
//! [`ExperimentController::stop`] and [`ExperimentController::cancel`] may be
//! called from any thread.  While the timeline runs, the request is sent to
//! the run loop over a channel; the loop picks it up before its next event,
//! cancels everything still pending (already-fired handles are ignored), and
//! queues at time zero: every module stop, the tracer stop, the logger
//! teardown and, for `stop(true)` only, the log retrieval.  The lifecycle guards
//! make the outcome correct even if a module start is in flight.
//!
//! The completion callback fires exactly once, on every exit path.

pub mod error;

pub use error::{BoxedSource, DriverOp, ExperimentError};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::config::{NodeSettings, TimelineConfig};
use crate::descriptor::ExperimentDescriptor;
use crate::firmware::{FirmwareSource, ReadinessWaiter};
use crate::gpio::GpioTracer;
use crate::logs::{ExperimentLogger, LogTransfer};
use crate::module::{DriverProvider, ModuleFactory, ModuleLifecycleGuard};
use crate::scheduler::{EventHandle, RunOutcome, ScheduleError, Scheduler};

// ── Priorities ────────────────────────────────────────────────────────────────

/// Tie-break priorities of the regular timeline.
mod priority {
    pub const FIRMWARE_WAIT: u32 = 0;
    pub const PREPARE: u32 = 1;
    pub const MODULE_START: u32 = 2;
    pub const TRACER_START: u32 = 3;
    pub const TRACER_STOP: u32 = 4;
    pub const MODULE_STOP: u32 = 5;
    pub const LOG_RETRIEVAL: u32 = 6;
}

/// Tie-break priorities of the early-stop tail.
mod early {
    pub const MODULE_STOP: u32 = 0;
    pub const TRACER_STOP: u32 = 1;
    pub const LOGGER_TEARDOWN: u32 = 2;
    pub const LOG_RETRIEVAL: u32 = 3;
}

// ── Public types ──────────────────────────────────────────────────────────────

/// External collaborators an orchestrator calls into.  None of them is owned
/// by the orchestrator.
#[derive(Clone)]
pub struct Collaborators {
    pub firmware: Arc<dyn FirmwareSource>,
    pub logs: Arc<dyn LogTransfer>,
    pub gpio: Arc<dyn GpioTracer>,
    pub drivers: Arc<dyn DriverProvider>,
}

/// Terminal outcome of one experiment run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExperimentOutcome {
    /// The timeline drained normally.
    Completed,
    /// Stopped early; logs were retrieved.
    Stopped,
    /// Cancelled; results discarded, no log retrieval.
    Cancelled,
    /// The run aborted with an error (message attached).
    Failed(String),
}

/// Called once when the experiment reaches its terminal outcome.
pub type CompletionCallback = Box<dyn FnOnce(&ExperimentOutcome) + Send + 'static>;

// ── Internal state ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EarlyStop {
    Stop { retrieve_logs: bool },
    Cancel,
}

impl EarlyStop {
    fn retrieves_logs(self) -> bool {
        matches!(self, EarlyStop::Stop { retrieve_logs: true })
    }

    fn outcome(self) -> ExperimentOutcome {
        match self {
            EarlyStop::Stop { .. } => ExperimentOutcome::Stopped,
            EarlyStop::Cancel => ExperimentOutcome::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Terminated(ExperimentOutcome),
}

/// State shared between the orchestrator (run-loop thread) and its
/// controllers (any thread).
struct Shared {
    experiment_id: String,
    logger: ExperimentLogger,
    gpio: Arc<dyn GpioTracer>,
    /// Whether this run's timeline owns a tracing window on the node.
    traces_gpio: bool,
    logs: Arc<dyn LogTransfer>,
    phase: Mutex<Phase>,
    abort: Arc<AtomicBool>,
    control: Sender<EarlyStop>,
    on_finish: Mutex<Option<CompletionCallback>>,
}

impl Shared {
    fn lock_phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue the early-stop tail at time zero.
    fn schedule_early_stop(
        &self,
        scheduler: &mut Scheduler<ExperimentError>,
        guards: &[Arc<ModuleLifecycleGuard>],
        request: EarlyStop,
        stop_tracer: bool,
    ) {
        let now = Instant::now();

        for guard in guards {
            let guard = Arc::clone(guard);
            scheduler.schedule_at(now, early::MODULE_STOP, move || guard.stop());
        }

        if stop_tracer {
            let gpio = Arc::clone(&self.gpio);
            scheduler.schedule_at(now, early::TRACER_STOP, move || {
                gpio.stop()
                    .map_err(|e| ExperimentError::collaborator("GPIO tracer stop", e))
            });
        }

        let logger = self.logger.clone();
        scheduler.schedule_at(now, early::LOGGER_TEARDOWN, move || {
            logger.teardown();
            Ok(())
        });

        if request.retrieves_logs() {
            let logs = Arc::clone(&self.logs);
            let id = self.experiment_id.clone();
            scheduler.schedule_at(now, early::LOG_RETRIEVAL, move || {
                logs.initiate_log_retrieval(&id)
            });
        }
    }

    /// Early stop for an experiment whose timeline never started.  No guard
    /// exists yet, so no driver is touched.  The shared tracer is left alone
    /// unless this run asked for tracing.
    fn early_stop_idle(&self, request: EarlyStop) -> Result<ExperimentOutcome, ExperimentError> {
        let mut scheduler = Scheduler::new();
        self.schedule_early_stop(&mut scheduler, &[], request, self.traces_gpio);
        scheduler.run().map(|()| request.outcome())
    }

    /// Record the terminal outcome and fire the completion callback.  The
    /// first outcome wins.
    fn conclude(&self, mut phase: MutexGuard<'_, Phase>, outcome: ExperimentOutcome) {
        if let Phase::Terminated(recorded) = &*phase {
            debug!(experiment = %self.experiment_id, ?recorded, ?outcome, "already concluded");
            return;
        }
        *phase = Phase::Terminated(outcome.clone());
        drop(phase);

        let callback = self
            .on_finish
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(callback) = callback {
            callback(&outcome);
        }
    }
}

/// Maps wall-clock times onto the monotonic clock from a single reference
/// point.
#[derive(Debug, Clone, Copy)]
struct TimeAnchor {
    instant: Instant,
    wall: DateTime<Local>,
}

impl TimeAnchor {
    fn now() -> Self {
        Self {
            instant: Instant::now(),
            wall: Local::now(),
        }
    }

    /// Time from the anchor until `at`; zero if `at` is already past.
    fn until(&self, at: DateTime<Local>) -> Duration {
        (at - self.wall).to_std().unwrap_or(Duration::ZERO)
    }

    /// `max(at, now)` on the monotonic clock.
    fn at(&self, at: DateTime<Local>) -> Instant {
        self.instant + self.until(at)
    }
}

/// Offset of the firmware deadline from now:
/// `max(start - grace, now + grace) - now`.
fn firmware_deadline_offset(until_start: Duration, grace: Duration) -> Duration {
    until_start.saturating_sub(grace).max(grace)
}

// ── ExperimentController ──────────────────────────────────────────────────────

/// Thread-safe handle for stopping or cancelling an experiment.
#[derive(Clone)]
pub struct ExperimentController {
    shared: Arc<Shared>,
}

impl ExperimentController {
    pub fn experiment_id(&self) -> &str {
        &self.shared.experiment_id
    }

    /// Stop early and keep the results; logs are retrieved when
    /// `retrieve_logs` is set.
    pub fn stop(&self, retrieve_logs: bool) -> Result<(), ExperimentError> {
        self.shared.logger.info("Stopping experiment.");
        self.request(EarlyStop::Stop { retrieve_logs })
    }

    /// Stop early and discard the results (no log retrieval).
    pub fn cancel(&self) -> Result<(), ExperimentError> {
        self.shared.logger.info("Cancelling experiment.");
        self.request(EarlyStop::Cancel)
    }

    /// Terminal outcome, once there is one.
    pub fn outcome(&self) -> Option<ExperimentOutcome> {
        match &*self.shared.lock_phase() {
            Phase::Terminated(outcome) => Some(outcome.clone()),
            _ => None,
        }
    }

    fn request(&self, request: EarlyStop) -> Result<(), ExperimentError> {
        let phase = self.shared.lock_phase();
        let current = phase.clone();
        match current {
            Phase::Idle => {
                // Hold the phase lock so a concurrent run() sees Terminated.
                let result = self.shared.early_stop_idle(request);
                let outcome = match &result {
                    Ok(outcome) => outcome.clone(),
                    Err(e) => ExperimentOutcome::Failed(e.to_string()),
                };
                info!(experiment = %self.shared.experiment_id, ?outcome, "terminated before run");
                self.shared.conclude(phase, outcome);
                result.map(|_| ())
            }
            Phase::Running => {
                // Queue first: once the waiter sees the flag, the request must
                // already be visible to the run loop.
                if self.shared.control.send(request).is_err() {
                    warn!(experiment = %self.shared.experiment_id, "run loop is gone, request dropped");
                }
                self.shared.abort.store(true, Ordering::SeqCst);
                Ok(())
            }
            Phase::Terminated(outcome) => {
                debug!(
                    experiment = %self.shared.experiment_id,
                    ?request,
                    ?outcome,
                    "already terminated, request ignored"
                );
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for ExperimentController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentController")
            .field("experiment_id", &self.shared.experiment_id)
            .finish()
    }
}

// ── ExperimentOrchestrator ────────────────────────────────────────────────────

/// Owns one experiment run on one node: its scheduler, its lifecycle guards
/// and the handles of every event it queued.
pub struct ExperimentOrchestrator {
    node_id: String,
    descriptor: ExperimentDescriptor,
    timeline: TimelineConfig,
    firmware: Arc<dyn FirmwareSource>,
    factory: ModuleFactory,
    scheduler: Scheduler<ExperimentError>,
    guards: Vec<Arc<ModuleLifecycleGuard>>,
    events: Vec<EventHandle>,
    control: Receiver<EarlyStop>,
    shared: Arc<Shared>,
}

impl ExperimentOrchestrator {
    /// Prepare the log directory and the per-experiment log sink.
    ///
    /// # Errors
    /// Fails if the log directory or `node.log` cannot be created.
    pub fn new<F>(
        node: &NodeSettings,
        timeline: TimelineConfig,
        descriptor: ExperimentDescriptor,
        collaborators: Collaborators,
        on_finish: F,
    ) -> Result<Self, ExperimentError>
    where
        F: FnOnce(&ExperimentOutcome) + Send + 'static,
    {
        let id = descriptor.experiment_id.clone();
        let log_dir = collaborators.logs.create_logging_directory(&id)?;
        let logger = ExperimentLogger::create(&log_dir.join("node.log"), &node.id, &id)?;

        let factory = ModuleFactory::new(
            log_dir,
            node.scratch_directory.join(&id),
            collaborators.firmware.local_firmware_dir(&id),
            logger.clone(),
            Arc::clone(&collaborators.drivers),
        );

        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            experiment_id: id,
            logger,
            gpio: collaborators.gpio,
            traces_gpio: descriptor.gpio_tracing_requested(&node.id),
            logs: collaborators.logs,
            phase: Mutex::new(Phase::Idle),
            abort: Arc::new(AtomicBool::new(false)),
            control: control_tx,
            on_finish: Mutex::new(Some(Box::new(on_finish))),
        });

        Ok(Self {
            node_id: node.id.clone(),
            descriptor,
            timeline,
            firmware: collaborators.firmware,
            factory,
            scheduler: Scheduler::new(),
            guards: Vec::new(),
            events: Vec::new(),
            control: control_rx,
            shared,
        })
    }

    pub fn experiment_id(&self) -> &str {
        &self.shared.experiment_id
    }

    /// A handle other threads use to stop or cancel this run.
    pub fn controller(&self) -> ExperimentController {
        ExperimentController {
            shared: Arc::clone(&self.shared),
        }
    }

    /// See [`ExperimentController::stop`].
    pub fn stop(&self, retrieve_logs: bool) -> Result<(), ExperimentError> {
        self.controller().stop(retrieve_logs)
    }

    /// See [`ExperimentController::cancel`].
    pub fn cancel(&self) -> Result<(), ExperimentError> {
        self.controller().cancel()
    }

    /// Build the timeline and block until it reaches a terminal outcome.
    ///
    /// # Errors
    /// [`ExperimentError::UnsupportedModuleKind`] (before any event runs),
    /// [`ExperimentError::FirmwareTimeout`], or the first driver /
    /// collaborator failure.  On error the remaining events are dropped,
    /// every module is stopped, the tracer is stopped if this run traces,
    /// and the logger is torn down (without log retrieval) before the
    /// completion callback fires with [`ExperimentOutcome::Failed`].
    pub fn run(mut self) -> Result<ExperimentOutcome, ExperimentError> {
        {
            let mut phase = self.shared.lock_phase();
            if let Phase::Terminated(outcome) = &*phase {
                info!(experiment = %self.shared.experiment_id, "terminated before its timeline started");
                return Ok(outcome.clone());
            }
            *phase = Phase::Running;
        }

        let result = self.build_timeline().and_then(|()| self.drive());

        match result {
            Ok(outcome) => {
                info!(experiment = %self.shared.experiment_id, ?outcome, "experiment finished");
                self.shared.conclude(self.shared.lock_phase(), outcome.clone());
                Ok(outcome)
            }
            Err(e) => {
                error!(experiment = %self.shared.experiment_id, "experiment failed: {e:#}");
                self.shared.logger.error(format!("Experiment failed: {e}"));
                self.teardown_after_failure();
                let outcome = ExperimentOutcome::Failed(e.to_string());
                self.shared.conclude(self.shared.lock_phase(), outcome);
                Err(e)
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Timeline construction
    // ─────────────────────────────────────────────────────────────────────────

    fn build_timeline(&mut self) -> Result<(), ExperimentError> {
        let id = self.shared.experiment_id.clone();
        let logger = self.shared.logger.clone();
        let modules = self.descriptor.modules_for(&self.node_id).to_vec();

        // 1. fire-and-continue firmware requests
        logger.info("Initiating firmware retrieval");
        for module in &modules {
            if let Err(e) = self.firmware.retrieve_firmware(&id, &module.firmware) {
                logger.warn(format!("Firmware request for '{}' failed: {e:#}", module.firmware));
            }
        }

        let anchor = TimeAnchor::now();
        let start = anchor.at(self.descriptor.start);
        let end = anchor.at(self.descriptor.end);

        // 2. readiness wait gates everything else
        let deadline = anchor.instant
            + firmware_deadline_offset(
                anchor.until(self.descriptor.start),
                self.timeline.firmware_grace,
            );
        let fw_dir = self.firmware.local_firmware_dir(&id);
        let artifacts: Vec<PathBuf> = modules.iter().map(|m| fw_dir.join(&m.firmware)).collect();
        let waiter =
            ReadinessWaiter::new(&self.timeline).with_abort_flag(Arc::clone(&self.shared.abort));
        {
            let (id, logger) = (id.clone(), logger.clone());
            self.push(anchor.instant, priority::FIRMWARE_WAIT, move || {
                waiter.wait(&id, &artifacts, deadline, &logger).map(|_| ())
            });
        }

        // 3. per-module prepare / start / stop
        for (index, module) in modules.iter().enumerate() {
            let guard = Arc::new(self.factory.build(index, module)?);

            let g = Arc::clone(&guard);
            self.push(anchor.instant, priority::PREPARE, move || g.prepare());
            let g = Arc::clone(&guard);
            self.push(start, priority::MODULE_START, move || g.start());
            let g = Arc::clone(&guard);
            self.push(end, priority::MODULE_STOP, move || g.stop());

            self.guards.push(guard);
        }

        // 4. one shared tracing window per node
        if self.descriptor.gpio_tracing_requested(&self.node_id) {
            let (gpio, id, logger) = (Arc::clone(&self.shared.gpio), id.clone(), logger.clone());
            self.push(start, priority::TRACER_START, move || {
                gpio.start(&id, &logger)
                    .map_err(|e| ExperimentError::collaborator("GPIO tracer start", e))
            });
            let gpio = Arc::clone(&self.shared.gpio);
            self.push(end, priority::TRACER_STOP, move || {
                gpio.stop()
                    .map_err(|e| ExperimentError::collaborator("GPIO tracer stop", e))
            });
        }

        // 5. terminal log retrieval
        {
            let logs = Arc::clone(&self.shared.logs);
            let (id, logger) = (id.clone(), logger.clone());
            self.push(end, priority::LOG_RETRIEVAL, move || {
                logger.info("Initiating log retrieval");
                logger.teardown();
                logs.initiate_log_retrieval(&id)
            });
        }

        info!(
            experiment = %id,
            node       = %self.node_id,
            modules    = self.guards.len(),
            events     = self.events.len(),
            start_in   = ?anchor.until(self.descriptor.start),
            end_in     = ?anchor.until(self.descriptor.end),
            "timeline armed"
        );
        Ok(())
    }

    fn push<F>(&mut self, due: Instant, priority: u32, action: F)
    where
        F: FnOnce() -> Result<(), ExperimentError> + Send + 'static,
    {
        let handle = self.scheduler.schedule_at(due, priority, action);
        self.events.push(handle);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Execution
    // ─────────────────────────────────────────────────────────────────────────

    fn drive(&mut self) -> Result<ExperimentOutcome, ExperimentError> {
        match self.scheduler.run_interruptible(&self.control)? {
            RunOutcome::Drained => Ok(ExperimentOutcome::Completed),
            RunOutcome::Interrupted(request) => {
                self.early_stop(request)?;
                Ok(request.outcome())
            }
        }
    }

    fn early_stop(&mut self, request: EarlyStop) -> Result<(), ExperimentError> {
        let mut cancelled = 0usize;
        let mut stale = 0usize;
        for handle in self.events.drain(..).rev() {
            match self.scheduler.cancel(handle) {
                Ok(()) => cancelled += 1,
                Err(ScheduleError::NotFound { .. }) => stale += 1,
            }
        }
        debug!(
            experiment = %self.shared.experiment_id,
            ?request,
            cancelled,
            stale,
            "pending events cancelled"
        );

        self.shared
            .schedule_early_stop(&mut self.scheduler, &self.guards, request, true);
        self.scheduler.run()
    }

    fn teardown_after_failure(&mut self) {
        let dropped = self.scheduler.clear();
        self.events.clear();
        debug!(experiment = %self.shared.experiment_id, dropped, "pending events dropped after failure");

        for guard in &self.guards {
            if let Err(e) = guard.stop() {
                warn!(module = %guard.label(), "stop after failure failed: {e:#}");
            }
        }
        if self.shared.traces_gpio {
            if let Err(e) = self.shared.gpio.stop() {
                warn!("GPIO tracer stop after failure failed: {e:#}");
            }
        }
        self.shared.logger.teardown();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
