/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! GPIO tracing.
//!
//! The tracer is one piece of hardware per node, shared by every experiment
//! that runs there.  It is handed to each orchestrator as an
//! `Arc<dyn GpioTracer>`; nothing here serialises tracing windows between
//! experiments, that is up to whoever schedules them.

use std::process::{Child, Command};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Context};
use tracing::{debug, info, warn};

use crate::logs::ExperimentLogger;

pub trait GpioTracer: Send + Sync {
    fn start(&self, experiment_id: &str, logger: &ExperimentLogger) -> anyhow::Result<()>;

    /// Stop tracing.  Stopping an idle tracer is a no-op.
    fn stop(&self) -> anyhow::Result<()>;
}

/// Runs an external capture tool for the duration of the trace.
///
/// `start` spawns the configured argv with `TESTBED_EXPERIMENT_ID` set;
/// `stop` kills and reaps it.  Without a command every call is a logged
/// no-op, so nodes without tracing hardware can still run experiments that
/// ask for it.
#[derive(Debug)]
pub struct CommandGpioTracer {
    command: Option<Vec<String>>,
    child: Mutex<Option<Child>>,
}

impl CommandGpioTracer {
    pub fn new(command: Option<Vec<String>>) -> Self {
        Self {
            command: command.filter(|c| !c.is_empty()),
            child: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Child>> {
        self.child.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl GpioTracer for CommandGpioTracer {
    fn start(&self, experiment_id: &str, logger: &ExperimentLogger) -> anyhow::Result<()> {
        let Some((program, args)) = self.command.as_ref().and_then(|c| c.split_first()) else {
            logger.warn("GPIO tracing requested but this node has no tracer configured");
            return Ok(());
        };

        let mut slot = self.lock();
        if slot.is_some() {
            bail!("GPIO tracer is already running (overlapping tracing windows)");
        }
        let child = Command::new(program)
            .args(args)
            .env("TESTBED_EXPERIMENT_ID", experiment_id)
            .spawn()
            .with_context(|| format!("failed to start GPIO tracer '{program}'"))?;

        info!(experiment = %experiment_id, pid = child.id(), "GPIO tracer started");
        logger.info("GPIO tracer started");
        *slot = Some(child);
        Ok(())
    }

    fn stop(&self) -> anyhow::Result<()> {
        let Some(mut child) = self.lock().take() else {
            debug!("GPIO tracer stop requested while idle");
            return Ok(());
        };
        if let Err(e) = child.kill() {
            // Already exited on its own; reaping below still applies.
            warn!(pid = child.id(), "GPIO tracer kill failed: {e}");
        }
        let status = child.wait().context("failed to reap GPIO tracer")?;
        info!(status = %status, "GPIO tracer stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logger() -> ExperimentLogger {
        ExperimentLogger::detached("node01", "42")
    }

    #[test]
    fn unconfigured_tracer_is_a_noop() {
        let tracer = CommandGpioTracer::new(None);
        tracer.start("42", &logger()).unwrap();
        assert!(!tracer.is_running());
        tracer.stop().unwrap();
    }

    #[test]
    fn start_spawns_and_stop_reaps() {
        let tracer = CommandGpioTracer::new(Some(vec!["sleep".into(), "30".into()]));
        tracer.start("42", &logger()).unwrap();
        assert!(tracer.is_running());

        let err = tracer.start("43", &logger()).unwrap_err();
        assert!(err.to_string().contains("already running"));

        tracer.stop().unwrap();
        assert!(!tracer.is_running());
        // idle stop
        tracer.stop().unwrap();
    }

    #[test]
    fn missing_program_fails_to_start() {
        let tracer = CommandGpioTracer::new(Some(vec!["/nonexistent/gpio-trace".into()]));
        assert!(tracer.start("42", &logger()).is_err());
        assert!(!tracer.is_running());
    }
}
