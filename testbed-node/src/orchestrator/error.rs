/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Structured error types for experiment orchestration.
//!
//! Only two classes of failure can interrupt a running timeline:
//!
//! * [`ExperimentError::FirmwareTimeout`]: the readiness waiter ran out of
//!   time before every artifact arrived.
//! * [`ExperimentError::Driver`] / [`ExperimentError::Collaborator`]: a
//!   module driver or an external collaborator raised.
//!
//! Everything else ([`ExperimentError::UnsupportedModuleKind`],
//! [`ExperimentError::InvalidDescriptor`], I/O while setting up) is raised
//! before the scheduler loop starts.  Stale cancellations never show up
//! here; they are absorbed by the orchestrator (see
//! [`ScheduleError`](crate::scheduler::ScheduleError)).

use std::path::PathBuf;

use thiserror::Error;

/// Boxed source error carried by collaborator and driver failures.
///
/// Drivers and collaborators return `anyhow::Error`; it converts into this
/// box without losing the cause chain.
pub type BoxedSource = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Lifecycle operation that failed inside a module driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverOp {
    Prepare,
    Start,
    Stop,
}

impl std::fmt::Display for DriverOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverOp::Prepare => write!(f, "prepare"),
            DriverOp::Start => write!(f, "start"),
            DriverOp::Stop => write!(f, "stop"),
        }
    }
}

/// Top-level error type for building and running an experiment timeline.
#[derive(Debug, Error)]
pub enum ExperimentError {
    /// At least one firmware artifact was not present and stable when the
    /// readiness deadline passed.
    #[error("experiment {experiment_id}: firmware not ready before deadline (missing: {missing:?})")]
    FirmwareTimeout {
        experiment_id: String,
        missing: Vec<PathBuf>,
    },

    /// A module kind outside the closed set NRF52 / ZOUL / SKY, or a kind this
    /// node has no driver for.
    #[error("unsupported module kind: '{0}' (valid: NRF52, ZOUL, SKY)")]
    UnsupportedModuleKind(String),

    /// The control message could not be decoded into a descriptor.
    #[error("invalid experiment descriptor: {0}")]
    InvalidDescriptor(String),

    /// A module driver raised during prepare / start / stop.
    #[error("module {module}: {op} failed")]
    Driver {
        module: String,
        op: DriverOp,
        #[source]
        source: BoxedSource,
    },

    /// An external collaborator (GPIO tracer, log transfer, firmware
    /// source) raised.
    #[error("{what} failed")]
    Collaborator {
        what: &'static str,
        #[source]
        source: BoxedSource,
    },

    /// Filesystem setup failed (log directories, per-experiment log sink).
    #[error("I/O error on {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A START arrived for an experiment that is still registered on this
    /// node.
    #[error("experiment {0} is already running on this node")]
    AlreadyRunning(String),

    /// The dedicated run-loop thread could not be spawned.
    #[error("failed to spawn experiment thread")]
    Spawn(#[source] std::io::Error),
}

impl ExperimentError {
    /// Wrap a collaborator failure.
    pub fn collaborator(what: &'static str, source: impl Into<BoxedSource>) -> Self {
        ExperimentError::Collaborator {
            what,
            source: source.into(),
        }
    }

    /// Wrap an I/O failure on `path`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ExperimentError::Io {
            path: path.into(),
            source,
        }
    }
}
