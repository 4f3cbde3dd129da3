/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Builds a [`ModuleLifecycleGuard`] per module descriptor.
//!
//! Log placement:
//!
//! | `serialDump` | Serial log file |
//! |---|---|
//! | `true`  | `<working_dir>/<experiment_id>/logs/<kind>.log` (collected with the experiment) |
//! | `false` | `<scratch_dir>/<experiment_id>/<kind>.log` (kept local, never collected) |

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use super::{DriverProvider, ModuleLifecycleGuard, ModuleSettings};
use crate::descriptor::ExperimentModuleDescriptor;
use crate::logs::ExperimentLogger;
use crate::orchestrator::ExperimentError;

pub struct ModuleFactory {
    log_dir: PathBuf,
    scratch_dir: PathBuf,
    firmware_dir: PathBuf,
    logger: ExperimentLogger,
    drivers: Arc<dyn DriverProvider>,
}

impl ModuleFactory {
    /// `scratch_dir` and `firmware_dir` are already specific to the
    /// experiment.
    pub fn new(
        log_dir: impl Into<PathBuf>,
        scratch_dir: impl Into<PathBuf>,
        firmware_dir: impl Into<PathBuf>,
        logger: ExperimentLogger,
        drivers: Arc<dyn DriverProvider>,
    ) -> Self {
        Self {
            log_dir: log_dir.into(),
            scratch_dir: scratch_dir.into(),
            firmware_dir: firmware_dir.into(),
            logger,
            drivers,
        }
    }

    /// Resolve paths for `module`, construct its driver, and wrap it.
    ///
    /// `index` is the module's position on the node and only feeds the
    /// guard label.
    ///
    /// # Errors
    /// [`ExperimentError::UnsupportedModuleKind`] if the provider has no
    /// driver for the kind, [`ExperimentError::Io`] if the scratch directory
    /// cannot be created.
    pub fn build(
        &self,
        index: usize,
        module: &ExperimentModuleDescriptor,
    ) -> Result<ModuleLifecycleGuard, ExperimentError> {
        let log_dir = if module.serial_dump {
            self.log_dir.clone()
        } else {
            fs::create_dir_all(&self.scratch_dir)
                .map_err(|e| ExperimentError::io(&self.scratch_dir, e))?;
            self.scratch_dir.clone()
        };

        let settings = ModuleSettings {
            kind: module.kind,
            firmware: self.firmware_dir.join(&module.firmware),
            log_path: log_dir.join(module.kind.log_file_name()),
            serial_dump: module.serial_dump,
            serial_forward: module.serial_forward,
            gpio_tracer: module.gpio_tracer,
            logger: self.logger.clone(),
        };
        debug!(
            kind     = %settings.kind,
            firmware = %settings.firmware.display(),
            log      = %settings.log_path.display(),
            "building module driver"
        );

        let driver = self.drivers.create(settings)?;
        Ok(ModuleLifecycleGuard::new(
            format!("{}#{}", module.kind, index),
            driver,
        ))
    }
}
