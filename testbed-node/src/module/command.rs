/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Drivers backed by external flashing / control tools.
//!
//! Each module kind is configured with one argv per lifecycle step (see
//! [`CommandSet`]).  The command runs to completion; its stdout and stderr
//! are appended to the module's serial log file.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::process::Command;

use anyhow::{bail, Context};
use tracing::{debug, info};

use super::{DriverProvider, ModuleDriver, ModuleSettings};
use crate::config::CommandSet;
use crate::descriptor::ModuleKind;
use crate::orchestrator::ExperimentError;

/// [`DriverProvider`] that builds a [`CommandDriver`] for every configured
/// kind.
#[derive(Debug, Clone, Default)]
pub struct CommandDriverProvider {
    commands: BTreeMap<ModuleKind, CommandSet>,
}

impl CommandDriverProvider {
    pub fn new(commands: BTreeMap<ModuleKind, CommandSet>) -> Self {
        Self { commands }
    }

    pub fn supports(&self, kind: ModuleKind) -> bool {
        self.commands.contains_key(&kind)
    }
}

impl DriverProvider for CommandDriverProvider {
    fn create(&self, settings: ModuleSettings) -> Result<Box<dyn ModuleDriver>, ExperimentError> {
        let commands = self
            .commands
            .get(&settings.kind)
            .cloned()
            .ok_or_else(|| ExperimentError::UnsupportedModuleKind(settings.kind.to_string()))?;
        Ok(Box::new(CommandDriver { commands, settings }))
    }
}

#[derive(Debug)]
pub struct CommandDriver {
    commands: CommandSet,
    settings: ModuleSettings,
}

impl CommandDriver {
    fn substitute(&self, arg: &str) -> String {
        arg.replace("{firmware}", &self.settings.firmware.to_string_lossy())
            .replace("{log}", &self.settings.log_path.to_string_lossy())
            .replace("{kind}", self.settings.kind.as_str())
    }

    fn run_step(&self, step: &str, argv: &[String]) -> anyhow::Result<()> {
        let Some((program, args)) = argv.split_first() else {
            debug!(kind = %self.settings.kind, step, "no command configured");
            return Ok(());
        };
        let program = self.substitute(program);
        let args: Vec<String> = args.iter().map(|a| self.substitute(a)).collect();

        info!(kind = %self.settings.kind, step, program = %program, args = ?args, "running module command");
        self.settings
            .logger
            .info(format!("{} {}: {} {}", self.settings.kind, step, program, args.join(" ")));

        let output = Command::new(&program)
            .args(&args)
            .env("TESTBED_MODULE_KIND", self.settings.kind.as_str())
            .env("TESTBED_FIRMWARE", &self.settings.firmware)
            .env("TESTBED_SERIAL_FORWARD", flag(self.settings.serial_forward))
            .env("TESTBED_GPIO_TRACER", flag(self.settings.gpio_tracer))
            .output()
            .with_context(|| format!("failed to run {step} command '{program}'"))?;

        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.settings.log_path)
            .with_context(|| format!("cannot open module log {}", self.settings.log_path.display()))?;
        log.write_all(&output.stdout)?;
        log.write_all(&output.stderr)?;

        if !output.status.success() {
            bail!("{step} command '{program}' exited with {}", output.status);
        }
        Ok(())
    }
}

fn flag(v: bool) -> &'static str {
    if v {
        "1"
    } else {
        "0"
    }
}

impl ModuleDriver for CommandDriver {
    fn prepare(&mut self) -> anyhow::Result<()> {
        self.run_step("prepare", &self.commands.prepare)
    }

    fn start(&mut self) -> anyhow::Result<()> {
        self.run_step("start", &self.commands.start)
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        self.run_step("stop", &self.commands.stop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::ExperimentLogger;
    use std::fs;
    use tempfile::TempDir;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    fn settings(tmp: &TempDir, kind: ModuleKind) -> ModuleSettings {
        ModuleSettings {
            kind,
            firmware: tmp.path().join("app.hex"),
            log_path: tmp.path().join(kind.log_file_name()),
            serial_dump: true,
            serial_forward: false,
            gpio_tracer: true,
            logger: ExperimentLogger::detached("node01", "42"),
        }
    }

    #[test]
    fn unconfigured_kind_is_unsupported() {
        let tmp = TempDir::new().unwrap();
        let provider = CommandDriverProvider::new(BTreeMap::new());
        assert!(!provider.supports(ModuleKind::Sky));
        let err = provider.create(settings(&tmp, ModuleKind::Sky)).err().expect("expected an error");
        assert!(matches!(err, ExperimentError::UnsupportedModuleKind(_)));
    }

    #[test]
    fn steps_substitute_placeholders_and_append_output_to_log() {
        let tmp = TempDir::new().unwrap();
        let mut commands = BTreeMap::new();
        commands.insert(
            ModuleKind::Nrf52,
            CommandSet {
                prepare: vec![],
                start: sh("echo flash {kind} {firmware}; echo trace=$TESTBED_GPIO_TRACER"),
                stop: sh("echo erased"),
            },
        );
        let provider = CommandDriverProvider::new(commands);
        let mut driver = provider.create(settings(&tmp, ModuleKind::Nrf52)).unwrap();

        driver.prepare().unwrap();
        driver.start().unwrap();
        driver.stop().unwrap();

        let log = fs::read_to_string(tmp.path().join("nrf52.log")).unwrap();
        let firmware = tmp.path().join("app.hex");
        assert!(log.contains(&format!("flash NRF52 {}", firmware.display())));
        assert!(log.contains("trace=1"));
        assert!(log.trim_end().ends_with("erased"));
    }

    #[test]
    fn failing_command_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let mut commands = BTreeMap::new();
        commands.insert(
            ModuleKind::Zoul,
            CommandSet {
                start: sh("echo no device >&2; exit 3"),
                ..Default::default()
            },
        );
        let mut driver = CommandDriverProvider::new(commands)
            .create(settings(&tmp, ModuleKind::Zoul))
            .unwrap();

        let err = driver.start().unwrap_err();
        assert!(err.to_string().contains("exited with"));
        let log = fs::read_to_string(tmp.path().join("zoul.log")).unwrap();
        assert!(log.contains("no device"));
    }

    #[test]
    fn missing_program_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let mut commands = BTreeMap::new();
        commands.insert(
            ModuleKind::Sky,
            CommandSet {
                stop: vec!["/nonexistent/tos-bsl".into()],
                ..Default::default()
            },
        );
        let mut driver = CommandDriverProvider::new(commands)
            .create(settings(&tmp, ModuleKind::Sky))
            .unwrap();
        assert!(driver.stop().is_err());
    }
}
