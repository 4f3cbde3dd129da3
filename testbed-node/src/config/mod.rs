/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Node configuration loading.
//!
//! The expected YAML structure is:
//! ```yaml
//! node:
//!   id: node01
//!   working_directory: /var/lib/testbed
//!   scratch_directory: /tmp/testbed     # optional
//!   firmware_store: /srv/testbed/fw     # optional
//!   host_name: testbed-node01.lan       # optional, defaults to the id
//! timeline:                             # optional
//!   firmware_grace_secs: 30
//!   existence_poll_ms: 1000
//!   stability_poll_ms: 50
//! modules:
//!   NRF52:
//!     prepare: ["nrfjprog", "--recover"]
//!     start:   ["nrfjprog", "--program", "{firmware}", "--reset"]
//!     stop:    ["nrfjprog", "--eraseall"]
//! gpio_tracer:
//!   command: ["gpio-trace", "--out", "/var/lib/testbed/trace"]
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::descriptor::ModuleKind;

// ── Defaults ──────────────────────────────────────────────────────────────────

/// Minimum time the node waits for firmware, counted from `run()` when the
/// experiment start is already close or past.
pub const DEFAULT_FIRMWARE_GRACE_SECS: u64 = 30;

/// How often the readiness waiter looks for a missing artifact.
pub const DEFAULT_EXISTENCE_POLL_MS: u64 = 1_000;

/// How often the readiness waiter re-reads an artifact's size.
pub const DEFAULT_STABILITY_POLL_MS: u64 = 50;

/// Scratch area for serial logs that are not kept with the experiment.
pub const DEFAULT_SCRATCH_DIRECTORY: &str = "/tmp/testbed";

// ── Private YAML deserialization types ────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ConfigFile {
    node: NodeEntry,
    #[serde(default)]
    timeline: TimelineEntry,
    #[serde(default)]
    modules: HashMap<String, CommandSet>,
    gpio_tracer: Option<TracerEntry>,
}

#[derive(Debug, Deserialize)]
struct NodeEntry {
    id: String,
    working_directory: PathBuf,
    scratch_directory: Option<PathBuf>,
    firmware_store: Option<PathBuf>,
    host_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TimelineEntry {
    firmware_grace_secs: Option<u64>,
    existence_poll_ms: Option<u64>,
    stability_poll_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TracerEntry {
    command: Vec<String>,
}

// ── Public data structures ────────────────────────────────────────────────────

/// Identity and filesystem layout of this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSettings {
    pub id: String,
    pub host_name: String,
    /// Root of per-experiment directories (`<wd>/<experiment_id>/...`).
    pub working_directory: PathBuf,
    pub scratch_directory: PathBuf,
    /// Local mirror firmware is copied from, if the node has one.
    pub firmware_store: Option<PathBuf>,
}

impl NodeSettings {
    /// Settings with defaults for everything but the id and working directory.
    pub fn new(id: impl Into<String>, working_directory: impl Into<PathBuf>) -> Self {
        let id = id.into();
        Self {
            host_name: id.clone(),
            id,
            working_directory: working_directory.into(),
            scratch_directory: PathBuf::from(DEFAULT_SCRATCH_DIRECTORY),
            firmware_store: None,
        }
    }
}

/// Timing knobs of the experiment timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineConfig {
    /// Firmware deadline is `max(start - grace, now + grace)`.
    pub firmware_grace: Duration,
    pub existence_poll: Duration,
    pub stability_poll: Duration,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            firmware_grace: Duration::from_secs(DEFAULT_FIRMWARE_GRACE_SECS),
            existence_poll: Duration::from_millis(DEFAULT_EXISTENCE_POLL_MS),
            stability_poll: Duration::from_millis(DEFAULT_STABILITY_POLL_MS),
        }
    }
}

/// Commands a module kind runs for each lifecycle step.
///
/// Each entry is an argv; an empty argv means "nothing to do".  `{firmware}`,
/// `{log}` and `{kind}` are substituted before running.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CommandSet {
    #[serde(default)]
    pub prepare: Vec<String>,
    #[serde(default)]
    pub start: Vec<String>,
    #[serde(default)]
    pub stop: Vec<String>,
}

/// Fully-parsed node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node: NodeSettings,
    pub timeline: TimelineConfig,
    /// Driver commands per supported module kind.  Kinds missing here are
    /// not supported on this node.
    pub modules: BTreeMap<ModuleKind, CommandSet>,
    /// GPIO tracer argv, if the node has a tracer.
    pub gpio_tracer: Option<Vec<String>>,
}

impl NodeConfig {
    /// Parse `path` into a [`NodeConfig`].
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened, the YAML is
    /// structurally invalid, a module kind is unknown, or a timing value is
    /// zero.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        info!("Loading node configuration from: {}", path.display());

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot open configuration file: {}", path.display()))?;

        Self::from_yaml_str(&content)
            .with_context(|| format!("Invalid configuration file: {}", path.display()))
    }

    /// Parse a YAML document.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let file: ConfigFile =
            serde_yaml::from_str(content).context("Failed to parse YAML configuration")?;

        if file.node.id.trim().is_empty() {
            bail!("node.id must not be empty");
        }
        if file.node.working_directory.as_os_str().is_empty() {
            bail!("node.working_directory must not be empty");
        }

        let defaults = TimelineConfig::default();
        let timeline = TimelineConfig {
            firmware_grace: file
                .timeline
                .firmware_grace_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.firmware_grace),
            existence_poll: positive_ms(file.timeline.existence_poll_ms, "existence_poll_ms")?
                .unwrap_or(defaults.existence_poll),
            stability_poll: positive_ms(file.timeline.stability_poll_ms, "stability_poll_ms")?
                .unwrap_or(defaults.stability_poll),
        };

        let mut modules = BTreeMap::new();
        for (name, commands) in file.modules {
            let kind: ModuleKind = name
                .parse()
                .with_context(|| format!("Unknown module kind in configuration: '{name}'"))?;
            debug!(
                kind    = %kind,
                prepare = ?commands.prepare,
                start   = ?commands.start,
                stop    = ?commands.stop,
                "module driver configured"
            );
            modules.insert(kind, commands);
        }
        if modules.is_empty() {
            warn!("No module drivers configured, every START will fail to build its modules");
        }

        let gpio_tracer = match file.gpio_tracer {
            Some(t) if t.command.is_empty() => bail!("gpio_tracer.command must not be empty"),
            Some(t) => Some(t.command),
            None => None,
        };

        let node = NodeSettings {
            host_name: file.node.host_name.unwrap_or_else(|| file.node.id.clone()),
            id: file.node.id,
            working_directory: file.node.working_directory,
            scratch_directory: file
                .node
                .scratch_directory
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SCRATCH_DIRECTORY)),
            firmware_store: file.node.firmware_store,
        };

        info!(
            node       = %node.id,
            working_dir = %node.working_directory.display(),
            modules    = modules.len(),
            gpio_tracer = gpio_tracer.is_some(),
            "Successfully loaded node configuration"
        );

        Ok(Self {
            node,
            timeline,
            modules,
            gpio_tracer,
        })
    }
}

fn positive_ms(value: Option<u64>, field: &str) -> Result<Option<Duration>> {
    match value {
        Some(0) => bail!("timeline.{field} must be greater than zero"),
        Some(ms) => Ok(Some(Duration::from_millis(ms))),
        None => Ok(None),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Helper: write a YAML string to a temp file and return it.
    fn yaml_tempfile(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn load_full_yaml() {
        let yaml = r#"
node:
  id: node01
  working_directory: /var/lib/testbed
  scratch_directory: /tmp/scratch
  firmware_store: /srv/fw
  host_name: rpi-01
timeline:
  firmware_grace_secs: 45
  existence_poll_ms: 500
  stability_poll_ms: 20
modules:
  NRF52:
    start: ["flash", "{firmware}"]
    stop: ["erase"]
  SKY:
    start: ["tos-bsl", "{firmware}"]
gpio_tracer:
  command: ["gpio-trace"]
"#;
        let f = yaml_tempfile(yaml);
        let cfg = NodeConfig::load_from_file(f.path()).unwrap();

        assert_eq!(cfg.node.id, "node01");
        assert_eq!(cfg.node.host_name, "rpi-01");
        assert_eq!(cfg.node.working_directory, PathBuf::from("/var/lib/testbed"));
        assert_eq!(cfg.node.scratch_directory, PathBuf::from("/tmp/scratch"));
        assert_eq!(cfg.node.firmware_store, Some(PathBuf::from("/srv/fw")));

        assert_eq!(cfg.timeline.firmware_grace, Duration::from_secs(45));
        assert_eq!(cfg.timeline.existence_poll, Duration::from_millis(500));
        assert_eq!(cfg.timeline.stability_poll, Duration::from_millis(20));

        assert_eq!(cfg.modules.len(), 2);
        let nrf = &cfg.modules[&ModuleKind::Nrf52];
        assert_eq!(nrf.start, vec!["flash", "{firmware}"]);
        assert!(nrf.prepare.is_empty());
        assert!(!cfg.modules.contains_key(&ModuleKind::Zoul));

        assert_eq!(cfg.gpio_tracer, Some(vec!["gpio-trace".to_string()]));
    }

    #[test]
    fn optional_sections_use_defaults_when_absent() {
        let cfg = NodeConfig::from_yaml_str("node:\n  id: n1\n  working_directory: /wd\n").unwrap();
        assert_eq!(cfg.node.host_name, "n1");
        assert_eq!(cfg.node.scratch_directory, PathBuf::from(DEFAULT_SCRATCH_DIRECTORY));
        assert_eq!(cfg.timeline, TimelineConfig::default());
        assert_eq!(cfg.timeline.firmware_grace, Duration::from_secs(30));
        assert!(cfg.modules.is_empty());
        assert!(cfg.gpio_tracer.is_none());
    }

    #[test]
    fn unknown_module_kind_is_an_error() {
        let yaml = "node:\n  id: n1\n  working_directory: /wd\nmodules:\n  TELOSB: {}\n";
        let err = NodeConfig::from_yaml_str(yaml).unwrap_err();
        assert!(format!("{err:#}").contains("TELOSB"));
    }

    #[test]
    fn zero_poll_interval_is_an_error() {
        let yaml = "node:\n  id: n1\n  working_directory: /wd\ntimeline:\n  stability_poll_ms: 0\n";
        assert!(NodeConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn empty_node_id_is_an_error() {
        let yaml = "node:\n  id: \"\"\n  working_directory: /wd\n";
        assert!(NodeConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn missing_file_returns_error() {
        let result = NodeConfig::load_from_file(Path::new("/nonexistent/path/config.yaml"));
        assert!(result.is_err());
    }

    #[test]
    fn malformed_yaml_returns_error() {
        let f = yaml_tempfile("this is: not: valid: yaml: content:::");
        assert!(NodeConfig::load_from_file(f.path()).is_err());
    }

    #[test]
    fn node_settings_new_fills_defaults() {
        let s = NodeSettings::new("node07", "/wd");
        assert_eq!(s.host_name, "node07");
        assert_eq!(s.scratch_directory, PathBuf::from("/tmp/testbed"));
        assert!(s.firmware_store.is_none());
    }
}
