/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Experiment descriptor value types.
//!
//! A control message arrives as JSON and is decoded once into an immutable
//! [`ExperimentDescriptor`]:
//!
//! ```text
//! control message ──(serde_json)──►  Wire*  ──(validate)──►  ExperimentDescriptor
//!                                      ↑ private                 ↑ typed, immutable
//!                                      raw field shapes          closed ModuleKind set
//! ```
//!
//! The wire shape is
//!
//! ```text
//! { name, experimentId, start: [Y,M,D,H,Mi,S], end: [Y,M,D,H,Mi,S],
//!   nodes: [ { id, modules: [ { id: NRF52|ZOUL|SKY, firmware,
//!              serialDump, serialForward, gpioTracer } ] } ],
//!   action: START|STOP|CANCEL }
//! ```
//!
//! Time arrays are interpreted in node-local time.  Trailing elements may be
//! omitted (`[Y,M,D,H,Mi]` is what the server emits when seconds are zero);
//! a seventh element is a nanosecond fraction.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Local, NaiveDate, TimeZone};
use serde::Deserialize;

use crate::orchestrator::ExperimentError;

// ── Module kind ───────────────────────────────────────────────────────────────

/// The closed set of hardware module variants a testbed node can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModuleKind {
    Nrf52,
    Zoul,
    Sky,
}

impl ModuleKind {
    pub const ALL: [ModuleKind; 3] = [ModuleKind::Nrf52, ModuleKind::Zoul, ModuleKind::Sky];

    /// Identifier used on the wire and in configuration files.
    pub fn as_str(self) -> &'static str {
        match self {
            ModuleKind::Nrf52 => "NRF52",
            ModuleKind::Zoul => "ZOUL",
            ModuleKind::Sky => "SKY",
        }
    }

    /// Name of the per-module serial log file.
    pub fn log_file_name(self) -> &'static str {
        match self {
            ModuleKind::Nrf52 => "nrf52.log",
            ModuleKind::Zoul => "zoul.log",
            ModuleKind::Sky => "sky.log",
        }
    }
}

impl std::fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModuleKind {
    type Err = ExperimentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NRF52" => Ok(ModuleKind::Nrf52),
            "ZOUL" => Ok(ModuleKind::Zoul),
            "SKY" => Ok(ModuleKind::Sky),
            other => Err(ExperimentError::UnsupportedModuleKind(other.to_string())),
        }
    }
}

// ── Action ────────────────────────────────────────────────────────────────────

/// What the control message asks the node to do with the experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExperimentAction {
    Start,
    Stop,
    Cancel,
}

// ── Descriptors ───────────────────────────────────────────────────────────────

/// One requested module on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentModuleDescriptor {
    pub kind: ModuleKind,
    /// Firmware artifact file name (never empty).
    pub firmware: String,
    /// Keep the serial log with the experiment logs (otherwise it goes to the
    /// scratch area and is not retrieved).
    pub serial_dump: bool,
    pub serial_forward: bool,
    pub gpio_tracer: bool,
}

/// Module assignment for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentNodeDescriptor {
    pub id: String,
    pub modules: Vec<ExperimentModuleDescriptor>,
}

/// One experiment run, as decoded from a control message.
///
/// `end >= start` is the caller's responsibility and is not checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentDescriptor {
    pub name: String,
    pub experiment_id: String,
    pub start: DateTime<Local>,
    pub end: DateTime<Local>,
    pub nodes: Vec<ExperimentNodeDescriptor>,
    pub action: ExperimentAction,
}

impl ExperimentDescriptor {
    /// Decode and validate a JSON control message.
    ///
    /// # Errors
    /// * [`ExperimentError::UnsupportedModuleKind`] for a module `id` outside
    ///   the known set.
    /// * [`ExperimentError::InvalidDescriptor`] for malformed JSON, invalid
    ///   dates, empty firmware names or duplicate node ids.
    pub fn from_json(json: &str) -> Result<Self, ExperimentError> {
        let wire: WireExperiment = serde_json::from_str(json)
            .map_err(|e| ExperimentError::InvalidDescriptor(e.to_string()))?;
        Self::try_from(wire)
    }

    /// Modules assigned to `node_id`; empty when the node takes no part.
    pub fn modules_for(&self, node_id: &str) -> &[ExperimentModuleDescriptor] {
        self.nodes
            .iter()
            .find(|n| n.id == node_id)
            .map(|n| n.modules.as_slice())
            .unwrap_or(&[])
    }

    /// `true` if any module on `node_id` asks for GPIO tracing.
    pub fn gpio_tracing_requested(&self, node_id: &str) -> bool {
        self.modules_for(node_id).iter().any(|m| m.gpio_tracer)
    }
}

// ── Private wire types ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireExperiment {
    name: String,
    experiment_id: WireId,
    start: Vec<i64>,
    end: Vec<i64>,
    #[serde(default)]
    nodes: Vec<WireNode>,
    action: ExperimentAction,
}

/// The server encodes ids as numbers; older tooling sends strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireId {
    Number(u64),
    Text(String),
}

impl WireId {
    fn into_string(self) -> String {
        match self {
            WireId::Number(n) => n.to_string(),
            WireId::Text(s) => s,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireNode {
    id: String,
    #[serde(default)]
    modules: Vec<WireModule>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireModule {
    id: String,
    firmware: String,
    #[serde(default)]
    serial_dump: bool,
    #[serde(default)]
    serial_forward: bool,
    #[serde(default)]
    gpio_tracer: bool,
}

impl TryFrom<WireExperiment> for ExperimentDescriptor {
    type Error = ExperimentError;

    fn try_from(wire: WireExperiment) -> Result<Self, Self::Error> {
        let experiment_id = wire.experiment_id.into_string();
        path_component(&experiment_id, "experimentId")?;

        let mut seen = HashSet::new();
        let mut nodes = Vec::with_capacity(wire.nodes.len());
        for node in wire.nodes {
            if !seen.insert(node.id.clone()) {
                return Err(ExperimentError::InvalidDescriptor(format!(
                    "node '{}' listed twice",
                    node.id
                )));
            }
            let modules = node
                .modules
                .into_iter()
                .map(ExperimentModuleDescriptor::try_from)
                .collect::<Result<Vec<_>, _>>()?;
            nodes.push(ExperimentNodeDescriptor {
                id: node.id,
                modules,
            });
        }

        Ok(ExperimentDescriptor {
            name: wire.name,
            experiment_id,
            start: local_time_from_parts(&wire.start, "start")?,
            end: local_time_from_parts(&wire.end, "end")?,
            nodes,
            action: wire.action,
        })
    }
}

impl TryFrom<WireModule> for ExperimentModuleDescriptor {
    type Error = ExperimentError;

    fn try_from(wire: WireModule) -> Result<Self, Self::Error> {
        let kind = wire.id.parse::<ModuleKind>()?;
        if wire.firmware.trim().is_empty() {
            return Err(ExperimentError::InvalidDescriptor(format!(
                "{kind} module has an empty firmware name"
            )));
        }
        path_component(&wire.firmware, "firmware")?;
        Ok(ExperimentModuleDescriptor {
            kind,
            firmware: wire.firmware,
            serial_dump: wire.serial_dump,
            serial_forward: wire.serial_forward,
            gpio_tracer: wire.gpio_tracer,
        })
    }
}

/// Experiment ids and firmware names are joined onto node directories, so
/// each must stay a single relative path component.
fn path_component(value: &str, field: &str) -> Result<(), ExperimentError> {
    let escapes = value.is_empty()
        || value == "."
        || value == ".."
        || value.contains(|c: char| c == '/' || c == '\\' || c == '\0')
        || Path::new(value).is_absolute();
    if escapes {
        return Err(ExperimentError::InvalidDescriptor(format!(
            "{field} '{value}' is not a plain file name"
        )));
    }
    Ok(())
}

/// Convert `[Y, M, D, (H), (Mi), (S), (ns)]` into a local timestamp.
fn local_time_from_parts(parts: &[i64], field: &str) -> Result<DateTime<Local>, ExperimentError> {
    let invalid = || {
        ExperimentError::InvalidDescriptor(format!("'{field}' is not a valid date: {parts:?}"))
    };

    if !(3..=7).contains(&parts.len()) {
        return Err(invalid());
    }
    let part = |i: usize| parts.get(i).copied().unwrap_or(0);
    let to_u32 = |v: i64| u32::try_from(v).map_err(|_| invalid());

    let year = i32::try_from(part(0)).map_err(|_| invalid())?;
    let naive = NaiveDate::from_ymd_opt(year, to_u32(part(1))?, to_u32(part(2))?)
        .and_then(|d| {
            d.and_hms_nano_opt(
                to_u32(part(3)).ok()?,
                to_u32(part(4)).ok()?,
                to_u32(part(5)).ok()?,
                to_u32(part(6)).ok()?,
            )
        })
        .ok_or_else(invalid)?;

    // `earliest` resolves the ambiguous hour at a DST fall-back; a time inside
    // a spring-forward gap has no local representation.
    Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(invalid)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    const SAMPLE: &str = r#"{
        "name": "rpl-trickle",
        "experimentId": 42,
        "start": [2026, 3, 14, 10, 0, 0],
        "end": [2026, 3, 14, 10, 30],
        "nodes": [
            { "id": "node01", "modules": [
                { "id": "NRF52", "firmware": "sink.hex", "serialDump": true,
                  "serialForward": false, "gpioTracer": true },
                { "id": "SKY", "firmware": "relay.ihex", "serialDump": false,
                  "serialForward": true, "gpioTracer": false }
            ] },
            { "id": "node02", "modules": [
                { "id": "ZOUL", "firmware": "source.bin", "serialDump": true,
                  "serialForward": false, "gpioTracer": false }
            ] }
        ],
        "action": "START"
    }"#;

    #[test]
    fn decodes_full_descriptor() {
        let d = ExperimentDescriptor::from_json(SAMPLE).unwrap();
        assert_eq!(d.name, "rpl-trickle");
        assert_eq!(d.experiment_id, "42");
        assert_eq!(d.action, ExperimentAction::Start);
        assert_eq!(d.nodes.len(), 2);

        assert_eq!((d.start.year(), d.start.month(), d.start.day()), (2026, 3, 14));
        assert_eq!((d.start.hour(), d.start.minute()), (10, 0));
        // seconds omitted on the wire
        assert_eq!((d.end.minute(), d.end.second()), (30, 0));

        let m = &d.modules_for("node01")[0];
        assert_eq!(m.kind, ModuleKind::Nrf52);
        assert_eq!(m.firmware, "sink.hex");
        assert!(m.serial_dump && m.gpio_tracer && !m.serial_forward);
    }

    #[test]
    fn string_experiment_id_is_accepted() {
        let json = SAMPLE.replace("\"experimentId\": 42", "\"experimentId\": \"exp-7\"");
        let d = ExperimentDescriptor::from_json(&json).unwrap();
        assert_eq!(d.experiment_id, "exp-7");
    }

    #[test]
    fn modules_for_unknown_node_is_empty() {
        let d = ExperimentDescriptor::from_json(SAMPLE).unwrap();
        assert!(d.modules_for("node99").is_empty());
        assert!(!d.gpio_tracing_requested("node99"));
    }

    #[test]
    fn gpio_tracing_is_per_node() {
        let d = ExperimentDescriptor::from_json(SAMPLE).unwrap();
        assert!(d.gpio_tracing_requested("node01"));
        assert!(!d.gpio_tracing_requested("node02"));
    }

    #[test]
    fn unknown_module_kind_is_rejected() {
        let json = SAMPLE.replace("\"ZOUL\"", "\"TELOSB\"");
        let err = ExperimentDescriptor::from_json(&json).unwrap_err();
        assert!(matches!(err, ExperimentError::UnsupportedModuleKind(k) if k == "TELOSB"));
    }

    #[test]
    fn actions_decode_from_uppercase() {
        for (raw, want) in [
            ("STOP", ExperimentAction::Stop),
            ("CANCEL", ExperimentAction::Cancel),
        ] {
            let json = SAMPLE.replace("\"START\"", &format!("\"{raw}\""));
            assert_eq!(ExperimentDescriptor::from_json(&json).unwrap().action, want);
        }
    }

    #[test]
    fn empty_firmware_name_is_rejected() {
        let json = SAMPLE.replace("\"source.bin\"", "\"  \"");
        let err = ExperimentDescriptor::from_json(&json).unwrap_err();
        assert!(matches!(err, ExperimentError::InvalidDescriptor(_)));
    }

    #[test]
    fn duplicate_node_ids_are_rejected() {
        let json = SAMPLE.replace("\"node02\"", "\"node01\"");
        let err = ExperimentDescriptor::from_json(&json).unwrap_err();
        assert!(matches!(err, ExperimentError::InvalidDescriptor(msg) if msg.contains("twice")));
    }

    #[test]
    fn experiment_id_must_stay_inside_the_working_directory() {
        for id in ["", ".", "..", "../escaped", "/abs", "a/b", "a\\\\b"] {
            let json = SAMPLE.replace("\"experimentId\": 42", &format!("\"experimentId\": \"{id}\""));
            let err = ExperimentDescriptor::from_json(&json).unwrap_err();
            assert!(
                matches!(err, ExperimentError::InvalidDescriptor(ref m) if m.contains("experimentId")),
                "accepted experimentId {id:?}: {err}"
            );
        }
    }

    #[test]
    fn firmware_must_be_a_plain_file_name() {
        for fw in [".", "..", "../sink.hex", "/etc/hostname", "sub/sink.hex", "sub\\\\sink.hex"] {
            let json = SAMPLE.replace("\"sink.hex\"", &format!("\"{fw}\""));
            let err = ExperimentDescriptor::from_json(&json).unwrap_err();
            assert!(
                matches!(err, ExperimentError::InvalidDescriptor(ref m) if m.contains("firmware")),
                "accepted firmware {fw:?}: {err}"
            );
        }
    }

    #[test]
    fn invalid_date_is_rejected() {
        let json = SAMPLE.replace("[2026, 3, 14, 10, 0, 0]", "[2026, 13, 1, 0, 0, 0]");
        assert!(ExperimentDescriptor::from_json(&json).is_err());

        let json = SAMPLE.replace("[2026, 3, 14, 10, 0, 0]", "[2026, 3]");
        assert!(ExperimentDescriptor::from_json(&json).is_err());
    }

    #[test]
    fn module_kind_round_trips_through_its_wire_name() {
        for kind in ModuleKind::ALL {
            assert_eq!(kind.as_str().parse::<ModuleKind>().unwrap(), kind);
        }
        assert_eq!(ModuleKind::Zoul.log_file_name(), "zoul.log");
    }
}
