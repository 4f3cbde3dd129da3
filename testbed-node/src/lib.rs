/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Testbed node: experiment scheduling and module lifecycle orchestration.
//!
//! Module layout:
//!
//! ```text
//! lib.rs
//! ├── descriptor/     – experiment control messages (JSON)
//! ├── config/         – YAML node configuration
//! ├── scheduler/      – single-consumer timed event queue
//! ├── module/         – driver seam, lifecycle guard, factory, command driver
//! ├── firmware        – firmware retrieval + readiness waiter
//! ├── gpio            – GPIO tracer seam
//! ├── logs            – per-experiment log sink + log retrieval
//! ├── orchestrator/   – one experiment timeline, start to terminal outcome
//! └── registry        – running experiments by id (START / STOP / CANCEL)
//! ```

pub mod config;
pub mod descriptor;
pub mod firmware;
pub mod gpio;
pub mod logs;
pub mod module;
pub mod orchestrator;
pub mod registry;
pub mod scheduler;
