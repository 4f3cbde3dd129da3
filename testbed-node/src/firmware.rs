/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Firmware retrieval and readiness.
//!
//! Firmware is requested from the network layer up front
//! ([`FirmwareSource::retrieve_firmware`] only triggers the transfer).  The
//! [`ReadinessWaiter`] then blocks the timeline until every artifact
//! exists and its size has settled:
//!
//! ```text
//! missing ──(poll every existence_poll)──► present ──(re-read every stability_poll)──► stable
//!                                                     size(n) == size(n-1)
//! ```
//!
//! A file that exists is not necessarily complete, the transfer may still be
//! writing it.  Two consecutive reads returning the same size are taken as
//! "transfer finished".

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::config::TimelineConfig;
use crate::logs::ExperimentLogger;
use crate::orchestrator::ExperimentError;

// ── FirmwareSource collaborator ───────────────────────────────────────────────

/// Delivers firmware artifacts into the node's per-experiment firmware
/// directory.
pub trait FirmwareSource: Send + Sync {
    /// Trigger the transfer of `firmware` for `experiment_id`.  Returns as
    /// soon as the request is out; arrival is observed by the
    /// [`ReadinessWaiter`].
    fn retrieve_firmware(&self, experiment_id: &str, firmware: &str) -> anyhow::Result<()>;

    /// Directory the artifacts of `experiment_id` land in.
    fn local_firmware_dir(&self, experiment_id: &str) -> PathBuf;
}

/// `<working_dir>/<experiment_id>/firmware`
pub fn firmware_directory(working_directory: &Path, experiment_id: &str) -> PathBuf {
    working_directory.join(experiment_id).join("firmware")
}

/// Filesystem-backed [`FirmwareSource`].
///
/// With a `store`, artifacts are copied from `<store>/<experiment_id>/<name>`
/// (falling back to `<store>/<name>`) on a background thread.  Without one,
/// the request is only logged and an external transfer is expected to fill
/// the directory.
#[derive(Debug, Clone)]
pub struct LocalFirmwareSource {
    working_directory: PathBuf,
    store: Option<PathBuf>,
}

impl LocalFirmwareSource {
    pub fn new(working_directory: impl Into<PathBuf>, store: Option<PathBuf>) -> Self {
        Self {
            working_directory: working_directory.into(),
            store,
        }
    }
}

impl FirmwareSource for LocalFirmwareSource {
    fn retrieve_firmware(&self, experiment_id: &str, firmware: &str) -> anyhow::Result<()> {
        let dest_dir = self.local_firmware_dir(experiment_id);
        fs::create_dir_all(&dest_dir)
            .with_context(|| format!("cannot create firmware directory {}", dest_dir.display()))?;

        let Some(store) = &self.store else {
            info!(experiment = %experiment_id, firmware, "firmware requested, waiting for transfer");
            return Ok(());
        };

        let scoped = store.join(experiment_id).join(firmware);
        let src = if scoped.is_file() { scoped } else { store.join(firmware) };
        let dest = dest_dir.join(firmware);
        let partial = dest_dir.join(format!(".{firmware}.part"));
        let experiment = experiment_id.to_string();

        thread::Builder::new()
            .name(format!("fw-copy-{experiment_id}"))
            .spawn(move || {
                let copied = fs::copy(&src, &partial).and_then(|_| fs::rename(&partial, &dest));
                match copied {
                    Ok(()) => debug!(experiment = %experiment, src = %src.display(), "firmware copied"),
                    Err(e) => warn!(
                        experiment = %experiment,
                        src = %src.display(),
                        "firmware copy failed: {e}"
                    ),
                }
            })
            .context("cannot spawn firmware copy thread")?;
        Ok(())
    }

    fn local_firmware_dir(&self, experiment_id: &str) -> PathBuf {
        firmware_directory(&self.working_directory, experiment_id)
    }
}

// ── Probing ───────────────────────────────────────────────────────────────────

/// Reads the current size of an artifact; `None` while it does not exist.
pub trait ArtifactProbe: Send + Sync {
    fn size(&self, path: &Path) -> Option<u64>;
}

/// [`ArtifactProbe`] over the real filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsProbe;

impl ArtifactProbe for FsProbe {
    fn size(&self, path: &Path) -> Option<u64> {
        fs::metadata(path).ok().filter(|m| m.is_file()).map(|m| m.len())
    }
}

// ── ReadinessWaiter ───────────────────────────────────────────────────────────

/// How [`ReadinessWaiter::wait`] finished without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Every artifact is present and stable.
    Ready,
    /// The abort flag was raised while waiting.
    Aborted,
}

/// Blocks until firmware artifacts are present and stable, or a deadline
/// passes.
#[derive(Clone)]
pub struct ReadinessWaiter {
    existence_poll: Duration,
    stability_poll: Duration,
    probe: Arc<dyn ArtifactProbe>,
    abort: Arc<AtomicBool>,
}

impl ReadinessWaiter {
    pub fn new(timeline: &TimelineConfig) -> Self {
        Self {
            existence_poll: timeline.existence_poll,
            stability_poll: timeline.stability_poll,
            probe: Arc::new(FsProbe),
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn ArtifactProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Share an abort flag; raising it makes [`wait`](Self::wait) return
    /// [`Readiness::Aborted`] at its next poll.
    pub fn with_abort_flag(mut self, abort: Arc<AtomicBool>) -> Self {
        self.abort = abort;
        self
    }

    /// Wait for every path in `artifacts`, in order.
    ///
    /// Never reports a timeout before `deadline`, and never sleeps past it.
    ///
    /// # Errors
    /// [`ExperimentError::FirmwareTimeout`] listing the artifacts that were
    /// not ready when the deadline passed.
    pub fn wait(
        &self,
        experiment_id: &str,
        artifacts: &[PathBuf],
        deadline: Instant,
        logger: &ExperimentLogger,
    ) -> Result<Readiness, ExperimentError> {
        logger.info("Waiting for firmware");

        for (i, path) in artifacts.iter().enumerate() {
            let timeout = || ExperimentError::FirmwareTimeout {
                experiment_id: experiment_id.to_string(),
                missing: artifacts[i..].to_vec(),
            };

            // Phase 1: wait for the file to appear.
            let mut last = loop {
                if self.aborted() {
                    return Ok(Readiness::Aborted);
                }
                if let Some(size) = self.probe.size(path) {
                    break Some(size);
                }
                let now = Instant::now();
                if now >= deadline {
                    logger.error(format!("Failed to retrieve firmware '{}' in time", path.display()));
                    return Err(timeout());
                }
                thread::sleep(self.existence_poll.min(deadline - now));
            };

            // Phase 2: wait for two consecutive equal sizes.
            loop {
                if self.aborted() {
                    return Ok(Readiness::Aborted);
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                thread::sleep(self.stability_poll.min(remaining));

                let current = self.probe.size(path);
                if current.is_some() && current == last {
                    break;
                }
                if Instant::now() >= deadline {
                    logger.error(format!("Firmware '{}' still changing at deadline", path.display()));
                    return Err(timeout());
                }
                last = current;
            }

            let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
            logger.info(format!("Got firmware '{name}'"));
        }

        logger.info("All firmware received");
        Ok(Readiness::Ready)
    }

    fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ReadinessWaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessWaiter")
            .field("existence_poll", &self.existence_poll)
            .field("stability_poll", &self.stability_poll)
            .field("aborted", &self.aborted())
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
