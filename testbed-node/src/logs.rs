/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Experiment log sinks and log retrieval.
//!
//! * [`ExperimentLogger`]: per-experiment `node.log`, mirrored to `tracing`.
//! * [`LogTransfer`]: the collaborator that prepares the log directory and
//!   announces that logs are ready to be collected.
//! * [`LocalLogTransfer`]: writes the announcement into an outbox directory
//!   that the message-bus relay picks up.

use std::fmt::Display;
use std::fs::{self, File};
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Local;
use serde::Serialize;
use tracing::{debug, error, info, warn, Level};

use crate::orchestrator::ExperimentError;

// ── ExperimentLogger ──────────────────────────────────────────────────────────

/// Cheap-to-clone handle on one experiment's log sink.
///
/// Lines look like
/// `10:00:03.120 [INFO] [node01] [Experiment 42] Got firmware 'sink.hex'`.
/// After [`teardown`](Self::teardown) the file is closed and further lines
/// only reach `tracing`.
#[derive(Clone)]
pub struct ExperimentLogger {
    inner: Arc<LoggerInner>,
}

struct LoggerInner {
    node_id: String,
    experiment_id: String,
    sink: Mutex<Option<LineWriter<File>>>,
    write_failed: AtomicBool,
}

impl ExperimentLogger {
    /// Create (truncate) the log file at `path`.
    pub fn create(
        path: &Path,
        node_id: impl Into<String>,
        experiment_id: impl Into<String>,
    ) -> Result<Self, ExperimentError> {
        let file = File::create(path).map_err(|e| ExperimentError::io(path, e))?;
        Ok(Self::with_sink(node_id, experiment_id, Some(LineWriter::new(file))))
    }

    /// A logger without a file; lines only go to `tracing`.
    pub fn detached(node_id: impl Into<String>, experiment_id: impl Into<String>) -> Self {
        Self::with_sink(node_id, experiment_id, None)
    }

    fn with_sink(
        node_id: impl Into<String>,
        experiment_id: impl Into<String>,
        sink: Option<LineWriter<File>>,
    ) -> Self {
        Self {
            inner: Arc::new(LoggerInner {
                node_id: node_id.into(),
                experiment_id: experiment_id.into(),
                sink: Mutex::new(sink),
                write_failed: AtomicBool::new(false),
            }),
        }
    }

    pub fn experiment_id(&self) -> &str {
        &self.inner.experiment_id
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn info(&self, msg: impl Display) {
        self.emit(Level::INFO, msg);
    }

    pub fn warn(&self, msg: impl Display) {
        self.emit(Level::WARN, msg);
    }

    pub fn error(&self, msg: impl Display) {
        self.emit(Level::ERROR, msg);
    }

    /// `true` until [`teardown`](Self::teardown) has closed the file.
    pub fn is_open(&self) -> bool {
        self.lock_sink().is_some()
    }

    /// `true` once a line could not be written to the log file.
    pub fn write_failed(&self) -> bool {
        self.inner.write_failed.load(Ordering::Relaxed)
    }

    /// Flush and close the log file.  Idempotent.
    pub fn teardown(&self) {
        if let Some(mut sink) = self.lock_sink().take() {
            if let Err(e) = sink.flush() {
                warn!(experiment = %self.inner.experiment_id, "failed to flush experiment log: {e}");
            }
            debug!(experiment = %self.inner.experiment_id, "experiment log closed");
        }
    }

    fn emit(&self, level: Level, msg: impl Display) {
        let id = &self.inner.experiment_id;
        if level == Level::ERROR {
            error!(experiment = %id, "{msg}");
        } else if level == Level::WARN {
            warn!(experiment = %id, "{msg}");
        } else {
            info!(experiment = %id, "{msg}");
        }

        if let Some(sink) = self.lock_sink().as_mut() {
            let line = format!(
                "{} [{}] [{}] [Experiment {}] {}\n",
                Local::now().format("%H:%M:%S%.3f"),
                level,
                self.inner.node_id,
                id,
                msg
            );
            // A full disk must not take the timeline down with it.
            if let Err(e) = sink.write_all(line.as_bytes()) {
                if !self.inner.write_failed.swap(true, Ordering::Relaxed) {
                    warn!(
                        experiment = %id,
                        "cannot write experiment log, later write errors are not reported: {e}"
                    );
                }
            }
        }
    }

    fn lock_sink(&self) -> std::sync::MutexGuard<'_, Option<LineWriter<File>>> {
        self.inner.sink.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ExperimentLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentLogger")
            .field("node_id", &self.inner.node_id)
            .field("experiment_id", &self.inner.experiment_id)
            .field("open", &self.is_open())
            .finish()
    }
}

// ── LogTransfer collaborator ──────────────────────────────────────────────────

/// Prepares log storage and announces finished logs for collection.
pub trait LogTransfer: Send + Sync {
    /// Create the experiment's log directory and return its path.
    fn create_logging_directory(&self, experiment_id: &str) -> Result<PathBuf, ExperimentError>;

    /// Announce that the experiment's logs can be collected.
    fn initiate_log_retrieval(&self, experiment_id: &str) -> Result<(), ExperimentError>;
}

/// Log retrieval announcement, as consumed by the testbed server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRetrievalMessage {
    pub experiment_id: String,
    pub host_name: String,
    pub user_name: String,
    /// Glob the server copies from, e.g. `/var/lib/testbed/42/logs/*`.
    pub target_path: String,
    pub node_id: String,
}

/// `<working_dir>/<experiment_id>/logs`
pub fn log_directory(working_directory: &Path, experiment_id: &str) -> PathBuf {
    working_directory.join(experiment_id).join("logs")
}

/// Filesystem-backed [`LogTransfer`].
///
/// Announcements are written as one JSON file per experiment into
/// `<working_dir>/outbox/`; the file appears atomically (write + rename).
#[derive(Debug, Clone)]
pub struct LocalLogTransfer {
    working_directory: PathBuf,
    host_name: String,
    user_name: String,
    node_id: String,
}

impl LocalLogTransfer {
    pub fn new(
        working_directory: impl Into<PathBuf>,
        host_name: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            working_directory: working_directory.into(),
            host_name: host_name.into(),
            user_name: std::env::var("USER").unwrap_or_else(|_| String::from("testbed")),
            node_id: node_id.into(),
        }
    }

    pub fn outbox(&self) -> PathBuf {
        self.working_directory.join("outbox")
    }

    /// Build the message [`initiate_log_retrieval`](LogTransfer::initiate_log_retrieval) sends.
    pub fn retrieval_message(&self, experiment_id: &str) -> LogRetrievalMessage {
        let target = log_directory(&self.working_directory, experiment_id).join("*");
        LogRetrievalMessage {
            experiment_id: experiment_id.to_string(),
            host_name: self.host_name.clone(),
            user_name: self.user_name.clone(),
            target_path: target.to_string_lossy().into_owned(),
            node_id: self.node_id.clone(),
        }
    }
}

impl LogTransfer for LocalLogTransfer {
    fn create_logging_directory(&self, experiment_id: &str) -> Result<PathBuf, ExperimentError> {
        let dir = log_directory(&self.working_directory, experiment_id);
        fs::create_dir_all(&dir).map_err(|e| ExperimentError::io(&dir, e))?;
        Ok(dir)
    }

    fn initiate_log_retrieval(&self, experiment_id: &str) -> Result<(), ExperimentError> {
        let outbox = self.outbox();
        fs::create_dir_all(&outbox).map_err(|e| ExperimentError::io(&outbox, e))?;

        let msg = self.retrieval_message(experiment_id);
        let body = serde_json::to_vec_pretty(&msg)
            .map_err(|e| ExperimentError::collaborator("log retrieval message encoding", e))?;

        let name = format!("log-retrieval-{}-{}.json", experiment_id, self.node_id);
        let tmp = outbox.join(format!(".{name}.tmp"));
        let dest = outbox.join(name);
        fs::write(&tmp, body).map_err(|e| ExperimentError::io(&tmp, e))?;
        fs::rename(&tmp, &dest).map_err(|e| ExperimentError::io(&dest, e))?;

        info!(
            experiment = %experiment_id,
            target     = %msg.target_path,
            outbox     = %dest.display(),
            "log retrieval announced"
        );
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn logger_writes_formatted_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node.log");
        let logger = ExperimentLogger::create(&path, "node01", "42").unwrap();

        logger.info("Waiting for firmware");
        logger.warn("late");
        logger.teardown();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("[INFO] [node01] [Experiment 42] Waiting for firmware"));
        assert!(lines[1].contains("[WARN]"));
    }

    #[test]
    fn logger_drops_lines_after_teardown() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("node.log");
        let logger = ExperimentLogger::create(&path, "node01", "42").unwrap();
        let clone = logger.clone();

        logger.info("before");
        clone.teardown();
        assert!(!logger.is_open());
        logger.info("after");
        logger.teardown(); // idempotent

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("before"));
        assert!(!text.contains("after"));
    }

    #[test]
    fn logger_create_in_missing_directory_fails() {
        let err = ExperimentLogger::create(Path::new("/nonexistent/dir/node.log"), "n", "1")
            .unwrap_err();
        assert!(matches!(err, ExperimentError::Io { .. }));
    }

    #[test]
    fn write_errors_are_recorded_not_raised() {
        let full = Path::new("/dev/full");
        if !full.exists() {
            return;
        }
        let logger = ExperimentLogger::create(full, "node01", "42").unwrap();
        assert!(!logger.write_failed());

        logger.info("no space");
        logger.info("still no space");
        assert!(logger.write_failed());
        assert!(logger.is_open());
    }

    #[test]
    fn detached_logger_is_never_open() {
        let logger = ExperimentLogger::detached("node01", "7");
        logger.info("only tracing");
        assert!(!logger.is_open());
        assert_eq!(logger.experiment_id(), "7");
    }

    #[test]
    fn creates_logging_directory_under_working_dir() {
        let wd = TempDir::new().unwrap();
        let transfer = LocalLogTransfer::new(wd.path(), "host-a", "node01");
        let dir = transfer.create_logging_directory("42").unwrap();
        assert_eq!(dir, wd.path().join("42").join("logs"));
        assert!(dir.is_dir());
        // second call is fine
        transfer.create_logging_directory("42").unwrap();
    }

    #[test]
    fn log_retrieval_writes_message_to_outbox() {
        let wd = TempDir::new().unwrap();
        let transfer = LocalLogTransfer::new(wd.path(), "host-a", "node01");
        transfer.initiate_log_retrieval("42").unwrap();

        let path = transfer.outbox().join("log-retrieval-42-node01.json");
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(json["experimentId"], "42");
        assert_eq!(json["hostName"], "host-a");
        assert_eq!(json["nodeId"], "node01");
        assert!(json["targetPath"].as_str().unwrap().ends_with("logs/*"));
        assert!(json["userName"].is_string());
    }
}
