/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use testbed_node::config::NodeConfig;
use testbed_node::descriptor::ExperimentDescriptor;
use testbed_node::firmware::LocalFirmwareSource;
use testbed_node::gpio::CommandGpioTracer;
use testbed_node::logs::LocalLogTransfer;
use testbed_node::module::command::CommandDriverProvider;
use testbed_node::orchestrator::Collaborators;
use testbed_node::registry::ExperimentRegistry;

/// How long shutdown waits for stopped experiments to finish their tail.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

// ── CLI argument definition ───────────────────────────────────────────────────

/// Testbed node: runs experiment timelines on the locally attached modules.
///
/// Control messages are read from stdin, one JSON descriptor per line.
///
/// Example:
///   testbed-node -c node.yaml < control.ndjson
#[derive(Debug, Parser)]
#[command(
    name = "testbed-node",
    about = "Testbed node – experiment scheduling and module lifecycle",
    long_about = None,
)]
struct Cli {
    /// Path to the YAML node configuration file.
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    /// Override `node.id` from the configuration.
    #[arg(short = 'n', long = "node-id")]
    node_id: Option<String>,

    /// Override `node.working_directory` from the configuration.
    #[arg(short = 'w', long = "working-directory")]
    working_directory: Option<PathBuf>,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // Level is controlled by the RUST_LOG env-var (e.g. RUST_LOG=debug).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // ── Load node configuration ───────────────────────────────────────────────
    let mut config = match NodeConfig::load_from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load node configuration: {:#}", e);
            process::exit(1);
        }
    };
    if let Some(id) = cli.node_id {
        config.node.id = id;
    }
    if let Some(wd) = cli.working_directory {
        config.node.working_directory = wd;
    }

    info!(
        node              = %config.node.id,
        host              = %config.node.host_name,
        working_directory = %config.node.working_directory.display(),
        modules           = ?config.modules.keys().collect::<Vec<_>>(),
        gpio_tracer       = config.gpio_tracer.is_some(),
        "Testbed node starting up"
    );

    let registry = Arc::new(build_registry(config));

    // ── Control loop ──────────────────────────────────────────────────────────
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => handle_line(&registry, &line).await,
                Ok(None) => {
                    info!("Control stream closed");
                    break;
                }
                Err(e) => {
                    error!("Failed to read control stream: {e}");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received");
                break;
            }
        }
    }

    // ── Shutdown ──────────────────────────────────────────────────────────────
    let reg = Arc::clone(&registry);
    let drained = tokio::task::spawn_blocking(move || {
        reg.stop_all();
        reg.wait_idle(SHUTDOWN_TIMEOUT)
    })
    .await
    .unwrap_or(false);

    if !drained {
        warn!(still_running = ?registry.active_ids(), "Shutdown timed out");
        process::exit(1);
    }
    info!("Testbed node stopped");
}

fn build_registry(config: NodeConfig) -> ExperimentRegistry {
    let node = config.node;
    let collaborators = Collaborators {
        firmware: Arc::new(LocalFirmwareSource::new(
            node.working_directory.clone(),
            node.firmware_store.clone(),
        )),
        logs: Arc::new(LocalLogTransfer::new(
            node.working_directory.clone(),
            node.host_name.clone(),
            node.id.clone(),
        )),
        gpio: Arc::new(CommandGpioTracer::new(config.gpio_tracer)),
        drivers: Arc::new(CommandDriverProvider::new(config.modules)),
    };
    ExperimentRegistry::new(node, config.timeline, collaborators)
}

async fn handle_line(registry: &Arc<ExperimentRegistry>, line: &str) {
    let descriptor = match ExperimentDescriptor::from_json(line) {
        Ok(d) => d,
        Err(e) => {
            warn!("Rejected control message: {e}");
            return;
        }
    };

    let (id, action) = (descriptor.experiment_id.clone(), descriptor.action);
    info!(experiment = %id, ?action, name = %descriptor.name, "Control message received");

    // Registry calls may block (early-stop tails run inline).
    let reg = Arc::clone(registry);
    match tokio::task::spawn_blocking(move || reg.dispatch(descriptor)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(experiment = %id, ?action, "Control message failed: {e:#}"),
        Err(e) => error!(experiment = %id, "Dispatch task panicked: {e}"),
    }
}
