/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Node-side front door for experiment descriptors.
//!
//! [`ExperimentRegistry`] keeps one [`ExperimentController`] per running
//! experiment.  `START` spawns a dedicated thread that owns the
//! orchestrator; `STOP` and `CANCEL` look the experiment up and forward the
//! request.  Entries are removed by the completion callback, whatever the
//! outcome.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::{NodeSettings, TimelineConfig};
use crate::descriptor::{ExperimentAction, ExperimentDescriptor};
use crate::orchestrator::{
    Collaborators, ExperimentController, ExperimentError, ExperimentOrchestrator,
    ExperimentOutcome,
};

#[derive(Default)]
struct Active {
    running: Mutex<HashMap<String, ExperimentController>>,
    idle: Condvar,
}

impl Active {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, ExperimentController>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, experiment_id: &str, outcome: &ExperimentOutcome) {
        let mut running = self.lock();
        running.remove(experiment_id);
        info!(
            experiment = %experiment_id,
            ?outcome,
            remaining  = running.len(),
            "experiment deregistered"
        );
        self.idle.notify_all();
    }
}

pub struct ExperimentRegistry {
    node: NodeSettings,
    timeline: TimelineConfig,
    collaborators: Collaborators,
    active: Arc<Active>,
}

impl ExperimentRegistry {
    pub fn new(node: NodeSettings, timeline: TimelineConfig, collaborators: Collaborators) -> Self {
        Self {
            node,
            timeline,
            collaborators,
            active: Arc::new(Active::default()),
        }
    }

    pub fn node(&self) -> &NodeSettings {
        &self.node
    }

    /// Route a descriptor by its action.
    pub fn dispatch(&self, descriptor: ExperimentDescriptor) -> Result<(), ExperimentError> {
        match descriptor.action {
            ExperimentAction::Start => self.start(descriptor),
            ExperimentAction::Stop => self.stop(&descriptor.experiment_id),
            ExperimentAction::Cancel => self.cancel(&descriptor.experiment_id),
        }
    }

    /// Build an orchestrator for `descriptor` and run it on its own thread.
    ///
    /// # Errors
    /// [`ExperimentError::AlreadyRunning`] for a duplicate id, construction
    /// errors from [`ExperimentOrchestrator::new`], or
    /// [`ExperimentError::Spawn`].
    pub fn start(&self, descriptor: ExperimentDescriptor) -> Result<(), ExperimentError> {
        let id = descriptor.experiment_id.clone();

        // Held until the controller is inserted, so the completion callback
        // can never run before the entry exists.
        let mut running = self.active.lock();
        if running.contains_key(&id) {
            return Err(ExperimentError::AlreadyRunning(id));
        }

        let modules = descriptor.modules_for(&self.node.id).len();
        let active = Arc::clone(&self.active);
        let done_id = id.clone();
        let orchestrator = ExperimentOrchestrator::new(
            &self.node,
            self.timeline,
            descriptor,
            self.collaborators.clone(),
            move |outcome| active.finish(&done_id, outcome),
        )?;
        let controller = orchestrator.controller();

        let thread_id = id.clone();
        thread::Builder::new()
            .name(format!("experiment-{id}"))
            .spawn(move || {
                if let Err(e) = orchestrator.run() {
                    error!(experiment = %thread_id, "experiment run failed: {e:#}");
                }
            })
            .map_err(ExperimentError::Spawn)?;

        info!(experiment = %id, node = %self.node.id, modules, "experiment registered");
        running.insert(id, controller);
        Ok(())
    }

    /// Stop an experiment and keep its logs.  Unknown ids are ignored.
    pub fn stop(&self, experiment_id: &str) -> Result<(), ExperimentError> {
        match self.controller(experiment_id) {
            Some(controller) => controller.stop(true),
            None => {
                warn!(experiment = %experiment_id, "STOP for unknown experiment ignored");
                Ok(())
            }
        }
    }

    /// Cancel an experiment and discard its results.  Unknown ids are ignored.
    pub fn cancel(&self, experiment_id: &str) -> Result<(), ExperimentError> {
        match self.controller(experiment_id) {
            Some(controller) => controller.cancel(),
            None => {
                warn!(experiment = %experiment_id, "CANCEL for unknown experiment ignored");
                Ok(())
            }
        }
    }

    /// Stop every running experiment (used on shutdown).
    pub fn stop_all(&self) {
        let controllers: Vec<ExperimentController> = self.active.lock().values().cloned().collect();
        for controller in controllers {
            if let Err(e) = controller.stop(true) {
                warn!(experiment = %controller.experiment_id(), "stop on shutdown failed: {e:#}");
            }
        }
    }

    /// Ids of the experiments currently registered, sorted.
    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Block until no experiment is registered or `timeout` passes.
    /// Returns `true` if the registry drained.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let running = self.active.lock();
        let (running, _) = self
            .active
            .idle
            .wait_timeout_while(running, timeout, |r| !r.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        running.is_empty()
    }

    fn controller(&self, experiment_id: &str) -> Option<ExperimentController> {
        // Clone out so the lock is not held while the controller works.
        self.active.lock().get(experiment_id).cloned()
    }
}
