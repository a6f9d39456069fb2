//! Engine assembly: teams, managed object sources and the office manager.
//!
//! An [`Office`] is built once from an [`OfficeConfig`]. Each unit of work
//! then runs in a [`Process`] created from it: tasks submitted to the process
//! become jobs on their team, wait for the managed objects they use, and
//! share those objects with every other task of the same process.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::OfficeConfig;
use crate::error::Escalation;
use crate::events::{EngineEvent, InProcEventBus};
use crate::managed_object::ManagedObjectMetaData;
use crate::manager::OfficeManager;
use crate::process::ProcessId;
use crate::team::Team;

mod builder;
mod process;
mod task;

pub use builder::OfficeBuilder;
pub use process::{Process, SubmitError};
pub use task::{TaskContext, TaskOutcome, TaskSpec};

/// Receives failures that jobs could not handle themselves.
pub trait EscalationHandler: Send + Sync + 'static {
    fn handle_escalation(&self, process: ProcessId, escalation: Escalation);
}

impl<F> EscalationHandler for F
where
    F: Fn(ProcessId, Escalation) + Send + Sync + 'static,
{
    fn handle_escalation(&self, process: ProcessId, escalation: Escalation) {
        self(process, escalation)
    }
}

/// Default handler: logs the escalation.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingEscalationHandler;

impl EscalationHandler for LoggingEscalationHandler {
    fn handle_escalation(&self, process: ProcessId, escalation: Escalation) {
        tracing::error!(
            process = %process,
            job_id = %escalation.job(),
            kind = escalation.kind(),
            error = %escalation,
            "unhandled escalation"
        );
    }
}

/// State shared by an office and its processes.
pub(crate) struct OfficeShared {
    pub(crate) config: OfficeConfig,
    pub(crate) teams: HashMap<String, Arc<dyn Team>>,
    pub(crate) metadata: HashMap<String, Arc<ManagedObjectMetaData>>,
    pub(crate) manager: OfficeManager,
    pub(crate) events: Arc<InProcEventBus>,
    pub(crate) escalation: Arc<dyn EscalationHandler>,
}

/// A running engine instance.
#[derive(Clone)]
pub struct Office {
    shared: Arc<OfficeShared>,
}

impl std::fmt::Debug for Office {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut teams: Vec<_> = self.shared.teams.keys().collect();
        teams.sort();
        let mut managed_objects: Vec<_> = self.shared.metadata.keys().collect();
        managed_objects.sort();
        f.debug_struct("Office")
            .field("name", &self.shared.config.name)
            .field("teams", &teams)
            .field("managed_objects", &managed_objects)
            .field("manager", &self.shared.manager)
            .finish()
    }
}

impl Office {
    pub fn builder(config: OfficeConfig) -> OfficeBuilder {
        OfficeBuilder::new(config)
    }

    pub(crate) fn from_shared(shared: OfficeShared) -> Self {
        Self {
            shared: Arc::new(shared),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn config(&self) -> &OfficeConfig {
        &self.shared.config
    }

    /// Start a new process with its own managed objects.
    pub fn create_process(&self) -> Process {
        let process = Process::new(Arc::clone(&self.shared));
        tracing::debug!(office = %self.name(), process = %process.id(), "process created");
        process
    }

    pub fn team(&self, name: &str) -> Option<Arc<dyn Team>> {
        self.shared.teams.get(name).cloned()
    }

    pub fn events(&self) -> Arc<InProcEventBus> {
        Arc::clone(&self.shared.events)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }

    pub fn manager(&self) -> &OfficeManager {
        &self.shared.manager
    }

    /// Stop every team, then the office manager.
    ///
    /// Jobs still queued on a team run before its workers exit; activations
    /// for stopped teams are escalated.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!(office = %self.name(), "Initiating office shutdown");
        let teams: Vec<_> = self.shared.teams.values().cloned().collect();
        tokio::task::spawn_blocking(move || {
            for team in teams {
                team.stop_working();
            }
        })
        .await?;
        self.shared.manager.shutdown().await?;
        tracing::info!(office = %self.name(), "Office shutdown complete");
        Ok(())
    }
}
