use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{ConfigError, Escalation};
use crate::events::EngineEventPayload;
use crate::job::{Job, JobId};
use crate::managed_object::{LifecycleState, ManagedObjectContainer};
use crate::process::{ProcessId, ProcessState};
use crate::team::RejectedJob;
use crate::telemetry;

use super::task::{ObjectSlot, TaskJob, TaskSpec};
use super::{EscalationHandler, OfficeShared};

/// Why a task could not be submitted.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The team refused the job; it is handed back for a later retry.
    #[error("{0}")]
    Rejected(RejectedJob),
}

/// A process: tasks sharing one set of managed objects.
///
/// Cloning yields another handle to the same process. Once the last job of
/// the process finishes, its managed objects are recycled.
#[derive(Clone)]
pub struct Process {
    inner: Arc<ProcessInner>,
}

struct ProcessInner {
    state: Arc<ProcessState>,
    office: Arc<OfficeShared>,
    containers: Mutex<Vec<Arc<ManagedObjectContainer>>>,
    active: AtomicUsize,
    escalations: AtomicU64,
    handler: Mutex<Option<Arc<dyn EscalationHandler>>>,
    idle: Notify,
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id())
            .field("active_jobs", &self.active_jobs())
            .field("managed_objects", &self.inner.containers.lock().len())
            .finish()
    }
}

impl Process {
    pub(crate) fn new(office: Arc<OfficeShared>) -> Self {
        Self {
            inner: Arc::new(ProcessInner {
                state: Arc::new(ProcessState::new()),
                office,
                containers: Mutex::new(Vec::new()),
                active: AtomicUsize::new(0),
                escalations: AtomicU64::new(0),
                handler: Mutex::new(None),
                idle: Notify::new(),
            }),
        }
    }

    pub fn id(&self) -> ProcessId {
        self.inner.state.id()
    }

    pub fn state(&self) -> &Arc<ProcessState> {
        &self.inner.state
    }

    /// Route this process's escalations to `handler` instead of the office's.
    pub fn set_escalation_handler(&self, handler: impl EscalationHandler) {
        *self.inner.handler.lock() = Some(Arc::new(handler));
    }

    /// Submit a task, assigning its job to the task's team.
    pub fn submit(&self, task: TaskSpec) -> Result<JobId, SubmitError> {
        let office = &self.inner.office;
        let team_name = match task.team() {
            Some(team) => team.to_string(),
            None => task
                .managed_objects()
                .iter()
                .find_map(|name| office.config.managed_object(name)?.team.clone())
                .ok_or_else(|| ConfigError::NoTeam(task.name().to_string()))?,
        };
        let team = office
            .teams
            .get(&team_name)
            .cloned()
            .ok_or(ConfigError::UnknownTeam(team_name))?;
        let order = office.config.dependency_order(task.managed_objects())?;
        let declared = task
            .managed_objects()
            .iter()
            .map(|name| {
                let slot = order.iter().position(|ordered| ordered == name);
                slot.map(|slot| (name.clone(), slot))
                    .ok_or_else(|| ConfigError::UnknownManagedObject(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let slots = {
            let mut containers = self.inner.containers.lock();
            let mut slots = Vec::with_capacity(order.len());
            for name in &order {
                let container = self.container_locked(&mut containers, name)?;
                let dependencies = container
                    .metadata()
                    .dependencies()
                    .iter()
                    .map(|dependency| {
                        order
                            .iter()
                            .position(|ordered| ordered == &dependency.managed_object)
                            .ok_or_else(|| ConfigError::UnknownDependency {
                                managed_object: name.clone(),
                                target: dependency.managed_object.clone(),
                            })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                slots.push(ObjectSlot {
                    container,
                    dependencies,
                });
            }
            // Counted under the container lock so recycling never races a submit.
            self.inner.active.fetch_add(1, Ordering::AcqRel);
            slots
        };

        let (name, _, affinity, body) = task.into_parts();
        let job = TaskJob::new(name, self.clone(), slots, declared, affinity, body);
        let job_id = job.id();

        self.emit(EngineEventPayload::JobAssigned {
            job_id,
            team: team.name().to_string(),
        });
        match team.assign_job(Box::new(job)) {
            Ok(()) => Ok(job_id),
            Err(rejected) => {
                telemetry::record_assignment_rejected(team.name(), rejected.reason.to_string());
                Err(SubmitError::Rejected(rejected))
            }
        }
    }

    /// Jobs submitted and not yet finished.
    pub fn active_jobs(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Escalations routed to this process's handler so far.
    pub fn escalations(&self) -> u64 {
        self.inner.escalations.load(Ordering::Relaxed)
    }

    /// Lifecycle state of a managed object in this process, if it exists.
    pub fn managed_object_state(&self, name: &str) -> Option<LifecycleState> {
        self.inner
            .containers
            .lock()
            .iter()
            .find(|container| container.name() == name)
            .map(|container| container.state())
    }

    /// The container of `name`, if a job of this process has used it.
    pub fn container(&self, name: &str) -> Option<Arc<ManagedObjectContainer>> {
        self.inner
            .containers
            .lock()
            .iter()
            .find(|container| container.name() == name)
            .cloned()
    }

    /// Wait until no job of the process is active.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.active_jobs() == 0 {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn emit(&self, payload: EngineEventPayload) {
        self.inner.office.events.emit(self.id(), payload);
    }

    pub(crate) fn escalate(&self, escalation: Escalation) {
        self.inner.escalations.fetch_add(1, Ordering::Relaxed);
        telemetry::record_job_escalated(escalation.job().to_string(), escalation.kind());
        self.emit(EngineEventPayload::JobEscalated {
            job_id: escalation.job(),
            kind: escalation.kind().to_string(),
        });
        let handler = self
            .inner
            .handler
            .lock()
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.inner.office.escalation));
        handler.handle_escalation(self.id(), escalation);
    }

    pub(crate) fn job_finished(&self) {
        if self.inner.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.recycle_if_idle();
            self.inner.idle.notify_waiters();
        }
    }

    fn recycle_if_idle(&self) {
        let containers = {
            let mut containers = self.inner.containers.lock();
            if self.active_jobs() != 0 {
                return;
            }
            std::mem::take(&mut *containers)
        };
        if containers.is_empty() {
            return;
        }
        tracing::debug!(process = %self.id(), managed_objects = containers.len(), "recycling process");
        // Dependents were created after their dependencies.
        for container in containers.iter().rev() {
            container.recycle();
        }
    }

    fn container_locked(
        &self,
        containers: &mut Vec<Arc<ManagedObjectContainer>>,
        name: &str,
    ) -> Result<Arc<ManagedObjectContainer>, ConfigError> {
        if let Some(container) = containers.iter().find(|container| container.name() == name) {
            return Ok(Arc::clone(container));
        }
        let office = &self.inner.office;
        let metadata = office
            .metadata
            .get(name)
            .ok_or_else(|| ConfigError::UnknownManagedObject(name.to_string()))?;
        let container = ManagedObjectContainer::new(
            Arc::clone(metadata),
            Arc::clone(&self.inner.state),
            office.manager.activator(),
            Arc::clone(&office.events),
        );
        office.manager.monitor(&container);
        containers.push(Arc::clone(&container));
        Ok(container)
    }
}
