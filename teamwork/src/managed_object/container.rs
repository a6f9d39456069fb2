use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::{DependencyConfig, ManagedObjectConfig};
use crate::error::{AsynchronousError, Defect, Escalation, ManagedObjectError};
use crate::events::{EngineEventPayload, InProcEventBus};
use crate::job::Job;
use crate::manager::Activator;
use crate::process::{ProcessId, ProcessState};
use crate::registry::ObjectRegistry;
use crate::team::{Team, panic_message};
use crate::telemetry;

use super::context::{AsynchronousContext, ManagedObjectContext};
use super::source::{ManagedObjectSource, ManagedObjectUser};
use super::{LifecycleState, ManagedObject, Object};

/// Static description of a managed object, shared by all processes.
pub struct ManagedObjectMetaData {
    name: String,
    team: Option<String>,
    dependencies: Vec<DependencyConfig>,
    timeout: Option<Duration>,
    source: Arc<dyn ManagedObjectSource>,
}

impl std::fmt::Debug for ManagedObjectMetaData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedObjectMetaData")
            .field("name", &self.name)
            .field("team", &self.team)
            .field("dependencies", &self.dependencies)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ManagedObjectMetaData {
    pub fn new(config: &ManagedObjectConfig, source: Arc<dyn ManagedObjectSource>) -> Self {
        Self {
            name: config.name.clone(),
            team: config.team.clone(),
            dependencies: config.dependencies.clone(),
            timeout: config.timeout(),
            source,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn team(&self) -> Option<&str> {
        self.team.as_deref()
    }

    pub fn dependencies(&self) -> &[DependencyConfig] {
        &self.dependencies
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// A suspended job and the team it resumes on.
pub struct ParkedJob {
    pub job: Box<dyn Job>,
    pub team: Arc<dyn Team>,
}

impl std::fmt::Debug for ParkedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParkedJob")
            .field("job", &self.job.id())
            .field("team", &self.team.name())
            .finish()
    }
}

/// Whether a job may read a managed object right now.
#[derive(Debug)]
pub enum Readiness {
    Ready,
    Pending(LifecycleState),
    Failed(ManagedObjectError),
}

#[derive(Clone, Debug)]
enum Failure {
    Source(Arc<anyhow::Error>),
    TimedOut {
        state: LifecycleState,
        timeout: Duration,
    },
    Defect(Defect),
}

impl Failure {
    fn to_error(&self, managed_object: &str) -> ManagedObjectError {
        match self {
            Failure::Source(source) => ManagedObjectError::SourceFailed {
                managed_object: managed_object.to_string(),
                source: anyhow::anyhow!("{source:#}"),
            },
            Failure::TimedOut { state, timeout } => ManagedObjectError::TimedOut {
                managed_object: managed_object.to_string(),
                state: *state,
                timeout: *timeout,
            },
            Failure::Defect(defect) => ManagedObjectError::Defect(defect.clone()),
        }
    }
}

struct ContainerState {
    lifecycle: LifecycleState,
    sourcing: bool,
    managed_object: Option<Arc<dyn ManagedObject>>,
    registry: Option<ObjectRegistry>,
    failure: Option<Failure>,
    pending_since: Option<Instant>,
    parked: Vec<ParkedJob>,
}

/// Per-process holder of one managed object's lifecycle.
///
/// Lifecycle changes made on behalf of the resource (sourcing, asynchronous
/// start and complete, recycling) run inside the owning process. The state
/// lock is only held for bookkeeping, never across user code, and is always
/// taken after the process lock.
pub struct ManagedObjectContainer {
    metadata: Arc<ManagedObjectMetaData>,
    process: Arc<ProcessState>,
    activator: Activator,
    events: Arc<InProcEventBus>,
    state: Mutex<ContainerState>,
}

impl std::fmt::Debug for ManagedObjectContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ManagedObjectContainer")
            .field("name", &self.metadata.name)
            .field("process", &self.process.id())
            .field("lifecycle", &state.lifecycle)
            .field("failed", &state.failure.is_some())
            .field("parked", &state.parked.len())
            .finish()
    }
}

impl ManagedObjectContainer {
    pub fn new(
        metadata: Arc<ManagedObjectMetaData>,
        process: Arc<ProcessState>,
        activator: Activator,
        events: Arc<InProcEventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            metadata,
            process,
            activator,
            events,
            state: Mutex::new(ContainerState {
                lifecycle: LifecycleState::Sourcing,
                sourcing: false,
                managed_object: None,
                registry: None,
                failure: None,
                pending_since: None,
                parked: Vec::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn metadata(&self) -> &Arc<ManagedObjectMetaData> {
        &self.metadata
    }

    pub fn process_id(&self) -> ProcessId {
        self.process.id()
    }

    pub fn state(&self) -> LifecycleState {
        self.state.lock().lifecycle
    }

    pub fn parked_jobs(&self) -> usize {
        self.state.lock().parked.len()
    }

    pub fn is_failed(&self) -> bool {
        self.state.lock().failure.is_some()
    }

    /// Ask the source for the object, once per container.
    pub(crate) fn ensure_sourced(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.sourcing {
                return;
            }
            state.sourcing = true;
            state.pending_since = Some(Instant::now());
        }

        tracing::debug!(managed_object = self.name(), process = %self.process.id(), "sourcing managed object");
        let user = ManagedObjectUser::new(Arc::clone(self));
        let source = Arc::clone(&self.metadata.source);
        let sourced = panic::catch_unwind(AssertUnwindSafe(|| source.source_managed_object(user)));
        if let Err(payload) = sourced {
            let message = panic_message(payload.as_ref());
            self.set_failure(anyhow::anyhow!("managed object source panicked: {message}"));
        }
    }

    pub fn readiness(&self) -> Readiness {
        let state = self.state.lock();
        if let Some(failure) = &state.failure {
            return Readiness::Failed(failure.to_error(self.name()));
        }
        match state.lifecycle {
            LifecycleState::Ready => Readiness::Ready,
            LifecycleState::Recycled => Readiness::Failed(ManagedObjectError::Recycled {
                managed_object: self.name().to_string(),
            }),
            pending => Readiness::Pending(pending),
        }
    }

    /// The underlying object. Only available while ready.
    pub fn object(&self) -> Result<Object, ManagedObjectError> {
        let managed_object = {
            let state = self.state.lock();
            if let Some(failure) = &state.failure {
                return Err(failure.to_error(self.name()));
            }
            match (&state.managed_object, state.lifecycle) {
                (Some(managed_object), LifecycleState::Ready) => Arc::clone(managed_object),
                (_, LifecycleState::Recycled) => {
                    return Err(ManagedObjectError::Recycled {
                        managed_object: self.name().to_string(),
                    });
                }
                (_, lifecycle) => {
                    return Err(ManagedObjectError::NotAvailable {
                        managed_object: self.name().to_string(),
                        state: lifecycle,
                    });
                }
            }
        };
        managed_object
            .object()
            .map_err(|source| ManagedObjectError::ObjectFailed {
                managed_object: self.name().to_string(),
                source,
            })
    }

    /// Whether dependencies still have to be handed to a coordinating object.
    pub(crate) fn needs_loading(&self) -> bool {
        !self.metadata.dependencies.is_empty() && self.state.lock().registry.is_none()
    }

    /// Resolve dependencies and call `load_objects`.
    ///
    /// `dependencies` are the containers of the declared dependencies, in
    /// declaration order, all ready.
    pub(crate) fn load_dependencies(
        &self,
        dependencies: &[Arc<ManagedObjectContainer>],
    ) -> Result<(), ManagedObjectError> {
        let managed_object = {
            let state = self.state.lock();
            if state.registry.is_some() {
                return Ok(());
            }
            state
                .managed_object
                .clone()
                .ok_or_else(|| ManagedObjectError::NotAvailable {
                    managed_object: self.name().to_string(),
                    state: state.lifecycle,
                })?
        };
        let coordinating = managed_object
            .as_coordinating()
            .ok_or_else(|| Defect::NotCoordinating {
                managed_object: self.name().to_string(),
            })?;

        let mut registry = ObjectRegistry::new(self.name());
        for (index, dependency) in self.metadata.dependencies.iter().enumerate() {
            let container = dependencies
                .get(index)
                .ok_or_else(|| Defect::DependencyOutOfRange {
                    managed_object: self.name().to_string(),
                    index,
                    declared: dependencies.len(),
                })?;
            registry.push(&dependency.key, &dependency.managed_object, container.object()?);
        }

        coordinating
            .load_objects(&registry)
            .map_err(|source| ManagedObjectError::ObjectFailed {
                managed_object: self.name().to_string(),
                source,
            })?;
        tracing::debug!(managed_object = self.name(), dependencies = registry.len(), "dependencies loaded");
        self.state.lock().registry = Some(registry);
        Ok(())
    }

    /// Suspend `parked` until the object is ready.
    ///
    /// A job parked after the object already became ready is resubmitted
    /// straight away, so a completion racing the end of a job step is never
    /// lost.
    pub(crate) fn park(&self, parked: ParkedJob) {
        let mut state = self.state.lock();
        if let Some(failure) = state.failure.clone() {
            drop(state);
            self.escalate_parked(vec![parked], &failure);
            return;
        }
        match state.lifecycle {
            LifecycleState::Sourcing | LifecycleState::AsyncPending => {
                let job_id = parked.job.id();
                telemetry::record_job_parked(job_id.to_string(), self.name(), state.lifecycle);
                self.events.emit(
                    self.process.id(),
                    EngineEventPayload::JobParked {
                        job_id,
                        managed_object: self.name().to_string(),
                        state: state.lifecycle,
                    },
                );
                state.parked.push(parked);
            }
            LifecycleState::Ready => {
                drop(state);
                self.activator
                    .resubmit(self.process.id(), self.name(), vec![parked]);
            }
            LifecycleState::Recycled => {
                drop(state);
                let ParkedJob { mut job, .. } = parked;
                let job_id = job.id();
                job.escalate(Escalation::ManagedObject {
                    job: job_id,
                    source: ManagedObjectError::Recycled {
                        managed_object: self.name().to_string(),
                    },
                });
            }
        }
    }

    pub(crate) fn set_managed_object(
        self: &Arc<Self>,
        managed_object: Arc<dyn ManagedObject>,
    ) -> Result<(), Defect> {
        let _guard = self.process.enter();
        {
            let mut state = self.state.lock();
            if state.managed_object.is_some() {
                let defect = Defect::ManagedObjectAlreadySourced {
                    managed_object: self.name().to_string(),
                };
                tracing::error!(managed_object = self.name(), error = %defect, "managed object set twice");
                return Err(defect);
            }
            if state.failure.is_some() || state.lifecycle == LifecycleState::Recycled {
                drop(state);
                tracing::warn!(managed_object = self.name(), "managed object arrived too late, recycling it");
                managed_object.recycle();
                return Ok(());
            }
            if !self.metadata.dependencies.is_empty() && managed_object.as_coordinating().is_none() {
                let defect = Defect::NotCoordinating {
                    managed_object: self.name().to_string(),
                };
                tracing::error!(managed_object = self.name(), error = %defect, "invalid managed object");
                let parked = self.record_failure(&mut state, Failure::Defect(defect.clone()));
                drop(state);
                self.escalate_parked(parked, &Failure::Defect(defect.clone()));
                return Err(defect);
            }
            state.managed_object = Some(Arc::clone(&managed_object));
            state.pending_since = None;
            self.transition(&mut state, LifecycleState::Ready);
        }

        if let Some(aware) = managed_object.as_context_aware() {
            aware.set_managed_object_context(ManagedObjectContext::new(
                self.name(),
                Arc::clone(&self.process),
            ));
        }
        if let Some(asynchronous) = managed_object.as_asynchronous() {
            asynchronous.set_asynchronous_context(AsynchronousContext::new(self));
        }

        // Capabilities may already have started an asynchronous operation.
        let parked = {
            let mut state = self.state.lock();
            if state.lifecycle == LifecycleState::Ready {
                std::mem::take(&mut state.parked)
            } else {
                Vec::new()
            }
        };
        self.activator
            .resubmit(self.process.id(), self.name(), parked);
        Ok(())
    }

    pub(crate) fn set_failure(&self, failure: anyhow::Error) {
        let _guard = self.process.enter();
        let mut state = self.state.lock();
        if state.failure.is_some() || state.lifecycle != LifecycleState::Sourcing {
            tracing::warn!(managed_object = self.name(), error = %failure, "ignoring late sourcing failure");
            return;
        }
        tracing::error!(managed_object = self.name(), error = %failure, "managed object failed to source");
        let failure = Failure::Source(Arc::new(failure));
        let parked = self.record_failure(&mut state, failure.clone());
        drop(state);
        self.escalate_parked(parked, &failure);
    }

    pub(crate) fn start_operation<E, F>(&self, operation: F) -> Result<(), AsynchronousError<E>>
    where
        E: std::fmt::Debug + std::fmt::Display,
        F: FnOnce() -> Result<(), E>,
    {
        self.process.run(|| {
            {
                let mut state = self.state.lock();
                if state.failure.is_some() {
                    tracing::warn!(managed_object = self.name(), "ignoring asynchronous start on failed managed object");
                    return Ok(());
                }
                match state.lifecycle {
                    LifecycleState::Ready => {}
                    LifecycleState::AsyncPending => {
                        let defect = Defect::AsynchronousOperationAlreadyStarted {
                            managed_object: self.name().to_string(),
                        };
                        tracing::error!(managed_object = self.name(), error = %defect, "asynchronous operation started twice");
                        let parked = self.record_failure(&mut state, Failure::Defect(defect.clone()));
                        drop(state);
                        self.escalate_parked(parked, &Failure::Defect(defect.clone()));
                        return Err(AsynchronousError::Defect(defect));
                    }
                    other => {
                        tracing::warn!(managed_object = self.name(), state = %other, "ignoring asynchronous start");
                        return Ok(());
                    }
                }
            }

            operation().map_err(AsynchronousError::Operation)?;

            let mut state = self.state.lock();
            state.pending_since = Some(Instant::now());
            self.transition(&mut state, LifecycleState::AsyncPending);
            Ok(())
        })
    }

    pub(crate) fn complete_operation<E, F>(&self, operation: F) -> Result<(), E>
    where
        F: FnOnce() -> Result<(), E>,
    {
        self.process.run(|| {
            {
                let state = self.state.lock();
                if state.failure.is_some() {
                    tracing::warn!(managed_object = self.name(), "ignoring completion on failed managed object");
                    return Ok(());
                }
                if state.lifecycle != LifecycleState::AsyncPending {
                    tracing::warn!(
                        managed_object = self.name(),
                        state = %state.lifecycle,
                        "asynchronous operation completed without being started"
                    );
                    return Ok(());
                }
            }

            let result = operation();

            let parked = {
                let mut state = self.state.lock();
                state.pending_since = None;
                self.transition(&mut state, LifecycleState::Ready);
                std::mem::take(&mut state.parked)
            };
            self.activator
                .resubmit(self.process.id(), self.name(), parked);
            result
        })
    }

    /// Fail the container if sourcing or an asynchronous operation ran too long.
    pub(crate) fn check_timeout(&self, now: Instant) -> bool {
        let Some(timeout) = self.metadata.timeout else {
            return false;
        };
        let mut state = self.state.lock();
        if state.failure.is_some() || !state.lifecycle.is_pending() {
            return false;
        }
        match state.pending_since {
            Some(since) if now.saturating_duration_since(since) >= timeout => {}
            _ => return false,
        }

        let failure = Failure::TimedOut {
            state: state.lifecycle,
            timeout,
        };
        tracing::warn!(
            managed_object = self.name(),
            state = %state.lifecycle,
            timeout_ms = timeout.as_millis() as u64,
            parked = state.parked.len(),
            "managed object timed out"
        );
        let parked = self.record_failure(&mut state, failure.clone());
        drop(state);
        self.escalate_parked(parked, &failure);
        true
    }

    /// Release the object at the end of its process.
    pub(crate) fn recycle(&self) {
        let _guard = self.process.enter();
        let (managed_object, loaded) = {
            let state = self.state.lock();
            if state.lifecycle == LifecycleState::Recycled {
                return;
            }
            (state.managed_object.clone(), state.registry.is_some())
        };

        if let Some(managed_object) = &managed_object {
            if loaded {
                if let Some(coordinating) = managed_object.as_coordinating() {
                    coordinating.unload_objects();
                }
            }
            managed_object.recycle();
        }

        let parked = {
            let mut state = self.state.lock();
            state.managed_object = None;
            state.registry = None;
            state.pending_since = None;
            self.transition(&mut state, LifecycleState::Recycled);
            std::mem::take(&mut state.parked)
        };
        for ParkedJob { mut job, .. } in parked {
            let job_id = job.id();
            job.escalate(Escalation::ManagedObject {
                job: job_id,
                source: ManagedObjectError::Recycled {
                    managed_object: self.name().to_string(),
                },
            });
        }
    }

    fn record_failure(&self, state: &mut ContainerState, failure: Failure) -> Vec<ParkedJob> {
        state.failure = Some(failure);
        state.pending_since = None;
        std::mem::take(&mut state.parked)
    }

    fn escalate_parked(&self, parked: Vec<ParkedJob>, failure: &Failure) {
        for job in parked {
            let escalation = Escalation::ManagedObject {
                job: job.job.id(),
                source: failure.to_error(self.name()),
            };
            self.activator.escalate(self.process.id(), job, escalation);
        }
    }

    fn transition(&self, state: &mut ContainerState, to: LifecycleState) {
        let from = state.lifecycle;
        if from == to {
            return;
        }
        state.lifecycle = to;
        telemetry::record_state_change(self.name(), from, to);
        self.events.emit(
            self.process.id(),
            EngineEventPayload::StateChanged {
                managed_object: self.name().to_string(),
                from,
                to,
            },
        );
    }
}
