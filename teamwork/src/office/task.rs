use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::{Defect, Escalation, ManagedObjectError};
use crate::events::EngineEventPayload;
use crate::job::{Handover, Job, JobContext, JobId};
use crate::managed_object::{LifecycleState, ManagedObjectContainer, Object, ParkedJob, Readiness};
use crate::process::ProcessId;
use crate::team::Team;

use super::process::Process;

/// Result of one run of a task body.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskOutcome {
    /// The task is done.
    Complete,
    /// Run the body again; after any asynchronous operation it started.
    Continue,
}

type TaskBody = Box<dyn FnMut(&mut TaskContext<'_>) -> anyhow::Result<TaskOutcome> + Send>;

/// Description of a task to run within a process.
pub struct TaskSpec {
    name: String,
    team: Option<String>,
    managed_objects: Vec<String>,
    affinity: Option<u64>,
    body: TaskBody,
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("name", &self.name)
            .field("team", &self.team)
            .field("managed_objects", &self.managed_objects)
            .field("affinity", &self.affinity)
            .finish()
    }
}

impl TaskSpec {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: FnMut(&mut TaskContext<'_>) -> anyhow::Result<TaskOutcome> + Send + 'static,
    {
        Self {
            name: name.into(),
            team: None,
            managed_objects: Vec::new(),
            affinity: None,
            body: Box::new(body),
        }
    }

    /// Run on `team` instead of the team of the first managed object.
    pub fn with_team(mut self, team: impl Into<String>) -> Self {
        self.team = Some(team.into());
        self
    }

    /// Require the managed object `name`.
    pub fn using(mut self, name: impl Into<String>) -> Self {
        self.managed_objects.push(name.into());
        self
    }

    pub fn with_affinity(mut self, key: u64) -> Self {
        self.affinity = Some(key);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn team(&self) -> Option<&str> {
        self.team.as_deref()
    }

    pub fn managed_objects(&self) -> &[String] {
        &self.managed_objects
    }

    pub(crate) fn into_parts(self) -> (String, Vec<String>, Option<u64>, TaskBody) {
        (self.name, self.managed_objects, self.affinity, self.body)
    }
}

/// A managed object required by a task, with the positions of its
/// dependencies among the task's slots.
pub(crate) struct ObjectSlot {
    pub(crate) container: Arc<ManagedObjectContainer>,
    pub(crate) dependencies: Vec<usize>,
}

/// What a task body sees while it runs.
pub struct TaskContext<'a> {
    job_id: JobId,
    task: &'a str,
    step: u32,
    process: &'a Process,
    slots: &'a [ObjectSlot],
    declared: &'a [(String, usize)],
}

impl<'a> TaskContext<'a> {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn task_name(&self) -> &str {
        self.task
    }

    /// How many times the job has run, starting at 1.
    pub fn step(&self) -> u32 {
        self.step
    }

    pub fn process_id(&self) -> ProcessId {
        self.process.id()
    }

    /// The owning process, for submitting follow-up tasks.
    pub fn process(&self) -> &Process {
        self.process
    }

    /// Object of the managed object the task declared as `name`.
    pub fn object(&self, name: &str) -> Result<Object, ManagedObjectError> {
        self.container(name)?.object()
    }

    /// Object of the `index`-th managed object the task declared.
    pub fn object_at(&self, index: usize) -> Result<Object, ManagedObjectError> {
        let (name, _) = self
            .declared
            .get(index)
            .ok_or_else(|| Defect::UnknownTaskObject {
                task: self.task.to_string(),
                managed_object: format!("#{index}"),
            })?;
        self.object(name)
    }

    /// Typed access to a declared managed object's object.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, ManagedObjectError> {
        self.object(name)?
            .downcast::<T>()
            .map_err(|_| ManagedObjectError::ObjectFailed {
                managed_object: name.to_string(),
                source: anyhow::anyhow!("object is not a {}", std::any::type_name::<T>()),
            })
    }

    /// Current lifecycle state of a declared managed object.
    pub fn state(&self, name: &str) -> Result<LifecycleState, ManagedObjectError> {
        Ok(self.container(name)?.state())
    }

    fn container(&self, name: &str) -> Result<&Arc<ManagedObjectContainer>, ManagedObjectError> {
        self.declared
            .iter()
            .find(|(declared, _)| declared == name)
            .map(|(_, slot)| &self.slots[*slot].container)
            .ok_or_else(|| {
                ManagedObjectError::Defect(Defect::UnknownTaskObject {
                    task: self.task.to_string(),
                    managed_object: name.to_string(),
                })
            })
    }
}

enum Preparation {
    Ready,
    Park(Arc<ManagedObjectContainer>),
    Failed(ManagedObjectError),
}

/// The engine's job running a [`TaskSpec`] body.
pub(crate) struct TaskJob {
    id: JobId,
    name: String,
    process: Process,
    slots: Vec<ObjectSlot>,
    declared: Vec<(String, usize)>,
    affinity: Option<u64>,
    body: TaskBody,
    steps: u32,
    finished: bool,
}

impl TaskJob {
    pub(crate) fn new(
        name: String,
        process: Process,
        slots: Vec<ObjectSlot>,
        declared: Vec<(String, usize)>,
        affinity: Option<u64>,
        body: TaskBody,
    ) -> Self {
        Self {
            id: JobId::new(),
            name,
            process,
            slots,
            declared,
            affinity,
            body,
            steps: 0,
            finished: false,
        }
    }

    /// Source every object, then check them dependencies first.
    fn prepare(&self) -> Preparation {
        for slot in &self.slots {
            slot.container.ensure_sourced();
        }

        for slot in &self.slots {
            match slot.container.readiness() {
                Readiness::Ready => {}
                Readiness::Pending(_) => return Preparation::Park(Arc::clone(&slot.container)),
                Readiness::Failed(err) => return Preparation::Failed(err),
            }
            if slot.container.needs_loading() {
                let dependencies: Vec<_> = slot
                    .dependencies
                    .iter()
                    .map(|&index| Arc::clone(&self.slots[index].container))
                    .collect();
                if let Err(err) = slot.container.load_dependencies(&dependencies) {
                    return Preparation::Failed(err);
                }
            }
        }
        Preparation::Ready
    }

    fn pending_slot(&self) -> Option<Arc<ManagedObjectContainer>> {
        self.slots
            .iter()
            .find(|slot| slot.container.state().is_pending())
            .map(|slot| Arc::clone(&slot.container))
    }

    /// The object a failed body was waiting on, when the failure only says
    /// the object went pending during the step.
    fn suspended_on(&self, source: &anyhow::Error) -> Option<Arc<ManagedObjectContainer>> {
        match source.downcast_ref::<ManagedObjectError>()? {
            ManagedObjectError::NotAvailable {
                managed_object,
                state,
            } if state.is_pending() => self
                .slots
                .iter()
                .find(|slot| slot.container.name() == managed_object)
                .map(|slot| Arc::clone(&slot.container))
                .or_else(|| self.pending_slot()),
            _ => None,
        }
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.process.job_finished();
        }
    }
}

impl Job for TaskJob {
    fn id(&self) -> JobId {
        self.id
    }

    fn execute(&mut self, context: &mut JobContext) -> bool {
        self.steps += 1;
        let process = Arc::clone(self.process.state());
        let _guard = process.enter();

        match self.prepare() {
            Preparation::Ready => {}
            Preparation::Park(container) => {
                context.hand_over(Box::new(ParkHandover { container }));
                return false;
            }
            Preparation::Failed(source) => {
                self.escalate(Escalation::ManagedObject {
                    job: self.id,
                    source,
                });
                return true;
            }
        }

        let outcome = {
            let mut task = TaskContext {
                job_id: self.id,
                task: &self.name,
                step: self.steps,
                process: &self.process,
                slots: &self.slots,
                declared: &self.declared,
            };
            (self.body)(&mut task)
        };

        match outcome {
            Ok(TaskOutcome::Complete) => {
                tracing::debug!(job_id = %self.id, task = %self.name, steps = self.steps, "task complete");
                self.process
                    .emit(EngineEventPayload::JobCompleted { job_id: self.id });
                self.finish();
                true
            }
            Ok(TaskOutcome::Continue) => {
                if let Some(container) = self.pending_slot() {
                    context.hand_over(Box::new(ParkHandover { container }));
                }
                false
            }
            Err(source) => {
                if let Some(container) = self.suspended_on(&source) {
                    tracing::debug!(
                        job_id = %self.id,
                        task = %self.name,
                        managed_object = container.name(),
                        "task suspended on pending managed object"
                    );
                    context.hand_over(Box::new(ParkHandover { container }));
                    return false;
                }
                self.escalate(Escalation::TaskFailed {
                    job: self.id,
                    source,
                });
                true
            }
        }
    }

    fn escalate(&mut self, escalation: Escalation) {
        if self.finished {
            tracing::warn!(job_id = %self.id, error = %escalation, "escalation after task finished");
            return;
        }
        self.process.escalate(escalation);
        self.finish();
    }

    fn affinity(&self) -> Option<u64> {
        self.affinity
    }
}

impl Drop for TaskJob {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Parks a job on a managed object once its step has returned.
struct ParkHandover {
    container: Arc<ManagedObjectContainer>,
}

impl Handover for ParkHandover {
    fn hand_over(self: Box<Self>, job: Box<dyn Job>, team: Arc<dyn Team>) {
        self.container.park(ParkedJob { job, team });
    }
}
