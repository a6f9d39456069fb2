use std::fmt::{self, Display};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Escalation;
use crate::team::Team;

/// Unique identifier of a job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A schedulable unit of work.
///
/// Teams call [`Job::execute`] once per scheduling pass until it returns
/// `true`. A job returning `false` may leave a [`Handover`] in the
/// [`JobContext`]; the team then gives the job away instead of keeping it.
pub trait Job: Send + 'static {
    fn id(&self) -> JobId;

    /// Execute one step. Returns `true` once the work is complete.
    fn execute(&mut self, context: &mut JobContext) -> bool;

    /// Route a failure to the job's failure handling.
    ///
    /// Called at most once; the job is discarded afterwards.
    fn escalate(&mut self, escalation: Escalation);

    /// Key used by affinity teams to pin the job to one worker.
    fn affinity(&self) -> Option<u64> {
        None
    }
}

impl fmt::Debug for dyn Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job").field("id", &self.id()).finish()
    }
}

/// Takes ownership of a job that returned `false`.
///
/// The engine hands a job over when parking it against a managed object.
pub trait Handover: Send {
    fn hand_over(self: Box<Self>, job: Box<dyn Job>, team: Arc<dyn Team>);
}

/// Per-execution context handed to [`Job::execute`] by the team.
pub struct JobContext {
    team: Arc<dyn Team>,
    handover: Option<Box<dyn Handover>>,
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("team", &self.team.name())
            .field("handover", &self.handover.is_some())
            .finish()
    }
}

impl JobContext {
    pub fn new(team: Arc<dyn Team>) -> Self {
        Self {
            team,
            handover: None,
        }
    }

    /// The team executing the job.
    pub fn team(&self) -> &Arc<dyn Team> {
        &self.team
    }

    /// Ask the team to pass the job on once `execute` returns `false`.
    ///
    /// A later call replaces an earlier one.
    pub fn hand_over(&mut self, handover: Box<dyn Handover>) {
        self.handover = Some(handover);
    }

    pub(crate) fn take_handover(&mut self) -> Option<Box<dyn Handover>> {
        self.handover.take()
    }
}
