//! Error types for the execution core.
//!
//! Failures fall into three groups. [`Defect`]s describe an incorrectly built
//! managed object or configuration and are never retried. Resource failures
//! come from user code and travel unchanged inside [`AsynchronousError`],
//! [`ManagedObjectError`] or [`Escalation`]. [`TeamError`] reports a team that
//! cannot take a job right now.

use std::time::Duration;

use crate::job::JobId;
use crate::managed_object::LifecycleState;

/// Usage or configuration defect. Always fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Defect {
    #[error("managed object '{managed_object}' started an asynchronous operation while one is in progress")]
    AsynchronousOperationAlreadyStarted { managed_object: String },

    #[error("managed object '{managed_object}' requested undeclared dependency '{key}'")]
    UndeclaredDependency { managed_object: String, key: String },

    #[error("managed object '{managed_object}' requested dependency index {index} but declares {declared}")]
    DependencyOutOfRange {
        managed_object: String,
        index: usize,
        declared: usize,
    },

    #[error("managed object '{managed_object}' was already sourced")]
    ManagedObjectAlreadySourced { managed_object: String },

    #[error("managed object '{managed_object}' declares dependencies but is not coordinating")]
    NotCoordinating { managed_object: String },

    #[error("task '{task}' has no managed object named '{managed_object}'")]
    UnknownTaskObject { task: String, managed_object: String },
}

/// Reasons a team refuses a job.
#[derive(Debug, thiserror::Error)]
pub enum TeamError {
    #[error("team '{team}' is overloaded")]
    Overloaded { team: String },

    #[error("team '{team}' is not working")]
    NotWorking { team: String },

    #[error("team '{team}' failed to spawn a worker: {source}")]
    Spawn {
        team: String,
        #[source]
        source: std::io::Error,
    },
}

impl TeamError {
    /// Whether the caller may retry the assignment later.
    pub fn is_overload(&self) -> bool {
        matches!(self, TeamError::Overloaded { .. })
    }
}

/// Failures observed when reading a managed object.
#[derive(Debug, thiserror::Error)]
pub enum ManagedObjectError {
    #[error("managed object '{managed_object}' is not available ({state})")]
    NotAvailable {
        managed_object: String,
        state: LifecycleState,
    },

    #[error("managed object '{managed_object}' failed to source: {source}")]
    SourceFailed {
        managed_object: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("managed object '{managed_object}' failed to provide its object: {source}")]
    ObjectFailed {
        managed_object: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("managed object '{managed_object}' timed out after {timeout:?} while {state}")]
    TimedOut {
        managed_object: String,
        state: LifecycleState,
        timeout: Duration,
    },

    #[error("managed object '{managed_object}' has been recycled")]
    Recycled { managed_object: String },

    #[error(transparent)]
    Defect(#[from] Defect),
}

impl ManagedObjectError {
    /// Name of the managed object the failure belongs to, if any.
    pub fn managed_object(&self) -> Option<&str> {
        match self {
            ManagedObjectError::NotAvailable { managed_object, .. }
            | ManagedObjectError::SourceFailed { managed_object, .. }
            | ManagedObjectError::ObjectFailed { managed_object, .. }
            | ManagedObjectError::TimedOut { managed_object, .. }
            | ManagedObjectError::Recycled { managed_object } => Some(managed_object),
            ManagedObjectError::Defect(_) => None,
        }
    }
}

/// Result of `start`/`complete` on an asynchronous context.
///
/// The operation's own error is handed back untouched in `Operation`.
#[derive(Debug, thiserror::Error)]
pub enum AsynchronousError<E>
where
    E: std::fmt::Debug + std::fmt::Display,
{
    #[error(transparent)]
    Defect(Defect),

    #[error("{0}")]
    Operation(E),
}

impl<E> AsynchronousError<E>
where
    E: std::fmt::Debug + std::fmt::Display,
{
    /// Unwrap the operation failure, if this is one.
    pub fn into_operation(self) -> Option<E> {
        match self {
            AsynchronousError::Operation(err) => Some(err),
            AsynchronousError::Defect(_) => None,
        }
    }
}

/// Errors detected while validating an office configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown team '{0}'")]
    UnknownTeam(String),

    #[error("unknown managed object '{0}'")]
    UnknownManagedObject(String),

    #[error("managed object '{managed_object}' depends on unknown managed object '{target}'")]
    UnknownDependency {
        managed_object: String,
        target: String,
    },

    #[error("duplicate {kind} name '{name}'")]
    Duplicate { kind: &'static str, name: String },

    #[error("dependency cycle through managed object '{0}'")]
    DependencyCycle(String),

    #[error("task '{0}' names no team and none of its managed objects has one")]
    NoTeam(String),

    #[error("no source bound for managed object '{0}'")]
    MissingSource(String),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Failure delivered to a job's escalation handling.
#[derive(Debug, thiserror::Error)]
pub enum Escalation {
    #[error("job {job} panicked: {message}")]
    Panicked { job: JobId, message: String },

    #[error("job {job} failed: {source}")]
    TaskFailed {
        job: JobId,
        #[source]
        source: anyhow::Error,
    },

    #[error("job {job} failed on managed object: {source}")]
    ManagedObject {
        job: JobId,
        #[source]
        source: ManagedObjectError,
    },

    #[error("job {job} hit a defect: {defect}")]
    Defect { job: JobId, defect: Defect },

    #[error("job {job} could not be assigned: {source}")]
    Overloaded {
        job: JobId,
        #[source]
        source: TeamError,
    },
}

impl Escalation {
    /// The job that produced the failure.
    pub fn job(&self) -> JobId {
        match self {
            Escalation::Panicked { job, .. }
            | Escalation::TaskFailed { job, .. }
            | Escalation::ManagedObject { job, .. }
            | Escalation::Defect { job, .. }
            | Escalation::Overloaded { job, .. } => *job,
        }
    }

    /// Whether this escalation was caused by a managed object timing out.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Escalation::ManagedObject {
                source: ManagedObjectError::TimedOut { .. },
                ..
            }
        )
    }

    /// Short label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Escalation::Panicked { .. } => "panicked",
            Escalation::TaskFailed { .. } => "task_failed",
            Escalation::ManagedObject { source, .. } => match source {
                ManagedObjectError::TimedOut { .. } => "timed_out",
                _ => "managed_object",
            },
            Escalation::Defect { .. } => "defect",
            Escalation::Overloaded { .. } => "overloaded",
        }
    }
}
