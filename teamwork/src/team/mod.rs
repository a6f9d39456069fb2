//! Teams: pluggable worker pools that execute [`Job`]s.
//!
//! The engine decides *what* runs next; a team decides *where*. Every team
//! shares the same execution step ([`run_job`]) so panic capture and job
//! handover behave identically whichever pool is in use.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::config::{TeamConfig, TeamKind};
use crate::error::{Escalation, TeamError};
use crate::job::{Job, JobContext};
use crate::telemetry;

mod affinity;
mod executor;
mod one_person;
mod passive;
mod worker;
mod worker_per_job;

pub use affinity::AffinityTeam;
pub use executor::ExecutorTeam;
pub use one_person::OnePersonTeam;
pub use passive::PassiveTeam;
pub use worker_per_job::WorkerPerJobTeam;

/// A worker pool accepting jobs.
///
/// `start_working` is called once before the first `assign_job`.
/// `assign_job` never blocks indefinitely; a team that cannot take the job
/// hands it back inside [`RejectedJob`].
pub trait Team: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn start_working(&self) -> Result<(), TeamError>;

    fn assign_job(&self, job: Box<dyn Job>) -> Result<(), RejectedJob>;

    /// Finish in-flight jobs, release threads, and refuse new jobs.
    fn stop_working(&self);
}

impl fmt::Debug for dyn Team {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Team").field("name", &self.name()).finish()
    }
}

/// A job the team refused, returned to the caller together with the reason.
pub struct RejectedJob {
    pub job: Box<dyn Job>,
    pub reason: TeamError,
}

impl RejectedJob {
    pub fn new(job: Box<dyn Job>, reason: TeamError) -> Self {
        Self { job, reason }
    }

    pub fn overloaded(job: Box<dyn Job>, team: &str) -> Self {
        Self::new(
            job,
            TeamError::Overloaded {
                team: team.to_string(),
            },
        )
    }

    pub fn not_working(job: Box<dyn Job>, team: &str) -> Self {
        Self::new(
            job,
            TeamError::NotWorking {
                team: team.to_string(),
            },
        )
    }

    /// Give up on the job, routing the refusal to its escalation handling.
    pub fn escalate(self) {
        let RejectedJob { mut job, reason } = self;
        let job_id = job.id();
        tracing::warn!(job_id = %job_id, error = %reason, "escalating rejected job");
        job.escalate(Escalation::Overloaded {
            job: job_id,
            source: reason,
        });
    }
}

impl fmt::Debug for RejectedJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RejectedJob")
            .field("job", &self.job.id())
            .field("reason", &self.reason)
            .finish()
    }
}

impl fmt::Display for RejectedJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job {} rejected: {}", self.job.id(), self.reason)
    }
}

/// Execute one step of `job` on behalf of `team`.
///
/// Returns the job when it asked to be continued on the same team without
/// naming a handover; the caller decides how to requeue it.
pub fn run_job(team: &Arc<dyn Team>, mut job: Box<dyn Job>) -> Option<Box<dyn Job>> {
    let job_id = job.id();
    let span = telemetry::job_execute_span(job_id.to_string(), team.name());
    let _enter = span.enter();
    let timing = telemetry::record_job_start(job_id.to_string());

    let mut context = JobContext::new(Arc::clone(team));
    let result = panic::catch_unwind(AssertUnwindSafe(|| job.execute(&mut context)));

    match result {
        Ok(true) => {
            telemetry::record_job_end(timing, team.name(), "complete");
            None
        }
        Ok(false) => {
            telemetry::record_job_end(timing, team.name(), "incomplete");
            match context.take_handover() {
                Some(handover) => {
                    handover.hand_over(job, Arc::clone(team));
                    None
                }
                None => Some(job),
            }
        }
        Err(payload) => {
            telemetry::record_job_end(timing, team.name(), "panicked");
            let message = panic_message(payload.as_ref());
            tracing::error!(job_id = %job_id, team = team.name(), %message, "job panicked");
            let escalated = panic::catch_unwind(AssertUnwindSafe(|| {
                job.escalate(Escalation::Panicked {
                    job: job_id,
                    message,
                })
            }));
            if escalated.is_err() {
                tracing::error!(job_id = %job_id, "escalation handling panicked");
            }
            None
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Build a team from configuration.
///
/// `ExecutorTeam` needs a tokio runtime; it uses `runtime` when given,
/// otherwise the runtime of the calling context.
pub fn build_team(
    config: &TeamConfig,
    runtime: Option<tokio::runtime::Handle>,
) -> anyhow::Result<Arc<dyn Team>> {
    let team: Arc<dyn Team> = match config.kind {
        TeamKind::Passive => Arc::new(PassiveTeam::new(&config.name)),
        TeamKind::OnePerson => Arc::new(OnePersonTeam::new(&config.name, config.queue_capacity)),
        TeamKind::WorkerPerJob { max_workers } => {
            Arc::new(WorkerPerJobTeam::new(&config.name, max_workers))
        }
        TeamKind::Executor { max_threads } => {
            let handle = match runtime {
                Some(handle) => handle,
                None => tokio::runtime::Handle::try_current().map_err(|err| {
                    anyhow::anyhow!("executor team '{}' needs a tokio runtime: {err}", config.name)
                })?,
            };
            Arc::new(ExecutorTeam::new(&config.name, handle, max_threads))
        }
        TeamKind::Affinity { workers } => Arc::new(AffinityTeam::new(
            &config.name,
            workers,
            config.queue_capacity,
        )),
    };
    Ok(team)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::job::JobId;

    /// Job completing after `steps` executions, recording escalations.
    pub(crate) struct StepJob {
        pub id: JobId,
        pub remaining: usize,
        pub executions: Arc<AtomicUsize>,
        pub escalations: Arc<Mutex<Vec<String>>>,
        pub panic_on_step: Option<usize>,
    }

    impl StepJob {
        pub(crate) fn new(steps: usize) -> Self {
            Self {
                id: JobId::new(),
                remaining: steps,
                executions: Arc::new(AtomicUsize::new(0)),
                escalations: Arc::new(Mutex::new(Vec::new())),
                panic_on_step: None,
            }
        }
    }

    impl Job for StepJob {
        fn id(&self) -> JobId {
            self.id
        }

        fn execute(&mut self, _context: &mut JobContext) -> bool {
            let step = self.executions.fetch_add(1, Ordering::SeqCst) + 1;
            if self.panic_on_step == Some(step) {
                panic!("boom at step {step}");
            }
            self.remaining = self.remaining.saturating_sub(1);
            self.remaining == 0
        }

        fn escalate(&mut self, escalation: Escalation) {
            self.escalations.lock().push(escalation.kind().to_string());
        }
    }

    #[test]
    fn test_run_job_routes_panic_to_escalation() {
        let team: Arc<dyn Team> = Arc::new(PassiveTeam::new("inline"));
        let mut job = StepJob::new(3);
        job.panic_on_step = Some(1);
        let escalations = Arc::clone(&job.escalations);

        let leftover = run_job(&team, Box::new(job));

        assert!(leftover.is_none());
        assert_eq!(escalations.lock().as_slice(), ["panicked"]);
    }

    #[test]
    fn test_run_job_returns_unfinished_job_without_handover() {
        let team: Arc<dyn Team> = Arc::new(PassiveTeam::new("inline"));
        let job = StepJob::new(2);
        let executions = Arc::clone(&job.executions);

        let leftover = run_job(&team, Box::new(job));

        assert!(leftover.is_some());
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panic_message_extracts_strings() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let borrowed: Box<dyn Any + Send> = Box::new("borrowed");
        let other: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(owned.as_ref()), "owned");
        assert_eq!(panic_message(borrowed.as_ref()), "borrowed");
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }

    #[test]
    fn test_build_team_from_config() {
        let team = build_team(&TeamConfig::passive("inline"), None).unwrap();
        assert_eq!(team.name(), "inline");

        let one = build_team(&TeamConfig::one_person("single"), None).unwrap();
        assert_eq!(one.name(), "single");
    }

    #[test]
    fn test_build_executor_team_requires_runtime() {
        let result = build_team(&TeamConfig::executor("pool", 4), None);
        assert!(result.is_err());
    }
}
