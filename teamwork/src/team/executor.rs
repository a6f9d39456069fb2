use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tokio::runtime::Handle;

use crate::error::TeamError;
use crate::job::Job;

use super::{RejectedJob, Team, run_job};

const STOP_WAIT: Duration = Duration::from_secs(30);

thread_local! {
    /// Address of the executor team whose job runs on this thread, if any.
    static CURRENT_TEAM: Cell<usize> = const { Cell::new(0) };
}

/// Team backed by the tokio blocking thread pool.
///
/// Threads are created on demand and cached by the runtime between jobs.
/// At most `max_threads` jobs are in flight; further assignments report
/// overload.
#[derive(Clone)]
pub struct ExecutorTeam {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    name: String,
    runtime: Handle,
    max_threads: usize,
    working: AtomicBool,
    in_flight: Mutex<usize>,
    drained: Condvar,
}

impl std::fmt::Debug for ExecutorTeam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorTeam")
            .field("name", &self.inner.name)
            .field("max_threads", &self.inner.max_threads)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl ExecutorTeam {
    pub fn new(name: impl Into<String>, runtime: Handle, max_threads: usize) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                name: name.into(),
                runtime,
                max_threads: max_threads.max(1),
                working: AtomicBool::new(false),
                in_flight: Mutex::new(0),
                drained: Condvar::new(),
            }),
        }
    }

    pub fn in_flight(&self) -> usize {
        *self.inner.in_flight.lock()
    }
}

impl ExecutorInner {
    fn key(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }

    fn finish_one(&self) {
        let mut in_flight = self.in_flight.lock();
        *in_flight = in_flight.saturating_sub(1);
        if *in_flight == 0 {
            self.drained.notify_all();
        }
    }
}

impl Team for ExecutorTeam {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn start_working(&self) -> Result<(), TeamError> {
        self.inner.working.store(true, Ordering::SeqCst);
        tracing::info!(
            team = %self.inner.name,
            max_threads = self.inner.max_threads,
            "executor team started"
        );
        Ok(())
    }

    fn assign_job(&self, job: Box<dyn Job>) -> Result<(), RejectedJob> {
        if !self.inner.working.load(Ordering::SeqCst) {
            return Err(RejectedJob::not_working(job, &self.inner.name));
        }
        {
            let mut in_flight = self.inner.in_flight.lock();
            if *in_flight >= self.inner.max_threads {
                return Err(RejectedJob::overloaded(job, &self.inner.name));
            }
            *in_flight += 1;
        }

        let team: Arc<dyn Team> = Arc::new(self.clone());
        let inner = Arc::clone(&self.inner);
        // Dropping the JoinHandle detaches the task; completion is tracked
        // through `in_flight`.
        drop(self.inner.runtime.spawn_blocking(move || {
            let previous = CURRENT_TEAM.replace(inner.key());
            let mut next = Some(job);
            while let Some(job) = next.take() {
                next = run_job(&team, job);
            }
            CURRENT_TEAM.set(previous);
            inner.finish_one();
        }));
        Ok(())
    }

    fn stop_working(&self) {
        self.inner.working.store(false, Ordering::SeqCst);
        // A job stopping its own team cannot wait for itself.
        let own = usize::from(CURRENT_TEAM.get() == self.inner.key());
        let mut in_flight = self.inner.in_flight.lock();
        while *in_flight > own {
            if self
                .inner
                .drained
                .wait_for(&mut in_flight, STOP_WAIT)
                .timed_out()
            {
                tracing::warn!(
                    team = %self.inner.name,
                    in_flight = *in_flight,
                    "executor team stopped with jobs still in flight"
                );
                break;
            }
        }
        tracing::info!(team = %self.inner.name, "executor team stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use crate::team::tests::StepJob;

    #[test]
    fn test_executes_on_blocking_pool() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let team = ExecutorTeam::new("pool", runtime.handle().clone(), 4);
        team.start_working().unwrap();

        let counters: Vec<_> = (0..4)
            .map(|_| {
                let job = StepJob::new(2);
                let executions = Arc::clone(&job.executions);
                team.assign_job(Box::new(job)).unwrap();
                executions
            })
            .collect();

        team.stop_working();
        assert_eq!(team.in_flight(), 0);
        for executions in counters {
            assert_eq!(executions.load(Ordering::SeqCst), 2);
        }
    }

    struct StopOwnTeam {
        id: crate::job::JobId,
        elapsed: std::sync::mpsc::Sender<Duration>,
    }

    impl Job for StopOwnTeam {
        fn id(&self) -> crate::job::JobId {
            self.id
        }

        fn execute(&mut self, context: &mut crate::job::JobContext) -> bool {
            let started = std::time::Instant::now();
            context.team().stop_working();
            let _ = self.elapsed.send(started.elapsed());
            true
        }

        fn escalate(&mut self, _escalation: crate::error::Escalation) {}
    }

    #[test]
    fn test_job_stopping_its_own_team_does_not_wait_for_itself() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let team = ExecutorTeam::new("pool", runtime.handle().clone(), 2);
        team.start_working().unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        team.assign_job(Box::new(StopOwnTeam {
            id: crate::job::JobId::new(),
            elapsed: tx,
        }))
        .unwrap();

        let elapsed = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(elapsed < Duration::from_secs(5), "stop waited {elapsed:?}");
        team.stop_working();
        assert_eq!(team.in_flight(), 0);
        assert!(team.assign_job(Box::new(StepJob::new(1))).is_err());
    }

    #[test]
    fn test_stopped_executor_rejects() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let team = ExecutorTeam::new("pool", runtime.handle().clone(), 1);
        let rejected = team.assign_job(Box::new(StepJob::new(1))).unwrap_err();
        assert!(matches!(rejected.reason, TeamError::NotWorking { .. }));
    }
}
