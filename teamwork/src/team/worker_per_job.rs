use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::error::TeamError;
use crate::job::Job;

use super::{RejectedJob, Team, run_job};

/// Team spawning a fresh thread for every assigned job.
///
/// The job keeps its thread for as long as it continues without a handover.
/// `max_workers` bounds the number of live threads; beyond it the team
/// reports overload.
#[derive(Clone)]
pub struct WorkerPerJobTeam {
    inner: Arc<WorkerPerJobInner>,
}

struct WorkerPerJobInner {
    name: String,
    max_workers: usize,
    working: AtomicBool,
    active: AtomicUsize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerPerJobTeam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPerJobTeam")
            .field("name", &self.inner.name)
            .field("max_workers", &self.inner.max_workers)
            .field("active", &self.active_workers())
            .finish()
    }
}

impl WorkerPerJobTeam {
    pub fn new(name: impl Into<String>, max_workers: usize) -> Self {
        Self {
            inner: Arc::new(WorkerPerJobInner {
                name: name.into(),
                max_workers: max_workers.max(1),
                working: AtomicBool::new(false),
                active: AtomicUsize::new(0),
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn active_workers(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    fn reserve_worker(&self) -> bool {
        self.inner
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                (active < self.inner.max_workers).then_some(active + 1)
            })
            .is_ok()
    }
}

impl Team for WorkerPerJobTeam {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn start_working(&self) -> Result<(), TeamError> {
        self.inner.working.store(true, Ordering::SeqCst);
        tracing::info!(team = %self.inner.name, "worker per job team started");
        Ok(())
    }

    fn assign_job(&self, job: Box<dyn Job>) -> Result<(), RejectedJob> {
        if !self.inner.working.load(Ordering::SeqCst) {
            return Err(RejectedJob::not_working(job, &self.inner.name));
        }
        if !self.reserve_worker() {
            return Err(RejectedJob::overloaded(job, &self.inner.name));
        }

        let team: Arc<dyn Team> = Arc::new(self.clone());
        let inner = Arc::clone(&self.inner);
        // Held outside the closure so a failed spawn can hand the job back.
        let slot = Arc::new(Mutex::new(Some(job)));
        let thread_slot = Arc::clone(&slot);
        let spawned = thread::Builder::new()
            .name(format!("team-{}-job", self.inner.name))
            .spawn(move || {
                let mut next = thread_slot.lock().take();
                while let Some(job) = next.take() {
                    next = run_job(&team, job);
                }
                inner.active.fetch_sub(1, Ordering::SeqCst);
            });

        match spawned {
            Ok(handle) => {
                let mut handles = self.inner.handles.lock();
                handles.retain(|handle| !handle.is_finished());
                handles.push(handle);
                Ok(())
            }
            Err(source) => {
                self.inner.active.fetch_sub(1, Ordering::SeqCst);
                let reason = TeamError::Spawn {
                    team: self.inner.name.clone(),
                    source,
                };
                match slot.lock().take() {
                    Some(job) => Err(RejectedJob::new(job, reason)),
                    None => Ok(()),
                }
            }
        }
    }

    fn stop_working(&self) {
        self.inner.working.store(false, Ordering::SeqCst);
        let handles = std::mem::take(&mut *self.inner.handles.lock());
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!(team = %self.inner.name, "job thread panicked outside of job execution");
            }
        }
        tracing::info!(team = %self.inner.name, "worker per job team stopped");
    }
}
