use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::ThreadId;

use parking_lot::Mutex;

use crate::error::TeamError;
use crate::job::Job;

use super::worker::QueueWorker;
use super::{RejectedJob, Team};

/// Team with a fixed set of worker threads, pinning jobs by affinity key.
///
/// Jobs sharing an [`Job::affinity`] key always run on the same thread, which
/// suits resources that must only be touched by the thread that created
/// them. Jobs without a key are spread round-robin.
#[derive(Clone)]
pub struct AffinityTeam {
    inner: Arc<AffinityInner>,
}

struct AffinityInner {
    name: String,
    worker_count: usize,
    queue_capacity: usize,
    next: AtomicUsize,
    workers: Mutex<Vec<QueueWorker>>,
}

impl std::fmt::Debug for AffinityTeam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AffinityTeam")
            .field("name", &self.inner.name)
            .field("worker_count", &self.inner.worker_count)
            .field("queue_capacity", &self.inner.queue_capacity)
            .finish()
    }
}

impl AffinityTeam {
    pub fn new(name: impl Into<String>, workers: usize, queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(AffinityInner {
                name: name.into(),
                worker_count: workers.max(1),
                queue_capacity,
                next: AtomicUsize::new(0),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Thread that will execute jobs carrying `key`, once started.
    pub fn worker_thread(&self, key: u64) -> Option<ThreadId> {
        let workers = self.inner.workers.lock();
        workers
            .get(self.slot_for(Some(key)))
            .map(QueueWorker::thread_id)
    }

    fn slot_for(&self, key: Option<u64>) -> usize {
        match key {
            Some(key) => (key % self.inner.worker_count as u64) as usize,
            None => self.inner.next.fetch_add(1, Ordering::Relaxed) % self.inner.worker_count,
        }
    }
}

impl Team for AffinityTeam {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn start_working(&self) -> Result<(), TeamError> {
        let mut workers = self.inner.workers.lock();
        if !workers.is_empty() {
            return Ok(());
        }
        for index in 0..self.inner.worker_count {
            let handle: Arc<dyn Team> = Arc::new(self.clone());
            let worker = QueueWorker::spawn(
                handle,
                format!("team-{}-{index}", self.inner.name),
                self.inner.queue_capacity,
            );
            match worker {
                Ok(worker) => workers.push(worker),
                Err(err) => {
                    for worker in workers.drain(..) {
                        worker.stop();
                    }
                    return Err(err);
                }
            }
        }
        tracing::info!(
            team = %self.inner.name,
            workers = self.inner.worker_count,
            "affinity team started"
        );
        Ok(())
    }

    fn assign_job(&self, job: Box<dyn Job>) -> Result<(), RejectedJob> {
        let slot = self.slot_for(job.affinity());
        let workers = self.inner.workers.lock();
        match workers.get(slot) {
            Some(worker) => worker.try_assign(job, &self.inner.name),
            None => Err(RejectedJob::not_working(job, &self.inner.name)),
        }
    }

    fn stop_working(&self) {
        let workers = std::mem::take(&mut *self.inner.workers.lock());
        if workers.is_empty() {
            return;
        }
        for worker in workers {
            worker.stop();
        }
        tracing::info!(team = %self.inner.name, "affinity team stopped");
    }
}
