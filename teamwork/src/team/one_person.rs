use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::TeamError;
use crate::job::Job;

use super::worker::QueueWorker;
use super::{RejectedJob, Team};

/// Team with a single dedicated worker thread.
///
/// Jobs run one at a time in assignment order.
#[derive(Clone)]
pub struct OnePersonTeam {
    inner: Arc<OnePersonInner>,
}

struct OnePersonInner {
    name: String,
    queue_capacity: usize,
    worker: Mutex<Option<QueueWorker>>,
}

impl std::fmt::Debug for OnePersonTeam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnePersonTeam")
            .field("name", &self.inner.name)
            .field("queue_capacity", &self.inner.queue_capacity)
            .field("working", &self.is_working())
            .finish()
    }
}

impl OnePersonTeam {
    pub fn new(name: impl Into<String>, queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(OnePersonInner {
                name: name.into(),
                queue_capacity,
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn is_working(&self) -> bool {
        self.inner.worker.lock().is_some()
    }
}

impl Team for OnePersonTeam {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn start_working(&self) -> Result<(), TeamError> {
        let mut worker = self.inner.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        let handle: Arc<dyn Team> = Arc::new(self.clone());
        *worker = Some(QueueWorker::spawn(
            handle,
            format!("team-{}", self.inner.name),
            self.inner.queue_capacity,
        )?);
        tracing::info!(team = %self.inner.name, "one person team started");
        Ok(())
    }

    fn assign_job(&self, job: Box<dyn Job>) -> Result<(), RejectedJob> {
        match self.inner.worker.lock().as_ref() {
            Some(worker) => worker.try_assign(job, &self.inner.name),
            None => Err(RejectedJob::not_working(job, &self.inner.name)),
        }
    }

    fn stop_working(&self) {
        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            worker.stop();
            tracing::info!(team = %self.inner.name, "one person team stopped");
        }
    }
}
