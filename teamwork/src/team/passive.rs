use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::TeamError;
use crate::job::Job;

use super::{RejectedJob, Team, run_job};

/// Team executing jobs synchronously on the assigning thread.
///
/// Useful in tests and for work that must never leave the caller's thread.
/// A job that continues without a handover is executed again immediately.
#[derive(Clone, Debug)]
pub struct PassiveTeam {
    inner: Arc<PassiveInner>,
}

#[derive(Debug)]
struct PassiveInner {
    name: String,
    working: AtomicBool,
}

impl PassiveTeam {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(PassiveInner {
                name: name.into(),
                working: AtomicBool::new(false),
            }),
        }
    }
}

impl Team for PassiveTeam {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn start_working(&self) -> Result<(), TeamError> {
        self.inner.working.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn assign_job(&self, job: Box<dyn Job>) -> Result<(), RejectedJob> {
        if !self.inner.working.load(Ordering::SeqCst) {
            return Err(RejectedJob::not_working(job, &self.inner.name));
        }
        let team: Arc<dyn Team> = Arc::new(self.clone());
        let mut next = Some(job);
        while let Some(job) = next.take() {
            next = run_job(&team, job);
        }
        Ok(())
    }

    fn stop_working(&self) {
        self.inner.working.store(false, Ordering::SeqCst);
    }
}
