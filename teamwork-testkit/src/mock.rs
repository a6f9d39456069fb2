use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use teamwork::{Job, JobId, RejectedJob, Team, TeamError, run_job};

/// How a [`RecordingTeam`] treats accepted jobs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TeamMode {
    /// Run the job on the assigning thread.
    Inline,
    /// Keep the job until [`RecordingTeam::release`] is called.
    Hold,
}

/// Team that records every assignment.
///
/// It can also refuse a number of upcoming assignments as overloaded, to
/// exercise retry paths.
pub struct RecordingTeam {
    name: String,
    mode: TeamMode,
    this: Weak<RecordingTeam>,
    assigned: Mutex<Vec<JobId>>,
    held: Mutex<VecDeque<Box<dyn Job>>>,
    refusals: AtomicUsize,
    rejected: AtomicUsize,
    working: AtomicBool,
}

impl std::fmt::Debug for RecordingTeam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingTeam")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("assigned", &self.assigned.lock().len())
            .field("held", &self.held.lock().len())
            .finish()
    }
}

impl RecordingTeam {
    pub fn new(name: impl Into<String>, mode: TeamMode) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|this| Self {
            name,
            mode,
            this: this.clone(),
            assigned: Mutex::new(Vec::new()),
            held: Mutex::new(VecDeque::new()),
            refusals: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
            working: AtomicBool::new(false),
        })
    }

    pub fn inline(name: impl Into<String>) -> Arc<Self> {
        Self::new(name, TeamMode::Inline)
    }

    pub fn holding(name: impl Into<String>) -> Arc<Self> {
        Self::new(name, TeamMode::Hold)
    }

    /// Refuse the next `count` assignments as overloaded.
    pub fn refuse_next(&self, count: usize) {
        self.refusals.store(count, Ordering::SeqCst);
    }

    /// Accepted assignments, oldest first.
    pub fn assigned(&self) -> Vec<JobId> {
        self.assigned.lock().clone()
    }

    pub fn assignment_count(&self) -> usize {
        self.assigned.lock().len()
    }

    pub fn rejected_count(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    /// Run every held job on the calling thread. Returns how many ran.
    pub fn release(&self) -> usize {
        let jobs: Vec<_> = self.held.lock().drain(..).collect();
        let count = jobs.len();
        for job in jobs {
            self.run_to_handover(job);
        }
        count
    }

    pub fn assert_assigned_eq(&self, expected: usize) {
        let actual = self.assignment_count();
        assert_eq!(actual, expected, "Expected {expected} assignments, got {actual}");
    }

    fn run_to_handover(&self, job: Box<dyn Job>) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let team: Arc<dyn Team> = this;
        let mut next = Some(job);
        while let Some(job) = next.take() {
            next = run_job(&team, job);
        }
    }
}

impl Team for RecordingTeam {
    fn name(&self) -> &str {
        &self.name
    }

    fn start_working(&self) -> Result<(), TeamError> {
        self.working.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn assign_job(&self, job: Box<dyn Job>) -> Result<(), RejectedJob> {
        if !self.working.load(Ordering::SeqCst) {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(RejectedJob::not_working(job, &self.name));
        }
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(RejectedJob::overloaded(job, &self.name));
        }

        self.assigned.lock().push(job.id());
        match self.mode {
            TeamMode::Inline => self.run_to_handover(job),
            TeamMode::Hold => self.held.lock().push_back(job),
        }
        Ok(())
    }

    fn stop_working(&self) {
        self.working.store(false, Ordering::SeqCst);
        let held = self.release();
        if held > 0 {
            tracing::debug!(team = %self.name, held, "ran held jobs on stop");
        }
    }
}
