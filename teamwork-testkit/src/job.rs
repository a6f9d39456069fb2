use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use teamwork::{Escalation, Job, JobContext, JobId};

/// Job finishing after a fixed number of steps.
pub struct CountingJob {
    id: JobId,
    remaining: usize,
    affinity: Option<u64>,
    probe: JobProbe,
}

/// Shared view of what happened to a [`CountingJob`].
#[derive(Clone, Debug, Default)]
pub struct JobProbe {
    executions: Arc<AtomicUsize>,
    escalations: Arc<Mutex<Vec<String>>>,
    threads: Arc<Mutex<Vec<std::thread::ThreadId>>>,
}

impl CountingJob {
    pub fn new(steps: usize) -> Self {
        Self {
            id: JobId::new(),
            remaining: steps,
            affinity: None,
            probe: JobProbe::default(),
        }
    }

    pub fn with_affinity(mut self, key: u64) -> Self {
        self.affinity = Some(key);
        self
    }

    pub fn probe(&self) -> JobProbe {
        self.probe.clone()
    }

    pub fn boxed(self) -> Box<dyn Job> {
        Box::new(self)
    }
}

impl Job for CountingJob {
    fn id(&self) -> JobId {
        self.id
    }

    fn execute(&mut self, _context: &mut JobContext) -> bool {
        self.probe.executions.fetch_add(1, Ordering::SeqCst);
        self.probe.threads.lock().push(std::thread::current().id());
        self.remaining = self.remaining.saturating_sub(1);
        self.remaining == 0
    }

    fn escalate(&mut self, escalation: Escalation) {
        self.probe.escalations.lock().push(escalation.kind().to_string());
    }

    fn affinity(&self) -> Option<u64> {
        self.affinity
    }
}

impl JobProbe {
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    /// Kinds of the escalations received, in order.
    pub fn escalations(&self) -> Vec<String> {
        self.escalations.lock().clone()
    }

    /// Threads that ran each step.
    pub fn threads(&self) -> Vec<std::thread::ThreadId> {
        self.threads.lock().clone()
    }

    pub fn assert_executions_eq(&self, expected: usize) {
        let actual = self.executions();
        assert_eq!(actual, expected, "Expected {expected} executions, got {actual}");
    }
}
