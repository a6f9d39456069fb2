//! Process-safe operations.
//!
//! A process is the unit of shared state that jobs and managed objects
//! mutate together. Each process owns a re-entrant lock: a job step holds it
//! for the duration of the step, so operations run from the job's own thread
//! re-enter for free, while operations arriving from foreign threads (for
//! example an I/O completion callback) wait until the step has finished.
//!
//! Taking the lock at the start of a step is not free, but when no foreign
//! thread is inside the process it is a single uncontended acquire
//! (`try_lock` succeeds). Only entries that actually had to wait are counted
//! as contended. In exchange, a completion callback can never observe or
//! mutate process state halfway through a step, and a resumed job always
//! sees everything the callback wrote before it reactivated the job.

use std::fmt::{self, Display};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::telemetry;

/// Identity of a process.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ProcessId(pub Uuid);

impl Default for ProcessId {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shared process state guarding process-safe operations.
#[derive(Debug)]
pub struct ProcessState {
    id: ProcessId,
    lock: ReentrantMutex<()>,
    contended: AtomicU64,
}

/// Held while a job step or a process-safe operation is running.
pub struct ProcessGuard<'a> {
    _guard: ReentrantMutexGuard<'a, ()>,
}

impl ProcessState {
    pub fn new() -> Self {
        Self::with_id(ProcessId::new())
    }

    pub fn with_id(id: ProcessId) -> Self {
        Self {
            id,
            lock: ReentrantMutex::new(()),
            contended: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// Enter the process, waiting for any other thread to leave it.
    pub fn enter(&self) -> ProcessGuard<'_> {
        if let Some(guard) = self.lock.try_lock() {
            return ProcessGuard { _guard: guard };
        }
        self.contended.fetch_add(1, Ordering::Relaxed);
        telemetry::record_process_contention(self.id.to_string());
        ProcessGuard {
            _guard: self.lock.lock(),
        }
    }

    /// Run `operation` exclusively with respect to the process.
    ///
    /// Any error from `operation` is returned unchanged.
    pub fn run<T, E, F>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let _guard = self.enter();
        operation()
    }

    /// Number of times a thread had to wait to enter the process.
    pub fn contended_entries(&self) -> u64 {
        self.contended.load(Ordering::Relaxed)
    }
}

impl Default for ProcessState {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle given to managed objects for running process-safe operations.
#[derive(Clone, Debug)]
pub struct ProcessAwareContext {
    process: Arc<ProcessState>,
}

impl ProcessAwareContext {
    pub fn new(process: Arc<ProcessState>) -> Self {
        Self { process }
    }

    pub fn process_id(&self) -> ProcessId {
        self.process.id()
    }

    /// Run `operation` exclusively with respect to the owning process.
    pub fn run<T, E, F>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        self.process.run(operation)
    }
}
