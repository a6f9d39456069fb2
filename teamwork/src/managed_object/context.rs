use std::convert::Infallible;
use std::fmt::{Debug, Display};
use std::sync::{Arc, Weak};

use tracing::Span;

use crate::error::{AsynchronousError, Defect};
use crate::process::{ProcessAwareContext, ProcessId, ProcessState};
use crate::telemetry;

use super::container::ManagedObjectContainer;
use super::LifecycleState;

/// Identity, logger and process-safe execution for a managed object.
#[derive(Clone, Debug)]
pub struct ManagedObjectContext {
    name: String,
    process: ProcessAwareContext,
    span: Span,
}

impl ManagedObjectContext {
    pub(crate) fn new(name: &str, process: Arc<ProcessState>) -> Self {
        let span = telemetry::managed_object_span(name, process.id().to_string());
        Self {
            name: name.to_string(),
            process: ProcessAwareContext::new(process),
            span,
        }
    }

    /// Name the managed object is bound under.
    pub fn bound_name(&self) -> &str {
        &self.name
    }

    /// Span to log under.
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn process_id(&self) -> ProcessId {
        self.process.process_id()
    }

    /// Run `operation` exclusively with respect to the owning process.
    pub fn run<T, E, F>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let _enter = self.span.enter();
        self.process.run(operation)
    }
}

/// Lets a managed object report asynchronous operations.
///
/// Between `start` and `complete` the object is pending and jobs depending
/// on it are suspended. Both calls may come from any thread.
#[derive(Clone)]
pub struct AsynchronousContext {
    name: String,
    container: Weak<ManagedObjectContainer>,
}

impl Debug for AsynchronousContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsynchronousContext")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl AsynchronousContext {
    pub(crate) fn new(container: &Arc<ManagedObjectContainer>) -> Self {
        Self {
            name: container.name().to_string(),
            container: Arc::downgrade(container),
        }
    }

    /// Current state, or `None` once the owning process is gone.
    pub fn state(&self) -> Option<LifecycleState> {
        self.container.upgrade().map(|container| container.state())
    }

    /// Run `operation` and mark the object pending.
    ///
    /// If `operation` fails, its error is returned and the object stays
    /// ready. Starting while an operation is already pending is a defect.
    pub fn start<E, F>(&self, operation: F) -> Result<(), AsynchronousError<E>>
    where
        E: Debug + Display,
        F: FnOnce() -> Result<(), E>,
    {
        match self.container.upgrade() {
            Some(container) => container.start_operation(operation),
            None => {
                tracing::warn!(managed_object = %self.name, "asynchronous start after process ended");
                Ok(())
            }
        }
    }

    /// Mark the object pending without running anything.
    pub fn start_bare(&self) -> Result<(), Defect> {
        match self.start(|| Ok::<(), Infallible>(())) {
            Ok(()) => Ok(()),
            Err(AsynchronousError::Defect(defect)) => Err(defect),
            Err(AsynchronousError::Operation(never)) => match never {},
        }
    }

    /// Run `operation`, mark the object ready and reactivate parked jobs.
    ///
    /// The object becomes ready even if `operation` fails; the error is
    /// returned afterwards. Completing when nothing is pending logs a warning
    /// and does not run `operation`.
    pub fn complete<E, F>(&self, operation: F) -> Result<(), E>
    where
        F: FnOnce() -> Result<(), E>,
    {
        match self.container.upgrade() {
            Some(container) => container.complete_operation(operation),
            None => {
                tracing::warn!(managed_object = %self.name, "asynchronous completion after process ended");
                Ok(())
            }
        }
    }

    /// Mark the object ready without running anything.
    pub fn complete_bare(&self) {
        let completed: Result<(), Infallible> = self.complete(|| Ok(()));
        if let Err(never) = completed {
            match never {}
        }
    }
}
