use std::sync::Arc;

use crate::error::Defect;
use crate::process::ProcessId;

use super::container::ManagedObjectContainer;
use super::ManagedObject;

/// Produces the managed object for a container.
///
/// Called on the thread of the first job that needs the object. The source
/// may hand the object over immediately or keep the [`ManagedObjectUser`]
/// and call it later from any thread.
pub trait ManagedObjectSource: Send + Sync + 'static {
    fn source_managed_object(&self, user: ManagedObjectUser);
}

impl<F> ManagedObjectSource for F
where
    F: Fn(ManagedObjectUser) + Send + Sync + 'static,
{
    fn source_managed_object(&self, user: ManagedObjectUser) {
        self(user)
    }
}

/// Receives the outcome of sourcing.
#[derive(Clone)]
pub struct ManagedObjectUser {
    container: Arc<ManagedObjectContainer>,
}

impl std::fmt::Debug for ManagedObjectUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedObjectUser")
            .field("managed_object", &self.container.name())
            .finish()
    }
}

impl ManagedObjectUser {
    pub(crate) fn new(container: Arc<ManagedObjectContainer>) -> Self {
        Self { container }
    }

    pub fn managed_object_name(&self) -> &str {
        self.container.name()
    }

    pub fn process_id(&self) -> ProcessId {
        self.container.process_id()
    }

    /// Hand over the sourced object; it becomes ready.
    pub fn set_managed_object<M: ManagedObject>(&self, managed_object: M) -> Result<(), Defect> {
        self.container.set_managed_object(Arc::new(managed_object))
    }

    /// Hand over a shared object; it becomes ready.
    pub fn set_shared_managed_object(
        &self,
        managed_object: Arc<dyn ManagedObject>,
    ) -> Result<(), Defect> {
        self.container.set_managed_object(managed_object)
    }

    /// Report that the object could not be sourced.
    ///
    /// Jobs waiting on it are escalated with the failure.
    pub fn set_failure(&self, failure: impl Into<anyhow::Error>) {
        self.container.set_failure(failure.into());
    }
}
