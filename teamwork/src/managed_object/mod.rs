//! Managed objects: engine-governed wrappers around resources.
//!
//! Every managed object offers a plain accessor. The optional capabilities
//! are separate traits, probed through the `as_*` methods when the object is
//! handed to the engine, so an implementation opts into exactly the ones it
//! needs:
//!
//! - [`ContextAwareManagedObject`] receives a [`ManagedObjectContext`].
//! - [`AsynchronousManagedObject`] receives an [`AsynchronousContext`].
//! - [`CoordinatingManagedObject`] receives an [`ObjectRegistry`] of its
//!   dependencies.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::registry::ObjectRegistry;

mod container;
mod context;
mod source;

pub use container::{ManagedObjectContainer, ManagedObjectMetaData, ParkedJob, Readiness};
pub use context::{AsynchronousContext, ManagedObjectContext};
pub use source::{ManagedObjectSource, ManagedObjectUser};

/// The underlying resource object handed to tasks and dependents.
pub type Object = Arc<dyn Any + Send + Sync>;

/// Lifecycle of a managed object within one process.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Being constructed or obtained; not safe to read.
    Sourcing,
    /// The accessor may be called.
    Ready,
    /// An asynchronous operation is in progress; dependent jobs suspend.
    AsyncPending,
    /// Released; no further use.
    Recycled,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Sourcing => "sourcing",
            LifecycleState::Ready => "ready",
            LifecycleState::AsyncPending => "async_pending",
            LifecycleState::Recycled => "recycled",
        }
    }

    /// Whether a job reading the object must suspend.
    pub fn is_pending(&self) -> bool {
        matches!(self, LifecycleState::Sourcing | LifecycleState::AsyncPending)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Base capability: a plain accessor for the underlying object.
pub trait ManagedObject: Send + Sync + 'static {
    fn object(&self) -> anyhow::Result<Object>;

    fn as_context_aware(&self) -> Option<&dyn ContextAwareManagedObject> {
        None
    }

    fn as_asynchronous(&self) -> Option<&dyn AsynchronousManagedObject> {
        None
    }

    fn as_coordinating(&self) -> Option<&dyn CoordinatingManagedObject> {
        None
    }

    /// Release the resource. Called once when the owning process ends.
    fn recycle(&self) {}
}

/// Receives identity, a log span and process-safe execution before first use.
pub trait ContextAwareManagedObject: Send + Sync {
    fn set_managed_object_context(&self, context: ManagedObjectContext);
}

/// Performs operations whose completion is reported out-of-band.
pub trait AsynchronousManagedObject: Send + Sync {
    fn set_asynchronous_context(&self, context: AsynchronousContext);
}

/// Obtains the objects of its declared dependencies.
///
/// `load_objects` runs once all dependencies are ready. Any references taken
/// from the registry must be dropped in `unload_objects`, which runs before
/// the object is recycled.
pub trait CoordinatingManagedObject: Send + Sync {
    fn load_objects(&self, registry: &ObjectRegistry) -> anyhow::Result<()>;

    fn unload_objects(&self);
}
