use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use teamwork::{
    AsynchronousContext, AsynchronousManagedObject, ContextAwareManagedObject,
    CoordinatingManagedObject, Defect, LifecycleState, ManagedObject, ManagedObjectContext,
    ManagedObjectSource, ManagedObjectUser, Object, ObjectRegistry,
};

/// Managed object whose asynchronous operations are driven by the test.
///
/// The test calls [`begin`](Self::begin) and [`finish`](Self::finish) from
/// any thread to move the object between ready and pending.
pub struct ScriptedResource {
    object: Object,
    start_on_grant: bool,
    asynchronous: Mutex<Option<AsynchronousContext>>,
    context: Mutex<Option<ManagedObjectContext>>,
    recycled: AtomicUsize,
}

impl std::fmt::Debug for ScriptedResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedResource")
            .field("start_on_grant", &self.start_on_grant)
            .field("state", &self.state())
            .field("recycled", &self.recycle_count())
            .finish()
    }
}

impl ScriptedResource {
    /// A resource whose object is `object`.
    pub fn new<T: std::any::Any + Send + Sync>(object: T) -> Arc<Self> {
        Arc::new(Self::build(Arc::new(object), false))
    }

    /// A resource that starts an operation as soon as it is granted its
    /// asynchronous context, so its first user parks.
    pub fn starting<T: std::any::Any + Send + Sync>(object: T) -> Arc<Self> {
        Arc::new(Self::build(Arc::new(object), true))
    }

    fn build(object: Object, start_on_grant: bool) -> Self {
        Self {
            object,
            start_on_grant,
            asynchronous: Mutex::new(None),
            context: Mutex::new(None),
            recycled: AtomicUsize::new(0),
        }
    }

    /// The granted asynchronous context, once the object is ready.
    pub fn asynchronous_context(&self) -> Option<AsynchronousContext> {
        self.asynchronous.lock().clone()
    }

    pub fn managed_object_context(&self) -> Option<ManagedObjectContext> {
        self.context.lock().clone()
    }

    /// Start an operation that does no work.
    pub fn begin(&self) -> Result<(), Defect> {
        match self.asynchronous_context() {
            Some(context) => context.start_bare(),
            None => panic!("asynchronous context not granted yet"),
        }
    }

    /// Complete the pending operation.
    pub fn finish(&self) {
        match self.asynchronous_context() {
            Some(context) => context.complete_bare(),
            None => panic!("asynchronous context not granted yet"),
        }
    }

    /// State as seen through the asynchronous context.
    pub fn state(&self) -> Option<LifecycleState> {
        self.asynchronous_context().and_then(|context| context.state())
    }

    pub fn recycle_count(&self) -> usize {
        self.recycled.load(Ordering::SeqCst)
    }
}

impl ManagedObject for ScriptedResource {
    fn object(&self) -> anyhow::Result<Object> {
        Ok(Arc::clone(&self.object))
    }

    fn as_context_aware(&self) -> Option<&dyn ContextAwareManagedObject> {
        Some(self)
    }

    fn as_asynchronous(&self) -> Option<&dyn AsynchronousManagedObject> {
        Some(self)
    }

    fn recycle(&self) {
        self.recycled.fetch_add(1, Ordering::SeqCst);
    }
}

impl ContextAwareManagedObject for ScriptedResource {
    fn set_managed_object_context(&self, context: ManagedObjectContext) {
        *self.context.lock() = Some(context);
    }
}

impl AsynchronousManagedObject for ScriptedResource {
    fn set_asynchronous_context(&self, context: AsynchronousContext) {
        if self.start_on_grant {
            if let Err(defect) = context.start_bare() {
                tracing::error!(error = %defect, "scripted start on grant failed");
            }
        }
        *self.asynchronous.lock() = Some(context);
    }
}

/// Source handing `resource` over as soon as it is asked.
pub fn immediate_source(resource: Arc<ScriptedResource>) -> impl ManagedObjectSource {
    move |user: ManagedObjectUser| {
        let shared: Arc<dyn ManagedObject> = Arc::clone(&resource) as Arc<dyn ManagedObject>;
        if let Err(defect) = user.set_shared_managed_object(shared) {
            tracing::error!(error = %defect, "immediate source failed");
        }
    }
}

/// Source that keeps every request until the test resolves it.
#[derive(Clone, Default)]
pub struct DeferredSource {
    pending: Arc<Mutex<VecDeque<ManagedObjectUser>>>,
    requests: Arc<AtomicUsize>,
}

impl std::fmt::Debug for DeferredSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredSource")
            .field("pending", &self.pending.lock().len())
            .field("requests", &self.requests())
            .finish()
    }
}

impl DeferredSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times sourcing was requested.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Answer the oldest request with `managed_object`.
    ///
    /// Returns `false` if nothing was pending.
    pub fn resolve(&self, managed_object: Arc<dyn ManagedObject>) -> Result<bool, Defect> {
        let Some(user) = self.pending.lock().pop_front() else {
            return Ok(false);
        };
        user.set_shared_managed_object(managed_object)?;
        Ok(true)
    }

    /// Fail the oldest request.
    pub fn fail(&self, message: &str) -> bool {
        let Some(user) = self.pending.lock().pop_front() else {
            return false;
        };
        user.set_failure(anyhow::anyhow!("{message}"));
        true
    }
}

impl ManagedObjectSource for DeferredSource {
    fn source_managed_object(&self, user: ManagedObjectUser) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.pending.lock().push_back(user);
    }
}

/// Coordinating managed object recording the dependencies it loaded.
#[derive(Default)]
pub struct LinkedResource {
    loaded: Mutex<Vec<(String, Object)>>,
    loads: AtomicUsize,
    unloads: AtomicUsize,
    fail_load: AtomicBool,
}

impl std::fmt::Debug for LinkedResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkedResource")
            .field("loaded", &self.loaded_keys())
            .field("loads", &self.load_count())
            .field("unloads", &self.unload_count())
            .finish()
    }
}

impl LinkedResource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next load report a failure.
    pub fn fail_next_load(&self) {
        self.fail_load.store(true, Ordering::SeqCst);
    }

    pub fn loaded_keys(&self) -> Vec<String> {
        self.loaded.lock().iter().map(|(key, _)| key.clone()).collect()
    }

    /// Typed access to a loaded dependency.
    pub fn dependency<T: std::any::Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let loaded = self.loaded.lock();
        let (_, object) = loaded.iter().find(|(loaded, _)| loaded == key)?;
        Arc::clone(object).downcast::<T>().ok()
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn unload_count(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }
}

impl ManagedObject for LinkedResource {
    fn object(&self) -> anyhow::Result<Object> {
        let keys = self.loaded_keys();
        Ok(Arc::new(keys))
    }

    fn as_coordinating(&self) -> Option<&dyn CoordinatingManagedObject> {
        Some(self)
    }
}

impl CoordinatingManagedObject for LinkedResource {
    fn load_objects(&self, registry: &ObjectRegistry) -> anyhow::Result<()> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_load.swap(false, Ordering::SeqCst) {
            anyhow::bail!("dependency handshake failed");
        }
        let mut loaded = Vec::with_capacity(registry.len());
        for key in registry.keys() {
            loaded.push((key.to_string(), registry.get_named(key)?));
        }
        *self.loaded.lock() = loaded;
        Ok(())
    }

    fn unload_objects(&self) {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        self.loaded.lock().clear();
    }
}
