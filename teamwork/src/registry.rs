//! Dependency lookup for coordinating managed objects.
//!
//! A coordinating managed object declares an ordered list of dependencies.
//! The engine resolves them before calling `load_objects` and hands over an
//! [`ObjectRegistry`] that can be queried by key or by position.

use std::any::Any;
use std::sync::Arc;

use crate::error::{Defect, ManagedObjectError};
use crate::managed_object::Object;

/// Key identifying one declared dependency.
///
/// `index` is the position in the declaration order. `name`, when given,
/// must match the key the dependency was declared under.
pub trait DependencyKey {
    fn index(&self) -> usize;

    fn name(&self) -> Option<&str> {
        None
    }
}

impl DependencyKey for usize {
    fn index(&self) -> usize {
        *self
    }
}

/// Declare an enum of dependency keys.
///
/// ```
/// teamwork::dependency_keys! {
///     pub enum ReportKeys {
///         Database => "database",
///         Cache => "cache",
///     }
/// }
///
/// use teamwork::registry::DependencyKey;
/// assert_eq!(ReportKeys::Cache.index(), 1);
/// assert_eq!(ReportKeys::Cache.name(), Some("cache"));
/// ```
#[macro_export]
macro_rules! dependency_keys {
    ($(#[$meta:meta])* $vis:vis enum $name:ident { $($variant:ident => $key:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        $vis enum $name {
            $($variant),+
        }

        impl $crate::registry::DependencyKey for $name {
            fn index(&self) -> usize {
                *self as usize
            }

            fn name(&self) -> Option<&str> {
                match self {
                    $($name::$variant => Some($key)),+
                }
            }
        }
    };
}

#[derive(Clone)]
struct RegistryEntry {
    key: String,
    target: String,
    object: Object,
}

/// Resolved objects of a managed object's declared dependencies.
#[derive(Clone)]
pub struct ObjectRegistry {
    managed_object: String,
    entries: Vec<RegistryEntry>,
}

impl std::fmt::Debug for ObjectRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<_> = self.entries.iter().map(|entry| entry.key.as_str()).collect();
        f.debug_struct("ObjectRegistry")
            .field("managed_object", &self.managed_object)
            .field("keys", &keys)
            .finish()
    }
}

impl ObjectRegistry {
    pub(crate) fn new(managed_object: impl Into<String>) -> Self {
        Self {
            managed_object: managed_object.into(),
            entries: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, key: impl Into<String>, target: impl Into<String>, object: Object) {
        self.entries.push(RegistryEntry {
            key: key.into(),
            target: target.into(),
            object,
        });
    }

    /// The managed object this registry belongs to.
    pub fn managed_object(&self) -> &str {
        &self.managed_object
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Declared keys in declaration order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.key.as_str())
    }

    /// Object of the dependency identified by `key`.
    ///
    /// A key outside the declared dependencies is a defect.
    pub fn get_object<K: DependencyKey + ?Sized>(&self, key: &K) -> Result<Object, Defect> {
        let entry = self.entry_at(key.index())?;
        match key.name() {
            Some(name) if name != entry.key => Err(Defect::UndeclaredDependency {
                managed_object: self.managed_object.clone(),
                key: name.to_string(),
            }),
            _ => Ok(Arc::clone(&entry.object)),
        }
    }

    /// Object of the dependency at `index` in declaration order.
    pub fn get_object_at(&self, index: usize) -> Result<Object, Defect> {
        self.entry_at(index).map(|entry| Arc::clone(&entry.object))
    }

    /// Object of the dependency declared under `key`.
    pub fn get_named(&self, key: &str) -> Result<Object, Defect> {
        self.entries
            .iter()
            .find(|entry| entry.key == key)
            .map(|entry| Arc::clone(&entry.object))
            .ok_or_else(|| Defect::UndeclaredDependency {
                managed_object: self.managed_object.clone(),
                key: key.to_string(),
            })
    }

    /// Typed access to a dependency's object.
    pub fn get<T, K>(&self, key: &K) -> Result<Arc<T>, ManagedObjectError>
    where
        T: Any + Send + Sync,
        K: DependencyKey + ?Sized,
    {
        let index = key.index();
        let object = self.get_object(key)?;
        object
            .downcast::<T>()
            .map_err(|_| ManagedObjectError::ObjectFailed {
                managed_object: self.entries[index].target.clone(),
                source: anyhow::anyhow!(
                    "dependency object is not a {}",
                    std::any::type_name::<T>()
                ),
            })
    }

    fn entry_at(&self, index: usize) -> Result<&RegistryEntry, Defect> {
        self.entries
            .get(index)
            .ok_or_else(|| Defect::DependencyOutOfRange {
                managed_object: self.managed_object.clone(),
                index,
                declared: self.entries.len(),
            })
    }
}
