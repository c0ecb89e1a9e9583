//! Service Map
//!
//! An immutable, keyed container of shared services threaded through the
//! environment. Keys are type identities: at most one value of a given type
//! is bound at a time, and lookup is by type.
//!
//! The map is copy-on-write: `add` and `merge` return a new map and never
//! mutate the receiver, so environments can share maps freely.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A shared service value, stored type-erased.
type Entry = Arc<dyn Any + Send + Sync>;

/// An immutable mapping from type tags to shared service values.
#[derive(Clone, Default)]
pub struct ServiceMap {
    entries: HashMap<TypeId, Entry>,
}

impl ServiceMap {
    /// The empty map.
    pub fn empty() -> Self {
        ServiceMap::default()
    }

    /// A new map with `value` bound under its own type, replacing any
    /// previous binding of that type.
    pub fn add<T: Any + Send + Sync>(&self, value: T) -> Self {
        self.add_shared(Arc::new(value))
    }

    /// Like [`add`](ServiceMap::add), but the value is already shared.
    pub fn add_shared<T: Any + Send + Sync>(&self, value: Arc<T>) -> Self {
        let mut entries = self.entries.clone();
        entries.insert(TypeId::of::<T>(), value);
        ServiceMap { entries }
    }

    /// Look up the service bound under type `T`.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.entries
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|entry| entry.downcast::<T>().ok())
    }

    /// Whether a service of type `T` is bound.
    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<T>())
    }

    /// A new map containing the bindings of both maps; `other` wins on
    /// conflicts.
    pub fn merge(&self, other: &ServiceMap) -> Self {
        let mut entries = self.entries.clone();
        for (key, value) in &other.entries {
            entries.insert(*key, value.clone());
        }
        ServiceMap { entries }
    }

    /// Number of bound services.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for ServiceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceMap")
            .field("len", &self.len())
            .finish()
    }
}
