//! Activation storage for the container
//!
//! Uses DashMap for lock-free concurrent access, keyed by the activation
//! type's `TypeId`, with an optional parent for hierarchical lookup.

use crate::config::ActivationConfiguration;
use crate::expression::ActivationExpression;
use crate::Result;
use ahash::RandomState;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use std::any::TypeId;
use std::sync::Arc;

/// One configured activation and its compiled form.
///
/// The construction expression is wrapped for disposal the first time the
/// type is activated; every later activation reuses the compiled expression.
pub(crate) struct Registration {
    configuration: ActivationConfiguration,
    construction: ActivationExpression,
    compiled: OnceCell<ActivationExpression>,
}

impl Registration {
    #[inline]
    pub fn new(configuration: ActivationConfiguration, construction: ActivationExpression) -> Self {
        Self {
            configuration,
            construction,
            compiled: OnceCell::new(),
        }
    }

    #[inline]
    pub fn configuration(&self) -> &ActivationConfiguration {
        &self.configuration
    }

    #[inline]
    pub fn construction(&self) -> &ActivationExpression {
        &self.construction
    }

    /// The compiled expression, compiling it with `compile` on first use.
    ///
    /// Concurrent first activations block on a single compilation.
    #[inline]
    pub fn compiled_or_init<F>(&self, compile: F) -> Result<ActivationExpression>
    where
        F: FnOnce(&Self) -> Result<ActivationExpression>,
    {
        self.compiled.get_or_try_init(|| compile(self)).cloned()
    }

    #[inline]
    pub fn is_compiled(&self) -> bool {
        self.compiled.get().is_some()
    }
}

/// Thread-safe storage for activation registrations.
pub(crate) struct ActivationStorage {
    registrations: DashMap<TypeId, Arc<Registration>, RandomState>,
    parent: Option<Arc<ActivationStorage>>,
}

impl ActivationStorage {
    /// Create new empty storage.
    ///
    /// Uses 8 shards; containers rarely hold more than a few dozen types.
    #[inline]
    pub fn new() -> Self {
        Self {
            registrations: DashMap::with_capacity_and_hasher_and_shard_amount(
                0,
                RandomState::new(),
                8,
            ),
            parent: None,
        }
    }

    /// Create a child storage with a parent reference for hierarchical lookup.
    #[inline]
    pub fn with_parent(parent: Arc<ActivationStorage>) -> Self {
        Self {
            parent: Some(parent),
            ..Self::new()
        }
    }

    /// Insert a registration, replacing any previous one for the same type
    #[inline]
    pub fn insert(&self, registration: Registration) {
        let type_id = registration.configuration().activation_type().id();
        self.registrations.insert(type_id, Arc::new(registration));
    }

    /// Local lookup
    #[inline]
    pub fn get(&self, type_id: &TypeId) -> Option<Arc<Registration>> {
        self.registrations.get(type_id).map(|r| Arc::clone(r.value()))
    }

    /// Lookup walking the full parent chain.
    ///
    /// Returns the registration from the nearest scope that has one.
    pub fn get_from_chain(&self, type_id: &TypeId) -> Option<Arc<Registration>> {
        if let Some(registration) = self.get(type_id) {
            return Some(registration);
        }

        let mut current = self.parent.as_ref();
        while let Some(storage) = current {
            if let Some(registration) = storage.get(type_id) {
                return Some(registration);
            }
            current = storage.parent.as_ref();
        }

        None
    }

    /// Check if a type is registered here or in any parent.
    #[inline]
    pub fn contains_in_chain(&self, type_id: &TypeId) -> bool {
        self.get_from_chain(type_id).is_some()
    }

    /// Get number of local registrations
    #[inline]
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Check if empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Remove a registration
    #[inline]
    pub fn remove(&self, type_id: &TypeId) -> bool {
        self.registrations.remove(type_id).is_some()
    }
}

impl Default for ActivationStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ActivationStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivationStorage")
            .field("count", &self.len())
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Disposable;

    struct Service;

    impl Disposable for Service {
        fn dispose(&self) {}
    }

    fn registration() -> Registration {
        Registration::new(
            ActivationConfiguration::new::<Service>(),
            ActivationExpression::from_fn(|| Service),
        )
    }

    #[test]
    fn test_storage_insert_and_get() {
        let storage = ActivationStorage::new();
        let type_id = TypeId::of::<Service>();

        assert!(storage.get(&type_id).is_none());
        storage.insert(registration());
        assert!(storage.get(&type_id).is_some());
        assert_eq!(storage.len(), 1);

        storage.remove(&type_id);
        assert!(storage.is_empty());
    }

    #[test]
    fn test_storage_parent_chain() {
        let root = Arc::new(ActivationStorage::new());
        root.insert(registration());

        let child = ActivationStorage::with_parent(Arc::clone(&root));
        let grandchild = ActivationStorage::with_parent(Arc::new(child));

        assert!(grandchild.contains_in_chain(&TypeId::of::<Service>()));
        assert!(grandchild.get(&TypeId::of::<Service>()).is_none());
    }

    #[test]
    fn test_compiles_once() {
        let reg = registration();
        let mut compiles = 0;

        for _ in 0..3 {
            reg.compiled_or_init(|r| {
                compiles += 1;
                Ok(r.construction().clone())
            })
            .unwrap();
        }

        assert_eq!(compiles, 1);
        assert!(reg.is_compiled());
    }
}
