//! Ambient (per unit of work) disposal scopes
//!
//! A [`UnitOfWork`] is the per-request key-value store owned by the
//! surrounding transport layer. The [`AmbientScopeResolver`] reserves one
//! process-unique key in that store and keeps at most one request-lifetime
//! [`DisposalScope`] under it, so that instances activated through the root
//! container during a request are released at the end of that request
//! instead of living as long as the container.
//!
//! # Example
//!
//! ```rust
//! use scoped_disposal::{AmbientScopeResolver, DisposalScope, LifetimeScope, UnitOfWork};
//! use std::sync::Arc;
//!
//! let resolver = AmbientScopeResolver::new();
//! let root: Arc<dyn DisposalScope> = Arc::new(LifetimeScope::container());
//!
//! let request = UnitOfWork::new();
//! resolver.install(&request);
//!
//! let first = resolver.resolve(Arc::clone(&root), Some(&request)).unwrap();
//! let second = resolver.resolve(Arc::clone(&root), Some(&request)).unwrap();
//! assert_eq!(first.id(), second.id());
//! assert_ne!(first.id(), root.id());
//!
//! request.end();
//! assert!(first.is_released());
//! ```

use crate::config::AnyArc;
use crate::{DisposalError, DisposalScope, LifetimeScope, Result, ScopeKind};
use ahash::RandomState;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

#[cfg(feature = "logging")]
use tracing::{debug, trace, warn};

// =============================================================================
// Ambient key
// =============================================================================

static PROCESS_KEY: Lazy<AmbientKey> = Lazy::new(|| AmbientKey::with_suffix("disposal-scope"));

/// A collision-resistant key into a [`UnitOfWork`] store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AmbientKey(Arc<str>);

impl AmbientKey {
    /// The process-wide key used by the default resolver.
    ///
    /// Generated once, on first use, and stable for the life of the process.
    #[inline]
    pub fn process() -> Self {
        PROCESS_KEY.clone()
    }

    /// Generate a fresh key ending in `-{suffix}`.
    pub fn with_suffix(suffix: &str) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{id}-{suffix}").into())
    }

    /// The key as a string.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AmbientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Unit of work
// =============================================================================

/// Hook run once when a unit of work ends
pub type EndHook = Box<dyn FnOnce(&UnitOfWork) + Send>;

struct UnitOfWorkInner {
    id: u64,
    items: DashMap<String, AnyArc, RandomState>,
    end_hooks: Mutex<Vec<EndHook>>,
    ended: AtomicBool,
}

/// Per-unit-of-work key-value store, e.g. one inbound request.
///
/// Cheap to clone; all clones share the same store. Many consumers may share
/// one store, each under its own key.
#[derive(Clone)]
pub struct UnitOfWork {
    inner: Arc<UnitOfWorkInner>,
}

impl UnitOfWork {
    /// Start a new unit of work.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "logging")]
        trace!(
            target: "scoped_disposal",
            unit_of_work = id,
            "Starting unit of work"
        );

        Self {
            inner: Arc::new(UnitOfWorkInner {
                id,
                items: DashMap::with_capacity_and_hasher_and_shard_amount(
                    0,
                    RandomState::new(),
                    4, // a handful of keys per request at most
                ),
                end_hooks: Mutex::new(Vec::new()),
                ended: AtomicBool::new(false),
            }),
        }
    }

    /// Identifier of this unit of work.
    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Look up a value.
    #[inline]
    pub fn get(&self, key: &str) -> Option<AnyArc> {
        self.inner.items.get(key).map(|v| Arc::clone(v.value()))
    }

    /// Store a value, returning the previous one.
    #[inline]
    pub fn insert(&self, key: impl Into<String>, value: AnyArc) -> Option<AnyArc> {
        self.inner.items.insert(key.into(), value)
    }

    /// Remove a value.
    #[inline]
    pub fn remove(&self, key: &str) -> Option<AnyArc> {
        self.inner.items.remove(key).map(|(_, v)| v)
    }

    /// Check if a key is present.
    #[inline]
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.items.contains_key(key)
    }

    /// Number of stored values.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.items.len()
    }

    /// Check if the store is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.items.is_empty()
    }

    /// Atomic entry access for a key.
    ///
    /// The shard holding `key` stays locked until the entry is dropped.
    #[inline]
    pub(crate) fn entry(&self, key: &str) -> Entry<'_, String, AnyArc> {
        self.inner.items.entry(key.to_owned())
    }

    /// Register a hook to run when this unit of work ends.
    ///
    /// A hook registered after the end runs immediately.
    pub fn on_end<F>(&self, hook: F)
    where
        F: FnOnce(&UnitOfWork) + Send + 'static,
    {
        {
            let mut hooks = self.inner.end_hooks.lock().unwrap_or_else(PoisonError::into_inner);
            if !self.is_ended() {
                hooks.push(Box::new(hook));
                return;
            }
        }
        hook(self);
    }

    /// End this unit of work, running end hooks in registration order.
    ///
    /// Only the first call has any effect.
    pub fn end(&self) {
        let hooks = {
            let mut hooks = self.inner.end_hooks.lock().unwrap_or_else(PoisonError::into_inner);
            if self.inner.ended.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *hooks)
        };

        #[cfg(feature = "logging")]
        trace!(
            target: "scoped_disposal",
            unit_of_work = self.inner.id,
            hooks = hooks.len(),
            "Ending unit of work"
        );

        for hook in hooks {
            hook(self);
        }
    }

    /// Whether [`end`](Self::end) has been called.
    #[inline]
    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::Acquire)
    }
}

impl Default for UnitOfWork {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.inner.id)
            .field("items", &self.len())
            .field("ended", &self.is_ended())
            .finish()
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// What the store actually holds under the ambient key
type AmbientSlot = Arc<dyn DisposalScope>;

fn slot_scope(value: &AnyArc) -> Option<Arc<dyn DisposalScope>> {
    value.downcast_ref::<AmbientSlot>().map(Arc::clone)
}

/// Picks the disposal scope that should own instances activated during a
/// unit of work.
#[derive(Debug, Clone)]
pub struct AmbientScopeResolver {
    key: AmbientKey,
}

impl AmbientScopeResolver {
    /// Resolver using the process-wide key.
    #[inline]
    pub fn new() -> Self {
        Self {
            key: AmbientKey::process(),
        }
    }

    /// Resolver using a specific key.
    #[inline]
    pub fn with_key(key: AmbientKey) -> Self {
        Self { key }
    }

    /// The key this resolver reserves in every unit of work.
    #[inline]
    pub fn key(&self) -> &AmbientKey {
        &self.key
    }

    /// Return the scope that should own instances activated through `candidate`.
    ///
    /// Without an active unit of work, or when `candidate` is not a container
    /// (root) scope, `candidate` is returned unchanged. Otherwise the unit of
    /// work's scope is returned, created on first use. Concurrent first calls
    /// within one unit of work create exactly one scope.
    ///
    /// Fails with [`DisposalError::UnitOfWorkEnded`] when the unit of work
    /// has already ended without ever creating a scope.
    pub fn resolve(
        &self,
        candidate: Arc<dyn DisposalScope>,
        unit_of_work: Option<&UnitOfWork>,
    ) -> Result<Arc<dyn DisposalScope>> {
        let Some(unit_of_work) = unit_of_work else {
            return Ok(candidate);
        };
        if candidate.kind() != ScopeKind::Container {
            return Ok(candidate);
        }

        // `ended` is read under the shard lock, so an end hook either sees
        // the inserted scope or this call sees the end.
        match unit_of_work.entry(self.key.as_str()) {
            Entry::Occupied(mut occupied) => {
                if let Some(scope) = slot_scope(occupied.get()) {
                    #[cfg(feature = "logging")]
                    trace!(
                        target: "scoped_disposal",
                        unit_of_work = unit_of_work.id(),
                        scope_id = scope.id().id(),
                        "Ambient scope already cached"
                    );
                    return Ok(scope);
                }

                #[cfg(feature = "logging")]
                warn!(
                    target: "scoped_disposal",
                    unit_of_work = unit_of_work.id(),
                    key = self.key.as_str(),
                    "Foreign value under ambient key, replacing"
                );

                if unit_of_work.is_ended() {
                    return Err(DisposalError::UnitOfWorkEnded {
                        unit_of_work: unit_of_work.id(),
                    });
                }
                let scope = Self::create_scope(unit_of_work);
                occupied.insert(Arc::new(Arc::clone(&scope)) as AnyArc);
                Ok(scope)
            }
            Entry::Vacant(vacant) => {
                if unit_of_work.is_ended() {
                    return Err(DisposalError::UnitOfWorkEnded {
                        unit_of_work: unit_of_work.id(),
                    });
                }
                let scope = Self::create_scope(unit_of_work);
                vacant.insert(Arc::new(Arc::clone(&scope)) as AnyArc);
                Ok(scope)
            }
        }
    }

    fn create_scope(_unit_of_work: &UnitOfWork) -> Arc<dyn DisposalScope> {
        let scope: Arc<dyn DisposalScope> = Arc::new(LifetimeScope::request());

        #[cfg(feature = "logging")]
        debug!(
            target: "scoped_disposal",
            unit_of_work = _unit_of_work.id(),
            scope_id = scope.id().id(),
            "Created ambient disposal scope"
        );

        scope
    }

    /// The scope cached for `unit_of_work`, if one was created.
    pub fn cached(&self, unit_of_work: &UnitOfWork) -> Option<Arc<dyn DisposalScope>> {
        unit_of_work
            .get(self.key.as_str())
            .as_ref()
            .and_then(slot_scope)
    }

    /// Release the scope cached for the given unit of work.
    ///
    /// A no-op when there is no unit of work or nothing was cached. The
    /// released scope stays in the store so that later registrations in the
    /// same unit of work are rejected rather than creating a new scope.
    pub fn release_ambient(&self, unit_of_work: Option<&UnitOfWork>) {
        let Some(unit_of_work) = unit_of_work else {
            #[cfg(feature = "logging")]
            debug!(
                target: "scoped_disposal",
                "No active unit of work, nothing to release"
            );
            return;
        };

        if let Some(scope) = self.cached(unit_of_work) {
            #[cfg(feature = "logging")]
            debug!(
                target: "scoped_disposal",
                unit_of_work = unit_of_work.id(),
                scope_id = scope.id().id(),
                disposables = scope.len(),
                "Releasing ambient disposal scope"
            );
            scope.release();
        }
    }

    /// Release this resolver's scope automatically when `unit_of_work` ends.
    pub fn install(&self, unit_of_work: &UnitOfWork) {
        let resolver = self.clone();
        unit_of_work.on_end(move |ended| resolver.release_ambient(Some(ended)));
    }
}

impl Default for AmbientScopeResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Disposable;
    use std::sync::Barrier;
    use std::sync::atomic::AtomicUsize;

    struct Counted(Arc<AtomicUsize>);

    impl Disposable for Counted {
        fn dispose(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn root() -> Arc<dyn DisposalScope> {
        Arc::new(LifetimeScope::container())
    }

    #[test]
    fn test_process_key_is_stable() {
        assert_eq!(AmbientKey::process(), AmbientKey::process());
        assert!(AmbientKey::process().as_str().ends_with("-disposal-scope"));
        assert_ne!(AmbientKey::with_suffix("x"), AmbientKey::with_suffix("x"));
    }

    #[test]
    fn test_pass_through_without_unit_of_work() {
        let resolver = AmbientScopeResolver::new();
        let root = root();
        let resolved = resolver.resolve(Arc::clone(&root), None).unwrap();
        assert!(Arc::ptr_eq(&resolved, &root));
    }

    #[test]
    fn test_pass_through_for_child_scopes() {
        let resolver = AmbientScopeResolver::new();
        let child: Arc<dyn DisposalScope> = Arc::new(LifetimeScope::lifetime());
        let uow = UnitOfWork::new();

        let resolved = resolver.resolve(Arc::clone(&child), Some(&uow)).unwrap();
        assert!(Arc::ptr_eq(&resolved, &child));
        assert!(uow.is_empty());
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let resolver = AmbientScopeResolver::new();
        let root = root();
        let uow = UnitOfWork::new();

        let a = resolver.resolve(Arc::clone(&root), Some(&uow)).unwrap();
        let b = resolver.resolve(Arc::clone(&root), Some(&uow)).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.kind(), ScopeKind::Request);
        assert_eq!(uow.len(), 1);
    }

    #[test]
    fn test_units_of_work_are_isolated() {
        let resolver = AmbientScopeResolver::new();
        let root = root();
        let a = UnitOfWork::new();
        let b = UnitOfWork::new();

        let scope_a = resolver.resolve(Arc::clone(&root), Some(&a)).unwrap();
        let scope_b = resolver.resolve(Arc::clone(&root), Some(&b)).unwrap();
        assert_ne!(scope_a.id(), scope_b.id());
    }

    #[test]
    fn test_shares_store_with_other_keys() {
        let resolver = AmbientScopeResolver::new();
        let uow = UnitOfWork::new();
        uow.insert("user", Arc::new(42u32) as AnyArc);

        resolver.resolve(root(), Some(&uow)).unwrap();
        assert_eq!(uow.len(), 2);
        assert_eq!(*uow.get("user").unwrap().downcast::<u32>().unwrap(), 42);
    }

    #[test]
    fn test_foreign_value_is_replaced() {
        let resolver = AmbientScopeResolver::with_key(AmbientKey::with_suffix("test"));
        let uow = UnitOfWork::new();
        uow.insert(resolver.key().as_str(), Arc::new("not a scope") as AnyArc);

        let scope = resolver.resolve(root(), Some(&uow)).unwrap();
        let cached = resolver.cached(&uow).unwrap();
        assert!(Arc::ptr_eq(&scope, &cached));
    }

    #[test]
    fn test_release_ambient_releases_registrations() {
        let resolver = AmbientScopeResolver::new();
        let count = Arc::new(AtomicUsize::new(0));
        let uow = UnitOfWork::new();

        let scope = resolver.resolve(root(), Some(&uow)).unwrap();
        scope.add_disposable(Arc::new(Counted(Arc::clone(&count)))).unwrap();
        scope.add_disposable(Arc::new(Counted(Arc::clone(&count)))).unwrap();

        resolver.release_ambient(Some(&uow));
        resolver.release_ambient(Some(&uow));
        assert_eq!(count.load(Ordering::SeqCst), 2);

        // Still cached, still released
        let again = resolver.resolve(root(), Some(&uow)).unwrap();
        assert!(again.is_released());
        assert!(again.add_disposable(Arc::new(Counted(Arc::clone(&count)))).is_err());
    }

    #[test]
    fn test_release_ambient_without_context_is_noop() {
        let resolver = AmbientScopeResolver::new();
        resolver.release_ambient(None);
        resolver.release_ambient(Some(&UnitOfWork::new()));
    }

    #[test]
    fn test_ended_unit_of_work_rejects_new_scope() {
        let resolver = AmbientScopeResolver::new();
        let uow = UnitOfWork::new();
        uow.end();

        let Err(err) = resolver.resolve(root(), Some(&uow)) else {
            panic!("ended unit of work must not create a scope");
        };
        assert!(matches!(err, DisposalError::UnitOfWorkEnded { unit_of_work } if unit_of_work == uow.id()));
    }

    #[test]
    fn test_install_releases_on_end() {
        let resolver = AmbientScopeResolver::new();
        let count = Arc::new(AtomicUsize::new(0));
        let uow = UnitOfWork::new();
        resolver.install(&uow);

        let scope = resolver.resolve(root(), Some(&uow)).unwrap();
        scope.add_disposable(Arc::new(Counted(Arc::clone(&count)))).unwrap();

        uow.end();
        uow.end();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(uow.is_ended());
    }

    #[test]
    fn test_on_end_after_end_runs_immediately() {
        let uow = UnitOfWork::new();
        uow.end();

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_in = Arc::clone(&ran);
        uow.on_end(move |_| {
            ran_in.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_resolve_racing_end_never_leaves_live_scope() {
        const ROUNDS: usize = 2_000;

        let resolver = AmbientScopeResolver::new();
        let root = root();
        let mut live_after_end = 0;

        for _ in 0..ROUNDS {
            let uow = UnitOfWork::new();
            resolver.install(&uow);
            let barrier = Barrier::new(2);

            let resolved = std::thread::scope(|s| {
                let resolving = s.spawn(|| {
                    barrier.wait();
                    resolver.resolve(Arc::clone(&root), Some(&uow))
                });
                s.spawn(|| {
                    barrier.wait();
                    uow.end();
                });
                resolving.join().unwrap()
            });

            assert!(uow.is_ended());
            match resolved {
                Ok(scope) if !scope.is_released() => live_after_end += 1,
                Ok(_) => {}
                Err(err) => assert!(matches!(err, DisposalError::UnitOfWorkEnded { .. })),
            }
        }

        assert_eq!(live_after_end, 0);
    }

    #[test]
    fn test_concurrent_first_resolve_creates_one_scope() {
        const THREADS: usize = 16;

        let resolver = AmbientScopeResolver::new();
        let root = root();
        let uow = UnitOfWork::new();
        let barrier = Barrier::new(THREADS);

        let ids: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        resolver
                            .resolve(Arc::clone(&root), Some(&uow))
                            .unwrap()
                            .id()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(uow.len(), 1);
    }
}
