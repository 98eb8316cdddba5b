//! Disposal scopes
//!
//! A disposal scope owns the instances registered with it and releases them,
//! exactly once each, when the scope itself is released.

use crate::{DisposalError, Disposable, Injectable, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

#[cfg(feature = "logging")]
use tracing::{debug, trace};

/// Unique scope identifier.
///
/// Each scope gets a unique ID for tracking and debugging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(u64);

impl ScopeId {
    /// Generate a new unique scope ID.
    #[inline]
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    #[inline]
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl Default for ScopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "scope-{}", self.0)
    }
}

/// Which lifetime a disposal scope belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    /// The root scope of a container; lives as long as the container
    Container,
    /// A child lifetime scope created from a container
    Lifetime,
    /// A per-unit-of-work scope created by the ambient resolver
    Request,
}

impl ScopeKind {
    /// Short lowercase label, used in log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeKind::Container => "container",
            ScopeKind::Lifetime => "lifetime",
            ScopeKind::Request => "request",
        }
    }
}

/// A one-shot cleanup action bound to the instance it releases.
pub type Disposer = Box<dyn FnOnce() + Send>;

/// Capability implemented by anything that owns disposable instances.
///
/// Implementations must accept registrations from many threads at once and
/// must run every registered cleanup exactly once when released. Once
/// released, further registrations are rejected with
/// [`DisposalError::ScopeReleased`].
pub trait DisposalScope: Send + Sync {
    /// Identifier of this scope.
    fn id(&self) -> ScopeId;

    /// Lifetime this scope represents.
    fn kind(&self) -> ScopeKind;

    /// Own `instance` and call its [`Disposable::dispose`] on release.
    fn add_disposable(&self, instance: Arc<dyn Disposable>) -> Result<()>;

    /// Own a custom cleanup action, run instead of a default dispose.
    fn add_disposer(&self, disposer: Disposer) -> Result<()>;

    /// Release everything registered so far. Idempotent.
    fn release(&self);

    /// Whether [`release`](DisposalScope::release) has run.
    fn is_released(&self) -> bool;

    /// Number of registrations still pending release.
    fn len(&self) -> usize;

    /// Check if nothing is pending release.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl dyn DisposalScope {
    /// Register an instance for default disposal, handing it back unchanged.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use scoped_disposal::{Disposable, DisposalScope, LifetimeScope};
    /// use std::sync::Arc;
    ///
    /// struct Session;
    ///
    /// impl Disposable for Session {
    ///     fn dispose(&self) {}
    /// }
    ///
    /// let scope: Arc<dyn DisposalScope> = Arc::new(LifetimeScope::container());
    /// let session = scope.register_disposable(Arc::new(Session)).unwrap();
    /// assert_eq!(scope.len(), 1);
    /// # drop(session);
    /// ```
    pub fn register_disposable<T: Disposable>(&self, instance: Arc<T>) -> Result<Arc<T>> {
        self.add_disposable(Arc::clone(&instance) as Arc<dyn Disposable>)?;
        Ok(instance)
    }

    /// Register an instance with a custom cleanup, handing it back unchanged.
    pub fn register_disposable_with_cleanup<T, F>(&self, instance: Arc<T>, cleanup: F) -> Result<Arc<T>>
    where
        T: Injectable,
        F: FnOnce(&T) + Send + 'static,
    {
        let owned = Arc::clone(&instance);
        self.add_disposer(Box::new(move || cleanup(&owned)))?;
        Ok(instance)
    }
}

/// A registered release action
enum DisposalEntry {
    Dispose(Arc<dyn Disposable>),
    Cleanup(Disposer),
}

impl DisposalEntry {
    fn run(self) {
        match self {
            DisposalEntry::Dispose(instance) => instance.dispose(),
            DisposalEntry::Cleanup(cleanup) => cleanup(),
        }
    }
}

struct Entries {
    released: bool,
    pending: Vec<DisposalEntry>,
}

/// Default [`DisposalScope`] implementation.
///
/// Registrations are appended under a mutex; release drains the list under
/// the same lock and then runs it in reverse registration order outside of
/// it, so a cleanup action may itself touch other scopes.
///
/// A scope that is dropped without being released is released on drop.
pub struct LifetimeScope {
    id: ScopeId,
    kind: ScopeKind,
    entries: Mutex<Entries>,
    released: AtomicBool,
}

impl LifetimeScope {
    /// Create an empty scope of the given kind.
    pub fn new(kind: ScopeKind) -> Self {
        let id = ScopeId::new();

        #[cfg(feature = "logging")]
        debug!(
            target: "scoped_disposal",
            scope_id = id.id(),
            kind = kind.as_str(),
            "Creating disposal scope"
        );

        Self {
            id,
            kind,
            entries: Mutex::new(Entries {
                released: false,
                pending: Vec::new(),
            }),
            released: AtomicBool::new(false),
        }
    }

    /// Create a container-level (root) scope.
    #[inline]
    pub fn container() -> Self {
        Self::new(ScopeKind::Container)
    }

    /// Create a child lifetime scope.
    #[inline]
    pub fn lifetime() -> Self {
        Self::new(ScopeKind::Lifetime)
    }

    /// Create a per-unit-of-work scope.
    #[inline]
    pub fn request() -> Self {
        Self::new(ScopeKind::Request)
    }

    fn push(&self, entry: DisposalEntry) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.released {
            #[cfg(feature = "logging")]
            debug!(
                target: "scoped_disposal",
                scope_id = self.id.id(),
                "Rejected registration into released scope"
            );
            return Err(DisposalError::ScopeReleased { scope: self.id });
        }
        entries.pending.push(entry);

        #[cfg(feature = "logging")]
        trace!(
            target: "scoped_disposal",
            scope_id = self.id.id(),
            pending = entries.pending.len(),
            "Registered disposable"
        );

        Ok(())
    }
}

impl DisposalScope for LifetimeScope {
    #[inline]
    fn id(&self) -> ScopeId {
        self.id
    }

    #[inline]
    fn kind(&self) -> ScopeKind {
        self.kind
    }

    fn add_disposable(&self, instance: Arc<dyn Disposable>) -> Result<()> {
        self.push(DisposalEntry::Dispose(instance))
    }

    fn add_disposer(&self, disposer: Disposer) -> Result<()> {
        self.push(DisposalEntry::Cleanup(disposer))
    }

    fn release(&self) {
        let pending = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            if entries.released {
                return;
            }
            entries.released = true;
            self.released.store(true, Ordering::Release);
            std::mem::take(&mut entries.pending)
        };

        #[cfg(feature = "logging")]
        debug!(
            target: "scoped_disposal",
            scope_id = self.id.id(),
            kind = self.kind.as_str(),
            disposables = pending.len(),
            "Releasing disposal scope"
        );

        for entry in pending.into_iter().rev() {
            entry.run();
        }
    }

    #[inline]
    fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .len()
    }
}

impl Drop for LifetimeScope {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for LifetimeScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifetimeScope")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("pending", &self.len())
            .field("released", &self.is_released())
            .finish()
    }
}
