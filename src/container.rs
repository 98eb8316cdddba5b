//! Activation host container
//!
//! The `Container` stores activation registrations, compiles each one once
//! through its disposal expression creator, and evaluates the compiled
//! expression on every activation. The root container owns the
//! container-level disposal scope; child containers own a lifetime scope.

use crate::ambient::{AmbientScopeResolver, UnitOfWork};
use crate::config::ActivationConfiguration;
use crate::creator::{DisposalScopeExpressionCreator, RequestDisposalScopeExpressionCreator};
use crate::expression::{
    ActivationContext, ActivationExpression, ActivationExpressionRequest, ActivationExpressionResult,
};
use crate::storage::{ActivationStorage, Registration};
use crate::{DisposalError, DisposalScope, Disposable, Injectable, LifetimeScope, Result};
use std::any::TypeId;
use std::sync::Arc;

#[cfg(feature = "logging")]
use tracing::{debug, trace};

/// Dependency injection container that registers every activated instance
/// for disposal.
///
/// # Examples
///
/// ```rust
/// use scoped_disposal::{Container, Disposable};
/// use std::sync::atomic::{AtomicBool, Ordering};
///
/// #[derive(Default)]
/// struct Connection {
///     closed: AtomicBool,
/// }
///
/// impl Disposable for Connection {
///     fn dispose(&self) {
///         self.closed.store(true, Ordering::SeqCst);
///     }
/// }
///
/// let container = Container::new();
/// container.register(Connection::default);
///
/// // One request
/// let request = container.begin_unit_of_work();
/// let connection = container.activate::<Connection>(Some(&request)).unwrap();
/// assert!(!connection.closed.load(Ordering::SeqCst));
///
/// request.end();
/// assert!(connection.closed.load(Ordering::SeqCst));
/// ```
#[derive(Clone)]
pub struct Container {
    /// Activation registrations (lock-free)
    storage: Arc<ActivationStorage>,
    /// Scope owning instances activated outside a unit of work
    disposal_scope: Arc<dyn DisposalScope>,
    /// Wraps construction expressions with disposal registration
    creator: Arc<dyn DisposalScopeExpressionCreator>,
    /// Resolver whose scopes are released by `begin_unit_of_work` hooks
    resolver: AmbientScopeResolver,
    /// Scope depth for debugging
    depth: u32,
}

impl Container {
    /// Create a new root container.
    pub fn new() -> Self {
        let resolver = AmbientScopeResolver::new();
        let creator = Arc::new(RequestDisposalScopeExpressionCreator::with_resolver(
            resolver.clone(),
        ));
        Self::with_creator(resolver, creator)
    }

    /// Create a root container with a specific creator.
    ///
    /// `resolver` must be the resolver the creator registers through, so that
    /// [`begin_unit_of_work`](Self::begin_unit_of_work) releases the right scope.
    pub fn with_creator(
        resolver: AmbientScopeResolver,
        creator: Arc<dyn DisposalScopeExpressionCreator>,
    ) -> Self {
        #[cfg(feature = "logging")]
        debug!(
            target: "scoped_disposal",
            depth = 0,
            ambient_key = resolver.key().as_str(),
            "Creating new root container"
        );

        Self {
            storage: Arc::new(ActivationStorage::new()),
            disposal_scope: Arc::new(LifetimeScope::container()),
            creator,
            resolver,
            depth: 0,
        }
    }

    /// Create a child container.
    ///
    /// The child sees every parent registration, may override them, and owns
    /// its own lifetime scope: instances activated through it are released
    /// with the child, never routed to a unit of work.
    pub fn scope(&self) -> Self {
        let child_depth = self.depth + 1;

        #[cfg(feature = "logging")]
        debug!(
            target: "scoped_disposal",
            parent_depth = self.depth,
            child_depth = child_depth,
            "Creating child container"
        );

        Self {
            storage: Arc::new(ActivationStorage::with_parent(Arc::clone(&self.storage))),
            disposal_scope: Arc::new(LifetimeScope::lifetime()),
            creator: Arc::clone(&self.creator),
            resolver: self.resolver.clone(),
            depth: child_depth,
        }
    }

    // =========================================================================
    // Registration Methods
    // =========================================================================

    /// Register `T`, constructed by `factory` and released with its `dispose`.
    pub fn register<T: Disposable, F>(&self, factory: F)
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.configure(
            ActivationConfiguration::new::<T>(),
            ActivationExpression::from_fn(factory),
        );
    }

    /// Register `T` with a cleanup closure run instead of its `dispose`.
    pub fn register_with_cleanup<T: Disposable, F, C>(&self, factory: F, cleanup: C)
    where
        F: Fn() -> T + Send + Sync + 'static,
        C: Fn(&T) + Send + Sync + 'static,
    {
        self.configure(
            ActivationConfiguration::new::<T>().with_cleanup(cleanup),
            ActivationExpression::from_fn(factory),
        );
    }

    /// Register an arbitrary construction expression.
    pub fn configure(&self, configuration: ActivationConfiguration, construction: ActivationExpression) {
        #[cfg(feature = "logging")]
        debug!(
            target: "scoped_disposal",
            activation_type = configuration.activation_type().name(),
            custom_cleanup = configuration.disposal_delegate().is_some(),
            depth = self.depth,
            "Registering activation"
        );

        self.storage
            .insert(Registration::new(configuration, construction));
    }

    /// Remove the local registration for `T`.
    pub fn remove<T: Injectable>(&self) -> bool {
        self.storage.remove(&TypeId::of::<T>())
    }

    // =========================================================================
    // Activation
    // =========================================================================

    /// Activate `T`.
    ///
    /// With a unit of work, instances activated through the root container
    /// are owned by that unit of work's ambient scope. Otherwise they are
    /// owned by this container's scope.
    pub fn activate<T: Injectable>(&self, unit_of_work: Option<&UnitOfWork>) -> Result<Arc<T>> {
        let registration = self
            .storage
            .get_from_chain(&TypeId::of::<T>())
            .ok_or_else(DisposalError::not_registered::<T>)?;

        let expression = registration.compiled_or_init(|r| self.compile(r))?;

        #[cfg(feature = "logging")]
        trace!(
            target: "scoped_disposal",
            activation_type = std::any::type_name::<T>(),
            depth = self.depth,
            unit_of_work = unit_of_work.map(|u| u.id()),
            "Activating"
        );

        let mut context = ActivationContext::new(Arc::clone(&self.disposal_scope));
        if let Some(unit_of_work) = unit_of_work {
            context = context.with_unit_of_work(unit_of_work.clone());
        }
        expression.evaluate_as::<T>(&context)
    }

    fn compile(&self, registration: &Registration) -> Result<ActivationExpression> {
        let configuration = registration.configuration();
        let request = ActivationExpressionRequest::new(configuration.activation_type());
        let construction = ActivationExpressionResult::new(registration.construction().clone());

        self.creator
            .create_expression(&self.disposal_scope, &request, configuration, construction)
            .map(ActivationExpressionResult::into_expression)
    }

    /// Start a unit of work whose ambient scope is released when it ends.
    pub fn begin_unit_of_work(&self) -> UnitOfWork {
        let unit_of_work = UnitOfWork::new();
        self.resolver.install(&unit_of_work);
        unit_of_work
    }

    // =========================================================================
    // Query Methods
    // =========================================================================

    /// Check if `T` is registered here or in a parent.
    #[inline]
    pub fn contains<T: Injectable>(&self) -> bool {
        self.storage.contains_in_chain(&TypeId::of::<T>())
    }

    /// Check if `T`'s activation has been compiled.
    pub fn is_compiled<T: Injectable>(&self) -> bool {
        self.storage
            .get_from_chain(&TypeId::of::<T>())
            .is_some_and(|r| r.is_compiled())
    }

    /// Number of registrations in this container (not including parents).
    #[inline]
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// Check if this container has no local registrations.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Get the scope depth (0 = root).
    #[inline]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// The disposal scope owned by this container.
    #[inline]
    pub fn disposal_scope(&self) -> &Arc<dyn DisposalScope> {
        &self.disposal_scope
    }

    /// The ambient resolver used by this container.
    #[inline]
    pub fn resolver(&self) -> &AmbientScopeResolver {
        &self.resolver
    }

    /// Release everything this container's scope owns.
    pub fn dispose(&self) {
        #[cfg(feature = "logging")]
        debug!(
            target: "scoped_disposal",
            depth = self.depth,
            scope_id = self.disposal_scope.id().id(),
            "Disposing container"
        );

        self.disposal_scope.release();
    }
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("registrations", &self.len())
            .field("depth", &self.depth)
            .field("disposal_scope", &self.disposal_scope.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ScopeKind;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    struct Database {
        disposed: Arc<AtomicUsize>,
    }

    impl Disposable for Database {
        fn dispose(&self) {
            self.disposed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Unregistered;

    fn register_database(container: &Container) -> Arc<AtomicUsize> {
        let disposed = Arc::new(AtomicUsize::new(0));
        let disposed_in = Arc::clone(&disposed);
        container.register(move || Database {
            disposed: Arc::clone(&disposed_in),
        });
        disposed
    }

    #[test]
    fn test_activate_outside_unit_of_work_uses_container_scope() {
        let container = Container::new();
        let disposed = register_database(&container);

        let _db = container.activate::<Database>(None).unwrap();
        assert_eq!(container.disposal_scope().len(), 1);

        container.dispose();
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_not_registered() {
        let container = Container::new();
        let Err(err) = container.activate::<Unregistered>(None) else {
            panic!("unregistered type must not activate");
        };
        assert!(matches!(err, DisposalError::NotRegistered { .. }));
    }

    #[test]
    fn test_compiles_once_per_type() {
        static COMPILES: AtomicU32 = AtomicU32::new(0);

        struct CountingCreator(RequestDisposalScopeExpressionCreator);

        impl DisposalScopeExpressionCreator for CountingCreator {
            fn create_expression(
                &self,
                scope: &Arc<dyn DisposalScope>,
                request: &ActivationExpressionRequest,
                configuration: &ActivationConfiguration,
                result: ActivationExpressionResult,
            ) -> Result<ActivationExpressionResult> {
                COMPILES.fetch_add(1, Ordering::SeqCst);
                self.0.create_expression(scope, request, configuration, result)
            }
        }

        let resolver = AmbientScopeResolver::new();
        let creator = Arc::new(CountingCreator(
            RequestDisposalScopeExpressionCreator::with_resolver(resolver.clone()),
        ));
        let container = Container::with_creator(resolver, creator);
        register_database(&container);

        assert!(!container.is_compiled::<Database>());
        for _ in 0..5 {
            container.activate::<Database>(None).unwrap();
        }
        assert!(container.is_compiled::<Database>());
        assert_eq!(COMPILES.load(Ordering::SeqCst), 1);
        assert_eq!(container.disposal_scope().len(), 5);
    }

    #[test]
    fn test_child_scope_keeps_its_own_instances() {
        let root = Container::new();
        let disposed = register_database(&root);

        let child = root.scope();
        assert_eq!(child.depth(), 1);
        assert!(child.contains::<Database>());
        assert!(child.is_empty());
        assert_eq!(child.disposal_scope().kind(), ScopeKind::Lifetime);

        // Child scopes are not the root type, so the unit of work is bypassed
        let uow = root.begin_unit_of_work();
        child.activate::<Database>(Some(&uow)).unwrap();
        assert_eq!(child.disposal_scope().len(), 1);
        assert!(root.resolver().cached(&uow).is_none());

        child.dispose();
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
        assert!(root.disposal_scope().is_empty());
    }

    #[test]
    fn test_child_override() {
        struct Flag(u32);

        impl Disposable for Flag {
            fn dispose(&self) {}
        }

        let root = Container::new();
        root.register(|| Flag(1));
        let child = root.scope();
        child.register(|| Flag(2));

        assert_eq!(root.activate::<Flag>(None).unwrap().0, 1);
        assert_eq!(child.activate::<Flag>(None).unwrap().0, 2);

        assert!(child.remove::<Flag>());
        assert_eq!(child.activate::<Flag>(None).unwrap().0, 1);
    }

    #[test]
    fn test_register_with_cleanup() {
        let container = Container::new();
        let cleaned = Arc::new(AtomicUsize::new(0));
        let disposed = Arc::new(AtomicUsize::new(0));

        let cleaned_in = Arc::clone(&cleaned);
        let disposed_in = Arc::clone(&disposed);
        container.register_with_cleanup(
            move || Database {
                disposed: Arc::clone(&disposed_in),
            },
            move |_db: &Database| {
                cleaned_in.fetch_add(1, Ordering::SeqCst);
            },
        );

        let uow = container.begin_unit_of_work();
        container.activate::<Database>(Some(&uow)).unwrap();
        uow.end();

        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
        assert_eq!(disposed.load(Ordering::SeqCst), 0);
    }
}
