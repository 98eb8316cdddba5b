//! Registration primitives and their per-creator cache
//!
//! An expression creator declares a table of [`RegistrationOperation`]s. Two
//! roles must be present: plain registration (`add_disposable`, one argument:
//! the instance) and registration with a cleanup delegate
//! (`add_disposable_with_cleanup`, two arguments: the instance and the
//! cleanup). The [`RegistrationMethodCache`] finds each role in the table
//! once and hands out the cached handle afterwards.

use crate::ambient::{AmbientScopeResolver, UnitOfWork};
use crate::{DisposalError, DisposalScope, Disposable, Disposer, Result};
use once_cell::sync::OnceCell;
use std::sync::Arc;

#[cfg(feature = "logging")]
use tracing::{debug, error};

/// Name of the plain registration primitive.
pub const ADD_DISPOSABLE: &str = "add_disposable";

/// Name of the registration-with-cleanup primitive.
pub const ADD_DISPOSABLE_WITH_CLEANUP: &str = "add_disposable_with_cleanup";

/// Where a generated registration call registers to.
///
/// The candidate scope is the one the activation was requested through; it is
/// not trusted as final and goes through the ambient resolver on every call.
pub struct RegistrationTarget<'a> {
    resolver: &'a AmbientScopeResolver,
    unit_of_work: Option<&'a UnitOfWork>,
    candidate: Arc<dyn DisposalScope>,
}

impl<'a> RegistrationTarget<'a> {
    /// Create a target.
    #[inline]
    pub fn new(
        resolver: &'a AmbientScopeResolver,
        unit_of_work: Option<&'a UnitOfWork>,
        candidate: Arc<dyn DisposalScope>,
    ) -> Self {
        Self {
            resolver,
            unit_of_work,
            candidate,
        }
    }

    /// The scope as supplied by the caller.
    #[inline]
    pub fn candidate(&self) -> &Arc<dyn DisposalScope> {
        &self.candidate
    }

    /// The scope that should actually own the instance.
    #[inline]
    pub fn effective_scope(&self) -> Result<Arc<dyn DisposalScope>> {
        self.resolver
            .resolve(Arc::clone(&self.candidate), self.unit_of_work)
    }
}

/// Plain registration: own the instance, release with its `dispose`
pub type PlainRegisterFn = fn(&RegistrationTarget<'_>, Arc<dyn Disposable>) -> Result<()>;

/// Registration with cleanup: own a disposer already bound to its instance
pub type CleanupRegisterFn = fn(&RegistrationTarget<'_>, Disposer) -> Result<()>;

/// One declared registration primitive.
#[derive(Clone, Copy)]
pub enum RegistrationOperation {
    /// Single argument: the instance
    Plain {
        name: &'static str,
        call: PlainRegisterFn,
    },
    /// Two arguments: the instance and its cleanup
    WithCleanup {
        name: &'static str,
        call: CleanupRegisterFn,
    },
}

impl RegistrationOperation {
    /// Declared name.
    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            RegistrationOperation::Plain { name, .. } => *name,
            RegistrationOperation::WithCleanup { name, .. } => *name,
        }
    }

    /// Number of arguments, not counting the target.
    #[inline]
    pub fn arity(&self) -> usize {
        match self {
            RegistrationOperation::Plain { .. } => 1,
            RegistrationOperation::WithCleanup { .. } => 2,
        }
    }
}

impl std::fmt::Debug for RegistrationOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationOperation")
            .field("name", &self.name())
            .field("arity", &self.arity())
            .finish()
    }
}

fn add_disposable(target: &RegistrationTarget<'_>, instance: Arc<dyn Disposable>) -> Result<()> {
    target.effective_scope()?.add_disposable(instance)
}

fn add_disposable_with_cleanup(target: &RegistrationTarget<'_>, disposer: Disposer) -> Result<()> {
    target.effective_scope()?.add_disposer(disposer)
}

/// The registration primitives every request-aware creator declares.
pub fn default_operations() -> Arc<[RegistrationOperation]> {
    Arc::new([
        RegistrationOperation::Plain {
            name: ADD_DISPOSABLE,
            call: add_disposable,
        },
        RegistrationOperation::WithCleanup {
            name: ADD_DISPOSABLE_WITH_CLEANUP,
            call: add_disposable_with_cleanup,
        },
    ])
}

/// Resolves and memoizes the two registration roles from a declared table.
///
/// Resolution happens at most once per role for the lifetime of the cache;
/// concurrent first calls block on the same initialization. A failed lookup is
/// not cached, so a misconfigured creator keeps failing loudly.
pub struct RegistrationMethodCache {
    declared: Arc<[RegistrationOperation]>,
    plain: OnceCell<PlainRegisterFn>,
    with_cleanup: OnceCell<CleanupRegisterFn>,
    owner: &'static str,
}

impl RegistrationMethodCache {
    /// Cache over `declared`, reporting failures against `owner`.
    pub fn new(declared: Arc<[RegistrationOperation]>, owner: &'static str) -> Self {
        Self {
            declared,
            plain: OnceCell::new(),
            with_cleanup: OnceCell::new(),
            owner,
        }
    }

    /// The declared operations.
    #[inline]
    pub fn declared(&self) -> &[RegistrationOperation] {
        &self.declared
    }

    /// The plain registration primitive.
    pub fn plain_register_operation(&self) -> Result<PlainRegisterFn> {
        self.plain
            .get_or_try_init(|| {
                self.declared
                    .iter()
                    .find_map(|op| match op {
                        RegistrationOperation::Plain { name, call } if *name == ADD_DISPOSABLE => {
                            Some(*call)
                        }
                        _ => None,
                    })
                    .map(|call| self.resolved(ADD_DISPOSABLE, call))
                    .ok_or_else(|| self.missing(ADD_DISPOSABLE))
            })
            .copied()
    }

    /// The registration-with-cleanup primitive.
    pub fn cleanup_register_operation(&self) -> Result<CleanupRegisterFn> {
        self.with_cleanup
            .get_or_try_init(|| {
                self.declared
                    .iter()
                    .find_map(|op| match op {
                        RegistrationOperation::WithCleanup { name, call }
                            if *name == ADD_DISPOSABLE_WITH_CLEANUP =>
                        {
                            Some(*call)
                        }
                        _ => None,
                    })
                    .map(|call| self.resolved(ADD_DISPOSABLE_WITH_CLEANUP, call))
                    .ok_or_else(|| self.missing(ADD_DISPOSABLE_WITH_CLEANUP))
            })
            .copied()
    }

    /// Resolve both roles now.
    pub fn resolve_all(&self) -> Result<()> {
        self.plain_register_operation()?;
        self.cleanup_register_operation()?;
        Ok(())
    }

    #[inline]
    fn resolved<F>(&self, _operation: &'static str, call: F) -> F {
        #[cfg(feature = "logging")]
        debug!(
            target: "scoped_disposal",
            operation = _operation,
            creator = self.owner,
            "Resolved registration operation"
        );
        call
    }

    #[cold]
    fn missing(&self, operation: &'static str) -> DisposalError {
        #[cfg(feature = "logging")]
        error!(
            target: "scoped_disposal",
            operation = operation,
            creator = self.owner,
            "Expression creator is missing a required registration operation"
        );

        DisposalError::MissingRegistrationOperation {
            operation,
            creator: self.owner,
        }
    }
}

impl std::fmt::Debug for RegistrationMethodCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationMethodCache")
            .field("owner", &self.owner)
            .field("declared", &self.declared)
            .field("plain_resolved", &self.plain.get().is_some())
            .field("cleanup_resolved", &self.with_cleanup.get().is_some())
            .finish()
    }
}
