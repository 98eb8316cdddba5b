//! Activation configuration
//!
//! An [`ActivationConfiguration`] describes one activatable type: the type
//! itself and how its instances are released.

use crate::provider::TypeInfo;
use crate::{Disposable, Injectable};
use std::any::Any;
use std::sync::Arc;

/// Type-erased instance as produced by activation expressions.
pub type AnyArc = Arc<dyn Any + Send + Sync>;

/// Monomorphized downcast from an erased instance to its disposable view
pub(crate) type IntoDisposableFn = fn(AnyArc) -> Option<Arc<dyn Disposable>>;

fn into_disposable<T: Disposable>(value: AnyArc) -> Option<Arc<dyn Disposable>> {
    value
        .downcast::<T>()
        .ok()
        .map(|typed| typed as Arc<dyn Disposable>)
}

type CleanupFn = Arc<dyn Fn(&AnyArc) + Send + Sync>;

/// A cleanup action supplied by the caller, invoked instead of the default
/// dispose when the owning scope is released.
///
/// The delegate remembers the parameter type it was declared for. A delegate
/// whose parameter type is not exactly the activation type is not usable for
/// that activation and is ignored in favour of the default dispose.
#[derive(Clone)]
pub struct CleanupDelegate {
    parameter: TypeInfo,
    call: CleanupFn,
}

impl CleanupDelegate {
    /// Create a delegate taking `&T`.
    pub fn new<T: Injectable, F>(cleanup: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        Self {
            parameter: TypeInfo::of::<T>(),
            call: Arc::new(move |value: &AnyArc| {
                if let Some(typed) = value.downcast_ref::<T>() {
                    cleanup(typed);
                }
            }),
        }
    }

    /// The type this delegate accepts.
    #[inline]
    pub fn parameter_type(&self) -> TypeInfo {
        self.parameter
    }

    /// Check whether this delegate accepts exactly `activation_type`.
    #[inline]
    pub fn accepts(&self, activation_type: TypeInfo) -> bool {
        self.parameter == activation_type
    }

    /// Run the delegate against an erased instance.
    #[inline]
    pub fn invoke(&self, value: &AnyArc) {
        (self.call)(value)
    }
}

impl std::fmt::Debug for CleanupDelegate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupDelegate")
            .field("parameter", &self.parameter.name())
            .finish()
    }
}

/// How instances of an activation are released.
#[derive(Debug, Clone, Default)]
pub enum CleanupStrategy {
    /// Call [`Disposable::dispose`]
    #[default]
    Default,
    /// Call the supplied delegate instead
    Custom(CleanupDelegate),
}

/// Describes one activatable type.
///
/// Created once per registered service and immutable afterwards.
///
/// # Examples
///
/// ```rust
/// use scoped_disposal::{ActivationConfiguration, CleanupStrategy, Disposable};
///
/// struct Connection;
///
/// impl Disposable for Connection {
///     fn dispose(&self) {}
/// }
///
/// let plain = ActivationConfiguration::new::<Connection>();
/// assert!(matches!(plain.cleanup(), CleanupStrategy::Default));
///
/// let custom = ActivationConfiguration::new::<Connection>().with_cleanup(|_c: &Connection| {});
/// assert!(custom.disposal_delegate().is_some());
/// ```
#[derive(Clone)]
pub struct ActivationConfiguration {
    activation_type: TypeInfo,
    into_disposable: IntoDisposableFn,
    cleanup: CleanupStrategy,
}

impl ActivationConfiguration {
    /// Configure `T` for default disposal.
    #[inline]
    pub fn new<T: Disposable>() -> Self {
        Self {
            activation_type: TypeInfo::of::<T>(),
            into_disposable: into_disposable::<T>,
            cleanup: CleanupStrategy::Default,
        }
    }

    /// Use a custom cleanup closure for `T` instead of its `dispose`.
    pub fn with_cleanup<T: Injectable, F>(self, cleanup: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.with_disposal_delegate(CleanupDelegate::new(cleanup))
    }

    /// Attach an already-built delegate.
    ///
    /// The delegate is kept as given; its shape is checked when the
    /// activation is compiled.
    #[inline]
    pub fn with_disposal_delegate(mut self, delegate: CleanupDelegate) -> Self {
        self.cleanup = CleanupStrategy::Custom(delegate);
        self
    }

    /// The concrete type being constructed.
    #[inline]
    pub fn activation_type(&self) -> TypeInfo {
        self.activation_type
    }

    /// Configured cleanup strategy.
    #[inline]
    pub fn cleanup(&self) -> &CleanupStrategy {
        &self.cleanup
    }

    /// The caller-supplied delegate, if any.
    #[inline]
    pub fn disposal_delegate(&self) -> Option<&CleanupDelegate> {
        match &self.cleanup {
            CleanupStrategy::Custom(delegate) => Some(delegate),
            CleanupStrategy::Default => None,
        }
    }

    #[inline]
    pub(crate) fn into_disposable_fn(&self) -> IntoDisposableFn {
        self.into_disposable
    }
}

impl std::fmt::Debug for ActivationConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivationConfiguration")
            .field("activation_type", &self.activation_type.name())
            .field("cleanup", &self.cleanup)
            .finish()
    }
}
