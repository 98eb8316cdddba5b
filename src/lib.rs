//! # Scoped Disposal - Disposal Registration for Dependency Injection
//!
//! Every object a container activates is registered with the disposal scope
//! that should own it. Registration logic is compiled once per activated
//! type and reused for every activation; the owning scope is picked at run
//! time, so instances activated through the root container during a request
//! are released at the end of that request rather than living as long as the
//! container.
//!
//! ## Features
//!
//! - 🧩 **Compiled once** - Registration is wrapped around a construction expression per type, then reused
//! - 🌐 **Ambient request scopes** - One lazily created scope per unit of work, race-free
//! - 🧹 **Custom cleanup** - Per-type cleanup closures run instead of the default `dispose`
//! - 🔒 **Exactly once** - Every registered instance is released exactly once, in reverse order
//! - 📊 **Observable** - Optional tracing integration with JSON or pretty output
//!
//! ## Quick Start
//!
//! ```rust
//! use scoped_disposal::{Container, Disposable};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! static CLOSED: AtomicUsize = AtomicUsize::new(0);
//!
//! struct Connection;
//!
//! impl Disposable for Connection {
//!     fn dispose(&self) {
//!         CLOSED.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//!
//! let container = Container::new();
//! container.register(|| Connection);
//!
//! let request = container.begin_unit_of_work();
//! let a = container.activate::<Connection>(Some(&request)).unwrap();
//! let b = container.activate::<Connection>(Some(&request)).unwrap();
//! assert!(!Arc::ptr_eq(&a, &b));
//!
//! // End of request releases both
//! request.end();
//! assert_eq!(CLOSED.load(Ordering::SeqCst), 2);
//! ```
//!
//! ## Custom Cleanup
//!
//! ```rust
//! use scoped_disposal::{Container, Disposable};
//!
//! struct Pool;
//!
//! impl Disposable for Pool {
//!     fn dispose(&self) {}
//! }
//!
//! impl Pool {
//!     fn drain(&self) {}
//! }
//!
//! let container = Container::new();
//! container.register_with_cleanup(|| Pool, |pool: &Pool| pool.drain());
//! ```
//!
//! ## Lower-Level Pieces
//!
//! - [`RequestDisposalScopeExpressionCreator`] wraps an [`ActivationExpressionResult`]
//!   with disposal registration.
//! - [`AmbientScopeResolver`] picks the effective scope for a [`UnitOfWork`].
//! - [`RegistrationMethodCache`] resolves a creator's registration primitives once.

mod ambient;
mod config;
mod container;
mod creator;
mod error;
mod expression;
#[cfg(feature = "logging")]
pub mod logging;
mod provider;
pub mod registration;
mod scope;
mod storage;

pub use ambient::*;
pub use config::*;
pub use container::*;
pub use creator::*;
pub use error::*;
pub use expression::*;
pub use provider::*;
pub use registration::RegistrationMethodCache;
pub use scope::*;

// Re-export tracing macros for convenience when logging feature is enabled
#[cfg(feature = "logging")]
pub use tracing::{debug, error, info, trace, warn};

// Re-export for convenience
pub use std::sync::Arc;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        ActivationConfiguration, AmbientScopeResolver, CleanupStrategy, Container, Disposable,
        DisposalError, DisposalScope, DisposalScopeExpressionCreator, Injectable, LifetimeScope,
        Result, ScopeKind, UnitOfWork,
    };
    pub use std::sync::Arc;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Session {
        disposed: Arc<AtomicUsize>,
    }

    impl Disposable for Session {
        fn dispose(&self) {
            self.disposed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn container_with_session() -> (Container, Arc<AtomicUsize>) {
        let container = Container::new();
        let disposed = Arc::new(AtomicUsize::new(0));
        let disposed_in = Arc::clone(&disposed);
        container.register(move || Session {
            disposed: Arc::clone(&disposed_in),
        });
        (container, disposed)
    }

    #[test]
    fn test_request_instances_released_at_end() {
        let (container, disposed) = container_with_session();

        let request = container.begin_unit_of_work();
        container.activate::<Session>(Some(&request)).unwrap();
        container.activate::<Session>(Some(&request)).unwrap();

        assert!(container.disposal_scope().is_empty());
        assert_eq!(disposed.load(Ordering::SeqCst), 0);

        request.end();
        assert_eq!(disposed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_activation_after_end_is_rejected() {
        let (container, _disposed) = container_with_session();

        let request = container.begin_unit_of_work();
        container.activate::<Session>(Some(&request)).unwrap();
        request.end();

        let Err(err) = container.activate::<Session>(Some(&request)) else {
            panic!("activation into an ended request must fail");
        };
        assert!(matches!(err, DisposalError::ScopeReleased { .. }));
    }

    #[test]
    fn test_container_release_does_not_touch_request_instances() {
        let (container, disposed) = container_with_session();

        let request = container.begin_unit_of_work();
        container.activate::<Session>(Some(&request)).unwrap();
        container.activate::<Session>(None).unwrap();

        container.dispose();
        assert_eq!(disposed.load(Ordering::SeqCst), 1);

        request.end();
        assert_eq!(disposed.load(Ordering::SeqCst), 2);
    }
}
