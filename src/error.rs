//! Error types for disposal registration

use crate::{ScopeId, TypeInfo};
use thiserror::Error;

/// Errors that can occur while compiling or running disposal registration
#[derive(Error, Debug, Clone)]
pub enum DisposalError {
    /// No activation was configured for the requested type
    #[error("No activation registered for: {type_name}")]
    NotRegistered { type_name: &'static str },

    /// A constructed value did not have the activation type
    #[error("Activation produced {actual} where {expected} was expected")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    /// The disposal scope was already released
    #[error("Disposal scope {scope} has been released - cannot register new disposables")]
    ScopeReleased { scope: ScopeId },

    /// The unit of work ended before any ambient scope was created for it
    #[error("Unit of work {unit_of_work} has ended")]
    UnitOfWorkEnded { unit_of_work: u64 },

    /// An expression creator was built without one of its registration primitives
    #[error("Expression creator {creator} does not declare registration operation `{operation}`")]
    MissingRegistrationOperation {
        operation: &'static str,
        creator: &'static str,
    },

    /// The construction step itself failed
    #[error("Failed to activate {type_name}: {reason}")]
    ActivationFailed {
        type_name: &'static str,
        reason: String,
    },
}

impl DisposalError {
    /// Create a NotRegistered error for a type
    #[inline]
    pub fn not_registered<T: 'static>() -> Self {
        Self::NotRegistered {
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Create a TypeMismatch error
    #[inline]
    pub fn type_mismatch(expected: TypeInfo, actual: &'static str) -> Self {
        Self::TypeMismatch {
            expected: expected.name(),
            actual,
        }
    }

    /// Create an ActivationFailed error
    #[inline]
    pub fn activation_failed<T: 'static>(reason: impl Into<String>) -> Self {
        Self::ActivationFailed {
            type_name: std::any::type_name::<T>(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for disposal operations
pub type Result<T> = std::result::Result<T, DisposalError>;
