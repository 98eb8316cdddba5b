//! Activation expressions
//!
//! An [`ActivationExpression`] is a pre-built, reusable piece of activation
//! logic: it is composed once per activated type and then evaluated once per
//! activation against an [`ActivationContext`].
//!
//! ## Compile time vs. run time
//!
//! - [`ActivationExpressionRequest`] and [`ActivationExpressionResult`] only
//!   exist while expressions are being composed.
//! - [`ActivationContext`] only exists while an expression is being evaluated.
//!   It carries the caller's disposal scope and, when one is active, the
//!   current [`UnitOfWork`].

use crate::ambient::UnitOfWork;
use crate::config::AnyArc;
use crate::provider::TypeInfo;
use crate::{DisposalError, DisposalScope, Injectable, Result};
use std::sync::Arc;

#[cfg(feature = "logging")]
use tracing::trace;

// =============================================================================
// Run-time context
// =============================================================================

/// Everything an expression can observe while it runs.
#[derive(Clone)]
pub struct ActivationContext {
    scope: Arc<dyn DisposalScope>,
    unit_of_work: Option<UnitOfWork>,
}

impl ActivationContext {
    /// Context for an activation requested through `scope`, outside any unit of work.
    #[inline]
    pub fn new(scope: Arc<dyn DisposalScope>) -> Self {
        Self {
            scope,
            unit_of_work: None,
        }
    }

    /// Attach the active unit of work.
    #[inline]
    pub fn with_unit_of_work(mut self, unit_of_work: UnitOfWork) -> Self {
        self.unit_of_work = Some(unit_of_work);
        self
    }

    /// The scope the activation was requested through.
    #[inline]
    pub fn scope(&self) -> &Arc<dyn DisposalScope> {
        &self.scope
    }

    /// The active unit of work, if any.
    #[inline]
    pub fn unit_of_work(&self) -> Option<&UnitOfWork> {
        self.unit_of_work.as_ref()
    }
}

impl std::fmt::Debug for ActivationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivationContext")
            .field("scope", &self.scope.id())
            .field("unit_of_work", &self.unit_of_work.as_ref().map(|u| u.id()))
            .finish()
    }
}

// =============================================================================
// Expressions
// =============================================================================

type ExpressionFn = Arc<dyn Fn(&ActivationContext) -> Result<AnyArc> + Send + Sync>;

/// A composable fragment of activation logic yielding a type-erased instance.
///
/// # Examples
///
/// ```rust
/// use scoped_disposal::{ActivationContext, ActivationExpression, LifetimeScope};
/// use std::sync::Arc;
///
/// #[derive(Debug, PartialEq)]
/// struct Port(u16);
///
/// let expression = ActivationExpression::from_fn(|| Port(8080));
/// let context = ActivationContext::new(Arc::new(LifetimeScope::container()));
///
/// let port = expression.evaluate_as::<Port>(&context).unwrap();
/// assert_eq!(*port, Port(8080));
/// ```
#[derive(Clone)]
pub struct ActivationExpression {
    produced: Option<TypeInfo>,
    body: ExpressionFn,
}

impl ActivationExpression {
    /// Expression whose produced type is statically `T`.
    pub fn typed<T: Injectable, F>(body: F) -> Self
    where
        F: Fn(&ActivationContext) -> Result<Arc<T>> + Send + Sync + 'static,
    {
        Self {
            produced: Some(TypeInfo::of::<T>()),
            body: Arc::new(move |context: &ActivationContext| -> Result<AnyArc> {
                Ok(body(context)? as AnyArc)
            }),
        }
    }

    /// Expression whose produced type is only known at run time.
    ///
    /// Wrapping code must insert a [`convert`](Self::convert) step before it
    /// relies on the concrete type.
    pub fn erased<F>(body: F) -> Self
    where
        F: Fn(&ActivationContext) -> Result<AnyArc> + Send + Sync + 'static,
    {
        Self {
            produced: None,
            body: Arc::new(body),
        }
    }

    /// Construct a fresh `T` on every evaluation.
    pub fn from_fn<T: Injectable, F>(factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::typed(move |_: &ActivationContext| Ok(Arc::new(factory())))
    }

    /// Construct a fresh `T` with a factory that may fail.
    ///
    /// A factory error surfaces as [`DisposalError::ActivationFailed`] and
    /// nothing is registered for disposal.
    pub fn try_from_fn<T: Injectable, E, F>(factory: F) -> Self
    where
        E: std::fmt::Display,
        F: Fn() -> std::result::Result<T, E> + Send + Sync + 'static,
    {
        Self::typed(move |_: &ActivationContext| {
            factory()
                .map(Arc::new)
                .map_err(|e| DisposalError::activation_failed::<T>(e.to_string()))
        })
    }

    /// Always yield the same instance.
    pub fn constant<T: Injectable>(instance: Arc<T>) -> Self {
        Self::typed(move |_: &ActivationContext| Ok(Arc::clone(&instance)))
    }

    pub(crate) fn from_parts(produced: Option<TypeInfo>, body: ExpressionFn) -> Self {
        Self { produced, body }
    }

    /// The statically known produced type, if any.
    #[inline]
    pub fn produced_type(&self) -> Option<TypeInfo> {
        self.produced
    }

    /// Check whether this expression is statically known to produce `target`.
    #[inline]
    pub fn produces(&self, target: TypeInfo) -> bool {
        self.produced == Some(target)
    }

    /// Insert an explicit coercion to `target`.
    ///
    /// The returned expression produces `target`; evaluating it fails with
    /// [`DisposalError::TypeMismatch`] if the inner value is of another type.
    pub fn convert(self, target: TypeInfo) -> Self {
        let source = self.produced.map(|t| t.name()).unwrap_or("<erased>");
        let inner = self.body;

        #[cfg(feature = "logging")]
        trace!(
            target: "scoped_disposal",
            from = source,
            to = target.name(),
            "Inserting conversion step"
        );

        Self {
            produced: Some(target),
            body: Arc::new(move |context: &ActivationContext| -> Result<AnyArc> {
                let value = inner(context)?;
                if (*value).type_id() == target.id() {
                    Ok(value)
                } else {
                    Err(DisposalError::type_mismatch(target, source))
                }
            }),
        }
    }

    /// Run the expression.
    #[inline]
    pub fn evaluate(&self, context: &ActivationContext) -> Result<AnyArc> {
        (self.body)(context)
    }

    /// Run the expression and downcast its value to `T`.
    pub fn evaluate_as<T: Injectable>(&self, context: &ActivationContext) -> Result<Arc<T>> {
        let source = self.produced.map(|t| t.name()).unwrap_or("<erased>");
        self.evaluate(context)?
            .downcast::<T>()
            .map_err(|_| DisposalError::type_mismatch(TypeInfo::of::<T>(), source))
    }
}

impl std::fmt::Debug for ActivationExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivationExpression")
            .field("produced", &self.produced.map(|t| t.name()))
            .finish()
    }
}

type ScopeFn = Arc<dyn Fn(&ActivationContext) -> Arc<dyn DisposalScope> + Send + Sync>;

/// An expression that yields a disposal scope when evaluated.
#[derive(Clone)]
pub struct ScopeExpression(ScopeFn);

impl ScopeExpression {
    /// The scope the activation was requested through.
    pub fn current() -> Self {
        Self(Arc::new(|context: &ActivationContext| {
            Arc::clone(context.scope())
        }))
    }

    /// A custom scope lookup.
    pub fn new<F>(lookup: F) -> Self
    where
        F: Fn(&ActivationContext) -> Arc<dyn DisposalScope> + Send + Sync + 'static,
    {
        Self(Arc::new(lookup))
    }

    /// Evaluate against a context.
    #[inline]
    pub fn evaluate(&self, context: &ActivationContext) -> Arc<dyn DisposalScope> {
        (self.0)(context)
    }
}

impl Default for ScopeExpression {
    fn default() -> Self {
        Self::current()
    }
}

impl std::fmt::Debug for ScopeExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ScopeExpression")
    }
}

// =============================================================================
// Compile-time request and result
// =============================================================================

/// Per-compile context for a single activated type.
#[derive(Debug, Clone)]
pub struct ActivationExpressionRequest {
    activation_type: TypeInfo,
    disposal_scope_expression: ScopeExpression,
}

impl ActivationExpressionRequest {
    /// Request for `activation_type` using the caller's scope.
    #[inline]
    pub fn new(activation_type: TypeInfo) -> Self {
        Self {
            activation_type,
            disposal_scope_expression: ScopeExpression::current(),
        }
    }

    /// Replace the scope expression.
    #[inline]
    pub fn with_disposal_scope_expression(mut self, expression: ScopeExpression) -> Self {
        self.disposal_scope_expression = expression;
        self
    }

    /// The type being compiled.
    #[inline]
    pub fn activation_type(&self) -> TypeInfo {
        self.activation_type
    }

    /// Expression that yields the current disposal scope at run time.
    #[inline]
    pub fn disposal_scope_expression(&self) -> &ScopeExpression {
        &self.disposal_scope_expression
    }
}

/// An expression together with the results it was built from.
#[derive(Debug, Clone)]
pub struct ActivationExpressionResult {
    expression: ActivationExpression,
    dependents: Vec<ActivationExpressionResult>,
}

impl ActivationExpressionResult {
    /// Result holding a single expression.
    #[inline]
    pub fn new(expression: ActivationExpression) -> Self {
        Self {
            expression,
            dependents: Vec::new(),
        }
    }

    /// Record a result this one depends on.
    #[inline]
    pub fn add_expression_result(&mut self, result: ActivationExpressionResult) {
        self.dependents.push(result);
    }

    /// The expression of this result.
    #[inline]
    pub fn expression(&self) -> &ActivationExpression {
        &self.expression
    }

    /// Direct dependents.
    #[inline]
    pub fn dependents(&self) -> &[ActivationExpressionResult] {
        &self.dependents
    }

    /// This expression followed by every transitive dependent, depth first.
    pub fn all_expressions(&self) -> Vec<&ActivationExpression> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(result) = stack.pop() {
            out.push(&result.expression);
            stack.extend(result.dependents.iter().rev());
        }
        out
    }

    /// Take the expression, dropping the dependency record.
    #[inline]
    pub fn into_expression(self) -> ActivationExpression {
        self.expression
    }
}
