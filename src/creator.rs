//! Disposal expression creators
//!
//! A creator wraps an already-built construction expression so that, every
//! time it runs, the constructed instance is registered with the disposal
//! scope that should own it, and then handed back unchanged.

use crate::ambient::AmbientScopeResolver;
use crate::config::{ActivationConfiguration, AnyArc, CleanupDelegate, CleanupStrategy};
use crate::expression::{
    ActivationContext, ActivationExpression, ActivationExpressionRequest, ActivationExpressionResult,
};
use crate::registration::{
    CleanupRegisterFn, PlainRegisterFn, RegistrationMethodCache, RegistrationOperation,
    RegistrationTarget, default_operations,
};
use crate::{DisposalError, DisposalScope, Result};
use std::sync::Arc;

#[cfg(feature = "logging")]
use tracing::{debug, warn};

/// Builds the disposal-registration step of an activation.
pub trait DisposalScopeExpressionCreator: Send + Sync {
    /// Wrap `result` so that its value is registered for disposal.
    ///
    /// The returned result evaluates to the same instance as `result` and
    /// lists `result` among its dependents.
    fn create_expression(
        &self,
        scope: &Arc<dyn DisposalScope>,
        request: &ActivationExpressionRequest,
        configuration: &ActivationConfiguration,
        result: ActivationExpressionResult,
    ) -> Result<ActivationExpressionResult>;
}

/// Creator that routes registrations made through a container scope into the
/// current unit of work's ambient scope.
///
/// # Examples
///
/// ```rust
/// use scoped_disposal::*;
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicBool, Ordering};
///
/// struct Connection(AtomicBool);
///
/// impl Disposable for Connection {
///     fn dispose(&self) {
///         self.0.store(true, Ordering::SeqCst);
///     }
/// }
///
/// let creator = RequestDisposalScopeExpressionCreator::new();
/// let root: Arc<dyn DisposalScope> = Arc::new(LifetimeScope::container());
///
/// let configuration = ActivationConfiguration::new::<Connection>();
/// let request = ActivationExpressionRequest::new(configuration.activation_type());
/// let construction = ActivationExpressionResult::new(ActivationExpression::from_fn(|| {
///     Connection(AtomicBool::new(false))
/// }));
///
/// let wrapped = creator
///     .create_expression(&root, &request, &configuration, construction)
///     .unwrap();
///
/// let unit_of_work = UnitOfWork::new();
/// let context = ActivationContext::new(Arc::clone(&root)).with_unit_of_work(unit_of_work.clone());
/// let connection = wrapped.expression().evaluate_as::<Connection>(&context).unwrap();
///
/// creator.resolver().release_ambient(Some(&unit_of_work));
/// assert!(connection.0.load(Ordering::SeqCst));
/// assert!(root.is_empty());
/// ```
pub struct RequestDisposalScopeExpressionCreator {
    resolver: AmbientScopeResolver,
    operations: RegistrationMethodCache,
}

impl RequestDisposalScopeExpressionCreator {
    /// Creator with the default operations and the process-wide ambient key.
    pub fn new() -> Self {
        Self::with_resolver(AmbientScopeResolver::new())
    }

    /// Creator with the default operations and a specific resolver.
    pub fn with_resolver(resolver: AmbientScopeResolver) -> Self {
        Self {
            resolver,
            operations: RegistrationMethodCache::new(
                default_operations(),
                std::any::type_name::<Self>(),
            ),
        }
    }

    /// Creator over a custom operation table.
    ///
    /// Both registration roles are resolved immediately; a table missing
    /// either one is rejected here.
    pub fn with_operations(
        resolver: AmbientScopeResolver,
        operations: Arc<[RegistrationOperation]>,
    ) -> Result<Self> {
        let operations = RegistrationMethodCache::new(operations, std::any::type_name::<Self>());
        operations.resolve_all()?;
        Ok(Self {
            resolver,
            operations,
        })
    }

    /// The ambient resolver used by generated registrations.
    #[inline]
    pub fn resolver(&self) -> &AmbientScopeResolver {
        &self.resolver
    }

    /// The memoized registration operations.
    #[inline]
    pub fn operations(&self) -> &RegistrationMethodCache {
        &self.operations
    }

    /// The delegate to use, if its shape fits the activation type.
    fn usable_delegate(configuration: &ActivationConfiguration) -> Option<CleanupDelegate> {
        match configuration.cleanup() {
            CleanupStrategy::Custom(delegate) if delegate.accepts(configuration.activation_type()) => {
                Some(delegate.clone())
            }
            CleanupStrategy::Custom(_delegate) => {
                #[cfg(feature = "logging")]
                warn!(
                    target: "scoped_disposal",
                    activation_type = configuration.activation_type().name(),
                    delegate_parameter = _delegate.parameter_type().name(),
                    "Cleanup delegate does not match activation type, using default dispose"
                );
                None
            }
            CleanupStrategy::Default => None,
        }
    }

    fn plain_registration(
        &self,
        configuration: &ActivationConfiguration,
        request: &ActivationExpressionRequest,
        value: ActivationExpression,
        source: &'static str,
        call: PlainRegisterFn,
    ) -> ActivationExpression {
        let resolver = self.resolver.clone();
        let scope_expression = request.disposal_scope_expression().clone();
        let activation_type = configuration.activation_type();
        let into_disposable = configuration.into_disposable_fn();

        ActivationExpression::from_parts(
            Some(activation_type),
            Arc::new(move |context: &ActivationContext| -> Result<AnyArc> {
                let instance = value.evaluate(context)?;
                let disposable = into_disposable(Arc::clone(&instance))
                    .ok_or_else(|| DisposalError::type_mismatch(activation_type, source))?;
                let target = RegistrationTarget::new(
                    &resolver,
                    context.unit_of_work(),
                    scope_expression.evaluate(context),
                );
                call(&target, disposable)?;
                Ok(instance)
            }),
        )
    }

    fn cleanup_registration(
        &self,
        configuration: &ActivationConfiguration,
        request: &ActivationExpressionRequest,
        value: ActivationExpression,
        delegate: CleanupDelegate,
        call: CleanupRegisterFn,
    ) -> ActivationExpression {
        let resolver = self.resolver.clone();
        let scope_expression = request.disposal_scope_expression().clone();

        ActivationExpression::from_parts(
            Some(configuration.activation_type()),
            Arc::new(move |context: &ActivationContext| -> Result<AnyArc> {
                let instance: AnyArc = value.evaluate(context)?;
                let owned = Arc::clone(&instance);
                let cleanup = delegate.clone();
                let target = RegistrationTarget::new(
                    &resolver,
                    context.unit_of_work(),
                    scope_expression.evaluate(context),
                );
                call(&target, Box::new(move || cleanup.invoke(&owned)))?;
                Ok(instance)
            }),
        )
    }
}

impl DisposalScopeExpressionCreator for RequestDisposalScopeExpressionCreator {
    fn create_expression(
        &self,
        _scope: &Arc<dyn DisposalScope>,
        request: &ActivationExpressionRequest,
        configuration: &ActivationConfiguration,
        result: ActivationExpressionResult,
    ) -> Result<ActivationExpressionResult> {
        let activation_type = configuration.activation_type();

        let source = result
            .expression()
            .produced_type()
            .map(|t| t.name())
            .unwrap_or("<erased>");
        let mut value = result.expression().clone();
        if !value.produces(activation_type) {
            value = value.convert(activation_type);
        }

        let delegate = Self::usable_delegate(configuration);

        #[cfg(feature = "logging")]
        debug!(
            target: "scoped_disposal",
            activation_type = activation_type.name(),
            scope_id = _scope.id().id(),
            custom_cleanup = delegate.is_some(),
            "Compiling disposal registration"
        );

        let expression = match delegate {
            Some(delegate) => {
                let call = self.operations.cleanup_register_operation()?;
                self.cleanup_registration(configuration, request, value, delegate, call)
            }
            None => {
                let call = self.operations.plain_register_operation()?;
                self.plain_registration(configuration, request, value, source, call)
            }
        };

        let mut wrapped = ActivationExpressionResult::new(expression);
        wrapped.add_expression_result(result);
        Ok(wrapped)
    }
}

impl Default for RequestDisposalScopeExpressionCreator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RequestDisposalScopeExpressionCreator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDisposalScopeExpressionCreator")
            .field("resolver", &self.resolver)
            .field("operations", &self.operations)
            .finish()
    }
}
