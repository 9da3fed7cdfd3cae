//! The exchange: one unit of work travelling through a route.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::converter::TypeConverterRegistry;
use crate::error::{ConversionUnavailable, RouteError};
use crate::keys::properties;
use crate::message::Message;
use crate::unit_of_work::UnitOfWork;
use crate::value::Value;

static NEXT_EXCHANGE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique, monotonically increasing exchange identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExchangeId(pub u64);

impl ExchangeId {
    fn next() -> Self {
        Self(NEXT_EXCHANGE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ex-{}", self.0)
    }
}

/// Routing lifecycle of an exchange.
///
/// State machine: Created -> Routing -> {Completed, Failed}. Only the engine
/// performs transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Created,
    Routing,
    Completed,
    Failed,
}

/// A failure recorded on an exchange together with where it happened.
#[derive(Debug, Clone)]
pub struct Failure {
    error: RouteError,
    step: Option<String>,
    route: Option<String>,
    handled: bool,
}

impl Failure {
    fn new(error: RouteError) -> Self {
        Self {
            error,
            step: None,
            route: None,
            handled: false,
        }
    }

    #[must_use]
    pub fn error(&self) -> &RouteError {
        &self.error
    }

    /// Id of the step that reported the failure, once the engine has located it.
    #[must_use]
    pub fn step(&self) -> Option<&str> {
        self.step.as_deref()
    }

    /// Id of the route that was running when the failure was recorded.
    #[must_use]
    pub fn route(&self) -> Option<&str> {
        self.route.as_deref()
    }

    /// `true` once an error handler has dealt with this failure.
    #[must_use]
    pub fn is_handled(&self) -> bool {
        self.handled
    }
}

/// One unit of work: the current message, exchange-scoped properties, an
/// optional recorded failure, and a handle to the shared [`UnitOfWork`].
///
/// At most one unhandled failure is recorded at a time. Steps that need to
/// branch the payload make an explicit [`Exchange::copy`].
#[derive(Debug)]
pub struct Exchange {
    id: ExchangeId,
    state: ExchangeState,
    message: Message,
    properties: BTreeMap<String, Value>,
    failure: Option<Failure>,
    unit_of_work: Arc<UnitOfWork>,
}

impl Exchange {
    /// Creates an exchange with an empty message and a fresh unit of work.
    #[must_use]
    pub fn new() -> Self {
        Self::with_message(Message::new())
    }

    /// Creates an exchange carrying `message`.
    #[must_use]
    pub fn with_message(message: Message) -> Self {
        let id = ExchangeId::next();
        Self {
            id,
            state: ExchangeState::Created,
            message,
            properties: BTreeMap::new(),
            failure: None,
            unit_of_work: Arc::new(UnitOfWork::new(id)),
        }
    }

    #[must_use]
    pub fn id(&self) -> ExchangeId {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// Moves the exchange to `state`. Reserved for the routing engine.
    pub fn set_state(&mut self, state: ExchangeState) {
        self.state = state;
    }

    #[must_use]
    pub fn unit_of_work(&self) -> &Arc<UnitOfWork> {
        &self.unit_of_work
    }

    // -- message -----------------------------------------------------------

    #[must_use]
    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn message_mut(&mut self) -> &mut Message {
        &mut self.message
    }

    /// Replaces the current message, returning the previous one.
    pub fn set_message(&mut self, message: Message) -> Message {
        std::mem::replace(&mut self.message, message)
    }

    /// Moves the message out, leaving an empty one behind.
    pub fn take_message(&mut self) -> Message {
        std::mem::take(&mut self.message)
    }

    // -- properties --------------------------------------------------------

    #[must_use]
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.properties.insert(key.into(), value.into())
    }

    pub fn remove_property(&mut self, key: &str) -> Option<Value> {
        self.properties.remove(key)
    }

    #[must_use]
    pub fn properties(&self) -> &BTreeMap<String, Value> {
        &self.properties
    }

    // -- typed access ------------------------------------------------------

    /// Reads header `name` as a `T`, converting through `registry` if needed.
    ///
    /// `Ok(None)` means the header is absent.
    ///
    /// # Errors
    ///
    /// Returns `ConversionUnavailable` if the header exists but cannot be
    /// converted to `T`.
    pub fn header_as<T>(
        &self,
        name: &str,
        registry: &TypeConverterRegistry,
    ) -> Result<Option<T>, ConversionUnavailable>
    where
        T: Any + Clone + Send + Sync,
    {
        self.message
            .header(name)
            .map(|v| registry.convert_to::<T>(v, Some(self)))
            .transpose()
    }

    /// Reads the body as a `T`. `Ok(None)` means there is no body.
    ///
    /// # Errors
    ///
    /// Returns `ConversionUnavailable` if the body cannot be converted to `T`.
    pub fn body_as<T>(&self, registry: &TypeConverterRegistry) -> Result<Option<T>, ConversionUnavailable>
    where
        T: Any + Clone + Send + Sync,
    {
        self.message
            .body()
            .map(|v| registry.convert_to::<T>(v, Some(self)))
            .transpose()
    }

    /// Reads property `key` as a `T`. `Ok(None)` means the property is absent.
    ///
    /// # Errors
    ///
    /// Returns `ConversionUnavailable` if the property cannot be converted to `T`.
    pub fn property_as<T>(
        &self,
        key: &str,
        registry: &TypeConverterRegistry,
    ) -> Result<Option<T>, ConversionUnavailable>
    where
        T: Any + Clone + Send + Sync,
    {
        self.properties
            .get(key)
            .map(|v| registry.convert_to::<T>(v, Some(self)))
            .transpose()
    }

    // -- failure -----------------------------------------------------------

    /// Records a failure. Returns `false` (and records nothing) if an
    /// unhandled failure is already present; a handled one is overwritten.
    pub fn fail(&mut self, error: impl Into<RouteError>) -> bool {
        if self.is_failed() {
            return false;
        }
        self.failure = Some(Failure::new(error.into()));
        true
    }

    /// `true` while an unhandled failure is recorded.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failure.as_ref().is_some_and(|f| !f.handled)
    }

    /// The unhandled failure's error, if any.
    #[must_use]
    pub fn error(&self) -> Option<&RouteError> {
        self.failure.as_ref().filter(|f| !f.handled).map(|f| &f.error)
    }

    /// The recorded failure, handled or not.
    #[must_use]
    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    /// Fills in the originating step and route of the current failure where
    /// they are not known yet.
    pub fn locate_failure(&mut self, step: &str, route: &str) {
        if let Some(failure) = self.failure.as_mut().filter(|f| !f.handled) {
            if failure.step.is_none() {
                failure.step = Some(step.to_string());
            }
            if failure.route.is_none() {
                failure.route = Some(route.to_string());
            }
        }
    }

    /// Replaces the unhandled failure's error with `wrap(error)`, keeping its
    /// origin. No-op without an unhandled failure.
    pub fn wrap_failure(&mut self, wrap: impl FnOnce(RouteError) -> RouteError) {
        if let Some(failure) = self.failure.as_mut().filter(|f| !f.handled) {
            let inner = std::mem::replace(&mut failure.error, RouteError::Cancelled);
            failure.error = wrap(inner);
        }
    }

    /// Marks the current failure handled and stores its error under
    /// [`properties::FAILURE_CAUGHT`]. Returns the caught error.
    pub fn mark_handled(&mut self) -> Option<RouteError> {
        let failure = self.failure.as_mut().filter(|f| !f.handled)?;
        failure.handled = true;
        let caught = failure.error.clone();
        self.properties
            .insert(properties::FAILURE_CAUGHT.to_string(), Value::new(caught.clone()));
        Some(caught)
    }

    /// Removes any recorded failure.
    pub fn clear_failure(&mut self) -> Option<Failure> {
        self.failure.take()
    }

    // -- routing control ---------------------------------------------------

    /// Asks the engine to stop routing this exchange after the current step,
    /// without recording a failure.
    pub fn stop_routing(&mut self) {
        self.set_property(properties::ROUTE_STOP, true);
    }

    #[must_use]
    pub fn is_routing_stopped(&self) -> bool {
        self.property(properties::ROUTE_STOP)
            .and_then(|v| v.downcast_ref::<bool>())
            .copied()
            .unwrap_or(false)
    }

    /// Shallow copy for branching: headers and properties by value, body by
    /// reference, same unit of work, new id, no failure. The source id is
    /// recorded under [`properties::CORRELATION_ID`].
    #[must_use]
    pub fn copy(&self) -> Exchange {
        let mut properties = self.properties.clone();
        properties.insert(properties::CORRELATION_ID.to_string(), Value::new(self.id));
        Exchange {
            id: ExchangeId::next(),
            state: ExchangeState::Created,
            message: self.message.clone(),
            properties,
            failure: None,
            unit_of_work: Arc::clone(&self.unit_of_work),
        }
    }
}

impl Default for Exchange {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn new_exchange_is_empty_and_created() {
        let ex = Exchange::new();
        assert_eq!(ex.state(), ExchangeState::Created);
        assert!(ex.message().body().is_none());
        assert!(!ex.is_failed());
        assert!(ex.properties().is_empty());
    }

    #[test]
    fn ids_are_monotonic() {
        let a = Exchange::new();
        let b = Exchange::new();
        assert!(b.id() > a.id());
    }

    #[test]
    fn fail_is_noop_while_unhandled_failure_present() {
        let mut ex = Exchange::new();
        assert!(ex.fail(RouteError::msg("first")));
        assert!(!ex.fail(RouteError::Cancelled));
        assert_eq!(ex.error().unwrap().to_string(), "step failed: first");
    }

    #[test]
    fn handled_failure_can_be_overwritten() {
        let mut ex = Exchange::new();
        ex.fail(RouteError::msg("first"));
        let caught = ex.mark_handled().unwrap();
        assert_eq!(caught.kind(), ErrorKind::StepFailure);
        assert!(!ex.is_failed());
        assert!(ex.error().is_none());
        assert!(ex.failure().unwrap().is_handled());
        assert!(ex
            .property(properties::FAILURE_CAUGHT)
            .unwrap()
            .is::<RouteError>());

        assert!(ex.fail(RouteError::Cancelled));
        assert_eq!(ex.error().unwrap().kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn locate_failure_only_fills_unknown_origin() {
        let mut ex = Exchange::new();
        ex.fail(RouteError::msg("x"));
        ex.locate_failure("inner", "r1");
        ex.locate_failure("outer", "r2");
        let failure = ex.failure().unwrap();
        assert_eq!(failure.step(), Some("inner"));
        assert_eq!(failure.route(), Some("r1"));
    }

    #[test]
    fn wrap_failure_keeps_origin() {
        let mut ex = Exchange::new();
        ex.fail(RouteError::msg("x"));
        ex.locate_failure("s", "r");
        ex.wrap_failure(|last| RouteError::RedeliveryExhausted {
            attempts: 2,
            last: Box::new(last),
        });
        let failure = ex.failure().unwrap();
        assert_eq!(failure.error().kind(), ErrorKind::RedeliveryExhausted);
        assert_eq!(failure.step(), Some("s"));
    }

    #[test]
    fn copy_shares_body_and_unit_of_work() {
        let mut ex = Exchange::with_message(Message::with_body("payload"));
        ex.set_property("tenant", "acme");
        ex.fail(RouteError::msg("not copied"));

        let mut copy = ex.copy();
        copy.set_property("tenant", "other");
        copy.message_mut().set_header("h", 1_i64);

        assert_ne!(copy.id(), ex.id());
        assert!(!copy.is_failed());
        assert!(ex.message().header("h").is_none());
        assert_eq!(ex.property("tenant").and_then(Value::as_str), Some("acme"));
        assert!(copy
            .message()
            .body()
            .unwrap()
            .ptr_eq(ex.message().body().unwrap()));
        assert!(Arc::ptr_eq(copy.unit_of_work(), ex.unit_of_work()));
        assert_eq!(
            copy.property(properties::CORRELATION_ID)
                .and_then(|v| v.downcast_ref::<ExchangeId>()),
            Some(&ex.id())
        );
    }

    #[test]
    fn stop_routing_sets_flag() {
        let mut ex = Exchange::new();
        assert!(!ex.is_routing_stopped());
        ex.stop_routing();
        assert!(ex.is_routing_stopped());
    }

    #[test]
    fn typed_header_access_goes_through_registry() {
        let registry = TypeConverterRegistry::builder().with_defaults().build();
        let mut ex = Exchange::new();
        ex.message_mut().set_header("count", "42");
        ex.message_mut().set_header("blob", Value::new(vec![0xff_u8]));

        assert_eq!(ex.header_as::<i64>("count", &registry), Ok(Some(42)));
        assert_eq!(ex.header_as::<i64>("missing", &registry), Ok(None));
        assert!(ex.header_as::<bool>("blob", &registry).is_err());
    }
}
