//! Reserved header and property names.
//!
//! Headers use the `Switchyard` prefix, properties the `switchyard.` prefix.
//! Adapters must not write these keys for unrelated purposes.

/// Header names written by the engine onto the message.
pub mod headers {
    /// Number of redeliveries performed so far for the current protected scope.
    pub const REDELIVERY_COUNTER: &str = "SwitchyardRedeliveryCounter";
    /// `true` once the message has been redelivered at least once.
    pub const REDELIVERED: &str = "SwitchyardRedelivered";
    /// Maximum redeliveries allowed by the active policy.
    pub const REDELIVERY_MAX_COUNTER: &str = "SwitchyardRedeliveryMaxCounter";
}

/// Exchange property names written by the engine.
pub mod properties {
    /// Identifier of the route the exchange entered most recently.
    pub const ROUTE_ID: &str = "switchyard.route-id";
    /// Total invocations of the innermost protected scope that last ran.
    pub const ATTEMPTS: &str = "switchyard.attempts";
    /// `RouteError` captured when an error handler marked a failure handled.
    pub const FAILURE_CAUGHT: &str = "switchyard.failure-caught";
    /// Set to `true` when redelivery attempts were exhausted.
    pub const REDELIVERY_EXHAUSTED: &str = "switchyard.redelivery-exhausted";
    /// Set to `true` to stop routing without recording a failure.
    pub const ROUTE_STOP: &str = "switchyard.route-stop";
    /// `ExchangeId` of the exchange a copy was made from.
    pub const CORRELATION_ID: &str = "switchyard.correlation-id";
    /// Zero-based branch index on multicast copies.
    pub const MULTICAST_INDEX: &str = "switchyard.multicast-index";
}

/// Returns `true` if `key` falls in a reserved namespace.
#[must_use]
pub fn is_reserved(key: &str) -> bool {
    key.starts_with("Switchyard") || key.starts_with("switchyard.")
}
