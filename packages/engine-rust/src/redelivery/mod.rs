//! Error handlers: supervision of a protected scope.
//!
//! Per protected invocation the handler runs
//! `ATTEMPT -> SUCCESS | RETRYABLE_FAILURE -> delay -> ATTEMPT | FATAL_FAILURE`.
//! [`ErrorHandler`] is the declaration attached to a route or try-scope;
//! route assembly resolves it into a [`ScopeHandler`] the walker consults.

pub mod policy;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use switchyard_core::{ErrorKind, Exchange};

use crate::graph::predicate::Predicate;
use crate::graph::Node;

pub use policy::{Backoff, RedeliveryPolicy};

type RedeliveryHook = Arc<dyn Fn(&mut Exchange) + Send + Sync>;

/// What happens to a failure the handler will not (or can no longer) retry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Recovery {
    /// Leave the failure in place and let it propagate upward.
    #[default]
    Propagate,
    /// Mark the failure handled, run the fallback node, and continue.
    Handle(String),
    /// Mark the failure handled, run the dead-letter node, then stop routing.
    /// With `use_original_message` the dead-letter node receives the message
    /// as it was when the exchange entered its first route.
    DeadLetter {
        node: String,
        use_original_message: bool,
    },
}

/// Declarative error handler for a route or try-scope.
#[derive(Clone)]
pub struct ErrorHandler {
    policy: RedeliveryPolicy,
    retryable: Vec<ErrorKind>,
    retry_while: Option<Predicate>,
    on_redelivery: Option<RedeliveryHook>,
    recovery: Recovery,
}

impl ErrorHandler {
    /// Handler with `policy`, retrying step failures and timeouts.
    #[must_use]
    pub fn new(policy: RedeliveryPolicy) -> Self {
        Self {
            policy,
            retryable: vec![ErrorKind::StepFailure, ErrorKind::Timeout],
            retry_while: None,
            on_redelivery: None,
            recovery: Recovery::Propagate,
        }
    }

    /// Replaces the set of retryable failure kinds. `Cancelled` is never
    /// retried, whatever this set contains.
    #[must_use]
    pub fn retry_on(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable = kinds.into_iter().collect();
        self
    }

    /// Additional condition for retrying; checked against the failed exchange.
    #[must_use]
    pub fn retry_while(mut self, predicate: Predicate) -> Self {
        self.retry_while = Some(predicate);
        self
    }

    /// Hook run on the restored exchange right before each redelivery.
    #[must_use]
    pub fn on_redelivery(mut self, hook: impl Fn(&mut Exchange) + Send + Sync + 'static) -> Self {
        self.on_redelivery = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn recovery(mut self, recovery: Recovery) -> Self {
        self.recovery = recovery;
        self
    }

    #[must_use]
    pub fn policy(&self) -> &RedeliveryPolicy {
        &self.policy
    }

    /// Node id the recovery refers to, if any.
    pub(crate) fn recovery_target(&self) -> Option<&str> {
        match &self.recovery {
            Recovery::Propagate => None,
            Recovery::Handle(node) | Recovery::DeadLetter { node, .. } => Some(node),
        }
    }

    /// Binds the recovery reference to its assembled node.
    pub(crate) fn resolve(self, target: Option<Arc<Node>>) -> ScopeHandler {
        let recovery = match (self.recovery, target) {
            (Recovery::Handle(_), Some(node)) => ResolvedRecovery::Handle(node),
            (
                Recovery::DeadLetter {
                    use_original_message, ..
                },
                Some(node),
            ) => ResolvedRecovery::DeadLetter {
                node,
                use_original_message,
            },
            _ => ResolvedRecovery::Propagate,
        };
        ScopeHandler {
            policy: self.policy,
            retryable: self.retryable,
            retry_while: self.retry_while,
            on_redelivery: self.on_redelivery,
            recovery,
        }
    }
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new(RedeliveryPolicy::default())
    }
}

impl fmt::Debug for ErrorHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorHandler")
            .field("policy", &self.policy)
            .field("retryable", &self.retryable)
            .field("retry_while", &self.retry_while)
            .field("recovery", &self.recovery)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Resolved handler
// ---------------------------------------------------------------------------

pub(crate) enum ResolvedRecovery {
    Propagate,
    Handle(Arc<Node>),
    DeadLetter {
        node: Arc<Node>,
        use_original_message: bool,
    },
}

/// Verdict on a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decision {
    /// Re-run the scope after `delay`.
    Retry { delay: Duration },
    /// Retryable, but the redelivery budget is spent.
    Exhausted,
    /// Not retryable.
    Fatal,
}

/// An [`ErrorHandler`] bound to the nodes of one assembled route.
pub struct ScopeHandler {
    pub(crate) policy: RedeliveryPolicy,
    retryable: Vec<ErrorKind>,
    retry_while: Option<Predicate>,
    on_redelivery: Option<RedeliveryHook>,
    pub(crate) recovery: ResolvedRecovery,
}

impl ScopeHandler {
    /// `true` if a failed attempt may ever be retried.
    pub(crate) fn retries(&self) -> bool {
        self.policy.maximum_redeliveries > 0
    }

    /// `true` if the scope must keep the message it was entered with: for
    /// redeliveries and for the recovery branch, which starts from it.
    pub(crate) fn needs_snapshot(&self) -> bool {
        self.retries() || !matches!(self.recovery, ResolvedRecovery::Propagate)
    }

    /// Classifies the failure on `exchange` after `attempts` invocations.
    pub(crate) fn decide(&self, exchange: &Exchange, attempts: u32, cancelled: bool) -> Decision {
        let Some(error) = exchange.error() else {
            return Decision::Fatal;
        };
        let kind = error.kind();
        if cancelled || kind == ErrorKind::Cancelled || !self.retryable.contains(&kind) {
            return Decision::Fatal;
        }
        if self
            .retry_while
            .as_ref()
            .is_some_and(|predicate| !predicate.evaluate(exchange))
        {
            return Decision::Fatal;
        }
        if !self.retries() {
            return Decision::Fatal;
        }
        if attempts > self.policy.maximum_redeliveries {
            return Decision::Exhausted;
        }
        Decision::Retry {
            delay: self.policy.delay_for(attempts),
        }
    }

    pub(crate) fn before_redelivery(&self, exchange: &mut Exchange) {
        if let Some(hook) = &self.on_redelivery {
            hook(exchange);
        }
    }
}

impl fmt::Debug for ScopeHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let recovery = match &self.recovery {
            ResolvedRecovery::Propagate => "propagate".to_string(),
            ResolvedRecovery::Handle(node) => format!("handle({})", node.id()),
            ResolvedRecovery::DeadLetter { node, .. } => format!("dead-letter({})", node.id()),
        };
        f.debug_struct("ScopeHandler")
            .field("policy", &self.policy)
            .field("recovery", &recovery)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use switchyard_core::RouteError;

    use super::*;

    fn handler(max: u32) -> ScopeHandler {
        ErrorHandler::new(
            RedeliveryPolicy::default()
                .with_maximum_redeliveries(max)
                .with_backoff(Backoff::fixed(Duration::from_millis(5))),
        )
        .resolve(None)
    }

    fn failed(error: RouteError) -> Exchange {
        let mut ex = Exchange::new();
        ex.fail(error);
        ex
    }

    #[test]
    fn retries_until_budget_spent() {
        let h = handler(2);
        let ex = failed(RouteError::msg("boom"));
        assert_eq!(
            h.decide(&ex, 1, false),
            Decision::Retry {
                delay: Duration::from_millis(5)
            }
        );
        assert!(matches!(h.decide(&ex, 2, false), Decision::Retry { .. }));
        assert_eq!(h.decide(&ex, 3, false), Decision::Exhausted);
    }

    #[test]
    fn cancelled_is_never_retried() {
        let h = handler(5);
        assert_eq!(h.decide(&failed(RouteError::Cancelled), 1, false), Decision::Fatal);
        assert_eq!(h.decide(&failed(RouteError::msg("x")), 1, true), Decision::Fatal);
    }

    #[test]
    fn non_retryable_kinds_are_fatal() {
        let h = ErrorHandler::new(RedeliveryPolicy::default().with_maximum_redeliveries(3))
            .retry_on([ErrorKind::Timeout])
            .resolve(None);
        assert_eq!(h.decide(&failed(RouteError::msg("x")), 1, false), Decision::Fatal);
        let timeout = RouteError::Timeout {
            step: "s".into(),
            after_ms: 10,
        };
        assert!(matches!(h.decide(&failed(timeout), 1, false), Decision::Retry { .. }));
    }

    #[test]
    fn retry_while_gates_retries() {
        let h = ErrorHandler::new(RedeliveryPolicy::default().with_maximum_redeliveries(3))
            .retry_while(Predicate::header_exists("retry"))
            .resolve(None);
        let mut ex = failed(RouteError::msg("x"));
        assert_eq!(h.decide(&ex, 1, false), Decision::Fatal);
        ex.message_mut().set_header("retry", true);
        assert!(matches!(h.decide(&ex, 1, false), Decision::Retry { .. }));
    }

    #[test]
    fn zero_redeliveries_is_fatal_not_exhausted() {
        assert_eq!(handler(0).decide(&failed(RouteError::msg("x")), 1, false), Decision::Fatal);
    }
}
