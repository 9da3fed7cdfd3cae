//! Failure taxonomy for routing.
//!
//! - [`ConfigurationError`]: malformed route graphs or endpoints, raised at
//!   build time and never recorded on an exchange.
//! - [`ConversionUnavailable`]: a failed type conversion lookup; callers decide
//!   whether it is fatal.
//! - [`RouteError`]: everything that can be recorded on an exchange.

use std::error::Error as StdError;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Shared, clonable error cause.
pub type BoxError = Arc<dyn StdError + Send + Sync + 'static>;

// ---------------------------------------------------------------------------
// ConfigurationError
// ---------------------------------------------------------------------------

/// Route graph or endpoint configuration rejected before any exchange runs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("duplicate node id `{id}`")]
    DuplicateNodeId { id: String },
    #[error("node `{referenced_by}` references unknown node `{id}`")]
    UnknownNode { id: String, referenced_by: String },
    #[error("cycle in route graph: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
    #[error("branch {index} of choice `{choice}` can never be selected")]
    UnreachableBranch { choice: String, index: usize },
    #[error("node `{id}` is not reachable from the route root")]
    UnreachableNode { id: String },
    #[error("composite node `{id}` has no children")]
    EmptyComposite { id: String },
    #[error("route `{route}` has no root node")]
    MissingRoot { route: String },
    #[error("duplicate route id `{id}`")]
    DuplicateRoute { id: String },
    #[error("invalid endpoint uri `{uri}`: {reason}")]
    InvalidUri { uri: String, reason: String },
    #[error("no component registered for scheme `{scheme}`")]
    UnknownScheme { scheme: String },
    #[error("component `{scheme}` is already registered")]
    DuplicateComponent { scheme: String },
    #[error("endpoint `{uri}` does not accept option `{option}`")]
    UnknownOption { uri: String, option: String },
    #[error("invalid endpoint `{uri}`: {reason}")]
    InvalidEndpoint { uri: String, reason: String },
    #[error("endpoint `{uri}` has no {capability} capability")]
    MissingCapability { uri: String, capability: &'static str },
}

// ---------------------------------------------------------------------------
// ConversionUnavailable
// ---------------------------------------------------------------------------

/// No converter path exists (or the path declined the value).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no conversion from `{from}` to `{to}`")]
pub struct ConversionUnavailable {
    pub from: &'static str,
    pub to: &'static str,
}

// ---------------------------------------------------------------------------
// RouteError
// ---------------------------------------------------------------------------

/// Discriminant of [`RouteError`], used by retry classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    ConversionUnavailable,
    StepFailure,
    RedeliveryExhausted,
    Timeout,
    Cancelled,
    Rejected,
}

/// A failure recorded on an exchange.
///
/// Clonable so that multicast aggregation can carry a branch failure onto the
/// downstream exchange. `source()` walks the full cause chain; the original
/// cause survives wrapping in [`RouteError::RedeliveryExhausted`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum RouteError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    ConversionUnavailable(#[from] ConversionUnavailable),
    #[error("step failed: {source}")]
    StepFailure { source: BoxError },
    #[error("redelivery exhausted after {attempts} attempts: {last}")]
    RedeliveryExhausted {
        attempts: u32,
        #[source]
        last: Box<RouteError>,
    },
    #[error("step `{step}` timed out after {after_ms}ms")]
    Timeout { step: String, after_ms: u64 },
    #[error("exchange cancelled")]
    Cancelled,
    #[error("exchange rejected: {reason}")]
    Rejected { reason: String },
}

/// Plain-text step failure cause.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct StepMessage(String);

impl RouteError {
    /// Wraps an adapter error as a step failure.
    pub fn step<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::StepFailure {
            source: Arc::new(err),
        }
    }

    /// Step failure with a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::step(StepMessage(message.into()))
    }

    /// Converts an `anyhow::Error` into a step failure, keeping its chain.
    #[must_use]
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        let boxed: Box<dyn StdError + Send + Sync + 'static> = err.into();
        Self::StepFailure {
            source: Arc::from(boxed),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::ConversionUnavailable(_) => ErrorKind::ConversionUnavailable,
            Self::StepFailure { .. } => ErrorKind::StepFailure,
            Self::RedeliveryExhausted { .. } => ErrorKind::RedeliveryExhausted,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Rejected { .. } => ErrorKind::Rejected,
        }
    }

    /// The innermost non-exhaustion error: for `RedeliveryExhausted` this is
    /// the last underlying failure, otherwise `self`.
    #[must_use]
    pub fn last_cause(&self) -> &RouteError {
        match self {
            Self::RedeliveryExhausted { last, .. } => last.last_cause(),
            other => other,
        }
    }

    /// The deepest error in the `source()` chain.
    #[must_use]
    pub fn root_cause(&self) -> &(dyn StdError + 'static) {
        let mut current: &(dyn StdError + 'static) = self;
        while let Some(next) = current.source() {
            current = next;
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("connection refused")]
    struct Refused;

    #[test]
    fn exhausted_keeps_last_cause() {
        let err = RouteError::RedeliveryExhausted {
            attempts: 3,
            last: Box::new(RouteError::step(Refused)),
        };
        assert_eq!(err.kind(), ErrorKind::RedeliveryExhausted);
        assert_eq!(err.last_cause().kind(), ErrorKind::StepFailure);
        assert_eq!(err.root_cause().to_string(), "connection refused");
        assert!(err.to_string().contains("3 attempts"));
    }

    #[test]
    fn msg_builds_step_failure() {
        let err = RouteError::msg("boom");
        assert_eq!(err.kind(), ErrorKind::StepFailure);
        assert_eq!(err.root_cause().to_string(), "boom");
    }

    #[test]
    fn anyhow_context_survives() {
        let err = RouteError::from_anyhow(anyhow::anyhow!("disk full").context("writing spool"));
        assert!(err.to_string().contains("writing spool"));
    }

    #[test]
    fn clone_shares_cause() {
        let err = RouteError::step(Refused);
        let copy = err.clone();
        assert_eq!(copy.to_string(), err.to_string());
    }

    #[test]
    fn cycle_error_renders_path() {
        let err = ConfigurationError::Cycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "cycle in route graph: a -> b -> a");
    }
}
