//! Multicast aggregation strategies.
//!
//! A strategy folds branch results, in declared branch order, into one
//! exchange whose message and properties are then merged back into the
//! exchange that entered the multicast.

use switchyard_core::{Exchange, Value};

pub trait AggregationStrategy: Send + Sync {
    /// Folds `next` into `accumulated` (`None` for the first branch).
    /// `original` is the exchange as it entered the multicast.
    fn aggregate(&self, accumulated: Option<Exchange>, next: Exchange, original: &Exchange) -> Exchange;
}

/// The last branch's reply becomes the result.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastReplyWins;

impl AggregationStrategy for LastReplyWins {
    fn aggregate(&self, _accumulated: Option<Exchange>, next: Exchange, _original: &Exchange) -> Exchange {
        next
    }
}

/// Branch replies are discarded; the message that entered the multicast
/// continues downstream unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct OriginalUnchanged;

impl AggregationStrategy for OriginalUnchanged {
    fn aggregate(&self, accumulated: Option<Exchange>, _next: Exchange, original: &Exchange) -> Exchange {
        accumulated.unwrap_or_else(|| original.copy())
    }
}

/// Collects every branch body, in branch order, into a `Vec<Value>` body.
/// Branches without a body contribute nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectBodies;

impl AggregationStrategy for CollectBodies {
    fn aggregate(&self, accumulated: Option<Exchange>, mut next: Exchange, _original: &Exchange) -> Exchange {
        let body = next.message_mut().take_body();
        let mut acc = accumulated.unwrap_or_else(|| {
            let mut first = next.copy();
            first.message_mut().set_body(Value::new(Vec::<Value>::new()));
            first
        });
        let mut bodies = acc
            .message()
            .body()
            .and_then(|b| b.downcast_ref::<Vec<Value>>())
            .cloned()
            .unwrap_or_default();
        bodies.extend(body);
        acc.message_mut().set_body(Value::new(bodies));
        if let Some(error) = next.error().cloned() {
            acc.fail(error);
        }
        acc
    }
}
