//! Per-exchange scope for completion callbacks and route-stack diagnostics.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::warn;

use crate::exchange::{Exchange, ExchangeId};
use crate::message::Message;

type Callback = Box<dyn FnOnce(&Exchange) + Send + 'static>;

/// When a registered callback fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// On every completion, success or failure.
    Always,
    /// Only when the exchange completes with an unhandled failure.
    OnFailure,
}

#[derive(Default)]
struct Inner {
    callbacks: Vec<(Trigger, Callback)>,
    route_stack: Vec<String>,
    original: Option<Message>,
}

/// Scope created alongside an exchange and shared with its copies.
///
/// Steps register cleanup callbacks here (e.g. releasing a resource acquired
/// mid-route). [`UnitOfWork::done`] runs them exactly once, in reverse
/// registration order, whichever way the exchange finished.
pub struct UnitOfWork {
    exchange_id: ExchangeId,
    inner: Mutex<Inner>,
    done: AtomicBool,
    done_signal: watch::Sender<bool>,
}

impl UnitOfWork {
    pub(crate) fn new(exchange_id: ExchangeId) -> Self {
        let (done_signal, _rx) = watch::channel(false);
        Self {
            exchange_id,
            inner: Mutex::new(Inner::default()),
            done: AtomicBool::new(false),
            done_signal,
        }
    }

    /// Id of the exchange this unit of work was created for.
    #[must_use]
    pub fn exchange_id(&self) -> ExchangeId {
        self.exchange_id
    }

    /// Registers a callback that runs on completion, success or failure.
    pub fn on_completion(&self, callback: impl FnOnce(&Exchange) + Send + 'static) {
        self.inner
            .lock()
            .callbacks
            .push((Trigger::Always, Box::new(callback)));
    }

    /// Registers a callback that runs only if the exchange ends failed.
    pub fn on_failure(&self, callback: impl FnOnce(&Exchange) + Send + 'static) {
        self.inner
            .lock()
            .callbacks
            .push((Trigger::OnFailure, Box::new(callback)));
    }

    // -- route stack -------------------------------------------------------

    /// Records entry into route `route_id`.
    pub fn push_route(&self, route_id: &str) {
        self.inner.lock().route_stack.push(route_id.to_string());
    }

    /// Records exit from the innermost route.
    pub fn pop_route(&self) -> Option<String> {
        self.inner.lock().route_stack.pop()
    }

    /// Innermost route currently entered.
    #[must_use]
    pub fn current_route(&self) -> Option<String> {
        self.inner.lock().route_stack.last().cloned()
    }

    /// Routes entered, outermost first.
    #[must_use]
    pub fn route_stack(&self) -> Vec<String> {
        self.inner.lock().route_stack.clone()
    }

    // -- original message --------------------------------------------------

    /// Stores the message as it was at route entry. Only the first call has
    /// an effect.
    pub fn capture_original(&self, message: &Message) {
        let mut inner = self.inner.lock();
        if inner.original.is_none() {
            inner.original = Some(message.clone());
        }
    }

    /// The message as it was when the exchange first entered a route.
    #[must_use]
    pub fn original_message(&self) -> Option<Message> {
        self.inner.lock().original.clone()
    }

    // -- completion --------------------------------------------------------

    /// Runs registered callbacks in reverse registration order. Returns
    /// `false` without running anything if `done` already ran.
    ///
    /// Failure-only callbacks run when `exchange.is_failed()`. A callback
    /// that panics is logged and skipped; the rest still run.
    pub fn done(&self, exchange: &Exchange) -> bool {
        if self.done.swap(true, Ordering::AcqRel) {
            return false;
        }
        let callbacks = std::mem::take(&mut self.inner.lock().callbacks);
        let failed = exchange.is_failed();
        for (trigger, callback) in callbacks.into_iter().rev() {
            if (trigger == Trigger::Always || failed)
                && std::panic::catch_unwind(AssertUnwindSafe(|| callback(exchange))).is_err()
            {
                warn!(exchange_id = %self.exchange_id, "unit of work callback panicked");
            }
        }
        // Ignore send errors -- no one may be waiting.
        let _ = self.done_signal.send(true);
        true
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Resolves once [`UnitOfWork::done`] has run.
    pub async fn wait_done(&self) {
        let mut rx = self.done_signal.subscribe();
        // The sender lives as long as `self`, so this only returns once done.
        let _ = rx.wait_for(|done| *done).await;
    }
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("UnitOfWork")
            .field("exchange_id", &self.exchange_id)
            .field("callbacks", &inner.callbacks.len())
            .field("route_stack", &inner.route_stack)
            .field("done", &self.is_done())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::error::RouteError;

    #[test]
    fn callbacks_run_once_in_reverse_order() {
        let ex = Exchange::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            ex.unit_of_work().on_completion(move |_| order.lock().push(i));
        }

        assert!(ex.unit_of_work().done(&ex));
        assert!(!ex.unit_of_work().done(&ex));
        assert_eq!(*order.lock(), vec![2, 1, 0]);
    }

    #[test]
    fn panicking_callback_does_not_stop_the_rest() {
        let ex = Exchange::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (first, last) = (Arc::clone(&order), Arc::clone(&order));
        ex.unit_of_work().on_completion(move |_| first.lock().push("registered first"));
        ex.unit_of_work().on_completion(|_| panic!("cleanup blew up"));
        ex.unit_of_work().on_completion(move |_| last.lock().push("registered last"));

        assert!(ex.unit_of_work().done(&ex));
        assert!(ex.unit_of_work().is_done());
        assert_eq!(*order.lock(), vec!["registered last", "registered first"]);
    }

    #[test]
    fn failure_callbacks_skip_successful_exchanges() {
        let ex = Exchange::new();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (Arc::clone(&hits), Arc::clone(&hits));
        ex.unit_of_work().on_failure(move |_| a.lock().push("failure"));
        ex.unit_of_work().on_completion(move |_| b.lock().push("completion"));

        ex.unit_of_work().done(&ex);
        assert_eq!(*hits.lock(), vec!["completion"]);
    }

    #[test]
    fn failure_callbacks_run_on_failed_exchanges() {
        let mut ex = Exchange::new();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (Arc::clone(&hits), Arc::clone(&hits));
        ex.unit_of_work().on_failure(move |e| a.lock().push(e.error().unwrap().to_string()));
        ex.unit_of_work().on_completion(move |_| b.lock().push("completion".to_string()));
        ex.fail(RouteError::msg("broken"));

        ex.unit_of_work().done(&ex);
        assert_eq!(
            *hits.lock(),
            vec!["completion".to_string(), "step failed: broken".to_string()]
        );
    }

    #[test]
    fn route_stack_tracks_nesting() {
        let ex = Exchange::new();
        let uow = ex.unit_of_work();
        uow.push_route("outer");
        uow.push_route("inner");
        assert_eq!(uow.route_stack(), vec!["outer", "inner"]);
        assert_eq!(uow.current_route().as_deref(), Some("inner"));
        assert_eq!(uow.pop_route().as_deref(), Some("inner"));
        assert_eq!(uow.current_route().as_deref(), Some("outer"));
    }

    #[test]
    fn original_message_is_captured_once() {
        let ex = Exchange::with_message(Message::with_body("first"));
        ex.unit_of_work().capture_original(ex.message());
        ex.unit_of_work().capture_original(&Message::with_body("second"));
        let original = ex.unit_of_work().original_message().unwrap();
        assert_eq!(original.body().and_then(|b| b.as_str()), Some("first"));
    }

    #[tokio::test]
    async fn wait_done_resolves_after_done() {
        let ex = Arc::new(Exchange::new());
        let waiter = {
            let ex = Arc::clone(&ex);
            tokio::spawn(async move { ex.unit_of_work().wait_done().await })
        };
        tokio::task::yield_now().await;
        assert!(!ex.unit_of_work().is_done());
        ex.unit_of_work().done(&ex);
        waiter.await.unwrap();
        assert!(ex.unit_of_work().is_done());
    }
}
