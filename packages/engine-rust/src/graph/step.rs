//! Leaf steps: the only open extension point of a route graph.
//!
//! A [`Step`] either finishes before `process` returns ([`Outcome::Complete`])
//! or hands back a future the walker drives to completion
//! ([`Outcome::Suspended`]). Failures are recorded on the exchange with
//! [`Exchange::fail`]; a step never returns an error.

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use switchyard_core::{Exchange, Message, Producer, RouteError, TypeConverterRegistry};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Step contract
// ---------------------------------------------------------------------------

/// Result of invoking a step.
pub enum Outcome<'a> {
    /// The step finished synchronously.
    Complete,
    /// The step is waiting on asynchronous work. The future borrows the
    /// exchange; the walker may drop it early on timeout or cancellation.
    Suspended(BoxFuture<'a, ()>),
}

impl fmt::Debug for Outcome<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete => f.write_str("Complete"),
            Self::Suspended(_) => f.write_str("Suspended"),
        }
    }
}

/// Per-invocation context handed to a step.
#[derive(Clone, Copy)]
pub struct StepContext<'a> {
    route_id: &'a str,
    step_id: &'a str,
    registry: &'a TypeConverterRegistry,
    cancellation: &'a CancellationToken,
}

impl<'a> StepContext<'a> {
    pub(crate) fn new(
        route_id: &'a str,
        step_id: &'a str,
        registry: &'a TypeConverterRegistry,
        cancellation: &'a CancellationToken,
    ) -> Self {
        Self {
            route_id,
            step_id,
            registry,
            cancellation,
        }
    }

    #[must_use]
    pub fn route_id(&self) -> &'a str {
        self.route_id
    }

    #[must_use]
    pub fn step_id(&self) -> &'a str {
        self.step_id
    }

    /// Process-wide converter registry, for typed header/body access.
    #[must_use]
    pub fn registry(&self) -> &'a TypeConverterRegistry {
        self.registry
    }

    /// Cancellation signal for the exchange being processed. Cooperating
    /// steps stop issuing work once it fires and record `RouteError::Cancelled`.
    #[must_use]
    pub fn cancellation(&self) -> &'a CancellationToken {
        self.cancellation
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

impl fmt::Debug for StepContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepContext")
            .field("route_id", &self.route_id)
            .field("step_id", &self.step_id)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// A unit of transformation or side-effecting work.
pub trait Step: Send + Sync {
    fn process<'a>(&'a self, exchange: &'a mut Exchange, ctx: StepContext<'a>) -> Outcome<'a>;
}

// ---------------------------------------------------------------------------
// Completion signal
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Reply {
    Done,
    Message(Message),
    Failed(RouteError),
}

/// Creates a linked completion pair for callback-style steps.
///
/// The [`CompletionSignal`] may be moved to any thread and fired from there;
/// the [`Completion`] is awaited by the walker.
#[must_use]
pub fn completion() -> (CompletionSignal, Completion) {
    let (tx, rx) = oneshot::channel();
    (CompletionSignal { tx }, Completion { rx })
}

/// Sending half of a completion. Consumed on use, so it fires at most once.
///
/// Firing after the walker stopped waiting (timeout or cancellation) is a
/// no-op. Dropping it without firing fails the step.
#[derive(Debug)]
pub struct CompletionSignal {
    tx: oneshot::Sender<Reply>,
}

impl CompletionSignal {
    /// Completes the step, leaving the exchange's message as it is.
    pub fn complete(self) {
        let _ = self.tx.send(Reply::Done);
    }

    /// Completes the step, replacing the exchange's message with `message`.
    pub fn complete_with(self, message: Message) {
        let _ = self.tx.send(Reply::Message(message));
    }

    /// Fails the step with `error`.
    pub fn fail(self, error: impl Into<RouteError>) {
        let _ = self.tx.send(Reply::Failed(error.into()));
    }

    /// `true` if nobody is waiting for this signal any more.
    #[must_use]
    pub fn is_orphaned(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of a completion.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<Reply>,
}

impl Completion {
    /// Applies the reply to `exchange` if the signal has already fired.
    /// Returns `self` back when it has not.
    fn try_apply(mut self, exchange: &mut Exchange) -> Result<(), Self> {
        match self.rx.try_recv() {
            Ok(reply) => {
                apply(reply, exchange);
                Ok(())
            }
            Err(oneshot::error::TryRecvError::Empty) => Err(self),
            Err(oneshot::error::TryRecvError::Closed) => {
                exchange.fail(RouteError::msg("completion signal dropped without firing"));
                Ok(())
            }
        }
    }

    /// Waits for the signal and applies its reply to `exchange`.
    pub async fn apply(self, exchange: &mut Exchange) {
        match self.rx.await {
            Ok(reply) => apply(reply, exchange),
            Err(_) => {
                exchange.fail(RouteError::msg("completion signal dropped without firing"));
            }
        }
    }
}

fn apply(reply: Reply, exchange: &mut Exchange) {
    match reply {
        Reply::Done => {}
        Reply::Message(message) => {
            exchange.set_message(message);
        }
        Reply::Failed(error) => {
            exchange.fail(error);
        }
    }
}

// ---------------------------------------------------------------------------
// Built-in leaves
// ---------------------------------------------------------------------------

/// Synchronous step backed by a closure.
pub struct FnStep<F> {
    f: F,
}

impl<F> FnStep<F>
where
    F: Fn(&mut Exchange, &StepContext<'_>) -> Result<(), RouteError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> Step for FnStep<F>
where
    F: Fn(&mut Exchange, &StepContext<'_>) -> Result<(), RouteError> + Send + Sync,
{
    fn process<'a>(&'a self, exchange: &'a mut Exchange, ctx: StepContext<'a>) -> Outcome<'a> {
        if let Err(error) = (self.f)(exchange, &ctx) {
            exchange.fail(error);
        }
        Outcome::Complete
    }
}

/// Callback-style step: the closure receives a read view of the exchange and
/// a [`CompletionSignal`] it may fire from any thread, now or later.
pub struct CallbackStep<F> {
    f: F,
}

impl<F> CallbackStep<F>
where
    F: Fn(&Exchange, CompletionSignal) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> Step for CallbackStep<F>
where
    F: Fn(&Exchange, CompletionSignal) + Send + Sync,
{
    fn process<'a>(&'a self, exchange: &'a mut Exchange, _ctx: StepContext<'a>) -> Outcome<'a> {
        let (signal, completion) = completion();
        (self.f)(exchange, signal);
        match completion.try_apply(exchange) {
            Ok(()) => Outcome::Complete,
            Err(pending) => Outcome::Suspended(Box::pin(pending.apply(exchange))),
        }
    }
}

/// Leaf that hands the exchange to an endpoint's producer.
pub struct ProducerStep {
    producer: Arc<dyn Producer>,
}

impl ProducerStep {
    #[must_use]
    pub fn new(producer: Arc<dyn Producer>) -> Self {
        Self { producer }
    }
}

impl Step for ProducerStep {
    fn process<'a>(&'a self, exchange: &'a mut Exchange, _ctx: StepContext<'a>) -> Outcome<'a> {
        Outcome::Suspended(self.producer.send(exchange))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_parts() -> (TypeConverterRegistry, CancellationToken) {
        (TypeConverterRegistry::default(), CancellationToken::new())
    }

    #[test]
    fn fn_step_records_error() {
        let (registry, token) = ctx_parts();
        let step = FnStep::new(|_ex: &mut Exchange, _ctx: &StepContext<'_>| Err(RouteError::msg("nope")));
        let mut ex = Exchange::new();
        let complete = matches!(
            step.process(&mut ex, StepContext::new("r", "s", &registry, &token)),
            Outcome::Complete
        );
        assert!(complete);
        assert!(ex.is_failed());
    }

    #[test]
    fn callback_fired_inline_completes_synchronously() {
        let (registry, token) = ctx_parts();
        let step = CallbackStep::new(|_ex: &Exchange, signal: CompletionSignal| {
            signal.complete_with(Message::with_body("inline"));
        });
        let mut ex = Exchange::new();
        let complete = matches!(
            step.process(&mut ex, StepContext::new("r", "s", &registry, &token)),
            Outcome::Complete
        );
        assert!(complete);
        assert_eq!(ex.message().body().and_then(|b| b.as_str()), Some("inline"));
    }

    #[tokio::test]
    async fn callback_fired_from_another_thread() {
        let (registry, token) = ctx_parts();
        let step = CallbackStep::new(|_ex: &Exchange, signal: CompletionSignal| {
            std::thread::spawn(move || signal.fail(RouteError::msg("remote failure")));
        });
        let mut ex = Exchange::new();
        match step.process(&mut ex, StepContext::new("r", "s", &registry, &token)) {
            Outcome::Suspended(fut) => fut.await,
            Outcome::Complete => {}
        }
        assert_eq!(ex.error().unwrap().to_string(), "step failed: remote failure");
    }

    #[tokio::test]
    async fn dropped_signal_fails_the_step() {
        let (signal, completion) = completion();
        drop(signal);
        let mut ex = Exchange::new();
        completion.apply(&mut ex).await;
        assert!(ex.is_failed());
    }

    #[test]
    fn firing_an_orphaned_signal_is_harmless() {
        let (signal, completion) = completion();
        drop(completion);
        assert!(signal.is_orphaned());
        signal.complete();
    }
}
