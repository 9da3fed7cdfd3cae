//! Asynchronous graph walker.
//!
//! The walker keeps continuations on an explicit frame stack instead of the
//! native call stack, so a long run of synchronously completing leaves is a
//! loop, not a recursion. Only multicast branches recurse, through boxed
//! futures, and only as deep as multicasts are nested.
//!
//! Suspended leaves are awaited under a biased `select!` against the
//! exchange's cancellation token and an optional deadline. An interrupted
//! leaf's future is dropped, so its late completion can never reach the
//! exchange again.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use switchyard_core::keys::{headers, properties};
use switchyard_core::{Exchange, Failure, Message, RouteError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Shared;
use crate::graph::step::{Outcome, StepContext};
use crate::graph::{Leaf, Multicast, Node, NodeKind, Route};
use crate::redelivery::{Decision, ResolvedRecovery, ScopeHandler};

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// What a protected scope re-runs on redelivery.
#[derive(Clone, Copy)]
enum ScopeTarget<'r> {
    /// A single leaf protected by the route-level handler.
    Leaf(&'r Node, &'r Leaf),
    /// A try-scope body.
    Subgraph(&'r Node),
}

impl<'r> ScopeTarget<'r> {
    fn node(self) -> &'r Node {
        match self {
            Self::Leaf(node, _) | Self::Subgraph(node) => node,
        }
    }
}

enum Frame<'r> {
    Pipeline {
        children: &'r [Arc<Node>],
        next: usize,
    },
    Scope {
        target: ScopeTarget<'r>,
        handler: &'r ScopeHandler,
        snapshot: Option<Message>,
        attempts: u32,
        shadowing: bool,
    },
    Recovery {
        dead_letter: bool,
    },
}

enum Action<'r> {
    Enter(&'r Node),
    Invoke(&'r Node, &'r Leaf),
    Return,
}

enum Interrupt {
    Cancelled,
    TimedOut(Duration),
    Panicked(String),
}

// ---------------------------------------------------------------------------
// Walker
// ---------------------------------------------------------------------------

pub(crate) struct Walker<'r> {
    pub(crate) shared: &'r Arc<Shared>,
    pub(crate) route: &'r Arc<Route>,
    pub(crate) token: &'r CancellationToken,
}

impl<'r> Walker<'r> {
    /// Drives `exchange` through the subgraph at `root`.
    ///
    /// `shadow > 0` means the walk runs inside a try-scope or recovery node,
    /// where the route-level handler does not apply.
    pub(crate) fn drive<'a>(&'a self, root: &'r Node, exchange: &'a mut Exchange, shadow: usize) -> BoxFuture<'a, ()>
    where
        'r: 'a,
    {
        Box::pin(self.walk(root, exchange, shadow))
    }

    async fn walk(&self, root: &'r Node, exchange: &mut Exchange, mut shadow: usize) {
        let mut stack: Vec<Frame<'r>> = Vec::new();
        let mut action = Action::Enter(root);
        let mut sync_run = 0_usize;

        loop {
            action = match action {
                Action::Enter(node) => match node.kind() {
                    NodeKind::Leaf(leaf) => {
                        if let Some(handler) = self.route.handler().filter(|_| shadow == 0) {
                            stack.push(Frame::Scope {
                                target: ScopeTarget::Leaf(node, leaf),
                                handler,
                                snapshot: handler.needs_snapshot().then(|| exchange.message().clone()),
                                attempts: 1,
                                shadowing: false,
                            });
                        }
                        Action::Invoke(node, leaf)
                    }
                    NodeKind::Pipeline(children) => {
                        stack.push(Frame::Pipeline { children, next: 0 });
                        Action::Return
                    }
                    NodeKind::Choice(choice) => {
                        let view: &Exchange = exchange;
                        match guarded("choice predicate", move || choice.select(view)) {
                            Ok(Some(branch)) => Action::Enter(branch),
                            Ok(None) => Action::Return,
                            Err(error) => {
                                self.fail_at(exchange, node, error);
                                Action::Return
                            }
                        }
                    }
                    NodeKind::Multicast(multicast) => {
                        self.multicast(node, multicast, exchange, shadow).await;
                        Action::Return
                    }
                    NodeKind::TryScope(scope) => {
                        shadow += 1;
                        stack.push(Frame::Scope {
                            target: ScopeTarget::Subgraph(&scope.body),
                            handler: &scope.handler,
                            snapshot: scope.handler.needs_snapshot().then(|| exchange.message().clone()),
                            attempts: 1,
                            shadowing: true,
                        });
                        Action::Enter(&scope.body)
                    }
                },
                Action::Invoke(node, leaf) => {
                    self.invoke(node, leaf, exchange, &mut sync_run).await;
                    Action::Return
                }
                Action::Return => match stack.last_mut() {
                    None => break,
                    Some(Frame::Pipeline { children, next }) => {
                        let children: &'r [Arc<Node>] = *children;
                        if exchange.is_failed() || exchange.is_routing_stopped() || *next >= children.len() {
                            stack.pop();
                            Action::Return
                        } else {
                            let child = &children[*next];
                            *next += 1;
                            Action::Enter(child)
                        }
                    }
                    Some(Frame::Scope { .. }) => self.settle_scope(&mut stack, exchange, &mut shadow).await,
                    Some(Frame::Recovery { dead_letter }) => {
                        let dead_letter = *dead_letter;
                        stack.pop();
                        shadow -= 1;
                        if dead_letter && !exchange.is_failed() {
                            exchange.stop_routing();
                        }
                        Action::Return
                    }
                },
            };
        }
    }

    // -- leaves ------------------------------------------------------------

    async fn invoke(&self, node: &'r Node, leaf: &'r Leaf, exchange: &mut Exchange, sync_run: &mut usize) {
        if self.token.is_cancelled() {
            exchange.fail(RouteError::Cancelled);
            exchange.locate_failure(node.id(), self.route.id());
            return;
        }

        let ctx = StepContext::new(self.route.id(), node.id(), &self.shared.registry, self.token);
        let deadline = leaf
            .timeout
            .or(self.route.step_timeout())
            .or(self.shared.config.default_step_timeout);
        let mut completed_inline = false;
        let interrupt = match start(leaf, exchange, ctx) {
            Ok(Outcome::Complete) => {
                completed_inline = true;
                None
            }
            Ok(Outcome::Suspended(future)) => self.suspend(future, deadline).await,
            Err(payload) => Some(Interrupt::Panicked(panic_message("step", payload.as_ref()))),
        };

        if completed_inline {
            *sync_run += 1;
            if *sync_run >= self.shared.config.sync_step_budget.max(1) {
                *sync_run = 0;
                tokio::task::yield_now().await;
            }
        } else {
            *sync_run = 0;
        }

        match interrupt {
            None => {}
            Some(Interrupt::Cancelled) => {
                exchange.fail(RouteError::Cancelled);
            }
            Some(Interrupt::TimedOut(after)) => {
                exchange.fail(RouteError::Timeout {
                    step: node.id().to_string(),
                    after_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
                });
            }
            Some(Interrupt::Panicked(message)) => {
                exchange.fail(RouteError::msg(message));
            }
        }

        if exchange.is_failed() {
            exchange.locate_failure(node.id(), self.route.id());
        }
    }

    async fn suspend(&self, future: BoxFuture<'_, ()>, deadline: Option<Duration>) -> Option<Interrupt> {
        let guarded = AssertUnwindSafe(future).catch_unwind();
        let run = async move {
            let outcome = match deadline {
                Some(limit) => match tokio::time::timeout(limit, guarded).await {
                    Ok(outcome) => outcome,
                    Err(_) => return Some(Interrupt::TimedOut(limit)),
                },
                None => guarded.await,
            };
            outcome
                .err()
                .map(|payload| Interrupt::Panicked(panic_message("step", payload.as_ref())))
        };

        tokio::select! {
            biased;
            () = self.token.cancelled() => Some(Interrupt::Cancelled),
            interrupt = run => interrupt,
        }
    }

    // -- protected scopes --------------------------------------------------

    /// Resolves the scope frame on top of `stack` once its target returned.
    async fn settle_scope(&self, stack: &mut Vec<Frame<'r>>, exchange: &mut Exchange, shadow: &mut usize) -> Action<'r> {
        let Some(Frame::Scope {
            target,
            handler,
            snapshot,
            attempts,
            shadowing,
        }) = stack.last_mut()
        else {
            return Action::Return;
        };
        let handler: &'r ScopeHandler = *handler;
        let target = *target;

        if !exchange.is_failed() {
            let (attempts, shadowing) = (*attempts, *shadowing);
            stack.pop();
            if shadowing {
                *shadow -= 1;
            }
            exchange.set_property(properties::ATTEMPTS, attempts);
            return Action::Return;
        }

        let (tried, cancelled) = (*attempts, self.token.is_cancelled());
        let view: &Exchange = exchange;
        let decision = guarded("retry predicate", move || handler.decide(view, tried, cancelled))
            .unwrap_or_else(|error| {
                warn!(route = self.route.id(), error = %error, "redelivery decision failed, failure is fatal");
                Decision::Fatal
            });
        if let Decision::Retry { delay } = decision {
            let attempt = tried + 1;
            self.announce_redelivery(exchange, handler, attempt, delay);
            if !self.pause(delay).await {
                let step = exchange
                    .failure()
                    .and_then(Failure::step)
                    .unwrap_or(target.node().id())
                    .to_string();
                exchange.clear_failure();
                exchange.fail(RouteError::Cancelled);
                exchange.locate_failure(&step, self.route.id());
                return Action::Return;
            }
            *attempts = attempt;
            let restored = snapshot.clone();
            if let Err(error) = self.prepare_redelivery(exchange, handler, restored, attempt) {
                // The hook's failure counts as a failed attempt.
                self.fail_at(exchange, target.node(), error);
                return Action::Return;
            }
            return match target {
                ScopeTarget::Leaf(node, leaf) => Action::Invoke(node, leaf),
                ScopeTarget::Subgraph(body) => Action::Enter(body),
            };
        }

        let (attempts, shadowing, snapshot) = (*attempts, *shadowing, snapshot.take());
        stack.pop();
        if shadowing {
            *shadow -= 1;
        }
        exchange.set_property(properties::ATTEMPTS, attempts);

        if decision == Decision::Exhausted {
            exchange.wrap_failure(|last| RouteError::RedeliveryExhausted {
                attempts,
                last: Box::new(last),
            });
            exchange.set_property(properties::REDELIVERY_EXHAUSTED, true);
            if handler.policy.log_exhausted {
                let failure = exchange.failure();
                warn!(
                    route = self.route.id(),
                    exchange_id = %exchange.id(),
                    step = failure.and_then(Failure::step).unwrap_or("-"),
                    attempts,
                    error = %failure.map_or_else(String::new, |f| f.error().last_cause().to_string()),
                    "redelivery exhausted"
                );
            }
        }

        match &handler.recovery {
            ResolvedRecovery::Propagate => Action::Return,
            ResolvedRecovery::Handle(node) => {
                exchange.mark_handled();
                if let Some(entry) = snapshot {
                    exchange.set_message(entry);
                }
                stack.push(Frame::Recovery { dead_letter: false });
                *shadow += 1;
                Action::Enter(node)
            }
            ResolvedRecovery::DeadLetter {
                node,
                use_original_message,
            } => {
                exchange.mark_handled();
                let replacement = if *use_original_message {
                    exchange.unit_of_work().original_message()
                } else {
                    snapshot
                };
                if let Some(message) = replacement {
                    exchange.set_message(message);
                }
                stack.push(Frame::Recovery { dead_letter: true });
                *shadow += 1;
                Action::Enter(node)
            }
        }
    }

    fn announce_redelivery(&self, exchange: &Exchange, handler: &ScopeHandler, attempt: u32, delay: Duration) {
        let redelivery = attempt - 1;
        if handler.policy.log_retry_attempted {
            debug!(
                route = self.route.id(),
                exchange_id = %exchange.id(),
                redelivery,
                max = handler.policy.maximum_redeliveries,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %exchange.error().map_or_else(String::new, ToString::to_string),
                "scheduling redelivery"
            );
        }
        metrics::counter!("switchyard_redeliveries_total", "route" => self.route.id().to_string()).increment(1);
    }

    /// Restores the scope snapshot and stamps the redelivery headers before
    /// attempt number `attempt` runs.
    fn prepare_redelivery(
        &self,
        exchange: &mut Exchange,
        handler: &ScopeHandler,
        restored: Option<Message>,
        attempt: u32,
    ) -> Result<(), RouteError> {
        let redelivery = attempt - 1;
        if let Some(message) = restored {
            exchange.set_message(message);
        }
        exchange.clear_failure();
        let message = exchange.message_mut();
        message.set_header(headers::REDELIVERY_COUNTER, redelivery);
        message.set_header(headers::REDELIVERED, true);
        message.set_header(headers::REDELIVERY_MAX_COUNTER, handler.policy.maximum_redeliveries);
        guarded("redelivery hook", || handler.before_redelivery(exchange))
    }

    /// Sleeps for `delay` unless cancelled first. Returns `false` on cancellation.
    async fn pause(&self, delay: Duration) -> bool {
        if delay.is_zero() {
            return !self.token.is_cancelled();
        }
        tokio::select! {
            biased;
            () = self.token.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }

    // -- multicast ---------------------------------------------------------

    async fn multicast(&self, node: &'r Node, multicast: &'r Multicast, exchange: &mut Exchange, shadow: usize) {
        let branches: Vec<Exchange> = (0..multicast.children.len())
            .map(|index| {
                let mut branch = exchange.copy();
                branch.set_property(properties::MULTICAST_INDEX, u32::try_from(index).unwrap_or(u32::MAX));
                branch
            })
            .collect();

        let replies = if multicast.options.parallel {
            self.dispatch_parallel(multicast, branches, exchange, shadow).await
        } else {
            self.dispatch_sequential(multicast, branches, shadow).await
        };

        match replies {
            Err(failure) => self.adopt_failure(exchange, &failure, node),
            Ok(replies) => {
                let first_failure = replies
                    .iter()
                    .find_map(|reply| reply.failure().filter(|f| !f.is_handled()).cloned());
                let strategy = &multicast.options.strategy;
                let original: &Exchange = exchange;
                let folded = guarded("aggregation strategy", move || {
                    replies
                        .into_iter()
                        .fold(None, |aggregate, reply| Some(strategy.aggregate(aggregate, reply, original)))
                });
                match folded {
                    Ok(Some(aggregate)) => self.merge(exchange, aggregate, node),
                    Ok(None) => {}
                    Err(error) => self.fail_at(exchange, node, error),
                }
                if let Some(failure) = first_failure {
                    self.adopt_failure(exchange, &failure, node);
                }
            }
        }
    }

    /// Runs branches one after another. With fail-fast, stops at the first
    /// failed branch and returns its failure.
    async fn dispatch_sequential(
        &self,
        multicast: &'r Multicast,
        branches: Vec<Exchange>,
        shadow: usize,
    ) -> Result<Vec<Exchange>, Failure> {
        let mut replies = Vec::with_capacity(branches.len());
        for (child, mut branch) in multicast.children.iter().zip(branches) {
            self.drive(child, &mut branch, shadow).await;
            if multicast.options.fail_fast && branch.is_failed() {
                if let Some(failure) = branch.failure().cloned() {
                    return Err(failure);
                }
            }
            replies.push(branch);
        }
        Ok(replies)
    }

    /// Runs every branch as its own task. With fail-fast, returns on the
    /// first failure to arrive; tasks still running are left to finish and
    /// their results are dropped.
    async fn dispatch_parallel(
        &self,
        multicast: &'r Multicast,
        branches: Vec<Exchange>,
        original: &Exchange,
        shadow: usize,
    ) -> Result<Vec<Exchange>, Failure> {
        let mut pending: FuturesUnordered<_> = multicast
            .children
            .iter()
            .zip(branches)
            .enumerate()
            .map(|(index, (child, branch))| {
                let shared = Arc::clone(self.shared);
                let route = Arc::clone(self.route);
                let token = self.token.clone();
                let child = Arc::clone(child);
                let task = tokio::spawn(async move {
                    let mut branch = branch;
                    let walker = Walker {
                        shared: &shared,
                        route: &route,
                        token: &token,
                    };
                    walker.drive(&child, &mut branch, shadow).await;
                    branch
                });
                async move { (index, task.await) }
            })
            .collect();

        let mut slots: Vec<Option<Exchange>> = std::iter::repeat_with(|| None).take(pending.len()).collect();
        while let Some((index, joined)) = pending.next().await {
            let branch = joined.unwrap_or_else(|err| {
                let mut lost = original.copy();
                lost.fail(RouteError::msg(format!("multicast branch {index} aborted: {err}")));
                lost
            });
            if multicast.options.fail_fast && branch.is_failed() {
                if let Some(failure) = branch.failure().cloned() {
                    return Err(failure);
                }
            }
            slots[index] = Some(branch);
        }
        Ok(slots.into_iter().flatten().collect())
    }

    /// Copies the aggregate's message and properties onto the exchange that
    /// entered the multicast.
    fn merge(&self, exchange: &mut Exchange, mut aggregate: Exchange, node: &Node) {
        exchange.set_message(aggregate.take_message());
        for (key, value) in aggregate.properties() {
            if key != properties::CORRELATION_ID && key != properties::MULTICAST_INDEX {
                exchange.set_property(key.clone(), value.clone());
            }
        }
        if let Some(failure) = aggregate.failure().filter(|f| !f.is_handled()) {
            self.adopt_failure(exchange, failure, node);
        }
    }

    fn fail_at(&self, exchange: &mut Exchange, node: &Node, error: RouteError) {
        if exchange.fail(error) {
            exchange.locate_failure(node.id(), self.route.id());
        }
    }

    fn adopt_failure(&self, exchange: &mut Exchange, failure: &Failure, node: &Node) {
        if exchange.fail(failure.error().clone()) {
            exchange.locate_failure(
                failure.step().unwrap_or(node.id()),
                failure.route().unwrap_or(self.route.id()),
            );
        }
    }
}

/// Invokes a leaf, catching a panic raised before it returns.
fn start<'a>(leaf: &'a Leaf, exchange: &'a mut Exchange, ctx: StepContext<'a>) -> std::thread::Result<Outcome<'a>> {
    // The closure consumes its captures so the outcome may borrow them for `'a`.
    let call = AssertUnwindSafe((leaf, exchange, ctx));
    std::panic::catch_unwind(move || {
        let call = call;
        let AssertUnwindSafe((leaf, exchange, ctx)) = call;
        leaf.step.process(exchange, ctx)
    })
}

/// Runs user code that must not unwind through the walker. A panic becomes
/// a step failure naming `what`.
fn guarded<T>(what: &str, f: impl FnOnce() -> T) -> Result<T, RouteError> {
    std::panic::catch_unwind(AssertUnwindSafe(f))
        .map_err(|payload| RouteError::msg(panic_message(what, payload.as_ref())))
}

pub(super) fn panic_message(what: &str, payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    format!("{what} panicked: {detail}")
}
