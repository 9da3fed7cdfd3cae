//! The routing engine.
//!
//! [`Engine`] owns the route table, the type-converter registry, and the
//! in-flight table. Exchanges enter through [`Engine::process`] (awaitable),
//! [`Engine::route`] (callback, callable from any thread), or an
//! [`ExchangeSink`] handed to a consumer.
//!
//! Every accepted exchange gets a cancellation token that is a child of its
//! route's token, which is in turn a child of the engine token, so
//! cancellation can target one exchange, one route, or everything.

pub mod config;
pub(crate) mod inflight;
mod walker;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::FutureExt;
use parking_lot::Mutex;
use switchyard_core::keys::properties;
use switchyard_core::{
    ConfigurationError, Consumer, Exchange, ExchangeId, ExchangeSink, ExchangeState, OnDone, RouteError,
    TypeConverterRegistry,
};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

pub use config::EngineConfig;
pub use inflight::EngineState;

use self::inflight::InFlightTracker;
use self::walker::Walker;
use crate::graph::Route;

/// State shared by every walker of this engine.
pub(crate) struct Shared {
    pub(crate) registry: Arc<TypeConverterRegistry>,
    pub(crate) config: EngineConfig,
}

struct RouteEntry {
    route: Arc<Route>,
    /// Replaced on `cancel_route`, so exchanges admitted afterwards run.
    token: ArcSwap<CancellationToken>,
}

struct EngineInner {
    shared: Arc<Shared>,
    routes: DashMap<String, Arc<RouteEntry>>,
    inflight: InFlightTracker,
    token: CancellationToken,
    consumers: Mutex<Vec<(String, Arc<dyn Consumer>)>>,
    /// Bounds exchanges admitted through `route` and sinks.
    admission: Arc<Semaphore>,
    runtime: Option<Handle>,
}

/// Cheaply clonable handle to a routing engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Creates a running engine with no routes.
    ///
    /// When called inside a Tokio runtime, that runtime is captured and used
    /// for exchanges submitted later from threads outside it.
    #[must_use]
    pub fn new(config: EngineConfig, registry: Arc<TypeConverterRegistry>) -> Self {
        let admission = Arc::new(Semaphore::new(config.max_in_flight.min(Semaphore::MAX_PERMITS)));
        Self {
            inner: Arc::new(EngineInner {
                shared: Arc::new(Shared { registry, config }),
                routes: DashMap::new(),
                inflight: InFlightTracker::new(),
                token: CancellationToken::new(),
                consumers: Mutex::new(Vec::new()),
                admission,
                runtime: Handle::try_current().ok(),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.shared.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<TypeConverterRegistry> {
        &self.inner.shared.registry
    }

    // -- routes ------------------------------------------------------------

    /// Registers an assembled route.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::DuplicateRoute` if a route with the same
    /// id is already registered.
    pub fn add_route(&self, route: Route) -> Result<(), ConfigurationError> {
        match self.inner.routes.entry(route.id().to_string()) {
            Entry::Occupied(entry) => Err(ConfigurationError::DuplicateRoute { id: entry.key().clone() }),
            Entry::Vacant(slot) => {
                info!(route = route.id(), nodes = route.node_count(), "route added");
                slot.insert(Arc::new(RouteEntry {
                    route: Arc::new(route),
                    token: ArcSwap::from_pointee(self.inner.token.child_token()),
                }));
                Ok(())
            }
        }
    }

    /// Unregisters a route. Exchanges already routing on it run to the end.
    pub fn remove_route(&self, route_id: &str) -> Option<Arc<Route>> {
        let (_, entry) = self.inner.routes.remove(route_id)?;
        info!(route = route_id, "route removed");
        Some(Arc::clone(&entry.route))
    }

    #[must_use]
    pub fn route_by_id(&self, route_id: &str) -> Option<Arc<Route>> {
        self.lookup(route_id).map(|entry| Arc::clone(&entry.route))
    }

    /// Registered route ids, sorted.
    #[must_use]
    pub fn route_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.routes.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    fn lookup(&self, route_id: &str) -> Option<Arc<RouteEntry>> {
        self.inner.routes.get(route_id).map(|entry| Arc::clone(entry.value()))
    }

    // -- routing -----------------------------------------------------------

    /// Routes `exchange` through `route_id` and returns it once routing has
    /// finished.
    ///
    /// The returned exchange is `Completed` unless an unhandled failure is
    /// recorded, in which case it is `Failed`. Unknown routes and engines
    /// that are not running reject the exchange with `RouteError::Rejected`.
    pub async fn process(&self, route_id: &str, mut exchange: Exchange) -> Exchange {
        if self.state() != EngineState::Running {
            return reject(exchange, "engine is not running");
        }
        let Some(entry) = self.lookup(route_id) else {
            return reject(exchange, format!("unknown route `{route_id}`"));
        };

        let token = entry.token.load().child_token();
        let _guard = self.inner.inflight.track(exchange.id(), token.clone());
        let route = &entry.route;
        let started = Instant::now();

        exchange.set_state(ExchangeState::Routing);
        exchange.set_property(properties::ROUTE_ID, route.id());
        let unit_of_work = Arc::clone(exchange.unit_of_work());
        unit_of_work.capture_original(exchange.message());
        unit_of_work.push_route(route.id());

        let span = tracing::debug_span!("route", route = route.id(), exchange_id = %exchange.id());
        let walker = Walker {
            shared: &self.inner.shared,
            route,
            token: &token,
        };
        let walked = AssertUnwindSafe(walker.drive(route.root(), &mut exchange, 0))
            .catch_unwind()
            .instrument(span)
            .await;
        if let Err(payload) = walked {
            let error = RouteError::msg(walker::panic_message("routing", payload.as_ref()));
            if exchange.fail(error) {
                exchange.locate_failure(route.root().id(), route.id());
            }
        }
        unit_of_work.pop_route();

        let outcome = match exchange.failure().filter(|f| !f.is_handled()) {
            Some(failure) => {
                debug!(
                    route = route.id(),
                    exchange_id = %exchange.id(),
                    step = failure.step().unwrap_or("-"),
                    error = %failure.error(),
                    "exchange failed"
                );
                exchange.set_state(ExchangeState::Failed);
                "failed"
            }
            None => {
                exchange.set_state(ExchangeState::Completed);
                "completed"
            }
        };
        metrics::counter!(
            "switchyard_exchanges_total",
            "route" => route.id().to_string(),
            "outcome" => outcome
        )
        .increment(1);
        metrics::histogram!("switchyard_exchange_duration_seconds", "route" => route.id().to_string())
            .record(started.elapsed().as_secs_f64());

        if unit_of_work.route_stack().is_empty() {
            unit_of_work.done(&exchange);
        }
        exchange
    }

    /// Routes `exchange` in the background and hands it to `on_done` exactly
    /// once when routing has finished.
    ///
    /// Safe to call from any thread. Without a runtime to run on, or when
    /// `max_in_flight` exchanges are already admitted this way, the exchange
    /// is rejected and `on_done` runs on the calling thread.
    pub fn route(&self, route_id: &str, exchange: Exchange, on_done: OnDone) {
        let runtime = Handle::try_current().ok().or_else(|| self.inner.runtime.clone());
        let Some(runtime) = runtime else {
            on_done(reject(exchange, "no async runtime available"));
            return;
        };
        let Ok(permit) = Arc::clone(&self.inner.admission).try_acquire_owned() else {
            metrics::counter!("switchyard_exchanges_shed_total").increment(1);
            on_done(reject(exchange, "engine overloaded"));
            return;
        };
        let engine = self.clone();
        let route_id = route_id.to_string();
        runtime.spawn(async move {
            let exchange = engine.process(&route_id, exchange).await;
            on_done(exchange);
            drop(permit);
        });
    }

    /// An [`ExchangeSink`] that routes everything it receives through
    /// `route_id`.
    #[must_use]
    pub fn sink(&self, route_id: &str) -> Arc<dyn ExchangeSink> {
        Arc::new(RouteSink {
            engine: self.clone(),
            route_id: route_id.to_string(),
        })
    }

    /// Starts `consumer` feeding `route_id`. Consumers are stopped, newest
    /// first, when the engine shuts down.
    ///
    /// # Errors
    ///
    /// Fails if the route is unknown or the consumer fails to start.
    pub async fn attach_consumer(&self, route_id: &str, consumer: Arc<dyn Consumer>) -> anyhow::Result<()> {
        if self.lookup(route_id).is_none() {
            anyhow::bail!("cannot attach consumer: unknown route `{route_id}`");
        }
        consumer.start(self.sink(route_id)).await?;
        info!(route = route_id, "consumer attached");
        self.inner.consumers.lock().push((route_id.to_string(), consumer));
        Ok(())
    }

    // -- cancellation ------------------------------------------------------

    /// Cancels one in-flight exchange. Returns `false` if it is not in flight.
    pub fn cancel_exchange(&self, id: ExchangeId) -> bool {
        self.inner.inflight.cancel(id)
    }

    /// Cancels every exchange currently routing on `route_id`. Exchanges
    /// admitted afterwards are unaffected. Returns `false` for unknown routes.
    pub fn cancel_route(&self, route_id: &str) -> bool {
        let Some(entry) = self.lookup(route_id) else {
            return false;
        };
        let previous = entry.token.swap(Arc::new(self.inner.token.child_token()));
        previous.cancel();
        info!(route = route_id, "route cancelled");
        true
    }

    // -- lifecycle ---------------------------------------------------------

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.inner.inflight.count()
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        self.inner.inflight.state()
    }

    /// Graceful shutdown: stop admitting exchanges, stop consumers, and wait
    /// up to `shutdown_timeout` for in-flight exchanges.
    ///
    /// Returns `true` if everything drained in time.
    pub async fn shutdown(&self) -> bool {
        info!(in_flight = self.in_flight_count(), "engine draining");
        self.inner.inflight.begin_draining();
        self.stop_consumers().await;
        self.await_drain().await
    }

    /// Like [`Engine::shutdown`], but cancels every in-flight exchange first.
    pub async fn shutdown_now(&self) -> bool {
        info!(in_flight = self.in_flight_count(), "engine stopping now");
        self.inner.inflight.begin_draining();
        self.inner.token.cancel();
        self.stop_consumers().await;
        self.await_drain().await
    }

    async fn stop_consumers(&self) {
        let consumers = std::mem::take(&mut *self.inner.consumers.lock());
        for (route_id, consumer) in consumers.into_iter().rev() {
            if let Err(err) = consumer.stop().await {
                warn!(route = %route_id, error = %err, "consumer failed to stop");
            }
        }
    }

    async fn await_drain(&self) -> bool {
        let drained = self
            .inner
            .inflight
            .wait_for_drain(self.inner.shared.config.shutdown_timeout)
            .await;
        if drained {
            info!("engine stopped");
        } else {
            warn!(in_flight = self.in_flight_count(), "shutdown timed out with exchanges in flight");
        }
        drained
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state())
            .field("routes", &self.route_ids())
            .field("in_flight", &self.in_flight_count())
            .finish_non_exhaustive()
    }
}

/// Fails `exchange` with `RouteError::Rejected` without routing it.
pub(crate) fn reject(mut exchange: Exchange, reason: impl Into<String>) -> Exchange {
    let reason = reason.into();
    debug!(exchange_id = %exchange.id(), reason = %reason, "exchange rejected");
    exchange.fail(RouteError::Rejected { reason });
    exchange.set_state(ExchangeState::Failed);
    if exchange.unit_of_work().route_stack().is_empty() {
        exchange.unit_of_work().done(&exchange);
    }
    exchange
}

struct RouteSink {
    engine: Engine,
    route_id: String,
}

impl ExchangeSink for RouteSink {
    fn submit(&self, exchange: Exchange, on_done: OnDone) {
        self.engine.route(&self.route_id, exchange, on_done);
    }
}
