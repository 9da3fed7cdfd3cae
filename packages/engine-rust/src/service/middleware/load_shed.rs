//! Load-shedding middleware for routed exchanges.
//!
//! Rejects exchanges when the in-flight count reaches the configured limit.
//! A rejected exchange comes back immediately, failed with
//! `RouteError::Rejected`, instead of being queued.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use switchyard_core::Exchange;
use tokio::sync::Semaphore;
use tower::{Layer, Service};

use crate::engine::reject;

// ---------------------------------------------------------------------------
// LoadShedLayer
// ---------------------------------------------------------------------------

/// Tower layer that limits in-flight exchanges via a semaphore.
#[derive(Debug, Clone)]
pub struct LoadShedLayer {
    semaphore: Arc<Semaphore>,
}

impl LoadShedLayer {
    /// Create a new `LoadShedLayer` admitting at most `max_in_flight` exchanges.
    #[must_use]
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_in_flight.min(Semaphore::MAX_PERMITS))),
        }
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            semaphore: self.semaphore.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// LoadShedService
// ---------------------------------------------------------------------------

/// Service wrapper that enforces an in-flight limit.
#[derive(Debug, Clone)]
pub struct LoadShedService<S> {
    inner: S,
    semaphore: Arc<Semaphore>,
}

impl<S> Service<Exchange> for LoadShedService<S>
where
    S: Service<Exchange, Response = Exchange, Error = Infallible> + Send,
    S::Future: Send + 'static,
{
    type Response = Exchange;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Exchange, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, exchange: Exchange) -> Self::Future {
        let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
            metrics::counter!("switchyard_exchanges_shed_total").increment(1);
            let rejected = reject(exchange, "engine overloaded");
            return Box::pin(async move { Ok(rejected) });
        };

        let fut = self.inner.call(exchange);
        Box::pin(async move {
            let result = fut.await;
            drop(permit);
            result
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use switchyard_core::{ErrorKind, ExchangeState, RouteError};
    use tower::ServiceExt;

    use super::*;

    /// Holds each exchange until the test hands out a gate permit.
    struct Gated {
        gate: Arc<Semaphore>,
    }

    impl Gated {
        fn closed() -> (Self, Arc<Semaphore>) {
            let gate = Arc::new(Semaphore::new(0));
            (Self { gate: Arc::clone(&gate) }, gate)
        }
    }

    impl Service<Exchange> for Gated {
        type Response = Exchange;
        type Error = Infallible;
        type Future = Pin<Box<dyn Future<Output = Result<Exchange, Infallible>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, mut exchange: Exchange) -> Self::Future {
            let gate = Arc::clone(&self.gate);
            Box::pin(async move {
                let _pass = gate.acquire().await;
                exchange.set_property("gated", true);
                Ok(exchange)
            })
        }
    }

    #[tokio::test]
    async fn admits_exchanges_under_limit() {
        let (inner, gate) = Gated::closed();
        gate.add_permits(1);
        let ex = LoadShedLayer::new(10).layer(inner).oneshot(Exchange::new()).await.unwrap();
        assert!(!ex.is_failed());
        assert!(ex.property("gated").is_some());
    }

    #[tokio::test]
    async fn sheds_while_limit_is_held() {
        let (inner, gate) = Gated::closed();
        let mut svc = LoadShedLayer::new(1).layer(inner);

        ServiceExt::ready(&mut svc).await.unwrap();
        let held = tokio::spawn(svc.call(Exchange::new()));

        let shed = svc.call(Exchange::new()).await.unwrap();
        assert_eq!(shed.state(), ExchangeState::Failed);
        assert_eq!(shed.error().map(RouteError::kind), Some(ErrorKind::Rejected));
        assert!(shed.property("gated").is_none());
        assert!(shed.unit_of_work().is_done());

        gate.add_permits(1);
        let admitted = held.await.unwrap().unwrap();
        assert!(!admitted.is_failed());

        let after = svc.call(Exchange::new()).await.unwrap();
        assert!(!after.is_failed());
    }
}
