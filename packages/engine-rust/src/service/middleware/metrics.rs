//! Metrics middleware for routed exchanges.
//!
//! Records duration and outcome on a `tracing` span per exchange.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use switchyard_core::keys::properties;
use switchyard_core::{Exchange, Value};
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

/// Tower layer that instruments exchanges with timing and outcome via `tracing` spans.
#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Service wrapper that records exchange duration and outcome in tracing spans.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<Exchange> for MetricsService<S>
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
        let exchange_id = exchange.id();

        let span = info_span!(
            "exchange",
            exchange_id = %exchange_id,
            route = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(exchange);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

                if let Ok(exchange) = &result {
                    let outcome = if exchange.is_failed() { "failed" } else { "completed" };
                    let route = exchange
                        .property(properties::ROUTE_ID)
                        .and_then(Value::as_str)
                        .unwrap_or("-");

                    let span = tracing::Span::current();
                    span.record("route", route);
                    span.record("duration_ms", duration_ms);
                    span.record("outcome", outcome);

                    tracing::info!(
                        route,
                        exchange_id = %exchange_id,
                        duration_ms,
                        outcome,
                        "exchange complete"
                    );
                }

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
