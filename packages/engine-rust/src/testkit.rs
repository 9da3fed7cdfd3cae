//! In-test `mock:` component.
//!
//! `mock:<name>?delay=<ms>&fail=<n>` resolves to a producer that records every
//! body it receives, optionally sleeps `delay` ms, and fails its first `n`
//! calls. Endpoints with the same name share one producer.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use switchyard_core::{
    Component, ConfigurationError, Consumer, Endpoint, EndpointUri, Exchange, ExchangeSink, OnDone, Producer,
    RouteError,
};

#[derive(Debug, Default)]
pub(crate) struct MockProducer {
    delay: Option<Duration>,
    fail_first: u32,
    calls: AtomicU32,
    received: Mutex<Vec<String>>,
}

impl MockProducer {
    pub(crate) fn new(delay: Option<Duration>, fail_first: u32) -> Self {
        Self {
            delay,
            fail_first,
            ..Self::default()
        }
    }

    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn received(&self) -> Vec<String> {
        self.received.lock().clone()
    }
}

#[async_trait]
impl Producer for MockProducer {
    async fn send(&self, exchange: &mut Exchange) {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let body = exchange
            .message()
            .body()
            .and_then(|b| b.as_str())
            .unwrap_or_default()
            .to_string();
        self.received.lock().push(body);
        if call <= self.fail_first {
            exchange.fail(RouteError::msg(format!("mock failure {call}")));
        }
    }
}

/// Consumer that forwards whatever the test pushes into it.
#[derive(Default)]
pub(crate) struct MockConsumer {
    sink: Mutex<Option<Arc<dyn ExchangeSink>>>,
}

impl MockConsumer {
    /// Submits `exchange` through the attached sink. Returns `false` when
    /// the consumer is not started.
    pub(crate) fn push(&self, exchange: Exchange, on_done: OnDone) -> bool {
        let sink = self.sink.lock().clone();
        match sink {
            Some(sink) => {
                sink.submit(exchange, on_done);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Consumer for MockConsumer {
    async fn start(&self, sink: Arc<dyn ExchangeSink>) -> anyhow::Result<()> {
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.sink.lock().take();
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MockComponent {
    producers: DashMap<String, Arc<MockProducer>>,
    consumers: DashMap<String, Arc<MockConsumer>>,
}

impl MockComponent {
    pub(crate) fn producer(&self, name: &str) -> Option<Arc<MockProducer>> {
        self.producers.get(name).map(|p| Arc::clone(p.value()))
    }

    pub(crate) fn consumer(&self, name: &str) -> Option<Arc<MockConsumer>> {
        self.consumers.get(name).map(|c| Arc::clone(c.value()))
    }
}

#[async_trait]
impl Component for MockComponent {
    fn scheme(&self) -> &str {
        "mock"
    }

    fn options(&self) -> &[&'static str] {
        &["delay", "fail"]
    }

    fn create_endpoint(&self, uri: &EndpointUri) -> Result<Endpoint, ConfigurationError> {
        let delay = uri
            .options()
            .parse::<u64>(uri.as_str(), "delay")?
            .map(Duration::from_millis);
        let fail_first = uri.options().parse::<u32>(uri.as_str(), "fail")?.unwrap_or(0);
        if uri.path().is_empty() {
            return Err(ConfigurationError::InvalidEndpoint {
                uri: uri.to_string(),
                reason: "mock endpoints need a name".to_string(),
            });
        }
        let producer = self
            .producers
            .entry(uri.path().to_string())
            .or_insert_with(|| Arc::new(MockProducer::new(delay, fail_first)))
            .clone();
        let consumer = self.consumers.entry(uri.path().to_string()).or_default().clone();
        Ok(Endpoint::new(uri.clone())
            .with_producer(producer)
            .with_consumer(consumer))
    }
}
