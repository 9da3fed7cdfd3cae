use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use switchyard_core::Exchange;
use tower::Service;

use crate::engine::Engine;

/// One route of an [`Engine`] as a `tower::Service`.
///
/// Always ready; backpressure is the job of [`LoadShedLayer`](super::LoadShedLayer).
#[derive(Debug, Clone)]
pub struct RouteService {
    engine: Engine,
    route_id: Arc<str>,
}

impl RouteService {
    #[must_use]
    pub fn new(engine: Engine, route_id: &str) -> Self {
        Self {
            engine,
            route_id: Arc::from(route_id),
        }
    }

    #[must_use]
    pub fn route_id(&self) -> &str {
        &self.route_id
    }
}

impl Service<Exchange> for RouteService {
    type Response = Exchange;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Exchange, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, exchange: Exchange) -> Self::Future {
        let engine = self.engine.clone();
        let route_id = Arc::clone(&self.route_id);
        Box::pin(async move { Ok(engine.process(&route_id, exchange).await) })
    }
}
