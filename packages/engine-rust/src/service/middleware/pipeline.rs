//! Pipeline composition: wraps a route's entry service with every middleware layer.

use tower::ServiceBuilder;

use super::load_shed::{LoadShedLayer, LoadShedService};
use super::metrics::{MetricsLayer, MetricsService};
use crate::engine::Engine;
use crate::service::route_service::RouteService;

/// The full entry stack for one route.
pub type RoutePipeline = LoadShedService<MetricsService<RouteService>>;

/// Build the entry pipeline for `route_id`.
///
/// Layer order (outermost to innermost):
/// 1. `LoadShedLayer` -- reject when `max_in_flight` is reached (fail fast before doing any work)
/// 2. `MetricsLayer` -- record timing and outcome (closest to the actual route)
///
/// The returned service implements `tower::Service<Exchange>` and is cheap to clone;
/// clones share one in-flight limit.
#[must_use]
pub fn build_route_pipeline(engine: &Engine, route_id: &str) -> RoutePipeline {
    ServiceBuilder::new()
        .layer(LoadShedLayer::new(engine.config().max_in_flight))
        .layer(MetricsLayer)
        .service(RouteService::new(engine.clone(), route_id))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use switchyard_core::{
        Component, EndpointUri, ErrorKind, Exchange, ExchangeState, RouteError, TypeConverterRegistry,
    };
    use tower::{Service, ServiceExt};

    use super::*;
    use crate::engine::EngineConfig;
    use crate::graph::builder::RouteBuilder;
    use crate::testkit::MockComponent;

    fn engine(max_in_flight: usize) -> Engine {
        let config = EngineConfig {
            max_in_flight,
            ..EngineConfig::default()
        };
        Engine::new(config, Arc::new(TypeConverterRegistry::with_defaults()))
    }

    #[tokio::test]
    async fn pipeline_routes_through_all_layers() {
        let engine = engine(100);
        let route = RouteBuilder::new("ping")
            .root("pong")
            .process("pong", |ex, _| {
                ex.message_mut().set_body("pong");
                Ok(())
            })
            .build()
            .unwrap();
        engine.add_route(route).unwrap();

        let svc = build_route_pipeline(&engine, "ping");
        let ex = svc.oneshot(Exchange::new()).await.unwrap();
        assert_eq!(ex.state(), ExchangeState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn pipeline_sheds_exchanges_over_the_limit() {
        let engine = engine(1);
        let component = MockComponent::default();
        let endpoint = component
            .create_endpoint(&EndpointUri::parse("mock:slow?delay=100").unwrap())
            .unwrap();
        let route = RouteBuilder::new("slow").root("send").to("send", &endpoint).build().unwrap();
        engine.add_route(route).unwrap();

        let mut svc = build_route_pipeline(&engine, "slow");
        let first = tokio::spawn(svc.call(Exchange::new()));
        let shed = svc.call(Exchange::new()).await.unwrap();
        assert_eq!(shed.error().map(RouteError::kind), Some(ErrorKind::Rejected));

        let first = first.await.unwrap().unwrap();
        assert_eq!(first.state(), ExchangeState::Completed);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(component.producer("slow").unwrap().calls(), 1);
    }

    #[tokio::test]
    async fn unknown_route_is_rejected_not_errored() {
        let engine = engine(10);
        let svc = build_route_pipeline(&engine, "missing");
        let ex = svc.oneshot(Exchange::new()).await.unwrap();
        assert_eq!(ex.error().map(RouteError::kind), Some(ErrorKind::Rejected));
    }
}
