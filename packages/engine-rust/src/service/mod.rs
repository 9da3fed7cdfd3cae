//! Tower entry point for routes.
//!
//! 1. **Route service** (`route_service`): `Exchange` -> routed `Exchange`
//! 2. **Middleware** (`middleware`): Tower layers (metrics, load-shedding)
//!
//! Routing failures travel on the returned exchange, so every service in the
//! stack is infallible at the `tower` level.

pub mod middleware;
pub mod route_service;

pub use middleware::{build_route_pipeline, LoadShedLayer, MetricsLayer, RoutePipeline};
pub use route_service::RouteService;
