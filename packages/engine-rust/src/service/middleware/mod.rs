//! Tower middleware layers for the route entry service.
//!
//! - [`metrics`]: Exchange timing and counting via `tracing` spans
//! - [`load_shed`]: Semaphore-based in-flight limiting
//! - [`pipeline`]: Composes all layers around a [`RouteService`](super::RouteService)

pub mod load_shed;
pub mod metrics;
pub mod pipeline;

pub use load_shed::LoadShedLayer;
pub use metrics::MetricsLayer;
pub use pipeline::{build_route_pipeline, RoutePipeline};
