//! Adapter extension contract.
//!
//! Transport adapters plug into the engine through these traits only:
//! - [`Component`]: endpoint factory for one URI scheme
//! - [`Producer`]: outbound work performed by a leaf step
//! - [`Consumer`]: inbound source that submits exchanges to an [`ExchangeSink`]

use std::sync::Arc;

use async_trait::async_trait;

use crate::endpoint::{Endpoint, EndpointUri};
use crate::error::ConfigurationError;
use crate::exchange::Exchange;

/// Continuation invoked exactly once with the finished exchange.
pub type OnDone = Box<dyn FnOnce(Exchange) + Send + 'static>;

/// Outbound capability bound to an endpoint address.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Performs the outbound work for one exchange.
    ///
    /// Faults must be recorded with [`Exchange::fail`] instead of panicking.
    /// Returning completes the step; the engine may drop the future early on
    /// timeout or cancellation, in which case any later result is discarded.
    async fn send(&self, exchange: &mut Exchange);
}

/// Entry point consumers push inbound work into.
pub trait ExchangeSink: Send + Sync {
    /// Submits `exchange` for routing. May return before routing completes;
    /// `on_done` runs exactly once when it does.
    fn submit(&self, exchange: Exchange, on_done: OnDone);
}

/// Inbound capability bound to an endpoint address.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Begins delivering inbound exchanges to `sink`.
    async fn start(&self, sink: Arc<dyn ExchangeSink>) -> anyhow::Result<()>;

    /// Stops delivering. Exchanges already submitted keep routing.
    async fn stop(&self) -> anyhow::Result<()>;
}

/// Endpoint factory for one URI scheme.
#[async_trait]
pub trait Component: Send + Sync {
    /// The URI scheme this component serves (e.g. `"file"`, `"kafka"`).
    fn scheme(&self) -> &str;

    /// Option names accepted in endpoint URIs. Anything else is rejected
    /// before `create_endpoint` is called.
    fn options(&self) -> &[&'static str] {
        &[]
    }

    /// Builds an endpoint for `uri`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidEndpoint` for invalid option
    /// values or combinations.
    fn create_endpoint(&self, uri: &EndpointUri) -> Result<Endpoint, ConfigurationError>;

    /// One-time initialization before any route activates.
    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Release resources.
    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
