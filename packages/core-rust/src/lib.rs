//! Switchyard Core: exchanges, messages, type conversion, and the adapter
//! extension contract shared by the routing engine and transport adapters.

pub mod converter;
pub mod endpoint;
pub mod error;
pub mod exchange;
pub mod keys;
pub mod message;
pub mod traits;
pub mod unit_of_work;
pub mod value;

pub use converter::{TypeConverterRegistry, TypeConverterRegistryBuilder, DEFAULT_SEARCH_DEPTH};
pub use endpoint::{Endpoint, EndpointOptions, EndpointUri};
pub use error::{BoxError, ConfigurationError, ConversionUnavailable, ErrorKind, RouteError};
pub use exchange::{Exchange, ExchangeId, ExchangeState, Failure};
pub use message::Message;
pub use traits::{Component, Consumer, ExchangeSink, OnDone, Producer};
pub use unit_of_work::UnitOfWork;
pub use value::{TypeKey, Value};
