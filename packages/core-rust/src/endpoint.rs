//! Endpoint addresses and the capabilities a component binds to them.
//!
//! Addresses have the form `scheme:path?key=value&key2=value2`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::error::ConfigurationError;
use crate::traits::{Consumer, Producer};

fn uri_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?P<scheme>[A-Za-z][A-Za-z0-9+.\-]*):(?P<path>[^?]*)(?:\?(?P<query>.*))?$")
            .expect("endpoint uri pattern is valid")
    })
}

// ---------------------------------------------------------------------------
// EndpointOptions
// ---------------------------------------------------------------------------

/// Key/value options parsed from an endpoint URI query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointOptions(BTreeMap<String, String>);

impl EndpointOptions {
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Parses option `key` as a `T`. `Ok(None)` when the option is absent.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidEndpoint` if the value does not parse.
    pub fn parse<T: FromStr>(&self, uri: &str, key: &str) -> Result<Option<T>, ConfigurationError> {
        self.get(key)
            .map(|raw| {
                raw.parse::<T>().map_err(|_| ConfigurationError::InvalidEndpoint {
                    uri: uri.to_string(),
                    reason: format!("option `{key}` has invalid value `{raw}`"),
                })
            })
            .transpose()
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ---------------------------------------------------------------------------
// EndpointUri
// ---------------------------------------------------------------------------

/// Parsed endpoint address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointUri {
    raw: String,
    scheme: String,
    path: String,
    options: EndpointOptions,
}

impl EndpointUri {
    /// Parses `scheme:path?k=v&k2=v2`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidUri` for a missing scheme, an empty
    /// option name, or a repeated option.
    pub fn parse(raw: &str) -> Result<Self, ConfigurationError> {
        let invalid = |reason: &str| ConfigurationError::InvalidUri {
            uri: raw.to_string(),
            reason: reason.to_string(),
        };
        let caps = uri_pattern()
            .captures(raw)
            .ok_or_else(|| invalid("expected `scheme:path[?options]`"))?;

        let mut options = BTreeMap::new();
        if let Some(query) = caps.name("query") {
            for pair in query.as_str().split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                if key.is_empty() {
                    return Err(invalid("empty option name"));
                }
                if options.insert(key.to_string(), value.to_string()).is_some() {
                    return Err(invalid(&format!("option `{key}` given twice")));
                }
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            scheme: caps["scheme"].to_string(),
            path: caps["path"].to_string(),
            options: EndpointOptions(options),
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn options(&self) -> &EndpointOptions {
        &self.options
    }
}

impl fmt::Display for EndpointUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// An address plus the producer and/or consumer capability bound to it.
#[derive(Clone)]
pub struct Endpoint {
    uri: EndpointUri,
    producer: Option<Arc<dyn Producer>>,
    consumer: Option<Arc<dyn Consumer>>,
}

impl Endpoint {
    #[must_use]
    pub fn new(uri: EndpointUri) -> Self {
        Self {
            uri,
            producer: None,
            consumer: None,
        }
    }

    #[must_use]
    pub fn with_producer(mut self, producer: Arc<dyn Producer>) -> Self {
        self.producer = Some(producer);
        self
    }

    #[must_use]
    pub fn with_consumer(mut self, consumer: Arc<dyn Consumer>) -> Self {
        self.consumer = Some(consumer);
        self
    }

    #[must_use]
    pub fn uri(&self) -> &EndpointUri {
        &self.uri
    }

    /// # Errors
    ///
    /// Returns `ConfigurationError::MissingCapability` if the endpoint cannot produce.
    pub fn producer(&self) -> Result<Arc<dyn Producer>, ConfigurationError> {
        self.producer
            .clone()
            .ok_or_else(|| ConfigurationError::MissingCapability {
                uri: self.uri.to_string(),
                capability: "producer",
            })
    }

    /// # Errors
    ///
    /// Returns `ConfigurationError::MissingCapability` if the endpoint cannot consume.
    pub fn consumer(&self) -> Result<Arc<dyn Consumer>, ConfigurationError> {
        self.consumer
            .clone()
            .ok_or_else(|| ConfigurationError::MissingCapability {
                uri: self.uri.to_string(),
                capability: "consumer",
            })
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("uri", &self.uri.raw)
            .field("producer", &self.producer.is_some())
            .field("consumer", &self.consumer.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scheme_path_and_options() {
        let uri = EndpointUri::parse("kafka:orders?brokers=localhost:9092&acks=all").unwrap();
        assert_eq!(uri.scheme(), "kafka");
        assert_eq!(uri.path(), "orders");
        assert_eq!(uri.options().get("brokers"), Some("localhost:9092"));
        assert_eq!(uri.options().get("acks"), Some("all"));
        assert_eq!(uri.options().len(), 2);
    }

    #[test]
    fn option_without_value_is_empty_string() {
        let uri = EndpointUri::parse("file:/tmp/in?noop").unwrap();
        assert_eq!(uri.path(), "/tmp/in");
        assert_eq!(uri.options().get("noop"), Some(""));
    }

    #[test]
    fn rejects_missing_scheme() {
        assert!(matches!(
            EndpointUri::parse("no-scheme-here"),
            Err(ConfigurationError::InvalidUri { .. })
        ));
    }

    #[test]
    fn rejects_repeated_option() {
        let err = EndpointUri::parse("mock:a?x=1&x=2").unwrap_err();
        assert!(err.to_string().contains("given twice"));
    }

    #[test]
    fn typed_option_parsing() {
        let uri = EndpointUri::parse("timer:tick?period=250&fixed=yes").unwrap();
        assert_eq!(uri.options().parse::<u64>(uri.as_str(), "period"), Ok(Some(250)));
        assert_eq!(uri.options().parse::<u64>(uri.as_str(), "delay"), Ok(None));
        assert!(uri.options().parse::<bool>(uri.as_str(), "fixed").is_err());
    }

    #[test]
    fn endpoint_without_producer_reports_missing_capability() {
        let endpoint = Endpoint::new(EndpointUri::parse("mock:x").unwrap());
        assert!(matches!(
            endpoint.producer(),
            Err(ConfigurationError::MissingCapability { capability: "producer", .. })
        ));
    }
}
