use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default delay between redeliveries when no backoff is configured.
pub const DEFAULT_REDELIVERY_DELAY_MS: u64 = 1_000;

/// Engine-level configuration.
///
/// Controls trampolining, default step deadlines, shutdown draining, and
/// admission limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Consecutive synchronous step completions after which the walker
    /// yields to the executor.
    pub sync_step_budget: usize,
    /// Deadline for suspended steps that set none of their own.
    #[serde(with = "opt_millis")]
    pub default_step_timeout: Option<Duration>,
    /// How long `shutdown()` waits for in-flight exchanges.
    #[serde(with = "millis")]
    pub shutdown_timeout: Duration,
    /// In-flight limit. Applies separately to `Engine::route` (and sinks) and
    /// to each load-shedding layer; `Engine::process` is not limited.
    pub max_in_flight: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync_step_budget: 128,
            default_step_timeout: None,
            shutdown_timeout: Duration::from_secs(30),
            max_in_flight: 10_000,
        }
    }
}

impl EngineConfig {
    /// Parses a JSON document; absent fields keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error for malformed input.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// `Duration` as integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// `Option<Duration>` as integer milliseconds or `null`.
pub(crate) mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub(crate) fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.sync_step_budget, 128);
        assert_eq!(config.default_step_timeout, None);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(config.max_in_flight, 10_000);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = EngineConfig::from_json(r#"{ "default_step_timeout": 1500, "max_in_flight": 64 }"#).unwrap();
        assert_eq!(config.default_step_timeout, Some(Duration::from_millis(1_500)));
        assert_eq!(config.max_in_flight, 64);
        assert_eq!(config.sync_step_budget, 128);
    }

    #[test]
    fn serializes_durations_as_millis() {
        let json = serde_json::to_value(EngineConfig::default()).unwrap();
        assert_eq!(json["shutdown_timeout"], 30_000);
        assert!(json["default_step_timeout"].is_null());
    }

    #[test]
    fn rejects_wrong_types() {
        assert!(EngineConfig::from_json(r#"{ "shutdown_timeout": "soon" }"#).is_err());
    }
}
