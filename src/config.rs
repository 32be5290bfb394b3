//! Configuration document tying the components together.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ValidationError};
use crate::flatten::{FlattenKind, MergeConfig};
use crate::policy::HotStreamConfig;
use crate::scheduler::{SchedulerConfig, Ticks};
use crate::stream::PublisherConfig;

/// Everything needed to wire a publisher, an outer stream and a combinator.
///
/// Missing fields take their defaults, so `{}` is a valid document.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HotflowConfig {
    pub stream: HotStreamConfig,
    pub publisher: PublisherConfig,
    pub scheduler: SchedulerConfig,
    /// Strategy used by config-driven combinators.
    pub strategy: FlattenKind,
    pub merge: MergeConfig,
    /// Synthetic delay before each inner element.
    pub inner_delay_ticks: Ticks,
}

impl Default for HotflowConfig {
    fn default() -> Self {
        Self {
            stream: HotStreamConfig::default(),
            publisher: PublisherConfig::default(),
            scheduler: SchedulerConfig::default(),
            strategy: FlattenKind::default(),
            merge: MergeConfig::default(),
            inner_delay_ticks: 500,
        }
    }
}

impl HotflowConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::Parse { message: e.to_string() })?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes to pretty JSON.
    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse { message: e.to_string() })
    }

    /// Validates every section.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.stream.validate()?;
        self.scheduler.validate()?;
        self.merge.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::policy::OverflowPolicy;

    #[test]
    fn empty_document_uses_defaults() {
        let config = HotflowConfig::from_json_str("{}").unwrap();
        assert_eq!(config, HotflowConfig::default());
        assert_eq!(config.inner_delay_ticks, 500);
        assert_eq!(config.publisher.pacing_ticks, 100);
        assert_eq!(config.strategy, FlattenKind::Concat);
    }

    #[test]
    fn parses_nested_sections() {
        let json = r#"{
            "stream": { "replay": { "extra_buffer_capacity": 1 }, "overflow": "drop_oldest" },
            "strategy": "merge",
            "merge": { "concurrency": 4 },
            "inner_delay_ticks": 50
        }"#;
        let config = HotflowConfig::from_json_str(json).unwrap();
        assert_eq!(config.stream, HotStreamConfig::new(0, 1, OverflowPolicy::DropOldest));
        assert_eq!(config.strategy, FlattenKind::Merge);
        assert_eq!(config.merge, MergeConfig::bounded(4));
        assert_eq!(config.inner_delay_ticks, 50);
        assert_eq!(config.scheduler, SchedulerConfig::default());
    }

    #[test]
    fn rejects_invalid_sections() {
        let err = HotflowConfig::from_json_str(r#"{ "stream": { "overflow": "drop_latest" } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ValidationError::DropPolicyWithoutBuffer { .. })));

        let err = HotflowConfig::from_json_str(r#"{ "merge": { "concurrency": 0 } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ValidationError::ZeroConcurrency)));

        let err = HotflowConfig::from_json_str(r#"{ "stream": { "overflow": "explode" } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn json_round_trip() {
        let config = HotflowConfig {
            strategy: FlattenKind::Latest,
            ..HotflowConfig::default()
        };
        let json = config.to_json_string().unwrap();
        assert_eq!(HotflowConfig::from_json_str(&json).unwrap(), config);
    }
}
