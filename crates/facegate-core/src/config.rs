use crate::matcher::Aggregation;
use crate::similarity::{Scorer, DEFAULT_COSINE_WEIGHT, DEFAULT_L2_WEIGHT};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_THRESHOLD: f32 = 0.85;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Verification settings. Missing TOML keys take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// A match passes when its similarity is strictly above this.
    pub threshold: f32,
    pub cosine_weight: f32,
    pub l2_weight: f32,
    pub aggregation: Aggregation,
    /// Threads used to score gallery records.
    pub worker_count: usize,
    /// Longest the session sleeps between stop checks while no frame arrives.
    pub poll_interval_ms: u64,
    /// LRU bound on cached embeddings; `None` keeps everything for the session.
    pub cache_capacity: Option<usize>,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            cosine_weight: DEFAULT_COSINE_WEIGHT,
            l2_weight: DEFAULT_L2_WEIGHT,
            aggregation: Aggregation::default(),
            worker_count: default_workers(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            cache_capacity: None,
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl VerifierConfig {
    /// Load configuration from `FACEGATE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let aggregation = match lookup("FACEGATE_AGGREGATION") {
            Some(v) => v.parse().unwrap_or_else(|e| {
                tracing::warn!(value = %v, error = %e, "ignoring FACEGATE_AGGREGATION");
                defaults.aggregation
            }),
            None => defaults.aggregation,
        };

        Self {
            threshold: parse_or(&lookup, "FACEGATE_THRESHOLD", defaults.threshold),
            cosine_weight: parse_or(&lookup, "FACEGATE_COSINE_WEIGHT", defaults.cosine_weight),
            l2_weight: parse_or(&lookup, "FACEGATE_L2_WEIGHT", defaults.l2_weight),
            aggregation,
            worker_count: parse_or(&lookup, "FACEGATE_WORKERS", defaults.worker_count),
            poll_interval_ms: parse_or(
                &lookup,
                "FACEGATE_POLL_INTERVAL_MS",
                defaults.poll_interval_ms,
            ),
            cache_capacity: lookup("FACEGATE_CACHE_CAPACITY")
                .and_then(|v| v.parse().ok())
                .or(defaults.cache_capacity),
        }
    }

    pub fn from_toml_str(src: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(src)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let src = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&src)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.threshold.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "threshold must be finite, got {}",
                self.threshold
            )));
        }
        for (name, w) in [
            ("cosine_weight", self.cosine_weight),
            ("l2_weight", self.l2_weight),
        ] {
            if !w.is_finite() || w < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be a non-negative finite number, got {w}"
                )));
            }
        }
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid("worker_count must be at least 1".into()));
        }
        Ok(())
    }

    pub fn scorer(&self) -> Scorer {
        Scorer::new(self.cosine_weight, self.l2_weight)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let c = VerifierConfig::default();
        assert!((c.threshold - 0.85).abs() < 1e-6);
        assert!((c.cosine_weight - 0.6).abs() < 1e-6);
        assert!((c.l2_weight - 0.4).abs() < 1e-6);
        assert_eq!(c.aggregation, Aggregation::GroupedAverage);
        assert!(c.worker_count >= 1);
        assert!(c.cache_capacity.is_none());
        c.validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let c = VerifierConfig::from_lookup(lookup_from(&[
            ("FACEGATE_THRESHOLD", "0.9"),
            ("FACEGATE_AGGREGATION", "single-best"),
            ("FACEGATE_WORKERS", "3"),
            ("FACEGATE_CACHE_CAPACITY", "64"),
        ]));
        assert!((c.threshold - 0.9).abs() < 1e-6);
        assert_eq!(c.aggregation, Aggregation::SingleBest);
        assert_eq!(c.worker_count, 3);
        assert_eq!(c.cache_capacity, Some(64));
    }

    #[test]
    fn test_env_bad_values_fall_back() {
        let c = VerifierConfig::from_lookup(lookup_from(&[
            ("FACEGATE_THRESHOLD", "high"),
            ("FACEGATE_AGGREGATION", "median"),
        ]));
        assert!((c.threshold - DEFAULT_THRESHOLD).abs() < 1e-6);
        assert_eq!(c.aggregation, Aggregation::GroupedAverage);
    }

    #[test]
    fn test_toml_partial() {
        let c = VerifierConfig::from_toml_str(
            r#"
            threshold = 0.7
            aggregation = "single-best"
            "#,
        )
        .unwrap();
        assert!((c.threshold - 0.7).abs() < 1e-6);
        assert_eq!(c.aggregation, Aggregation::SingleBest);
        assert!((c.l2_weight - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_toml_rejects_invalid() {
        assert!(matches!(
            VerifierConfig::from_toml_str("worker_count = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            VerifierConfig::from_toml_str("l2_weight = -0.1"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            VerifierConfig::from_toml_str("threshold = \"x\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_poll_interval_never_zero() {
        let c = VerifierConfig {
            poll_interval_ms: 0,
            ..VerifierConfig::default()
        };
        assert_eq!(c.poll_interval(), Duration::from_millis(1));
    }
}
