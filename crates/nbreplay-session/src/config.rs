use crate::error::ConfigError;
use nbreplay::{AnalyzeOptions, DEFAULT_SIMILARITY_THRESHOLD, OrderIndex};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Options that shape a single replay session.
///
/// Every field has a default, so a TOML file only needs the keys it
/// changes:
///
/// ```toml
/// similarity_threshold = 0.9
/// execution_timeout_secs = 30
/// forward_only_propagation = true
/// prelude = ["import numpy as np"]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Minimum similarity for a source to reuse an existing cell id.
    pub similarity_threshold: f64,
    /// Wall-clock limit for one cell execution.
    pub execution_timeout_secs: f64,
    /// Ask the analyzer to only propagate staleness forward.
    pub forward_only_propagation: bool,
    /// Passed through to the analyzer.
    pub naive_refresher_computation: bool,
    /// Run cells under the analyzer and score predictions. When off, cells
    /// are only executed.
    pub tracked: bool,
    /// Hand the summary to the sink when the session ends.
    pub persist_stats: bool,
    /// Seed for the random baselines; drawn from the OS when unset.
    pub seed: Option<u64>,
    /// Sources executed untracked before the first recorded cell.
    pub prelude: Vec<String>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            execution_timeout_secs: 15.0,
            forward_only_propagation: false,
            naive_refresher_computation: false,
            tracked: true,
            persist_stats: true,
            seed: None,
            prelude: vec![
                "import numpy as np".to_string(),
                "import pandas as pd".to_string(),
            ],
        }
    }
}

impl ReplayConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(ConfigError::Invalid(format!(
                "similarity_threshold must be within [0, 1], got {}",
                self.similarity_threshold
            )));
        }
        self.execution_timeout()?;
        Ok(())
    }

    pub fn execution_timeout(&self) -> Result<Duration, ConfigError> {
        if self.execution_timeout_secs <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "execution_timeout_secs must be positive, got {}",
                self.execution_timeout_secs
            )));
        }
        Duration::try_from_secs_f64(self.execution_timeout_secs)
            .map_err(|e| ConfigError::Invalid(format!("execution_timeout_secs: {e}")))
    }

    pub fn analyze_options(&self) -> AnalyzeOptions {
        AnalyzeOptions {
            order: OrderIndex::from_forward_only(self.forward_only_propagation),
            naive_refresher_computation: self.naive_refresher_computation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ReplayConfig::default();
        assert_eq!(config.similarity_threshold, 0.8);
        assert_eq!(config.execution_timeout().unwrap(), Duration::from_secs(15));
        assert!(config.tracked);
        assert!(config.persist_stats);
        assert_eq!(config.analyze_options(), AnalyzeOptions::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ReplayConfig::from_toml_str(
            "forward_only_propagation = true\nexecution_timeout_secs = 2.5\nseed = 11\n",
        )
        .unwrap();
        assert_eq!(config.analyze_options().order, OrderIndex::Identity);
        assert_eq!(config.execution_timeout().unwrap(), Duration::from_millis(2500));
        assert_eq!(config.seed, Some(11));
        assert_eq!(config.similarity_threshold, 0.8);
        assert_eq!(config.prelude.len(), 2);
    }

    #[test]
    fn test_empty_prelude() {
        let config = ReplayConfig::from_toml_str("prelude = []").unwrap();
        assert!(config.prelude.is_empty());
    }

    #[test]
    fn test_rejects_out_of_range_threshold() {
        let err = ReplayConfig::from_toml_str("similarity_threshold = 1.5").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_non_positive_timeout() {
        let err = ReplayConfig::from_toml_str("execution_timeout_secs = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_bad_toml() {
        let err = ReplayConfig::from_toml_str("tracked = maybe").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "tracked = false\npersist_stats = false").unwrap();
        let config = ReplayConfig::load(file.path()).unwrap();
        assert!(!config.tracked);
        assert!(!config.persist_stats);
    }

    #[test]
    fn test_load_missing_file() {
        let err = ReplayConfig::load("/nonexistent/replay.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
