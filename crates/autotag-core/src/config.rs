//! Runtime settings for the tagging service.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, Thresholds};

/// Runtime configuration.
///
/// Deserialisable so it can be read from a file, but normally populated from
/// CLI flags and `AUTOTAG_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub high_threshold: f64,
    pub low_threshold: f64,
    /// YAML rule catalog.
    pub rules_path: PathBuf,
    /// JSONL sample corpus used to train the classifier.
    pub corpus_path: PathBuf,
    /// Directory holding the classifier's JSON artifacts.
    pub models_dir: PathBuf,
    /// DuckDB file; `None` keeps everything in memory.
    pub database_path: Option<PathBuf>,
    pub adjudicator_timeout_ms: u64,
    /// Chat endpoint for the model-backed adjudicator. `None` selects the
    /// deterministic heuristic adjudicator.
    pub adjudicator_url: Option<String>,
    pub adjudicator_model: Option<String>,
    /// Bearer token for the adjudicator endpoint.
    #[serde(skip_serializing)]
    pub adjudicator_api_key: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            high_threshold: Thresholds::DEFAULT_HIGH,
            low_threshold: Thresholds::DEFAULT_LOW,
            rules_path: PathBuf::from("data/rules.yaml"),
            corpus_path: PathBuf::from("data/sample_messages.jsonl"),
            models_dir: PathBuf::from("data/models"),
            database_path: None,
            adjudicator_timeout_ms: 5_000,
            adjudicator_url: None,
            adjudicator_model: None,
            adjudicator_api_key: None,
        }
    }
}

impl Settings {
    /// Validated routing thresholds.
    pub fn thresholds(&self) -> Result<Thresholds, ConfigError> {
        Thresholds::new(self.high_threshold, self.low_threshold)
    }

    pub fn adjudicator_timeout(&self) -> Result<Duration, ConfigError> {
        if self.adjudicator_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(Duration::from_millis(self.adjudicator_timeout_ms))
    }

    /// Check every derived value at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.thresholds()?;
        self.adjudicator_timeout()?;
        Ok(())
    }
}
