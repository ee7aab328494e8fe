// config.rs — Search and generation settings
//
// One `SearchConfig` value is passed explicitly into every check and
// generation call. It loads from JSON (missing keys take defaults) so the
// CLI can read a settings file and then apply flag overrides.
//
// Preconditions: none.
// Postconditions: `Default` matches the documented defaults.
// Failure modes: malformed JSON → `ConfigError`.
// Side effects: `load` reads a file.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::eval::EvalConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Largest edit distance explored when repairing a call.
    pub max_search_dist: u32,
    /// Cap on values kept from one node evaluation.
    pub max_yield_count: usize,
    /// Invalid dtypes generated per tensor when mutating.
    pub dtype_err_quota: usize,
    /// Target element count used to size generated dimensions.
    pub target_nelem: f64,
    /// Edit budget used by `generate_args`.
    pub test_edits: u32,
    /// Base seed for generation; mixed with the schema fingerprint.
    pub seed: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_search_dist: 4,
            max_yield_count: 1000,
            dtype_err_quota: 2,
            target_nelem: 1e6,
            test_edits: 1,
            seed: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Json(#[from] serde_json::Error),
}

impl SearchConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn eval_config(&self, budget: u32) -> EvalConfig {
        EvalConfig {
            budget,
            max_yield: self.max_yield_count,
        }
    }
}
