//! Engine configuration
//!
//! Loaded from JSON, then overridden from the environment:
//!
//! | Variable | Field |
//! |---|---|
//! | `TRUENO_LAYOUT_BACKEND` | `backend` |
//! | `TRUENO_LAYOUT_CACHE_DIR` | `cache_dir` |
//! | `TRUENO_LAYOUT_MAX_UNPACK_STEPS` | `max_unpack_steps` |

use crate::device::BackendKind;
use crate::error::{LayoutError, Result};
use crate::layout::{LayoutKind, ParamSet};
use serde::Deserialize;
use std::path::PathBuf;

/// Backend override
pub const ENV_BACKEND: &str = "TRUENO_LAYOUT_BACKEND";
/// Dataset cache directory override
pub const ENV_CACHE_DIR: &str = "TRUENO_LAYOUT_CACHE_DIR";
/// Unpack step cap override
pub const ENV_MAX_UNPACK_STEPS: &str = "TRUENO_LAYOUT_MAX_UNPACK_STEPS";

/// Default cap on unpack iterations per dataset
pub const DEFAULT_MAX_UNPACK_STEPS: usize = 16;
/// Default number of columns summarized for histograms
pub const DEFAULT_HISTOGRAM_COLUMNS: usize = 4;

fn default_algorithms() -> Vec<LayoutKind> {
    vec![LayoutKind::ForceDirected]
}

const fn default_max_unpack_steps() -> usize {
    DEFAULT_MAX_UNPACK_STEPS
}

const fn default_histogram_columns() -> usize {
    DEFAULT_HISTOGRAM_COLUMNS
}

/// Engine-wide settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Compute backend
    #[serde(default)]
    pub backend: BackendKind,
    /// Layout algorithms every simulation runs, in tick order
    #[serde(default = "default_algorithms")]
    pub algorithms: Vec<LayoutKind>,
    /// Parameters applied when a simulation is built
    #[serde(default)]
    pub params: ParamSet,
    /// Unpack iterations allowed before a dataset is rejected
    #[serde(default = "default_max_unpack_steps")]
    pub max_unpack_steps: usize,
    /// Numeric columns included in the load summary
    #[serde(default = "default_histogram_columns")]
    pub histogram_columns: usize,
    /// On-disk dataset cache; `None` disables caching
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            algorithms: default_algorithms(),
            params: ParamSet::default(),
            max_unpack_steps: DEFAULT_MAX_UNPACK_STEPS,
            histogram_columns: DEFAULT_HISTOGRAM_COLUMNS,
            cache_dir: None,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document; missing fields take their defaults
    ///
    /// # Errors
    ///
    /// Returns `UnrecognizedConfiguration` for malformed JSON, unknown fields
    /// or unknown algorithm/backend names
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| LayoutError::unrecognized("engine configuration", e.to_string()))
    }

    /// Apply overrides from the process environment
    ///
    /// # Errors
    ///
    /// See [`EngineConfig::with_overrides`]
    pub fn with_env(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup` (keys are the `ENV_*` names)
    ///
    /// # Errors
    ///
    /// Returns `UnrecognizedConfiguration` for an unknown backend or a
    /// non-numeric step cap
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(backend) = lookup(ENV_BACKEND) {
            self.backend = backend.parse()?;
        }
        if let Some(dir) = lookup(ENV_CACHE_DIR) {
            self.cache_dir = (!dir.is_empty()).then(|| PathBuf::from(dir));
        }
        if let Some(steps) = lookup(ENV_MAX_UNPACK_STEPS) {
            self.max_unpack_steps = steps
                .trim()
                .parse()
                .map_err(|_| LayoutError::unrecognized(ENV_MAX_UNPACK_STEPS, steps))?;
        }
        Ok(self)
    }
}
