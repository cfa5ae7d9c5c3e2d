//! `opstats.toml` config loading.

use serde::{Deserialize, Serialize};

use std::path::Path;

use crate::ExecutorConfig;

pub const DEFAULT_CONFIG_FILE: &str = "opstats.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Conversion workers; one per available CPU when unset.
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Which parts of the report to produce.
    #[serde(default)]
    pub convert: ConvertOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ConvertOptions {
    #[serde(default = "default_true")]
    pub generate_op_metrics_db: bool,
    #[serde(default = "default_true")]
    pub generate_step_db: bool,
    #[serde(default = "default_true")]
    pub generate_kernel_stats_db: bool,
    #[serde(default)]
    pub maybe_drop_incomplete_steps: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            generate_op_metrics_db: true,
            generate_step_db: true,
            generate_kernel_stats_db: true,
            maybe_drop_incomplete_steps: false,
        }
    }
}

impl Config {
    pub fn load_optional(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(s) => match toml::from_str::<Config>(&s) {
                Ok(cfg) => cfg,
                Err(err) => {
                    tracing::warn!("failed to parse config {}: {err}", path.display());
                    Self::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(err) => {
                tracing::warn!("failed to read config {}: {err}", path.display());
                Self::default()
            }
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            worker_threads: self.worker_threads,
            ..ExecutorConfig::default()
        }
    }
}
