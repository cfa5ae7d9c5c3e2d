//! The run-wide statistics report.

use serde::{Deserialize, Serialize};

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::{
    HardwareKind, KernelStatsDb, OpMetricsDb, OpStatsResult, PerfEnv, StepDatabase, TfFunctionDb,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunEnvironment {
    pub host_count: u32,
    pub task_count: u32,
    pub hostnames: BTreeSet<String>,
    pub device_type: String,
    pub device_core_count: u32,
    pub hardware_kind: Option<HardwareKind>,
    pub is_training: bool,
}

/// Identity of one device core, embedded as a JSON blob on its plane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreDetails {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub device_ordinal: u32,
    #[serde(default)]
    pub core_num: u32,
    #[serde(default)]
    pub local_chip_id: u32,
    #[serde(default)]
    pub global_chip_id: u32,
    #[serde(default)]
    pub global_core_id: u32,
    #[serde(default)]
    pub is_sparse_core: bool,
}

/// Deduplicated, sorted messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub errors: BTreeSet<String>,
    pub warnings: BTreeSet<String>,
}

impl Diagnostics {
    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.insert(message.into());
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.insert(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpStats {
    pub host_op_metrics_db: OpMetricsDb,
    pub device_op_metrics_db: OpMetricsDb,
    /// Device ops restricted to complete steps; filled for TPU runs only.
    pub hlo_metrics_db_complete_steps_only: OpMetricsDb,
    /// Device ops rolled up to the framework ops they were lowered from.
    pub framework_op_metrics_db: OpMetricsDb,
    pub step_db: StepDatabase,
    pub kernel_stats_db: KernelStatsDb,
    pub tf_function_db: TfFunctionDb,
    pub run_environment: RunEnvironment,
    pub perf_env: Option<PerfEnv>,
    /// Keyed by device plane id.
    pub core_id_to_details: BTreeMap<u32, CoreDetails>,
    pub diagnostics: Diagnostics,
    pub program_id_to_name_map: BTreeMap<u64, String>,
    pub matrix_unit_utilization_percent: Option<f64>,
}

impl OpStats {
    pub fn to_json(&self) -> OpStatsResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_json(&self, path: &Path) -> OpStatsResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Digest of the canonical JSON encoding; equal reports hash equally.
    pub fn fingerprint(&self) -> OpStatsResult<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }
}
