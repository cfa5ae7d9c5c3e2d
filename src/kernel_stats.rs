//! Per-kernel launch statistics and the top-K report.

use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;

use crate::{OpStatsError, OpStatsResult};

pub const KERNEL_REPORT_TOP_K: usize = 1000;

/// Static identity of a kernel launch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KernelKey {
    pub name: String,
    pub registers_per_thread: u32,
    pub static_shmem_bytes: u32,
    pub dynamic_shmem_bytes: u32,
    pub block_dim: [u32; 3],
    pub grid_dim: [u32; 3],
    pub op_name: String,
    pub is_kernel_using_tensor_core: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelReport {
    #[serde(flatten)]
    pub key: KernelKey,
    pub is_op_tensor_core_eligible: bool,
    pub occurrences: u32,
    pub total_duration_ns: u64,
    pub min_duration_ns: u64,
    pub max_duration_ns: u64,
}

impl KernelReport {
    pub fn new(key: KernelKey, duration_ns: u64) -> Self {
        Self {
            key,
            is_op_tensor_core_eligible: false,
            occurrences: 1,
            total_duration_ns: duration_ns,
            min_duration_ns: duration_ns,
            max_duration_ns: duration_ns,
        }
    }
}

pub type KernelReportMap = BTreeMap<KernelKey, KernelReport>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelStatsDb {
    pub reports: Vec<KernelReport>,
}

/// Adds `report` to the entry for `key`. Counters add, extremes widen and the
/// eligibility flag is OR-ed.
pub fn insert_or_update_kernel_report(
    key: &KernelKey,
    report: &KernelReport,
    dst: &mut KernelReportMap,
) {
    match dst.get_mut(key) {
        Some(existing) => {
            existing.occurrences = existing.occurrences.saturating_add(report.occurrences);
            existing.total_duration_ns = existing
                .total_duration_ns
                .saturating_add(report.total_duration_ns);
            existing.min_duration_ns = existing.min_duration_ns.min(report.min_duration_ns);
            existing.max_duration_ns = existing.max_duration_ns.max(report.max_duration_ns);
            existing.is_op_tensor_core_eligible |= report.is_op_tensor_core_eligible;
        }
        None => {
            dst.insert(key.clone(), report.clone());
        }
    }
}

pub fn copy_top_k_duration_kernel_reports_to_db(reports: &KernelReportMap) -> KernelStatsDb {
    copy_top_k_kernel_reports(reports, KERNEL_REPORT_TOP_K)
}

/// Longest total duration first; ties by kernel name, then the full key.
pub(crate) fn copy_top_k_kernel_reports(reports: &KernelReportMap, k: usize) -> KernelStatsDb {
    let mut candidates: Vec<&KernelReport> = reports.values().collect();
    candidates.sort_by(|a, b| {
        b.total_duration_ns
            .cmp(&a.total_duration_ns)
            .then_with(|| a.key.name.cmp(&b.key.name))
            .then_with(|| a.key.cmp(&b.key))
    });
    KernelStatsDb {
        reports: candidates.into_iter().take(k).cloned().collect(),
    }
}

/// Launch configuration from a `kernel_details` stat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelDetails {
    pub registers_per_thread: u32,
    pub static_shmem_bytes: u32,
    pub dynamic_shmem_bytes: u32,
    pub grid_dim: [u32; 3],
    pub block_dim: [u32; 3],
}

impl KernelDetails {
    /// Parses space-separated `key:value` pairs such as
    /// `regs:32 static_shared:0 dynamic_shared:0 grid:1,1,1 block:128,1,1`.
    /// Unknown keys are ignored.
    pub fn parse(details: &str) -> OpStatsResult<Self> {
        let mut out = Self::default();
        for token in details.split_whitespace() {
            let Some((key, value)) = token.split_once(':') else {
                continue;
            };
            match key {
                "regs" => out.registers_per_thread = parse_u32(key, value)?,
                "static_shared" => out.static_shmem_bytes = parse_u32(key, value)?,
                "dynamic_shared" => out.dynamic_shmem_bytes = parse_u32(key, value)?,
                "grid" => out.grid_dim = parse_dim(key, value)?,
                "block" => out.block_dim = parse_dim(key, value)?,
                _ => {}
            }
        }
        Ok(out)
    }
}

fn parse_u32(key: &str, value: &str) -> OpStatsResult<u32> {
    value
        .parse::<u32>()
        .map_err(|_| OpStatsError::Trace(format!("invalid kernel detail {key}:{value}")))
}

fn parse_dim(key: &str, value: &str) -> OpStatsResult<[u32; 3]> {
    let mut dim = [1u32; 3];
    let parts: Vec<&str> = value.split(',').collect();
    if parts.is_empty() || parts.len() > 3 {
        return Err(OpStatsError::Trace(format!("invalid kernel dimension {key}:{value}")));
    }
    for (slot, part) in dim.iter_mut().zip(parts) {
        *slot = parse_u32(key, part)?;
    }
    Ok(dim)
}

const TENSOR_CORE_KERNEL_MARKERS: &[&str] = &[
    "h884", "s884", "h1688", "s1688", "i8816", "h16816", "s16816", "hmma", "imma", "wmma", "xmma",
    "gmma", "tensorop",
];

/// Name-based guess at whether a kernel runs on tensor cores.
pub fn is_kernel_using_tensor_core(kernel_name: &str) -> bool {
    let lower = kernel_name.to_ascii_lowercase();
    TENSOR_CORE_KERNEL_MARKERS.iter().any(|m| lower.contains(m))
}

const TENSOR_CORE_ELIGIBLE_OP_MARKERS: &[&str] = &[
    "conv", "matmul", "einsum", "dot", "gemm", "cudnnrnn", "fusedbatchnorm",
];

/// Whether a framework op is of a kind that could use tensor cores.
pub fn is_op_tensor_core_eligible(tf_op_name: &str) -> bool {
    let lower = tf_op_name.to_ascii_lowercase();
    let op_type = lower.rsplit_once(':').map_or(lower.as_str(), |(_, t)| t);
    TENSOR_CORE_ELIGIBLE_OP_MARKERS.iter().any(|m| op_type.contains(m))
}
