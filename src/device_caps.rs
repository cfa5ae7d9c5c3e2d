//! Peak throughput and bandwidth of a device, read from plane stats.

use serde::{Deserialize, Serialize};

use crate::{HardwareKind, StatValue, TracePlane, safe_divide, stat};

/// Order of entries in [`PerfEnv::peak_bws_giga_bytes_per_second`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemBwType {
    HbmRw = 0,
    SramRd = 1,
    SramWr = 2,
    CmemRd = 3,
    CmemWr = 4,
    VmemRd = 5,
    VmemWr = 6,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerfEnv {
    pub peak_tera_flops_per_second: f64,
    pub peak_bws_giga_bytes_per_second: Vec<f64>,
    /// FLOPs per byte of HBM traffic at which compute becomes the bound.
    pub ridge_point: f64,
    #[serde(default)]
    pub has_cmem: bool,
    #[serde(default)]
    pub has_merged_vmem: bool,
    #[serde(default)]
    pub has_megacore: bool,
}

impl PerfEnv {
    pub fn new(peak_tera_flops_per_second: f64, peak_bws: Vec<f64>) -> Self {
        let hbm = peak_bws.get(MemBwType::HbmRw as usize).copied().unwrap_or_default();
        Self {
            peak_tera_flops_per_second,
            ridge_point: safe_divide(peak_tera_flops_per_second * 1000.0, hbm),
            peak_bws_giga_bytes_per_second: peak_bws,
            has_cmem: false,
            has_merged_vmem: false,
            has_megacore: false,
        }
    }

    pub fn bandwidth(&self, kind: MemBwType) -> f64 {
        self.peak_bws_giga_bytes_per_second
            .get(kind as usize)
            .copied()
            .unwrap_or_default()
    }
}

/// Device capability lookup, shared read-only by conversion tasks.
pub trait DeviceCapabilities: Send + Sync {
    fn perf_env(&self, plane: &TracePlane) -> PerfEnv;
}

/// Reads the `dev_cap_*` stats recorded on the device plane.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaneStatCapabilities;

impl DeviceCapabilities for PlaneStatCapabilities {
    fn perf_env(&self, plane: &TracePlane) -> PerfEnv {
        if HardwareKind::of_plane(&plane.name).is_some_and(HardwareKind::is_tpu_family) {
            tpu_perf_env(plane)
        } else {
            gpu_perf_env(plane)
        }
    }
}

fn stat_f64(plane: &TracePlane, name: &str) -> f64 {
    plane.stat(name).and_then(StatValue::as_f64).unwrap_or_default()
}

fn stat_bool(plane: &TracePlane, name: &str) -> bool {
    plane.stat(name).and_then(StatValue::as_bool).unwrap_or_default()
}

fn gpu_perf_env(plane: &TracePlane) -> PerfEnv {
    let cores = stat_f64(plane, stat::DEV_CAP_CORE_COUNT);
    let peak_tera_flops_per_second =
        cores * stat_f64(plane, stat::DEV_CAP_PEAK_GIGA_FLOPS_PER_SM) / 1000.0;
    let hbm = stat_f64(plane, stat::DEV_CAP_MEMORY_BANDWIDTH) / 1e9;
    let shared = cores * stat_f64(plane, stat::DEV_CAP_SHARED_MEMORY_BANDWIDTH_PER_SM) / 1e9;
    // Shared memory reads and writes share one figure.
    PerfEnv::new(peak_tera_flops_per_second, vec![hbm, shared, shared])
}

fn tpu_perf_env(plane: &TracePlane) -> PerfEnv {
    let bws = [
        stat::DEV_CAP_PEAK_HBM_BW_GBPS,
        stat::DEV_CAP_PEAK_SRAM_RD_BW_GBPS,
        stat::DEV_CAP_PEAK_SRAM_WR_BW_GBPS,
        stat::DEV_CAP_PEAK_CMEM_RD_BW_GBPS,
        stat::DEV_CAP_PEAK_CMEM_WR_BW_GBPS,
        stat::DEV_CAP_PEAK_VMEM_RD_BW_GBPS,
        stat::DEV_CAP_PEAK_VMEM_WR_BW_GBPS,
    ]
    .iter()
    .map(|name| stat_f64(plane, name))
    .collect();
    let mut env = PerfEnv::new(stat_f64(plane, stat::DEV_CAP_PEAK_TERAFLOPS_PER_SECOND), bws);
    env.has_cmem = env.bandwidth(MemBwType::CmemRd) > 0.0 || env.bandwidth(MemBwType::CmemWr) > 0.0;
    env.has_merged_vmem = stat_bool(plane, stat::DEV_HAS_MERGED_VMEM);
    env.has_megacore = stat_bool(plane, stat::DEV_HAS_MEGACORE);
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Stats;

    fn plane(name: &str, stats: &[(&str, StatValue)]) -> TracePlane {
        TracePlane {
            id: 1,
            name: name.to_string(),
            stats: stats
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<Stats>(),
            ..TracePlane::default()
        }
    }

    #[test]
    fn gpu_envelope_scales_per_sm_figures() {
        let plane = plane(
            "/device:GPU:0",
            &[
                (stat::DEV_CAP_CORE_COUNT, StatValue::Int(80)),
                (stat::DEV_CAP_PEAK_GIGA_FLOPS_PER_SM, StatValue::Double(200.0)),
                (stat::DEV_CAP_MEMORY_BANDWIDTH, StatValue::Uint(900_000_000_000)),
            ],
        );
        let env = PlaneStatCapabilities.perf_env(&plane);
        assert!((env.peak_tera_flops_per_second - 16.0).abs() < 1e-9);
        assert!((env.bandwidth(MemBwType::HbmRw) - 900.0).abs() < 1e-9);
        assert!((env.ridge_point - 16_000.0 / 900.0).abs() < 1e-9);
        assert_eq!(env.peak_bws_giga_bytes_per_second.len(), 3);
    }

    #[test]
    fn tpu_envelope_reads_flags() {
        let plane = plane(
            "/device:TPU:0",
            &[
                (stat::DEV_CAP_PEAK_TERAFLOPS_PER_SECOND, StatValue::Double(275.0)),
                (stat::DEV_CAP_PEAK_HBM_BW_GBPS, StatValue::Double(1200.0)),
                (stat::DEV_CAP_PEAK_CMEM_WR_BW_GBPS, StatValue::Double(10.0)),
                (stat::DEV_HAS_MEGACORE, StatValue::Bool(true)),
            ],
        );
        let env = PlaneStatCapabilities.perf_env(&plane);
        assert!(env.has_cmem);
        assert!(env.has_megacore);
        assert!(!env.has_merged_vmem);
        assert_eq!(env.peak_bws_giga_bytes_per_second.len(), 7);
    }

    #[test]
    fn missing_bandwidth_gives_zero_ridge_point() {
        let env = PlaneStatCapabilities.perf_env(&plane("/device:TPU:0", &[]));
        assert_eq!(env.ridge_point, 0.0);
    }
}
