//! Well-known plane, line and stat names of the capture format, and the
//! hardware classification derived from them.

use serde::{Deserialize, Serialize};

pub const TPU_PLANE_PREFIX: &str = "/device:TPU:";
pub const GPU_PLANE_PREFIX: &str = "/device:GPU:";
pub const HOST_THREADS_PLANE_NAME: &str = "/host:CPU";
const SPARSE_CORE_MARKER: &str = " SparseCore ";

pub const XLA_OP_LINE_NAME: &str = "XLA Ops";
pub const XLA_MODULE_LINE_NAME: &str = "XLA Modules";
pub const STEP_LINE_NAME: &str = "Steps";
pub const SPARSE_CORE_OP_LINE_NAME: &str = "Sparse Core Ops";
pub const SPARSE_CORE_MODULE_LINE_NAME: &str = "Sparse Core Modules";
pub const SPARSE_CORE_STEP_LINE_NAME: &str = "Sparse Core Steps";

/// Lines on a GPU device plane that are derived from other lines and must not
/// be counted twice.
pub const DERIVED_LINE_NAMES: &[&str] = &[
    XLA_OP_LINE_NAME,
    XLA_MODULE_LINE_NAME,
    STEP_LINE_NAME,
    "TensorFlow Ops",
    "TensorFlow Name Scope",
    "Source code",
];

pub mod stat {
    pub const GROUP_ID: &str = "group_id";
    pub const PROGRAM_ID: &str = "program_id";
    pub const SYMBOL_ID: &str = "symbol_id";
    pub const HLO_CATEGORY: &str = "hlo_category";
    pub const HLO_OP: &str = "hlo_op";
    pub const TF_OP: &str = "tf_op";
    pub const FLOPS: &str = "flops";
    pub const MODEL_FLOPS: &str = "model_flops";
    pub const BYTES_ACCESSED: &str = "bytes_accessed";
    pub const MEMORY_ACCESS_BREAKDOWN: &str = "memory_access_breakdown";
    pub const DEDUPLICATED_NAME: &str = "deduplicated_name";
    pub const SOURCE_INFO: &str = "source_info";
    pub const SOURCE_STACK: &str = "source_stack";
    pub const MIN_DURATION_PS: &str = "min_duration_ps";
    pub const SELF_DURATION_PS: &str = "self_duration_ps";
    pub const DMA_STALL_DURATION_PS: &str = "dma_stall_duration_ps";
    pub const STEP_IDLE_TIME_PS: &str = "step_idle_time_ps";
    pub const CORE_DETAILS: &str = "core_details";
    pub const DEVICE_TYPE_STRING: &str = "device_type_string";
    pub const KERNEL_DETAILS: &str = "kernel_details";
    pub const IS_EAGER: &str = "is_eager";
    pub const STEP_NUM: &str = "step_num";
    pub const STEP_NAME: &str = "step_name";
    pub const MATRIX_UNIT_UTILIZATION_PERCENT: &str = "matrix_unit_utilization_percent";
    pub const TF_FUNCTION_CALL: &str = "tf_function_call";
    pub const TF_FUNCTION_TRACING_COUNT: &str = "tf_function_tracing_count";

    pub const DEV_CAP_GPU_MODEL: &str = "dev_cap_gpu_model";
    pub const DEV_CAP_CORE_COUNT: &str = "dev_cap_core_count";
    pub const DEV_CAP_PEAK_GIGA_FLOPS_PER_SM: &str = "dev_cap_peak_giga_flops_per_sm";
    pub const DEV_CAP_MEMORY_BANDWIDTH: &str = "dev_cap_memory_bandwidth";
    pub const DEV_CAP_SHARED_MEMORY_BANDWIDTH_PER_SM: &str =
        "dev_cap_shared_memory_bandwidth_per_sm";
    pub const DEV_CAP_PEAK_TERAFLOPS_PER_SECOND: &str = "dev_cap_peak_teraflops_per_second";
    pub const DEV_CAP_PEAK_HBM_BW_GBPS: &str = "dev_cap_peak_hbm_bw_gigabytes_per_second";
    pub const DEV_CAP_PEAK_SRAM_RD_BW_GBPS: &str = "dev_cap_peak_sram_rd_bw_gigabytes_per_second";
    pub const DEV_CAP_PEAK_SRAM_WR_BW_GBPS: &str = "dev_cap_peak_sram_wr_bw_gigabytes_per_second";
    pub const DEV_CAP_PEAK_CMEM_RD_BW_GBPS: &str = "dev_cap_peak_cmem_rd_bw_gigabytes_per_second";
    pub const DEV_CAP_PEAK_CMEM_WR_BW_GBPS: &str = "dev_cap_peak_cmem_wr_bw_gigabytes_per_second";
    pub const DEV_CAP_PEAK_VMEM_RD_BW_GBPS: &str = "dev_cap_peak_vmem_rd_bw_gigabytes_per_second";
    pub const DEV_CAP_PEAK_VMEM_WR_BW_GBPS: &str = "dev_cap_peak_vmem_wr_bw_gigabytes_per_second";
    pub const DEV_HAS_MEGACORE: &str = "dev_has_megacore";
    pub const DEV_HAS_MERGED_VMEM: &str = "dev_has_merged_vmem";
}

/// Hardware classification. A run is classified once as `CpuOnly`, `Gpu` or
/// `Tpu`; individual device planes are `Gpu`, `Tpu` or `SparseCore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareKind {
    CpuOnly,
    Gpu,
    Tpu,
    SparseCore,
}

impl HardwareKind {
    /// Classifies a device plane by name; host and unknown planes yield `None`.
    pub fn of_plane(plane_name: &str) -> Option<Self> {
        if plane_name.starts_with(TPU_PLANE_PREFIX) {
            if sparse_core_id(plane_name).is_some() {
                Some(Self::SparseCore)
            } else {
                Some(Self::Tpu)
            }
        } else if plane_name.starts_with(GPU_PLANE_PREFIX) {
            Some(Self::Gpu)
        } else {
            None
        }
    }

    /// TPU wins over GPU; no device planes at all means a CPU-only run.
    pub fn classify<'a>(plane_names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut kind = Self::CpuOnly;
        for name in plane_names {
            match Self::of_plane(name) {
                Some(Self::Tpu) | Some(Self::SparseCore) => return Self::Tpu,
                Some(Self::Gpu) => kind = Self::Gpu,
                _ => {}
            }
        }
        kind
    }

    pub fn is_tpu_family(self) -> bool {
        matches!(self, Self::Tpu | Self::SparseCore)
    }

    pub fn plane_prefix(self) -> Option<&'static str> {
        match self {
            Self::Gpu => Some(GPU_PLANE_PREFIX),
            Self::Tpu | Self::SparseCore => Some(TPU_PLANE_PREFIX),
            Self::CpuOnly => None,
        }
    }
}

/// Extracts `n` from plane names of the form `/device:TPU:0 SparseCore n`.
pub fn sparse_core_id(plane_name: &str) -> Option<u32> {
    let idx = plane_name.find(SPARSE_CORE_MARKER)?;
    plane_name[idx + SPARSE_CORE_MARKER.len()..]
        .trim()
        .parse::<u32>()
        .ok()
}

/// HLO categories during which a core waits on the host rather than computing.
pub fn is_off_duty_category(category: &str) -> bool {
    matches!(
        category,
        "idle"
            | "infeed"
            | "outfeed"
            | "host send"
            | "host send-done"
            | "host recv"
            | "host recv-done"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_core_planes_are_recognised() {
        assert_eq!(sparse_core_id("/device:TPU:0 SparseCore 3"), Some(3));
        assert_eq!(sparse_core_id("/device:TPU:0"), None);
        assert_eq!(
            HardwareKind::of_plane("/device:TPU:1 SparseCore 0"),
            Some(HardwareKind::SparseCore)
        );
    }

    #[test]
    fn tpu_planes_win_classification() {
        let names = ["/host:CPU", "/device:GPU:0", "/device:TPU:0"];
        assert_eq!(HardwareKind::classify(names), HardwareKind::Tpu);
        assert_eq!(HardwareKind::classify(["/device:GPU:1"]), HardwareKind::Gpu);
        assert_eq!(HardwareKind::classify(["/host:CPU"]), HardwareKind::CpuOnly);
    }
}
