//! GPU device plane -> per-kernel reports.

use crate::{
    DERIVED_LINE_NAMES, EventView, HardwareKind, KernelDetails, KernelKey, KernelReport,
    KernelReportMap, ModuleMetadata, TracePlane, insert_or_update_kernel_report,
    is_kernel_using_tensor_core, is_op_tensor_core_eligible, stat,
};

use super::device_op_metrics::{hlo_op_name, stat_str, stat_u64};

/// Framework op that launched the kernel: the metadata service's answer for
/// `(program id, hlo op)` when it has one, else the event's `tf_op` stat.
fn kernel_op_name(event: &EventView<'_>, metadata: &dyn ModuleMetadata) -> String {
    if let (Some(program_id), Some(hlo_op)) =
        (stat_u64(event, stat::PROGRAM_ID), hlo_op_name(event))
    {
        if let Some(instr) = metadata.instruction(program_id, hlo_op) {
            if !instr.tf_op_name.is_empty() {
                return instr.tf_op_name.clone();
            }
        }
    }
    stat_str(event, stat::TF_OP).unwrap_or_default().to_string()
}

/// Every kernel event carrying launch details. Events whose details do not
/// parse are skipped with a warning.
pub fn convert_device_plane_to_kernel_reports(
    plane: &TracePlane,
    metadata: &dyn ModuleMetadata,
) -> KernelReportMap {
    let mut out = KernelReportMap::new();
    if HardwareKind::of_plane(&plane.name) != Some(HardwareKind::Gpu) {
        return out;
    }
    for line in plane.lines.iter().filter(|l| !DERIVED_LINE_NAMES.contains(&l.name.as_str())) {
        for event in plane.events(line) {
            let Some(raw) = stat_str(&event, stat::KERNEL_DETAILS) else {
                continue;
            };
            let details = match KernelDetails::parse(raw) {
                Ok(details) => details,
                Err(err) => {
                    tracing::warn!(
                        "skipping kernel {:?} on plane {}: {err}",
                        event.name(),
                        plane.name
                    );
                    continue;
                }
            };
            let op_name = kernel_op_name(&event, metadata);
            let key = KernelKey {
                name: event.name().to_string(),
                registers_per_thread: details.registers_per_thread,
                static_shmem_bytes: details.static_shmem_bytes,
                dynamic_shmem_bytes: details.dynamic_shmem_bytes,
                block_dim: details.block_dim,
                grid_dim: details.grid_dim,
                is_kernel_using_tensor_core: is_kernel_using_tensor_core(event.name()),
                op_name,
            };
            let mut report = KernelReport::new(key.clone(), event.duration_ps() / 1000);
            report.is_op_tensor_core_eligible = is_op_tensor_core_eligible(&key.op_name);
            insert_or_update_kernel_report(&key, &report, &mut out);
        }
    }
    out
}
