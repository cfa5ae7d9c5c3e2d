//! Capture -> `OpStats` conversion.
//!
//! Device planes are converted in parallel, one task per plane and output,
//! each task writing only to its own slot. Slots are then reduced in plane
//! order so the report does not depend on task completion order.

mod device_op_metrics;
mod device_trace;
mod host_op_metrics;
mod host_tf_functions;
mod kernel_reports;
mod plane_steps;

pub use device_op_metrics::{SPARSE_CORE_BUSY_MODULE_ID, convert_device_plane_to_op_metrics_db};
pub use device_trace::*;
pub use host_op_metrics::*;
pub use host_tf_functions::*;
pub use kernel_reports::*;
pub use plane_steps::*;

use crate::{
    ConvertOptions, CoreDetails, DeviceCapabilities, Diagnostics, DutyCycleCombiner, Executor,
    ExecutorConfig, HardwareKind, KernelReportMap, ModuleMap, ModuleMetadata, OpMetricsDb,
    OpMetricsDbCombiner, OpStats, OpStatsResult, PlaneStatCapabilities, RunEnvironment, StatValue,
    StepCombinePolicy, StepEvents, StepEventsReducer, TracePlane, TraceSpace, combine_all,
    compute_precision_stats, convert_step_events_to_step_db,
    copy_top_k_duration_kernel_reports_to_db, insert_or_update_kernel_report, stat,
    tf_metrics_db_from_device_db, to_non_overlapped_step_events, union_combine_step_events,
};

/// Local core id of the single GPU core entry.
const DEFAULT_GPU_LOCAL_CORE_ID: u32 = 0;

/// Converts a capture with the built-in metadata and capability services.
/// The module catalog is indexed only when kernel reports, or TPU op metrics,
/// are requested.
pub fn convert_trace_space_to_op_stats(
    space: &TraceSpace,
    options: &ConvertOptions,
    executor_config: &ExecutorConfig,
) -> OpStatsResult<OpStats> {
    let kind = classify_space(space);
    let needs_modules = options.generate_kernel_stats_db
        || (kind.is_tpu_family() && options.generate_op_metrics_db);
    let modules = if needs_modules {
        ModuleMap::from_modules(&space.modules)
    } else {
        ModuleMap::default()
    };
    convert_trace_space_to_op_stats_with(
        space,
        options,
        executor_config,
        &modules,
        &PlaneStatCapabilities,
    )
}

fn classify_space(space: &TraceSpace) -> HardwareKind {
    HardwareKind::classify(space.planes.iter().map(|p| p.name.as_str()))
}

/// Device planes of the run's hardware kind, in capture order.
fn device_planes(space: &TraceSpace, kind: HardwareKind) -> Vec<&TracePlane> {
    kind.plane_prefix()
        .map(|prefix| space.planes_with_prefix(prefix))
        .unwrap_or_default()
}

fn run_environment(
    space: &TraceSpace,
    kind: HardwareKind,
    device_planes: &[&TracePlane],
) -> RunEnvironment {
    let mut env = RunEnvironment {
        host_count: 1,
        task_count: 1,
        hardware_kind: Some(kind),
        ..RunEnvironment::default()
    };
    env.hostnames.insert(space.hostname().to_string());
    match kind {
        HardwareKind::Gpu => {
            env.device_type = device_planes
                .first()
                .and_then(|p| p.stat(stat::DEV_CAP_GPU_MODEL))
                .and_then(StatValue::as_str)
                .filter(|model| !model.is_empty())
                .unwrap_or("GPU")
                .to_string();
            env.device_core_count = u32::try_from(device_planes.len()).unwrap_or(u32::MAX);
        }
        HardwareKind::Tpu | HardwareKind::SparseCore => {
            let tensor_cores: Vec<&&TracePlane> = device_planes
                .iter()
                .filter(|p| HardwareKind::of_plane(&p.name) == Some(HardwareKind::Tpu))
                .collect();
            env.device_type = tensor_cores
                .first()
                .and_then(|p| p.stat(stat::DEVICE_TYPE_STRING))
                .and_then(StatValue::as_str)
                .unwrap_or_default()
                .to_string();
            env.device_core_count = u32::try_from(tensor_cores.len()).unwrap_or(u32::MAX);
        }
        HardwareKind::CpuOnly => {
            env.device_type = "CPU".to_string();
            env.device_core_count = 0;
        }
    }
    env
}

fn diagnostics_from(space: &TraceSpace) -> Diagnostics {
    let mut diagnostics = Diagnostics::default();
    for error in &space.errors {
        diagnostics.error(error.as_str());
    }
    for warning in &space.warnings {
        diagnostics.warn(warning.as_str());
    }
    diagnostics
}

fn empty_slots<T>(n: usize) -> Vec<Option<T>> {
    std::iter::repeat_with(|| None).take(n).collect()
}

/// Full conversion against caller-supplied services. Fails only when the
/// worker pool cannot be started; malformed planes are skipped and reported
/// in the diagnostics.
pub fn convert_trace_space_to_op_stats_with(
    space: &TraceSpace,
    options: &ConvertOptions,
    executor_config: &ExecutorConfig,
    metadata: &dyn ModuleMetadata,
    capabilities: &dyn DeviceCapabilities,
) -> OpStatsResult<OpStats> {
    let options = *options;
    let kind = classify_space(space);
    let planes = device_planes(space, kind);
    let hostname = space.hostname();
    tracing::debug!("converting {} {:?} device planes", planes.len(), kind);

    let mut op_stats = OpStats {
        diagnostics: diagnostics_from(space),
        run_environment: run_environment(space, kind, &planes),
        ..OpStats::default()
    };
    if kind == HardwareKind::Gpu {
        op_stats.core_id_to_details.insert(
            DEFAULT_GPU_LOCAL_CORE_ID,
            CoreDetails {
                hostname: hostname.to_string(),
                ..CoreDetails::default()
            },
        );
    }
    if options.generate_op_metrics_db {
        if let Some(first) = planes.first() {
            op_stats.perf_env = Some(capabilities.perf_env(first));
        }
    }

    let n = planes.len();
    let mut op_slots: Vec<Option<OpStatsResult<OpMetricsDb>>> = empty_slots(n);
    let mut step_slots: Vec<Option<StepEvents>> = empty_slots(n);
    let mut kernel_slots: Vec<Option<KernelReportMap>> = empty_slots(n);
    let mut trace_slots: Vec<Option<DeviceTraceResult>> = empty_slots(n);

    let executor = Executor::new(executor_config)?;
    executor.scope(|s| {
        if options.generate_op_metrics_db {
            for (plane, slot) in planes.iter().zip(op_slots.iter_mut()) {
                s.spawn(move |_| {
                    *slot = Some(convert_device_plane_to_op_metrics_db(plane, metadata));
                });
            }
        }
        if options.generate_step_db {
            for (plane, slot) in planes.iter().zip(step_slots.iter_mut()) {
                s.spawn(move |_| {
                    *slot = Some(convert_device_plane_to_step_events(plane, metadata));
                });
            }
        }
        if options.generate_kernel_stats_db {
            for (plane, slot) in planes.iter().zip(kernel_slots.iter_mut()) {
                s.spawn(move |_| {
                    *slot = Some(convert_device_plane_to_kernel_reports(plane, metadata));
                });
            }
        }
        for (plane, slot) in planes.iter().zip(trace_slots.iter_mut()) {
            s.spawn(move |_| *slot = Some(convert_device_trace(plane, hostname)));
        }
    });

    // Everything below runs on this thread, in plane order.
    {
        let mut combiner = OpMetricsDbCombiner::new(&mut op_stats.device_op_metrics_db);
        for (plane, slot) in planes.iter().zip(op_slots) {
            match slot {
                Some(Ok(db)) => combiner.combine(&db, true),
                Some(Err(err)) => {
                    tracing::error!("skipping op metrics of plane {}: {err}", plane.name);
                    op_stats
                        .diagnostics
                        .error(format!("op metrics of plane {} skipped: {err}", plane.name));
                }
                None => {}
            }
        }
    }

    let mut reducer = StepEventsReducer::new(StepCombinePolicy::for_hardware(kind));
    for step_events in step_slots.iter().flatten() {
        reducer.combine(step_events);
    }
    let mut step_events = reducer.finish();

    let mut kernel_reports = KernelReportMap::new();
    for reports in kernel_slots.iter().flatten() {
        for (key, report) in reports {
            insert_or_update_kernel_report(key, report, &mut kernel_reports);
        }
    }

    let mut duty_cycle = DutyCycleCombiner::new();
    for (plane, slot) in planes.iter().zip(trace_slots) {
        let Some(result) = slot else {
            continue;
        };
        match result.core_details {
            Some(details) => {
                duty_cycle.combine_core(&result.duty_cycle, details.local_chip_id);
                op_stats.core_id_to_details.insert(plane.id, details);
            }
            None => {
                let warning = result.warning.unwrap_or_else(|| {
                    format!("No CoreDetails found for device plane: {}", plane.name)
                });
                // GPU planes do not carry core details.
                if kind.is_tpu_family() {
                    tracing::warn!("{warning}");
                    op_stats.diagnostics.warn(warning);
                }
                duty_cycle.combine_chip(&result.duty_cycle);
            }
        }
    }

    op_stats.run_environment.is_training = metadata.is_training();
    if kind.is_tpu_family() {
        op_stats.device_op_metrics_db.duty_cycle_idle_ps = duty_cycle.total_idle_time_ps();
        op_stats.device_op_metrics_db.duty_cycle_busy_ps = duty_cycle.total_active_time_ps();
    }
    if options.generate_kernel_stats_db {
        op_stats.kernel_stats_db = copy_top_k_duration_kernel_reports_to_db(&kernel_reports);
    }

    let has_device = !planes.is_empty();
    if let Some(host_plane) = space.host_plane() {
        if options.generate_op_metrics_db {
            match convert_host_plane_to_op_metrics_db(host_plane) {
                Ok(db) => op_stats.host_op_metrics_db = db,
                Err(err) => {
                    tracing::error!("skipping host op metrics: {err}");
                    op_stats.diagnostics.error(format!("host op metrics skipped: {err}"));
                }
            }
        }
        if options.generate_step_db && !has_device {
            let host_steps = convert_host_plane_to_step_events(host_plane);
            union_combine_step_events(&host_steps, &mut step_events);
        }
        op_stats.matrix_unit_utilization_percent = host_plane
            .stat(stat::MATRIX_UNIT_UTILIZATION_PERCENT)
            .and_then(StatValue::as_f64);
        for line in &host_plane.lines {
            op_stats
                .tf_function_db
                .combine(&convert_host_line_to_tf_function_db(host_plane, line));
        }
    }

    if options.generate_step_db {
        if kind.is_tpu_family() {
            // Device step lines already exclude partial steps.
            op_stats.step_db = convert_step_events_to_step_db(has_device, false, &step_events);
            op_stats.device_op_metrics_db.precision_stats = compute_precision_stats(&step_events);
            op_stats.hlo_metrics_db_complete_steps_only =
                combine_all(op_stats.step_db.step_sequence.iter().map(|s| &s.hlo_metrics_db), true);
        } else {
            let non_overlapped = to_non_overlapped_step_events(&step_events);
            op_stats.step_db = convert_step_events_to_step_db(
                has_device,
                options.maybe_drop_incomplete_steps,
                &non_overlapped,
            );
            op_stats.device_op_metrics_db.precision_stats =
                compute_precision_stats(&non_overlapped);
        }
    }

    if options.generate_op_metrics_db {
        op_stats.framework_op_metrics_db =
            tf_metrics_db_from_device_db(&op_stats.device_op_metrics_db, true);
    }

    op_stats.program_id_to_name_map = metadata.program_names();
    for module in &space.modules {
        op_stats
            .program_id_to_name_map
            .entry(module.program_id)
            .or_insert_with(|| module.name.clone());
    }
    tracing::debug!(
        "converted: {} device ops, {} host ops, {} steps, {} kernels",
        op_stats.device_op_metrics_db.len(),
        op_stats.host_op_metrics_db.len(),
        op_stats.step_db.len(),
        op_stats.kernel_stats_db.reports.len()
    );
    Ok(op_stats)
}
