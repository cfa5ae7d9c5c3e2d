//! Device plane -> op metrics table.

use crate::{
    DERIVED_LINE_NAMES, EventView, HardwareKind, MemoryAccessed, ModuleMetadata, OpEntry, OpKey,
    OpMetricsDb, OpMetricsDbBuilder, OpRates, OpStatsError, OpStatsResult,
    SPARSE_CORE_BUSY_OP_NAME, SourceInfo, StatValue, Timespan, TracePlane, XLA_OP_LINE_NAME,
    parse_tf_op_fullname, stat,
};

/// Rows built from SparseCore step events use this module id.
pub const SPARSE_CORE_BUSY_MODULE_ID: u64 = u64::MAX;

pub(crate) fn stat_u64(event: &EventView<'_>, name: &str) -> Option<u64> {
    event.stat(name).and_then(StatValue::as_u64)
}

pub(crate) fn stat_str<'a>(event: &EventView<'a>, name: &str) -> Option<&'a str> {
    event.stat(name).and_then(StatValue::as_str)
}

/// Builds the entry for one XLA op event. `Ok(None)` for events that are not
/// attributable to a program and symbol; `Err` when the event claims more
/// self time than its duration.
fn try_xla_op_entry(event: &EventView<'_>) -> OpStatsResult<Option<OpEntry>> {
    if let Some(idle_ps) = stat_u64(event, stat::STEP_IDLE_TIME_PS) {
        let mut entry = OpEntry::new(
            OpKey::new(SPARSE_CORE_BUSY_MODULE_ID, SPARSE_CORE_BUSY_OP_NAME),
            event.duration_ps(),
        );
        entry.category = Some(SPARSE_CORE_BUSY_OP_NAME.to_string());
        entry.children_time_ps = idle_ps;
        return Ok(Some(entry));
    }

    let (Some(program_id), Some(_symbol_id)) = (
        stat_u64(event, stat::PROGRAM_ID),
        stat_u64(event, stat::SYMBOL_ID),
    ) else {
        tracing::debug!("op {:?} has no program/symbol id", event.name());
        return Ok(None);
    };

    let time_ps = event.duration_ps();
    let self_time_ps = stat_u64(event, stat::SELF_DURATION_PS).unwrap_or(time_ps);
    let children_time_ps = time_ps.checked_sub(self_time_ps).ok_or_else(|| {
        OpStatsError::InvariantViolation(format!(
            "self time {self_time_ps} ps of op {:?} (module {program_id}) \
             exceeds its duration {time_ps} ps",
            event.display_name()
        ))
    })?;
    let mut entry = OpEntry::new(OpKey::new(program_id, event.display_name()), time_ps);
    entry.long_name = Some(event.name().to_string());
    entry.occurrences = event.num_occurrences();
    entry.children_time_ps = children_time_ps;
    entry.min_time_ps = stat_u64(event, stat::MIN_DURATION_PS);
    entry.dma_stall_ps = stat_u64(event, stat::DMA_STALL_DURATION_PS).unwrap_or_default();
    entry.category = stat_str(event, stat::HLO_CATEGORY).map(str::to_string);
    entry.provenance = stat_str(event, stat::TF_OP).map(str::to_string);
    entry.deduplicated_name = stat_str(event, stat::DEDUPLICATED_NAME).map(str::to_string);
    entry.is_eager = event
        .stat(stat::IS_EAGER)
        .and_then(StatValue::as_bool)
        .unwrap_or_default();
    entry.source_info = source_info(event);
    entry.rates = OpRates {
        flops: stat_u64(event, stat::FLOPS).unwrap_or_default(),
        model_flops: stat_u64(event, stat::MODEL_FLOPS).unwrap_or_default(),
        bytes_accessed: stat_u64(event, stat::BYTES_ACCESSED).unwrap_or_default(),
        memory_accessed: memory_accessed(event),
    };
    Ok(Some(entry))
}

/// Like `try_xla_op_entry`, logging and skipping malformed events.
pub(crate) fn xla_op_entry(event: &EventView<'_>, plane: &TracePlane) -> Option<OpEntry> {
    match try_xla_op_entry(event) {
        Ok(entry) => entry,
        Err(err) => {
            tracing::error!("skipping event on plane {}: {err}", plane.name);
            None
        }
    }
}

fn source_info(event: &EventView<'_>) -> Option<SourceInfo> {
    let raw = stat_str(event, stat::SOURCE_INFO)?;
    match SourceInfo::parse(raw) {
        Ok(mut info) => {
            if let Some(stack) = stat_str(event, stat::SOURCE_STACK) {
                info.stack_frame = stack.to_string();
            }
            Some(info)
        }
        Err(err) => {
            tracing::warn!("ignoring source info on {:?}: {err}", event.name());
            None
        }
    }
}

fn memory_accessed(event: &EventView<'_>) -> Vec<MemoryAccessed> {
    let Some(raw) = stat_str(event, stat::MEMORY_ACCESS_BREAKDOWN) else {
        return Vec::new();
    };
    match serde_json::from_str::<Vec<MemoryAccessed>>(raw) {
        Ok(breakdown) => breakdown,
        Err(err) => {
            tracing::warn!("ignoring memory access breakdown on {:?}: {err}", event.name());
            Vec::new()
        }
    }
}

/// Converts one device plane. SparseCore planes yield an empty table. Fails
/// only when the plane's ops claim more time than the plane spans.
pub fn convert_device_plane_to_op_metrics_db(
    plane: &TracePlane,
    metadata: &dyn ModuleMetadata,
) -> OpStatsResult<OpMetricsDb> {
    match HardwareKind::of_plane(&plane.name) {
        Some(HardwareKind::Tpu) => convert_tpu_plane(plane, metadata),
        Some(HardwareKind::Gpu) => convert_gpu_plane(plane, metadata),
        _ => {
            tracing::debug!("no op metrics for plane {}", plane.name);
            Ok(OpMetricsDb::default())
        }
    }
}

fn enter_or_log(builder: &mut OpMetricsDbBuilder, entry: &OpEntry, plane: &TracePlane) {
    if let Err(err) = builder.enter_op(entry) {
        tracing::error!(
            "skipping op {:?} (module {}) on plane {}: {err}",
            entry.key.name,
            entry.key.module_id,
            plane.name
        );
    }
}

fn convert_tpu_plane(
    plane: &TracePlane,
    metadata: &dyn ModuleMetadata,
) -> OpStatsResult<OpMetricsDb> {
    let mut builder = OpMetricsDbBuilder::new();
    let mut span: Option<Timespan> = None;
    if let Some(line) = plane.line_named(XLA_OP_LINE_NAME) {
        for event in plane.events(line) {
            let event_span = event.timespan();
            span = Some(span.map_or(event_span, |s| s.hull(&event_span)));
            if let Some(entry) = xla_op_entry(&event, plane) {
                enter_or_log(&mut builder, &entry, plane);
            }
        }
    }
    finalize_plane(builder, span.map(|s| s.duration_ps), metadata)
}

/// Streams run concurrently, so elapsed time is the sum of each stream's
/// span rather than the span of the whole plane.
fn convert_gpu_plane(
    plane: &TracePlane,
    metadata: &dyn ModuleMetadata,
) -> OpStatsResult<OpMetricsDb> {
    let mut builder = OpMetricsDbBuilder::new();
    let mut total_time_ps: Option<u64> = None;
    let streams = plane
        .lines
        .iter()
        .filter(|l| !DERIVED_LINE_NAMES.contains(&l.name.as_str()));
    for line in streams {
        let mut line_span: Option<Timespan> = None;
        for event in plane.events(line) {
            let event_span = event.timespan();
            line_span = Some(line_span.map_or(event_span, |s| s.hull(&event_span)));
            let entry = gpu_op_entry(&event, metadata);
            enter_or_log(&mut builder, &entry, plane);
        }
        if let Some(line_span) = line_span {
            total_time_ps = Some(
                total_time_ps
                    .unwrap_or_default()
                    .saturating_add(line_span.duration_ps),
            );
        }
    }
    finalize_plane(builder, total_time_ps, metadata)
}

/// A plane without events yields an empty table rather than a lone idle row.
fn finalize_plane(
    mut builder: OpMetricsDbBuilder,
    total_time_ps: Option<u64>,
    metadata: &dyn ModuleMetadata,
) -> OpStatsResult<OpMetricsDb> {
    let Some(total_time_ps) = total_time_ps else {
        return Ok(builder.finalize());
    };
    builder.enter_metadata_from(metadata);
    builder.finalize_with_total_time(total_time_ps)
}

/// Last of the comma-separated HLO op names on a kernel event.
pub(crate) fn hlo_op_name<'a>(event: &EventView<'a>) -> Option<&'a str> {
    stat_str(event, stat::HLO_OP)
        .and_then(|names| names.rsplit(',').next())
        .map(str::trim)
        .filter(|name| !name.is_empty())
}

/// Kernels launched for an XLA op are keyed by `(program id, hlo op)`; other
/// kernels by their framework op name, or the kernel name.
pub(crate) fn gpu_op_entry(event: &EventView<'_>, metadata: &dyn ModuleMetadata) -> OpEntry {
    let time_ps = event.duration_ps();
    if let (Some(program_id), Some(hlo_op)) =
        (stat_u64(event, stat::PROGRAM_ID), hlo_op_name(event))
    {
        let mut entry = OpEntry::new(OpKey::new(program_id, hlo_op), time_ps);
        entry.occurrences = event.num_occurrences();
        entry.category = stat_str(event, stat::HLO_CATEGORY).map(str::to_string);
        entry.provenance = stat_str(event, stat::TF_OP).map(str::to_string);
        if let Some(instr) = metadata.instruction(program_id, hlo_op) {
            entry.rates = OpRates::from_instruction(instr);
            entry.source_info = instr.source_info.clone();
            if !instr.deduplicated_name.is_empty() {
                entry.deduplicated_name = Some(instr.deduplicated_name.clone());
            }
        }
        return entry;
    }

    let tf_op = stat_str(event, stat::TF_OP).unwrap_or_else(|| event.name());
    let (name, op_type) = parse_tf_op_fullname(tf_op);
    let mut entry = OpEntry::new(OpKey::new(0, name), time_ps);
    entry.occurrences = event.num_occurrences();
    entry.category = Some(op_type.to_string());
    entry.provenance = Some(tf_op.to_string());
    entry.is_eager = event
        .stat(stat::IS_EAGER)
        .and_then(StatValue::as_bool)
        .unwrap_or_default();
    entry
}
