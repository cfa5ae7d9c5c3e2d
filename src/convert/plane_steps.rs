//! Plane -> per-step events.

use crate::{
    DERIVED_LINE_NAMES, EventKind, EventTypeSpan, EventView, HardwareKind, ModuleMetadata,
    OpInstance, SPARSE_CORE_INDEX_START, SPARSE_CORE_STEP_LINE_NAME, STEP_LINE_NAME, StatValue,
    StepEvents, StepMarker, StepMarkerKind, TracePlane, XLA_OP_LINE_NAME,
    is_kernel_using_tensor_core, stat,
};

use super::device_op_metrics::{gpu_op_entry, stat_str, xla_op_entry};

const TRACE_CONTEXT_EVENT: &str = "TraceContext";
const FUNCTION_RUN_EVENT: &str = "FunctionRun";

fn group_id(event: &EventView<'_>) -> Option<i64> {
    event.stat(stat::GROUP_ID).and_then(StatValue::as_i64)
}

fn add_markers(plane: &TracePlane, line_name: &str, kind: StepMarkerKind, out: &mut StepEvents) {
    let Some(line) = plane.line_named(line_name) else {
        return;
    };
    for event in plane.events(line) {
        let Some(group_id) = group_id(&event) else {
            continue;
        };
        let details = out.entry(group_id).or_default();
        details.add_marker(StepMarker {
            kind,
            event_name: event.name().to_string(),
            span: event.timespan(),
        });
        if let Some(name) = stat_str(&event, stat::STEP_NAME) {
            details.set_step_name(name);
        }
    }
}

/// Step markers and grouped op instances of one device plane. Events that
/// carry no group id are not attributable to a step and are left out.
pub fn convert_device_plane_to_step_events(
    plane: &TracePlane,
    metadata: &dyn ModuleMetadata,
) -> StepEvents {
    match HardwareKind::of_plane(&plane.name) {
        Some(HardwareKind::Tpu) => tpu_step_events(plane),
        Some(HardwareKind::SparseCore) => sparse_core_step_events(plane),
        Some(HardwareKind::Gpu) => gpu_step_events(plane, metadata),
        _ => StepEvents::new(),
    }
}

fn tpu_step_events(plane: &TracePlane) -> StepEvents {
    let mut out = StepEvents::new();
    add_markers(plane, STEP_LINE_NAME, StepMarkerKind::Device, &mut out);
    if let Some(line) = plane.line_named(XLA_OP_LINE_NAME) {
        for event in plane.events(line) {
            let Some(group_id) = group_id(&event) else {
                continue;
            };
            if let Some(entry) = xla_op_entry(&event, plane) {
                out.entry(group_id).or_default().add_op(
                    plane.id,
                    OpInstance {
                        span: event.timespan(),
                        entry,
                    },
                );
            }
        }
    }
    out
}

/// SparseCore step events double as busy ops; the idle part of each step is
/// carried on the event itself.
fn sparse_core_step_events(plane: &TracePlane) -> StepEvents {
    let mut out = StepEvents::new();
    add_markers(plane, SPARSE_CORE_STEP_LINE_NAME, StepMarkerKind::Device, &mut out);
    let core_id = plane.id.saturating_add(SPARSE_CORE_INDEX_START);
    let Some(line) = plane.line_named(SPARSE_CORE_STEP_LINE_NAME) else {
        return out;
    };
    for event in plane.events(line) {
        let Some(group_id) = group_id(&event) else {
            continue;
        };
        if event.stat(stat::STEP_IDLE_TIME_PS).is_none() {
            continue;
        }
        if let Some(entry) = xla_op_entry(&event, plane) {
            out.entry(group_id).or_default().add_op(
                core_id,
                OpInstance {
                    span: event.timespan(),
                    entry,
                },
            );
        }
    }
    out
}

fn gpu_step_events(plane: &TracePlane, metadata: &dyn ModuleMetadata) -> StepEvents {
    let mut out = StepEvents::new();
    add_markers(plane, STEP_LINE_NAME, StepMarkerKind::Device, &mut out);
    for line in plane.lines.iter().filter(|l| !DERIVED_LINE_NAMES.contains(&l.name.as_str())) {
        for event in plane.events(line) {
            let Some(group_id) = group_id(&event) else {
                continue;
            };
            let details = out.entry(group_id).or_default();
            details.add_event(EventTypeSpan {
                kind: classify_device_event(event.name()),
                span: event.timespan(),
            });
            details.add_op(
                plane.id,
                OpInstance {
                    span: event.timespan(),
                    entry: gpu_op_entry(&event, metadata),
                },
            );
        }
    }
    out
}

/// Buckets a device-side activity by its name.
pub fn classify_device_event(name: &str) -> EventKind {
    let lower = name.to_ascii_lowercase();
    let contains_any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
    if contains_any(&["htod", "memcpy h2d"]) {
        EventKind::HostToDevice
    } else if contains_any(&["dtoh", "memcpy d2h"]) {
        EventKind::DeviceToHost
    } else if contains_any(&["dtod", "memcpy d2d"]) {
        EventKind::DeviceToDevice
    } else if contains_any(&["nccl", "all-reduce", "allreduce", "all-gather", "collective"]) {
        EventKind::DeviceCollectives
    } else if is_kernel_using_tensor_core(name) {
        EventKind::DeviceCompute16
    } else {
        EventKind::DeviceCompute32
    }
}

/// Buckets a host-side activity by its name.
pub fn classify_host_event(name: &str) -> EventKind {
    let lower = name.to_ascii_lowercase();
    if lower.contains("infeed") || lower.contains("iterator") || lower.contains("getnext") {
        EventKind::HostWaitInput
    } else if lower.contains("compile") {
        EventKind::HostCompile
    } else if lower.contains("executorstate::process") || lower.contains("prepare") {
        EventKind::HostPrepare
    } else {
        EventKind::HostCompute
    }
}

/// Host step markers are grouped `TraceContext` events or any grouped event
/// carrying a step number. Other grouped events become host activity.
pub fn convert_host_plane_to_step_events(plane: &TracePlane) -> StepEvents {
    let mut out = StepEvents::new();
    for line in &plane.lines {
        for event in plane.events(line) {
            let Some(group_id) = group_id(&event) else {
                continue;
            };
            let name = event.name();
            if name == FUNCTION_RUN_EVENT {
                continue;
            }
            let details = out.entry(group_id).or_default();
            if name == TRACE_CONTEXT_EVENT || event.stat(stat::STEP_NUM).is_some() {
                details.add_marker(StepMarker {
                    kind: StepMarkerKind::Host,
                    event_name: name.to_string(),
                    span: event.timespan(),
                });
                if let Some(step_name) = stat_str(&event, stat::STEP_NAME) {
                    details.set_step_name(step_name);
                }
            } else {
                details.add_event(EventTypeSpan {
                    kind: classify_host_event(name),
                    span: event.timespan(),
                });
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        EventMetadata, ModuleMap, SPARSE_CORE_BUSY_OP_NAME, Stats, Timespan, TraceEvent, TraceLine,
    };

    use std::collections::BTreeMap;

    fn names(names: &[&str]) -> BTreeMap<u64, EventMetadata> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let id = i as u64 + 1;
                (
                    id,
                    EventMetadata {
                        id,
                        name: name.to_string(),
                        ..EventMetadata::default()
                    },
                )
            })
            .collect()
    }

    fn grouped(
        metadata_id: u64,
        offset_ps: u64,
        duration_ps: u64,
        group_id: i64,
        extra: Stats,
    ) -> TraceEvent {
        let mut stats = extra;
        stats.insert(stat::GROUP_ID.to_string(), StatValue::Int(group_id));
        TraceEvent {
            metadata_id,
            offset_ps,
            duration_ps,
            num_occurrences: None,
            stats,
        }
    }

    fn line(name: &str, events: Vec<TraceEvent>) -> TraceLine {
        TraceLine {
            id: 0,
            name: name.to_string(),
            timestamp_ns: 0,
            events,
        }
    }

    fn xla_ids() -> Stats {
        Stats::from([
            (stat::PROGRAM_ID.to_string(), StatValue::Int(1)),
            (stat::SYMBOL_ID.to_string(), StatValue::Int(1)),
        ])
    }

    #[test]
    fn tpu_plane_yields_markers_and_ops() {
        let plane = TracePlane {
            id: 3,
            name: "/device:TPU:0".to_string(),
            stats: Stats::new(),
            event_metadata: names(&["step", "fusion.1"]),
            lines: vec![
                line(STEP_LINE_NAME, vec![grouped(1, 0, 100, 7, Stats::new())]),
                line(
                    XLA_OP_LINE_NAME,
                    vec![
                        grouped(2, 10, 20, 7, xla_ids()),
                        grouped(2, 40, 20, 7, xla_ids()),
                    ],
                ),
            ],
        };
        let steps = convert_device_plane_to_step_events(&plane, &ModuleMap::default());
        let step = steps.get(&7).expect("step 7");
        assert_eq!(step.step_time(), Timespan::new(0, 100));
        assert_eq!(step.per_core_ops().get(&3).map(Vec::len), Some(2));
    }

    #[test]
    fn sparse_core_steps_use_offset_core_ids() {
        let plane = TracePlane {
            id: 4,
            name: "/device:TPU:0 SparseCore 1".to_string(),
            stats: Stats::new(),
            event_metadata: names(&["sc step"]),
            lines: vec![line(
                SPARSE_CORE_STEP_LINE_NAME,
                vec![grouped(
                    1,
                    0,
                    100,
                    2,
                    Stats::from([(stat::STEP_IDLE_TIME_PS.to_string(), StatValue::Int(30))]),
                )],
            )],
        };
        let steps = convert_device_plane_to_step_events(&plane, &ModuleMap::default());
        let tables = steps.get(&2).expect("step 2").per_core_op_metrics_db();
        let table = tables.get(&(4 + SPARSE_CORE_INDEX_START)).expect("core");
        let busy = table.rows().next().expect("busy row");
        assert_eq!(busy.name, SPARSE_CORE_BUSY_OP_NAME);
        assert_eq!(busy.self_time_ps, 70);
    }

    #[test]
    fn gpu_events_are_classified() {
        let plane = TracePlane {
            id: 5,
            name: "/device:GPU:0".to_string(),
            stats: Stats::new(),
            event_metadata: names(&["MemcpyHtoD", "volta_h884gemm", "ampere_sgemm", "ungrouped"]),
            lines: vec![line(
                "Stream #7",
                vec![
                    grouped(1, 0, 10, 1, Stats::new()),
                    grouped(2, 10, 30, 1, Stats::new()),
                    grouped(3, 40, 20, 1, Stats::new()),
                    TraceEvent {
                        metadata_id: 4,
                        offset_ps: 60,
                        duration_ps: 5,
                        num_occurrences: None,
                        stats: Stats::new(),
                    },
                ],
            )],
        };
        let steps = convert_device_plane_to_step_events(&plane, &ModuleMap::default());
        assert_eq!(steps.len(), 1);
        let step = steps.get(&1).expect("step 1");
        let kinds: Vec<EventKind> = step.events().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EventKind::HostToDevice, EventKind::DeviceCompute16, EventKind::DeviceCompute32]
        );
        assert_eq!(step.precision_stats().compute_16bit_ps, 30);
        assert_eq!(step.step_time(), Timespan::new(0, 60));
    }

    #[test]
    fn host_plane_markers_and_activity() {
        let plane = TracePlane {
            id: 0,
            name: crate::HOST_THREADS_PLANE_NAME.to_string(),
            stats: Stats::new(),
            event_metadata: names(&[TRACE_CONTEXT_EVENT, "IteratorGetNext", FUNCTION_RUN_EVENT]),
            lines: vec![line(
                "python",
                vec![
                    grouped(1, 0, 500, 9, Stats::new()),
                    grouped(2, 0, 50, 9, Stats::new()),
                    grouped(3, 50, 400, 9, Stats::new()),
                ],
            )],
        };
        let steps = convert_host_plane_to_step_events(&plane);
        let step = steps.get(&9).expect("step 9");
        assert_eq!(step.markers().len(), 1);
        assert_eq!(step.markers()[0].kind, StepMarkerKind::Host);
        assert_eq!(step.events().len(), 1);
        assert_eq!(step.events()[0].kind, EventKind::HostWaitInput);
        assert!(!step.has_device_activity());
    }
}
