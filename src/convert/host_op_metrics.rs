//! Host plane -> host op metrics table.

use crate::{
    OpMetricsDb, OpMetricsDbBuilder, OpStatsResult, StatValue, Timespan, TracePlane,
    UNKNOWN_OP_TYPE, parse_tf_op_fullname, stat,
};

struct HostOp<'a> {
    name: &'a str,
    op_type: &'a str,
    is_eager: bool,
    span: Timespan,
}

fn is_infeed_enqueue(op_type: &str) -> bool {
    op_type.starts_with("InfeedEnqueue")
}

/// Framework ops (`name:Type` events) on every host thread. Children time is
/// the time of ops nested directly inside an op on the same thread. Elapsed
/// time is the sum of each thread's span.
pub fn convert_host_plane_to_op_metrics_db(plane: &TracePlane) -> OpStatsResult<OpMetricsDb> {
    let mut builder = OpMetricsDbBuilder::new();
    let mut infeed_spans = Vec::new();
    let mut total_time_ps = 0u64;

    for line in &plane.lines {
        let mut line_span: Option<Timespan> = None;
        let mut ops: Vec<HostOp<'_>> = Vec::new();
        for event in plane.events(line) {
            let span = event.timespan();
            line_span = Some(line_span.map_or(span, |s| s.hull(&span)));
            let (name, op_type) = parse_tf_op_fullname(event.name());
            if op_type == UNKNOWN_OP_TYPE {
                continue;
            }
            ops.push(HostOp {
                name,
                op_type,
                is_eager: event
                    .stat(stat::IS_EAGER)
                    .and_then(StatValue::as_bool)
                    .unwrap_or_default(),
                span,
            });
        }
        total_time_ps = total_time_ps.saturating_add(line_span.unwrap_or_default().duration_ps);

        // Outer ops first when two start together.
        ops.sort_by(|a, b| {
            a.span
                .begin_ps
                .cmp(&b.span.begin_ps)
                .then_with(|| b.span.duration_ps.cmp(&a.span.duration_ps))
        });
        let mut children_ps = vec![0u64; ops.len()];
        let mut stack: Vec<usize> = Vec::new();
        for (i, op) in ops.iter().enumerate() {
            while let Some(&top) = stack.last() {
                if ops[top].span.includes(&op.span) {
                    break;
                }
                stack.pop();
            }
            if let Some(&parent) = stack.last() {
                children_ps[parent] = children_ps[parent].saturating_add(op.span.duration_ps);
            }
            stack.push(i);
        }

        for (op, children_time_ps) in ops.iter().zip(children_ps) {
            if is_infeed_enqueue(op.op_type) {
                infeed_spans.push(op.span);
            }
            if let Err(err) = builder.enter_host_op(
                op.name,
                op.op_type,
                op.is_eager,
                op.span.duration_ps,
                children_time_ps,
            ) {
                tracing::error!("skipping host op {:?} on line {:?}: {err}", op.name, line.name);
            }
        }
    }

    infeed_spans.sort();
    for span in infeed_spans {
        builder.enter_host_infeed_enqueue(span);
    }
    if total_time_ps == 0 {
        return Ok(builder.finalize());
    }
    builder.finalize_with_total_time(total_time_ps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventMetadata, HOST_MODULE_ID, IDLE_OP_NAME, Stats, TraceEvent, TraceLine};

    use std::collections::BTreeMap;

    fn plane(events: &[(&str, u64, u64)]) -> TracePlane {
        let mut event_metadata = BTreeMap::new();
        let mut line_events = Vec::new();
        for (i, (name, offset_ps, duration_ps)) in events.iter().enumerate() {
            let id = i as u64 + 1;
            event_metadata.insert(
                id,
                EventMetadata {
                    id,
                    name: name.to_string(),
                    ..EventMetadata::default()
                },
            );
            line_events.push(TraceEvent {
                metadata_id: id,
                offset_ps: *offset_ps,
                duration_ps: *duration_ps,
                num_occurrences: None,
                stats: Stats::new(),
            });
        }
        TracePlane {
            id: 0,
            name: crate::HOST_THREADS_PLANE_NAME.to_string(),
            stats: Stats::new(),
            event_metadata,
            lines: vec![TraceLine {
                id: 1,
                name: "tf_executor".to_string(),
                timestamp_ns: 0,
                events: line_events,
            }],
        }
    }

    #[test]
    fn nested_ops_get_children_time() {
        let plane = plane(&[
            ("TraceContext", 0, 200),
            ("while:While", 10, 100),
            ("dense/MatMul:MatMul", 20, 30),
            ("dense/BiasAdd:BiasAdd", 60, 10),
        ]);
        let db = convert_host_plane_to_op_metrics_db(&plane).expect("convert");
        let outer = db.find(HOST_MODULE_ID, "while").expect("while");
        assert_eq!(outer.self_time_ps, 60);
        assert_eq!(outer.category_str(), "While");
        assert_eq!(db.find(HOST_MODULE_ID, "dense/MatMul").expect("matmul").self_time_ps, 30);
        assert_eq!(db.total_time_ps, 200);
        assert_eq!(db.total_op_time_ps, 100);
        assert_eq!(db.find(HOST_MODULE_ID, IDLE_OP_NAME).expect("idle").time_ps, 100);
    }

    #[test]
    fn infeed_enqueues_feed_the_ratio() {
        let plane = plane(&[
            ("infeed:InfeedEnqueueTuple", 0, 10),
            ("infeed:InfeedEnqueueTuple", 100, 10),
        ]);
        let db = convert_host_plane_to_op_metrics_db(&plane).expect("convert");
        assert_eq!(db.host_infeed_enqueue_ratio(), Some(0.1));
    }

    #[test]
    fn empty_host_plane_is_empty() {
        let db = convert_host_plane_to_op_metrics_db(&plane(&[])).expect("convert");
        assert!(db.is_empty());
    }
}
