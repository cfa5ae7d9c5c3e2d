//! Host thread -> framework function call statistics.

use crate::{
    StatValue, TfFunctionDb, Timespan, TraceLine, TracePlane, decode_tf_function_call, stat,
};

struct FunctionCall<'a> {
    name: &'a str,
    raw_mode: &'a str,
    tracing_count: u64,
    span: Timespan,
}

/// Function calls on one host thread. A call's self time excludes calls
/// nested inside it on the same thread. Calls with an unknown mode are
/// skipped.
pub fn convert_host_line_to_tf_function_db(plane: &TracePlane, line: &TraceLine) -> TfFunctionDb {
    let mut calls: Vec<FunctionCall<'_>> = plane
        .events(line)
        .filter_map(|event| {
            let raw_mode = event.stat(stat::TF_FUNCTION_CALL).and_then(StatValue::as_str)?;
            Some(FunctionCall {
                name: event.name(),
                raw_mode,
                tracing_count: event
                    .stat(stat::TF_FUNCTION_TRACING_COUNT)
                    .and_then(StatValue::as_u64)
                    .unwrap_or_default(),
                span: event.timespan(),
            })
        })
        .collect();
    calls.sort_by(|a, b| {
        a.span
            .begin_ps
            .cmp(&b.span.begin_ps)
            .then_with(|| b.span.duration_ps.cmp(&a.span.duration_ps))
    });

    let mut children_ps = vec![0u64; calls.len()];
    let mut stack: Vec<usize> = Vec::new();
    for (i, call) in calls.iter().enumerate() {
        while let Some(&top) = stack.last() {
            if calls[top].span.includes(&call.span) {
                break;
            }
            stack.pop();
        }
        if let Some(&parent) = stack.last() {
            children_ps[parent] = children_ps[parent].saturating_add(call.span.duration_ps);
        }
        stack.push(i);
    }

    let mut db = TfFunctionDb::default();
    for (call, children_time_ps) in calls.iter().zip(children_ps) {
        let Some((mode, compiler)) = decode_tf_function_call(call.raw_mode) else {
            tracing::warn!(
                "skipping call of {:?} on line {:?}: unknown mode {:?}",
                call.name,
                line.name,
                call.raw_mode
            );
            continue;
        };
        db.functions.entry(call.name.to_string()).or_default().record_call(
            mode,
            compiler,
            call.tracing_count,
            call.span.duration_ps.saturating_sub(children_time_ps),
        );
    }
    db
}
