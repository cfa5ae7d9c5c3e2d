//! Ordered step sequence derived from combined step events.

use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;

use crate::{EventKind, OpMetricsDb, StepEvents, combine_all};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepInfo {
    pub step_num: i64,
    #[serde(default)]
    pub step_name: String,
    pub begin_ps: u64,
    pub duration_ps: u64,
    /// Time per event kind, clipped to the step span.
    pub breakdown_ps: BTreeMap<EventKind, u64>,
    pub core_ids: Vec<u32>,
    pub hlo_metrics_db: OpMetricsDb,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepDatabase {
    pub step_sequence: Vec<StepInfo>,
    pub num_steps_dropped: u32,
}

impl StepDatabase {
    pub fn is_empty(&self) -> bool {
        self.step_sequence.is_empty()
    }

    pub fn len(&self) -> usize {
        self.step_sequence.len()
    }
}

/// Builds the step sequence ordered by start time, then step number. Steps
/// with an empty span are skipped. When `has_device` is set, steps without any
/// device activity are skipped too.
pub fn convert_step_events_to_step_db(
    has_device: bool,
    maybe_drop_incomplete_steps: bool,
    step_events: &StepEvents,
) -> StepDatabase {
    let mut steps = Vec::with_capacity(step_events.len());
    for (group_id, details) in step_events {
        let span = details.step_time();
        if span.is_empty() {
            tracing::debug!("skipping step {group_id} with empty span");
            continue;
        }
        if has_device && !details.has_device_activity() {
            continue;
        }
        let mut breakdown_ps: BTreeMap<EventKind, u64> = BTreeMap::new();
        for event in details.events() {
            let clipped = event.span.intersection(&span);
            if clipped.is_empty() {
                continue;
            }
            let slot = breakdown_ps.entry(event.kind).or_default();
            *slot = slot.saturating_add(clipped.duration_ps);
        }
        let per_core = details.per_core_op_metrics_db();
        let hlo_metrics_db = combine_all(per_core.values(), true);
        steps.push(StepInfo {
            step_num: *group_id,
            step_name: details.step_name().unwrap_or_default().to_string(),
            begin_ps: span.begin_ps,
            duration_ps: span.duration_ps,
            breakdown_ps,
            core_ids: per_core.keys().copied().collect(),
            hlo_metrics_db,
        });
    }
    steps.sort_by(|a, b| {
        a.begin_ps
            .cmp(&b.begin_ps)
            .then_with(|| a.step_num.cmp(&b.step_num))
    });

    let before = steps.len();
    if maybe_drop_incomplete_steps {
        drop_incomplete_boundary_steps(&mut steps);
    }
    let dropped = before - steps.len();
    StepDatabase {
        step_sequence: steps,
        num_steps_dropped: u32::try_from(dropped).unwrap_or(u32::MAX),
    }
}

/// A first or last step shorter than half the median interior step is taken
/// to be cut off by the capture window. Needs at least three steps.
fn drop_incomplete_boundary_steps(steps: &mut Vec<StepInfo>) {
    if steps.len() < 3 {
        return;
    }
    let mut interior: Vec<u64> = steps[1..steps.len() - 1]
        .iter()
        .map(|s| s.duration_ps)
        .collect();
    interior.sort_unstable();
    let median = interior[interior.len() / 2];
    let threshold = median / 2;
    if steps.last().is_some_and(|s| s.duration_ps < threshold) {
        if let Some(step) = steps.pop() {
            tracing::debug!("dropping incomplete last step {}", step.step_num);
        }
    }
    if steps.first().is_some_and(|s| s.duration_ps < threshold) {
        let step = steps.remove(0);
        tracing::debug!("dropping incomplete first step {}", step.step_num);
    }
}
