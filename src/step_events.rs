//! Per-step views of a run and the policies that reconcile several devices'
//! views of the same step.

use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;

use crate::{HardwareKind, OpEntry, OpMetricsDb, OpMetricsDbBuilder, PrecisionStats, Timespan};

/// Per-core tables of SparseCore planes are keyed by plane id plus this offset.
pub const SPARSE_CORE_INDEX_START: u32 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepMarkerKind {
    Device,
    Host,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMarker {
    pub kind: StepMarkerKind,
    pub event_name: String,
    pub span: Timespan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Unknown,
    HostCompute,
    HostCompile,
    HostPrepare,
    HostWaitInput,
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
    DeviceCollectives,
    DeviceCompute32,
    DeviceCompute16,
}

impl EventKind {
    pub fn is_device_compute(self) -> bool {
        matches!(self, Self::DeviceCompute16 | Self::DeviceCompute32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTypeSpan {
    pub kind: EventKind,
    pub span: Timespan,
}

/// One executed operation, kept unaggregated until the step table is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpInstance {
    pub span: Timespan,
    pub entry: OpEntry,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepDetails {
    markers: Vec<StepMarker>,
    events: Vec<EventTypeSpan>,
    per_core_ops: BTreeMap<u32, Vec<OpInstance>>,
    step_time: Option<Timespan>,
    step_name: Option<String>,
}

impl StepDetails {
    pub fn markers(&self) -> &[StepMarker] {
        &self.markers
    }

    pub fn events(&self) -> &[EventTypeSpan] {
        &self.events
    }

    pub fn per_core_ops(&self) -> &BTreeMap<u32, Vec<OpInstance>> {
        &self.per_core_ops
    }

    pub fn step_name(&self) -> Option<&str> {
        self.step_name.as_deref()
    }

    pub fn add_marker(&mut self, marker: StepMarker) {
        self.markers.push(marker);
    }

    pub fn add_event(&mut self, event: EventTypeSpan) {
        self.events.push(event);
    }

    pub fn add_op(&mut self, core_id: u32, op: OpInstance) {
        self.per_core_ops.entry(core_id).or_default().push(op);
    }

    pub fn set_step_name(&mut self, name: &str) {
        if self.step_name.is_none() {
            self.step_name = Some(name.to_string());
        }
    }

    pub fn set_step_time(&mut self, span: Timespan) {
        self.step_time = Some(span);
    }

    /// An explicitly assigned span wins. Otherwise the longest device marker
    /// is used unless the longest host marker contains it; without markers the
    /// step covers its events and ops.
    pub fn step_time(&self) -> Timespan {
        if let Some(span) = self.step_time {
            return span;
        }
        let longest = |kind: StepMarkerKind| {
            self.markers
                .iter()
                .filter(|m| m.kind == kind)
                .map(|m| m.span)
                .fold(None::<Timespan>, |acc, span| match acc {
                    Some(best) if best.duration_ps >= span.duration_ps => Some(best),
                    _ => Some(span),
                })
        };
        match (longest(StepMarkerKind::Device), longest(StepMarkerKind::Host)) {
            (Some(device), Some(host)) if host.includes(&device) => host,
            (Some(device), _) => device,
            (None, Some(host)) => host,
            (None, None) => self.activity_hull().unwrap_or_default(),
        }
    }

    fn activity_hull(&self) -> Option<Timespan> {
        self.events
            .iter()
            .map(|e| e.span)
            .chain(self.per_core_ops.values().flatten().map(|op| op.span))
            .reduce(|acc, span| acc.hull(&span))
    }

    pub fn has_device_activity(&self) -> bool {
        self.markers.iter().any(|m| m.kind == StepMarkerKind::Device)
            || !self.per_core_ops.is_empty()
            || self.events.iter().any(|e| {
                !matches!(
                    e.kind,
                    EventKind::HostCompute
                        | EventKind::HostCompile
                        | EventKind::HostPrepare
                        | EventKind::HostWaitInput
                )
            })
    }

    /// Appends everything `other` observed. The assigned span, if any, becomes
    /// the hull of both.
    pub fn combine(&mut self, other: &StepDetails) {
        self.markers.extend(other.markers.iter().cloned());
        self.events.extend(other.events.iter().copied());
        for (core_id, ops) in &other.per_core_ops {
            self.per_core_ops
                .entry(*core_id)
                .or_default()
                .extend(ops.iter().cloned());
        }
        self.step_time = match (self.step_time, other.step_time) {
            (Some(a), Some(b)) => Some(a.hull(&b)),
            (a, b) => a.or(b),
        };
        if let Some(name) = &other.step_name {
            self.set_step_name(name);
        }
    }

    /// Aggregates each core's instances into a finalized table.
    pub fn per_core_op_metrics_db(&self) -> BTreeMap<u32, OpMetricsDb> {
        let mut out = BTreeMap::new();
        for (core_id, ops) in &self.per_core_ops {
            let mut builder = OpMetricsDbBuilder::new();
            for op in ops {
                if let Err(err) = builder.enter_op(&op.entry) {
                    tracing::error!("skipping op on core {core_id}: {err}");
                }
            }
            out.insert(*core_id, builder.finalize());
        }
        out
    }

    /// Sum of device compute time by precision.
    pub fn precision_stats(&self) -> PrecisionStats {
        let mut out = PrecisionStats::default();
        for event in &self.events {
            match event.kind {
                EventKind::DeviceCompute16 => {
                    out.compute_16bit_ps =
                        out.compute_16bit_ps.saturating_add(event.span.duration_ps)
                }
                EventKind::DeviceCompute32 => {
                    out.compute_32bit_ps =
                        out.compute_32bit_ps.saturating_add(event.span.duration_ps)
                }
                _ => {}
            }
        }
        out
    }
}

/// Steps keyed by group id.
pub type StepEvents = BTreeMap<i64, StepDetails>;

/// Cross-device reconciliation policy, fixed by the hardware kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepCombinePolicy {
    Union,
    Intersection,
}

impl StepCombinePolicy {
    pub fn for_hardware(kind: HardwareKind) -> Self {
        if kind.is_tpu_family() {
            Self::Intersection
        } else {
            Self::Union
        }
    }
}

/// Adds every step of `src` to `dst`, merging steps present in both.
pub fn union_combine_step_events(src: &StepEvents, dst: &mut StepEvents) {
    for (group_id, details) in src {
        dst.entry(*group_id).or_default().combine(details);
    }
}

/// Keeps only steps present in both `src` and `dst`; a kept step's span is
/// the overlap of both views. `dst` must already hold at least one input.
pub fn intersect_combine_step_events(src: &StepEvents, dst: &mut StepEvents) {
    dst.retain(|group_id, _| src.contains_key(group_id));
    for (group_id, details) in dst.iter_mut() {
        let Some(other) = src.get(group_id) else {
            continue;
        };
        let span = details.step_time().intersection(&other.step_time());
        details.combine(other);
        details.set_step_time(span);
    }
}

/// Folds per-device step views in call order under one policy.
#[derive(Debug, Clone)]
pub struct StepEventsReducer {
    policy: StepCombinePolicy,
    acc: Option<StepEvents>,
}

impl StepEventsReducer {
    pub fn new(policy: StepCombinePolicy) -> Self {
        Self { policy, acc: None }
    }

    pub fn combine(&mut self, src: &StepEvents) {
        if self.acc.is_none() {
            self.acc = Some(src.clone());
            return;
        }
        if let Some(dst) = self.acc.as_mut() {
            match self.policy {
                StepCombinePolicy::Union => union_combine_step_events(src, dst),
                StepCombinePolicy::Intersection => intersect_combine_step_events(src, dst),
            }
        }
    }

    pub fn finish(self) -> StepEvents {
        self.acc.unwrap_or_default()
    }
}

/// Removes temporal overlap between steps. Steps are visited by start time,
/// then group id; a step starting before an earlier step ends is clipped to
/// start at that end, and its events and ops that start before the new start
/// are dropped.
pub fn to_non_overlapped_step_events(step_events: &StepEvents) -> StepEvents {
    let mut order: Vec<(Timespan, i64)> = step_events
        .iter()
        .map(|(group_id, details)| (details.step_time(), *group_id))
        .collect();
    order.sort_by(|a, b| {
        a.0.begin_ps
            .cmp(&b.0.begin_ps)
            .then_with(|| a.1.cmp(&b.1))
    });

    let mut out = StepEvents::new();
    let mut prev_end: Option<u64> = None;
    for (span, group_id) in order {
        let Some(details) = step_events.get(&group_id) else {
            continue;
        };
        let mut clipped = details.clone();
        let begin = match prev_end {
            Some(end) if span.begin_ps < end => end.min(span.end_ps()),
            _ => span.begin_ps,
        };
        if begin != span.begin_ps {
            let new_span = Timespan::from_end_points(begin, span.end_ps());
            clipped.events.retain(|e| e.span.begin_ps >= begin);
            for ops in clipped.per_core_ops.values_mut() {
                ops.retain(|op| op.span.begin_ps >= begin);
            }
            clipped.per_core_ops.retain(|_, ops| !ops.is_empty());
            clipped.set_step_time(new_span);
        } else {
            clipped.set_step_time(span);
        }
        prev_end = Some(prev_end.map_or(span.end_ps(), |end| end.max(span.end_ps())));
        out.insert(group_id, clipped);
    }
    out
}

pub fn compute_precision_stats(step_events: &StepEvents) -> PrecisionStats {
    let mut out = PrecisionStats::default();
    for details in step_events.values() {
        let stats = details.precision_stats();
        out.compute_16bit_ps = out.compute_16bit_ps.saturating_add(stats.compute_16bit_ps);
        out.compute_32bit_ps = out.compute_32bit_ps.saturating_add(stats.compute_32bit_ps);
    }
    out
}
