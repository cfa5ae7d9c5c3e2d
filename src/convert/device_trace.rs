//! Device plane -> duty cycle and core identity.

use crate::{
    CoreDetails, DutyCycleTracker, OpStatsError, OpStatsResult, SPARSE_CORE_MODULE_LINE_NAME,
    SPARSE_CORE_OP_LINE_NAME, StatValue, TracePlane, XLA_MODULE_LINE_NAME, XLA_OP_LINE_NAME,
    is_off_duty_category, sparse_core_id, stat,
};

/// XLA ops are active unless their category is off-duty; SparseCore ops are
/// always active. Module spans only extend the tracked range.
pub fn construct_duty_cycle_tracker(plane: &TracePlane) -> DutyCycleTracker {
    let mut tracker = DutyCycleTracker::new();
    for line in &plane.lines {
        match line.name.as_str() {
            XLA_OP_LINE_NAME => {
                for event in plane.events(line) {
                    let off_duty = event
                        .stat(stat::HLO_CATEGORY)
                        .and_then(StatValue::as_str)
                        .is_some_and(is_off_duty_category);
                    tracker.add_interval(event.timespan(), !off_duty);
                }
            }
            SPARSE_CORE_OP_LINE_NAME => {
                for event in plane.events(line) {
                    tracker.add_interval(event.timespan(), true);
                }
            }
            XLA_MODULE_LINE_NAME | SPARSE_CORE_MODULE_LINE_NAME => {
                for event in plane.events(line) {
                    tracker.add_interval(event.timespan(), false);
                }
            }
            _ => {}
        }
    }
    tracker
}

/// Parses the plane's `core_details` blob. `Ok(None)` when the plane carries
/// none; `Err` when it carries one that does not parse.
pub fn parse_core_details(
    plane: &TracePlane,
    hostname: &str,
) -> OpStatsResult<Option<CoreDetails>> {
    let Some(value) = plane.stat(stat::CORE_DETAILS) else {
        return Ok(None);
    };
    let raw = value.as_str().ok_or_else(|| {
        OpStatsError::Trace(format!("core_details on plane {} is not a string", plane.name))
    })?;
    let mut details: CoreDetails = serde_json::from_str(raw).map_err(|err| {
        OpStatsError::Trace(format!("invalid core_details on plane {}: {err}", plane.name))
    })?;
    details.hostname = hostname.to_string();
    details.is_sparse_core = sparse_core_id(&plane.name).is_some();
    Ok(Some(details))
}

/// Per-plane output of the duty-cycle task.
#[derive(Debug, Clone, Default)]
pub struct DeviceTraceResult {
    pub duty_cycle: DutyCycleTracker,
    pub core_details: Option<CoreDetails>,
    /// Why `core_details` is missing, when it is.
    pub warning: Option<String>,
}

pub fn convert_device_trace(plane: &TracePlane, hostname: &str) -> DeviceTraceResult {
    let duty_cycle = construct_duty_cycle_tracker(plane);
    match parse_core_details(plane, hostname) {
        Ok(Some(core_details)) => DeviceTraceResult {
            duty_cycle,
            core_details: Some(core_details),
            warning: None,
        },
        Ok(None) => DeviceTraceResult {
            duty_cycle,
            core_details: None,
            warning: Some(format!("No CoreDetails found for device plane: {}", plane.name)),
        },
        Err(err) => DeviceTraceResult {
            duty_cycle,
            core_details: None,
            warning: Some(err.to_string()),
        },
    }
}
