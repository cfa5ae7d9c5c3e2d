//! Capture model: planes of lines of timestamped events, read from JSON.

use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;
use std::path::Path;

use crate::{HOST_THREADS_PLANE_NAME, ModuleInfo, OpStatsResult, Timespan};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatValue {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Double(f64),
    Str(String),
}

impl StatValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Int(v) => u64::try_from(*v).ok(),
            Self::Uint(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Uint(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Uint(v) => Some(*v as f64),
            Self::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            Self::Int(v) => Some(*v != 0),
            Self::Uint(v) => Some(*v != 0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

pub type Stats = BTreeMap<String, StatValue>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceSpace {
    #[serde(default)]
    pub hostnames: Vec<String>,
    #[serde(default)]
    pub planes: Vec<TracePlane>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Compiled module catalog embedded by the capture agent.
    #[serde(default)]
    pub modules: Vec<ModuleInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TracePlane {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub stats: Stats,
    #[serde(default)]
    pub event_metadata: BTreeMap<u64, EventMetadata>,
    #[serde(default)]
    pub lines: Vec<TraceLine>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceLine {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub timestamp_ns: u64,
    #[serde(default)]
    pub events: Vec<TraceEvent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceEvent {
    pub metadata_id: u64,
    pub offset_ps: u64,
    pub duration_ps: u64,
    #[serde(default)]
    pub num_occurrences: Option<u64>,
    #[serde(default)]
    pub stats: Stats,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventMetadata {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub stats: Stats,
    #[serde(default)]
    pub child_ids: Vec<u64>,
}

impl TraceSpace {
    pub fn read_json(path: &Path) -> OpStatsResult<Self> {
        let bytes = std::fs::read(path)?;
        let space: TraceSpace = serde_json::from_slice(&bytes)?;
        Ok(space)
    }

    pub fn write_json(&self, path: &Path) -> OpStatsResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Only single-host captures are supported.
    pub fn hostname(&self) -> &str {
        self.hostnames.first().map(String::as_str).unwrap_or("localhost")
    }

    pub fn planes_with_prefix(&self, prefix: &str) -> Vec<&TracePlane> {
        self.planes
            .iter()
            .filter(|p| p.name.starts_with(prefix))
            .collect()
    }

    pub fn plane_named(&self, name: &str) -> Option<&TracePlane> {
        self.planes.iter().find(|p| p.name == name)
    }

    pub fn host_plane(&self) -> Option<&TracePlane> {
        self.plane_named(HOST_THREADS_PLANE_NAME)
    }
}

impl TracePlane {
    pub fn stat(&self, name: &str) -> Option<&StatValue> {
        self.stats.get(name)
    }

    pub fn line_named(&self, name: &str) -> Option<&TraceLine> {
        self.lines.iter().find(|l| l.name == name)
    }

    pub fn events<'a>(&'a self, line: &'a TraceLine) -> impl Iterator<Item = EventView<'a>> + 'a {
        line.events.iter().map(move |event| EventView {
            plane: self,
            line,
            event,
        })
    }

    /// Span from the earliest event begin to the latest event end on the plane.
    pub fn span(&self) -> Timespan {
        let mut out: Option<Timespan> = None;
        for line in &self.lines {
            for event in self.events(line) {
                let span = event.timespan();
                out = Some(match out {
                    Some(acc) => acc.hull(&span),
                    None => span,
                });
            }
        }
        out.unwrap_or_default()
    }
}

/// An event resolved against its line timestamp and plane metadata.
#[derive(Debug, Clone, Copy)]
pub struct EventView<'a> {
    plane: &'a TracePlane,
    line: &'a TraceLine,
    event: &'a TraceEvent,
}

impl<'a> EventView<'a> {
    pub fn metadata(&self) -> Option<&'a EventMetadata> {
        self.plane.event_metadata.get(&self.event.metadata_id)
    }

    pub fn name(&self) -> &'a str {
        self.metadata().map(|m| m.name.as_str()).unwrap_or_default()
    }

    /// Display name when present, otherwise the raw name.
    pub fn display_name(&self) -> &'a str {
        self.metadata()
            .and_then(|m| m.display_name.as_deref())
            .unwrap_or_else(|| self.name())
    }

    pub fn line_name(&self) -> &'a str {
        &self.line.name
    }

    pub fn begin_ps(&self) -> u64 {
        self.line
            .timestamp_ns
            .saturating_mul(1000)
            .saturating_add(self.event.offset_ps)
    }

    pub fn duration_ps(&self) -> u64 {
        self.event.duration_ps
    }

    pub fn timespan(&self) -> Timespan {
        Timespan::new(self.begin_ps(), self.event.duration_ps)
    }

    pub fn num_occurrences(&self) -> u64 {
        self.event.num_occurrences.unwrap_or(1).max(1)
    }

    /// Event stat, falling back to the metadata stat of the same name.
    pub fn stat(&self, name: &str) -> Option<&'a StatValue> {
        self.event
            .stats
            .get(name)
            .or_else(|| self.metadata_stat(name))
    }

    pub fn metadata_stat(&self, name: &str) -> Option<&'a StatValue> {
        self.metadata().and_then(|m| m.stats.get(name))
    }

    pub fn plane(&self) -> &'a TracePlane {
        self.plane
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plane_with_one_event() -> TracePlane {
        TracePlane {
            id: 7,
            name: "/device:GPU:0".to_string(),
            stats: Stats::new(),
            event_metadata: BTreeMap::from([(
                1,
                EventMetadata {
                    id: 1,
                    name: "fusion.1".to_string(),
                    display_name: Some("fusion".to_string()),
                    stats: Stats::from([("flops".to_string(), StatValue::Int(8))]),
                    child_ids: Vec::new(),
                },
            )]),
            lines: vec![TraceLine {
                id: 0,
                name: "stream 1".to_string(),
                timestamp_ns: 2,
                events: vec![TraceEvent {
                    metadata_id: 1,
                    offset_ps: 500,
                    duration_ps: 100,
                    num_occurrences: None,
                    stats: Stats::from([("flops".to_string(), StatValue::Int(4))]),
                }],
            }],
        }
    }

    #[test]
    fn event_view_resolves_time_and_stats() {
        let plane = plane_with_one_event();
        let line = &plane.lines[0];
        let event = plane.events(line).next().expect("event");
        assert_eq!(event.begin_ps(), 2_500);
        assert_eq!(event.display_name(), "fusion");
        assert_eq!(event.name(), "fusion.1");
        assert_eq!(event.stat("flops").and_then(StatValue::as_u64), Some(4));
        assert_eq!(event.metadata_stat("flops").and_then(StatValue::as_u64), Some(8));
        assert_eq!(plane.span(), Timespan::new(2_500, 100));
    }

    #[test]
    fn capture_json_accepts_missing_sections() {
        let space: TraceSpace =
            serde_json::from_str(r#"{"planes":[{"id":1,"name":"/host:CPU"}]}"#).expect("parse");
        assert_eq!(space.hostname(), "localhost");
        assert!(space.host_plane().is_some());
        assert!(space.planes[0].lines.is_empty());
    }
}
