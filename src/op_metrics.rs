//! Per-operation cost tables and the builder that accumulates them.
//!
//! A table owns an arena of [`OpMetrics`] records. Top-level rows are keyed by
//! `(module id, name)`; fusion children live in the same arena and are
//! referenced by [`OpIndex`]. Module id 0 is reserved for host operations.
//!
//! FLOPs and bytes-accessed enter the builder as per-occurrence rates and are
//! multiplied by the occurrence count exactly once, in
//! [`OpMetricsDbBuilder::finalize`]. Tables handed out by the builder are
//! always scaled; combiners only ever sum scaled values.

use serde::{Deserialize, Serialize};

use std::collections::HashMap;

use crate::{InstructionInfo, ModuleMetadata, OpStatsError, OpStatsResult, Timespan};

pub const IDLE_OP_NAME: &str = "IDLE";
pub const SPARSE_CORE_BUSY_OP_NAME: &str = "sparse_core_busy_ops";
pub const UNKNOWN_OP_TYPE: &str = "Unknown";
pub const HOST_MODULE_ID: u64 = 0;

pub fn safe_divide(numerator: f64, denominator: f64) -> f64 {
    if denominator.abs() < f64::EPSILON {
        0.0
    } else {
        numerator / denominator
    }
}

/// A metadata field that is written by the first producer only. `Unset` is
/// distinct from a set-but-empty value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirstWrite<T> {
    Unset,
    Set(T),
}

impl<T> Default for FirstWrite<T> {
    fn default() -> Self {
        Self::Unset
    }
}

impl<T> FirstWrite<T> {
    /// Returns whether the value was written.
    pub fn set_if_unset(&mut self, value: T) -> bool {
        match self {
            Self::Unset => {
                *self = Self::Set(value);
                true
            }
            Self::Set(_) => false,
        }
    }

    pub fn get(&self) -> Option<&T> {
        match self {
            Self::Unset => None,
            Self::Set(v) => Some(v),
        }
    }

    pub fn is_set(&self) -> bool {
        matches!(self, Self::Set(_))
    }
}

impl<T: Clone> FirstWrite<T> {
    pub fn merge_from(&mut self, other: &Self) {
        if let Self::Set(v) = other {
            self.set_if_unset(v.clone());
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpKey {
    pub module_id: u64,
    pub name: String,
}

impl OpKey {
    pub fn new(module_id: u64, name: impl Into<String>) -> Self {
        Self {
            module_id,
            name: name.into(),
        }
    }

    pub fn host(name: impl Into<String>) -> Self {
        Self::new(HOST_MODULE_ID, name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryOperation {
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryAccessed {
    pub operation: MemoryOperation,
    pub memory_space: u64,
    pub bytes_accessed: u64,
}

/// Adds `src` into `dst`, matching entries by `(operation, memory_space)`.
pub fn combine_memory_accessed(src: &[MemoryAccessed], dst: &mut Vec<MemoryAccessed>) {
    for s in src {
        match dst
            .iter_mut()
            .find(|d| d.operation == s.operation && d.memory_space == s.memory_space)
        {
            Some(d) => d.bytes_accessed = d.bytes_accessed.saturating_add(s.bytes_accessed),
            None => dst.push(s.clone()),
        }
    }
    dst.sort_by_key(|m| (m.operation, m.memory_space));
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub file_name: String,
    pub line_number: i32,
    #[serde(default)]
    pub stack_frame: String,
}

impl SourceInfo {
    /// Parses `<file>:<line>`.
    pub fn parse(top_line: &str) -> OpStatsResult<Self> {
        let (file, line) = top_line.split_once(':').ok_or_else(|| {
            OpStatsError::Trace(format!("invalid source info expression: {top_line:?}"))
        })?;
        let line_number = line
            .trim()
            .parse::<i32>()
            .map_err(|_| OpStatsError::Trace(format!("invalid source line: {line:?}")))?;
        Ok(Self {
            file_name: file.to_string(),
            line_number,
            stack_frame: String::new(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpIndex(pub usize);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpMetrics {
    pub hlo_module_id: u64,
    pub name: String,
    #[serde(default)]
    pub long_name: String,
    #[serde(default)]
    pub deduplicated_name: String,
    #[serde(default)]
    pub category: FirstWrite<String>,
    #[serde(default)]
    pub provenance: FirstWrite<String>,
    #[serde(default)]
    pub source_info: FirstWrite<SourceInfo>,
    pub is_eager: bool,
    pub occurrences: u64,
    pub time_ps: u64,
    pub min_time_ps: u64,
    pub self_time_ps: u64,
    pub flops: u64,
    pub model_flops: u64,
    pub bytes_accessed: u64,
    pub dma_stall_ps: u64,
    pub num_cores: u32,
    #[serde(default)]
    pub memory_accessed_breakdown: Vec<MemoryAccessed>,
    #[serde(default)]
    pub children: Vec<OpIndex>,
}

impl OpMetrics {
    pub fn new(module_id: u64, name: impl Into<String>) -> Self {
        Self {
            hlo_module_id: module_id,
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn key(&self) -> OpKey {
        OpKey::new(self.hlo_module_id, self.name.clone())
    }

    pub fn category_str(&self) -> &str {
        self.category.get().map(String::as_str).unwrap_or_default()
    }

    pub fn provenance_str(&self) -> &str {
        self.provenance.get().map(String::as_str).unwrap_or_default()
    }

    pub fn is_idle(&self) -> bool {
        self.name == IDLE_OP_NAME && self.category_str() == IDLE_OP_NAME
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrecisionStats {
    pub compute_16bit_ps: u64,
    pub compute_32bit_ps: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpMetricsDb {
    arena: Vec<OpMetrics>,
    rows: Vec<OpIndex>,
    /// Elapsed time covered by the table.
    pub total_time_ps: u64,
    /// Self time attributed to recorded operations.
    pub total_op_time_ps: u64,
    /// Duty-cycle derived totals; only populated for TPU device tables.
    pub duty_cycle_idle_ps: u64,
    pub duty_cycle_busy_ps: u64,
    pub precision_stats: PrecisionStats,
    pub total_host_infeed_enq_duration_ps: u64,
    pub total_host_infeed_enq_start_timestamp_ps_diff: u64,
}

/// Owned, order-independent view of one row and its fusion children.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpMetricsTree {
    pub metrics: OpMetrics,
    pub children: Vec<OpMetricsTree>,
}

impl OpMetricsDb {
    pub fn rows(&self) -> impl Iterator<Item = &OpMetrics> {
        self.rows.iter().map(|idx| &self.arena[idx.0])
    }

    pub fn row_indices(&self) -> &[OpIndex] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, idx: OpIndex) -> Option<&OpMetrics> {
        self.arena.get(idx.0)
    }

    pub(crate) fn get_mut(&mut self, idx: OpIndex) -> &mut OpMetrics {
        &mut self.arena[idx.0]
    }

    pub fn children_of<'a>(
        &'a self,
        metrics: &'a OpMetrics,
    ) -> impl Iterator<Item = &'a OpMetrics> + 'a {
        metrics.children.iter().filter_map(|idx| self.get(*idx))
    }

    pub fn find(&self, module_id: u64, name: &str) -> Option<&OpMetrics> {
        self.rows().find(|m| m.hlo_module_id == module_id && m.name == name)
    }

    pub(crate) fn push_row(&mut self, metrics: OpMetrics) -> OpIndex {
        let idx = OpIndex(self.arena.len());
        self.arena.push(metrics);
        self.rows.push(idx);
        idx
    }

    pub(crate) fn push_child(&mut self, parent: OpIndex, metrics: OpMetrics) -> OpIndex {
        let idx = OpIndex(self.arena.len());
        self.arena.push(metrics);
        self.arena[parent.0].children.push(idx);
        idx
    }

    /// Deep-copies the subtree rooted at `src_idx` of `src` into this arena,
    /// returning the new root index. The root is not registered as a row.
    pub(crate) fn copy_subtree(&mut self, src: &OpMetricsDb, src_idx: OpIndex) -> OpIndex {
        let mut root = src.arena[src_idx.0].clone();
        root.children.clear();
        let new_idx = OpIndex(self.arena.len());
        self.arena.push(root);
        for child in &src.arena[src_idx.0].children {
            let copied = self.copy_subtree(src, *child);
            self.arena[new_idx.0].children.push(copied);
        }
        new_idx
    }

    pub(crate) fn copy_row(&mut self, src: &OpMetricsDb, src_idx: OpIndex) -> OpIndex {
        let idx = self.copy_subtree(src, src_idx);
        self.rows.push(idx);
        idx
    }

    /// Elapsed time not attributed to any operation. A table whose attributed
    /// time exceeds its elapsed time was produced incorrectly.
    pub fn idle_time_ps(&self) -> OpStatsResult<u64> {
        self.total_time_ps
            .checked_sub(self.total_op_time_ps)
            .ok_or_else(|| {
                OpStatsError::InvariantViolation(format!(
                    "attributed time {} ps exceeds elapsed time {} ps",
                    self.total_op_time_ps, self.total_time_ps
                ))
            })
    }

    pub fn idle_time_ratio(&self) -> f64 {
        1.0 - safe_divide(self.total_op_time_ps as f64, self.total_time_ps as f64)
    }

    /// Appends the synthetic `IDLE` row holding unattributed time.
    pub fn add_idle_op(&mut self) -> OpStatsResult<()> {
        let idle_time_ps = self.idle_time_ps()?;
        let mut idle = OpMetrics::new(HOST_MODULE_ID, IDLE_OP_NAME);
        idle.category.set_if_unset(IDLE_OP_NAME.to_string());
        idle.time_ps = idle_time_ps;
        idle.self_time_ps = idle_time_ps;
        self.push_row(idle);
        Ok(())
    }

    pub fn host_infeed_enqueue_ratio(&self) -> Option<f64> {
        if self.total_host_infeed_enq_start_timestamp_ps_diff > 0 {
            Some(safe_divide(
                self.total_host_infeed_enq_duration_ps as f64,
                self.total_host_infeed_enq_start_timestamp_ps_diff as f64,
            ))
        } else {
            None
        }
    }

    /// Rows sorted by key with children resolved, for comparisons that must
    /// not depend on insertion order.
    pub fn to_sorted_tree(&self) -> Vec<OpMetricsTree> {
        let mut out: Vec<OpMetricsTree> = self.rows.iter().map(|idx| self.tree_at(*idx)).collect();
        out.sort_by(|a, b| a.metrics.key().cmp(&b.metrics.key()));
        out
    }

    fn tree_at(&self, idx: OpIndex) -> OpMetricsTree {
        let node = &self.arena[idx.0];
        let mut metrics = node.clone();
        metrics.children.clear();
        OpMetricsTree {
            metrics,
            children: node.children.iter().map(|c| self.tree_at(*c)).collect(),
        }
    }
}

/// Per-occurrence cost of one operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpRates {
    pub flops: u64,
    /// Zero means "same as `flops`".
    pub model_flops: u64,
    pub bytes_accessed: u64,
    #[serde(default)]
    pub memory_accessed: Vec<MemoryAccessed>,
}

impl OpRates {
    pub fn is_zero(&self) -> bool {
        self.flops == 0
            && self.model_flops == 0
            && self.bytes_accessed == 0
            && self.memory_accessed.is_empty()
    }

    pub fn from_instruction(instr: &InstructionInfo) -> Self {
        Self {
            flops: instr.flops,
            model_flops: instr.model_flops,
            bytes_accessed: instr.bytes_accessed,
            memory_accessed: instr.memory_accessed.clone(),
        }
    }
}

/// One observation (possibly aggregating several occurrences) of an operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpEntry {
    pub key: OpKey,
    pub category: Option<String>,
    pub provenance: Option<String>,
    pub deduplicated_name: Option<String>,
    pub long_name: Option<String>,
    pub source_info: Option<SourceInfo>,
    pub is_eager: bool,
    pub occurrences: u64,
    pub time_ps: u64,
    pub children_time_ps: u64,
    pub min_time_ps: Option<u64>,
    pub dma_stall_ps: u64,
    pub rates: OpRates,
}

impl OpEntry {
    pub fn new(key: OpKey, time_ps: u64) -> Self {
        Self {
            key,
            occurrences: 1,
            time_ps,
            ..Self::default()
        }
    }

    pub fn self_time_ps(&self) -> OpStatsResult<u64> {
        self.time_ps.checked_sub(self.children_time_ps).ok_or_else(|| {
            OpStatsError::InvariantViolation(format!(
                "op {:?} in module {}: children time {} ps exceeds total time {} ps",
                self.key.name, self.key.module_id, self.children_time_ps, self.time_ps
            ))
        })
    }
}

/// Insert-or-update accumulator for one table.
#[derive(Debug, Default)]
pub struct OpMetricsDbBuilder {
    db: OpMetricsDb,
    index: HashMap<OpKey, OpIndex>,
    rates: HashMap<OpIndex, OpRates>,
    last_host_infeed_enqueue: Option<Timespan>,
}

impl OpMetricsDbBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the row for `(module_id, name)`, creating a zero-valued row on
    /// first access. Cost fields written through this reference are replaced
    /// by the rate-derived values at finalize.
    pub fn lookup_or_insert(&mut self, module_id: u64, name: &str) -> &mut OpMetrics {
        let idx = self.lookup_or_insert_index(module_id, name);
        self.db.get_mut(idx)
    }

    fn lookup_or_insert_index(&mut self, module_id: u64, name: &str) -> OpIndex {
        let key = OpKey::new(module_id, name);
        if let Some(idx) = self.index.get(&key) {
            return *idx;
        }
        let idx = self.db.push_row(OpMetrics::new(module_id, name));
        self.index.insert(key, idx);
        idx
    }

    /// Records one observation. Metadata is first-writer-wins; counters add.
    /// Rejects entries whose children time exceeds their total time.
    pub fn enter_op(&mut self, entry: &OpEntry) -> OpStatsResult<()> {
        let self_time_ps = entry.self_time_ps()?;
        let idx = self.lookup_or_insert_index(entry.key.module_id, &entry.key.name);
        let row = self.db.get_mut(idx);

        if let Some(category) = &entry.category {
            row.category.set_if_unset(category.clone());
        }
        if let Some(provenance) = &entry.provenance {
            row.provenance.set_if_unset(provenance.clone());
        }
        if let Some(source_info) = &entry.source_info {
            row.source_info.set_if_unset(source_info.clone());
        }
        if row.deduplicated_name.is_empty() {
            if let Some(name) = &entry.deduplicated_name {
                row.deduplicated_name = name.clone();
            }
        }
        if row.long_name.is_empty() {
            if let Some(name) = &entry.long_name {
                row.long_name = name.clone();
            }
        }

        let min_candidate = entry.min_time_ps.unwrap_or(entry.time_ps);
        row.min_time_ps = if row.occurrences == 0 {
            min_candidate
        } else {
            row.min_time_ps.min(min_candidate)
        };
        row.is_eager |= entry.is_eager;
        row.num_cores = 1;
        row.occurrences = row.occurrences.saturating_add(entry.occurrences);
        row.time_ps = row.time_ps.saturating_add(entry.time_ps);
        row.self_time_ps = row.self_time_ps.saturating_add(self_time_ps);
        row.dma_stall_ps = row.dma_stall_ps.saturating_add(entry.dma_stall_ps);

        if !entry.rates.is_zero() {
            match self.rates.get(&idx) {
                None => {
                    self.rates.insert(idx, entry.rates.clone());
                }
                Some(existing) if *existing != entry.rates => {
                    tracing::warn!(
                        "conflicting per-occurrence cost for op {:?} in module {}; \
                         keeping the first",
                        entry.key.name,
                        entry.key.module_id
                    );
                }
                Some(_) => {}
            }
        }

        self.db.total_op_time_ps = self.db.total_op_time_ps.saturating_add(self_time_ps);
        Ok(())
    }

    /// Host-side operation: module id 0, one occurrence, no cost model.
    pub fn enter_host_op(
        &mut self,
        name: &str,
        category: &str,
        is_eager: bool,
        time_ps: u64,
        children_time_ps: u64,
    ) -> OpStatsResult<()> {
        let mut entry = OpEntry::new(OpKey::host(name), time_ps);
        entry.category = Some(category.to_string());
        entry.is_eager = is_eager;
        entry.children_time_ps = children_time_ps;
        self.enter_op(&entry)
    }

    /// Expects infeed-enqueue spans in time order.
    pub fn enter_host_infeed_enqueue(&mut self, span: Timespan) {
        if let Some(last) = self.last_host_infeed_enqueue {
            if span.begin_ps < last.begin_ps {
                tracing::warn!(
                    "out of order infeed enqueue at {} ps (previous at {} ps)",
                    span.begin_ps,
                    last.begin_ps
                );
            } else {
                self.db.total_host_infeed_enq_duration_ps = self
                    .db
                    .total_host_infeed_enq_duration_ps
                    .saturating_add(last.duration_ps);
                self.db.total_host_infeed_enq_start_timestamp_ps_diff = self
                    .db
                    .total_host_infeed_enq_start_timestamp_ps_diff
                    .saturating_add(span.begin_ps - last.begin_ps);
            }
        }
        self.last_host_infeed_enqueue = Some(span);
    }

    /// Attaches fusion children to a row that has none yet.
    pub fn add_fusion_children(&mut self, module_id: u64, name: &str, instr: &InstructionInfo) {
        let idx = self.lookup_or_insert_index(module_id, name);
        if !self.db.get_mut(idx).children.is_empty() {
            return;
        }
        add_children_from_instruction(&mut self.db, idx, instr);
    }

    /// Enriches every device row from the metadata service: fills unset
    /// category/provenance and attaches fusion children.
    pub fn enter_metadata_from(&mut self, metadata: &dyn ModuleMetadata) {
        let keys: Vec<(OpIndex, u64, String)> = self
            .db
            .rows
            .iter()
            .map(|idx| {
                let m = &self.db.arena[idx.0];
                (*idx, m.hlo_module_id, m.name.clone())
            })
            .filter(|(_, module_id, _)| *module_id != HOST_MODULE_ID)
            .collect();
        for (idx, module_id, name) in keys {
            let Some(instr) = metadata.instruction(module_id, &name) else {
                continue;
            };
            let row = self.db.get_mut(idx);
            if !instr.category.is_empty() {
                row.category.set_if_unset(instr.category.clone());
            }
            if !instr.tf_op_name.is_empty() {
                row.provenance.set_if_unset(instr.tf_op_name.clone());
            }
            let has_children = !row.children.is_empty();
            if !has_children {
                add_children_from_instruction(&mut self.db, idx, instr);
            }
            if !self.rates.contains_key(&idx) {
                let rates = OpRates::from_instruction(instr);
                if !rates.is_zero() {
                    self.rates.insert(idx, rates);
                }
            }
        }
    }

    pub fn total_op_time_ps(&self) -> u64 {
        self.db.total_op_time_ps
    }

    /// Applies per-occurrence rates and returns the table. This is the only
    /// place cost counters are scaled by occurrences.
    pub fn finalize(mut self) -> OpMetricsDb {
        let rows = self.db.rows.clone();
        for idx in rows {
            let rates = self.rates.remove(&idx).unwrap_or_default();
            let row = self.db.get_mut(idx);
            let n = row.occurrences;
            row.flops = rates.flops.saturating_mul(n);
            row.model_flops = if rates.model_flops > 0 {
                rates.model_flops.saturating_mul(n)
            } else {
                row.flops
            };
            row.bytes_accessed = rates.bytes_accessed.saturating_mul(n);
            row.memory_accessed_breakdown = rates
                .memory_accessed
                .iter()
                .map(|m| MemoryAccessed {
                    bytes_accessed: m.bytes_accessed.saturating_mul(n),
                    ..m.clone()
                })
                .collect();
        }
        self.db
    }

    /// Finalizes with an elapsed time and appends the `IDLE` row.
    pub fn finalize_with_total_time(self, total_time_ps: u64) -> OpStatsResult<OpMetricsDb> {
        let mut db = self.finalize();
        db.total_time_ps = total_time_ps;
        db.add_idle_op()?;
        Ok(db)
    }
}

/// Fusion children describe a single occurrence of their parent.
fn add_children_from_instruction(db: &mut OpMetricsDb, parent: OpIndex, instr: &InstructionInfo) {
    for child in instr.reportable_children() {
        let parent_module = db.get_mut(parent).hlo_module_id;
        let mut metrics = OpMetrics::new(parent_module, child.name.clone());
        metrics.category.set_if_unset(child.category.clone());
        metrics.provenance.set_if_unset(child.tf_op_name.clone());
        metrics.deduplicated_name = child.deduplicated_name.clone();
        metrics.long_name = child.expression.clone();
        metrics.num_cores = 1;
        metrics.occurrences = 1;
        metrics.flops = child.flops;
        metrics.model_flops = if child.model_flops > 0 {
            child.model_flops
        } else {
            child.flops
        };
        metrics.bytes_accessed = child.bytes_accessed;
        metrics.memory_accessed_breakdown = child.memory_accessed.clone();
        if let Some(source_info) = &child.source_info {
            metrics.source_info.set_if_unset(source_info.clone());
        }
        let idx = db.push_child(parent, metrics);
        add_children_from_instruction(db, idx, child);
    }
}

/// Splits `scope/name:Type` into `(scope/name, Type)`.
pub fn parse_tf_op_fullname(fullname: &str) -> (&str, &str) {
    match fullname.rsplit_once(':') {
        Some((name, op_type)) if !name.is_empty() && !op_type.is_empty() => (name, op_type),
        _ => (fullname, UNKNOWN_OP_TYPE),
    }
}

/// Rolls device rows up to the framework ops they were lowered from. The
/// occurrences of a framework op are the maximum over its device ops.
pub fn tf_metrics_db_from_device_db(device_db: &OpMetricsDb, with_idle: bool) -> OpMetricsDb {
    let mut out = OpMetricsDb::default();
    let mut index: HashMap<String, OpIndex> = HashMap::new();
    for device in device_db.rows() {
        let (name, op_type) = if device.is_idle() {
            if !with_idle {
                continue;
            }
            (IDLE_OP_NAME, IDLE_OP_NAME)
        } else {
            match device.provenance.get() {
                Some(p) if !p.is_empty() => parse_tf_op_fullname(p),
                _ => (device.name.as_str(), UNKNOWN_OP_TYPE),
            }
        };
        let idx = *index
            .entry(name.to_string())
            .or_insert_with(|| out.push_row(OpMetrics::new(HOST_MODULE_ID, name)));
        let tf = out.get_mut(idx);
        tf.category.set_if_unset(op_type.to_string());
        tf.is_eager = device.is_eager;
        tf.occurrences = tf.occurrences.max(device.occurrences);
        tf.time_ps = tf.time_ps.saturating_add(device.time_ps);
        tf.self_time_ps = tf.self_time_ps.saturating_add(device.self_time_ps);
        tf.flops = tf.flops.saturating_add(device.flops);
        tf.model_flops = tf.model_flops.saturating_add(device.model_flops);
        tf.bytes_accessed = tf.bytes_accessed.saturating_add(device.bytes_accessed);
    }
    out.total_op_time_ps = device_db.total_op_time_ps;
    out.total_time_ps = if with_idle {
        device_db.total_time_ps
    } else {
        device_db.total_op_time_ps
    };
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_entry(module_id: u64, name: &str, time_ps: u64, flops: u64) -> OpEntry {
        let mut entry = OpEntry::new(OpKey::new(module_id, name), time_ps);
        entry.category = Some("convolution".to_string());
        entry.rates = OpRates {
            flops,
            model_flops: 0,
            bytes_accessed: 16,
            memory_accessed: Vec::new(),
        };
        entry
    }

    #[test]
    fn entries_start_from_an_empty_key() {
        let entry = OpEntry::default();
        assert_eq!(entry.key, OpKey::default());
        assert_eq!(entry.key.module_id, HOST_MODULE_ID);
        assert!(entry.key.name.is_empty());
        let named = OpEntry::new(OpKey::new(3, "dot.2"), 40);
        assert_eq!(named.occurrences, 1);
        assert_eq!(named.children_time_ps, 0);
    }

    #[test]
    fn lookup_or_insert_returns_same_row() {
        let mut builder = OpMetricsDbBuilder::new();
        builder.lookup_or_insert(1, "conv").occurrences = 3;
        assert_eq!(builder.lookup_or_insert(1, "conv").occurrences, 3);
        assert_eq!(builder.lookup_or_insert(2, "conv").occurrences, 0);
        let db = builder.finalize();
        assert_eq!(db.len(), 2);
    }

    #[test]
    fn rates_are_scaled_once_at_finalize() {
        let mut builder = OpMetricsDbBuilder::new();
        for _ in 0..3 {
            builder
                .enter_op(&device_entry(1, "conv", 100, 10))
                .expect("enter");
        }
        let db = builder.finalize();
        let row = db.find(1, "conv").expect("row");
        assert_eq!(row.occurrences, 3);
        assert_eq!(row.flops, 30);
        assert_eq!(row.model_flops, 30);
        assert_eq!(row.bytes_accessed, 48);
        assert_eq!(row.time_ps, 300);
        assert_eq!(row.min_time_ps, 100);
    }

    #[test]
    fn cost_written_through_lookup_is_not_double_scaled() {
        let mut builder = OpMetricsDbBuilder::new();
        builder
            .enter_op(&device_entry(1, "conv", 100, 10))
            .expect("enter");
        builder.lookup_or_insert(1, "conv").flops = 999;
        let db = builder.finalize();
        assert_eq!(db.find(1, "conv").expect("row").flops, 10);
    }

    #[test]
    fn children_time_exceeding_total_is_rejected() {
        let mut builder = OpMetricsDbBuilder::new();
        let err = builder
            .enter_host_op("matmul", "MatMul", false, 10, 20)
            .expect_err("must reject");
        assert!(matches!(err, OpStatsError::InvariantViolation(_)));
        assert_eq!(builder.total_op_time_ps(), 0);
    }

    #[test]
    fn metadata_is_first_writer_wins() {
        let mut builder = OpMetricsDbBuilder::new();
        let mut first = device_entry(1, "conv", 10, 0);
        first.category = Some(String::new());
        let mut second = device_entry(1, "conv", 10, 0);
        second.category = Some("fusion".to_string());
        builder.enter_op(&first).expect("enter");
        builder.enter_op(&second).expect("enter");
        let db = builder.finalize();
        assert_eq!(db.find(1, "conv").expect("row").category, FirstWrite::Set(String::new()));
    }

    #[test]
    fn idle_time_is_elapsed_minus_attributed() {
        let mut builder = OpMetricsDbBuilder::new();
        builder
            .enter_host_op("a", "A", false, 40, 10)
            .expect("enter");
        let db = builder.finalize_with_total_time(100).expect("finalize");
        assert_eq!(db.total_op_time_ps, 30);
        assert_eq!(db.idle_time_ps().expect("idle"), 70);
        let idle = db.find(HOST_MODULE_ID, IDLE_OP_NAME).expect("idle row");
        assert!(idle.is_idle());
        assert_eq!(idle.self_time_ps, 70);
        assert!((db.idle_time_ratio() - 0.7).abs() < 1e-9);
    }

    #[test]
    fn negative_idle_time_is_an_invariant_violation() {
        let mut builder = OpMetricsDbBuilder::new();
        builder
            .enter_host_op("a", "A", false, 40, 0)
            .expect("enter");
        let err = builder.finalize_with_total_time(10).expect_err("must fail");
        assert!(matches!(err, OpStatsError::InvariantViolation(_)));
    }

    #[test]
    fn fusion_children_are_attached_once() {
        let instr = InstructionInfo {
            name: "fusion.3".to_string(),
            fused_children: vec![InstructionInfo {
                name: "multiply.1".to_string(),
                opcode: "multiply".to_string(),
                flops: 4,
                fused_children: vec![InstructionInfo {
                    name: "constant".to_string(),
                    opcode: "constant".to_string(),
                    ..InstructionInfo::default()
                }],
                ..InstructionInfo::default()
            }],
            ..InstructionInfo::default()
        };
        let mut builder = OpMetricsDbBuilder::new();
        builder.add_fusion_children(5, "fusion.3", &instr);
        builder.add_fusion_children(5, "fusion.3", &instr);
        let db = builder.finalize();
        let row = db.find(5, "fusion.3").expect("row");
        let children: Vec<_> = db.children_of(row).collect();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].flops, 4);
        assert_eq!(db.children_of(children[0]).count(), 1);
    }

    #[test]
    fn host_infeed_ratio_uses_consecutive_spans() {
        let mut builder = OpMetricsDbBuilder::new();
        builder.enter_host_infeed_enqueue(Timespan::new(0, 10));
        builder.enter_host_infeed_enqueue(Timespan::new(100, 10));
        builder.enter_host_infeed_enqueue(Timespan::new(200, 10));
        let db = builder.finalize();
        assert_eq!(db.total_host_infeed_enq_duration_ps, 20);
        assert_eq!(db.total_host_infeed_enq_start_timestamp_ps_diff, 200);
        assert_eq!(db.host_infeed_enqueue_ratio(), Some(0.1));
    }

    #[test]
    fn source_info_parses_file_and_line() {
        let info = SourceInfo::parse("model.py:42").expect("parse");
        assert_eq!(info.file_name, "model.py");
        assert_eq!(info.line_number, 42);
        assert!(SourceInfo::parse("model.py").is_err());
        assert!(SourceInfo::parse("model.py:x").is_err());
    }

    #[test]
    fn tf_rollup_takes_max_occurrences() {
        let mut builder = OpMetricsDbBuilder::new();
        let mut a = device_entry(1, "fusion.1", 10, 0);
        a.provenance = Some("dense/MatMul:MatMul".to_string());
        a.occurrences = 2;
        let mut b = device_entry(1, "fusion.2", 30, 0);
        b.provenance = Some("dense/MatMul:MatMul".to_string());
        b.occurrences = 5;
        let c = device_entry(1, "copy.1", 5, 0);
        builder.enter_op(&a).expect("enter");
        builder.enter_op(&b).expect("enter");
        builder.enter_op(&c).expect("enter");
        let device = builder.finalize_with_total_time(100).expect("finalize");

        let tf = tf_metrics_db_from_device_db(&device, false);
        let matmul = tf.find(HOST_MODULE_ID, "dense/MatMul").expect("matmul");
        assert_eq!(matmul.occurrences, 5);
        assert_eq!(matmul.time_ps, 40);
        assert_eq!(matmul.category_str(), "MatMul");
        assert_eq!(
            tf.find(HOST_MODULE_ID, "copy.1").expect("copy").category_str(),
            UNKNOWN_OP_TYPE
        );
        assert!(tf.find(HOST_MODULE_ID, IDLE_OP_NAME).is_none());
        assert_eq!(tf.total_time_ps, 45);

        let with_idle = tf_metrics_db_from_device_db(&device, true);
        assert!(with_idle.find(HOST_MODULE_ID, IDLE_OP_NAME).is_some());
        assert_eq!(with_idle.total_time_ps, 100);
    }
}
