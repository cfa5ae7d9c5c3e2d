//! Merging of finalized op metrics tables.

use std::collections::HashMap;

use crate::{OpIndex, OpKey, OpMetrics, OpMetricsDb, combine_memory_accessed};

/// Folds finalized tables into an accumulating destination, matching rows by
/// `(module id, name)`. The result does not depend on the order of
/// [`OpMetricsDbCombiner::combine`] calls, except for the order rows are
/// listed in and for first-writer-wins metadata that disagrees across inputs.
pub struct OpMetricsDbCombiner<'a> {
    dst: &'a mut OpMetricsDb,
    index: HashMap<OpKey, OpIndex>,
}

impl<'a> OpMetricsDbCombiner<'a> {
    pub fn new(dst: &'a mut OpMetricsDb) -> Self {
        let index = dst
            .row_indices()
            .iter()
            .filter_map(|idx| dst.get(*idx).map(|m| (m.key(), *idx)))
            .collect();
        Self { dst, index }
    }

    /// `update_num_cores` is set when `src` comes from a different core than
    /// the tables already folded in.
    pub fn combine(&mut self, src: &OpMetricsDb, update_num_cores: bool) {
        let dst = &mut *self.dst;
        dst.total_time_ps = dst.total_time_ps.saturating_add(src.total_time_ps);
        dst.total_op_time_ps = dst.total_op_time_ps.saturating_add(src.total_op_time_ps);
        dst.duty_cycle_busy_ps = dst.duty_cycle_busy_ps.saturating_add(src.duty_cycle_busy_ps);
        dst.duty_cycle_idle_ps = dst.duty_cycle_idle_ps.saturating_add(src.duty_cycle_idle_ps);
        dst.precision_stats.compute_16bit_ps = dst
            .precision_stats
            .compute_16bit_ps
            .saturating_add(src.precision_stats.compute_16bit_ps);
        dst.precision_stats.compute_32bit_ps = dst
            .precision_stats
            .compute_32bit_ps
            .saturating_add(src.precision_stats.compute_32bit_ps);
        dst.total_host_infeed_enq_duration_ps = dst
            .total_host_infeed_enq_duration_ps
            .saturating_add(src.total_host_infeed_enq_duration_ps);
        dst.total_host_infeed_enq_start_timestamp_ps_diff = dst
            .total_host_infeed_enq_start_timestamp_ps_diff
            .saturating_add(src.total_host_infeed_enq_start_timestamp_ps_diff);

        for src_idx in src.row_indices() {
            let Some(src_row) = src.get(*src_idx) else {
                continue;
            };
            match self.index.get(&src_row.key()) {
                Some(dst_idx) => {
                    let dst_idx = *dst_idx;
                    combine_op_metrics(src_row, self.dst.get_mut(dst_idx), update_num_cores);
                    let needs_children = self.dst.get_mut(dst_idx).children.is_empty();
                    if needs_children {
                        for child in &src_row.children {
                            let copied = self.dst.copy_subtree(src, *child);
                            self.dst.get_mut(dst_idx).children.push(copied);
                        }
                    }
                }
                None => {
                    let dst_idx = self.dst.copy_row(src, *src_idx);
                    self.index.insert(src_row.key(), dst_idx);
                }
            }
        }
    }
}

/// Merges one row into another. Children are handled by the caller.
pub fn combine_op_metrics(src: &OpMetrics, dst: &mut OpMetrics, update_num_cores: bool) {
    dst.min_time_ps = match (dst.occurrences > 0, src.occurrences > 0) {
        (true, true) | (false, false) => dst.min_time_ps.min(src.min_time_ps),
        (false, true) => src.min_time_ps,
        (true, false) => dst.min_time_ps,
    };
    dst.is_eager |= src.is_eager;
    dst.num_cores = if update_num_cores {
        dst.num_cores.saturating_add(src.num_cores)
    } else {
        dst.num_cores.max(src.num_cores)
    };
    dst.category.merge_from(&src.category);
    dst.provenance.merge_from(&src.provenance);
    dst.source_info.merge_from(&src.source_info);
    if dst.deduplicated_name.is_empty() {
        dst.deduplicated_name = src.deduplicated_name.clone();
    }
    if dst.long_name.is_empty() {
        dst.long_name = src.long_name.clone();
    }

    dst.occurrences = dst.occurrences.saturating_add(src.occurrences);
    dst.time_ps = dst.time_ps.saturating_add(src.time_ps);
    dst.self_time_ps = dst.self_time_ps.saturating_add(src.self_time_ps);
    dst.flops = dst.flops.saturating_add(src.flops);
    dst.model_flops = dst.model_flops.saturating_add(src.model_flops);
    dst.bytes_accessed = dst.bytes_accessed.saturating_add(src.bytes_accessed);
    dst.dma_stall_ps = dst.dma_stall_ps.saturating_add(src.dma_stall_ps);
    combine_memory_accessed(&src.memory_accessed_breakdown, &mut dst.memory_accessed_breakdown);
}

/// Convenience fold of several tables in the given order.
pub fn combine_all<'a>(
    tables: impl IntoIterator<Item = &'a OpMetricsDb>,
    update_num_cores: bool,
) -> OpMetricsDb {
    let mut out = OpMetricsDb::default();
    let mut combiner = OpMetricsDbCombiner::new(&mut out);
    for table in tables {
        combiner.combine(table, update_num_cores);
    }
    out
}
