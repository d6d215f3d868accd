use itertools::Itertools;

use super::state::LsmState;
use crate::error::Result;

/// Logs a structured snapshot of the engine's health and shape.
pub fn collect_metrics(state: &LsmState) -> Result<()> {
    let metrics = state.metrics();

    let level_shape = metrics
        .level_table_counts
        .iter()
        .zip(metrics.level_sizes.iter())
        .enumerate()
        .map(|(level, (count, size))| format!("L{}:{}({}B)", level, count, size))
        .join(" ");

    tracing::info!(
        active_memtable_size = metrics.active_memtable_size,
        frozen_memtables = metrics.frozen_memtable_count,
        tables = metrics.total_table_count,
        levels = %level_shape,
        last_visible_seq = metrics.last_visible_seq,
        background_errors = metrics.background_errors,
        degraded = metrics.degraded,
        flush_pending = metrics.flush_pending,
        compaction_running = metrics.compaction_running,
        "Engine metrics"
    );

    Ok(())
}
