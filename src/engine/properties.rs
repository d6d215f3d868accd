//! String-keyed runtime properties.
//!
//! Callers introspect the engine through named properties; unknown names
//! return absent rather than erroring so callers can probe across versions.

use super::state::LsmState;

pub const PROPERTY_PREFIX: &str = "emberdb.";

/// Looks up a named property. `None` for unknown names or foreign
/// prefixes.
pub fn get_property(state: &LsmState, name: &str) -> Option<String> {
    let suffix = name.strip_prefix(PROPERTY_PREFIX)?;
    let metrics = state.metrics();

    if let Some(level) = suffix.strip_prefix("num-files-at-level") {
        let level: usize = level.parse().ok()?;
        let count = metrics.level_table_counts.get(level).copied().unwrap_or(0);
        return Some(count.to_string());
    }

    match suffix {
        "cur-size-active-mem-table" => Some(metrics.active_memtable_size.to_string()),
        "num-frozen-mem-tables" => Some(metrics.frozen_memtable_count.to_string()),
        "num-levels" => Some(metrics.level_count.to_string()),
        "num-files" => Some(metrics.total_table_count.to_string()),
        "last-sequence" => Some(metrics.last_visible_seq.to_string()),
        "background-errors" => Some(metrics.background_errors.to_string()),
        "is-degraded" => Some(metrics.degraded.to_string()),
        "flush-pending" => Some(metrics.flush_pending.to_string()),
        "compaction-running" => Some(metrics.compaction_running.to_string()),
        _ => None,
    }
}
