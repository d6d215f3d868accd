//! Background task implementations driven by the scheduler: memtable
//! flushing, tiered compaction, WAL cleanup, and periodic metrics.
//!
//! A failing task never takes the instance down. Each failure is counted
//! into the engine state (surfaced via the `emberdb.background-errors` and
//! `emberdb.is-degraded` properties) and the scheduler backs off before the
//! next attempt; writes keep buffering until memory limits push back.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::store::LsmTree;
use crate::error::Result;
use crate::scheduler::{BackgroundTask, Context};

fn run_outcome(tree: &LsmTree, task: &'static str, result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => {
            tree.state.note_background_success();
            Ok(())
        }
        Err(e) => {
            tree.state.record_background_error(&e);
            tracing::warn!(task = task, error = %e, "Background task failed");
            Err(e)
        }
    }
}

pub struct FlushTask {
    tree: Arc<LsmTree>,
}

impl FlushTask {
    pub fn new(tree: Arc<LsmTree>) -> Self {
        Self { tree }
    }
}

#[async_trait]
impl BackgroundTask for FlushTask {
    fn name(&self) -> &'static str {
        "memtable-flush"
    }

    fn interval(&self) -> Duration {
        self.tree.config.options.flush_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        let result = async {
            // Also freeze an oversized active memtable that no write has
            // pushed over the edge recently.
            let needs_freeze = {
                let active = self.tree.state.active_memtable.read().unwrap();
                let limit = self.tree.state.mutable.read().unwrap().write_buffer_size;
                active.size() >= limit
            };
            if needs_freeze {
                self.tree.freeze_active_memtable()?;
            }

            self.tree.flush_memtable().await.map(|_| ())
        }
        .await;
        run_outcome(&self.tree, self.name(), result)
    }
}

pub struct CompactionTask {
    tree: Arc<LsmTree>,
}

impl CompactionTask {
    pub fn new(tree: Arc<LsmTree>) -> Self {
        Self { tree }
    }
}

#[async_trait]
impl BackgroundTask for CompactionTask {
    fn name(&self) -> &'static str {
        "compaction"
    }

    fn interval(&self) -> Duration {
        self.tree.config.options.compaction_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        if !self.tree.needs_compaction() {
            return Ok(());
        }
        let result = self.tree.compact().await;
        run_outcome(&self.tree, self.name(), result)
    }
}

pub struct WalCleanupTask {
    tree: Arc<LsmTree>,
}

impl WalCleanupTask {
    pub fn new(tree: Arc<LsmTree>) -> Self {
        Self { tree }
    }
}

#[async_trait]
impl BackgroundTask for WalCleanupTask {
    fn name(&self) -> &'static str {
        "wal-cleanup"
    }

    fn interval(&self) -> Duration {
        self.tree.config.options.wal_cleanup_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        let result = self.tree.cleanup_wals().await;
        run_outcome(&self.tree, self.name(), result)
    }
}

pub struct MetricsTask {
    tree: Arc<LsmTree>,
}

impl MetricsTask {
    pub fn new(tree: Arc<LsmTree>) -> Self {
        Self { tree }
    }
}

#[async_trait]
impl BackgroundTask for MetricsTask {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn interval(&self) -> Duration {
        self.tree.config.options.metrics_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        self.tree.collect_metrics()
    }
}
