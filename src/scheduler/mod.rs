//! Periodic background task scheduler with graceful shutdown and failure
//! backoff.
//!
//! Tasks implement [`BackgroundTask`] and run on their own tokio timer
//! loop. A task that fails is retried on the next tick with an
//! exponentially growing delay (capped at eight intervals), so a stuck
//! disk does not busy-loop the scheduler; one success resets the backoff.
//! Shutdown broadcasts to every loop and joins them, guaranteeing no task
//! outlives the scheduler.

use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::Result;

/// Maximum backoff multiplier after repeated failures.
const MAX_BACKOFF_FACTOR: u32 = 8;

/// Context provided to background tasks during execution.
pub struct Context {
    pub task_name: &'static str,
    pub run_id: u64,
    pub shutdown: broadcast::Receiver<()>,
}

/// A task that runs periodically until shutdown.
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging.
    fn name(&self) -> &'static str;

    /// How often to run this task.
    fn interval(&self) -> Duration;

    /// Execute the task.
    async fn execute(&self, ctx: Context) -> Result<()>;
}

/// Owns the timer loops and shuts them down together.
pub struct Scheduler {
    tasks: RwLock<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: RwLock::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Registers a periodic background task.
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> &Self {
        let handle = self.spawn_timer_loop(task);
        self.tasks.write().unwrap().push(handle);
        self
    }

    /// Spawns a one-off task.
    pub fn spawn<F>(&self, f: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        tokio::spawn(async move {
            if let Err(e) = f.await {
                tracing::error!(error = %e, "One-off task failed");
            }
        });
    }

    fn spawn_timer_loop<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> JoinHandle<()> {
        let interval = task.interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut run_id = 0u64;
        let mut consecutive_failures = 0u32;

        tokio::spawn(async move {
            loop {
                let backoff_factor =
                    2u32.saturating_pow(consecutive_failures).min(MAX_BACKOFF_FACTOR);
                let delay = interval * backoff_factor;

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        run_id += 1;
                        let ctx = Context {
                            task_name: task.name(),
                            run_id,
                            shutdown: shutdown_rx.resubscribe(),
                        };

                        match task.execute(ctx).await {
                            Ok(()) => {
                                consecutive_failures = 0;
                            }
                            Err(e) => {
                                consecutive_failures = consecutive_failures.saturating_add(1);
                                tracing::error!(
                                    task = task.name(),
                                    error = %e,
                                    failures = consecutive_failures,
                                    "Task execution failed, backing off"
                                );
                            }
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        tracing::info!(task = task.name(), "Task shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Graceful shutdown: signal every loop and wait for it to finish.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown_tx.send(()).ok();

        let handles: Vec<JoinHandle<()>> = self.tasks.write().unwrap().drain(..).collect();
        for task in handles {
            task.await
                .map_err(|e| crate::error::Error::InvalidState(format!("task join error: {}", e)))?;
        }

        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
