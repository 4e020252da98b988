//! Background task lifecycle management.
//!
//! The consumer runs one coordinator loop, one heartbeat loop and one reader
//! task per held shard. This registry gives them a shared shutdown signal and
//! a single place to await or abort the lot, instead of scattering
//! `JoinHandle`s across components.
//!
//! Shutdown is cooperative: the broadcast signal stops tasks at their next
//! suspension point; tasks that ignore it past the timeout are aborted.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Central registry for named background tasks.
pub struct TaskRegistry {
    tasks: HashMap<String, JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
    shutting_down: bool,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: HashMap::new(),
            shutdown_tx,
            shutting_down: false,
        }
    }

    /// Subscribe to the shutdown signal. Tasks doing their own `select!` use
    /// this; plain tasks can rely on the registry-level select in [`spawn`].
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Spawn a named task that ends at the shutdown signal or on its own
    /// completion, whichever comes first. Re-using a name aborts the previous
    /// instance.
    pub fn spawn<F>(&mut self, name: impl Into<String>, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        if self.shutting_down {
            tracing::warn!(task = %name, "Ignoring spawn during shutdown");
            return;
        }
        if let Some(old) = self.tasks.remove(&name) {
            old.abort();
            tracing::debug!(task = %name, "Aborted previous task instance");
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = task => {
                    tracing::debug!(task = %task_name, "Task completed");
                }
                _ = shutdown_rx.recv() => {
                    tracing::debug!(task = %task_name, "Task received shutdown signal");
                }
            }
        });
        self.tasks.insert(name, handle);
    }

    /// Drop finished tasks from the registry; returns the number still live.
    pub fn prune_finished(&mut self) -> usize {
        self.tasks.retain(|_, handle| !handle.is_finished());
        self.tasks.len()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Send the shutdown signal and wait for tasks to drain, aborting
    /// stragglers after `timeout`.
    pub async fn shutdown_all(&mut self, timeout: Duration) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        tracing::info!(task_count = self.tasks.len(), "Shutting down background tasks");
        let _ = self.shutdown_tx.send(());

        let deadline = tokio::time::Instant::now() + timeout;
        for (name, handle) in self.tasks.drain() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                tracing::warn!(task = %name, "Aborting task (shutdown timeout exceeded)");
                handle.abort();
                continue;
            }
            match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(())) => tracing::debug!(task = %name, "Task shutdown complete"),
                Ok(Err(e)) if e.is_panic() => {
                    tracing::warn!(task = %name, error = %e, "Task panicked during shutdown");
                }
                Ok(Err(_)) => {}
                Err(_) => tracing::warn!(task = %name, "Aborting task (shutdown timeout exceeded)"),
            }
        }
    }
}
