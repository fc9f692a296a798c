use std::future::Future;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Task manager, responsible for the long-running background tasks
pub struct Tasks {
    names: Vec<&'static str>,
    tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            names: Vec::new(),
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Token cancelled on shutdown; every task should observe it.
    pub fn token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Track an already spawned task
    pub fn push(&mut self, name: &'static str, task: JoinHandle<()>) {
        self.names.push(name);
        self.tasks.push(task);
    }

    pub fn spawn<F>(&mut self, name: &'static str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.push(name, tokio::spawn(future));
    }

    /// wait for a shutdown signal, failing if any task completes first
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        // Set up signal handling for graceful shutdown
        let signal_handler = {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;

            async move {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, initiating graceful shutdown");
                    }
                    _ = sigint.recv() => {
                        tracing::info!("Received SIGINT, initiating graceful shutdown");
                    }
                }
            }
        };

        self.wait_for_completion_or(signal_handler).await
    }

    async fn wait_for_completion_or(&mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        if self.tasks.is_empty() {
            shutdown.await;
            return Ok(());
        }

        tokio::select! {
            // Wait for shutdown signal
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            // Wait for any task to complete unexpectedly
            result = futures::future::select_all(&mut self.tasks) => {
                let (result, index, remaining) = result;
                drop(remaining);
                let name = self.names[index];
                // a finished handle must not be awaited again during shutdown
                self.names.remove(index);
                self.tasks.remove(index);
                match result {
                    Err(e) => {
                        tracing::error!("Task {name} completed with error: {e}");
                        Err(anyhow!("task {name} failed: {e}"))
                    }
                    Ok(()) => {
                        tracing::error!("Task {name} completed unexpectedly");
                        Err(anyhow!("task {name} completed unexpectedly"))
                    }
                }
            }
        }
    }

    /// Cancel every task and wait for them, at most `timeout`
    pub async fn shutdown(mut self, timeout: Duration) {
        tracing::info!("Cancelling all tasks");
        self.cancellation_token.cancel();
        self.wait_for_tasks_with_timeout(timeout).await;
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        let names = &self.names;
        let tasks = &mut self.tasks;
        tokio::time::timeout(timeout, async {
            for (name, task) in names.iter().zip(tasks.iter_mut()) {
                if let Err(e) = task.await {
                    tracing::error!("Task {name} failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use tokio::sync::oneshot;

    use super::*;

    #[tokio::test]
    async fn shutdown_signal_cancels_tasks() {
        let mut tasks = Tasks::new();
        let stopped = Arc::new(AtomicBool::new(false));
        let token = tasks.token();
        let flag = Arc::clone(&stopped);
        tasks.spawn("worker", async move {
            token.cancelled().await;
            flag.store(true, Ordering::SeqCst);
        });

        let (signal_tx, signal_rx) = oneshot::channel::<()>();
        signal_tx.send(()).expect("should send shutdown signal");
        tasks
            .wait_for_completion_or(async {
                let _ = signal_rx.await;
            })
            .await
            .expect("signal is a clean shutdown");

        tasks.shutdown(Duration::from_secs(1)).await;
        assert!(stopped.load(Ordering::SeqCst), "worker should observe cancellation");
    }

    #[tokio::test]
    async fn early_task_exit_is_an_error() {
        let mut tasks = Tasks::new();
        let token = tasks.token();
        tasks.spawn("long", async move { token.cancelled().await });
        tasks.spawn("short", async {});

        let err = tasks
            .wait_for_completion_or(std::future::pending())
            .await
            .expect_err("short task exits early");
        assert!(err.to_string().contains("short"), "{err}");

        tasks.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn shutdown_is_bounded() {
        let mut tasks = Tasks::new();
        tasks.spawn("stuck", std::future::pending());

        let started = tokio::time::Instant::now();
        tasks.shutdown(Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
