//! Task supervision for the agent's long-lived loops.
//!
//! Every monitoring loop runs as a named task inside one `TaskGroup`:
//! - all tasks share a single cancellation scope
//! - the first task failure cancels the scope and becomes the group result
//! - remaining tasks observe the cancellation and unwind cooperatively
//!
//! There are no restarts. Any failure ends the process and the init system
//! restarts the agent from scratch.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Handle that cancels the group's shared scope.
///
/// Cloning is cheap; calling `cancel` more than once is a no-op.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Cancel the scope.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// A task's view of the shared cancellation scope.
#[derive(Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// Whether the scope has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the scope is cancelled.
    ///
    /// Also completes when the owning group is gone, so loops selecting on
    /// this never outlive their supervisor.
    pub async fn cancelled(&mut self) {
        let _ = self.rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// A fixed set of supervised tasks under one cancellation scope.
///
/// Tasks are registered before `run` and cannot be added afterwards: `run`
/// consumes the group.
pub struct TaskGroup {
    cancel_tx: Arc<watch::Sender<bool>>,
    tasks: Vec<(&'static str, TaskFuture)>,
}

impl TaskGroup {
    /// Create an empty group with a fresh cancellation scope.
    pub fn new() -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            cancel_tx: Arc::new(cancel_tx),
            tasks: Vec::new(),
        }
    }

    /// Handle for cancelling the group from outside (signal handlers).
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: Arc::clone(&self.cancel_tx),
        }
    }

    /// A new subscription to the group's cancellation scope.
    pub fn cancel_signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.cancel_tx.subscribe(),
        }
    }

    /// Register a named task.
    ///
    /// The closure receives the group's cancellation signal and must yield
    /// promptly once it fires.
    pub fn register<F, Fut>(&mut self, name: &'static str, task: F)
    where
        F: FnOnce(CancelSignal) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let signal = self.cancel_signal();
        self.tasks.push((name, Box::pin(task(signal))));
    }

    /// Run every registered task to completion.
    ///
    /// Returns `Ok` when all tasks finish cleanly. On the first failure the
    /// scope is cancelled, the remaining tasks are drained, and that first
    /// error is returned; later failures are logged and discarded. "First"
    /// means first observed here, not necessarily the first task to fail on
    /// the clock. A panic inside a task counts as a failure.
    pub async fn run(self) -> Result<()> {
        if self.tasks.is_empty() {
            debug!("no tasks registered");
            return Ok(());
        }

        let cancel = CancelHandle {
            tx: Arc::clone(&self.cancel_tx),
        };

        let mut set = JoinSet::new();
        for (name, task) in self.tasks {
            set.spawn(async move { (name, task.await) });
        }

        let mut first_error: Option<anyhow::Error> = None;

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((name, Ok(()))) => {
                    debug!(task = name, "task finished");
                }
                Ok((name, Err(e))) => {
                    if first_error.is_none() {
                        error!(task = name, error = %e, "task failed, stopping agent");
                        first_error = Some(e);
                        cancel.cancel();
                    } else {
                        debug!(task = name, error = %e, "task failed during shutdown");
                    }
                }
                Err(join_err) => {
                    if first_error.is_none() {
                        error!(error = %join_err, "task panicked, stopping agent");
                        first_error = Some(anyhow::Error::new(join_err).context("task panicked"));
                        cancel.cancel();
                    } else {
                        debug!(error = %join_err, "task panicked during shutdown");
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("all tasks finished");
                Ok(())
            }
        }
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}
