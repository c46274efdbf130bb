//! Task ingestion queue and retry path.

use tokio::sync::mpsc;

use crate::dispatch::task::{Task, TaskState};
use crate::error::DispatchError;
use crate::lifecycle::ShutdownSignal;
use crate::observability::metrics;
use crate::resilience::retries::{decide, RetryDecision, RetryState};

/// Sending side of the dispatcher's single queue. Cloned into workers so a
/// failed task can be re-enqueued without a reference to the dispatcher.
#[derive(Debug, Clone)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<Task>,
    max_retries: u32,
    shutdown: ShutdownSignal,
}

impl TaskQueue {
    pub fn new(max_retries: u32, shutdown: ShutdownSignal) -> (Self, mpsc::UnboundedReceiver<Task>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                max_retries,
                shutdown,
            },
            rx,
        )
    }

    pub fn push(&self, task: Task) -> Result<(), DispatchError> {
        if self.shutdown.is_triggered() {
            task.fail(DispatchError::ShuttingDown);
            return Err(DispatchError::ShuttingDown);
        }
        if let Err(mpsc::error::SendError(task)) = self.tx.send(task) {
            task.fail(DispatchError::ShuttingDown);
            return Err(DispatchError::ShuttingDown);
        }
        Ok(())
    }

    /// Re-enqueue a task that failed before its response was delivered, or
    /// fail it terminally.
    pub fn retry(&self, mut task: Task, reason: &str) {
        let state = RetryState {
            delivered: task.is_delivered(),
            retry_count: task.retry_count,
            elapsed: task.elapsed(),
            timeout: task.timeout,
            running: !self.shutdown.is_triggered(),
        };

        match decide(state, self.max_retries) {
            RetryDecision::Retry => {
                task.retry_count += 1;
                task.set_state(TaskState::Retrying, reason);
                metrics::record_retry();
                tracing::debug!(
                    task_id = %task.id,
                    retry = task.retry_count,
                    reason,
                    "Task re-enqueued"
                );
                let _ = self.push(task);
            }
            RetryDecision::Fail(why) => {
                metrics::record_task("retry_exhausted", task.elapsed());
                task.fail(DispatchError::RetryExhausted(format!("{reason}: {why}")));
            }
        }
    }
}
