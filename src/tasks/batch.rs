//! Batch task processing: loops dequeue -> handler -> complete/fail, up to
//! `batch_size` tasks or `timeout_s` elapsed. The timeout is only checked
//! between tasks, never mid-task.

use super::{Task, TaskQueue};
use crate::errors::FabricResult;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::warn;

/// A caller-registered handler for one task `kind`.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<Value, String>;
}

#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub processed: usize,
    pub completed: usize,
    pub failed: usize,
    pub retried: usize,
}

/// Drain up to `batch_size` eligible tasks for `agent`, dispatching each
/// to the handler registered for its `kind`. A task whose kind has no
/// registered handler fails immediately with no retry, since there is no
/// way the task could ever succeed without one.
pub async fn process_batch(
    queue: &TaskQueue,
    agent: &str,
    handlers: &HashMap<String, Box<dyn TaskHandler>>,
    batch_size: usize,
    kinds: Option<&[String]>,
    timeout: Duration,
) -> FabricResult<BatchOutcome> {
    let deadline = Instant::now() + timeout;
    let mut outcome = BatchOutcome::default();

    while outcome.processed < batch_size && Instant::now() < deadline {
        let task = match queue.dequeue(agent, kinds).await? {
            Some(t) => t,
            None => break,
        };
        outcome.processed += 1;

        let started = Instant::now();
        match handlers.get(&task.kind) {
            None => {
                warn!(task_id = %task.task_id, kind = %task.kind, "no handler registered, failing permanently");
                queue
                    .fail(task.task_id, &format!("no handler registered for kind '{}'", task.kind), false)
                    .await?;
                outcome.failed += 1;
            }
            Some(handler) => match handler.handle(&task).await {
                Ok(result) => {
                    let processing_ms = started.elapsed().as_millis() as i64;
                    queue.complete(task.task_id, result, Some(processing_ms)).await?;
                    outcome.completed += 1;
                }
                Err(err) => {
                    let will_retry = queue.fail(task.task_id, &err, true).await?;
                    if will_retry {
                        outcome.retried += 1;
                    } else {
                        outcome.failed += 1;
                    }
                }
            },
        }
    }

    Ok(outcome)
}
