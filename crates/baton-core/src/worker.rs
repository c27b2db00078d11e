use std::sync::Arc;

use baton_types::RunRequest;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use crate::runner::{RunError, RunExecutor, RunReport};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("worker queue is full")]
    Full,
    #[error("worker queue is closed")]
    Closed,
}

#[derive(Debug)]
pub struct RunCompletion {
    pub run_id: String,
    pub result: Result<RunReport, RunError>,
}

/// Background consumer of enqueued runs. Each run gets its own task tree;
/// at most `max_concurrent` execute at once.
pub struct Worker;

impl Worker {
    pub fn spawn(
        executor: Arc<RunExecutor>,
        queue_capacity: usize,
        max_concurrent: usize,
    ) -> WorkerHandle {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let limit = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let consumer = tokio::spawn(consume(executor, rx, limit));
        WorkerHandle { tx, consumer }
    }
}

pub struct WorkerHandle {
    tx: mpsc::Sender<RunRequest>,
    consumer: JoinHandle<Vec<RunCompletion>>,
}

impl WorkerHandle {
    /// Fire-and-forget: returns once the request is queued.
    pub fn enqueue(&self, request: RunRequest) -> Result<(), QueueError> {
        let run_id = request.run_id.clone();
        self.tx.try_send(request).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => QueueError::Full,
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })?;
        tracing::debug!(run_id = %run_id, "run enqueued");
        Ok(())
    }

    /// Stops accepting work and waits for queued and in-flight runs.
    pub async fn shutdown(self) -> Vec<RunCompletion> {
        drop(self.tx);
        match self.consumer.await {
            Ok(completions) => completions,
            Err(err) => {
                tracing::error!(error = %err, "worker consumer task failed");
                Vec::new()
            }
        }
    }
}

async fn consume(
    executor: Arc<RunExecutor>,
    mut rx: mpsc::Receiver<RunRequest>,
    limit: Arc<Semaphore>,
) -> Vec<RunCompletion> {
    let mut runs = JoinSet::new();
    let mut completions = Vec::new();
    loop {
        tokio::select! {
            request = rx.recv() => {
                let Some(request) = request else { break };
                let Ok(permit) = limit.clone().acquire_owned().await else { break };
                let executor = executor.clone();
                runs.spawn(async move {
                    let _permit = permit;
                    let run_id = request.run_id.clone();
                    let result = executor.execute(request).await;
                    RunCompletion { run_id, result }
                });
            }
            Some(joined) = runs.join_next(), if !runs.is_empty() => {
                record(&mut completions, joined);
            }
        }
    }
    while let Some(joined) = runs.join_next().await {
        record(&mut completions, joined);
    }
    completions
}

fn record(
    completions: &mut Vec<RunCompletion>,
    joined: Result<RunCompletion, tokio::task::JoinError>,
) {
    match joined {
        Ok(completion) => {
            if let Err(err) = &completion.result {
                tracing::error!(run_id = %completion.run_id, error = %err, "run could not start");
            }
            completions.push(completion);
        }
        Err(err) => tracing::error!(error = %err, "run task aborted"),
    }
}
