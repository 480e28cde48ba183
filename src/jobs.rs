use crate::collab::{Collaborators, JobKind, entity_ref};
use crate::idempotency::{IdempotencyLedger, operation_key};
use crate::recovery::{RecoveryService, RetryRecord};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{info, warn};
use uuid::Uuid;

/// Bounded worker pools, one per job kind, so a slow collaborator only
/// stalls its own queue. Enqueue is fire-and-forget from the caller's
/// perspective; failures land in the recovery ledger, not with the
/// caller.
#[derive(Clone)]
pub struct JobQueue {
    senders: HashMap<JobKind, mpsc::Sender<Job>>,
    statuses: Arc<Mutex<HashMap<Uuid, JobState>>>,
}

#[derive(Clone)]
struct Job {
    id: Uuid,
    kind: JobKind,
    input: Value,
}

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed { result: Value },
    Skipped { key: String },
    Failed { error: String },
}

#[derive(Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    #[serde(flatten)]
    pub state: JobState,
}

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("worker pool for `{0}` is unavailable")]
    QueueClosed(String),
    #[error("unknown queue `{0}`")]
    UnknownQueue(String),
}

impl JobQueue {
    pub fn spawn(
        collab: Arc<Collaborators>,
        ledger: IdempotencyLedger,
        recovery: RecoveryService,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let statuses = Arc::new(Mutex::new(HashMap::new()));
        let mut senders = HashMap::new();
        let mut handles = Vec::new();

        for kind in JobKind::ALL {
            let (tx, rx) = mpsc::channel::<Job>(queue_capacity_from_env());
            let rx = Arc::new(Mutex::new(rx));
            for _ in 0..workers_per_kind_from_env() {
                handles.push(tokio::spawn(worker_loop(
                    rx.clone(),
                    collab.clone(),
                    ledger.clone(),
                    recovery.clone(),
                    statuses.clone(),
                )));
            }
            senders.insert(kind, tx);
        }

        (Self { senders, statuses }, handles)
    }

    pub async fn enqueue(&self, kind: JobKind, input: Value) -> Result<Uuid, EnqueueError> {
        let id = Uuid::new_v4();
        self.submit(Job { id, kind, input }).await?;
        Ok(id)
    }

    /// Re-enqueue a recovered job under its original id and input.
    pub async fn enqueue_retry(&self, record: &RetryRecord) -> Result<(), EnqueueError> {
        let kind = JobKind::from_queue(&record.queue)
            .ok_or_else(|| EnqueueError::UnknownQueue(record.queue.clone()))?;
        self.submit(Job {
            id: record.job_id,
            kind,
            input: record.job_input.clone(),
        })
        .await
    }

    async fn submit(&self, job: Job) -> Result<(), EnqueueError> {
        let sender = self
            .senders
            .get(&job.kind)
            .ok_or_else(|| EnqueueError::UnknownQueue(job.kind.queue_name().to_string()))?;
        {
            let mut guard = self.statuses.lock().await;
            guard.insert(job.id, JobState::Queued);
        }
        sender
            .send(job)
            .await
            .map_err(|err| EnqueueError::QueueClosed(err.0.kind.queue_name().to_string()))
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        let guard = self.statuses.lock().await;
        guard.get(&id).cloned().map(|state| JobInfo {
            id: id.to_string(),
            state,
        })
    }
}

async fn worker_loop(
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    collab: Arc<Collaborators>,
    ledger: IdempotencyLedger,
    recovery: RecoveryService,
    statuses: Arc<Mutex<HashMap<Uuid, JobState>>>,
) {
    loop {
        let job = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };
        let Some(job) = job else { break };
        {
            let mut guard = statuses.lock().await;
            guard.insert(job.id, JobState::Running);
        }

        // The ledger gate: check before the side effect, record only
        // after it is confirmed. A crash in between costs at most one
        // duplicate, never an unrecorded success.
        let key = operation_key(job.kind.queue_name(), &entity_ref(&job.input), Utc::now());
        if ledger.exists(&key).await {
            info!(
                target = "portside.jobs",
                job_id = %job.id,
                queue = job.kind.queue_name(),
                key = %key,
                "side effect already recorded, skipping"
            );
            crate::metrics::job_finished(job.kind.queue_name(), "skipped");
            let mut guard = statuses.lock().await;
            guard.insert(job.id, JobState::Skipped { key });
            continue;
        }

        match collab.run(job.kind, &job.input).await {
            Ok(result) => {
                ledger.record(&key, result.clone()).await;
                crate::metrics::job_finished(job.kind.queue_name(), "completed");
                let mut guard = statuses.lock().await;
                guard.insert(job.id, JobState::Completed { result });
            }
            Err(err) => {
                warn!(
                    target = "portside.jobs",
                    job_id = %job.id,
                    queue = job.kind.queue_name(),
                    error = %err,
                    "job failed, recording for recovery"
                );
                recovery
                    .record_failure(
                        job.kind.queue_name(),
                        job.id,
                        job.kind.job_name(),
                        job.input.clone(),
                        &err.to_string(),
                    )
                    .await;
                crate::metrics::job_finished(job.kind.queue_name(), "failed");
                let mut guard = statuses.lock().await;
                guard.insert(
                    job.id,
                    JobState::Failed {
                        error: err.to_string(),
                    },
                );
            }
        }
    }
}

fn queue_capacity_from_env() -> usize {
    std::env::var("QUEUE_CAPACITY")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(64)
}

fn workers_per_kind_from_env() -> usize {
    std::env::var("JOB_WORKERS")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffPolicy;
    use crate::collab::CollabConfig;
    use serde_json::json;
    use tokio::time::{Duration, sleep};

    fn demo_queue() -> (JobQueue, IdempotencyLedger, RecoveryService) {
        let collab = Arc::new(Collaborators::new(CollabConfig {
            publish_url: None,
            publish_network_enabled: false,
        }));
        let ledger = IdempotencyLedger::in_memory();
        let recovery = RecoveryService::new(BackoffPolicy::immediate(), 3);
        let (queue, _workers) = JobQueue::spawn(collab, ledger.clone(), recovery.clone());
        (queue, ledger, recovery)
    }

    async fn wait_terminal(queue: &JobQueue, id: Uuid) -> JobState {
        for _ in 0..200 {
            if let Some(info) = queue.get(id).await {
                match info.state {
                    JobState::Queued | JobState::Running => {}
                    state => return state,
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never reached a terminal state");
    }

    #[tokio::test]
    async fn job_completes_and_is_queryable() {
        let (queue, _, _) = demo_queue();
        let id = queue
            .enqueue(JobKind::Translate, json!({"product_id": 311}))
            .await
            .expect("enqueue");
        let state = wait_terminal(&queue, id).await;
        assert!(matches!(state, JobState::Completed { .. }));
    }

    #[tokio::test]
    async fn second_run_of_the_same_logical_operation_is_skipped() {
        let (queue, ledger, _) = demo_queue();
        let input = json!({"product_id": 42});

        let first = queue
            .enqueue(JobKind::Publish, input.clone())
            .await
            .expect("enqueue");
        assert!(matches!(
            wait_terminal(&queue, first).await,
            JobState::Completed { .. }
        ));
        let key = operation_key("publish", &entity_ref(&input), Utc::now());
        assert!(ledger.exists(&key).await);

        let second = queue
            .enqueue(JobKind::Publish, input)
            .await
            .expect("enqueue");
        assert!(matches!(
            wait_terminal(&queue, second).await,
            JobState::Skipped { .. }
        ));
    }

    #[tokio::test]
    async fn failed_job_lands_in_the_recovery_ledger() {
        let collab = Arc::new(Collaborators::new(CollabConfig {
            publish_url: Some("http://127.0.0.1:9/publish".into()),
            publish_network_enabled: true,
        }));
        let ledger = IdempotencyLedger::in_memory();
        let recovery = RecoveryService::new(BackoffPolicy::immediate(), 3);
        let (queue, _workers) = JobQueue::spawn(collab, ledger, recovery.clone());

        let id = queue
            .enqueue(JobKind::Publish, json!({"product_id": 7}))
            .await
            .expect("enqueue");
        assert!(matches!(
            wait_terminal(&queue, id).await,
            JobState::Failed { .. }
        ));

        let retryable = recovery.retryable_jobs(10).await;
        assert_eq!(retryable.len(), 1);
        assert_eq!(retryable[0].job_id, id);
        assert_eq!(retryable[0].queue, "publish");
        assert_eq!(retryable[0].attempts_made, 1);
    }
}
