use crate::backoff::BackoffPolicy;
use crate::jobs::JobQueue;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryStatus {
    Pending,
    Retried,
    Abandoned,
}

/// Persisted description of a failed background job: what ran, why it
/// failed, and when it may run again.
#[derive(Debug, Clone, Serialize)]
pub struct RetryRecord {
    pub id: Uuid,
    pub queue: String,
    pub job_id: Uuid,
    pub job_name: String,
    pub job_input: Value,
    pub last_error: String,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub can_retry: bool,
    pub retry_after: DateTime<Utc>,
    pub status: RetryStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryStats {
    pub total: usize,
    pub pending: usize,
    pub retried: usize,
    pub abandoned: usize,
    pub queues: BTreeMap<String, QueueStats>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub retried: usize,
    pub abandoned: usize,
}

#[derive(Clone)]
pub struct RecoveryService {
    records: Arc<Mutex<HashMap<Uuid, RetryRecord>>>,
    policy: BackoffPolicy,
    max_attempts: u32,
}

impl RecoveryService {
    pub fn new(policy: BackoffPolicy, max_attempts: u32) -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            policy,
            max_attempts,
        }
    }

    pub fn from_env() -> Self {
        let max_attempts = std::env::var("RETRY_MAX_ATTEMPTS")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(5);
        Self::new(BackoffPolicy::from_env(), max_attempts)
    }

    /// Upsert keyed on (queue, job id): the first failure inserts the
    /// record, later failures of the same job bump the attempt counter
    /// and push the backoff window out. A record whose attempts reach
    /// the ceiling flips to ABANDONED and leaves the retry rotation.
    pub async fn record_failure(
        &self,
        queue: &str,
        job_id: Uuid,
        job_name: &str,
        job_input: Value,
        error: &str,
    ) -> RetryRecord {
        let now = Utc::now();
        let mut guard = self.records.lock().await;
        let existing = guard
            .values()
            .find(|record| record.queue == queue && record.job_id == job_id)
            .map(|record| record.id);

        let record = match existing {
            Some(id) => {
                let record = guard.get_mut(&id).expect("record present under lock");
                record.attempts_made += 1;
                record.last_error = error.to_string();
                record.can_retry = record.attempts_made < record.max_attempts;
                record.retry_after = now + self.policy.delay_for(record.attempts_made);
                record.status = if record.can_retry {
                    RetryStatus::Pending
                } else {
                    RetryStatus::Abandoned
                };
                record.clone()
            }
            None => {
                let attempts_made = 1;
                let can_retry = attempts_made < self.max_attempts;
                let record = RetryRecord {
                    id: Uuid::new_v4(),
                    queue: queue.to_string(),
                    job_id,
                    job_name: job_name.to_string(),
                    job_input,
                    last_error: error.to_string(),
                    attempts_made,
                    max_attempts: self.max_attempts,
                    can_retry,
                    retry_after: now + self.policy.delay_for(attempts_made),
                    status: if can_retry {
                        RetryStatus::Pending
                    } else {
                        RetryStatus::Abandoned
                    },
                    created_at: now,
                };
                guard.insert(record.id, record.clone());
                record
            }
        };

        if record.status == RetryStatus::Abandoned {
            warn!(
                target = "portside.recovery",
                queue = queue,
                job_id = %job_id,
                attempts = record.attempts_made,
                "retries exhausted, job abandoned"
            );
        }
        record
    }

    /// Records eligible for another attempt, oldest first.
    pub async fn retryable_jobs(&self, limit: usize) -> Vec<RetryRecord> {
        let now = Utc::now();
        let guard = self.records.lock().await;
        let mut eligible: Vec<RetryRecord> = guard
            .values()
            .filter(|record| {
                record.status == RetryStatus::Pending
                    && record.can_retry
                    && record.retry_after <= now
            })
            .cloned()
            .collect();
        eligible.sort_by_key(|record| (record.created_at, record.id));
        eligible.truncate(limit);
        eligible
    }

    /// Re-enqueue eligible records. The claim (status flip to RETRIED)
    /// happens under the ledger lock before anything is handed to the
    /// queue, so overlapping sweeps cannot re-enqueue the same record
    /// twice. A record the queue refuses goes back to PENDING.
    pub async fn recover(&self, queue: &JobQueue) -> usize {
        let candidates = self.retryable_jobs(recover_batch_from_env()).await;
        let claimed = {
            let mut guard = self.records.lock().await;
            let mut claimed = Vec::with_capacity(candidates.len());
            for candidate in candidates {
                // Re-check under the lock: a concurrent sweep may have
                // claimed the record since the query.
                if let Some(record) = guard.get_mut(&candidate.id)
                    && record.status == RetryStatus::Pending
                {
                    record.status = RetryStatus::Retried;
                    claimed.push(record.clone());
                }
            }
            claimed
        };

        let mut enqueued = 0;
        for record in claimed {
            match queue.enqueue_retry(&record).await {
                Ok(()) => {
                    info!(
                        target = "portside.recovery",
                        queue = %record.queue,
                        job_id = %record.job_id,
                        attempt = record.attempts_made + 1,
                        "re-enqueued failed job"
                    );
                    enqueued += 1;
                }
                Err(err) => {
                    warn!(
                        target = "portside.recovery",
                        queue = %record.queue,
                        job_id = %record.job_id,
                        error = %err,
                        "re-enqueue refused, returning record to pending"
                    );
                    let mut guard = self.records.lock().await;
                    if let Some(stored) = guard.get_mut(&record.id) {
                        stored.status = RetryStatus::Pending;
                    }
                }
            }
        }
        crate::metrics::recovery_swept(enqueued);
        enqueued
    }

    pub async fn stats(&self) -> RecoveryStats {
        let guard = self.records.lock().await;
        let mut stats = RecoveryStats {
            total: guard.len(),
            pending: 0,
            retried: 0,
            abandoned: 0,
            queues: BTreeMap::new(),
        };
        for record in guard.values() {
            let queue = stats.queues.entry(record.queue.clone()).or_default();
            match record.status {
                RetryStatus::Pending => {
                    stats.pending += 1;
                    queue.pending += 1;
                }
                RetryStatus::Retried => {
                    stats.retried += 1;
                    queue.retried += 1;
                }
                RetryStatus::Abandoned => {
                    stats.abandoned += 1;
                    queue.abandoned += 1;
                }
            }
        }
        stats
    }

    /// Retention sweep. ABANDONED records survive until an operator has
    /// dealt with them; everything else older than the threshold goes.
    pub async fn cleanup_old_records(&self, older_than_days: i64) -> usize {
        let cutoff = Utc::now() - Duration::days(older_than_days);
        let mut guard = self.records.lock().await;
        let before = guard.len();
        guard.retain(|_, record| {
            record.status == RetryStatus::Abandoned || record.created_at >= cutoff
        });
        before - guard.len()
    }
}

fn recover_batch_from_env() -> usize {
    std::env::var("RECOVER_BATCH_SIZE")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(25)
}
