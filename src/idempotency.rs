use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Deterministic, deliberately coarse key: operation kind + entity id +
/// UTC hour bucket. Two independently generated requests for the same
/// logical operation in the same window collide on purpose.
pub fn operation_key(operation: &str, entity_id: &str, at: DateTime<Utc>) -> String {
    format!("{operation}:{entity_id}:{}", at.format("%Y%m%d%H"))
}

/// Check/record store consulted before any externally visible side
/// effect. Backed by an in-process map, with Redis layered in when
/// `REDIS_URL` is configured so restarts keep the ledger.
#[derive(Clone)]
pub struct IdempotencyLedger {
    entries: Arc<Mutex<HashMap<String, LedgerEntry>>>,
    redis: Option<redis::Client>,
    ttl_secs: u64,
}

#[derive(Clone)]
struct LedgerEntry {
    result: Value,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
}

impl IdempotencyLedger {
    pub fn from_env() -> Self {
        let redis = std::env::var("REDIS_URL")
            .ok()
            .and_then(|url| redis::Client::open(url).ok());
        let ttl_secs = std::env::var("IDEMPOTENCY_TTL_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(86_400);
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            redis,
            ttl_secs,
        }
    }

    pub fn in_memory() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            redis: None,
            ttl_secs: 86_400,
        }
    }

    /// A hit means "already executed"; callers skip the side effect and
    /// reuse the stored result.
    pub async fn exists(&self, key: &str) -> bool {
        if let Some(client) = &self.redis
            && redis_get(client, key).await.is_some()
        {
            return true;
        }
        let guard = self.entries.lock().await;
        guard.contains_key(key)
    }

    pub async fn recorded_result(&self, key: &str) -> Option<Value> {
        if let Some(client) = &self.redis
            && let Some(value) = redis_get(client, key).await
        {
            return Some(value);
        }
        let guard = self.entries.lock().await;
        guard.get(key).map(|entry| entry.result.clone())
    }

    /// Upsert: create if absent, overwrite if a concurrent retry raced
    /// and lost. Called only after the side effect is confirmed.
    pub async fn record(&self, key: &str, result: Value) {
        {
            let mut guard = self.entries.lock().await;
            guard.insert(
                key.to_string(),
                LedgerEntry {
                    result: result.clone(),
                    created_at: Utc::now(),
                },
            );
        }
        if let Some(client) = &self.redis {
            redis_set(client, key, &result, self.ttl_secs).await;
        }
    }
}

async fn redis_get(client: &redis::Client, key: &str) -> Option<Value> {
    let mut conn = match client.get_multiplexed_async_connection().await {
        Ok(conn) => conn,
        Err(_) => return None,
    };
    let stored: Option<String> = conn.get(key).await.ok();
    stored.and_then(|value| serde_json::from_str(&value).ok())
}

async fn redis_set(client: &redis::Client, key: &str, value: &Value, ttl_secs: u64) {
    if let Ok(mut conn) = client.get_multiplexed_async_connection().await
        && let Ok(json) = serde_json::to_string(value)
    {
        let _: Result<(), _> = conn.set_ex(key, json, ttl_secs).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_collide_within_the_same_hour_bucket() {
        let first = Utc::now()
            .date_naive()
            .and_hms_opt(9, 5, 0)
            .unwrap()
            .and_utc();
        let second = first + chrono::Duration::minutes(40);
        let third = first + chrono::Duration::hours(2);
        assert_eq!(
            operation_key("publish", "311", first),
            operation_key("publish", "311", second)
        );
        assert_ne!(
            operation_key("publish", "311", first),
            operation_key("publish", "311", third)
        );
        assert_ne!(
            operation_key("publish", "311", first),
            operation_key("translate", "311", first)
        );
    }

    #[tokio::test]
    async fn record_then_exists_holds() {
        let ledger = IdempotencyLedger::in_memory();
        let key = operation_key("publish", "7", Utc::now());
        assert!(!ledger.exists(&key).await);
        ledger.record(&key, json!({"listing": "L-1"})).await;
        assert!(ledger.exists(&key).await);
        assert_eq!(
            ledger.recorded_result(&key).await,
            Some(json!({"listing": "L-1"}))
        );
    }

    #[tokio::test]
    async fn concurrent_records_leave_one_stored_result() {
        let ledger = IdempotencyLedger::in_memory();
        let key = operation_key("publish", "9", Utc::now());
        let a = {
            let ledger = ledger.clone();
            let key = key.clone();
            tokio::spawn(async move { ledger.record(&key, json!({"attempt": "a"})).await })
        };
        let b = {
            let ledger = ledger.clone();
            let key = key.clone();
            tokio::spawn(async move { ledger.record(&key, json!({"attempt": "b"})).await })
        };
        a.await.expect("task a");
        b.await.expect("task b");

        let stored = ledger.recorded_result(&key).await.expect("stored");
        assert!(stored == json!({"attempt": "a"}) || stored == json!({"attempt": "b"}));
    }
}
