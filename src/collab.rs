use crate::http::build_client;
use eyre::Result;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::time::{Duration, sleep};
use uuid::Uuid;

/// Background operation kinds this layer can enqueue. The engines
/// behind them (translation, image processing, marketplace publishing)
/// live outside this service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Translate,
    Image,
    Publish,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [JobKind::Translate, JobKind::Image, JobKind::Publish];

    pub fn queue_name(&self) -> &'static str {
        match self {
            JobKind::Translate => "translate",
            JobKind::Image => "image",
            JobKind::Publish => "publish",
        }
    }

    pub fn job_name(&self) -> &'static str {
        match self {
            JobKind::Translate => "translate_listing_copy",
            JobKind::Image => "refresh_listing_images",
            JobKind::Publish => "sync_marketplace_state",
        }
    }

    pub fn from_queue(queue: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.queue_name() == queue)
    }
}

#[derive(Debug, Error)]
pub enum CollabError {
    #[error("http error: {0}")]
    Http(String),
    #[error("collaborator rejected job: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone)]
pub struct CollabConfig {
    pub publish_url: Option<String>,
    pub publish_network_enabled: bool,
}

impl CollabConfig {
    pub fn from_env() -> Self {
        Self {
            publish_url: std::env::var("PUBLISH_URL").ok().filter(|v| !v.is_empty()),
            publish_network_enabled: parse_env_bool("PUBLISH_ENABLE_NETWORK"),
        }
    }
}

/// Thin client over the external collaborators. Without network
/// configuration each call simulates the collaborator's latency and
/// returns a deterministic receipt, so the service runs end-to-end in
/// demo environments.
pub struct Collaborators {
    http: Client,
    config: CollabConfig,
}

impl Collaborators {
    pub fn new(config: CollabConfig) -> Self {
        Self {
            http: build_client(),
            config,
        }
    }

    pub async fn run(&self, kind: JobKind, input: &Value) -> Result<Value, CollabError> {
        match kind {
            JobKind::Translate => self.translate(input).await,
            JobKind::Image => self.image(input).await,
            JobKind::Publish => self.publish(input).await,
        }
    }

    async fn translate(&self, input: &Value) -> Result<Value, CollabError> {
        sleep(Duration::from_millis(12)).await;
        Ok(json!({
            "status": "translated",
            "subject": entity_ref(input),
            "locales": ["en", "de", "fr"],
        }))
    }

    async fn image(&self, input: &Value) -> Result<Value, CollabError> {
        sleep(Duration::from_millis(18)).await;
        Ok(json!({
            "status": "processed",
            "subject": entity_ref(input),
            "variants": 3,
        }))
    }

    async fn publish(&self, input: &Value) -> Result<Value, CollabError> {
        if self.config.publish_network_enabled
            && let Some(url) = &self.config.publish_url
        {
            let response = self
                .http
                .post(url)
                .json(input)
                .send()
                .await
                .map_err(|err| CollabError::Http(err.to_string()))?;
            if !response.status().is_success() {
                return Err(CollabError::Rejected(format!(
                    "HTTP {}",
                    response.status()
                )));
            }
            let payload: Value = response
                .json()
                .await
                .unwrap_or_else(|_| json!({"status": "published"}));
            return Ok(payload);
        }

        sleep(Duration::from_millis(15)).await;
        Ok(json!({
            "status": "published",
            "subject": entity_ref(input),
            "receipt": format!("PUB-{}", Uuid::new_v4().simple()),
        }))
    }
}

/// The entity a job input is about, used for receipts and idempotency
/// keys. Inputs carry `product_id` or `order_id`; anything else keys on
/// the serialized input itself.
pub fn entity_ref(input: &Value) -> String {
    for field in ["product_id", "order_id"] {
        match input.get(field) {
            Some(Value::Number(n)) => return format!("{field}:{n}"),
            Some(Value::String(s)) if !s.is_empty() => return format!("{field}:{s}"),
            _ => {}
        }
    }
    format!("input:{}", input)
}

fn parse_env_bool(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_names_roundtrip() {
        for kind in JobKind::ALL {
            assert_eq!(JobKind::from_queue(kind.queue_name()), Some(kind));
        }
        assert_eq!(JobKind::from_queue("email"), None);
    }

    #[test]
    fn entity_ref_prefers_product_then_order() {
        assert_eq!(
            entity_ref(&json!({"product_id": 311, "order_id": 9})),
            "product_id:311"
        );
        assert_eq!(entity_ref(&json!({"order_id": "o-9"})), "order_id:o-9");
        assert!(entity_ref(&json!({"note": "x"})).starts_with("input:"));
    }

    #[tokio::test]
    async fn demo_collaborators_answer_without_network() {
        let collab = Collaborators::new(CollabConfig {
            publish_url: None,
            publish_network_enabled: false,
        });
        for kind in JobKind::ALL {
            let result = collab
                .run(kind, &json!({"product_id": 1}))
                .await
                .expect("demo run");
            assert!(result.get("status").is_some());
        }
    }

    #[tokio::test]
    async fn network_publish_surfaces_connection_errors() {
        let collab = Collaborators::new(CollabConfig {
            publish_url: Some("http://127.0.0.1:9/publish".into()),
            publish_network_enabled: true,
        });
        let err = collab
            .run(JobKind::Publish, &json!({"product_id": 1}))
            .await
            .expect_err("unroutable publish endpoint");
        assert!(matches!(err, CollabError::Http(_)));
    }
}
