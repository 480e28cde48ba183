use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// One webhook delivery as handed over by the HTTP layer: identity,
/// origin marketplace, event type and the untouched payload/headers.
#[derive(Debug, Clone)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub marketplace: Marketplace,
    pub event_type: String,
    pub payload: Value,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Response body for `POST /webhooks/{marketplace}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub event_id: Uuid,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Marketplace {
    #[default]
    Shopify,
    Ebay,
    Joom,
}

impl Marketplace {
    pub fn code(&self) -> &'static str {
        match self {
            Marketplace::Shopify => "SHOPIFY",
            Marketplace::Ebay => "EBAY",
            Marketplace::Joom => "JOOM",
        }
    }

    pub fn from_str(input: &str) -> Option<Self> {
        match input.trim().to_uppercase().as_str() {
            "SHOPIFY" => Some(Marketplace::Shopify),
            "EBAY" => Some(Marketplace::Ebay),
            "JOOM" => Some(Marketplace::Joom),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marketplace_roundtrip() {
        for mp in [Marketplace::Shopify, Marketplace::Ebay, Marketplace::Joom] {
            assert_eq!(Marketplace::from_str(mp.code()), Some(mp));
        }
        assert_eq!(Marketplace::from_str("ebay"), Some(Marketplace::Ebay));
        assert_eq!(Marketplace::from_str("amazon"), None);
    }
}
