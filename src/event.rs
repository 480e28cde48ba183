use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::fmt;
use thiserror::Error;

/// A webhook payload after boundary validation. Raw JSON never crosses
/// past this point; handlers only see these variants.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    OrderCreated(OrderPayload),
    OrderUpdated(OrderPayload),
    OrderCancelled(OrderPayload),
    CatalogUpdated(CatalogPayload),
    InventoryLevelUpdated(InventoryLevelPayload),
    IntegrationRevoked,
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("unrecognized event type `{0}`")]
    UnknownEventType(String),
    #[error("payload rejected for `{event_type}`: {detail}")]
    InvalidPayload {
        event_type: String,
        detail: String,
    },
}

impl ProviderEvent {
    /// Route an event type string (provider topic vocabularies differ,
    /// hence the aliases) and validate the payload into a typed variant.
    pub fn parse(event_type: &str, payload: &Value) -> Result<Self, EventError> {
        let normalized = event_type.trim().to_lowercase();
        match normalized.as_str() {
            "orders/create" | "order.created" => {
                Ok(Self::OrderCreated(parse_payload(event_type, payload)?))
            }
            "orders/updated" | "orders/update" | "order.updated" => {
                Ok(Self::OrderUpdated(parse_payload(event_type, payload)?))
            }
            "orders/cancelled" | "order.cancelled" => {
                Ok(Self::OrderCancelled(parse_payload(event_type, payload)?))
            }
            "products/update" | "product.updated" | "catalog.updated" => {
                Ok(Self::CatalogUpdated(parse_payload(event_type, payload)?))
            }
            "inventory_levels/update" | "inventory.updated" => Ok(Self::InventoryLevelUpdated(
                parse_payload(event_type, payload)?,
            )),
            "app/uninstalled" | "integration.revoked" => Ok(Self::IntegrationRevoked),
            _ => Err(EventError::UnknownEventType(event_type.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::OrderCreated(_) => "order_created",
            Self::OrderUpdated(_) => "order_updated",
            Self::OrderCancelled(_) => "order_cancelled",
            Self::CatalogUpdated(_) => "catalog_updated",
            Self::InventoryLevelUpdated(_) => "inventory_level_updated",
            Self::IntegrationRevoked => "integration_revoked",
        }
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(
    event_type: &str,
    payload: &Value,
) -> Result<T, EventError> {
    serde_json::from_value(payload.clone()).map_err(|err| EventError::InvalidPayload {
        event_type: event_type.to_string(),
        detail: err.to_string(),
    })
}

/// Provider entity ids arrive as numbers on Shopify and strings on
/// eBay/Joom.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum ProviderId {
    Number(u64),
    Text(String),
}

impl ProviderId {
    pub fn as_key(&self) -> String {
        match self {
            ProviderId::Number(value) => value.to_string(),
            ProviderId::Text(value) => value.trim().to_string(),
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_key())
    }
}

/// Monetary amounts arrive as bare numbers or decimal strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MoneyField {
    Number(f64),
    Text(String),
}

impl MoneyField {
    pub fn amount(&self) -> Option<f64> {
        match self {
            MoneyField::Number(value) => Some(*value),
            MoneyField::Text(value) => value.trim().parse::<f64>().ok(),
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPayload {
    pub id: ProviderId,
    #[serde(default)]
    pub order_number: Option<i64>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub customer: Option<CustomerPayload>,
    #[serde(default)]
    pub shipping_address: Option<AddressPayload>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub subtotal_price: Option<MoneyField>,
    #[serde(default)]
    pub total_shipping: Option<MoneyField>,
    #[serde(default)]
    pub total_tax: Option<MoneyField>,
    #[serde(default)]
    pub total_price: Option<MoneyField>,
    #[serde(default)]
    pub financial_status: Option<String>,
    #[serde(default)]
    pub fulfillment_status: Option<String>,
    #[serde(default)]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub app_id: Option<u64>,
    #[serde(default)]
    pub line_items: Vec<LineItemPayload>,
}

impl OrderPayload {
    pub fn buyer_name(&self) -> Option<String> {
        let customer = self.customer.as_ref()?;
        let name = [
            customer.first_name.as_deref(),
            customer.last_name.as_deref(),
        ]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
        if name.is_empty() { None } else { Some(name) }
    }

    pub fn buyer_email(&self) -> Option<String> {
        self.email
            .clone()
            .or_else(|| self.customer.as_ref().and_then(|c| c.email.clone()))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerPayload {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressPayload {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address1: Option<String>,
    #[serde(default)]
    pub address2: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub province: Option<String>,
    #[serde(default)]
    pub zip: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItemPayload {
    #[serde(default)]
    pub id: Option<ProviderId>,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub quantity: Option<u32>,
    #[serde(default)]
    pub price: Option<MoneyField>,
    #[serde(default)]
    pub product_id: Option<ProviderId>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogPayload {
    pub id: ProviderId,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub price: Option<MoneyField>,
    #[serde(default)]
    pub variants: Vec<CatalogVariantPayload>,
}

impl CatalogPayload {
    /// Top-level price wins; eBay/Joom put it there, Shopify nests it
    /// in the first variant.
    pub fn effective_price(&self) -> Option<f64> {
        self.price
            .as_ref()
            .and_then(MoneyField::amount)
            .or_else(|| {
                self.variants
                    .first()
                    .and_then(|variant| variant.price.as_ref())
                    .and_then(MoneyField::amount)
            })
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogVariantPayload {
    #[serde(default)]
    pub id: Option<ProviderId>,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub price: Option<MoneyField>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryLevelPayload {
    #[serde(default)]
    pub inventory_item_id: Option<ProviderId>,
    #[serde(default)]
    pub available: Option<i64>,
    #[serde(default)]
    pub location_id: Option<ProviderId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_order_created_with_mixed_id_shapes() {
        let payload = json!({
            "id": 5512839401_i64,
            "financial_status": "paid",
            "line_items": [
                {"sku": "PS-311", "quantity": 1, "price": "45.00", "product_id": "prov-9"}
            ]
        });
        let event = ProviderEvent::parse("orders/create", &payload).expect("parse");
        let ProviderEvent::OrderCreated(order) = event else {
            panic!("wrong variant");
        };
        assert_eq!(order.id.as_key(), "5512839401");
        assert_eq!(order.line_items[0].price.as_ref().unwrap().amount(), Some(45.0));
        assert_eq!(
            order.line_items[0].product_id.as_ref().unwrap().as_key(),
            "prov-9"
        );
    }

    #[test]
    fn update_aliases_route_to_the_same_variant() {
        let payload = json!({"id": "A-77"});
        for topic in ["orders/updated", "orders/update", "ORDER.UPDATED"] {
            let event = ProviderEvent::parse(topic, &payload).expect("parse");
            assert!(matches!(event, ProviderEvent::OrderUpdated(_)));
        }
    }

    #[test]
    fn unknown_topic_is_rejected() {
        let err = ProviderEvent::parse("carts/create", &json!({})).unwrap_err();
        assert!(matches!(err, EventError::UnknownEventType(_)));
    }

    #[test]
    fn order_without_id_is_invalid() {
        let err = ProviderEvent::parse("orders/create", &json!({"email": "a@b.c"})).unwrap_err();
        assert!(matches!(err, EventError::InvalidPayload { .. }));
    }

    #[test]
    fn buyer_fields_degrade_gracefully() {
        let order: OrderPayload = serde_json::from_value(json!({
            "id": 1,
            "customer": {"first_name": "Maya", "last_name": "Lund", "email": "maya@example.com"}
        }))
        .expect("order");
        assert_eq!(order.buyer_name().as_deref(), Some("Maya Lund"));
        assert_eq!(order.buyer_email().as_deref(), Some("maya@example.com"));

        let bare: OrderPayload = serde_json::from_value(json!({"id": 2})).expect("order");
        assert_eq!(bare.buyer_name(), None);
        assert_eq!(bare.buyer_email(), None);
    }

    #[test]
    fn catalog_price_prefers_top_level_then_variant() {
        let catalog: CatalogPayload = serde_json::from_value(json!({
            "id": 10,
            "variants": [{"price": "12.50"}]
        }))
        .expect("catalog");
        assert_eq!(catalog.effective_price(), Some(12.5));

        let priced: CatalogPayload = serde_json::from_value(json!({
            "id": 10,
            "price": 99.0,
            "variants": [{"price": "12.50"}]
        }))
        .expect("catalog");
        assert_eq!(priced.effective_price(), Some(99.0));
    }
}
