use crate::channel::Channel;
use crate::event::AddressPayload;
use crate::models::Marketplace;
use crate::status::{FulfillmentStatus, OrderStatus, PaymentStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("order `{key}` already exists as {existing}")]
    DuplicateOrder { key: String, existing: Uuid },
}

#[derive(Debug, Clone)]
pub struct WebhookEventRow {
    pub id: Uuid,
    pub marketplace: Marketplace,
    pub event_type: String,
    pub payload: Value,
    pub headers: BTreeMap<String, String>,
    /// Set exactly once, after every dependent write has committed.
    pub order_id: Option<Uuid>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub id: Uuid,
    pub marketplace: Marketplace,
    pub marketplace_order_id: String,
    pub buyer_name: Option<String>,
    pub buyer_email: Option<String>,
    pub shipping_address: Option<AddressPayload>,
    pub subtotal: f64,
    pub shipping: f64,
    pub tax: f64,
    pub total: f64,
    pub currency: String,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub fulfillment_status: FulfillmentStatus,
    pub channel: Channel,
    pub ordered_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub shipped_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing)]
    pub raw: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct Sale {
    pub id: Uuid,
    pub order_id: Uuid,
    pub listing_id: Option<Uuid>,
    pub product_id: Option<u64>,
    pub sku: Option<String>,
    pub title: String,
    pub quantity: u32,
    pub unit_price: f64,
    pub total: f64,
    pub provider_item_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InventoryEventKind {
    Sale,
    #[allow(dead_code)]
    Restock,
}

/// Append-only audit row; never updated or deleted by this layer.
#[derive(Debug, Clone, Serialize)]
pub struct InventoryEvent {
    pub id: Uuid,
    pub product_id: u64,
    pub kind: InventoryEventKind,
    pub delta: i64,
    pub prev_stock: i64,
    pub new_stock: i64,
    pub marketplace: Marketplace,
    pub order_id: Uuid,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProductStatus {
    Active,
    Sold,
    #[allow(dead_code)]
    Archived,
}

#[derive(Debug, Clone, Serialize)]
pub struct Product {
    pub id: u64,
    pub title: String,
    pub status: ProductStatus,
    pub stock: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ListingStatus {
    Active,
    Ended,
    Draft,
}

#[derive(Debug, Clone, Serialize)]
pub struct Listing {
    pub id: Uuid,
    pub product_id: u64,
    pub marketplace: Marketplace,
    pub provider_listing_id: String,
    pub status: ListingStatus,
    pub price: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Credential {
    pub id: Uuid,
    pub marketplace: Marketplace,
    pub label: String,
    pub active: bool,
}

/// Staged writes for one order, committed as a single unit under one
/// lock acquisition. The webhook event is linked separately, last.
#[derive(Debug, Clone)]
pub struct OrderWriteSet {
    pub order: Order,
    pub sales: Vec<Sale>,
    pub inventory_events: Vec<InventoryEvent>,
    pub product_transitions: Vec<ProductTransition>,
}

#[derive(Debug, Clone)]
pub struct ProductTransition {
    pub product_id: u64,
    pub status: ProductStatus,
    pub stock: i64,
}

#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<Mutex<StoreInner>>,
}

#[derive(Default)]
struct StoreInner {
    events: HashMap<Uuid, WebhookEventRow>,
    orders: HashMap<Uuid, Order>,
    order_keys: HashMap<(Marketplace, String), Uuid>,
    sales: Vec<Sale>,
    inventory_events: Vec<InventoryEvent>,
    products: HashMap<u64, Product>,
    listings: HashMap<Uuid, Listing>,
    credentials: Vec<Credential>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_event(&self, row: WebhookEventRow) {
        let mut guard = self.inner.lock().await;
        guard.events.insert(row.id, row);
    }

    pub async fn event(&self, id: Uuid) -> Option<WebhookEventRow> {
        let guard = self.inner.lock().await;
        guard.events.get(&id).cloned()
    }

    /// Mark the event processed. The first link wins; an already linked
    /// event is left untouched so the at-most-one-order invariant holds.
    pub async fn link_event(&self, event_id: Uuid, order_id: Uuid) {
        let mut guard = self.inner.lock().await;
        if let Some(event) = guard.events.get_mut(&event_id)
            && event.order_id.is_none()
        {
            event.order_id = Some(order_id);
        }
    }

    pub async fn find_order_id(
        &self,
        marketplace: Marketplace,
        marketplace_order_id: &str,
    ) -> Option<Uuid> {
        let guard = self.inner.lock().await;
        guard
            .order_keys
            .get(&(marketplace, marketplace_order_id.to_string()))
            .copied()
    }

    pub async fn order(&self, id: Uuid) -> Option<Order> {
        let guard = self.inner.lock().await;
        guard.orders.get(&id).cloned()
    }

    pub async fn sales_for_order(&self, order_id: Uuid) -> Vec<Sale> {
        let guard = self.inner.lock().await;
        guard
            .sales
            .iter()
            .filter(|sale| sale.order_id == order_id)
            .cloned()
            .collect()
    }

    pub async fn inventory_events_for_product(&self, product_id: u64) -> Vec<InventoryEvent> {
        let guard = self.inner.lock().await;
        guard
            .inventory_events
            .iter()
            .filter(|event| event.product_id == product_id)
            .cloned()
            .collect()
    }

    /// Commit one order's write group atomically. The unique
    /// (marketplace, marketplace_order_id) key is checked under the same
    /// lock that applies the writes, so a racing duplicate observes
    /// `DuplicateOrder` carrying the winner's id and writes nothing.
    pub async fn commit_order(&self, writes: OrderWriteSet) -> Result<Uuid, StoreError> {
        let mut guard = self.inner.lock().await;
        let key = (
            writes.order.marketplace,
            writes.order.marketplace_order_id.clone(),
        );
        if let Some(existing) = guard.order_keys.get(&key) {
            return Err(StoreError::DuplicateOrder {
                key: format!("{}:{}", key.0.code(), key.1),
                existing: *existing,
            });
        }
        let order_id = writes.order.id;
        guard.order_keys.insert(key, order_id);
        guard.orders.insert(order_id, writes.order);
        guard.sales.extend(writes.sales);
        guard.inventory_events.extend(writes.inventory_events);
        for transition in writes.product_transitions {
            if let Some(product) = guard.products.get_mut(&transition.product_id) {
                product.status = transition.status;
                product.stock = transition.stock;
            }
        }
        Ok(order_id)
    }

    /// Status-only update; line items and the inventory ledger are never
    /// touched on this path.
    pub async fn update_order_statuses(
        &self,
        order_id: Uuid,
        status: OrderStatus,
        payment_status: PaymentStatus,
        fulfillment_status: FulfillmentStatus,
        raw: Value,
        paid_at: Option<DateTime<Utc>>,
        shipped_at: Option<DateTime<Utc>>,
    ) {
        let mut guard = self.inner.lock().await;
        if let Some(order) = guard.orders.get_mut(&order_id) {
            order.status = status;
            order.payment_status = payment_status;
            order.fulfillment_status = fulfillment_status;
            order.raw = raw;
            if paid_at.is_some() {
                order.paid_at = paid_at;
            }
            if shipped_at.is_some() {
                order.shipped_at = shipped_at;
            }
        }
    }

    pub async fn set_order_status(&self, order_id: Uuid, status: OrderStatus) {
        let mut guard = self.inner.lock().await;
        if let Some(order) = guard.orders.get_mut(&order_id) {
            order.status = status;
        }
    }

    pub async fn product(&self, id: u64) -> Option<Product> {
        let guard = self.inner.lock().await;
        guard.products.get(&id).cloned()
    }

    pub async fn upsert_product(&self, product: Product) {
        let mut guard = self.inner.lock().await;
        guard.products.insert(product.id, product);
    }

    pub async fn listing(&self, id: Uuid) -> Option<Listing> {
        let guard = self.inner.lock().await;
        guard.listings.get(&id).cloned()
    }

    pub async fn upsert_listing(&self, listing: Listing) {
        let mut guard = self.inner.lock().await;
        guard.listings.insert(listing.id, listing);
    }

    pub async fn listing_by_product(
        &self,
        product_id: u64,
        marketplace: Marketplace,
    ) -> Option<Listing> {
        let guard = self.inner.lock().await;
        guard
            .listings
            .values()
            .find(|listing| listing.product_id == product_id && listing.marketplace == marketplace)
            .cloned()
    }

    pub async fn listing_by_provider_id(
        &self,
        marketplace: Marketplace,
        provider_listing_id: &str,
    ) -> Option<Listing> {
        let guard = self.inner.lock().await;
        guard
            .listings
            .values()
            .find(|listing| {
                listing.marketplace == marketplace
                    && listing.provider_listing_id == provider_listing_id
            })
            .cloned()
    }

    pub async fn update_listing(
        &self,
        listing_id: Uuid,
        status: ListingStatus,
        price: Option<f64>,
    ) {
        let mut guard = self.inner.lock().await;
        if let Some(listing) = guard.listings.get_mut(&listing_id) {
            listing.status = status;
            if let Some(price) = price {
                listing.price = price;
            }
        }
    }

    /// Blast-radius action for integration revocation. Re-running it is
    /// a no-op by construction.
    pub async fn deactivate_marketplace(&self, marketplace: Marketplace) -> (usize, usize) {
        let mut guard = self.inner.lock().await;
        let mut listings = 0;
        for listing in guard.listings.values_mut() {
            if listing.marketplace == marketplace && listing.status == ListingStatus::Active {
                listing.status = ListingStatus::Ended;
                listings += 1;
            }
        }
        let mut credentials = 0;
        for credential in guard.credentials.iter_mut() {
            if credential.marketplace == marketplace && credential.active {
                credential.active = false;
                credentials += 1;
            }
        }
        (listings, credentials)
    }

    pub async fn insert_credential(&self, credential: Credential) {
        let mut guard = self.inner.lock().await;
        guard.credentials.push(credential);
    }

    pub async fn credentials_for(&self, marketplace: Marketplace) -> Vec<Credential> {
        let guard = self.inner.lock().await;
        guard
            .credentials
            .iter()
            .filter(|credential| credential.marketplace == marketplace)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_order(marketplace: Marketplace, reference: &str) -> Order {
        Order {
            id: Uuid::new_v4(),
            marketplace,
            marketplace_order_id: reference.to_string(),
            buyer_name: None,
            buyer_email: None,
            shipping_address: None,
            subtotal: 40.0,
            shipping: 5.0,
            tax: 3.0,
            total: 48.0,
            currency: "USD".to_string(),
            status: OrderStatus::Confirmed,
            payment_status: PaymentStatus::Paid,
            fulfillment_status: FulfillmentStatus::Unfulfilled,
            channel: Channel::Storefront,
            ordered_at: Some(Utc::now()),
            paid_at: None,
            shipped_at: None,
            raw: json!({}),
        }
    }

    #[tokio::test]
    async fn order_key_is_unique_per_marketplace() {
        let store = Store::new();
        let first = sample_order(Marketplace::Shopify, "1001");
        let first_id = first.id;
        store
            .commit_order(OrderWriteSet {
                order: first,
                sales: vec![],
                inventory_events: vec![],
                product_transitions: vec![],
            })
            .await
            .expect("first commit");

        let err = store
            .commit_order(OrderWriteSet {
                order: sample_order(Marketplace::Shopify, "1001"),
                sales: vec![],
                inventory_events: vec![],
                product_transitions: vec![],
            })
            .await
            .expect_err("duplicate must be rejected");
        let StoreError::DuplicateOrder { existing, .. } = err;
        assert_eq!(existing, first_id);

        // The same reference on another marketplace is a different order.
        store
            .commit_order(OrderWriteSet {
                order: sample_order(Marketplace::Ebay, "1001"),
                sales: vec![],
                inventory_events: vec![],
                product_transitions: vec![],
            })
            .await
            .expect("other marketplace commit");
    }

    #[tokio::test]
    async fn rejected_commit_writes_nothing() {
        let store = Store::new();
        store
            .upsert_product(Product {
                id: 7,
                title: "Vintage camera".into(),
                status: ProductStatus::Active,
                stock: 1,
            })
            .await;

        let winner = sample_order(Marketplace::Shopify, "2002");
        store
            .commit_order(OrderWriteSet {
                order: winner,
                sales: vec![],
                inventory_events: vec![],
                product_transitions: vec![],
            })
            .await
            .expect("winner");

        let loser = sample_order(Marketplace::Shopify, "2002");
        let loser_id = loser.id;
        let sale = Sale {
            id: Uuid::new_v4(),
            order_id: loser_id,
            listing_id: None,
            product_id: Some(7),
            sku: Some("PS-7".into()),
            title: "Vintage camera".into(),
            quantity: 1,
            unit_price: 40.0,
            total: 40.0,
            provider_item_id: None,
        };
        let result = store
            .commit_order(OrderWriteSet {
                order: loser,
                sales: vec![sale],
                inventory_events: vec![],
                product_transitions: vec![ProductTransition {
                    product_id: 7,
                    status: ProductStatus::Sold,
                    stock: 0,
                }],
            })
            .await;
        assert!(result.is_err());
        assert!(store.sales_for_order(loser_id).await.is_empty());
        let product = store.product(7).await.expect("product");
        assert_eq!(product.status, ProductStatus::Active);
        assert_eq!(product.stock, 1);
    }

    #[tokio::test]
    async fn event_links_at_most_once() {
        let store = Store::new();
        let event_id = Uuid::new_v4();
        store
            .insert_event(WebhookEventRow {
                id: event_id,
                marketplace: Marketplace::Shopify,
                event_type: "orders/create".into(),
                payload: json!({}),
                headers: BTreeMap::new(),
                order_id: None,
                received_at: Utc::now(),
            })
            .await;

        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        store.link_event(event_id, first).await;
        store.link_event(event_id, second).await;
        assert_eq!(store.event(event_id).await.unwrap().order_id, Some(first));
    }

    #[tokio::test]
    async fn deactivate_marketplace_is_idempotent() {
        let store = Store::new();
        store
            .upsert_listing(Listing {
                id: Uuid::new_v4(),
                product_id: 1,
                marketplace: Marketplace::Ebay,
                provider_listing_id: "e-1".into(),
                status: ListingStatus::Active,
                price: 10.0,
            })
            .await;
        store
            .insert_credential(Credential {
                id: Uuid::new_v4(),
                marketplace: Marketplace::Ebay,
                label: "oauth".into(),
                active: true,
            })
            .await;

        assert_eq!(store.deactivate_marketplace(Marketplace::Ebay).await, (1, 1));
        assert_eq!(store.deactivate_marketplace(Marketplace::Ebay).await, (0, 0));
    }
}
