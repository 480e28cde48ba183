use crate::channel;
use crate::collab::JobKind;
use crate::event::{CatalogPayload, EventError, InventoryLevelPayload, OrderPayload, ProviderEvent};
use crate::jobs::JobQueue;
use crate::models::{Marketplace, WebhookDelivery};
use crate::resolve;
use crate::status::{self, FulfillmentStatus, OrderStatus, PaymentStatus};
use crate::store::{
    InventoryEvent, InventoryEventKind, ListingStatus, Order, OrderWriteSet, ProductStatus,
    ProductTransition, Sale, Store, StoreError, WebhookEventRow,
};
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Webhook-to-canonical-state pipeline. Each delivery is validated into
/// a typed event, dispatched by type, and the webhook event row is
/// linked to its order only after every dependent write has committed,
/// so a crash mid-handler leaves the event unlinked and safely
/// reprocessable on redelivery.
#[derive(Clone)]
pub struct Normalizer {
    store: Store,
    queue: JobQueue,
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error(transparent)]
    Event(#[from] EventError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created { order_id: Uuid },
    Duplicate { order_id: Uuid },
    Updated { order_id: Uuid },
    Cancelled { order_id: Uuid },
    CatalogApplied { listing_id: Uuid },
    CatalogUntracked,
    Observed,
    IntegrationRevoked { listings: usize, credentials: usize },
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Created { .. } => "created",
            Outcome::Duplicate { .. } => "duplicate",
            Outcome::Updated { .. } => "updated",
            Outcome::Cancelled { .. } => "cancelled",
            Outcome::CatalogApplied { .. } => "catalog_applied",
            Outcome::CatalogUntracked => "catalog_untracked",
            Outcome::Observed => "observed",
            Outcome::IntegrationRevoked { .. } => "integration_revoked",
        }
    }

    pub fn order_id(&self) -> Option<Uuid> {
        match self {
            Outcome::Created { order_id }
            | Outcome::Duplicate { order_id }
            | Outcome::Updated { order_id }
            | Outcome::Cancelled { order_id } => Some(*order_id),
            _ => None,
        }
    }
}

impl Normalizer {
    pub fn new(store: Store, queue: JobQueue) -> Self {
        Self { store, queue }
    }

    pub async fn process(&self, delivery: WebhookDelivery) -> Result<Outcome, NormalizeError> {
        // Redelivery of an already completed delivery short-circuits on
        // the event row itself.
        if let Some(row) = self.store.event(delivery.id).await
            && let Some(order_id) = row.order_id
        {
            debug!(
                target = "portside.normalize",
                event_id = %delivery.id,
                "delivery already processed"
            );
            return Ok(Outcome::Duplicate { order_id });
        }

        self.store
            .insert_event(WebhookEventRow {
                id: delivery.id,
                marketplace: delivery.marketplace,
                event_type: delivery.event_type.clone(),
                payload: delivery.payload.clone(),
                headers: delivery.headers.clone(),
                order_id: None,
                received_at: Utc::now(),
            })
            .await;

        let event = ProviderEvent::parse(&delivery.event_type, &delivery.payload)?;
        debug!(
            target = "portside.normalize",
            event_id = %delivery.id,
            event = event.name(),
            "payload validated"
        );
        let outcome = match event {
            ProviderEvent::OrderCreated(order) => {
                self.order_created(delivery.id, delivery.marketplace, order).await
            }
            ProviderEvent::OrderUpdated(order) => {
                self.order_updated(delivery.id, delivery.marketplace, order).await
            }
            ProviderEvent::OrderCancelled(order) => {
                self.order_cancelled(delivery.id, delivery.marketplace, order).await
            }
            ProviderEvent::CatalogUpdated(catalog) => {
                self.catalog_updated(delivery.marketplace, catalog).await
            }
            ProviderEvent::InventoryLevelUpdated(level) => {
                self.inventory_level_updated(delivery.marketplace, &level)
            }
            ProviderEvent::IntegrationRevoked => {
                self.integration_revoked(delivery.marketplace).await
            }
        };
        crate::metrics::webhook_processed(delivery.marketplace.code(), outcome.label());
        Ok(outcome)
    }

    async fn order_created(
        &self,
        event_id: Uuid,
        marketplace: Marketplace,
        payload: OrderPayload,
    ) -> Outcome {
        let reference = payload.id.as_key();
        if let Some(existing) = self.store.find_order_id(marketplace, &reference).await {
            // Duplicate delivery. Line items are never re-created once
            // an order row exists, whatever state its lines are in.
            self.store.link_event(event_id, existing).await;
            info!(
                target = "portside.normalize",
                marketplace = marketplace.code(),
                reference = %reference,
                "duplicate order delivery, linked to existing order"
            );
            return Outcome::Duplicate { order_id: existing };
        }

        let order = self.build_order(marketplace, &payload);
        let order_id = order.id;
        let mut sales = Vec::with_capacity(payload.line_items.len());
        let mut inventory_events = Vec::new();
        let mut transitions: Vec<ProductTransition> = Vec::new();
        let mut sold_products = Vec::new();
        // Two lines selling the same product must see each other's
        // decrement while staging.
        let mut staged_stock: HashMap<u64, i64> = HashMap::new();

        for line in &payload.line_items {
            let quantity = line.quantity.unwrap_or(1).max(1);
            let unit_price = line.price.as_ref().and_then(|p| p.amount()).unwrap_or(0.0);
            let resolution = resolve::resolve_line(&self.store, marketplace, line).await;

            sales.push(Sale {
                id: Uuid::new_v4(),
                order_id,
                listing_id: resolution.and_then(|r| r.listing_id),
                product_id: resolution.map(|r| r.product_id),
                sku: line.sku.clone(),
                title: line
                    .title
                    .clone()
                    .or_else(|| line.sku.clone())
                    .unwrap_or_else(|| "unlabelled line item".to_string()),
                quantity,
                unit_price,
                total: unit_price * f64::from(quantity),
                provider_item_id: line.id.as_ref().map(|id| id.as_key()),
            });

            let Some(resolution) = resolution else {
                warn!(
                    target = "portside.normalize",
                    marketplace = marketplace.code(),
                    reference = %reference,
                    sku = line.sku.as_deref().unwrap_or(""),
                    "line item unresolved, sale recorded without inventory effect"
                );
                continue;
            };
            let Some(product) = self.store.product(resolution.product_id).await else {
                warn!(
                    target = "portside.normalize",
                    product_id = resolution.product_id,
                    "resolved listing points at a missing product, skipping inventory event"
                );
                continue;
            };

            let prev_stock = *staged_stock
                .entry(product.id)
                .or_insert(product.stock);
            let new_stock = prev_stock - i64::from(quantity);
            staged_stock.insert(product.id, new_stock);

            inventory_events.push(InventoryEvent {
                id: Uuid::new_v4(),
                product_id: product.id,
                kind: InventoryEventKind::Sale,
                delta: -i64::from(quantity),
                prev_stock,
                new_stock,
                marketplace,
                order_id,
                reason: format!("sale via order {reference}"),
                at: Utc::now(),
            });

            let sold = new_stock <= 0;
            transitions.retain(|t| t.product_id != product.id);
            transitions.push(ProductTransition {
                product_id: product.id,
                status: if sold { ProductStatus::Sold } else { product.status },
                stock: new_stock,
            });
            if sold {
                sold_products.push(product.id);
            }
        }

        match self
            .store
            .commit_order(OrderWriteSet {
                order,
                sales,
                inventory_events,
                product_transitions: transitions,
            })
            .await
        {
            Ok(order_id) => {
                self.store.link_event(event_id, order_id).await;
                info!(
                    target = "portside.normalize",
                    marketplace = marketplace.code(),
                    reference = %reference,
                    order_id = %order_id,
                    "order created"
                );
                for product_id in sold_products {
                    self.enqueue_job(
                        JobKind::Publish,
                        json!({"product_id": product_id, "reason": "sold_out"}),
                    )
                    .await;
                }
                Outcome::Created { order_id }
            }
            Err(StoreError::DuplicateOrder { existing, .. }) => {
                // A concurrent delivery won the insert; nothing of ours
                // was written.
                self.store.link_event(event_id, existing).await;
                Outcome::Duplicate { order_id: existing }
            }
        }
    }

    async fn order_updated(
        &self,
        event_id: Uuid,
        marketplace: Marketplace,
        payload: OrderPayload,
    ) -> Outcome {
        let reference = payload.id.as_key();
        let Some(order_id) = self.store.find_order_id(marketplace, &reference).await else {
            // Out-of-order delivery: the update arrived before the
            // create. Heal by treating it as a create.
            info!(
                target = "portside.normalize",
                marketplace = marketplace.code(),
                reference = %reference,
                "update for unknown order, falling back to create"
            );
            return self.order_created(event_id, marketplace, payload).await;
        };

        let existing = self.store.order(order_id).await;
        let chan = existing
            .as_ref()
            .map(|order| order.channel)
            .unwrap_or_default();
        let payment = status::map_payment_status(payload.financial_status.as_deref());
        let fulfillment =
            channel::fulfillment_for_channel(chan, payload.fulfillment_status.as_deref());
        let order_status = status::derive_order_status(
            payload.financial_status.as_deref(),
            payload.fulfillment_status.as_deref(),
            payload.cancelled_at.is_some(),
        );

        let paid_at = (payment == PaymentStatus::Paid
            && existing.as_ref().is_some_and(|o| o.paid_at.is_none()))
        .then(|| payload.processed_at.unwrap_or_else(Utc::now));
        let shipped_at = (fulfillment == FulfillmentStatus::Fulfilled
            && existing.as_ref().is_some_and(|o| o.shipped_at.is_none()))
        .then(Utc::now);

        self.store
            .update_order_statuses(
                order_id,
                order_status,
                payment,
                fulfillment,
                serde_json::to_value(&payload).unwrap_or_default(),
                paid_at,
                shipped_at,
            )
            .await;
        self.store.link_event(event_id, order_id).await;
        Outcome::Updated { order_id }
    }

    async fn order_cancelled(
        &self,
        event_id: Uuid,
        marketplace: Marketplace,
        payload: OrderPayload,
    ) -> Outcome {
        let reference = payload.id.as_key();
        let Some(order_id) = self.store.find_order_id(marketplace, &reference).await else {
            // Cancellation for an order we never saw; the create path
            // derives CANCELLED from the cancellation timestamp.
            return self.order_created(event_id, marketplace, payload).await;
        };

        // Inventory stays as written; restocking is a manual decision.
        self.store
            .set_order_status(order_id, OrderStatus::Cancelled)
            .await;
        self.store.link_event(event_id, order_id).await;
        info!(
            target = "portside.normalize",
            marketplace = marketplace.code(),
            reference = %reference,
            order_id = %order_id,
            "order cancelled"
        );
        Outcome::Cancelled { order_id }
    }

    async fn catalog_updated(&self, marketplace: Marketplace, payload: CatalogPayload) -> Outcome {
        let provider_id = payload.id.as_key();
        let Some(listing) = self
            .store
            .listing_by_provider_id(marketplace, &provider_id)
            .await
        else {
            // The product is not tracked internally; nothing to sync.
            debug!(
                target = "portside.normalize",
                marketplace = marketplace.code(),
                provider_id = %provider_id,
                "catalog update for untracked listing ignored"
            );
            return Outcome::CatalogUntracked;
        };

        let status = match payload.status.as_deref().map(str::to_lowercase).as_deref() {
            Some("active") => ListingStatus::Active,
            Some("archived") => ListingStatus::Ended,
            Some("draft") => ListingStatus::Draft,
            Some(other) => {
                warn!(
                    target = "portside.normalize",
                    raw = other,
                    "unrecognized listing status, keeping current"
                );
                listing.status
            }
            None => listing.status,
        };
        let price = payload.effective_price();
        self.store.update_listing(listing.id, status, price).await;
        self.enqueue_job(
            JobKind::Translate,
            json!({"product_id": listing.product_id, "reason": "catalog_refresh"}),
        )
        .await;
        Outcome::CatalogApplied {
            listing_id: listing.id,
        }
    }

    /// Reconciliation hook. Levels are observed and logged; no internal
    /// state moves until a reconciliation pass exists to consume them.
    fn inventory_level_updated(
        &self,
        marketplace: Marketplace,
        payload: &InventoryLevelPayload,
    ) -> Outcome {
        info!(
            target = "portside.normalize",
            marketplace = marketplace.code(),
            inventory_item = payload
                .inventory_item_id
                .as_ref()
                .map(|id| id.as_key())
                .unwrap_or_default(),
            available = payload.available.unwrap_or(-1),
            "inventory level observed"
        );
        Outcome::Observed
    }

    async fn integration_revoked(&self, marketplace: Marketplace) -> Outcome {
        let (listings, credentials) = self.store.deactivate_marketplace(marketplace).await;
        warn!(
            target = "portside.normalize",
            marketplace = marketplace.code(),
            listings = listings,
            credentials = credentials,
            "integration revoked, marketplace deactivated"
        );
        Outcome::IntegrationRevoked {
            listings,
            credentials,
        }
    }

    fn build_order(&self, marketplace: Marketplace, payload: &OrderPayload) -> Order {
        let chan = channel::classify(payload.app_id);
        let payment = status::map_payment_status(payload.financial_status.as_deref());
        let fulfillment =
            channel::fulfillment_for_channel(chan, payload.fulfillment_status.as_deref());
        let order_status = status::derive_order_status(
            payload.financial_status.as_deref(),
            payload.fulfillment_status.as_deref(),
            payload.cancelled_at.is_some(),
        );

        Order {
            id: Uuid::new_v4(),
            marketplace,
            marketplace_order_id: payload.id.as_key(),
            buyer_name: payload.buyer_name(),
            buyer_email: payload.buyer_email(),
            shipping_address: payload.shipping_address.clone(),
            subtotal: money(&payload.subtotal_price),
            shipping: money(&payload.total_shipping),
            tax: money(&payload.total_tax),
            total: money(&payload.total_price),
            currency: payload
                .currency
                .clone()
                .unwrap_or_else(|| "USD".to_string()),
            status: order_status,
            payment_status: payment,
            fulfillment_status: fulfillment,
            channel: chan,
            ordered_at: payload.created_at,
            paid_at: (payment == PaymentStatus::Paid).then(|| {
                payload
                    .processed_at
                    .or(payload.created_at)
                    .unwrap_or_else(Utc::now)
            }),
            shipped_at: None,
            raw: serde_json::to_value(payload).unwrap_or_default(),
        }
    }

    /// Enqueue is fire-and-forget; a refused enqueue never fails the
    /// webhook handler.
    async fn enqueue_job(&self, kind: JobKind, input: serde_json::Value) {
        if let Err(err) = self.queue.enqueue(kind, input).await {
            warn!(
                target = "portside.normalize",
                queue = kind.queue_name(),
                error = %err,
                "job enqueue refused"
            );
        }
    }
}

fn money(field: &Option<crate::event::MoneyField>) -> f64 {
    field.as_ref().and_then(|value| value.amount()).unwrap_or(0.0)
}
