use crate::event::LineItemPayload;
use crate::models::Marketplace;
use crate::store::Store;
use tracing::debug;
use uuid::Uuid;

/// SKUs minted by this system encode the internal product id.
const SKU_PREFIX: &str = "PS-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub product_id: u64,
    pub listing_id: Option<Uuid>,
}

pub fn product_id_from_sku(sku: &str) -> Option<u64> {
    let rest = sku.trim().strip_prefix(SKU_PREFIX)?;
    rest.parse::<u64>().ok()
}

/// Resolve a line item to the internal Product/Listing. SKU prefix
/// first, provider listing id second. `None` is a supported outcome:
/// the Sale is still recorded, it just carries no catalog link and
/// emits no inventory event.
pub async fn resolve_line(
    store: &Store,
    marketplace: Marketplace,
    line: &LineItemPayload,
) -> Option<Resolution> {
    if let Some(product_id) = line.sku.as_deref().and_then(product_id_from_sku)
        && store.product(product_id).await.is_some()
    {
        let listing_id = store
            .listing_by_product(product_id, marketplace)
            .await
            .map(|listing| listing.id);
        return Some(Resolution {
            product_id,
            listing_id,
        });
    }

    if let Some(provider_id) = line.product_id.as_ref()
        && let Some(listing) = store
            .listing_by_provider_id(marketplace, &provider_id.as_key())
            .await
    {
        return Some(Resolution {
            product_id: listing.product_id,
            listing_id: Some(listing.id),
        });
    }

    debug!(
        target = "portside.resolve",
        sku = line.sku.as_deref().unwrap_or(""),
        "line item did not resolve to a catalog entry"
    );
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ProviderId;
    use crate::store::{Listing, ListingStatus, Product, ProductStatus};

    fn line(sku: Option<&str>, product_id: Option<ProviderId>) -> LineItemPayload {
        LineItemPayload {
            id: None,
            sku: sku.map(str::to_string),
            title: Some("item".into()),
            quantity: Some(1),
            price: None,
            product_id,
        }
    }

    async fn seeded_store() -> (Store, Uuid) {
        let store = Store::new();
        store
            .upsert_product(Product {
                id: 311,
                title: "Leather satchel".into(),
                status: ProductStatus::Active,
                stock: 1,
            })
            .await;
        let listing_id = Uuid::new_v4();
        store
            .upsert_listing(Listing {
                id: listing_id,
                product_id: 311,
                marketplace: Marketplace::Shopify,
                provider_listing_id: "shp-8899".into(),
                status: ListingStatus::Active,
                price: 120.0,
            })
            .await;
        (store, listing_id)
    }

    #[test]
    fn sku_prefix_parses_strictly() {
        assert_eq!(product_id_from_sku("PS-311"), Some(311));
        assert_eq!(product_id_from_sku("  PS-311"), Some(311));
        assert_eq!(product_id_from_sku("PS-"), None);
        assert_eq!(product_id_from_sku("PS-31x"), None);
        assert_eq!(product_id_from_sku("XX-311"), None);
    }

    #[tokio::test]
    async fn resolves_via_sku_prefix() {
        let (store, listing_id) = seeded_store().await;
        let resolved = resolve_line(&store, Marketplace::Shopify, &line(Some("PS-311"), None))
            .await
            .expect("resolution");
        assert_eq!(resolved.product_id, 311);
        assert_eq!(resolved.listing_id, Some(listing_id));
    }

    #[tokio::test]
    async fn falls_back_to_provider_listing_id() {
        let (store, listing_id) = seeded_store().await;
        let resolved = resolve_line(
            &store,
            Marketplace::Shopify,
            &line(
                Some("vendor-sku"),
                Some(ProviderId::Text("shp-8899".into())),
            ),
        )
        .await
        .expect("resolution");
        assert_eq!(resolved.product_id, 311);
        assert_eq!(resolved.listing_id, Some(listing_id));
    }

    #[tokio::test]
    async fn sku_encoding_an_unknown_product_still_tries_provider_id() {
        let (store, listing_id) = seeded_store().await;
        let resolved = resolve_line(
            &store,
            Marketplace::Shopify,
            &line(Some("PS-999"), Some(ProviderId::Text("shp-8899".into()))),
        )
        .await
        .expect("resolution");
        assert_eq!(resolved.listing_id, Some(listing_id));
    }

    #[tokio::test]
    async fn unresolvable_line_returns_none() {
        let (store, _) = seeded_store().await;
        let resolved = resolve_line(
            &store,
            Marketplace::Ebay,
            &line(Some("mystery"), Some(ProviderId::Number(42))),
        )
        .await;
        assert_eq!(resolved, None);
    }
}
