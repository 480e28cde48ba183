use crate::status::{FulfillmentStatus, map_fulfillment_status};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Sales channel an order arrived through, classified from the numeric
/// integration id providers embed in the payload (`app_id` on Shopify).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    #[default]
    Storefront,
    TiktokShop,
    InstagramShopping,
}

/// Integration ids observed in production payloads. Anything not listed
/// classifies as the direct storefront.
static CHANNEL_TABLE: Lazy<Vec<(u64, Channel)>> = Lazy::new(|| {
    vec![
        (4383523, Channel::TiktokShop),
        (4994693, Channel::TiktokShop),
        (2329312, Channel::InstagramShopping),
        (580111, Channel::Storefront),
    ]
});

pub fn classify(app_id: Option<u64>) -> Channel {
    let Some(app_id) = app_id else {
        return Channel::Storefront;
    };
    CHANNEL_TABLE
        .iter()
        .find(|(id, _)| *id == app_id)
        .map(|(_, channel)| *channel)
        .unwrap_or_default()
}

/// Channel-aware fulfillment mapping. Social channels place orders on
/// hold while their own review runs, so a raw `on_hold` must survive as
/// ON_HOLD there instead of collapsing into the generic mapping.
pub fn fulfillment_for_channel(channel: Channel, raw: Option<&str>) -> FulfillmentStatus {
    let mapped = map_fulfillment_status(raw);
    match channel {
        Channel::TiktokShop | Channel::InstagramShopping => {
            if raw
                .map(|value| value.trim().eq_ignore_ascii_case("on_hold"))
                .unwrap_or(false)
            {
                FulfillmentStatus::OnHold
            } else {
                mapped
            }
        }
        Channel::Storefront => mapped,
    }
}
