use serde::{Deserialize, Serialize};
use tracing::warn;

/// Marketplace-agnostic order state. `Delivered` is reserved for a
/// carrier confirmation signal and is never produced by `derive_order_status`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
    Refunded,
    Dispute,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Refunded,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FulfillmentStatus {
    Unfulfilled,
    PartiallyFulfilled,
    Fulfilled,
    OnHold,
    Returned,
}

/// Map a raw provider payment vocabulary onto the canonical set.
/// Unrecognized values fall back to `Pending`, the least-committal state.
pub fn map_payment_status(raw: Option<&str>) -> PaymentStatus {
    let Some(raw) = normalize(raw) else {
        return PaymentStatus::Pending;
    };
    match raw.as_str() {
        "paid" | "captured" | "authorized" | "partially_paid" => PaymentStatus::Paid,
        "refunded" | "partially_refunded" | "voided" => PaymentStatus::Refunded,
        "failed" | "declined" | "expired" => PaymentStatus::Failed,
        "pending" | "unpaid" | "" => PaymentStatus::Pending,
        other => {
            warn!(
                target = "portside.status",
                raw = other,
                "unrecognized payment status, defaulting to PENDING"
            );
            PaymentStatus::Pending
        }
    }
}

/// Map a raw provider fulfillment vocabulary onto the canonical set.
/// Providers send `null` for untouched orders, hence the Option.
pub fn map_fulfillment_status(raw: Option<&str>) -> FulfillmentStatus {
    let Some(raw) = normalize(raw) else {
        return FulfillmentStatus::Unfulfilled;
    };
    match raw.as_str() {
        "fulfilled" | "shipped" | "complete" => FulfillmentStatus::Fulfilled,
        "partial" | "partially_fulfilled" | "in_progress" => FulfillmentStatus::PartiallyFulfilled,
        // Only channel-specific precedence upgrades this to ON_HOLD.
        "on_hold" => FulfillmentStatus::Unfulfilled,
        "returned" | "restocked" => FulfillmentStatus::Returned,
        "unfulfilled" | "null" | "" => FulfillmentStatus::Unfulfilled,
        other => {
            warn!(
                target = "portside.status",
                raw = other,
                "unrecognized fulfillment status, defaulting to UNFULFILLED"
            );
            FulfillmentStatus::Unfulfilled
        }
    }
}

/// Derive the canonical order status from the raw payment and fulfillment
/// fields plus the cancellation timestamp. First match wins, top to bottom;
/// cancellation dominates everything else.
pub fn derive_order_status(
    raw_payment: Option<&str>,
    raw_fulfillment: Option<&str>,
    cancelled: bool,
) -> OrderStatus {
    if cancelled {
        return OrderStatus::Cancelled;
    }
    match map_fulfillment_status(raw_fulfillment) {
        FulfillmentStatus::Fulfilled => return OrderStatus::Shipped,
        FulfillmentStatus::PartiallyFulfilled => return OrderStatus::Processing,
        _ => {}
    }
    match map_payment_status(raw_payment) {
        PaymentStatus::Paid => OrderStatus::Confirmed,
        PaymentStatus::Refunded => OrderStatus::Refunded,
        _ => OrderStatus::Pending,
    }
}

fn normalize(raw: Option<&str>) -> Option<String> {
    raw.map(|value| value.trim().to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_dominates_everything() {
        for payment in [None, Some("paid"), Some("refunded"), Some("garbage")] {
            for fulfillment in [None, Some("fulfilled"), Some("partial"), Some("garbage")] {
                assert_eq!(
                    derive_order_status(payment, fulfillment, true),
                    OrderStatus::Cancelled
                );
            }
        }
    }

    #[test]
    fn paid_unfulfilled_order_is_confirmed() {
        assert_eq!(
            derive_order_status(Some("paid"), None, false),
            OrderStatus::Confirmed
        );
        assert_eq!(map_payment_status(Some("paid")), PaymentStatus::Paid);
        assert_eq!(
            map_fulfillment_status(None),
            FulfillmentStatus::Unfulfilled
        );
    }

    #[test]
    fn fulfillment_outranks_payment() {
        assert_eq!(
            derive_order_status(Some("paid"), Some("fulfilled"), false),
            OrderStatus::Shipped
        );
        assert_eq!(
            derive_order_status(Some("refunded"), Some("partial"), false),
            OrderStatus::Processing
        );
    }

    #[test]
    fn refunded_without_fulfillment_maps_to_refunded() {
        assert_eq!(
            derive_order_status(Some("refunded"), None, false),
            OrderStatus::Refunded
        );
    }

    #[test]
    fn unknown_inputs_never_panic_and_stay_conservative() {
        assert_eq!(
            derive_order_status(Some("💥 not-a-status"), Some("???"), false),
            OrderStatus::Pending
        );
        assert_eq!(map_payment_status(Some("  ")), PaymentStatus::Pending);
        assert_eq!(
            map_fulfillment_status(Some("mystery")),
            FulfillmentStatus::Unfulfilled
        );
    }

    #[test]
    fn delivered_is_never_derived() {
        for payment in [None, Some("paid"), Some("refunded")] {
            for fulfillment in [None, Some("fulfilled"), Some("partial"), Some("on_hold")] {
                assert_ne!(
                    derive_order_status(payment, fulfillment, false),
                    OrderStatus::Delivered
                );
            }
        }
    }
}
