//! Order model as exposed by the order service.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};
use uuid::Uuid;

/// Order lifecycle as reported by the order service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "order_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Delivered,
    Cancelled,
}

/// The slice of an order the escrow engine depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Order {
    pub id: Uuid,
    /// Buyer's registered phone; default payer for collection.
    pub buyer_phone: String,
    /// Seller's registered phone; always the payout target.
    pub seller_phone: String,
    pub total_amount: BigDecimal,
    pub status: OrderStatus,
    /// The release trigger.
    pub delivery_confirmed: bool,
    pub delivery_confirmed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// Create a pending order. Used by the in-memory order service and tests.
    pub fn new(buyer_phone: &str, seller_phone: &str, total_amount: BigDecimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            buyer_phone: buyer_phone.to_string(),
            seller_phone: seller_phone.to_string(),
            total_amount,
            status: OrderStatus::Pending,
            delivery_confirmed: false,
            delivery_confirmed_at: None,
            created_at: Utc::now(),
        }
    }

    /// Marks delivery as confirmed. Idempotent.
    pub fn confirm_delivery(&mut self, now: DateTime<Utc>) {
        if !self.delivery_confirmed {
            self.delivery_confirmed = true;
            self.delivery_confirmed_at = Some(now);
            self.status = OrderStatus::Delivered;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirm_delivery_is_idempotent() {
        let mut order = Order::new("0712345678", "0798765432", BigDecimal::from(500));
        assert!(!order.delivery_confirmed);

        let first = Utc::now();
        order.confirm_delivery(first);
        order.confirm_delivery(first + chrono::Duration::hours(1));

        assert!(order.delivery_confirmed);
        assert_eq!(order.status, OrderStatus::Delivered);
        assert_eq!(order.delivery_confirmed_at, Some(first));
    }

    #[test]
    fn test_order_status_serialization() {
        assert_eq!(
            serde_json::to_string(&OrderStatus::Delivered).unwrap(),
            "\"delivered\""
        );
    }
}
