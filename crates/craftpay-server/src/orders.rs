//! The order service the escrow engine consults.
//!
//! Orders are owned elsewhere; the engine only reads the buyer, seller,
//! total and delivery flag, and writes the delivery flag once a payout
//! for that delivery has gone through.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::Order;

pub use memory::InMemoryOrderService;
pub use postgres::PgOrderService;

#[async_trait]
pub trait OrderService: Send + Sync {
    async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>, AppError>;

    async fn is_delivery_confirmed(&self, order_id: Uuid) -> Result<bool, AppError> {
        Ok(self
            .get_order(order_id)
            .await?
            .is_some_and(|order| order.delivery_confirmed))
    }

    /// Sets the delivery flag. Idempotent; unknown orders are `NotFound`.
    async fn mark_delivery_confirmed(&self, order_id: Uuid) -> Result<Order, AppError>;
}
