use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::OrderService;
use crate::error::AppError;
use crate::models::Order;

/// Reads and flags orders in the shared `orders` table.
#[derive(Clone)]
pub struct PgOrderService {
    pool: PgPool,
}

impl PgOrderService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderService for PgOrderService {
    async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>, AppError> {
        let order: Option<Order> = sqlx::query_as(
            r#"
            SELECT id, buyer_phone, seller_phone, total_amount, status, delivery_confirmed, delivery_confirmed_at, created_at
            FROM orders
            WHERE id = $1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(order)
    }

    async fn mark_delivery_confirmed(&self, order_id: Uuid) -> Result<Order, AppError> {
        let order: Option<Order> = sqlx::query_as(
            r#"
            UPDATE orders
            SET delivery_confirmed = TRUE,
                delivery_confirmed_at = COALESCE(delivery_confirmed_at, NOW()),
                status = 'delivered'
            WHERE id = $1
            RETURNING id, buyer_phone, seller_phone, total_amount, status, delivery_confirmed, delivery_confirmed_at, created_at
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        order.ok_or_else(|| AppError::NotFound(format!("Order not found: {}", order_id)))
    }
}
