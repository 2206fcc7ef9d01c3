use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::OrderService;
use crate::error::AppError;
use crate::models::Order;

#[derive(Default, Clone)]
pub struct InMemoryOrderService {
    orders: Arc<RwLock<HashMap<Uuid, Order>>>,
}

impl InMemoryOrderService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, order: Order) -> Order {
        self.orders.write().await.insert(order.id, order.clone());
        order
    }
}

#[async_trait]
impl OrderService for InMemoryOrderService {
    async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>, AppError> {
        Ok(self.orders.read().await.get(&order_id).cloned())
    }

    async fn mark_delivery_confirmed(&self, order_id: Uuid) -> Result<Order, AppError> {
        let mut orders = self.orders.write().await;
        let order = orders
            .get_mut(&order_id)
            .ok_or_else(|| AppError::NotFound(format!("Order not found: {}", order_id)))?;
        order.confirm_delivery(Utc::now());
        Ok(order.clone())
    }
}
