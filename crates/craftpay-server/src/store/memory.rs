use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{check_edge, PaymentStore};
use crate::error::AppError;
use crate::models::{NewPayment, Payment, PaymentStatus, PaymentUpdate};

/// A thread-safe in-memory payment store.
///
/// The write lock spans the status check and the write, which is what makes
/// `transition` a compare-and-swap here. Used by tests and local development.
#[derive(Default, Clone)]
pub struct InMemoryPaymentStore {
    payments: Arc<RwLock<HashMap<Uuid, Payment>>>,
}

impl InMemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every payment, for assertions.
    pub async fn all(&self) -> Vec<Payment> {
        self.payments.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn create_payment(&self, new: NewPayment) -> Result<Payment, AppError> {
        let mut payments = self.payments.write().await;

        if payments.values().any(|p| p.order_id == new.order_id) {
            return Err(AppError::Duplicate(format!(
                "Payment already exists for order {}",
                new.order_id
            )));
        }

        let payment = Payment::initiated(new, Utc::now());
        payments.insert(payment.id, payment.clone());
        Ok(payment)
    }

    async fn get(&self, payment_id: Uuid) -> Result<Option<Payment>, AppError> {
        Ok(self.payments.read().await.get(&payment_id).cloned())
    }

    async fn find_by_order(&self, order_id: Uuid) -> Result<Option<Payment>, AppError> {
        let payments = self.payments.read().await;
        Ok(payments.values().find(|p| p.order_id == order_id).cloned())
    }

    async fn find_by_external_ref(&self, external_ref: &str) -> Result<Option<Payment>, AppError> {
        let payments = self.payments.read().await;
        Ok(payments
            .values()
            .find(|p| p.external_ref.as_deref() == Some(external_ref))
            .cloned())
    }

    async fn attach_external_ref(&self, payment_id: Uuid, external_ref: &str) -> Result<Payment, AppError> {
        let mut payments = self.payments.write().await;

        if payments
            .values()
            .any(|p| p.id != payment_id && p.external_ref.as_deref() == Some(external_ref))
        {
            return Err(AppError::Duplicate(format!(
                "External reference {} already recorded",
                external_ref
            )));
        }

        let payment = payments
            .get_mut(&payment_id)
            .ok_or_else(|| AppError::NotFound(format!("Payment not found: {}", payment_id)))?;

        if payment.status != PaymentStatus::Initiated || payment.external_ref.is_some() {
            return Err(AppError::InvalidState {
                payment_id,
                from: PaymentStatus::Initiated,
                to: PaymentStatus::Initiated,
                actual: payment.status,
            });
        }

        payment.external_ref = Some(external_ref.to_string());
        payment.updated_at = Utc::now();
        Ok(payment.clone())
    }

    async fn claim_collection(
        &self,
        payment_id: Uuid,
        attempted_at: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Payment, AppError> {
        let mut payments = self.payments.write().await;

        let payment = payments
            .get_mut(&payment_id)
            .ok_or_else(|| AppError::NotFound(format!("Payment not found: {}", payment_id)))?;

        let claimable = payment.status == PaymentStatus::Initiated
            && payment.external_ref.is_none()
            && payment
                .collection_attempted_at
                .map_or(true, |t| t < stale_before);
        if !claimable {
            return Err(AppError::InvalidState {
                payment_id,
                from: PaymentStatus::Initiated,
                to: PaymentStatus::Initiated,
                actual: payment.status,
            });
        }

        payment.collection_attempted_at = Some(attempted_at);
        payment.updated_at = Utc::now();
        Ok(payment.clone())
    }

    async fn release_collection(&self, payment_id: Uuid) -> Result<(), AppError> {
        let mut payments = self.payments.write().await;
        if let Some(payment) = payments.get_mut(&payment_id) {
            if payment.status == PaymentStatus::Initiated && payment.external_ref.is_none() {
                payment.collection_attempted_at = None;
                payment.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn transition(
        &self,
        payment_id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
        update: PaymentUpdate,
    ) -> Result<Payment, AppError> {
        let mut payments = self.payments.write().await;

        let payment = payments
            .get_mut(&payment_id)
            .ok_or_else(|| AppError::NotFound(format!("Payment not found: {}", payment_id)))?;

        check_edge(payment_id, from, to, payment.status)?;
        payment.apply(to, update, Utc::now());
        Ok(payment.clone())
    }

    async fn find_overdue_held(&self, paid_before: DateTime<Utc>) -> Result<Vec<Payment>, AppError> {
        let payments = self.payments.read().await;
        let mut overdue: Vec<Payment> = payments
            .values()
            .filter(|p| p.status == PaymentStatus::Held)
            .filter(|p| p.paid_at.is_some_and(|t| t < paid_before))
            .cloned()
            .collect();
        overdue.sort_by_key(|p| p.paid_at);
        Ok(overdue)
    }

    async fn find_stale_claims(&self, claimed_before: DateTime<Utc>) -> Result<Vec<Payment>, AppError> {
        let payments = self.payments.read().await;
        Ok(payments
            .values()
            .filter(|p| p.status.is_provisional())
            .filter(|p| p.claimed_at.is_some_and(|t| t < claimed_before))
            .cloned()
            .collect())
    }
}
