//! Payment persistence and the state-machine primitive.
//!
//! [`PaymentStore::transition`] is the only way a payment changes status. It
//! is a compare-and-swap: the write happens only if the stored status still
//! equals `from`, so of any number of concurrent callers exactly one wins and
//! the rest get [`AppError::InvalidState`].

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{NewPayment, Payment, PaymentStatus, PaymentUpdate};

pub use memory::InMemoryPaymentStore;
pub use postgres::PgPaymentStore;

#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Creates a payment in `Initiated`. Fails with [`AppError::Duplicate`]
    /// if the order already has one.
    async fn create_payment(&self, new: NewPayment) -> Result<Payment, AppError>;

    async fn get(&self, payment_id: Uuid) -> Result<Option<Payment>, AppError>;

    async fn find_by_order(&self, order_id: Uuid) -> Result<Option<Payment>, AppError>;

    async fn find_by_external_ref(&self, external_ref: &str) -> Result<Option<Payment>, AppError>;

    /// Records the gateway correlation id. Only allowed once, while `Initiated`.
    async fn attach_external_ref(&self, payment_id: Uuid, external_ref: &str) -> Result<Payment, AppError>;

    /// Claims the right to send the collection request for `payment_id`.
    ///
    /// Succeeds only while the payment is `Initiated` without an external
    /// reference and no other attempt newer than `stale_before` holds the
    /// claim. Losers get [`AppError::InvalidState`] and must not call the
    /// gateway.
    async fn claim_collection(
        &self,
        payment_id: Uuid,
        attempted_at: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Payment, AppError>;

    /// Drops the collection claim after a transient gateway failure.
    async fn release_collection(&self, payment_id: Uuid) -> Result<(), AppError>;

    /// Moves `payment_id` from `from` to `to`, writing `update`.
    async fn transition(
        &self,
        payment_id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
        update: PaymentUpdate,
    ) -> Result<Payment, AppError>;

    /// Held payments collected before `paid_before`, oldest first.
    async fn find_overdue_held(&self, paid_before: DateTime<Utc>) -> Result<Vec<Payment>, AppError>;

    /// Payments stuck in a provisional state since before `claimed_before`.
    async fn find_stale_claims(&self, claimed_before: DateTime<Utc>) -> Result<Vec<Payment>, AppError>;
}

/// Rejects edges that are not in the state graph before touching storage.
pub(crate) fn check_edge(
    payment_id: Uuid,
    from: PaymentStatus,
    to: PaymentStatus,
    actual: PaymentStatus,
) -> Result<(), AppError> {
    if from.can_transition_to(to) && actual == from {
        Ok(())
    } else {
        Err(AppError::InvalidState {
            payment_id,
            from,
            to,
            actual,
        })
    }
}
