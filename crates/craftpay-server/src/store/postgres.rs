use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{check_edge, PaymentStore};
use crate::error::AppError;
use crate::models::{NewPayment, Payment, PaymentStatus, PaymentUpdate};

const PAYMENT_COLUMNS: &str = "id, order_id, payer_phone, payee_phone, amount, status, held_by_platform, \
     external_ref, receipt_number, confirmed_amount, confirmed_payer_phone, transaction_date, \
     payout_reference, refund_reference, failure_reason, refund_reason, requested_at, paid_at, \
     released_at, refunded_at, claimed_at, collection_attempted_at, updated_at";

/// PostgreSQL-backed payment store.
///
/// Transitions are a single conditional `UPDATE ... WHERE status = $from`;
/// the row lock taken by that statement serializes competing writers.
#[derive(Clone)]
pub struct PgPaymentStore {
    pool: PgPool,
}

impl PgPaymentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_status(&self, payment_id: Uuid) -> Result<Option<PaymentStatus>, AppError> {
        let status: Option<(PaymentStatus,)> =
            sqlx::query_as("SELECT status FROM payments WHERE id = $1")
                .bind(payment_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(status.map(|(s,)| s))
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

#[async_trait]
impl PaymentStore for PgPaymentStore {
    async fn create_payment(&self, new: NewPayment) -> Result<Payment, AppError> {
        let order_id = new.order_id;
        let payment = Payment::initiated(new, Utc::now());

        let query = format!(
            r#"
            INSERT INTO payments (id, order_id, payer_phone, payee_phone, amount, status, held_by_platform, requested_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, FALSE, $7, $7)
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        );

        sqlx::query_as::<_, Payment>(&query)
            .bind(payment.id)
            .bind(payment.order_id)
            .bind(&payment.payer_phone)
            .bind(&payment.payee_phone)
            .bind(&payment.amount)
            .bind(PaymentStatus::Initiated)
            .bind(payment.requested_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    AppError::Duplicate(format!("Payment already exists for order {}", order_id))
                } else {
                    AppError::Database(e)
                }
            })
    }

    async fn get(&self, payment_id: Uuid) -> Result<Option<Payment>, AppError> {
        let query = format!("SELECT {} FROM payments WHERE id = $1", PAYMENT_COLUMNS);
        let payment = sqlx::query_as::<_, Payment>(&query)
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(payment)
    }

    async fn find_by_order(&self, order_id: Uuid) -> Result<Option<Payment>, AppError> {
        let query = format!("SELECT {} FROM payments WHERE order_id = $1", PAYMENT_COLUMNS);
        let payment = sqlx::query_as::<_, Payment>(&query)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(payment)
    }

    async fn find_by_external_ref(&self, external_ref: &str) -> Result<Option<Payment>, AppError> {
        let query = format!("SELECT {} FROM payments WHERE external_ref = $1", PAYMENT_COLUMNS);
        let payment = sqlx::query_as::<_, Payment>(&query)
            .bind(external_ref)
            .fetch_optional(&self.pool)
            .await?;
        Ok(payment)
    }

    async fn attach_external_ref(&self, payment_id: Uuid, external_ref: &str) -> Result<Payment, AppError> {
        let query = format!(
            r#"
            UPDATE payments
            SET external_ref = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'initiated' AND external_ref IS NULL
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        );

        let updated = sqlx::query_as::<_, Payment>(&query)
            .bind(payment_id)
            .bind(external_ref)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    AppError::Duplicate(format!("External reference {} already recorded", external_ref))
                } else {
                    AppError::Database(e)
                }
            })?;

        match updated {
            Some(payment) => Ok(payment),
            None => match self.fetch_status(payment_id).await? {
                Some(actual) => Err(AppError::InvalidState {
                    payment_id,
                    from: PaymentStatus::Initiated,
                    to: PaymentStatus::Initiated,
                    actual,
                }),
                None => Err(AppError::NotFound(format!("Payment not found: {}", payment_id))),
            },
        }
    }

    async fn claim_collection(
        &self,
        payment_id: Uuid,
        attempted_at: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Payment, AppError> {
        let query = format!(
            r#"
            UPDATE payments
            SET collection_attempted_at = $2, updated_at = NOW()
            WHERE id = $1
              AND status = 'initiated'
              AND external_ref IS NULL
              AND (collection_attempted_at IS NULL OR collection_attempted_at < $3)
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        );

        let claimed = sqlx::query_as::<_, Payment>(&query)
            .bind(payment_id)
            .bind(attempted_at)
            .bind(stale_before)
            .fetch_optional(&self.pool)
            .await?;

        match claimed {
            Some(payment) => Ok(payment),
            None => match self.fetch_status(payment_id).await? {
                Some(actual) => Err(AppError::InvalidState {
                    payment_id,
                    from: PaymentStatus::Initiated,
                    to: PaymentStatus::Initiated,
                    actual,
                }),
                None => Err(AppError::NotFound(format!("Payment not found: {}", payment_id))),
            },
        }
    }

    async fn release_collection(&self, payment_id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE payments
            SET collection_attempted_at = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'initiated' AND external_ref IS NULL
            "#,
        )
        .bind(payment_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn transition(
        &self,
        payment_id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
        update: PaymentUpdate,
    ) -> Result<Payment, AppError> {
        if !from.can_transition_to(to) {
            let actual = self
                .fetch_status(payment_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("Payment not found: {}", payment_id)))?;
            return Err(AppError::InvalidState {
                payment_id,
                from,
                to,
                actual,
            });
        }

        let now = Utc::now();
        let claimed_at = if to.is_provisional() {
            Some(update.claimed_at.unwrap_or(now))
        } else {
            None
        };

        let query = format!(
            r#"
            UPDATE payments SET
                status = $3,
                held_by_platform = $4,
                claimed_at = $5,
                paid_at = COALESCE($6, paid_at),
                receipt_number = COALESCE($7, receipt_number),
                confirmed_amount = COALESCE($8, confirmed_amount),
                confirmed_payer_phone = COALESCE($9, confirmed_payer_phone),
                transaction_date = COALESCE($10, transaction_date),
                released_at = COALESCE($11, released_at),
                payout_reference = COALESCE($12, payout_reference),
                refunded_at = COALESCE($13, refunded_at),
                refund_reason = COALESCE($14, refund_reason),
                refund_reference = COALESCE($15, refund_reference),
                failure_reason = COALESCE($16, failure_reason),
                updated_at = $17
            WHERE id = $1 AND status = $2
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        );

        let updated = sqlx::query_as::<_, Payment>(&query)
            .bind(payment_id)
            .bind(from)
            .bind(to)
            .bind(to == PaymentStatus::Held)
            .bind(claimed_at)
            .bind(update.paid_at)
            .bind(&update.receipt_number)
            .bind(&update.confirmed_amount)
            .bind(&update.confirmed_payer_phone)
            .bind(update.transaction_date)
            .bind(update.released_at)
            .bind(&update.payout_reference)
            .bind(update.refunded_at)
            .bind(&update.refund_reason)
            .bind(&update.refund_reference)
            .bind(&update.failure_reason)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(payment) = updated {
            return Ok(payment);
        }

        // Lost the race, or the payment is gone.
        let actual = self
            .fetch_status(payment_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Payment not found: {}", payment_id)))?;
        check_edge(payment_id, from, to, actual)?;

        // Status matched on re-read: the row moved away and back between
        // the update and the read. Report it as a lost race all the same.
        Err(AppError::InvalidState {
            payment_id,
            from,
            to,
            actual,
        })
    }

    async fn find_overdue_held(&self, paid_before: DateTime<Utc>) -> Result<Vec<Payment>, AppError> {
        let query = format!(
            r#"
            SELECT {}
            FROM payments
            WHERE status = 'held' AND paid_at < $1
            ORDER BY paid_at ASC
            "#,
            PAYMENT_COLUMNS
        );
        let payments = sqlx::query_as::<_, Payment>(&query)
            .bind(paid_before)
            .fetch_all(&self.pool)
            .await?;
        Ok(payments)
    }

    async fn find_stale_claims(&self, claimed_before: DateTime<Utc>) -> Result<Vec<Payment>, AppError> {
        let query = format!(
            r#"
            SELECT {}
            FROM payments
            WHERE status IN ('releasing', 'refunding') AND claimed_at < $1
            ORDER BY claimed_at ASC
            "#,
            PAYMENT_COLUMNS
        );
        let payments = sqlx::query_as::<_, Payment>(&query)
            .bind(claimed_before)
            .fetch_all(&self.pool)
            .await?;
        Ok(payments)
    }
}
