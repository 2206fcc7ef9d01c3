//! Moves held funds out of escrow: payout to the seller or reversal to the
//! buyer.
//!
//! Both directions run in three steps:
//!
//! 1. claim: `Held -> Releasing | Refunding` (compare-and-swap, fast)
//! 2. gateway call, bounded by the gateway timeout, with no lock held
//! 3. finalize to the terminal state, or revert the claim to `Held` if the
//!    gateway call failed
//!
//! Losing the claim means someone else is already handling the payment and
//! surfaces as [`AppError::InvalidState`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::AppError;
use crate::gateway::{with_timeout, PaymentGateway, PayoutRequest, ReversalRequest};
use crate::models::{Payment, PaymentStatus, PaymentUpdate};
use crate::orders::OrderService;
use crate::store::PaymentStore;

/// Why a release was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseTrigger {
    /// The buyer confirmed delivery.
    DeliveryConfirmed,
    /// The SLA window elapsed without confirmation.
    AutoRelease,
    /// An operator released manually.
    Operator,
}

impl ReleaseTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseTrigger::DeliveryConfirmed => "delivery_confirmed",
            ReleaseTrigger::AutoRelease => "auto_release",
            ReleaseTrigger::Operator => "operator",
        }
    }

    fn remarks(&self) -> &'static str {
        match self {
            ReleaseTrigger::DeliveryConfirmed => "Delivery confirmed",
            ReleaseTrigger::AutoRelease => "Auto release",
            ReleaseTrigger::Operator => "Manual release",
        }
    }
}

impl fmt::Display for ReleaseTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct ReleaseCoordinator {
    store: Arc<dyn PaymentStore>,
    orders: Arc<dyn OrderService>,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
    gateway_timeout: Duration,
}

impl ReleaseCoordinator {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        orders: Arc<dyn OrderService>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
        gateway_timeout: Duration,
    ) -> Self {
        Self {
            store,
            orders,
            gateway,
            clock,
            gateway_timeout,
        }
    }

    async fn payment_for_order(&self, order_id: Uuid) -> Result<Payment, AppError> {
        self.store
            .find_by_order(order_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("No payment for order {}", order_id)))
    }

    /// Pays the seller for `order_id`.
    ///
    /// With [`ReleaseTrigger::DeliveryConfirmed`] the order must already be
    /// flagged delivered.
    pub async fn release_payment(
        &self,
        order_id: Uuid,
        trigger: ReleaseTrigger,
    ) -> Result<Payment, AppError> {
        let payment = self.payment_for_order(order_id).await?;

        if trigger == ReleaseTrigger::DeliveryConfirmed
            && !self.orders.is_delivery_confirmed(order_id).await?
        {
            return Err(AppError::Validation(format!(
                "Delivery not confirmed for order {}",
                order_id
            )));
        }

        let claimed = self.claim(&payment, PaymentStatus::Releasing).await?;
        let reference = self.pay_out(&claimed, trigger).await?;
        self.finalize_release(&claimed, reference, trigger).await
    }

    /// The buyer's confirmation: pays out, then flags the order delivered.
    ///
    /// If the payout fails the order stays unconfirmed so the buyer can try
    /// again and the auto-release sweep still covers the payment. If another
    /// release already holds the claim or finished, the order is flagged
    /// delivered and the call reports the payment as already handled.
    pub async fn confirm_delivery(&self, order_id: Uuid) -> Result<Payment, AppError> {
        if self.orders.get_order(order_id).await?.is_none() {
            return Err(AppError::NotFound(format!("Order not found: {}", order_id)));
        }
        let payment = self.payment_for_order(order_id).await?;

        let trigger = ReleaseTrigger::DeliveryConfirmed;
        let claimed = match self.claim(&payment, PaymentStatus::Releasing).await {
            Ok(claimed) => claimed,
            Err(
                e @ AppError::InvalidState {
                    actual: PaymentStatus::Releasing | PaymentStatus::Released,
                    ..
                },
            ) => {
                // Another release owns the payout; the confirmation still counts.
                info!(payment_id = %payment.id, order_id = %order_id, "Release already under way; recording delivery");
                self.orders.mark_delivery_confirmed(order_id).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        let reference = self.pay_out(&claimed, trigger).await?;

        if let Err(e) = self.orders.mark_delivery_confirmed(order_id).await {
            error!(
                payment_id = %claimed.id,
                order_id = %order_id,
                error = %e,
                "Payout sent but order could not be flagged delivered"
            );
        }

        self.finalize_release(&claimed, reference, trigger).await
    }

    /// Returns the funds for `order_id` to the buyer.
    pub async fn refund_payment(&self, order_id: Uuid, reason: &str) -> Result<Payment, AppError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(AppError::Validation("Refund reason is required".to_string()));
        }

        let payment = self.payment_for_order(order_id).await?;

        if payment.is_held() && payment.receipt_number.is_none() {
            return Err(AppError::Internal(format!(
                "Payment {} is held without a gateway receipt",
                payment.id
            )));
        }

        let claimed = self.claim(&payment, PaymentStatus::Refunding).await?;

        let request = ReversalRequest {
            receipt_number: claimed.receipt_number.clone().unwrap_or_default(),
            amount: claimed
                .confirmed_amount
                .clone()
                .unwrap_or_else(|| claimed.amount.clone()),
            reference: claimed.gateway_reference("RFD"),
            reason: reason.to_string(),
        };

        let reference = match with_timeout(
            self.gateway_timeout,
            self.gateway.reverse_collection(&request),
        )
        .await
        {
            Ok(reference) => reference,
            Err(e) => {
                warn!(payment_id = %claimed.id, order_id = %order_id, error = %e, "Reversal failed; reverting claim");
                self.revert(&claimed, PaymentStatus::Refunding).await;
                return Err(e.into());
            }
        };

        let now = self.clock.now();
        let result = self
            .store
            .transition(
                claimed.id,
                PaymentStatus::Refunding,
                PaymentStatus::Refunded,
                PaymentUpdate {
                    refunded_at: Some(now),
                    refund_reason: Some(reason.to_string()),
                    refund_reference: Some(reference.clone()),
                    ..Default::default()
                },
            )
            .await;

        match result {
            Ok(refunded) => {
                info!(payment_id = %refunded.id, order_id = %order_id, reference = %reference, "Payment refunded");
                Ok(refunded)
            }
            Err(e) => {
                error!(
                    payment_id = %claimed.id,
                    order_id = %order_id,
                    reference = %reference,
                    error = %e,
                    "Reversal accepted but payment could not be marked refunded"
                );
                Err(e)
            }
        }
    }

    async fn claim(&self, payment: &Payment, to: PaymentStatus) -> Result<Payment, AppError> {
        let claimed = self
            .store
            .transition(
                payment.id,
                PaymentStatus::Held,
                to,
                PaymentUpdate {
                    claimed_at: Some(self.clock.now()),
                    ..Default::default()
                },
            )
            .await?;
        info!(payment_id = %claimed.id, order_id = %claimed.order_id, status = %to, "Payment claimed");
        Ok(claimed)
    }

    /// Sends the payout for a `Releasing` payment. Reverts the claim on failure.
    async fn pay_out(&self, claimed: &Payment, trigger: ReleaseTrigger) -> Result<String, AppError> {
        let request = PayoutRequest {
            phone: claimed.payee_phone.clone(),
            amount: claimed.amount.clone(),
            reference: claimed.gateway_reference("PAY"),
            description: trigger.remarks().to_string(),
            occasion: Some(trigger.as_str().to_string()),
        };

        match with_timeout(self.gateway_timeout, self.gateway.initiate_payout(&request)).await {
            Ok(reference) => Ok(reference),
            Err(e) => {
                warn!(
                    payment_id = %claimed.id,
                    order_id = %claimed.order_id,
                    trigger = %trigger,
                    error = %e,
                    "Payout failed; reverting claim"
                );
                self.revert(claimed, PaymentStatus::Releasing).await;
                Err(e.into())
            }
        }
    }

    async fn finalize_release(
        &self,
        claimed: &Payment,
        reference: String,
        trigger: ReleaseTrigger,
    ) -> Result<Payment, AppError> {
        let now = self.clock.now();
        let result = self
            .store
            .transition(
                claimed.id,
                PaymentStatus::Releasing,
                PaymentStatus::Released,
                PaymentUpdate {
                    released_at: Some(now),
                    payout_reference: Some(reference.clone()),
                    ..Default::default()
                },
            )
            .await;

        match result {
            Ok(released) => {
                info!(
                    payment_id = %released.id,
                    order_id = %released.order_id,
                    trigger = %trigger,
                    reference = %reference,
                    "Payment released"
                );
                Ok(released)
            }
            Err(e) => {
                error!(
                    payment_id = %claimed.id,
                    order_id = %claimed.order_id,
                    reference = %reference,
                    error = %e,
                    "Payout accepted but payment could not be marked released"
                );
                Err(e)
            }
        }
    }

    async fn revert(&self, claimed: &Payment, from: PaymentStatus) {
        if let Err(e) = self
            .store
            .transition(claimed.id, from, PaymentStatus::Held, PaymentUpdate::default())
            .await
        {
            error!(
                payment_id = %claimed.id,
                order_id = %claimed.order_id,
                status = %from,
                error = %e,
                "Failed to revert claim; payment needs operator attention"
            );
        }
    }
}
