//! Payment model: the unit of escrowed money.

use std::fmt;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};
use uuid::Uuid;

/// Possible states of a payment in its escrow lifecycle.
///
/// `Releasing` and `Refunding` are provisional: a payment sits in one of them
/// only while a single actor holds the claim and talks to the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "payment_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    /// Collection request sent, waiting for the gateway callback.
    Initiated,
    /// Funds collected and retained by the platform.
    Held,
    /// Claimed for payout to the seller.
    Releasing,
    /// Paid out to the seller.
    Released,
    /// Claimed for reversal to the buyer.
    Refunding,
    /// Returned to the buyer.
    Refunded,
    /// Collection never completed. No money moved.
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Initiated => "initiated",
            PaymentStatus::Held => "held",
            PaymentStatus::Releasing => "releasing",
            PaymentStatus::Released => "released",
            PaymentStatus::Refunding => "refunding",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::Failed => "failed",
        }
    }

    /// Terminal states accept no further mutation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Released | PaymentStatus::Refunded | PaymentStatus::Failed
        )
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self, PaymentStatus::Releasing | PaymentStatus::Refunding)
    }

    /// Validates if a state transition is allowed.
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;

        matches!(
            (self, next),
            (Initiated, Held)
                | (Initiated, Failed)
                | (Held, Releasing)
                | (Releasing, Released)
                | (Releasing, Held)
                | (Held, Refunding)
                | (Refunding, Refunded)
                | (Refunding, Held)
        )
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents an escrowed payment for exactly one order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Payment {
    /// Unique identifier for this payment.
    pub id: Uuid,
    /// The order this payment settles. Unique across payments.
    pub order_id: Uuid,
    /// Buyer's wallet, normalized MSISDN.
    pub payer_phone: String,
    /// Seller's wallet, normalized MSISDN.
    pub payee_phone: String,
    /// Amount requested at creation. Never rewritten.
    pub amount: BigDecimal,
    /// Current lifecycle status.
    pub status: PaymentStatus,
    /// Mirrors `status == Held`; maintained by the store.
    pub held_by_platform: bool,
    /// Gateway correlation id of the collection request.
    pub external_ref: Option<String>,
    /// Gateway receipt for the confirmed collection.
    pub receipt_number: Option<String>,
    /// Amount the gateway reported collecting.
    pub confirmed_amount: Option<BigDecimal>,
    /// Wallet the gateway reported collecting from.
    pub confirmed_payer_phone: Option<String>,
    /// Gateway-side timestamp of the collection.
    pub transaction_date: Option<DateTime<Utc>>,
    /// Gateway reference of the payout to the seller.
    pub payout_reference: Option<String>,
    /// Gateway reference of the reversal to the buyer.
    pub refund_reference: Option<String>,
    pub failure_reason: Option<String>,
    pub refund_reason: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
    /// When the current provisional claim was taken.
    pub claimed_at: Option<DateTime<Utc>>,
    /// When a collection request was last claimed for sending. Cleared after
    /// a transient failure so the request can be resumed.
    pub collection_attempted_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Data required to create a new payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPayment {
    pub order_id: Uuid,
    pub amount: BigDecimal,
    pub payer_phone: String,
    pub payee_phone: String,
}

/// Fields written alongside a status transition.
///
/// `None` leaves the stored value untouched. Status-derived columns
/// (`held_by_platform`, `claimed_at` outside provisional states) are not
/// settable here.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PaymentUpdate {
    pub paid_at: Option<DateTime<Utc>>,
    pub receipt_number: Option<String>,
    pub confirmed_amount: Option<BigDecimal>,
    pub confirmed_payer_phone: Option<String>,
    pub transaction_date: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub payout_reference: Option<String>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub refund_reason: Option<String>,
    pub refund_reference: Option<String>,
    pub failure_reason: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
}

impl Payment {
    /// Builds a freshly initiated payment.
    pub fn initiated(new: NewPayment, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id: new.order_id,
            payer_phone: new.payer_phone,
            payee_phone: new.payee_phone,
            amount: new.amount,
            status: PaymentStatus::Initiated,
            held_by_platform: false,
            external_ref: None,
            receipt_number: None,
            confirmed_amount: None,
            confirmed_payer_phone: None,
            transaction_date: None,
            payout_reference: None,
            refund_reference: None,
            failure_reason: None,
            refund_reason: None,
            requested_at: now,
            paid_at: None,
            released_at: None,
            refunded_at: None,
            claimed_at: None,
            collection_attempted_at: None,
            updated_at: now,
        }
    }

    /// Check if the funds are currently held by the platform.
    pub fn is_held(&self) -> bool {
        self.status == PaymentStatus::Held
    }

    /// Check if the payment has been paid out to the seller.
    pub fn is_released(&self) -> bool {
        self.status == PaymentStatus::Released
    }

    /// Check if the payment has been returned to the buyer.
    pub fn is_refunded(&self) -> bool {
        self.status == PaymentStatus::Refunded
    }

    /// Check if the payment can no longer change.
    pub fn is_finalized(&self) -> bool {
        self.status.is_terminal()
    }

    /// Stable reference sent with gateway payouts and reversals for this payment.
    ///
    /// Reusing it across retries lets the gateway reject a repeated request.
    pub fn gateway_reference(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.id.simple())
    }

    /// Applies a transition in place. Callers have already checked the edge.
    pub(crate) fn apply(&mut self, to: PaymentStatus, update: PaymentUpdate, now: DateTime<Utc>) {
        self.status = to;
        self.held_by_platform = to == PaymentStatus::Held;
        self.claimed_at = if to.is_provisional() {
            update.claimed_at.or(Some(now))
        } else {
            None
        };

        if let Some(v) = update.paid_at {
            self.paid_at = Some(v);
        }
        if let Some(v) = update.receipt_number {
            self.receipt_number = Some(v);
        }
        if let Some(v) = update.confirmed_amount {
            self.confirmed_amount = Some(v);
        }
        if let Some(v) = update.confirmed_payer_phone {
            self.confirmed_payer_phone = Some(v);
        }
        if let Some(v) = update.transaction_date {
            self.transaction_date = Some(v);
        }
        if let Some(v) = update.released_at {
            self.released_at = Some(v);
        }
        if let Some(v) = update.payout_reference {
            self.payout_reference = Some(v);
        }
        if let Some(v) = update.refunded_at {
            self.refunded_at = Some(v);
        }
        if let Some(v) = update.refund_reason {
            self.refund_reason = Some(v);
        }
        if let Some(v) = update.refund_reference {
            self.refund_reference = Some(v);
        }
        if let Some(v) = update.failure_reason {
            self.failure_reason = Some(v);
        }
        self.updated_at = now;
    }
}

impl NewPayment {
    /// Create a new payment request for an order.
    pub fn new(order_id: Uuid, amount: BigDecimal, payer_phone: String, payee_phone: String) -> Self {
        Self {
            order_id,
            amount,
            payer_phone,
            payee_phone,
        }
    }
}
