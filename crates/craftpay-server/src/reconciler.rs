//! Applies asynchronous collection results from the gateway.
//!
//! Webhooks can arrive late, twice, or concurrently. The only mutation this
//! module performs is `Initiated -> Held | Failed` through the store's
//! compare-and-swap, so a replay can never move a payment a second time.

use std::str::FromStr;
use std::sync::Arc;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::AppError;
use crate::gateway::daraja::parse_daraja_timestamp;
use crate::models::{PaymentStatus, PaymentUpdate};
use crate::store::PaymentStore;

/// `{"Body": {"stkCallback": {...}}}`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StkCallbackEnvelope {
    #[serde(rename = "Body")]
    pub body: StkCallbackBody,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StkCallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: StkCallback,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StkCallback {
    #[serde(rename = "MerchantRequestID", default)]
    pub merchant_request_id: Option<String>,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    /// Sent as a number; some relays stringify it.
    pub result_code: Value,
    pub result_desc: String,
    #[serde(default)]
    pub callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CallbackMetadata {
    #[serde(default)]
    pub item: Vec<MetadataItem>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetadataItem {
    pub name: String,
    #[serde(default)]
    pub value: Option<Value>,
}

/// What the gateway reported about a confirmed collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionConfirmation {
    pub receipt_number: String,
    pub amount: BigDecimal,
    pub phone: Option<String>,
    pub transaction_date: Option<DateTime<Utc>>,
}

/// A validated callback.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionResult {
    Confirmed {
        external_ref: String,
        confirmation: CollectionConfirmation,
    },
    Declined {
        external_ref: String,
        result_code: i64,
        description: String,
    },
}

impl CollectionResult {
    pub fn external_ref(&self) -> &str {
        match self {
            CollectionResult::Confirmed { external_ref, .. } => external_ref,
            CollectionResult::Declined { external_ref, .. } => external_ref,
        }
    }
}

/// What a callback did. Every variant is acknowledged to the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Held { payment_id: Uuid },
    Failed { payment_id: Uuid },
    /// The payment had already left `Initiated`.
    Duplicate { payment_id: Uuid, status: PaymentStatus },
    UnknownReference { external_ref: String },
    /// Structurally invalid; nothing was touched.
    Rejected { reason: String },
}

impl StkCallback {
    fn item(&self, name: &str) -> Option<&Value> {
        self.callback_metadata
            .as_ref()?
            .item
            .iter()
            .find(|i| i.name == name)
            .and_then(|i| i.value.as_ref())
    }

    /// Checks the structure and extracts the typed result.
    pub fn validate(&self) -> Result<CollectionResult, String> {
        let external_ref = self.checkout_request_id.trim();
        if external_ref.is_empty() {
            return Err("empty CheckoutRequestID".to_string());
        }
        let external_ref = external_ref.to_string();

        let result_code = match &self.result_code {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
        .ok_or_else(|| format!("unreadable ResultCode {}", self.result_code))?;

        let description = self.result_desc.trim();
        if description.is_empty() {
            return Err("empty ResultDesc".to_string());
        }

        if result_code != 0 {
            return Ok(CollectionResult::Declined {
                external_ref,
                result_code,
                description: description.to_string(),
            });
        }

        let receipt_number = self
            .item("MpesaReceiptNumber")
            .and_then(value_as_string)
            .filter(|r| !r.is_empty())
            .ok_or("success callback without MpesaReceiptNumber")?;

        let amount = self
            .item("Amount")
            .and_then(value_as_string)
            .and_then(|raw| BigDecimal::from_str(&raw).ok())
            .ok_or("success callback without a readable Amount")?;

        let phone = self.item("PhoneNumber").and_then(|value| {
            let phone = value_as_string(value).filter(|p| !p.is_empty());
            if phone.is_none() {
                warn!(external_ref = %external_ref, value = %value, "Ignoring unreadable PhoneNumber");
            }
            phone
        });
        let transaction_date = self.item("TransactionDate").and_then(|value| {
            let date = value_as_string(value).and_then(|raw| parse_daraja_timestamp(&raw));
            if date.is_none() {
                warn!(external_ref = %external_ref, value = %value, "Ignoring unreadable TransactionDate");
            }
            date
        });

        Ok(CollectionResult::Confirmed {
            external_ref,
            confirmation: CollectionConfirmation {
                receipt_number,
                amount,
                phone,
                transaction_date,
            },
        })
    }
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub struct CallbackReconciler {
    store: Arc<dyn PaymentStore>,
    clock: Arc<dyn Clock>,
}

impl CallbackReconciler {
    pub fn new(store: Arc<dyn PaymentStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Reconciles one webhook body.
    ///
    /// Only storage failures are returned as errors; everything else is an
    /// outcome the caller should acknowledge.
    pub async fn handle(&self, payload: &Value) -> Result<ReconcileOutcome, AppError> {
        let result = match StkCallbackEnvelope::deserialize(payload)
            .map_err(|e| e.to_string())
            .and_then(|envelope| envelope.body.stk_callback.validate())
        {
            Ok(result) => result,
            Err(reason) => {
                warn!(reason = %reason, "Rejected malformed collection callback");
                return Ok(ReconcileOutcome::Rejected { reason });
            }
        };

        self.apply(result).await
    }

    /// Applies an already-validated result.
    pub async fn apply(&self, result: CollectionResult) -> Result<ReconcileOutcome, AppError> {
        let external_ref = result.external_ref().to_string();

        let Some(payment) = self.store.find_by_external_ref(&external_ref).await? else {
            warn!(external_ref = %external_ref, "Callback for unknown collection reference");
            return Ok(ReconcileOutcome::UnknownReference { external_ref });
        };

        if payment.status != PaymentStatus::Initiated {
            info!(
                payment_id = %payment.id,
                external_ref = %external_ref,
                status = %payment.status,
                "Duplicate collection callback ignored"
            );
            return Ok(ReconcileOutcome::Duplicate {
                payment_id: payment.id,
                status: payment.status,
            });
        }

        let (to, update) = match result {
            CollectionResult::Confirmed { confirmation, .. } => {
                if confirmation.amount != payment.amount {
                    warn!(
                        payment_id = %payment.id,
                        external_ref = %external_ref,
                        expected = %payment.amount,
                        confirmed = %confirmation.amount,
                        "Collected amount differs from requested amount"
                    );
                }
                (
                    PaymentStatus::Held,
                    PaymentUpdate {
                        paid_at: Some(self.clock.now()),
                        receipt_number: Some(confirmation.receipt_number),
                        confirmed_amount: Some(confirmation.amount),
                        confirmed_payer_phone: confirmation.phone,
                        transaction_date: confirmation.transaction_date,
                        ..Default::default()
                    },
                )
            }
            CollectionResult::Declined {
                result_code,
                description,
                ..
            } => (
                PaymentStatus::Failed,
                PaymentUpdate {
                    failure_reason: Some(format!("{} (code {})", description, result_code)),
                    ..Default::default()
                },
            ),
        };

        match self
            .store
            .transition(payment.id, PaymentStatus::Initiated, to, update)
            .await
        {
            Ok(updated) if updated.status == PaymentStatus::Held => {
                info!(payment_id = %updated.id, external_ref = %external_ref, "Funds held in escrow");
                Ok(ReconcileOutcome::Held { payment_id: updated.id })
            }
            Ok(updated) => {
                info!(
                    payment_id = %updated.id,
                    external_ref = %external_ref,
                    reason = updated.failure_reason.as_deref().unwrap_or_default(),
                    "Collection failed"
                );
                Ok(ReconcileOutcome::Failed { payment_id: updated.id })
            }
            Err(AppError::InvalidState { actual, .. }) => {
                info!(payment_id = %payment.id, status = %actual, "Concurrent duplicate callback lost the race");
                Ok(ReconcileOutcome::Duplicate {
                    payment_id: payment.id,
                    status: actual,
                })
            }
            Err(e) => {
                error!(payment_id = %payment.id, external_ref = %external_ref, error = %e, "Failed to apply collection callback");
                Err(e)
            }
        }
    }
}
