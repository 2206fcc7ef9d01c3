//! Escrow payment routes.
//!
//! The buyer starts a collection and confirms delivery, the gateway posts
//! collection results to `/callback`, and operators release, refund or force
//! a sweep.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{Payment, PaymentStatus};
use crate::reconciler::ReconcileOutcome;
use crate::release::ReleaseTrigger;
use crate::scheduler::SweepReport;
use crate::state::AppState;

/// Creates the payments router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/collect", post(collect))
        .route("/callback", post(callback))
        .route("/confirm-delivery", post(confirm_delivery))
        .route("/release", post(release))
        .route("/refund", post(refund))
        .route("/sweep", post(sweep))
        .route("/{order_id}", get(get_payment))
        .with_state(state)
}

/// Request body for starting a collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectRequest {
    pub order_id: Uuid,
    /// Defaults to the buyer's registered phone.
    #[serde(default)]
    pub payer_phone: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub order_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundRequest {
    pub order_id: Uuid,
    pub reason: String,
}

/// A payment as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentResponse {
    pub id: Uuid,
    pub order_id: Uuid,
    pub status: PaymentStatus,
    /// Decimal string, e.g. "1000.00".
    pub amount: String,
    pub payer_phone: String,
    pub payee_phone: String,
    pub held_by_platform: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payout_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_reason: Option<String>,
    pub requested_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub released_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refunded_at: Option<DateTime<Utc>>,
}

impl From<Payment> for PaymentResponse {
    fn from(p: Payment) -> Self {
        Self {
            id: p.id,
            order_id: p.order_id,
            status: p.status,
            amount: p.amount.with_scale(2).to_string(),
            payer_phone: p.payer_phone,
            payee_phone: p.payee_phone,
            held_by_platform: p.held_by_platform,
            external_ref: p.external_ref,
            receipt_number: p.receipt_number,
            payout_reference: p.payout_reference,
            refund_reference: p.refund_reference,
            failure_reason: p.failure_reason,
            refund_reason: p.refund_reason,
            requested_at: p.requested_at,
            paid_at: p.paid_at,
            released_at: p.released_at,
            refunded_at: p.refunded_at,
        }
    }
}

/// Body of a successful release or refund.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeResponse {
    /// Always "succeeded"; failures are rendered by [`AppError`].
    pub outcome: String,
    pub payment: PaymentResponse,
}

impl OutcomeResponse {
    fn succeeded(payment: Payment) -> Self {
        Self {
            outcome: "succeeded".to_string(),
            payment: payment.into(),
        }
    }
}

/// POST /api/v1/payments/collect
///
/// Creates the order's payment and sends the collection request to the
/// payer's phone. Returns 201 with the initiated payment.
async fn collect(
    State(state): State<AppState>,
    Json(request): Json<CollectRequest>,
) -> Result<(StatusCode, Json<PaymentResponse>), AppError> {
    let payment = state
        .collection
        .initiate(
            request.order_id,
            request.payer_phone.as_deref(),
            request.description.as_deref(),
        )
        .await?;

    Ok((StatusCode::CREATED, Json(payment.into())))
}

/// POST /api/v1/payments/callback
///
/// Gateway webhook for collection results. Always acknowledged so the
/// gateway stops redelivering, unless the body is not JSON at all.
async fn callback(State(state): State<AppState>, body: Bytes) -> Response {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "Callback body is not JSON");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "ResultCode": 1, "ResultDesc": "Invalid JSON" })),
            )
                .into_response();
        }
    };

    match state.reconciler.handle(&payload).await {
        Ok(ReconcileOutcome::Rejected { reason }) => {
            warn!(reason = %reason, "Acknowledged invalid callback without changes");
        }
        Ok(_) => {}
        Err(e) => {
            error!(error = %e, "Callback could not be applied; acknowledged anyway");
        }
    }

    acknowledge()
}

fn acknowledge() -> Response {
    (
        StatusCode::OK,
        Json(json!({ "ResultCode": 0, "ResultDesc": "Accepted" })),
    )
        .into_response()
}

/// POST /api/v1/payments/confirm-delivery
///
/// The buyer confirms receipt; the seller is paid out.
async fn confirm_delivery(
    State(state): State<AppState>,
    Json(request): Json<OrderRequest>,
) -> Result<Json<OutcomeResponse>, AppError> {
    let payment = state.coordinator.confirm_delivery(request.order_id).await?;
    Ok(Json(OutcomeResponse::succeeded(payment)))
}

/// POST /api/v1/payments/release
///
/// Operator release, regardless of delivery confirmation.
async fn release(
    State(state): State<AppState>,
    Json(request): Json<OrderRequest>,
) -> Result<Json<OutcomeResponse>, AppError> {
    let payment = state
        .coordinator
        .release_payment(request.order_id, ReleaseTrigger::Operator)
        .await?;
    Ok(Json(OutcomeResponse::succeeded(payment)))
}

/// POST /api/v1/payments/refund
async fn refund(
    State(state): State<AppState>,
    Json(request): Json<RefundRequest>,
) -> Result<Json<OutcomeResponse>, AppError> {
    let payment = state
        .coordinator
        .refund_payment(request.order_id, &request.reason)
        .await?;
    Ok(Json(OutcomeResponse::succeeded(payment)))
}

/// POST /api/v1/payments/sweep
///
/// Runs one auto-release pass now instead of waiting for the next tick.
async fn sweep(State(state): State<AppState>) -> Result<Json<SweepReport>, AppError> {
    let report = state.scheduler.sweep().await?;
    Ok(Json(report))
}

/// GET /api/v1/payments/{order_id}
async fn get_payment(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<PaymentResponse>, AppError> {
    let payment = state
        .store
        .find_by_order(order_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No payment for order {}", order_id)))?;

    Ok(Json(payment.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;
    use crate::models::NewPayment;

    #[test]
    fn test_payment_response_serialization() {
        let payment = Payment::initiated(
            NewPayment::new(
                Uuid::new_v4(),
                BigDecimal::from(1000),
                "254712345678".to_string(),
                "254798765432".to_string(),
            ),
            Utc::now(),
        );

        let json = serde_json::to_value(PaymentResponse::from(payment)).unwrap();
        assert_eq!(json["status"], "initiated");
        assert_eq!(json["amount"], "1000.00");
        assert_eq!(json["heldByPlatform"], false);
        assert!(json.get("externalRef").is_none());
        assert!(json.get("releasedAt").is_none());
    }

    #[test]
    fn test_refund_request_deserialization() {
        let request: RefundRequest = serde_json::from_value(json!({
            "orderId": "0f8fad5b-d9cb-469f-a165-70867728950e",
            "reason": "damaged"
        }))
        .unwrap();
        assert_eq!(request.reason, "damaged");
    }
}
