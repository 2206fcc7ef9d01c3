//! Error types for the CraftPay server.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use uuid::Uuid;

use crate::gateway::GatewayError;
use crate::models::PaymentStatus;

/// Application error type.
///
/// Every escrow operation reports failures through this enum. The HTTP layer
/// maps each variant onto one of the three caller-visible outcomes: the
/// request was invalid, the payment was already handled, or the gateway
/// failed and the action should be retried (or escalated).
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A compare-and-swap lost, or the requested edge is not in the graph.
    #[error("Payment {payment_id} is {actual}; {from} -> {to} not applied")]
    InvalidState {
        payment_id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
        actual: PaymentStatus,
    },

    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// True when another actor already moved the payment on.
    pub fn is_already_handled(&self) -> bool {
        matches!(self, AppError::InvalidState { .. })
    }

    /// True when repeating the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Gateway(e) => e.is_transient(),
            AppError::Database(_) => true,
            _ => false,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
            AppError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response()
            }
            AppError::NotFound(msg) => {
                (StatusCode::NOT_FOUND, Json(json!({ "error": msg }))).into_response()
            }
            AppError::InvalidState { actual, .. } => (
                StatusCode::CONFLICT,
                Json(json!({ "outcome": "already_handled", "status": actual })),
            )
                .into_response(),
            AppError::Duplicate(msg) => {
                (StatusCode::CONFLICT, Json(json!({ "error": msg }))).into_response()
            }
            AppError::Gateway(e) if e.is_transient() => {
                tracing::warn!("Transient gateway failure: {}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({ "outcome": "retry_later", "error": e.to_string() })),
                )
                    .into_response()
            }
            AppError::Gateway(e) => {
                tracing::error!("Gateway rejected request: {}", e);
                (
                    StatusCode::BAD_GATEWAY,
                    Json(json!({
                        "outcome": "failed",
                        "requiresOperator": true,
                        "error": e.to_string()
                    })),
                )
                    .into_response()
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let cases = vec![
            (AppError::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (AppError::NotFound("gone".into()), StatusCode::NOT_FOUND),
            (AppError::Duplicate("twice".into()), StatusCode::CONFLICT),
            (
                AppError::InvalidState {
                    payment_id: Uuid::new_v4(),
                    from: PaymentStatus::Held,
                    to: PaymentStatus::Refunding,
                    actual: PaymentStatus::Released,
                },
                StatusCode::CONFLICT,
            ),
            (
                AppError::Gateway(GatewayError::Transient("timeout".into())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                AppError::Gateway(GatewayError::Permanent("rejected".into())),
                StatusCode::BAD_GATEWAY,
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }

    #[test]
    fn test_retryable_classification() {
        assert!(AppError::Gateway(GatewayError::Transient("503".into())).is_retryable());
        assert!(!AppError::Gateway(GatewayError::Permanent("400".into())).is_retryable());
        assert!(!AppError::Validation("x".into()).is_retryable());
    }

    #[test]
    fn test_invalid_state_message() {
        let id = Uuid::new_v4();
        let err = AppError::InvalidState {
            payment_id: id,
            from: PaymentStatus::Held,
            to: PaymentStatus::Refunding,
            actual: PaymentStatus::Released,
        };
        assert!(err.is_already_handled());
        assert_eq!(
            err.to_string(),
            format!("Payment {} is released; held -> refunding not applied", id)
        );
    }
}
