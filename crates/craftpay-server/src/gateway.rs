//! Mobile-money gateway seam.
//!
//! The escrow engine only ever talks to the gateway through
//! [`PaymentGateway`]. Every failure is classified up front: a
//! [`GatewayError::Transient`] leaves the payment where it was and may be
//! retried, a [`GatewayError::Permanent`] must never be retried
//! automatically.

pub mod daraja;
pub mod mock;
pub mod msisdn;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bigdecimal::BigDecimal;

pub use daraja::{DarajaClient, DarajaConfig};
pub use mock::{GatewayCall, MockGateway};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// Timeout, connection failure, 5xx. Safe to retry.
    #[error("Transient gateway failure: {0}")]
    Transient(String),

    /// 4xx or business rejection. Not safe to retry.
    #[error("Gateway rejected request: {0}")]
    Permanent(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}

/// Pull funds from the buyer's wallet into escrow.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionRequest {
    pub phone: String,
    pub amount: BigDecimal,
    /// Account reference shown to the payer.
    pub reference: String,
    pub description: String,
}

/// Push escrowed funds to the seller's wallet.
#[derive(Debug, Clone, PartialEq)]
pub struct PayoutRequest {
    pub phone: String,
    pub amount: BigDecimal,
    /// Stable per payment; lets the gateway drop a repeated payout.
    pub reference: String,
    pub description: String,
    pub occasion: Option<String>,
}

/// Return a confirmed collection to the buyer.
#[derive(Debug, Clone, PartialEq)]
pub struct ReversalRequest {
    /// Receipt of the collection being reversed.
    pub receipt_number: String,
    pub amount: BigDecimal,
    pub reference: String,
    pub reason: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Sends a collection request. Returns the gateway's correlation id
    /// (the externalRef the callback will carry).
    async fn initiate_collection(&self, request: &CollectionRequest) -> Result<String, GatewayError>;

    /// Sends a payout. Returns the gateway's payout reference.
    async fn initiate_payout(&self, request: &PayoutRequest) -> Result<String, GatewayError>;

    /// Reverses a collection. Returns the gateway's reversal reference.
    async fn reverse_collection(&self, request: &ReversalRequest) -> Result<String, GatewayError>;
}

/// Bounds a gateway call. Running out of time counts as a transient failure.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, GatewayError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Transient(format!(
            "gateway call timed out after {}ms",
            limit.as_millis()
        ))),
    }
}
