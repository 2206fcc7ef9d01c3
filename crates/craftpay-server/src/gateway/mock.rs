//! In-process gateway for tests and local development.
//!
//! Records every call and can be scripted to fail or stall, which is how the
//! timeout, revert and exactly-once paths are exercised without a network.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{CollectionRequest, GatewayError, PaymentGateway, PayoutRequest, ReversalRequest};

/// A call as the mock received it.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCall {
    Collection(CollectionRequest),
    Payout(PayoutRequest),
    Reversal(ReversalRequest),
}

#[derive(Debug, Default)]
pub struct MockGateway {
    calls: Mutex<Vec<GatewayCall>>,
    failures: Mutex<VecDeque<GatewayError>>,
    delay: Mutex<Option<Duration>>,
    sequence: AtomicU64,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a failure; each queued error is returned by one subsequent call.
    pub fn fail_next(&self, error: GatewayError) {
        lock(&self.failures).push_back(error);
    }

    /// Makes every subsequent call wait before answering.
    pub fn stall_for(&self, delay: Duration) {
        *lock(&self.delay) = Some(delay);
    }

    pub fn clear_stall(&self) {
        *lock(&self.delay) = None;
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        lock(&self.calls).clone()
    }

    pub fn collections(&self) -> Vec<CollectionRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                GatewayCall::Collection(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn payouts(&self) -> Vec<PayoutRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                GatewayCall::Payout(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn reversals(&self) -> Vec<ReversalRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                GatewayCall::Reversal(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    async fn answer(&self, call: GatewayCall, prefix: &str) -> Result<String, GatewayError> {
        lock(&self.calls).push(call);

        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = lock(&self.failures).pop_front();
        if let Some(error) = failure {
            return Err(error);
        }

        let n = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("{}_{:08}", prefix, n))
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn initiate_collection(&self, request: &CollectionRequest) -> Result<String, GatewayError> {
        self.answer(GatewayCall::Collection(request.clone()), "ws_CO").await
    }

    async fn initiate_payout(&self, request: &PayoutRequest) -> Result<String, GatewayError> {
        self.answer(GatewayCall::Payout(request.clone()), "AG").await
    }

    async fn reverse_collection(&self, request: &ReversalRequest) -> Result<String, GatewayError> {
        self.answer(GatewayCall::Reversal(request.clone()), "RV").await
    }
}
