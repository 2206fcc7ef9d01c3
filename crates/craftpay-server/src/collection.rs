//! Starts the escrow lifecycle: one payment per order, one collection request.

use std::sync::Arc;
use std::time::Duration;

use bigdecimal::BigDecimal;
use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::gateway::msisdn::normalize_msisdn;
use crate::gateway::{with_timeout, CollectionRequest, GatewayError, PaymentGateway};
use crate::models::{NewPayment, OrderStatus, Payment, PaymentStatus, PaymentUpdate};
use crate::orders::OrderService;
use crate::store::PaymentStore;

/// Daraja truncates longer account references.
const ACCOUNT_REFERENCE_LEN: usize = 12;
/// Daraja limit on `TransactionDesc`.
const DESCRIPTION_LEN: usize = 13;
const DEFAULT_DESCRIPTION: &str = "Order payment";

pub struct CollectionInitiator {
    store: Arc<dyn PaymentStore>,
    orders: Arc<dyn OrderService>,
    gateway: Arc<dyn PaymentGateway>,
    gateway_timeout: Duration,
    /// A collection claim older than this belongs to a request that died
    /// without finishing and may be taken over.
    claim_ttl: chrono::Duration,
}

impl CollectionInitiator {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        orders: Arc<dyn OrderService>,
        gateway: Arc<dyn PaymentGateway>,
        gateway_timeout: Duration,
    ) -> Self {
        Self {
            store,
            orders,
            gateway,
            gateway_timeout,
            claim_ttl: chrono::Duration::from_std(gateway_timeout * 2)
                .unwrap_or_else(|_| chrono::Duration::hours(1)),
        }
    }

    /// Creates the order's payment and sends the collection request.
    ///
    /// `payer_phone` defaults to the buyer's registered phone. The payee is
    /// always the seller and the amount is always the order total.
    ///
    /// A payment left `Initiated` without an external reference (the previous
    /// request failed transiently) is resumed instead of rejected. Any other
    /// existing payment is a [`AppError::Duplicate`].
    ///
    /// Only the caller holding the store's collection claim talks to the
    /// gateway, so concurrent calls send the payer one prompt.
    pub async fn initiate(
        &self,
        order_id: Uuid,
        payer_phone: Option<&str>,
        description: Option<&str>,
    ) -> Result<Payment, AppError> {
        let order = self
            .orders
            .get_order(order_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Order not found: {}", order_id)))?;

        if order.status == OrderStatus::Cancelled {
            return Err(AppError::Validation(format!(
                "Order {} is cancelled",
                order_id
            )));
        }
        if order.total_amount <= BigDecimal::from(0) {
            return Err(AppError::Validation(format!(
                "Order {} has no amount to collect",
                order_id
            )));
        }

        let payment = match self.store.find_by_order(order_id).await? {
            Some(existing) if is_resumable(&existing) => {
                info!(payment_id = %existing.id, order_id = %order_id, "Resuming collection");
                existing
            }
            Some(existing) => {
                return Err(AppError::Duplicate(format!(
                    "Payment {} already exists for order {} ({})",
                    existing.id, order_id, existing.status
                )));
            }
            None => {
                let payer = normalize_msisdn(payer_phone.unwrap_or(&order.buyer_phone))?;
                let payee = normalize_msisdn(&order.seller_phone)?;
                self.store
                    .create_payment(NewPayment::new(
                        order_id,
                        order.total_amount.clone(),
                        payer,
                        payee,
                    ))
                    .await?
            }
        };

        let now = Utc::now();
        let payment = match self
            .store
            .claim_collection(payment.id, now, now - self.claim_ttl)
            .await
        {
            Ok(claimed) => claimed,
            Err(AppError::InvalidState { actual, .. }) => {
                info!(payment_id = %payment.id, order_id = %order_id, status = %actual, "Collection already in progress");
                return Err(AppError::Duplicate(format!(
                    "Collection already in progress for order {}",
                    order_id
                )));
            }
            Err(e) => return Err(e),
        };

        let request = CollectionRequest {
            phone: payment.payer_phone.clone(),
            amount: payment.amount.clone(),
            reference: account_reference(order_id),
            description: truncate(description.unwrap_or(DEFAULT_DESCRIPTION), DESCRIPTION_LEN),
        };

        match with_timeout(self.gateway_timeout, self.gateway.initiate_collection(&request)).await {
            Ok(external_ref) => {
                let payment = self
                    .store
                    .attach_external_ref(payment.id, &external_ref)
                    .await?;
                info!(
                    payment_id = %payment.id,
                    order_id = %order_id,
                    external_ref = %external_ref,
                    "Collection requested"
                );
                Ok(payment)
            }
            Err(e @ GatewayError::Transient(_)) => {
                warn!(payment_id = %payment.id, order_id = %order_id, error = %e, "Collection request failed; payment left initiated");
                if let Err(release_err) = self.store.release_collection(payment.id).await {
                    error!(
                        payment_id = %payment.id,
                        order_id = %order_id,
                        error = %release_err,
                        "Could not release collection claim"
                    );
                }
                Err(e.into())
            }
            Err(e @ GatewayError::Permanent(_)) => {
                warn!(payment_id = %payment.id, order_id = %order_id, error = %e, "Collection request rejected");
                self.store
                    .transition(
                        payment.id,
                        PaymentStatus::Initiated,
                        PaymentStatus::Failed,
                        PaymentUpdate {
                            failure_reason: Some(e.to_string()),
                            ..Default::default()
                        },
                    )
                    .await?;
                Err(e.into())
            }
        }
    }
}

fn is_resumable(payment: &Payment) -> bool {
    payment.status == PaymentStatus::Initiated && payment.external_ref.is_none()
}

/// The reference the payer sees on their phone.
pub fn account_reference(order_id: Uuid) -> String {
    let id = order_id.simple().to_string().to_uppercase();
    format!("CP{}", &id[..ACCOUNT_REFERENCE_LEN - 2])
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockGateway;
    use crate::models::Order;
    use crate::orders::InMemoryOrderService;
    use crate::store::InMemoryPaymentStore;

    struct Fixture {
        store: Arc<InMemoryPaymentStore>,
        orders: Arc<InMemoryOrderService>,
        gateway: Arc<MockGateway>,
        initiator: CollectionInitiator,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryPaymentStore::new());
        let orders = Arc::new(InMemoryOrderService::new());
        let gateway = Arc::new(MockGateway::new());
        let initiator = CollectionInitiator::new(
            store.clone(),
            orders.clone(),
            gateway.clone(),
            Duration::from_secs(5),
        );
        Fixture {
            store,
            orders,
            gateway,
            initiator,
        }
    }

    async fn order(f: &Fixture) -> Order {
        f.orders
            .insert(Order::new("0712345678", "0798765432", BigDecimal::from(1000)))
            .await
    }

    #[tokio::test]
    async fn test_initiate_creates_payment_and_requests_collection() {
        let f = fixture();
        let order = order(&f).await;

        let payment = f
            .initiator
            .initiate(order.id, None, Some("Handwoven basket order"))
            .await
            .unwrap();

        assert_eq!(payment.status, PaymentStatus::Initiated);
        assert_eq!(payment.payer_phone, "254712345678");
        assert_eq!(payment.payee_phone, "254798765432");
        assert_eq!(payment.amount, BigDecimal::from(1000));
        assert!(payment.external_ref.as_deref().unwrap().starts_with("ws_CO_"));

        let collections = f.gateway.collections();
        assert_eq!(collections.len(), 1);
        assert_eq!(collections[0].description, "Handwoven bas");
        assert_eq!(collections[0].reference.len(), ACCOUNT_REFERENCE_LEN);
    }

    #[tokio::test]
    async fn test_payer_phone_override() {
        let f = fixture();
        let order = order(&f).await;

        let payment = f
            .initiator
            .initiate(order.id, Some("+254 711 000 111"), None)
            .await
            .unwrap();
        assert_eq!(payment.payer_phone, "254711000111");
    }

    #[tokio::test]
    async fn test_second_initiation_is_duplicate() {
        let f = fixture();
        let order = order(&f).await;

        f.initiator.initiate(order.id, None, None).await.unwrap();
        let err = f.initiator.initiate(order.id, None, None).await.unwrap_err();

        assert!(matches!(err, AppError::Duplicate(_)));
        assert_eq!(f.gateway.collections().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_can_be_resumed() {
        let f = fixture();
        let order = order(&f).await;
        f.gateway.fail_next(GatewayError::Transient("503".into()));

        let err = f.initiator.initiate(order.id, None, None).await.unwrap_err();
        assert!(err.is_retryable());

        let stuck = f.store.find_by_order(order.id).await.unwrap().unwrap();
        assert_eq!(stuck.status, PaymentStatus::Initiated);
        assert!(stuck.external_ref.is_none());

        let resumed = f.initiator.initiate(order.id, None, None).await.unwrap();
        assert_eq!(resumed.id, stuck.id);
        assert!(resumed.external_ref.is_some());
        assert_eq!(f.store.all().await.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_resumes_send_one_collection() {
        let f = Arc::new(fixture());
        let order_id = order(&f).await.id;
        f.gateway.fail_next(GatewayError::Transient("503".into()));
        f.initiator.initiate(order_id, None, None).await.unwrap_err();
        assert_eq!(f.gateway.collections().len(), 1);

        f.gateway.stall_for(Duration::from_millis(50));
        let first = {
            let f = f.clone();
            tokio::spawn(async move { f.initiator.initiate(order_id, None, None).await })
        };
        let second = {
            let f = f.clone();
            tokio::spawn(async move { f.initiator.initiate(order_id, None, None).await })
        };
        let first = first.await.unwrap();
        let second = second.await.unwrap();

        assert!(first.is_ok() ^ second.is_ok());
        let loser = first.as_ref().err().or(second.as_ref().err()).unwrap();
        assert!(matches!(loser, AppError::Duplicate(_)));

        // one retry reached the payer and its reference is the one stored
        let collections = f.gateway.collections();
        assert_eq!(collections.len(), 2);
        let winner = first.or(second).unwrap();
        let stored = f.store.find_by_order(order_id).await.unwrap().unwrap();
        assert_eq!(stored.external_ref, winner.external_ref);
    }

    #[tokio::test]
    async fn test_abandoned_collection_claim_can_be_taken_over() {
        let f = fixture();
        let order = order(&f).await;
        let payment = f
            .store
            .create_payment(NewPayment::new(
                order.id,
                BigDecimal::from(1000),
                "254712345678".to_string(),
                "254798765432".to_string(),
            ))
            .await
            .unwrap();
        let long_ago = Utc::now() - chrono::Duration::hours(2);
        f.store
            .claim_collection(payment.id, long_ago, long_ago)
            .await
            .unwrap();

        let resumed = f.initiator.initiate(order.id, None, None).await.unwrap();
        assert_eq!(resumed.id, payment.id);
        assert!(resumed.external_ref.is_some());
        assert_eq!(f.gateway.collections().len(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_fails_payment() {
        let f = fixture();
        let order = order(&f).await;
        f.gateway
            .fail_next(GatewayError::Permanent("Invalid PhoneNumber".into()));

        let err = f.initiator.initiate(order.id, None, None).await.unwrap_err();
        assert!(!err.is_retryable());

        let failed = f.store.find_by_order(order.id).await.unwrap().unwrap();
        assert_eq!(failed.status, PaymentStatus::Failed);
        assert!(failed.failure_reason.unwrap().contains("Invalid PhoneNumber"));
    }

    #[tokio::test]
    async fn test_unknown_order_and_bad_phone() {
        let f = fixture();
        let err = f
            .initiator
            .initiate(Uuid::new_v4(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let order = order(&f).await;
        let err = f
            .initiator
            .initiate(order.id, Some("not-a-phone"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(f.gateway.calls().is_empty());
    }

    #[test]
    fn test_account_reference() {
        let id = Uuid::parse_str("0f8fad5b-d9cb-469f-a165-70867728950e").unwrap();
        assert_eq!(account_reference(id), "CP0F8FAD5BD9");
    }
}
