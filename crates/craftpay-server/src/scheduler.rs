//! Auto-release: pays sellers whose buyers never confirmed delivery.
//!
//! Each sweep reads the time from the injected [`Clock`], picks held payments
//! collected longer ago than the SLA window, and sends each one through
//! [`ReleaseCoordinator::release_payment`]. A payment another actor has
//! claimed is no longer `Held`, so concurrent sweeps never pay twice.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::AppError;
use crate::orders::OrderService;
use crate::release::{ReleaseCoordinator, ReleaseTrigger};
use crate::store::PaymentStore;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// How long a payment stays held before it is released without
    /// confirmation.
    pub sla: chrono::Duration,
    /// Age after which a provisional claim is reported as stuck.
    pub claim_timeout: chrono::Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            sla: chrono::Duration::hours(24),
            claim_timeout: chrono::Duration::minutes(15),
        }
    }
}

/// Counts from one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub examined: usize,
    pub released: usize,
    /// Delivery was confirmed; left for the confirmation path.
    pub skipped: usize,
    /// Claimed or finished by someone else mid-sweep.
    pub already_handled: usize,
    pub failed: usize,
    /// Provisional claims older than the claim timeout.
    pub stale_claims: usize,
}

pub struct AutoReleaseScheduler {
    store: Arc<dyn PaymentStore>,
    orders: Arc<dyn OrderService>,
    coordinator: Arc<ReleaseCoordinator>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl AutoReleaseScheduler {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        orders: Arc<dyn OrderService>,
        coordinator: Arc<ReleaseCoordinator>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            orders,
            coordinator,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Runs one pass over overdue held payments.
    pub async fn sweep(&self) -> Result<SweepReport, AppError> {
        let now = self.clock.now();
        let candidates = self.store.find_overdue_held(now - self.config.sla).await?;

        let mut report = SweepReport {
            examined: candidates.len(),
            ..Default::default()
        };

        for payment in candidates {
            match self.orders.is_delivery_confirmed(payment.order_id).await {
                Ok(true) => {
                    debug!(payment_id = %payment.id, order_id = %payment.order_id, "Delivery confirmed; skipping auto-release");
                    report.skipped += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(payment_id = %payment.id, order_id = %payment.order_id, error = %e, "Could not read order; skipping");
                    report.failed += 1;
                    continue;
                }
            }

            match self
                .coordinator
                .release_payment(payment.order_id, ReleaseTrigger::AutoRelease)
                .await
            {
                Ok(_) => report.released += 1,
                Err(e) if e.is_already_handled() => {
                    debug!(payment_id = %payment.id, error = %e, "Payment handled concurrently");
                    report.already_handled += 1;
                }
                Err(e) => {
                    warn!(
                        payment_id = %payment.id,
                        order_id = %payment.order_id,
                        retryable = e.is_retryable(),
                        error = %e,
                        "Auto-release failed"
                    );
                    report.failed += 1;
                }
            }
        }

        let stale = self
            .store
            .find_stale_claims(now - self.config.claim_timeout)
            .await?;
        for payment in &stale {
            error!(
                payment_id = %payment.id,
                order_id = %payment.order_id,
                status = %payment.status,
                claimed_at = ?payment.claimed_at,
                "Claim older than timeout; gateway outcome unknown, needs operator attention"
            );
        }
        report.stale_claims = stale.len();

        if report.examined > 0 || report.stale_claims > 0 {
            info!(
                examined = report.examined,
                released = report.released,
                skipped = report.skipped,
                already_handled = report.already_handled,
                failed = report.failed,
                stale_claims = report.stale_claims,
                "Auto-release sweep finished"
            );
        }

        Ok(report)
    }

    /// Sweeps on a fixed interval until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval = ?self.config.interval,
            sla_hours = self.config.sla.num_hours(),
            "Auto-release scheduler started"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Auto-release sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Auto-release scheduler stopping");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::gateway::{GatewayError, MockGateway};
    use crate::models::{NewPayment, Order, PaymentStatus, PaymentUpdate};
    use crate::orders::InMemoryOrderService;
    use crate::store::InMemoryPaymentStore;
    use bigdecimal::BigDecimal;
    use chrono::Utc;
    use uuid::Uuid;

    struct Fixture {
        store: Arc<InMemoryPaymentStore>,
        orders: Arc<InMemoryOrderService>,
        gateway: Arc<MockGateway>,
        clock: Arc<ManualClock>,
        scheduler: Arc<AutoReleaseScheduler>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryPaymentStore::new());
        let orders = Arc::new(InMemoryOrderService::new());
        let gateway = Arc::new(MockGateway::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let coordinator = Arc::new(ReleaseCoordinator::new(
            store.clone(),
            orders.clone(),
            gateway.clone(),
            clock.clone(),
            Duration::from_secs(1),
        ));
        let scheduler = Arc::new(AutoReleaseScheduler::new(
            store.clone(),
            orders.clone(),
            coordinator,
            clock.clone(),
            SchedulerConfig::default(),
        ));
        Fixture {
            store,
            orders,
            gateway,
            clock,
            scheduler,
        }
    }

    async fn held_now(f: &Fixture) -> (Uuid, Uuid) {
        let order = f
            .orders
            .insert(Order::new("254712345678", "254798765432", BigDecimal::from(1000)))
            .await;
        let payment = f
            .store
            .create_payment(NewPayment::new(
                order.id,
                BigDecimal::from(1000),
                order.buyer_phone.clone(),
                order.seller_phone.clone(),
            ))
            .await
            .unwrap();
        f.store
            .transition(
                payment.id,
                PaymentStatus::Initiated,
                PaymentStatus::Held,
                PaymentUpdate {
                    paid_at: Some(f.clock.now()),
                    receipt_number: Some("NLJ7RT61SV".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        (order.id, payment.id)
    }

    #[tokio::test]
    async fn test_releases_after_sla_exactly_once() {
        let f = fixture();
        let (_, payment_id) = held_now(&f).await;

        f.clock.advance(chrono::Duration::hours(23));
        assert_eq!(f.scheduler.sweep().await.unwrap().examined, 0);

        f.clock.advance(chrono::Duration::hours(2));
        let report = f.scheduler.sweep().await.unwrap();
        assert_eq!(report.released, 1);

        let again = f.scheduler.sweep().await.unwrap();
        assert_eq!(again, SweepReport::default());

        let payment = f.store.get(payment_id).await.unwrap().unwrap();
        assert!(payment.is_released());
        assert_eq!(f.gateway.payouts().len(), 1);
    }

    #[tokio::test]
    async fn test_skips_confirmed_orders() {
        let f = fixture();
        let (order_id, payment_id) = held_now(&f).await;
        f.orders.mark_delivery_confirmed(order_id).await.unwrap();

        f.clock.advance(chrono::Duration::hours(25));
        let report = f.scheduler.sweep().await.unwrap();

        assert_eq!(report.examined, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.released, 0);
        assert!(f.store.get(payment_id).await.unwrap().unwrap().is_held());
        assert!(f.gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_sweeps_release_once() {
        let f = fixture();
        for _ in 0..5 {
            held_now(&f).await;
        }
        f.gateway.stall_for(Duration::from_millis(10));
        f.clock.advance(chrono::Duration::hours(25));

        let a = {
            let scheduler = f.scheduler.clone();
            tokio::spawn(async move { scheduler.sweep().await })
        };
        let b = {
            let scheduler = f.scheduler.clone();
            tokio::spawn(async move { scheduler.sweep().await })
        };
        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();

        assert_eq!(a.released + b.released, 5);
        assert_eq!(f.gateway.payouts().len(), 5);
        assert!(f.store.all().await.iter().all(|p| p.is_released()));
    }

    #[tokio::test]
    async fn test_failed_payout_stays_held_for_next_sweep() {
        let f = fixture();
        let (_, payment_id) = held_now(&f).await;
        f.clock.advance(chrono::Duration::hours(25));
        f.gateway.fail_next(GatewayError::Transient("503".into()));

        let report = f.scheduler.sweep().await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(f.store.get(payment_id).await.unwrap().unwrap().is_held());

        let report = f.scheduler.sweep().await.unwrap();
        assert_eq!(report.released, 1);
    }

    #[tokio::test]
    async fn test_reports_stale_claims_without_touching_them() {
        let f = fixture();
        let (_, payment_id) = held_now(&f).await;
        f.store
            .transition(
                payment_id,
                PaymentStatus::Held,
                PaymentStatus::Releasing,
                PaymentUpdate {
                    claimed_at: Some(f.clock.now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        f.clock.advance(chrono::Duration::minutes(20));
        let report = f.scheduler.sweep().await.unwrap();

        assert_eq!(report.stale_claims, 1);
        assert_eq!(
            f.store.get(payment_id).await.unwrap().unwrap().status,
            PaymentStatus::Releasing
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = fixture();
        let (tx, rx) = watch::channel(false);
        let scheduler = f.scheduler.clone();
        let handle = tokio::spawn(async move { scheduler.run(rx).await });

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
