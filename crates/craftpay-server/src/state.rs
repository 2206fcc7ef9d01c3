//! Shared handler state: the engine components, wired once at startup.

use std::sync::Arc;

use crate::clock::Clock;
use crate::collection::CollectionInitiator;
use crate::config::EngineSettings;
use crate::gateway::PaymentGateway;
use crate::orders::OrderService;
use crate::reconciler::CallbackReconciler;
use crate::release::ReleaseCoordinator;
use crate::scheduler::AutoReleaseScheduler;
use crate::store::PaymentStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn PaymentStore>,
    pub collection: Arc<CollectionInitiator>,
    pub reconciler: Arc<CallbackReconciler>,
    pub coordinator: Arc<ReleaseCoordinator>,
    pub scheduler: Arc<AutoReleaseScheduler>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        orders: Arc<dyn OrderService>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
        settings: &EngineSettings,
    ) -> Self {
        let collection = Arc::new(CollectionInitiator::new(
            store.clone(),
            orders.clone(),
            gateway.clone(),
            settings.gateway_timeout,
        ));
        let reconciler = Arc::new(CallbackReconciler::new(store.clone(), clock.clone()));
        let coordinator = Arc::new(ReleaseCoordinator::new(
            store.clone(),
            orders.clone(),
            gateway,
            clock.clone(),
            settings.gateway_timeout,
        ));
        let scheduler = Arc::new(AutoReleaseScheduler::new(
            store.clone(),
            orders,
            coordinator.clone(),
            clock,
            settings.scheduler.clone(),
        ));

        Self {
            store,
            collection,
            reconciler,
            coordinator,
            scheduler,
        }
    }
}
