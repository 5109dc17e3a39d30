use std::sync::Arc;

use crate::{
    audit::AuditSink,
    config::{AppConfig, NotificationRecipients},
    db::{DbPool, RetryConfig},
    events::EventSender,
    master_data::MasterDataLookup,
    notifications::Notifier,
    services::{
        allocation::{AllocationService, AllocationStrategy},
        batches::BatchService,
        contracts::ContractService,
        fulfillment::{
            PackingService, PickingService, PipelineDeps, SalesOrderService, ShipmentService,
            ShippingPlanService,
        },
        ledger::StockLedger,
    },
};

/// Factory for creating service instances with shared dependencies
pub struct ServiceFactory {
    db_pool: Arc<DbPool>,
    event_sender: Arc<EventSender>,
    audit: Arc<dyn AuditSink>,
    notifier: Arc<dyn Notifier>,
    master_data: Arc<dyn MasterDataLookup>,
    recipients: NotificationRecipients,
    default_strategy: AllocationStrategy,
    expiry_warning_days: u32,
    retry: RetryConfig,
}

impl ServiceFactory {
    /// Creates a new service factory with the given collaborators
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: EventSender,
        audit: Arc<dyn AuditSink>,
        notifier: Arc<dyn Notifier>,
        master_data: Arc<dyn MasterDataLookup>,
    ) -> Self {
        let defaults = AppConfig::new(String::new(), String::new());
        Self {
            db_pool,
            event_sender: Arc::new(event_sender),
            audit,
            notifier,
            master_data,
            recipients: NotificationRecipients::default(),
            default_strategy: defaults.allocation_strategy(),
            expiry_warning_days: defaults.expiry_warning_days,
            retry: RetryConfig::from(&defaults),
        }
    }

    /// Takes strategy, distribution lists, warning window and contention
    /// backoff from config.
    pub fn with_config(mut self, cfg: &AppConfig) -> Self {
        self.recipients = cfg.notification_recipients.clone();
        self.default_strategy = cfg.allocation_strategy();
        self.expiry_warning_days = cfg.expiry_warning_days;
        self.retry = RetryConfig::from(cfg);
        self
    }

    pub fn ledger(&self) -> StockLedger {
        StockLedger::new(self.db_pool.clone())
    }

    pub fn batch_service(&self) -> BatchService {
        BatchService::new(
            self.db_pool.clone(),
            self.event_sender.clone(),
            self.audit.clone(),
            self.notifier.clone(),
            self.master_data.clone(),
            self.recipients.clone(),
            self.expiry_warning_days,
        )
    }

    pub fn allocation_service(&self) -> AllocationService {
        AllocationService::new(
            self.db_pool.clone(),
            self.event_sender.clone(),
            self.audit.clone(),
            self.master_data.clone(),
            self.default_strategy,
        )
        .with_retry(self.retry.clone())
    }

    pub fn contract_service(&self) -> ContractService {
        ContractService::new(
            self.db_pool.clone(),
            self.event_sender.clone(),
            self.audit.clone(),
            self.master_data.clone(),
        )
    }

    /// Collaborators shared by the fulfillment stages.
    pub fn pipeline_deps(&self, allocation: Arc<AllocationService>) -> PipelineDeps {
        PipelineDeps {
            db_pool: self.db_pool.clone(),
            event_sender: self.event_sender.clone(),
            audit: self.audit.clone(),
            notifier: self.notifier.clone(),
            master_data: self.master_data.clone(),
            allocation,
            recipients: self.recipients.clone(),
        }
    }

    /// Gets a reference to the database pool
    pub fn db_pool(&self) -> &Arc<DbPool> {
        &self.db_pool
    }

    /// Gets a reference to the event sender
    pub fn event_sender(&self) -> &Arc<EventSender> {
        &self.event_sender
    }
}

/// Service container holding all service instances
#[derive(Clone)]
pub struct ServiceContainer {
    pub ledger: Arc<StockLedger>,
    pub batches: Arc<BatchService>,
    pub allocations: Arc<AllocationService>,
    pub contracts: Arc<ContractService>,
    pub sales_orders: Arc<SalesOrderService>,
    pub shipping_plans: Arc<ShippingPlanService>,
    pub picking: Arc<PickingService>,
    pub packing: Arc<PackingService>,
    pub shipments: Arc<ShipmentService>,
}

impl ServiceContainer {
    /// Creates a new service container with all services initialized
    pub fn new(factory: &ServiceFactory) -> Self {
        let allocations = Arc::new(factory.allocation_service());
        let deps = factory.pipeline_deps(allocations.clone());

        Self {
            ledger: Arc::new(factory.ledger()),
            batches: Arc::new(factory.batch_service()),
            contracts: Arc::new(factory.contract_service()),
            sales_orders: Arc::new(SalesOrderService::new(deps.clone())),
            shipping_plans: Arc::new(ShippingPlanService::new(deps.clone())),
            picking: Arc::new(PickingService::new(deps.clone())),
            packing: Arc::new(PackingService::new(deps.clone())),
            shipments: Arc::new(ShipmentService::new(deps)),
            allocations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::TracingAuditSink;
    use crate::master_data::InMemoryMasterData;
    use crate::notifications::EventBusNotifier;

    #[tokio::test]
    async fn factory_takes_strategy_from_config() {
        let pool = crate::db::establish_connection_with_config(&crate::db::DbConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            min_connections: 1,
            ..Default::default()
        })
        .await
        .unwrap();
        let (sender, _rx) = EventSender::channel(8);
        let mut cfg = AppConfig::new("sqlite::memory:".into(), "test".into());
        cfg.default_allocation_strategy = "lifo".into();

        let factory = ServiceFactory::new(
            Arc::new(pool),
            sender.clone(),
            Arc::new(TracingAuditSink),
            Arc::new(EventBusNotifier::new(sender)),
            Arc::new(InMemoryMasterData::new()),
        )
        .with_config(&cfg);

        let container = ServiceContainer::new(&factory);
        assert_eq!(container.allocations.default_strategy(), AllocationStrategy::Lifo);
    }
}
