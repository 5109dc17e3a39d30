#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Days, NaiveDate, Utc};
use pharma_wms::{
    audit::{AuditEntry, AuditSink},
    config::{AppConfig, NotificationRecipients},
    context::OperationContext,
    db::{self, DbConfig},
    entities::allocation::{self, AllocationType},
    entities::batch,
    errors::ServiceError,
    events::EventSender,
    master_data::InMemoryMasterData,
    notifications::{NotificationType, Notifier},
    services::{
        allocation::{AutoAllocateRequest, CreateAllocationRequest},
        batches::ReceiveBatchRequest,
        factory::{ServiceContainer, ServiceFactory},
    },
};
use uuid::Uuid;

/// Audit sink that keeps every entry for assertions.
#[derive(Default)]
pub struct RecordingAudit {
    pub entries: Mutex<Vec<AuditEntry>>,
}

impl RecordingAudit {
    pub fn actions(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.action.clone())
            .collect()
    }
}

#[async_trait]
impl AuditSink for RecordingAudit {
    async fn record(&self, entry: AuditEntry) -> Result<(), ServiceError> {
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }
}

/// Notifier that keeps what it was asked to send.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(NotificationType, Vec<String>)>>,
}

impl RecordingNotifier {
    pub fn types(&self) -> Vec<NotificationType> {
        self.sent.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(
        &self,
        event_type: NotificationType,
        recipients: Vec<String>,
        _context: serde_json::Value,
    ) -> Result<(), ServiceError> {
        self.sent.lock().unwrap().push((event_type, recipients));
        Ok(())
    }
}

/// Fully wired services over a private database.
pub struct TestApp {
    pub services: ServiceContainer,
    pub master_data: Arc<InMemoryMasterData>,
    pub audit: Arc<RecordingAudit>,
    pub notifier: Arc<RecordingNotifier>,
    pub ctx: OperationContext,
    _events: tokio::sync::mpsc::Receiver<pharma_wms::events::Event>,
}

/// Config with the test distribution lists.
pub fn test_config(database_url: &str) -> AppConfig {
    let mut cfg = AppConfig::new(database_url.into(), "test".into());
    cfg.notification_recipients = NotificationRecipients {
        quality: vec!["qa@test".into()],
        warehouse: vec!["wh@test".into()],
    };
    cfg
}

impl TestApp {
    /// In-memory SQLite behind a single connection.
    pub async fn new() -> Self {
        Self::with_config(test_config("sqlite::memory:"), 1).await
    }

    pub async fn with_config(cfg: AppConfig, max_connections: u32) -> Self {
        let pool = db::establish_connection_with_config(&DbConfig {
            url: cfg.database_url.clone(),
            max_connections,
            min_connections: 1,
            idle_timeout: Duration::from_secs(3600),
            ..Default::default()
        })
        .await
        .expect("test database");
        db::run_migrations(&pool).await.expect("migrations");

        let (sender, events) = EventSender::channel(4096);
        let master_data = Arc::new(InMemoryMasterData::new());
        let audit = Arc::new(RecordingAudit::default());
        let notifier = Arc::new(RecordingNotifier::default());

        let factory = ServiceFactory::new(
            Arc::new(pool),
            sender,
            audit.clone(),
            notifier.clone(),
            master_data.clone(),
        )
        .with_config(&cfg);

        Self {
            services: ServiceContainer::new(&factory),
            master_data,
            audit,
            notifier,
            ctx: OperationContext::new("tester").with_request_id("req-1"),
            _events: events,
        }
    }

    pub fn product(&self) -> Uuid {
        self.master_data.add_product(&format!("SKU-{}", Uuid::new_v4()), "Amoxicillin 500mg").id
    }

    pub fn customer(&self) -> Uuid {
        self.master_data.add_customer("Central Hospital").id
    }

    /// Received and QC-passed batch expiring `expires_in_days` from today.
    pub async fn released_batch(
        &self,
        product_id: Uuid,
        quantity: i32,
        expires_in_days: u64,
        received_days_ago: u64,
    ) -> batch::Model {
        let received = self.batch(product_id, quantity, expires_in_days, received_days_ago).await;
        self.services
            .batches
            .pass_qc(&self.ctx, received.id, Some("release".into()))
            .await
            .expect("pass qc")
    }

    /// Received batch still PENDING QC.
    pub async fn batch(
        &self,
        product_id: Uuid,
        quantity: i32,
        expires_in_days: u64,
        received_days_ago: u64,
    ) -> batch::Model {
        let today = today();
        self.services
            .batches
            .receive(
                &self.ctx,
                ReceiveBatchRequest {
                    batch_number: format!("B-{}", &Uuid::new_v4().simple().to_string()[..8]),
                    product_id,
                    quantity,
                    manufacturing_date: today - Days::new(365),
                    expiry_date: today + Days::new(expires_in_days),
                    received_date: Some(today - Days::new(received_days_ago)),
                    rack_location: None,
                },
            )
            .await
            .expect("receive batch")
    }

    pub async fn regular_allocation(&self, batch_id: Uuid, quantity: i32) -> allocation::Model {
        self.services
            .allocations
            .create_allocation(
                &self.ctx,
                CreateAllocationRequest {
                    batch_id,
                    allocation_type: AllocationType::Regular,
                    quantity,
                    customer_id: None,
                    tender_contract_id: None,
                    reference: None,
                },
            )
            .await
            .expect("create allocation")
    }

    pub fn auto_request(&self, product_id: Uuid, quantity: i32) -> AutoAllocateRequest {
        AutoAllocateRequest {
            product_id,
            quantity,
            allocation_type: AllocationType::Regular,
            strategy: None,
            customer_id: None,
            tender_contract_id: None,
            reference: None,
        }
    }
}

pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}
