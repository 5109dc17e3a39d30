//! Batch Lifecycle
//!
//! Receipt, QC gating and withdrawal of lots. A batch can back allocations
//! only while it is ACTIVE, QC-PASSED and unexpired; RECALLED and EXPIRED
//! batches are frozen.

use chrono::{Duration, NaiveDate, Utc};
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::audit::{record_best_effort, AuditEntry, AuditSeverity, AuditSink};
use crate::config::NotificationRecipients;
use crate::context::OperationContext;
use crate::db::{self, DbPool};
use crate::entities::allocation::{self, Entity as AllocationEntity};
use crate::entities::batch::{self, BatchStatus, Entity as BatchEntity, QcStatus};
use crate::entities::stock_movement::MovementType;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::master_data::{require_product, MasterDataLookup};
use crate::notifications::{notify_quietly, NotificationType, Notifier};
use crate::services::allocation::{expire_allocations_for_batch, lock_batch};
use crate::services::ledger::{record_movement, NewMovement, StockReference};
use crate::services::today;

#[derive(Debug, Clone, Validate, Serialize, Deserialize)]
#[validate(schema(function = "validate_batch_dates"))]
pub struct ReceiveBatchRequest {
    #[validate(length(min = 1, max = 64))]
    pub batch_number: String,
    pub product_id: Uuid,
    #[validate(range(min = 1))]
    pub quantity: i32,
    pub manufacturing_date: NaiveDate,
    pub expiry_date: NaiveDate,
    /// Defaults to today
    pub received_date: Option<NaiveDate>,
    pub rack_location: Option<String>,
}

fn validate_batch_dates(request: &ReceiveBatchRequest) -> Result<(), ValidationError> {
    if request.expiry_date <= request.manufacturing_date {
        return Err(ValidationError::new("expiry_before_manufacture"));
    }
    Ok(())
}

/// Outcome of an expiry sweep.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExpirySummary {
    pub as_of: NaiveDate,
    pub expired_batches: Vec<Uuid>,
    pub expired_allocations: usize,
}

/// Service for the QC and expiry lifecycle of received batches.
#[derive(Clone)]
pub struct BatchService {
    db_pool: Arc<DbPool>,
    event_sender: Arc<EventSender>,
    audit: Arc<dyn AuditSink>,
    notifier: Arc<dyn Notifier>,
    master_data: Arc<dyn MasterDataLookup>,
    recipients: NotificationRecipients,
    expiry_warning_days: u32,
}

impl BatchService {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        audit: Arc<dyn AuditSink>,
        notifier: Arc<dyn Notifier>,
        master_data: Arc<dyn MasterDataLookup>,
        recipients: NotificationRecipients,
        expiry_warning_days: u32,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            audit,
            notifier,
            master_data,
            recipients,
            expiry_warning_days,
        }
    }

    #[instrument(skip(self))]
    pub async fn get_batch(&self, batch_id: Uuid) -> Result<batch::Model, ServiceError> {
        BatchEntity::find_by_id(batch_id)
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::not_found("Batch", batch_id))
    }

    #[instrument(skip(self))]
    pub async fn list_batches_for_product(
        &self,
        product_id: Uuid,
    ) -> Result<Vec<batch::Model>, ServiceError> {
        Ok(BatchEntity::find()
            .filter(batch::Column::ProductId.eq(product_id))
            .order_by_asc(batch::Column::ExpiryDate)
            .order_by_asc(batch::Column::BatchNumber)
            .all(&*self.db_pool)
            .await?)
    }

    /// ACTIVE batches expiring after today and within `within_days`
    /// (the configured warning window when `None`).
    #[instrument(skip(self))]
    pub async fn expiring_batches(
        &self,
        within_days: Option<u32>,
    ) -> Result<Vec<batch::Model>, ServiceError> {
        let today = today();
        let horizon = today + Duration::days(within_days.unwrap_or(self.expiry_warning_days) as i64);
        Ok(BatchEntity::find()
            .filter(batch::Column::Status.eq(BatchStatus::Active))
            .filter(batch::Column::ExpiryDate.gt(today))
            .filter(batch::Column::ExpiryDate.lte(horizon))
            .order_by_asc(batch::Column::ExpiryDate)
            .all(&*self.db_pool)
            .await?)
    }

    /// Sends the quality team a warning listing batches about to expire.
    /// Returns how many batches were listed.
    #[instrument(skip(self))]
    pub async fn notify_expiring_batches(&self, within_days: Option<u32>) -> Result<usize, ServiceError> {
        let batches = self.expiring_batches(within_days).await?;
        if batches.is_empty() {
            return Ok(0);
        }
        let listed: Vec<_> = batches
            .iter()
            .map(|b| {
                serde_json::json!({
                    "batch_id": b.id,
                    "batch_number": b.batch_number,
                    "expiry_date": b.expiry_date,
                })
            })
            .collect();
        notify_quietly(
            &self.notifier,
            NotificationType::ExpiryWarning,
            &self.recipients.quality,
            serde_json::json!({ "batches": listed }),
        )
        .await;
        Ok(batches.len())
    }

    #[instrument(skip(self, ctx, request), fields(batch_number = %request.batch_number))]
    pub async fn receive(
        &self,
        ctx: &OperationContext,
        request: ReceiveBatchRequest,
    ) -> Result<batch::Model, ServiceError> {
        request.validate()?;
        require_product(self.master_data.as_ref(), request.product_id).await?;

        let db = &*self.db_pool;
        let duplicates = BatchEntity::find()
            .filter(batch::Column::BatchNumber.eq(request.batch_number.as_str()))
            .count(db)
            .await?;
        if duplicates > 0 {
            return Err(ServiceError::Conflict(format!(
                "batch number {} already exists",
                request.batch_number
            )));
        }

        let created = batch::ActiveModel {
            batch_number: Set(request.batch_number),
            product_id: Set(request.product_id),
            received_quantity: Set(request.quantity),
            manufacturing_date: Set(request.manufacturing_date),
            expiry_date: Set(request.expiry_date),
            received_date: Set(request.received_date.unwrap_or_else(today)),
            qc_status: Set(QcStatus::Pending),
            pre_quarantine_qc_status: Set(None),
            status: Set(BatchStatus::Active),
            rack_location: Set(request.rack_location),
            qc_notes: Set(None),
            qc_by: Set(None),
            qc_at: Set(None),
            created_by: Set(ctx.actor.clone()),
            ..Default::default()
        }
        .insert(db)
        .await?;

        counter!("pharma_wms.batches.received", 1);
        self.event_sender
            .publish(Event::BatchReceived {
                batch_id: created.id,
                product_id: created.product_id,
                quantity: created.received_quantity,
            })
            .await;
        record_best_effort(
            &self.audit,
            AuditEntry::new(ctx, "Batch", created.id, "receive").with_new(&created),
        )
        .await;

        info!(batch_id = %created.id, quantity = created.received_quantity, "Batch received");
        Ok(created)
    }

    #[instrument(skip(self, ctx, notes))]
    pub async fn pass_qc(
        &self,
        ctx: &OperationContext,
        batch_id: Uuid,
        notes: Option<String>,
    ) -> Result<batch::Model, ServiceError> {
        let txn = db::begin(&self.db_pool).await?;
        let result: Result<_, ServiceError> = async {
            let current = lock_batch(&txn, batch_id).await?;
            ensure_not_frozen(&current)?;
            if current.qc_status != QcStatus::Pending {
                return Err(ServiceError::invalid_state(
                    "Batch",
                    batch_id,
                    current.qc_status,
                    "QC PENDING",
                ));
            }
            let updated = set_qc(&txn, ctx, current.clone(), QcStatus::Passed, notes).await?;
            Ok((current, updated))
        }
        .await;
        let (before, after) = db::finish(txn, result).await?;

        self.after_qc_change(ctx, "pass_qc", &before, &after, AuditSeverity::Info)
            .await;
        Ok(after)
    }

    /// Fails QC on a PENDING or quarantined batch. The batch is recalled and
    /// any live allocations on it are expired.
    #[instrument(skip(self, ctx, notes))]
    pub async fn fail_qc(
        &self,
        ctx: &OperationContext,
        batch_id: Uuid,
        notes: Option<String>,
    ) -> Result<batch::Model, ServiceError> {
        let txn = db::begin(&self.db_pool).await?;
        let result: Result<_, ServiceError> = async {
            let current = lock_batch(&txn, batch_id).await?;
            ensure_not_frozen(&current)?;
            if !matches!(current.qc_status, QcStatus::Pending | QcStatus::Quarantine) {
                return Err(ServiceError::invalid_state(
                    "Batch",
                    batch_id,
                    current.qc_status,
                    "QC PENDING or QUARANTINE",
                ));
            }
            let failed = set_qc(&txn, ctx, current.clone(), QcStatus::Failed, notes).await?;

            let mut active: batch::ActiveModel = failed.into();
            active.status = Set(BatchStatus::Recalled);
            active.pre_quarantine_qc_status = Set(None);
            let recalled = active.update(&txn).await?;

            let released = expire_allocations_for_batch(
                &txn,
                ctx,
                batch_id,
                &StockReference::new("batch", batch_id),
            )
            .await?;
            Ok((current, recalled, released))
        }
        .await;
        let (before, after, released) = db::finish(txn, result).await?;

        warn!(batch_id = %batch_id, released = released.len(), "Batch failed QC and was recalled");
        self.after_qc_change(ctx, "fail_qc", &before, &after, AuditSeverity::Warning)
            .await;
        self.event_sender
            .publish(Event::BatchRecalled {
                batch_id,
                released_allocations: released,
            })
            .await;
        notify_quietly(
            &self.notifier,
            NotificationType::QcFailed,
            &self.recipients.quality,
            serde_json::json!({
                "batch_id": after.id,
                "batch_number": after.batch_number,
                "notes": after.qc_notes,
            }),
        )
        .await;
        Ok(after)
    }

    /// Places a hold on the batch. The QC status it held is restored by
    /// [`BatchService::release_from_quarantine`].
    #[instrument(skip(self, ctx, reason))]
    pub async fn quarantine(
        &self,
        ctx: &OperationContext,
        batch_id: Uuid,
        reason: String,
    ) -> Result<batch::Model, ServiceError> {
        require_reason(&reason)?;
        let txn = db::begin(&self.db_pool).await?;
        let result: Result<_, ServiceError> = async {
            let current = lock_batch(&txn, batch_id).await?;
            ensure_not_frozen(&current)?;
            if matches!(current.qc_status, QcStatus::Quarantine | QcStatus::Failed) {
                return Err(ServiceError::invalid_state(
                    "Batch",
                    batch_id,
                    current.qc_status,
                    "QC PENDING or PASSED",
                ));
            }
            let held = current.qc_status;
            let mut active: batch::ActiveModel = current.clone().into();
            active.pre_quarantine_qc_status = Set(Some(held));
            let updated = set_qc_on(&txn, ctx, active, QcStatus::Quarantine, Some(reason)).await?;
            Ok((current, updated))
        }
        .await;
        let (before, after) = db::finish(txn, result).await?;

        self.after_qc_change(ctx, "quarantine", &before, &after, AuditSeverity::Warning)
            .await;
        Ok(after)
    }

    #[instrument(skip(self, ctx, notes))]
    pub async fn release_from_quarantine(
        &self,
        ctx: &OperationContext,
        batch_id: Uuid,
        notes: Option<String>,
    ) -> Result<batch::Model, ServiceError> {
        let txn = db::begin(&self.db_pool).await?;
        let result: Result<_, ServiceError> = async {
            let current = lock_batch(&txn, batch_id).await?;
            ensure_not_frozen(&current)?;
            if current.qc_status != QcStatus::Quarantine {
                return Err(ServiceError::invalid_state(
                    "Batch",
                    batch_id,
                    current.qc_status,
                    "QC QUARANTINE",
                ));
            }
            let restored = current.pre_quarantine_qc_status.unwrap_or(QcStatus::Pending);
            let mut active: batch::ActiveModel = current.clone().into();
            active.pre_quarantine_qc_status = Set(None);
            let updated = set_qc_on(&txn, ctx, active, restored, notes).await?;
            Ok((current, updated))
        }
        .await;
        let (before, after) = db::finish(txn, result).await?;

        self.after_qc_change(ctx, "release_from_quarantine", &before, &after, AuditSeverity::Info)
            .await;
        Ok(after)
    }

    /// Corrects `received_quantity`. The new quantity may not drop below what
    /// allocations already hold, and the signed delta goes to the ledger.
    #[instrument(skip(self, ctx, reason))]
    pub async fn adjust_quantity(
        &self,
        ctx: &OperationContext,
        batch_id: Uuid,
        new_quantity: i32,
        reason: String,
    ) -> Result<batch::Model, ServiceError> {
        require_reason(&reason)?;
        if new_quantity < 0 {
            return Err(ServiceError::ValidationError(format!(
                "quantity must not be negative, got {}",
                new_quantity
            )));
        }

        let txn = db::begin(&self.db_pool).await?;
        let result: Result<_, ServiceError> = async {
            let current = lock_batch(&txn, batch_id).await?;
            ensure_not_frozen(&current)?;
            let delta = new_quantity - current.received_quantity;
            if delta == 0 {
                return Err(ServiceError::ValidationError(format!(
                    "batch {} already holds {}",
                    current.batch_number, new_quantity
                )));
            }

            let committed = committed_quantity(&txn, batch_id).await?;
            if new_quantity < committed {
                return Err(ServiceError::InsufficientStock {
                    scope: format!("batch {}", current.batch_number),
                    requested: committed,
                    available: new_quantity,
                });
            }

            let mut active: batch::ActiveModel = current.clone().into();
            active.received_quantity = Set(new_quantity);
            if new_quantity == 0 {
                active.status = Set(BatchStatus::Consumed);
            } else if current.status == BatchStatus::Consumed {
                active.status = Set(BatchStatus::Active);
            }
            let updated = active.update(&txn).await?;

            record_movement(
                &txn,
                ctx,
                NewMovement {
                    allocation_id: None,
                    batch_id,
                    product_id: updated.product_id,
                    movement_type: MovementType::Adjust,
                    quantity: delta,
                    reference: StockReference::new("batch", batch_id),
                    notes: Some(reason.clone()),
                },
            )
            .await?;
            Ok((current, updated))
        }
        .await;
        let (before, after) = db::finish(txn, result).await?;

        self.event_sender
            .publish(Event::BatchQuantityAdjusted {
                batch_id,
                old_quantity: before.received_quantity,
                new_quantity: after.received_quantity,
                reason,
            })
            .await;
        record_best_effort(
            &self.audit,
            AuditEntry::new(ctx, "Batch", batch_id, "adjust_quantity")
                .with_old(&before)
                .with_new(&after)
                .severity(AuditSeverity::Warning),
        )
        .await;
        Ok(after)
    }

    /// Withdraws an ACTIVE batch. Live allocations are expired and their
    /// unshipped quantity released.
    #[instrument(skip(self, ctx, reason))]
    pub async fn recall_batch(
        &self,
        ctx: &OperationContext,
        batch_id: Uuid,
        reason: String,
    ) -> Result<batch::Model, ServiceError> {
        require_reason(&reason)?;
        let txn = db::begin(&self.db_pool).await?;
        let result: Result<_, ServiceError> = async {
            let current = lock_batch(&txn, batch_id).await?;
            if current.status != BatchStatus::Active {
                return Err(ServiceError::invalid_state(
                    "Batch",
                    batch_id,
                    current.status,
                    "ACTIVE",
                ));
            }
            let mut active: batch::ActiveModel = current.clone().into();
            active.status = Set(BatchStatus::Recalled);
            active.qc_notes = Set(Some(reason.clone()));
            let updated = active.update(&txn).await?;

            let released = expire_allocations_for_batch(
                &txn,
                ctx,
                batch_id,
                &StockReference::new("batch", batch_id),
            )
            .await?;
            Ok((current, updated, released))
        }
        .await;
        let (before, after, released) = db::finish(txn, result).await?;

        counter!("pharma_wms.batches.recalled", 1);
        warn!(batch_id = %batch_id, released = released.len(), %reason, "Batch recalled");
        self.event_sender
            .publish(Event::BatchRecalled {
                batch_id,
                released_allocations: released.clone(),
            })
            .await;
        record_best_effort(
            &self.audit,
            AuditEntry::new(ctx, "Batch", batch_id, "recall_batch")
                .with_old(&before)
                .with_new(&after)
                .severity(AuditSeverity::Critical),
        )
        .await;

        let mut recipients = self.recipients.quality.clone();
        recipients.extend(self.recipients.warehouse.iter().cloned());
        notify_quietly(
            &self.notifier,
            NotificationType::BatchRecalled,
            &recipients,
            serde_json::json!({
                "batch_id": after.id,
                "batch_number": after.batch_number,
                "reason": reason,
                "released_allocations": released,
            }),
        )
        .await;
        Ok(after)
    }

    /// Moves every ACTIVE batch with `expiry_date <= as_of` to EXPIRED.
    #[instrument(skip(self, ctx))]
    pub async fn expire_batches(
        &self,
        ctx: &OperationContext,
        as_of: NaiveDate,
    ) -> Result<ExpirySummary, ServiceError> {
        let txn = db::begin(&self.db_pool).await?;
        let result: Result<_, ServiceError> = async {
            let due = BatchEntity::find()
                .filter(batch::Column::Status.eq(BatchStatus::Active))
                .filter(batch::Column::ExpiryDate.lte(as_of))
                .lock_exclusive()
                .all(&txn)
                .await?;

            let mut summary = ExpirySummary {
                as_of,
                expired_batches: Vec::with_capacity(due.len()),
                expired_allocations: 0,
            };
            for current in due {
                let batch_id = current.id;
                let mut active: batch::ActiveModel = current.into();
                active.status = Set(BatchStatus::Expired);
                active.update(&txn).await?;

                let expired = expire_allocations_for_batch(
                    &txn,
                    ctx,
                    batch_id,
                    &StockReference::new("batch", batch_id),
                )
                .await?;
                summary.expired_allocations += expired.len();
                summary.expired_batches.push(batch_id);
            }
            Ok(summary)
        }
        .await;
        let summary = db::finish(txn, result).await?;

        if summary.expired_batches.is_empty() {
            return Ok(summary);
        }

        counter!(
            "pharma_wms.batches.expired",
            summary.expired_batches.len() as u64
        );
        info!(
            batches = summary.expired_batches.len(),
            allocations = summary.expired_allocations,
            %as_of,
            "Expired batches swept"
        );
        for batch_id in &summary.expired_batches {
            self.event_sender.publish(Event::BatchExpired(*batch_id)).await;
            record_best_effort(
                &self.audit,
                AuditEntry::new(ctx, "Batch", *batch_id, "expire_batches")
                    .with_new(&serde_json::json!({ "status": BatchStatus::Expired.to_string() })),
            )
            .await;
        }
        notify_quietly(
            &self.notifier,
            NotificationType::BatchesExpired,
            &self.recipients.warehouse,
            serde_json::to_value(&summary).unwrap_or_default(),
        )
        .await;
        Ok(summary)
    }

    async fn after_qc_change(
        &self,
        ctx: &OperationContext,
        action: &str,
        before: &batch::Model,
        after: &batch::Model,
        severity: AuditSeverity,
    ) {
        info!(
            batch_id = %after.id,
            old_status = %before.qc_status,
            new_status = %after.qc_status,
            "Batch QC status changed"
        );
        self.event_sender
            .publish(Event::BatchQcChanged {
                batch_id: after.id,
                old_status: before.qc_status.to_string(),
                new_status: after.qc_status.to_string(),
            })
            .await;
        record_best_effort(
            &self.audit,
            AuditEntry::new(ctx, "Batch", after.id, action)
                .with_old(before)
                .with_new(after)
                .severity(severity),
        )
        .await;
    }
}

fn ensure_not_frozen(batch: &batch::Model) -> Result<(), ServiceError> {
    if batch.is_frozen() {
        return Err(ServiceError::invalid_state(
            "Batch",
            batch.id,
            batch.status,
            "ACTIVE or CONSUMED",
        ));
    }
    Ok(())
}

fn require_reason(reason: &str) -> Result<(), ServiceError> {
    if reason.trim().is_empty() {
        return Err(ServiceError::ValidationError(
            "a reason is required".to_string(),
        ));
    }
    Ok(())
}

async fn set_qc<C: ConnectionTrait>(
    conn: &C,
    ctx: &OperationContext,
    current: batch::Model,
    status: QcStatus,
    notes: Option<String>,
) -> Result<batch::Model, ServiceError> {
    set_qc_on(conn, ctx, current.into(), status, notes).await
}

async fn set_qc_on<C: ConnectionTrait>(
    conn: &C,
    ctx: &OperationContext,
    mut active: batch::ActiveModel,
    status: QcStatus,
    notes: Option<String>,
) -> Result<batch::Model, ServiceError> {
    active.qc_status = Set(status);
    if notes.is_some() {
        active.qc_notes = Set(notes);
    }
    active.qc_by = Set(Some(ctx.actor.clone()));
    active.qc_at = Set(Some(Utc::now()));
    Ok(active.update(conn).await?)
}

/// Quantity of the batch held by allocations, shipped units included.
async fn committed_quantity<C: ConnectionTrait>(
    conn: &C,
    batch_id: Uuid,
) -> Result<i32, ServiceError> {
    let allocations = AllocationEntity::find()
        .filter(allocation::Column::BatchId.eq(batch_id))
        .all(conn)
        .await?;
    Ok(allocations.iter().map(|a| a.allocated_quantity).sum())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(mfg: (i32, u32, u32), exp: (i32, u32, u32)) -> ReceiveBatchRequest {
        ReceiveBatchRequest {
            batch_number: "B-2024-001".into(),
            product_id: Uuid::new_v4(),
            quantity: 100,
            manufacturing_date: NaiveDate::from_ymd_opt(mfg.0, mfg.1, mfg.2).unwrap(),
            expiry_date: NaiveDate::from_ymd_opt(exp.0, exp.1, exp.2).unwrap(),
            received_date: None,
            rack_location: None,
        }
    }

    #[test]
    fn expiry_must_follow_manufacture() {
        assert!(request((2024, 1, 1), (2026, 1, 1)).validate().is_ok());
        assert!(request((2024, 1, 1), (2024, 1, 1)).validate().is_err());
        assert!(request((2024, 1, 1), (2023, 6, 1)).validate().is_err());
    }

    #[test]
    fn quantity_and_number_are_validated() {
        let mut r = request((2024, 1, 1), (2026, 1, 1));
        r.quantity = 0;
        assert!(r.validate().is_err());

        let mut r = request((2024, 1, 1), (2026, 1, 1));
        r.batch_number = String::new();
        assert!(r.validate().is_err());
    }

    #[test]
    fn blank_reason_is_rejected() {
        assert!(require_reason("  ").is_err());
        assert!(require_reason("stock count").is_ok());
    }
}
