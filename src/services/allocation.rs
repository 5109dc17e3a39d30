//! Allocation Engine
//!
//! Matches batch quantity to demand. Every mutation locks the row it
//! contends on (the batch for allocate, the allocation for everything else),
//! rechecks its invariant under that lock, and writes exactly one ledger row.
//!
//! Public methods open and finish their own transaction. The `*_in`
//! variants run on a caller-supplied connection so the fulfillment pipeline
//! can compose several engine steps in one transaction.

use chrono::NaiveDate;
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::audit::{record_best_effort, AuditEntry, AuditSink};
use crate::context::OperationContext;
use crate::db::{self, DbPool, RetryConfig};
use crate::entities::allocation::{
    self, AllocationQuantities, AllocationStatus, AllocationType, Entity as AllocationEntity,
};
use crate::entities::batch::{self, BatchStatus, Entity as BatchEntity, QcStatus};
use crate::entities::contract_reservation::{
    self, Entity as ContractReservationEntity, ReservationStatus,
};
use crate::entities::generate_number;
use crate::entities::stock_movement::MovementType;
use crate::entities::tender_contract::Entity as TenderContractEntity;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::master_data::{require_customer, MasterDataLookup};
use crate::services::ledger::{has_movement, record_movement, NewMovement, StockReference};
use crate::services::today;

/// Batch selection order for automatic allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationStrategy {
    /// First in, first out: oldest receipt first
    Fifo,
    /// First expired, first out: earliest expiry first
    Fefo,
    /// Last in, first out: newest receipt first
    Lifo,
    /// Exactly the named batch
    Specific(Uuid),
}

impl fmt::Display for AllocationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationStrategy::Fifo => write!(f, "FIFO"),
            AllocationStrategy::Fefo => write!(f, "FEFO"),
            AllocationStrategy::Lifo => write!(f, "LIFO"),
            AllocationStrategy::Specific(id) => write!(f, "SPECIFIC({})", id),
        }
    }
}

impl FromStr for AllocationStrategy {
    type Err = ServiceError;

    /// Parses the ordering strategies. `SPECIFIC` needs a batch id and is
    /// only constructed directly.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FIFO" => Ok(AllocationStrategy::Fifo),
            "FEFO" => Ok(AllocationStrategy::Fefo),
            "LIFO" => Ok(AllocationStrategy::Lifo),
            other => Err(ServiceError::ValidationError(format!(
                "unknown allocation strategy '{}'",
                other
            ))),
        }
    }
}

/// Orders candidate batches for `strategy`. Ties fall back to expiry date and
/// then batch number so the order is deterministic.
pub fn sort_batches(strategy: AllocationStrategy, batches: &mut [batch::Model]) {
    let by_number = |a: &batch::Model, b: &batch::Model| a.batch_number.cmp(&b.batch_number);
    match strategy {
        AllocationStrategy::Fefo | AllocationStrategy::Specific(_) => batches.sort_by(|a, b| {
            a.expiry_date
                .cmp(&b.expiry_date)
                .then(a.received_date.cmp(&b.received_date))
                .then_with(|| by_number(a, b))
        }),
        AllocationStrategy::Fifo => batches.sort_by(|a, b| {
            a.received_date
                .cmp(&b.received_date)
                .then(a.expiry_date.cmp(&b.expiry_date))
                .then_with(|| by_number(a, b))
        }),
        AllocationStrategy::Lifo => batches.sort_by(|a, b| {
            match b.received_date.cmp(&a.received_date) {
                Ordering::Equal => a
                    .expiry_date
                    .cmp(&b.expiry_date)
                    .then_with(|| by_number(a, b)),
                other => other,
            }
        }),
    }
}

/// Greedy take over `(batch_id, available)` candidates in order.
///
/// Returns the per-batch quantities, or the aggregate available quantity when
/// the candidates cannot cover `quantity`.
pub fn plan_greedy(candidates: &[(Uuid, i32)], quantity: i32) -> Result<Vec<(Uuid, i32)>, i32> {
    let mut remaining = quantity;
    let mut plan = Vec::new();
    for &(batch_id, available) in candidates {
        if remaining == 0 {
            break;
        }
        if available <= 0 {
            continue;
        }
        let take = available.min(remaining);
        plan.push((batch_id, take));
        remaining -= take;
    }
    if remaining > 0 {
        let total: i32 = candidates.iter().map(|(_, a)| (*a).max(0)).sum();
        return Err(total);
    }
    Ok(plan)
}

/// Quantity of the batch not yet claimed by any allocation.
///
/// Live allocations hold their full `allocated_quantity` (the unshipped part
/// plus what already left). Settled ones carry `allocated == shipped`, so the
/// same sum also deducts stock that has physically shipped.
pub fn available_from(batch: &batch::Model, allocations: &[allocation::Model]) -> i32 {
    let claimed: i64 = allocations
        .iter()
        .filter(|a| a.batch_id == batch.id)
        .map(|a| a.allocated_quantity as i64)
        .sum();
    (batch.received_quantity as i64 - claimed).max(0) as i32
}

#[derive(Debug, Clone, Validate, Serialize, Deserialize)]
pub struct CreateAllocationRequest {
    pub batch_id: Uuid,
    pub allocation_type: AllocationType,
    #[validate(range(min = 1))]
    pub quantity: i32,
    pub customer_id: Option<Uuid>,
    pub tender_contract_id: Option<Uuid>,
    pub reference: Option<StockReference>,
}

#[derive(Debug, Clone, Validate, Serialize, Deserialize)]
pub struct AutoAllocateRequest {
    pub product_id: Uuid,
    #[validate(range(min = 1))]
    pub quantity: i32,
    pub allocation_type: AllocationType,
    /// Falls back to the configured default when absent
    pub strategy: Option<AllocationStrategy>,
    pub customer_id: Option<Uuid>,
    pub tender_contract_id: Option<Uuid>,
    pub reference: Option<StockReference>,
}

/// Fields of a new allocation row; shared by every path that mints one.
#[derive(Debug, Clone)]
pub(crate) struct AllocationDraft {
    pub batch: batch::Model,
    pub allocation_type: AllocationType,
    pub quantity: i32,
    pub customer_id: Option<Uuid>,
    pub tender_contract_id: Option<Uuid>,
    pub contract_reservation_id: Option<Uuid>,
    pub reference: Option<StockReference>,
}

#[derive(Clone)]
pub struct AllocationService {
    db_pool: Arc<DbPool>,
    event_sender: Arc<EventSender>,
    audit: Arc<dyn AuditSink>,
    master_data: Arc<dyn MasterDataLookup>,
    default_strategy: AllocationStrategy,
    retry: RetryConfig,
}

impl AllocationService {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        audit: Arc<dyn AuditSink>,
        master_data: Arc<dyn MasterDataLookup>,
        default_strategy: AllocationStrategy,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            audit,
            master_data,
            default_strategy,
            retry: RetryConfig::default(),
        }
    }

    /// Backoff used when a transaction loses to a concurrent writer.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn default_strategy(&self) -> AllocationStrategy {
        self.default_strategy
    }

    // ----- queries -------------------------------------------------------

    #[instrument(skip(self))]
    pub async fn get_allocation(&self, allocation_id: Uuid) -> Result<allocation::Model, ServiceError> {
        AllocationEntity::find_by_id(allocation_id)
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::not_found("Allocation", allocation_id))
    }

    #[instrument(skip(self))]
    pub async fn list_allocations_for_batch(
        &self,
        batch_id: Uuid,
    ) -> Result<Vec<allocation::Model>, ServiceError> {
        Ok(AllocationEntity::find()
            .filter(allocation::Column::BatchId.eq(batch_id))
            .order_by_asc(allocation::Column::CreatedAt)
            .all(&*self.db_pool)
            .await?)
    }

    /// Unclaimed quantity of one batch, regardless of its eligibility.
    #[instrument(skip(self))]
    pub async fn available_stock(&self, batch_id: Uuid) -> Result<i32, ServiceError> {
        let db = &*self.db_pool;
        let batch = BatchEntity::find_by_id(batch_id)
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::not_found("Batch", batch_id))?;
        let allocations = allocations_for_batches(db, &[batch_id]).await?;
        Ok(available_from(&batch, &allocations))
    }

    /// Unclaimed quantity across the product's currently allocatable batches.
    #[instrument(skip(self))]
    pub async fn product_available_stock(&self, product_id: Uuid) -> Result<i32, ServiceError> {
        let db = &*self.db_pool;
        let batches = eligible_batches(db, product_id, today(), false).await?;
        let ids: Vec<Uuid> = batches.iter().map(|b| b.id).collect();
        let allocations = allocations_for_batches(db, &ids).await?;
        Ok(batches
            .iter()
            .map(|b| available_from(b, &allocations))
            .sum())
    }

    // ----- create --------------------------------------------------------

    #[instrument(skip(self, ctx, request), fields(batch_id = %request.batch_id, quantity = request.quantity))]
    pub async fn create_allocation(
        &self,
        ctx: &OperationContext,
        request: CreateAllocationRequest,
    ) -> Result<allocation::Model, ServiceError> {
        let request = &request;
        let allocation = db::with_retry("create_allocation", &self.retry, move || async move {
            let txn = db::begin(&self.db_pool).await?;
            let result = self
                .create_allocation_in(&txn, ctx, request.clone(), today())
                .await;
            db::finish(txn, result).await
        })
        .await
        .map_err(|e| count_failure("create_allocation", e))?;

        counter!("pharma_wms.allocations.created", 1);
        self.event_sender
            .publish(Event::AllocationCreated {
                allocation_id: allocation.id,
                batch_id: allocation.batch_id,
                quantity: allocation.allocated_quantity,
            })
            .await;
        record_best_effort(
            &self.audit,
            AuditEntry::new(ctx, "Allocation", allocation.id, "create_allocation")
                .with_new(&allocation),
        )
        .await;

        info!(
            allocation_id = %allocation.id,
            allocation_number = %allocation.allocation_number,
            "Allocation created"
        );
        Ok(allocation)
    }

    pub async fn create_allocation_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        ctx: &OperationContext,
        request: CreateAllocationRequest,
        today: NaiveDate,
    ) -> Result<allocation::Model, ServiceError> {
        request.validate()?;
        self.check_parties(
            request.allocation_type,
            request.customer_id,
            request.tender_contract_id,
        )
        .await?;
        if let Some(contract_id) = request.tender_contract_id {
            ensure_contract_exists(conn, contract_id).await?;
        }

        let batch = lock_batch(conn, request.batch_id).await?;
        if let Some(reason) = batch.ineligibility_reason(today) {
            return Err(ServiceError::ValidationError(reason));
        }

        let allocations = allocations_for_batches(conn, &[batch.id]).await?;
        let available = available_from(&batch, &allocations);
        if request.quantity > available {
            return Err(ServiceError::InsufficientStock {
                scope: format!("batch {}", batch.batch_number),
                requested: request.quantity,
                available,
            });
        }

        insert_allocation(
            conn,
            ctx,
            AllocationDraft {
                batch,
                allocation_type: request.allocation_type,
                quantity: request.quantity,
                customer_id: request.customer_id,
                tender_contract_id: request.tender_contract_id,
                contract_reservation_id: None,
                reference: request.reference,
            },
        )
        .await
    }

    #[instrument(skip(self, ctx, request), fields(product_id = %request.product_id, quantity = request.quantity))]
    pub async fn auto_allocate(
        &self,
        ctx: &OperationContext,
        request: AutoAllocateRequest,
    ) -> Result<Vec<allocation::Model>, ServiceError> {
        let request = &request;
        let allocations = db::with_retry("auto_allocate", &self.retry, move || async move {
            let txn = db::begin(&self.db_pool).await?;
            let result = self
                .auto_allocate_in(&txn, ctx, request.clone(), today())
                .await;
            db::finish(txn, result).await
        })
        .await
        .map_err(|e| count_failure("auto_allocate", e))?;

        counter!("pharma_wms.allocations.created", allocations.len() as u64);
        for allocation in &allocations {
            self.event_sender
                .publish(Event::AllocationCreated {
                    allocation_id: allocation.id,
                    batch_id: allocation.batch_id,
                    quantity: allocation.allocated_quantity,
                })
                .await;
            record_best_effort(
                &self.audit,
                AuditEntry::new(ctx, "Allocation", allocation.id, "auto_allocate")
                    .with_new(allocation),
            )
            .await;
        }
        Ok(allocations)
    }

    /// All-or-nothing: either the whole quantity is covered or nothing is
    /// written.
    pub async fn auto_allocate_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        ctx: &OperationContext,
        request: AutoAllocateRequest,
        today: NaiveDate,
    ) -> Result<Vec<allocation::Model>, ServiceError> {
        request.validate()?;
        self.check_parties(
            request.allocation_type,
            request.customer_id,
            request.tender_contract_id,
        )
        .await?;
        if let Some(contract_id) = request.tender_contract_id {
            ensure_contract_exists(conn, contract_id).await?;
        }

        let strategy = request.strategy.unwrap_or(self.default_strategy);
        let mut batches = match strategy {
            AllocationStrategy::Specific(batch_id) => {
                let batch = lock_batch(conn, batch_id).await?;
                if batch.product_id != request.product_id {
                    return Err(ServiceError::ValidationError(format!(
                        "batch {} does not hold product {}",
                        batch.batch_number, request.product_id
                    )));
                }
                if let Some(reason) = batch.ineligibility_reason(today) {
                    return Err(ServiceError::ValidationError(reason));
                }
                vec![batch]
            }
            _ => eligible_batches(conn, request.product_id, today, true).await?,
        };
        sort_batches(strategy, &mut batches);

        let ids: Vec<Uuid> = batches.iter().map(|b| b.id).collect();
        let existing = allocations_for_batches(conn, &ids).await?;
        let candidates: Vec<(Uuid, i32)> = batches
            .iter()
            .map(|b| (b.id, available_from(b, &existing)))
            .collect();

        let plan = plan_greedy(&candidates, request.quantity).map_err(|available| {
            ServiceError::InsufficientStock {
                scope: format!("product {}", request.product_id),
                requested: request.quantity,
                available,
            }
        })?;

        let mut by_id: HashMap<Uuid, batch::Model> =
            batches.into_iter().map(|b| (b.id, b)).collect();
        let mut created = Vec::with_capacity(plan.len());
        for (batch_id, quantity) in plan {
            let batch = by_id
                .remove(&batch_id)
                .ok_or_else(|| ServiceError::InternalError(format!("planned batch {} vanished", batch_id)))?;
            let allocation = insert_allocation(
                conn,
                ctx,
                AllocationDraft {
                    batch,
                    allocation_type: request.allocation_type,
                    quantity,
                    customer_id: request.customer_id,
                    tender_contract_id: request.tender_contract_id,
                    contract_reservation_id: None,
                    reference: request.reference.clone(),
                },
            )
            .await?;
            created.push(allocation);
        }

        info!(
            strategy = %strategy,
            batches = created.len(),
            "Auto-allocation planned"
        );
        Ok(created)
    }

    // ----- reserve / release --------------------------------------------

    #[instrument(skip(self, ctx, reference))]
    pub async fn reserve_for_picking(
        &self,
        ctx: &OperationContext,
        allocation_id: Uuid,
        quantity: i32,
        reference: StockReference,
    ) -> Result<allocation::Model, ServiceError> {
        let reference = &reference;
        let (before, after) = db::with_retry("reserve_for_picking", &self.retry, move || async move {
            let txn = db::begin(&self.db_pool).await?;
            let result =
                reserve_for_picking_in(&txn, ctx, allocation_id, quantity, reference.clone()).await;
            db::finish(txn, result).await
        })
        .await
        .map_err(|e| count_failure("reserve_for_picking", e))?;

        self.event_sender
            .publish(Event::AllocationReserved {
                allocation_id,
                quantity,
            })
            .await;
        record_best_effort(
            &self.audit,
            AuditEntry::new(ctx, "Allocation", allocation_id, "reserve_for_picking")
                .with_old(&before)
                .with_new(&after),
        )
        .await;
        Ok(after)
    }

    #[instrument(skip(self, ctx, reference))]
    pub async fn release_reservation(
        &self,
        ctx: &OperationContext,
        allocation_id: Uuid,
        quantity: i32,
        reference: StockReference,
    ) -> Result<allocation::Model, ServiceError> {
        let reference = &reference;
        let (before, after) = db::with_retry("release_reservation", &self.retry, move || async move {
            let txn = db::begin(&self.db_pool).await?;
            let result =
                release_reservation_in(&txn, ctx, allocation_id, quantity, reference.clone()).await;
            db::finish(txn, result).await
        })
        .await
        .map_err(|e| count_failure("release_reservation", e))?;

        self.event_sender
            .publish(Event::AllocationReleased {
                allocation_id,
                quantity,
            })
            .await;
        record_best_effort(
            &self.audit,
            AuditEntry::new(ctx, "Allocation", allocation_id, "release_reservation")
                .with_old(&before)
                .with_new(&after),
        )
        .await;
        Ok(after)
    }

    // ----- ship ------------------------------------------------------------

    #[instrument(skip(self, ctx, reference), fields(reference = %reference))]
    pub async fn ship_allocation(
        &self,
        ctx: &OperationContext,
        allocation_id: Uuid,
        quantity: i32,
        reference: StockReference,
    ) -> Result<allocation::Model, ServiceError> {
        let shipment = &reference;
        let (before, after) = db::with_retry("ship_allocation", &self.retry, move || async move {
            let txn = db::begin(&self.db_pool).await?;
            let result =
                ship_allocation_in(&txn, ctx, allocation_id, quantity, shipment.clone()).await;
            db::finish(txn, result).await
        })
        .await
        .map_err(|e| count_failure("ship_allocation", e))?;

        counter!("pharma_wms.units_shipped", quantity as u64);
        self.event_sender
            .publish(Event::AllocationShipped {
                allocation_id,
                quantity,
                reference_type: reference.reference_type.clone(),
                reference_id: reference.reference_id.clone(),
            })
            .await;
        record_best_effort(
            &self.audit,
            AuditEntry::new(ctx, "Allocation", allocation_id, "ship_allocation")
                .with_old(&before)
                .with_new(&after),
        )
        .await;
        Ok(after)
    }

    // ----- transfer / cancel ------------------------------------------

    /// Moves tender stock to another customer. Returns `(source, target)`.
    #[instrument(skip(self, ctx))]
    pub async fn transfer_allocation(
        &self,
        ctx: &OperationContext,
        allocation_id: Uuid,
        target_customer_id: Uuid,
        quantity: Option<i32>,
    ) -> Result<(allocation::Model, allocation::Model), ServiceError> {
        require_customer(self.master_data.as_ref(), target_customer_id).await?;

        let (source, target) = db::with_retry("transfer_allocation", &self.retry, move || async move {
            let txn = db::begin(&self.db_pool).await?;
            let result =
                transfer_allocation_in(&txn, ctx, allocation_id, target_customer_id, quantity)
                    .await;
            db::finish(txn, result).await
        })
        .await
        .map_err(|e| count_failure("transfer_allocation", e))?;

        self.event_sender
            .publish(Event::AllocationTransferred {
                source_allocation_id: source.id,
                target_allocation_id: target.id,
                quantity: target.allocated_quantity,
            })
            .await;
        record_best_effort(
            &self.audit,
            AuditEntry::new(ctx, "Allocation", source.id, "transfer_allocation")
                .with_new(&serde_json::json!({
                    "source": &source,
                    "target": &target,
                })),
        )
        .await;
        Ok((source, target))
    }

    #[instrument(skip(self, ctx))]
    pub async fn cancel_allocation(
        &self,
        ctx: &OperationContext,
        allocation_id: Uuid,
    ) -> Result<allocation::Model, ServiceError> {
        let (before, after) = db::with_retry("cancel_allocation", &self.retry, move || async move {
            let txn = db::begin(&self.db_pool).await?;
            let result = cancel_allocation_in(&txn, ctx, allocation_id).await;
            db::finish(txn, result).await
        })
        .await
        .map_err(|e| count_failure("cancel_allocation", e))?;

        self.event_sender
            .publish(Event::AllocationCancelled(allocation_id))
            .await;
        record_best_effort(
            &self.audit,
            AuditEntry::new(ctx, "Allocation", allocation_id, "cancel_allocation")
                .with_old(&before)
                .with_new(&after),
        )
        .await;
        Ok(after)
    }

    /// Customer and contract fields must agree with the allocation type.
    async fn check_parties(
        &self,
        allocation_type: AllocationType,
        customer_id: Option<Uuid>,
        tender_contract_id: Option<Uuid>,
    ) -> Result<(), ServiceError> {
        if allocation_type.requires_customer() && customer_id.is_none() {
            return Err(ServiceError::ValidationError(format!(
                "{} allocations require a customer",
                allocation_type
            )));
        }
        if tender_contract_id.is_some() && allocation_type != AllocationType::Tender {
            return Err(ServiceError::ValidationError(format!(
                "only TENDER allocations may reference a tender contract, got {}",
                allocation_type
            )));
        }
        if let Some(customer_id) = customer_id {
            require_customer(self.master_data.as_ref(), customer_id).await?;
        }
        Ok(())
    }
}

fn count_failure(operation: &'static str, err: ServiceError) -> ServiceError {
    let reason = match &err {
        ServiceError::InsufficientStock { .. } => "insufficient_stock",
        ServiceError::ValidationError(_) => "validation",
        ServiceError::NotFound(_) => "not_found",
        ServiceError::Conflict(_) => "conflict",
        ServiceError::Contention(_) => "contention",
        ServiceError::InvalidState { .. } => "invalid_state",
        e if e.is_business_rule() => "business_rule",
        _ => "internal",
    };
    counter!("pharma_wms.allocation.failures", 1, "operation" => operation, "reason" => reason);
    warn!(operation, reason, error = %err, "Allocation operation failed");
    err
}

// ----- transaction-scoped building blocks ----------------------------------

/// Loads and exclusively locks a batch row.
pub(crate) async fn lock_batch<C: ConnectionTrait>(
    conn: &C,
    batch_id: Uuid,
) -> Result<batch::Model, ServiceError> {
    BatchEntity::find_by_id(batch_id)
        .lock_exclusive()
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::not_found("Batch", batch_id))
}

/// Loads and exclusively locks an allocation row.
pub(crate) async fn lock_allocation<C: ConnectionTrait>(
    conn: &C,
    allocation_id: Uuid,
) -> Result<allocation::Model, ServiceError> {
    AllocationEntity::find_by_id(allocation_id)
        .lock_exclusive()
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::not_found("Allocation", allocation_id))
}

fn ensure_active(allocation: &allocation::Model) -> Result<(), ServiceError> {
    if allocation.status.is_terminal() {
        return Err(ServiceError::invalid_state(
            "Allocation",
            allocation.id,
            allocation.status,
            "active",
        ));
    }
    Ok(())
}

async fn ensure_contract_exists<C: ConnectionTrait>(
    conn: &C,
    contract_id: Uuid,
) -> Result<(), ServiceError> {
    TenderContractEntity::find_by_id(contract_id)
        .one(conn)
        .await?
        .map(|_| ())
        .ok_or_else(|| ServiceError::not_found("TenderContract", contract_id))
}

/// Allocatable batches of a product on `today`, optionally locked.
pub(crate) async fn eligible_batches<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    today: NaiveDate,
    lock: bool,
) -> Result<Vec<batch::Model>, ServiceError> {
    let mut query = BatchEntity::find()
        .filter(batch::Column::ProductId.eq(product_id))
        .filter(batch::Column::Status.eq(BatchStatus::Active))
        .filter(batch::Column::QcStatus.eq(QcStatus::Passed))
        .filter(batch::Column::ExpiryDate.gt(today))
        .order_by_asc(batch::Column::ExpiryDate);
    if lock {
        query = query.lock_exclusive();
    }
    Ok(query.all(conn).await?)
}

pub(crate) async fn allocations_for_batches<C: ConnectionTrait>(
    conn: &C,
    batch_ids: &[Uuid],
) -> Result<Vec<allocation::Model>, ServiceError> {
    if batch_ids.is_empty() {
        return Ok(Vec::new());
    }
    Ok(AllocationEntity::find()
        .filter(allocation::Column::BatchId.is_in(batch_ids.iter().copied()))
        .all(conn)
        .await?)
}

/// Inserts an allocation and its ALLOCATE ledger row. The caller holds the
/// batch lock and has checked availability.
pub(crate) async fn insert_allocation<C: ConnectionTrait>(
    conn: &C,
    ctx: &OperationContext,
    draft: AllocationDraft,
) -> Result<allocation::Model, ServiceError> {
    let id = Uuid::new_v4();
    let model = allocation::ActiveModel {
        id: Set(id),
        allocation_number: Set(generate_number("ALC")),
        batch_id: Set(draft.batch.id),
        product_id: Set(draft.batch.product_id),
        allocation_type: Set(draft.allocation_type),
        customer_id: Set(draft.customer_id),
        tender_contract_id: Set(draft.tender_contract_id),
        contract_reservation_id: Set(draft.contract_reservation_id),
        allocated_quantity: Set(draft.quantity),
        shipped_quantity: Set(0),
        reserved_quantity: Set(0),
        status: Set(AllocationStatus::Active),
        reference_type: Set(draft.reference.as_ref().map(|r| r.reference_type.clone())),
        reference_id: Set(draft.reference.as_ref().map(|r| r.reference_id.clone())),
        created_by: Set(ctx.actor.clone()),
        ..Default::default()
    }
    .insert(conn)
    .await?;

    let reference = draft
        .reference
        .unwrap_or_else(|| StockReference::new("allocation", id));
    record_movement(
        conn,
        ctx,
        NewMovement {
            allocation_id: Some(model.id),
            batch_id: model.batch_id,
            product_id: model.product_id,
            movement_type: MovementType::Allocate,
            quantity: draft.quantity,
            reference,
            notes: None,
        },
    )
    .await?;

    Ok(model)
}

async fn save_quantities<C: ConnectionTrait>(
    conn: &C,
    current: allocation::Model,
    quantities: AllocationQuantities,
    status: AllocationStatus,
) -> Result<allocation::Model, ServiceError> {
    let mut active: allocation::ActiveModel = current.into();
    active.allocated_quantity = Set(quantities.allocated);
    active.shipped_quantity = Set(quantities.shipped);
    active.reserved_quantity = Set(quantities.reserved);
    active.status = Set(status);
    Ok(active.update(conn).await?)
}

/// Increases `reserved_quantity`. Returns the allocation before and after.
pub async fn reserve_for_picking_in<C: ConnectionTrait>(
    conn: &C,
    ctx: &OperationContext,
    allocation_id: Uuid,
    quantity: i32,
    reference: StockReference,
) -> Result<(allocation::Model, allocation::Model), ServiceError> {
    let current = lock_allocation(conn, allocation_id).await?;
    ensure_active(&current)?;
    let next = current.quantities().reserve(quantity)?;

    let updated = save_quantities(conn, current.clone(), next, AllocationStatus::Active).await?;
    record_movement(
        conn,
        ctx,
        NewMovement {
            allocation_id: Some(allocation_id),
            batch_id: updated.batch_id,
            product_id: updated.product_id,
            movement_type: MovementType::Reserve,
            quantity,
            reference,
            notes: None,
        },
    )
    .await?;
    Ok((current, updated))
}

pub async fn release_reservation_in<C: ConnectionTrait>(
    conn: &C,
    ctx: &OperationContext,
    allocation_id: Uuid,
    quantity: i32,
    reference: StockReference,
) -> Result<(allocation::Model, allocation::Model), ServiceError> {
    let current = lock_allocation(conn, allocation_id).await?;
    ensure_active(&current)?;
    let next = current.quantities().release(quantity)?;

    let updated = save_quantities(conn, current.clone(), next, AllocationStatus::Active).await?;
    record_movement(
        conn,
        ctx,
        NewMovement {
            allocation_id: Some(allocation_id),
            batch_id: updated.batch_id,
            product_id: updated.product_id,
            movement_type: MovementType::Release,
            quantity: -quantity,
            reference,
            notes: None,
        },
    )
    .await?;
    Ok((current, updated))
}

/// Records a shipment against the allocation. The reservation is netted off
/// first; a second SHIP for the same reference is rejected with `Conflict`.
pub async fn ship_allocation_in<C: ConnectionTrait>(
    conn: &C,
    ctx: &OperationContext,
    allocation_id: Uuid,
    quantity: i32,
    reference: StockReference,
) -> Result<(allocation::Model, allocation::Model), ServiceError> {
    let current = lock_allocation(conn, allocation_id).await?;
    ensure_active(&current)?;

    if has_movement(conn, allocation_id, MovementType::Ship, &reference).await? {
        return Err(ServiceError::Conflict(format!(
            "allocation {} already shipped for {}",
            current.allocation_number, reference
        )));
    }

    let claimed = contract_claims(conn, allocation_id).await?;
    if claimed > 0 && quantity > current.outstanding() - claimed {
        return Err(ServiceError::AllocationError(format!(
            "cannot ship {} from {}: {} of {} unshipped units are reserved for contracts",
            quantity,
            current.allocation_number,
            claimed,
            current.outstanding()
        )));
    }

    let next = current.quantities().ship(quantity)?;
    let status = next.settled_status();
    let updated = save_quantities(conn, current.clone(), next, status).await?;

    propagate_shipment_to_reservation(conn, &updated, quantity).await?;

    record_movement(
        conn,
        ctx,
        NewMovement {
            allocation_id: Some(allocation_id),
            batch_id: updated.batch_id,
            product_id: updated.product_id,
            movement_type: MovementType::Ship,
            quantity,
            reference,
            notes: None,
        },
    )
    .await?;
    Ok((current, updated))
}

/// Allocations drawn from a contract reservation count their shipments
/// against it.
async fn propagate_shipment_to_reservation<C: ConnectionTrait>(
    conn: &C,
    allocation: &allocation::Model,
    quantity: i32,
) -> Result<(), ServiceError> {
    let Some(reservation_id) = allocation.contract_reservation_id else {
        return Ok(());
    };
    let reservation = ContractReservationEntity::find_by_id(reservation_id)
        .lock_exclusive()
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::not_found("ContractReservation", reservation_id))?;

    let projected = contract_reservation::Model {
        shipped_quantity: reservation.shipped_quantity + quantity,
        ..reservation.clone()
    };
    let mut active: contract_reservation::ActiveModel = reservation.into();
    active.shipped_quantity = Set(projected.shipped_quantity);
    if projected.status == ReservationStatus::Active {
        active.status = Set(projected.settled_status());
    }
    active.update(conn).await?;
    Ok(())
}

/// Quantity of `allocation_id` promised to contracts and not yet drawn.
pub(crate) async fn contract_claims<C: ConnectionTrait>(
    conn: &C,
    allocation_id: Uuid,
) -> Result<i32, ServiceError> {
    let reservations = ContractReservationEntity::find()
        .filter(contract_reservation::Column::AllocationId.eq(allocation_id))
        .filter(contract_reservation::Column::Status.eq(ReservationStatus::Active))
        .all(conn)
        .await?;
    Ok(reservations.iter().map(|r| r.remaining_quantity).sum())
}

pub async fn transfer_allocation_in<C: ConnectionTrait>(
    conn: &C,
    ctx: &OperationContext,
    allocation_id: Uuid,
    target_customer_id: Uuid,
    quantity: Option<i32>,
) -> Result<(allocation::Model, allocation::Model), ServiceError> {
    let source = lock_allocation(conn, allocation_id).await?;
    ensure_active(&source)?;

    if source.allocation_type != AllocationType::Tender {
        return Err(ServiceError::AllocationError(format!(
            "only TENDER allocations can be transferred, {} is {}",
            source.allocation_number, source.allocation_type
        )));
    }
    if source.shipped_quantity != 0 {
        return Err(ServiceError::AllocationError(format!(
            "allocation {} has already shipped {} units",
            source.allocation_number, source.shipped_quantity
        )));
    }
    if source.customer_id == Some(target_customer_id) {
        return Err(ServiceError::ValidationError(
            "target customer already owns the allocation".to_string(),
        ));
    }

    let quantity = quantity.unwrap_or(source.allocated_quantity);
    let claimed = contract_claims(conn, source.id).await?;
    let movable = source.quantities().reservable() - claimed;
    if quantity > movable {
        return Err(ServiceError::AllocationError(format!(
            "cannot transfer {} from {}: only {} free of reservations",
            quantity, source.allocation_number, movable
        )));
    }

    split_allocation(
        conn,
        ctx,
        source,
        quantity,
        SplitTarget {
            customer_id: Some(target_customer_id),
            tender_contract_id: None,
            contract_reservation_id: None,
            notes: format!("transferred to customer {}", target_customer_id),
        },
    )
    .await
}

/// Where the quantity split off an allocation goes.
pub(crate) struct SplitTarget {
    pub customer_id: Option<Uuid>,
    /// Falls back to the source's contract
    pub tender_contract_id: Option<Uuid>,
    pub contract_reservation_id: Option<Uuid>,
    pub notes: String,
}

/// Moves `quantity` of a locked tender allocation into a new tender
/// allocation on the same batch. The batch total is unchanged, so the only
/// ledger row is a TRANSFER out of the source pointing at the new allocation.
pub(crate) async fn split_allocation<C: ConnectionTrait>(
    conn: &C,
    ctx: &OperationContext,
    source: allocation::Model,
    quantity: i32,
    target: SplitTarget,
) -> Result<(allocation::Model, allocation::Model), ServiceError> {
    let next = source.quantities().reduce(quantity)?;
    let status = next.settled_status();
    let source_after = save_quantities(conn, source.clone(), next, status).await?;

    let target_id = Uuid::new_v4();
    let created = allocation::ActiveModel {
        id: Set(target_id),
        allocation_number: Set(generate_number("ALC")),
        batch_id: Set(source.batch_id),
        product_id: Set(source.product_id),
        allocation_type: Set(AllocationType::Tender),
        customer_id: Set(target.customer_id),
        tender_contract_id: Set(target.tender_contract_id.or(source.tender_contract_id)),
        contract_reservation_id: Set(target.contract_reservation_id),
        allocated_quantity: Set(quantity),
        shipped_quantity: Set(0),
        reserved_quantity: Set(0),
        status: Set(AllocationStatus::Active),
        reference_type: Set(Some("allocation".to_string())),
        reference_id: Set(Some(source.id.to_string())),
        created_by: Set(ctx.actor.clone()),
        ..Default::default()
    }
    .insert(conn)
    .await?;

    record_movement(
        conn,
        ctx,
        NewMovement {
            allocation_id: Some(source.id),
            batch_id: source.batch_id,
            product_id: source.product_id,
            movement_type: MovementType::Transfer,
            quantity: -quantity,
            reference: StockReference::new("allocation", target_id),
            notes: Some(target.notes),
        },
    )
    .await?;

    Ok((source_after, created))
}

/// Voids an untouched allocation: nothing shipped, nothing reserved.
pub async fn cancel_allocation_in<C: ConnectionTrait>(
    conn: &C,
    ctx: &OperationContext,
    allocation_id: Uuid,
) -> Result<(allocation::Model, allocation::Model), ServiceError> {
    let current = lock_allocation(conn, allocation_id).await?;
    ensure_active(&current)?;
    if current.shipped_quantity != 0 || current.reserved_quantity != 0 {
        return Err(ServiceError::AllocationError(format!(
            "allocation {} has shipped {} and reserved {}; only untouched allocations can be cancelled",
            current.allocation_number, current.shipped_quantity, current.reserved_quantity
        )));
    }
    if contract_claims(conn, allocation_id).await? > 0 {
        return Err(ServiceError::ContractError(format!(
            "allocation {} backs an active contract reservation",
            current.allocation_number
        )));
    }

    let freed = current.allocated_quantity;
    let updated = save_quantities(
        conn,
        current.clone(),
        AllocationQuantities::new(0),
        AllocationStatus::Consumed,
    )
    .await?;
    record_movement(
        conn,
        ctx,
        NewMovement {
            allocation_id: Some(allocation_id),
            batch_id: updated.batch_id,
            product_id: updated.product_id,
            movement_type: MovementType::Release,
            quantity: -freed,
            reference: StockReference::new("allocation", allocation_id),
            notes: Some("allocation cancelled".to_string()),
        },
    )
    .await?;
    Ok((current, updated))
}

/// Expires every live allocation on a batch that is leaving circulation.
/// Unshipped quantity is returned with a RELEASE row and any contract
/// reservation carved from it is released. Returns the affected ids.
pub(crate) async fn expire_allocations_for_batch<C: ConnectionTrait>(
    conn: &C,
    ctx: &OperationContext,
    batch_id: Uuid,
    reference: &StockReference,
) -> Result<Vec<Uuid>, ServiceError> {
    let live = AllocationEntity::find()
        .filter(allocation::Column::BatchId.eq(batch_id))
        .filter(allocation::Column::Status.eq(AllocationStatus::Active))
        .lock_exclusive()
        .all(conn)
        .await?;

    let mut affected = Vec::with_capacity(live.len());
    for current in live {
        let freed = current.allocated_quantity - current.shipped_quantity;
        let settled = AllocationQuantities {
            allocated: current.shipped_quantity,
            shipped: current.shipped_quantity,
            reserved: 0,
        };
        let updated = save_quantities(conn, current, settled, AllocationStatus::Expired).await?;

        if freed > 0 {
            record_movement(
                conn,
                ctx,
                NewMovement {
                    allocation_id: Some(updated.id),
                    batch_id,
                    product_id: updated.product_id,
                    movement_type: MovementType::Release,
                    quantity: -freed,
                    reference: reference.clone(),
                    notes: Some("batch withdrawn from circulation".to_string()),
                },
            )
            .await?;
        }

        let reservations = ContractReservationEntity::find()
            .filter(contract_reservation::Column::AllocationId.eq(updated.id))
            .filter(contract_reservation::Column::Status.eq(ReservationStatus::Active))
            .all(conn)
            .await?;
        for reservation in reservations {
            let drawn = reservation.allocated_quantity;
            let mut active: contract_reservation::ActiveModel = reservation.into();
            active.reserved_quantity = Set(drawn);
            active.remaining_quantity = Set(0);
            active.status = Set(ReservationStatus::Released);
            active.update(conn).await?;
        }

        affected.push(updated.id);
    }
    Ok(affected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn batch(number: &str, received: (i32, u32, u32), expiry: (i32, u32, u32)) -> batch::Model {
        let now = Utc::now();
        batch::Model {
            id: Uuid::new_v4(),
            batch_number: number.to_string(),
            product_id: Uuid::nil(),
            received_quantity: 100,
            manufacturing_date: NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            expiry_date: NaiveDate::from_ymd_opt(expiry.0, expiry.1, expiry.2).unwrap(),
            received_date: NaiveDate::from_ymd_opt(received.0, received.1, received.2).unwrap(),
            qc_status: QcStatus::Passed,
            pre_quarantine_qc_status: None,
            status: BatchStatus::Active,
            rack_location: None,
            qc_notes: None,
            qc_by: None,
            qc_at: None,
            created_by: "test".into(),
            created_at: now,
            updated_at: now,
        }
    }

    fn numbers(batches: &[batch::Model]) -> Vec<&str> {
        batches.iter().map(|b| b.batch_number.as_str()).collect()
    }

    #[test]
    fn fefo_orders_by_expiry_then_receipt() {
        let mut batches = vec![
            batch("late", (2024, 1, 1), (2025, 3, 1)),
            batch("early-b", (2024, 2, 1), (2025, 1, 1)),
            batch("early-a", (2024, 1, 15), (2025, 1, 1)),
        ];
        sort_batches(AllocationStrategy::Fefo, &mut batches);
        assert_eq!(numbers(&batches), vec!["early-a", "early-b", "late"]);
    }

    #[test]
    fn fifo_and_lifo_order_by_receipt() {
        let mut batches = vec![
            batch("mid", (2024, 2, 1), (2026, 1, 1)),
            batch("old", (2024, 1, 1), (2027, 1, 1)),
            batch("new", (2024, 3, 1), (2025, 1, 1)),
        ];
        sort_batches(AllocationStrategy::Fifo, &mut batches);
        assert_eq!(numbers(&batches), vec!["old", "mid", "new"]);

        sort_batches(AllocationStrategy::Lifo, &mut batches);
        assert_eq!(numbers(&batches), vec!["new", "mid", "old"]);
    }

    #[test]
    fn greedy_plan_takes_batches_in_order() {
        let (b1, b2, b3) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let plan = plan_greedy(&[(b1, 100), (b2, 50), (b3, 70)], 120).unwrap();
        assert_eq!(plan, vec![(b1, 100), (b2, 20)]);
    }

    #[test]
    fn greedy_plan_skips_empty_batches_and_reports_shortfall() {
        let (b1, b2) = (Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(plan_greedy(&[(b1, 0), (b2, 30)], 30).unwrap(), vec![(b2, 30)]);
        assert_eq!(plan_greedy(&[(b1, 10), (b2, 30)], 50), Err(40));
    }

    #[test]
    fn availability_deducts_every_claim() {
        let b = batch("B", (2024, 1, 1), (2026, 1, 1));
        let now = Utc::now();
        let alloc = |allocated: i32, shipped: i32, status: AllocationStatus| allocation::Model {
            id: Uuid::new_v4(),
            allocation_number: "ALC".into(),
            batch_id: b.id,
            product_id: b.product_id,
            allocation_type: AllocationType::Regular,
            customer_id: None,
            tender_contract_id: None,
            contract_reservation_id: None,
            allocated_quantity: allocated,
            shipped_quantity: shipped,
            reserved_quantity: 0,
            status,
            reference_type: None,
            reference_id: None,
            created_by: "t".into(),
            created_at: now,
            updated_at: now,
        };
        let allocations = vec![
            alloc(30, 10, AllocationStatus::Active),
            alloc(20, 20, AllocationStatus::Shipped),
            alloc(0, 0, AllocationStatus::Consumed),
        ];
        assert_eq!(available_from(&b, &allocations), 50);
    }

    #[test]
    fn strategy_parsing() {
        assert_eq!("fefo".parse::<AllocationStrategy>().unwrap(), AllocationStrategy::Fefo);
        assert_eq!(" LIFO ".parse::<AllocationStrategy>().unwrap(), AllocationStrategy::Lifo);
        assert!("SPECIFIC".parse::<AllocationStrategy>().is_err());
    }
}
