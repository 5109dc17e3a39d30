//! Tender contracts and contract reservations.
//!
//! A reservation carves capacity for one contract out of a TENDER allocation.
//! Drawing from it splits a customer-facing allocation off the source;
//! releasing it hands the capacity back. `remaining_quantity` is rewritten
//! from `reserved_quantity - allocated_quantity` on every mutation.

use chrono::NaiveDate;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::audit::{record_best_effort, AuditEntry, AuditSeverity, AuditSink};
use crate::context::OperationContext;
use crate::db::{self, DbPool};
use crate::entities::allocation::{self, AllocationStatus, AllocationType};
use crate::entities::contract_reservation::{
    self, Entity as ContractReservationEntity, ReservationStatus,
};
use crate::entities::stock_movement::MovementType;
use crate::entities::tender_contract::{self, ContractStatus, Entity as TenderContractEntity};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::master_data::{require_customer, MasterDataLookup};
use crate::services::allocation::{contract_claims, lock_allocation, split_allocation, SplitTarget};
use crate::services::ledger::{
    record_movement, NewMovement, StockReference, CONTRACT_CLAIM_REFERENCE,
};
use crate::services::today;

#[derive(Debug, Clone, Validate, Serialize, Deserialize)]
#[validate(schema(function = "validate_contract_window"))]
pub struct CreateContractRequest {
    #[validate(length(min = 1, max = 64))]
    pub contract_number: String,
    pub customer_id: Uuid,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub notes: Option<String>,
}

fn validate_contract_window(request: &CreateContractRequest) -> Result<(), ValidationError> {
    if request.end_date < request.start_date {
        return Err(ValidationError::new("end_before_start"));
    }
    Ok(())
}

#[derive(Debug, Clone, Validate, Serialize, Deserialize)]
pub struct CreateReservationRequest {
    pub contract_id: Uuid,
    pub batch_id: Uuid,
    pub allocation_id: Uuid,
    #[validate(range(min = 1))]
    pub quantity: i32,
}

/// Result of drawing from a reservation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationDraw {
    pub reservation: contract_reservation::Model,
    pub source_allocation: allocation::Model,
    pub allocation: allocation::Model,
}

#[derive(Clone)]
pub struct ContractService {
    db_pool: Arc<DbPool>,
    event_sender: Arc<EventSender>,
    audit: Arc<dyn AuditSink>,
    master_data: Arc<dyn MasterDataLookup>,
}

impl ContractService {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        audit: Arc<dyn AuditSink>,
        master_data: Arc<dyn MasterDataLookup>,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            audit,
            master_data,
        }
    }

    // ----- contracts -----------------------------------------------------

    #[instrument(skip(self))]
    pub async fn get_contract(&self, contract_id: Uuid) -> Result<tender_contract::Model, ServiceError> {
        TenderContractEntity::find_by_id(contract_id)
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::not_found("TenderContract", contract_id))
    }

    #[instrument(skip(self, ctx, request), fields(contract_number = %request.contract_number))]
    pub async fn create_contract(
        &self,
        ctx: &OperationContext,
        request: CreateContractRequest,
    ) -> Result<tender_contract::Model, ServiceError> {
        request.validate()?;
        require_customer(self.master_data.as_ref(), request.customer_id).await?;

        let db = &*self.db_pool;
        let duplicates = TenderContractEntity::find()
            .filter(tender_contract::Column::ContractNumber.eq(request.contract_number.as_str()))
            .count(db)
            .await?;
        if duplicates > 0 {
            return Err(ServiceError::Conflict(format!(
                "contract number {} already exists",
                request.contract_number
            )));
        }

        let contract = tender_contract::ActiveModel {
            contract_number: Set(request.contract_number),
            customer_id: Set(request.customer_id),
            status: Set(ContractStatus::Draft),
            start_date: Set(request.start_date),
            end_date: Set(request.end_date),
            notes: Set(request.notes),
            created_by: Set(ctx.actor.clone()),
            ..Default::default()
        }
        .insert(db)
        .await?;

        record_best_effort(
            &self.audit,
            AuditEntry::new(ctx, "TenderContract", contract.id, "create_contract").with_new(&contract),
        )
        .await;
        info!(contract_id = %contract.id, "Tender contract created");
        Ok(contract)
    }

    pub async fn activate_contract(
        &self,
        ctx: &OperationContext,
        contract_id: Uuid,
    ) -> Result<tender_contract::Model, ServiceError> {
        self.transition(ctx, contract_id, ContractStatus::Active).await
    }

    pub async fn suspend_contract(
        &self,
        ctx: &OperationContext,
        contract_id: Uuid,
    ) -> Result<tender_contract::Model, ServiceError> {
        self.transition(ctx, contract_id, ContractStatus::Suspended).await
    }

    /// Closes the contract; unused reservation capacity is handed back.
    pub async fn complete_contract(
        &self,
        ctx: &OperationContext,
        contract_id: Uuid,
    ) -> Result<tender_contract::Model, ServiceError> {
        self.transition(ctx, contract_id, ContractStatus::Completed).await
    }

    pub async fn cancel_contract(
        &self,
        ctx: &OperationContext,
        contract_id: Uuid,
    ) -> Result<tender_contract::Model, ServiceError> {
        self.transition(ctx, contract_id, ContractStatus::Cancelled).await
    }

    #[instrument(skip(self, ctx))]
    async fn transition(
        &self,
        ctx: &OperationContext,
        contract_id: Uuid,
        next: ContractStatus,
    ) -> Result<tender_contract::Model, ServiceError> {
        let txn = db::begin(&self.db_pool).await?;
        let result: Result<_, ServiceError> = async {
            let current = TenderContractEntity::find_by_id(contract_id)
                .lock_exclusive()
                .one(&txn)
                .await?
                .ok_or_else(|| ServiceError::not_found("TenderContract", contract_id))?;
            if !current.status.can_transition_to(next) {
                return Err(ServiceError::invalid_state(
                    "TenderContract",
                    contract_id,
                    current.status,
                    format!("a status that can move to {}", next),
                ));
            }

            let mut active: tender_contract::ActiveModel = current.clone().into();
            active.status = Set(next);
            let updated = active.update(&txn).await?;

            let mut released = Vec::new();
            if matches!(next, ContractStatus::Completed | ContractStatus::Cancelled) {
                let open = ContractReservationEntity::find()
                    .filter(contract_reservation::Column::TenderContractId.eq(contract_id))
                    .filter(contract_reservation::Column::Status.eq(ReservationStatus::Active))
                    .lock_exclusive()
                    .all(&txn)
                    .await?;
                for reservation in open {
                    let quantity = reservation.remaining_quantity;
                    if quantity == 0 {
                        continue;
                    }
                    released.push((reservation.id, quantity));
                    release_capacity(&txn, ctx, reservation, quantity).await?;
                }
            }
            Ok((current, updated, released))
        }
        .await;
        let (before, after, released) = db::finish(txn, result).await?;

        info!(
            contract_id = %contract_id,
            old_status = %before.status,
            new_status = %after.status,
            released = released.len(),
            "Tender contract status changed"
        );
        self.event_sender
            .publish(Event::ContractStatusChanged {
                contract_id,
                old_status: before.status.to_string(),
                new_status: after.status.to_string(),
            })
            .await;
        for (reservation_id, quantity) in released {
            self.event_sender
                .publish(Event::ReservationReleased {
                    reservation_id,
                    quantity,
                })
                .await;
        }
        record_best_effort(
            &self.audit,
            AuditEntry::new(ctx, "TenderContract", contract_id, "transition_contract")
                .with_old(&before)
                .with_new(&after),
        )
        .await;
        Ok(after)
    }

    // ----- reservations ----------------------------------------------------

    #[instrument(skip(self))]
    pub async fn get_reservation(
        &self,
        reservation_id: Uuid,
    ) -> Result<contract_reservation::Model, ServiceError> {
        ContractReservationEntity::find_by_id(reservation_id)
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::not_found("ContractReservation", reservation_id))
    }

    #[instrument(skip(self))]
    pub async fn list_reservations_for_contract(
        &self,
        contract_id: Uuid,
    ) -> Result<Vec<contract_reservation::Model>, ServiceError> {
        Ok(ContractReservationEntity::find()
            .filter(contract_reservation::Column::TenderContractId.eq(contract_id))
            .order_by_asc(contract_reservation::Column::CreatedAt)
            .all(&*self.db_pool)
            .await?)
    }

    #[instrument(skip(self, ctx, request), fields(contract_id = %request.contract_id, quantity = request.quantity))]
    pub async fn create_reservation(
        &self,
        ctx: &OperationContext,
        request: CreateReservationRequest,
    ) -> Result<contract_reservation::Model, ServiceError> {
        request.validate()?;
        let txn = db::begin(&self.db_pool).await?;
        let result = create_reservation_in(&txn, ctx, request, today()).await;
        let reservation = db::finish(txn, result).await?;

        self.event_sender
            .publish(Event::ReservationCreated {
                reservation_id: reservation.id,
                contract_id: reservation.tender_contract_id,
                quantity: reservation.reserved_quantity,
            })
            .await;
        record_best_effort(
            &self.audit,
            AuditEntry::new(ctx, "ContractReservation", reservation.id, "create_reservation")
                .with_new(&reservation),
        )
        .await;
        Ok(reservation)
    }

    /// Mints a customer allocation out of the reservation's remaining
    /// capacity.
    #[instrument(skip(self, ctx))]
    pub async fn allocate_from_reservation(
        &self,
        ctx: &OperationContext,
        reservation_id: Uuid,
        quantity: i32,
        customer_id: Uuid,
    ) -> Result<ReservationDraw, ServiceError> {
        require_customer(self.master_data.as_ref(), customer_id).await?;

        let txn = db::begin(&self.db_pool).await?;
        let result =
            allocate_from_reservation_in(&txn, ctx, reservation_id, quantity, customer_id, today())
                .await;
        let draw = db::finish(txn, result).await?;

        self.event_sender
            .publish(Event::ReservationDrawn {
                reservation_id,
                allocation_id: draw.allocation.id,
                quantity,
            })
            .await;
        self.event_sender
            .publish(Event::AllocationCreated {
                allocation_id: draw.allocation.id,
                batch_id: draw.allocation.batch_id,
                quantity,
            })
            .await;
        record_best_effort(
            &self.audit,
            AuditEntry::new(ctx, "ContractReservation", reservation_id, "allocate_from_reservation")
                .with_new(&draw),
        )
        .await;
        info!(
            reservation_id = %reservation_id,
            allocation_id = %draw.allocation.id,
            quantity,
            "Reservation drawn"
        );
        Ok(draw)
    }

    /// Returns unused capacity (all of it when `quantity` is `None`) to the
    /// underlying allocation.
    #[instrument(skip(self, ctx))]
    pub async fn release_reservation(
        &self,
        ctx: &OperationContext,
        reservation_id: Uuid,
        quantity: Option<i32>,
    ) -> Result<contract_reservation::Model, ServiceError> {
        let txn = db::begin(&self.db_pool).await?;
        let result: Result<_, ServiceError> = async {
            let current = lock_reservation(&txn, reservation_id).await?;
            ensure_reservation_active(&current)?;
            let quantity = quantity.unwrap_or(current.remaining_quantity);
            if quantity <= 0 || quantity > current.remaining_quantity {
                return Err(ServiceError::ContractError(format!(
                    "cannot release {} from reservation {}: {} remaining",
                    quantity, reservation_id, current.remaining_quantity
                )));
            }
            let updated = release_capacity(&txn, ctx, current.clone(), quantity).await?;
            Ok((current, updated, quantity))
        }
        .await;
        let (before, after, released) = db::finish(txn, result).await?;

        self.event_sender
            .publish(Event::ReservationReleased {
                reservation_id,
                quantity: released,
            })
            .await;
        record_best_effort(
            &self.audit,
            AuditEntry::new(ctx, "ContractReservation", reservation_id, "release_reservation")
                .with_old(&before)
                .with_new(&after)
                .severity(AuditSeverity::Info),
        )
        .await;
        Ok(after)
    }
}

async fn lock_reservation<C: ConnectionTrait>(
    conn: &C,
    reservation_id: Uuid,
) -> Result<contract_reservation::Model, ServiceError> {
    ContractReservationEntity::find_by_id(reservation_id)
        .lock_exclusive()
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::not_found("ContractReservation", reservation_id))
}

fn ensure_reservation_active(reservation: &contract_reservation::Model) -> Result<(), ServiceError> {
    if reservation.status != ReservationStatus::Active {
        return Err(ServiceError::invalid_state(
            "ContractReservation",
            reservation.id,
            reservation.status,
            "ACTIVE",
        ));
    }
    Ok(())
}

async fn contract_in_force<C: ConnectionTrait>(
    conn: &C,
    contract_id: Uuid,
    today: NaiveDate,
) -> Result<tender_contract::Model, ServiceError> {
    let contract = TenderContractEntity::find_by_id(contract_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::not_found("TenderContract", contract_id))?;
    if contract.status != ContractStatus::Active {
        return Err(ServiceError::invalid_state(
            "TenderContract",
            contract_id,
            contract.status,
            "ACTIVE",
        ));
    }
    if !contract.is_in_force(today) {
        return Err(ServiceError::ContractError(format!(
            "contract {} is valid {} to {}",
            contract.contract_number, contract.start_date, contract.end_date
        )));
    }
    Ok(contract)
}

pub async fn create_reservation_in<C: ConnectionTrait>(
    conn: &C,
    ctx: &OperationContext,
    request: CreateReservationRequest,
    today: NaiveDate,
) -> Result<contract_reservation::Model, ServiceError> {
    let contract = contract_in_force(conn, request.contract_id, today).await?;
    let source = lock_allocation(conn, request.allocation_id).await?;

    if source.status != AllocationStatus::Active {
        return Err(ServiceError::invalid_state(
            "Allocation",
            source.id,
            source.status,
            "active",
        ));
    }
    if source.allocation_type != AllocationType::Tender {
        return Err(ServiceError::ContractError(format!(
            "allocation {} is {}, reservations need a TENDER allocation",
            source.allocation_number, source.allocation_type
        )));
    }
    if source.batch_id != request.batch_id {
        return Err(ServiceError::ValidationError(format!(
            "allocation {} is not on batch {}",
            source.allocation_number, request.batch_id
        )));
    }
    if source.tender_contract_id.is_some_and(|id| id != contract.id) {
        return Err(ServiceError::ContractError(format!(
            "allocation {} belongs to another contract",
            source.allocation_number
        )));
    }

    let existing = ContractReservationEntity::find()
        .filter(contract_reservation::Column::TenderContractId.eq(contract.id))
        .filter(contract_reservation::Column::AllocationId.eq(source.id))
        .count(conn)
        .await?;
    if existing > 0 {
        return Err(ServiceError::Conflict(format!(
            "contract {} already holds a reservation on allocation {}",
            contract.contract_number, source.allocation_number
        )));
    }

    let headroom = source.outstanding() - contract_claims(conn, source.id).await?;
    if request.quantity > headroom {
        return Err(ServiceError::InsufficientStock {
            scope: format!("allocation {}", source.allocation_number),
            requested: request.quantity,
            available: headroom,
        });
    }

    let reservation = contract_reservation::ActiveModel {
        tender_contract_id: Set(contract.id),
        batch_id: Set(source.batch_id),
        allocation_id: Set(source.id),
        reserved_quantity: Set(request.quantity),
        allocated_quantity: Set(0),
        remaining_quantity: Set(request.quantity),
        shipped_quantity: Set(0),
        status: Set(ReservationStatus::Active),
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
            movement_type: MovementType::Reserve,
            quantity: request.quantity,
            reference: StockReference::new(CONTRACT_CLAIM_REFERENCE, reservation.id),
            notes: Some(format!("reserved for contract {}", contract.contract_number)),
        },
    )
    .await?;

    Ok(reservation)
}

pub async fn allocate_from_reservation_in<C: ConnectionTrait>(
    conn: &C,
    ctx: &OperationContext,
    reservation_id: Uuid,
    quantity: i32,
    customer_id: Uuid,
    today: NaiveDate,
) -> Result<ReservationDraw, ServiceError> {
    let reservation = lock_reservation(conn, reservation_id).await?;
    ensure_reservation_active(&reservation)?;
    contract_in_force(conn, reservation.tender_contract_id, today).await?;

    if quantity <= 0 || quantity > reservation.remaining_quantity {
        return Err(ServiceError::ContractError(format!(
            "cannot draw {} from reservation {}: {} remaining",
            quantity, reservation_id, reservation.remaining_quantity
        )));
    }

    let source = lock_allocation(conn, reservation.allocation_id).await?;
    if source.status != AllocationStatus::Active {
        return Err(ServiceError::invalid_state(
            "Allocation",
            source.id,
            source.status,
            "active",
        ));
    }

    let (source_after, drawn) = split_allocation(
        conn,
        ctx,
        source,
        quantity,
        SplitTarget {
            customer_id: Some(customer_id),
            tender_contract_id: Some(reservation.tender_contract_id),
            contract_reservation_id: Some(reservation.id),
            notes: format!("drawn from contract reservation {}", reservation.id),
        },
    )
    .await?;

    let allocated = reservation.allocated_quantity + quantity;
    let projected = contract_reservation::Model {
        allocated_quantity: allocated,
        remaining_quantity: reservation.reserved_quantity - allocated,
        ..reservation.clone()
    };
    let mut active: contract_reservation::ActiveModel = reservation.into();
    active.allocated_quantity = Set(projected.allocated_quantity);
    active.remaining_quantity = Set(projected.remaining_quantity);
    active.status = Set(projected.settled_status());
    let updated = active.update(conn).await?;

    Ok(ReservationDraw {
        reservation: updated,
        source_allocation: source_after,
        allocation: drawn,
    })
}

/// Shrinks a reservation by `quantity` of its remaining capacity and records
/// the release against the source allocation.
async fn release_capacity<C: ConnectionTrait>(
    conn: &C,
    ctx: &OperationContext,
    reservation: contract_reservation::Model,
    quantity: i32,
) -> Result<contract_reservation::Model, ServiceError> {
    let source = lock_allocation(conn, reservation.allocation_id).await?;

    let reserved = reservation.reserved_quantity - quantity;
    let projected = contract_reservation::Model {
        reserved_quantity: reserved,
        remaining_quantity: reserved - reservation.allocated_quantity,
        ..reservation.clone()
    };
    let status = if projected.remaining_quantity == 0 && projected.allocated_quantity == 0 {
        ReservationStatus::Released
    } else {
        projected.settled_status()
    };

    let mut active: contract_reservation::ActiveModel = reservation.clone().into();
    active.reserved_quantity = Set(projected.reserved_quantity);
    active.remaining_quantity = Set(projected.remaining_quantity);
    active.status = Set(status);
    let updated = active.update(conn).await?;

    record_movement(
        conn,
        ctx,
        NewMovement {
            allocation_id: Some(source.id),
            batch_id: source.batch_id,
            product_id: source.product_id,
            movement_type: MovementType::Release,
            quantity: -quantity,
            reference: StockReference::new(CONTRACT_CLAIM_REFERENCE, reservation.id),
            notes: Some("contract capacity returned".to_string()),
        },
    )
    .await?;

    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_window_must_not_be_inverted() {
        let request = |start: (i32, u32, u32), end: (i32, u32, u32)| CreateContractRequest {
            contract_number: "TND-2024-01".into(),
            customer_id: Uuid::new_v4(),
            start_date: NaiveDate::from_ymd_opt(start.0, start.1, start.2).unwrap(),
            end_date: NaiveDate::from_ymd_opt(end.0, end.1, end.2).unwrap(),
            notes: None,
        };
        assert!(request((2024, 1, 1), (2024, 12, 31)).validate().is_ok());
        assert!(request((2024, 1, 1), (2024, 1, 1)).validate().is_ok());
        assert!(request((2024, 6, 1), (2024, 1, 1)).validate().is_err());
    }

    #[test]
    fn reservation_quantity_must_be_positive() {
        let request = CreateReservationRequest {
            contract_id: Uuid::new_v4(),
            batch_id: Uuid::new_v4(),
            allocation_id: Uuid::new_v4(),
            quantity: 0,
        };
        assert!(request.validate().is_err());
    }
}
