//! Stock Movement Ledger
//!
//! Append-only record of every quantity-affecting event. Writers run inside
//! the caller's transaction through [`record_movement`]; readers go through
//! [`StockLedger`].

use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::context::OperationContext;
use crate::db::DbPool;
use crate::entities::stock_movement::{self, Entity as StockMovementEntity, MovementType};
use crate::errors::ServiceError;

/// The entity that caused a movement, e.g. `("packing_order", <id>)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StockReference {
    pub reference_type: String,
    pub reference_id: String,
}

impl StockReference {
    pub fn new(reference_type: impl Into<String>, reference_id: impl fmt::Display) -> Self {
        Self {
            reference_type: reference_type.into(),
            reference_id: reference_id.to_string(),
        }
    }
}

impl fmt::Display for StockReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.reference_type, self.reference_id)
    }
}

/// Reference type of the RESERVE and RELEASE rows a tender contract writes
/// when it claims or returns capacity on an allocation. They track contract
/// claims, not picking reservations, and leave `reserved_quantity` alone.
pub const CONTRACT_CLAIM_REFERENCE: &str = "contract_reservation";

#[derive(Debug, Clone)]
pub struct NewMovement {
    pub allocation_id: Option<Uuid>,
    pub batch_id: Uuid,
    pub product_id: Uuid,
    pub movement_type: MovementType,
    /// Signed: positive for allocate/reserve/pick/ship, negative for
    /// release/transfer-out, either sign for adjust.
    pub quantity: i32,
    pub reference: StockReference,
    pub notes: Option<String>,
}

/// Appends one ledger row on `conn`.
pub async fn record_movement<C: ConnectionTrait>(
    conn: &C,
    ctx: &OperationContext,
    movement: NewMovement,
) -> Result<stock_movement::Model, ServiceError> {
    debug!(
        movement_type = %movement.movement_type,
        quantity = movement.quantity,
        reference = %movement.reference,
        "Recording stock movement"
    );

    let row = stock_movement::ActiveModel {
        allocation_id: Set(movement.allocation_id),
        batch_id: Set(movement.batch_id),
        product_id: Set(movement.product_id),
        movement_type: Set(movement.movement_type),
        quantity: Set(movement.quantity),
        reference_type: Set(movement.reference.reference_type),
        reference_id: Set(movement.reference.reference_id),
        notes: Set(movement.notes),
        created_by: Set(ctx.actor.clone()),
        ..Default::default()
    };

    Ok(row.insert(conn).await?)
}

/// Whether a movement of `movement_type` for `reference` already exists
/// against the allocation.
pub async fn has_movement<C: ConnectionTrait>(
    conn: &C,
    allocation_id: Uuid,
    movement_type: MovementType,
    reference: &StockReference,
) -> Result<bool, ServiceError> {
    let count = StockMovementEntity::find()
        .filter(stock_movement::Column::AllocationId.eq(allocation_id))
        .filter(stock_movement::Column::MovementType.eq(movement_type))
        .filter(stock_movement::Column::ReferenceType.eq(reference.reference_type.as_str()))
        .filter(stock_movement::Column::ReferenceId.eq(reference.reference_id.as_str()))
        .count(conn)
        .await?;
    Ok(count > 0)
}

/// Read side of the ledger.
#[derive(Clone)]
pub struct StockLedger {
    db_pool: Arc<DbPool>,
}

impl StockLedger {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    #[instrument(skip(self))]
    pub async fn movements_for_allocation(
        &self,
        allocation_id: Uuid,
    ) -> Result<Vec<stock_movement::Model>, ServiceError> {
        Ok(StockMovementEntity::find()
            .filter(stock_movement::Column::AllocationId.eq(allocation_id))
            .order_by_asc(stock_movement::Column::CreatedAt)
            .all(&*self.db_pool)
            .await?)
    }

    #[instrument(skip(self))]
    pub async fn movements_for_batch(
        &self,
        batch_id: Uuid,
    ) -> Result<Vec<stock_movement::Model>, ServiceError> {
        Ok(StockMovementEntity::find()
            .filter(stock_movement::Column::BatchId.eq(batch_id))
            .order_by_asc(stock_movement::Column::CreatedAt)
            .all(&*self.db_pool)
            .await?)
    }

    #[instrument(skip(self))]
    pub async fn movements_for_reference(
        &self,
        reference_type: &str,
        reference_id: &str,
    ) -> Result<Vec<stock_movement::Model>, ServiceError> {
        Ok(StockMovementEntity::find()
            .filter(stock_movement::Column::ReferenceType.eq(reference_type))
            .filter(stock_movement::Column::ReferenceId.eq(reference_id))
            .order_by_asc(stock_movement::Column::CreatedAt)
            .all(&*self.db_pool)
            .await?)
    }

    pub async fn has_movement(
        &self,
        allocation_id: Uuid,
        movement_type: MovementType,
        reference: &StockReference,
    ) -> Result<bool, ServiceError> {
        has_movement(&*self.db_pool, allocation_id, movement_type, reference).await
    }

    /// Net signed quantity for one movement type on an allocation.
    ///
    /// Contract claim rows are left out, so the RESERVE net tracks the
    /// allocation's `reserved_quantity`.
    pub async fn net_quantity(
        &self,
        allocation_id: Uuid,
        movement_type: MovementType,
    ) -> Result<i64, ServiceError> {
        let rows = self.movements_for_allocation(allocation_id).await?;
        Ok(rows
            .iter()
            .filter(|m| m.movement_type == movement_type)
            .filter(|m| m.reference_type != CONTRACT_CLAIM_REFERENCE)
            .map(|m| m.quantity as i64)
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_renders_type_and_id() {
        let id = Uuid::nil();
        let reference = StockReference::new("packing_order", id);
        assert_eq!(reference.reference_id, id.to_string());
        assert_eq!(
            reference.to_string(),
            format!("packing_order:{}", id)
        );
    }
}
