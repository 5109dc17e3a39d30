use chrono::Utc;
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::picking::list_items;
use super::{
    ensure_task_transition, find_by_id, lock_by_id, set_plan_status, transition_audit,
    PipelineDeps,
};
use crate::audit::AuditEntry;
use crate::context::OperationContext;
use crate::db;
use crate::entities::generate_number;
use crate::entities::packing_box::{self, BoxStatus, Entity as PackingBoxEntity};
use crate::entities::packing_box_item::{self, Entity as PackingBoxItemEntity};
use crate::entities::packing_order::{self, Entity as PackingOrderEntity, PackingStatus};
use crate::entities::packing_slip::{self, Entity as PackingSlipEntity, PackingSlipStatus};
use crate::entities::picking_list_item::{self, Entity as PickingListItemEntity};
use crate::entities::sales_order_item::{self, Entity as SalesOrderItemEntity};
use crate::entities::shipping_plan::{Entity as ShippingPlanEntity, ShippingPlanStatus};
use crate::entities::shipping_plan_item::Entity as ShippingPlanItemEntity;
use crate::errors::ServiceError;
use crate::events::Event;
use crate::services::allocation::{release_reservation_in, ship_allocation_in};
use crate::services::ledger::StockReference;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoxDetails {
    pub packing_box: packing_box::Model,
    pub items: Vec<packing_box_item::Model>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackingOrderDetails {
    pub order: packing_order::Model,
    pub boxes: Vec<BoxDetails>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackingCompletion {
    pub order: packing_order::Model,
    pub slip: packing_slip::Model,
    /// Units shipped per allocation.
    pub shipped: BTreeMap<Uuid, i32>,
}

/// Sums packed quantities per key, e.g. per allocation.
fn totals_by<K: Ord + Copy>(
    items: &[packing_box_item::Model],
    key: impl Fn(&packing_box_item::Model) -> K,
) -> BTreeMap<K, i32> {
    let mut totals = BTreeMap::new();
    for item in items {
        *totals.entry(key(item)).or_insert(0) += item.quantity_packed;
    }
    totals
}

#[derive(Clone)]
pub struct PackingService {
    deps: PipelineDeps,
}

impl PackingService {
    pub fn new(deps: PipelineDeps) -> Self {
        Self { deps }
    }

    #[instrument(skip(self))]
    pub async fn get_packing_order(&self, order_id: Uuid) -> Result<PackingOrderDetails, ServiceError> {
        let db = &*self.deps.db_pool;
        let order = find_by_id::<PackingOrderEntity, _>(db, "PackingOrder", order_id).await?;
        let mut boxes = Vec::new();
        for packing_box in boxes_of(db, order_id).await? {
            let items = box_items(db, &[packing_box.id]).await?;
            boxes.push(BoxDetails { packing_box, items });
        }
        Ok(PackingOrderDetails { order, boxes })
    }

    #[instrument(skip(self))]
    pub async fn get_packing_slip(&self, slip_id: Uuid) -> Result<packing_slip::Model, ServiceError> {
        find_by_id::<PackingSlipEntity, _>(&*self.deps.db_pool, "PackingSlip", slip_id).await
    }

    #[instrument(skip(self, ctx))]
    pub async fn assign_packing_order(
        &self,
        ctx: &OperationContext,
        order_id: Uuid,
        assignee: String,
    ) -> Result<packing_order::Model, ServiceError> {
        if assignee.trim().is_empty() {
            return Err(ServiceError::ValidationError("assignee is required".to_string()));
        }
        let txn = db::begin(&self.deps.db_pool).await?;
        let result: Result<_, ServiceError> = async {
            let order = lock_by_id::<PackingOrderEntity, _>(&txn, "PackingOrder", order_id).await?;
            ensure_task_transition("PackingOrder", order_id, order.status, PackingStatus::Assigned)?;
            let before = order.clone();
            let mut active: packing_order::ActiveModel = order.into();
            active.status = Set(PackingStatus::Assigned);
            active.assigned_to = Set(Some(assignee.clone()));
            Ok((before, active.update(&txn).await?))
        }
        .await;
        let (before, updated) = db::finish(txn, result).await?;

        self.after_transition(ctx, "assign_packing_order", &before, &updated, Vec::new())
            .await;
        Ok(updated)
    }

    #[instrument(skip(self, ctx))]
    pub async fn start_packing(
        &self,
        ctx: &OperationContext,
        order_id: Uuid,
    ) -> Result<packing_order::Model, ServiceError> {
        let txn = db::begin(&self.deps.db_pool).await?;
        let result: Result<_, ServiceError> = async {
            let order = lock_by_id::<PackingOrderEntity, _>(&txn, "PackingOrder", order_id).await?;
            ensure_task_transition("PackingOrder", order_id, order.status, PackingStatus::InProgress)?;
            let before = order.clone();
            let mut active: packing_order::ActiveModel = order.into();
            active.status = Set(PackingStatus::InProgress);
            active.started_at = Set(Some(Utc::now()));
            Ok((before, active.update(&txn).await?))
        }
        .await;
        let (before, updated) = db::finish(txn, result).await?;

        self.after_transition(ctx, "start_packing", &before, &updated, Vec::new())
            .await;
        Ok(updated)
    }

    /// Opens the next numbered box on an IN_PROGRESS packing order.
    #[instrument(skip(self, ctx))]
    pub async fn create_box(
        &self,
        ctx: &OperationContext,
        order_id: Uuid,
    ) -> Result<packing_box::Model, ServiceError> {
        let txn = db::begin(&self.deps.db_pool).await?;
        let result: Result<_, ServiceError> = async {
            let order = lock_by_id::<PackingOrderEntity, _>(&txn, "PackingOrder", order_id).await?;
            ensure_packing(&order)?;
            let next_number = boxes_of(&txn, order_id)
                .await?
                .iter()
                .map(|b| b.box_number)
                .max()
                .unwrap_or(0)
                + 1;
            Ok(packing_box::ActiveModel {
                packing_order_id: Set(order_id),
                box_number: Set(next_number),
                status: Set(BoxStatus::Open),
                weight_grams: Set(None),
                sealed_at: Set(None),
                ..Default::default()
            }
            .insert(&txn)
            .await?)
        }
        .await;
        let created = db::finish(txn, result).await?;

        self.deps
            .audit(AuditEntry::new(ctx, "PackingBox", created.id, "create_box").with_new(&created))
            .await;
        info!(packing_order_id = %order_id, box_number = created.box_number, "Box opened");
        Ok(created)
    }

    /// Puts picked units of one picking line into an open box. Units packed
    /// across all boxes never exceed what was picked for the line.
    #[instrument(skip(self, ctx))]
    pub async fn add_item_to_box(
        &self,
        ctx: &OperationContext,
        box_id: Uuid,
        picking_list_item_id: Uuid,
        quantity: i32,
    ) -> Result<packing_box_item::Model, ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::ValidationError(format!(
                "packed quantity must be positive, got {}",
                quantity
            )));
        }
        let txn = db::begin(&self.deps.db_pool).await?;
        let result: Result<_, ServiceError> = async {
            let packing_box = lock_by_id::<PackingBoxEntity, _>(&txn, "PackingBox", box_id).await?;
            ensure_open(&packing_box)?;
            let order =
                lock_by_id::<PackingOrderEntity, _>(&txn, "PackingOrder", packing_box.packing_order_id).await?;
            ensure_packing(&order)?;

            let line = find_by_id::<PickingListItemEntity, _>(&txn, "PickingListItem", picking_list_item_id)
                .await?;
            if line.picking_list_id != order.picking_list_id {
                return Err(ServiceError::PackingError(format!(
                    "picking line {} does not belong to packing order {}",
                    picking_list_item_id, order.packing_number
                )));
            }

            let box_ids: Vec<Uuid> = boxes_of(&txn, order.id).await?.iter().map(|b| b.id).collect();
            let already: i32 = box_items(&txn, &box_ids)
                .await?
                .iter()
                .filter(|i| i.picking_list_item_id == picking_list_item_id)
                .map(|i| i.quantity_packed)
                .sum();
            if already + quantity > line.quantity_picked {
                return Err(ServiceError::PackingError(format!(
                    "cannot pack {} more of line {}: {} of {} picked units already packed",
                    quantity, line.sequence, already, line.quantity_picked
                )));
            }

            Ok(packing_box_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                packing_box_id: Set(box_id),
                picking_list_item_id: Set(picking_list_item_id),
                allocation_id: Set(line.allocation_id),
                quantity_packed: Set(quantity),
                created_at: Set(Utc::now()),
            }
            .insert(&txn)
            .await?)
        }
        .await;
        let created = db::finish(txn, result).await?;

        self.deps
            .audit(AuditEntry::new(ctx, "PackingBox", box_id, "add_item_to_box").with_new(&created))
            .await;
        Ok(created)
    }

    /// Seals a non-empty box; a sealed box takes no further items.
    #[instrument(skip(self, ctx))]
    pub async fn seal_box(
        &self,
        ctx: &OperationContext,
        box_id: Uuid,
        weight_grams: Option<i32>,
    ) -> Result<packing_box::Model, ServiceError> {
        if matches!(weight_grams, Some(w) if w <= 0) {
            return Err(ServiceError::ValidationError("box weight must be positive".to_string()));
        }
        let txn = db::begin(&self.deps.db_pool).await?;
        let result: Result<_, ServiceError> = async {
            let packing_box = lock_by_id::<PackingBoxEntity, _>(&txn, "PackingBox", box_id).await?;
            ensure_open(&packing_box)?;
            if box_items(&txn, &[box_id]).await?.is_empty() {
                return Err(ServiceError::PackingError(format!(
                    "box {} is empty",
                    packing_box.box_number
                )));
            }
            let before = packing_box.clone();
            let mut active: packing_box::ActiveModel = packing_box.into();
            active.status = Set(BoxStatus::Sealed);
            active.weight_grams = Set(weight_grams);
            active.sealed_at = Set(Some(Utc::now()));
            Ok((before, active.update(&txn).await?))
        }
        .await;
        let (before, sealed) = db::finish(txn, result).await?;

        self.deps
            .audit(transition_audit(ctx, "PackingBox", box_id, "seal_box", &before, &sealed))
            .await;
        Ok(sealed)
    }

    /// Ships everything packed, summed per allocation, and drafts the
    /// packing slip. The shipping plan is complete afterwards.
    #[instrument(skip(self, ctx))]
    pub async fn complete_packing(
        &self,
        ctx: &OperationContext,
        order_id: Uuid,
    ) -> Result<PackingCompletion, ServiceError> {
        let reference = StockReference::new("packing_order", order_id);
        let txn = db::begin(&self.deps.db_pool).await?;
        let result: Result<_, ServiceError> = async {
            let order = lock_by_id::<PackingOrderEntity, _>(&txn, "PackingOrder", order_id).await?;
            ensure_task_transition("PackingOrder", order_id, order.status, PackingStatus::Completed)?;

            let boxes = boxes_of(&txn, order_id).await?;
            if boxes.is_empty() {
                return Err(ServiceError::PackingError(format!(
                    "packing order {} has no boxes",
                    order.packing_number
                )));
            }
            let open: Vec<i32> = boxes
                .iter()
                .filter(|b| b.status != BoxStatus::Sealed)
                .map(|b| b.box_number)
                .collect();
            if !open.is_empty() {
                return Err(ServiceError::PackingError(format!(
                    "packing order {} has unsealed boxes {:?}",
                    order.packing_number, open
                )));
            }

            let box_ids: Vec<Uuid> = boxes.iter().map(|b| b.id).collect();
            let packed = box_items(&txn, &box_ids).await?;
            let lines = list_items(&txn, order.picking_list_id).await?;
            let per_line = totals_by(&packed, |i| i.picking_list_item_id);
            let unpacked: Vec<i32> = lines
                .iter()
                .filter(|l| per_line.get(&l.id).copied().unwrap_or(0) != l.quantity_picked)
                .map(|l| l.sequence)
                .collect();
            if !unpacked.is_empty() {
                return Err(ServiceError::PackingError(format!(
                    "picked units of lines {:?} are not fully packed",
                    unpacked
                )));
            }

            let shipped = totals_by(&packed, |i| i.allocation_id);
            let mut events = Vec::new();
            for (&allocation_id, &quantity) in &shipped {
                ship_allocation_in(&txn, ctx, allocation_id, quantity, reference.clone()).await?;
                events.push(Event::AllocationShipped {
                    allocation_id,
                    quantity,
                    reference_type: reference.reference_type.clone(),
                    reference_id: reference.reference_id.clone(),
                });
            }
            record_order_shipments(&txn, &lines, &per_line).await?;

            let total_units: i32 = shipped.values().sum();
            let slip = packing_slip::ActiveModel {
                slip_number: Set(generate_number("SLIP")),
                packing_order_id: Set(order_id),
                sales_order_id: Set(order.sales_order_id),
                status: Set(PackingSlipStatus::Draft),
                total_boxes: Set(boxes.len() as i32),
                total_units: Set(total_units),
                finalized_at: Set(None),
                created_by: Set(ctx.actor.clone()),
                ..Default::default()
            }
            .insert(&txn)
            .await?;

            let before = order.clone();
            let mut active: packing_order::ActiveModel = order.into();
            active.status = Set(PackingStatus::Completed);
            active.completed_at = Set(Some(Utc::now()));
            let updated = active.update(&txn).await?;

            let plan = lock_by_id::<ShippingPlanEntity, _>(&txn, "ShippingPlan", updated.shipping_plan_id).await?;
            let (_, plan_event) = set_plan_status(&txn, plan, ShippingPlanStatus::Completed).await?;
            events.extend(plan_event);

            Ok((before, PackingCompletion { order: updated, slip, shipped }, events))
        }
        .await;
        let (before, completion, events) = db::finish(txn, result).await?;

        let units: i32 = completion.shipped.values().sum();
        counter!("pharma_wms.units_shipped", units as u64);
        self.after_transition(ctx, "complete_packing", &before, &completion.order, events)
            .await;
        info!(
            packing_order_id = %order_id,
            slip_id = %completion.slip.id,
            allocations = completion.shipped.len(),
            units,
            "Packing completed"
        );
        Ok(completion)
    }

    /// Abandons packing. The picked units stay reserved until this point and
    /// are released here; the plan returns to ALLOCATED for a new pick.
    #[instrument(skip(self, ctx))]
    pub async fn cancel_packing_order(
        &self,
        ctx: &OperationContext,
        order_id: Uuid,
    ) -> Result<packing_order::Model, ServiceError> {
        let reference = StockReference::new("packing_order", order_id);
        let txn = db::begin(&self.deps.db_pool).await?;
        let result: Result<_, ServiceError> = async {
            let order = lock_by_id::<PackingOrderEntity, _>(&txn, "PackingOrder", order_id).await?;
            ensure_task_transition("PackingOrder", order_id, order.status, PackingStatus::Cancelled)?;

            let mut events = Vec::new();
            for line in list_items(&txn, order.picking_list_id).await? {
                release_reservation_in(&txn, ctx, line.allocation_id, line.quantity_to_pick, reference.clone())
                    .await?;
                events.push(Event::AllocationReleased {
                    allocation_id: line.allocation_id,
                    quantity: line.quantity_to_pick,
                });
            }

            let before = order.clone();
            let mut active: packing_order::ActiveModel = order.into();
            active.status = Set(PackingStatus::Cancelled);
            let updated = active.update(&txn).await?;

            let plan = lock_by_id::<ShippingPlanEntity, _>(&txn, "ShippingPlan", updated.shipping_plan_id).await?;
            if plan.status == ShippingPlanStatus::Processing {
                let (_, event) = set_plan_status(&txn, plan, ShippingPlanStatus::Allocated).await?;
                events.extend(event);
            }
            Ok((before, updated, events))
        }
        .await;
        let (before, updated, events) = db::finish(txn, result).await?;

        warn!(packing_order_id = %order_id, "Packing order cancelled; reservations released");
        self.after_transition(ctx, "cancel_packing_order", &before, &updated, events)
            .await;
        Ok(updated)
    }

    #[instrument(skip(self, ctx))]
    pub async fn finalize_packing_slip(
        &self,
        ctx: &OperationContext,
        slip_id: Uuid,
    ) -> Result<packing_slip::Model, ServiceError> {
        let txn = db::begin(&self.deps.db_pool).await?;
        let result: Result<_, ServiceError> = async {
            let slip = lock_by_id::<PackingSlipEntity, _>(&txn, "PackingSlip", slip_id).await?;
            if slip.status != PackingSlipStatus::Draft {
                return Err(ServiceError::invalid_state("PackingSlip", slip_id, slip.status, "DRAFT"));
            }
            let before = slip.clone();
            let mut active: packing_slip::ActiveModel = slip.into();
            active.status = Set(PackingSlipStatus::Finalized);
            active.finalized_at = Set(Some(Utc::now()));
            Ok((before, active.update(&txn).await?))
        }
        .await;
        let (before, finalized) = db::finish(txn, result).await?;

        self.deps
            .audit(transition_audit(
                ctx,
                "PackingSlip",
                slip_id,
                "finalize_packing_slip",
                &before,
                &finalized,
            ))
            .await;
        info!(slip_id = %slip_id, "Packing slip finalized");
        Ok(finalized)
    }

    async fn after_transition(
        &self,
        ctx: &OperationContext,
        action: &str,
        before: &packing_order::Model,
        after: &packing_order::Model,
        mut events: Vec<Event>,
    ) {
        if before.status != after.status {
            events.insert(
                0,
                Event::PackingOrderStatusChanged {
                    packing_order_id: after.id,
                    old_status: before.status.to_string(),
                    new_status: after.status.to_string(),
                },
            );
        }
        self.deps.publish_all(events).await;
        self.deps
            .audit(transition_audit(ctx, "PackingOrder", after.id, action, before, after))
            .await;
    }
}

fn ensure_packing(order: &packing_order::Model) -> Result<(), ServiceError> {
    if order.status != PackingStatus::InProgress {
        return Err(ServiceError::invalid_state(
            "PackingOrder",
            order.id,
            order.status,
            "IN_PROGRESS",
        ));
    }
    Ok(())
}

fn ensure_open(packing_box: &packing_box::Model) -> Result<(), ServiceError> {
    if packing_box.status != BoxStatus::Open {
        return Err(ServiceError::PackingError(format!(
            "box {} is sealed",
            packing_box.box_number
        )));
    }
    Ok(())
}

async fn boxes_of<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<Vec<packing_box::Model>, ServiceError> {
    Ok(PackingBoxEntity::find()
        .filter(packing_box::Column::PackingOrderId.eq(order_id))
        .order_by_asc(packing_box::Column::BoxNumber)
        .all(conn)
        .await?)
}

async fn box_items<C: ConnectionTrait>(
    conn: &C,
    box_ids: &[Uuid],
) -> Result<Vec<packing_box_item::Model>, ServiceError> {
    if box_ids.is_empty() {
        return Ok(Vec::new());
    }
    Ok(PackingBoxItemEntity::find()
        .filter(packing_box_item::Column::PackingBoxId.is_in(box_ids.to_vec()))
        .order_by_asc(packing_box_item::Column::CreatedAt)
        .all(conn)
        .await?)
}

/// Carries packed units back to the sales order lines through the plan items
/// they were picked for.
async fn record_order_shipments<C: ConnectionTrait>(
    conn: &C,
    lines: &[picking_list_item::Model],
    packed_per_line: &BTreeMap<Uuid, i32>,
) -> Result<(), ServiceError> {
    let mut per_plan_item: BTreeMap<Uuid, i32> = BTreeMap::new();
    for line in lines {
        let packed = packed_per_line.get(&line.id).copied().unwrap_or(0);
        *per_plan_item.entry(line.shipping_plan_item_id).or_insert(0) += packed;
    }

    for (plan_item_id, quantity) in per_plan_item {
        if quantity == 0 {
            continue;
        }
        let plan_item = find_by_id::<ShippingPlanItemEntity, _>(conn, "ShippingPlanItem", plan_item_id).await?;
        let order_item =
            lock_by_id::<SalesOrderItemEntity, _>(conn, "SalesOrderItem", plan_item.sales_order_item_id).await?;
        let shipped = order_item.shipped_quantity + quantity;
        if shipped > order_item.quantity {
            return Err(ServiceError::ShipmentError(format!(
                "order line {} would ship {} of {} ordered",
                order_item.id, shipped, order_item.quantity
            )));
        }
        let mut active: sales_order_item::ActiveModel = order_item.into();
        active.shipped_quantity = Set(shipped);
        active.update(conn).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packed(allocation_id: Uuid, line_id: Uuid, quantity: i32) -> packing_box_item::Model {
        packing_box_item::Model {
            id: Uuid::new_v4(),
            packing_box_id: Uuid::new_v4(),
            picking_list_item_id: line_id,
            allocation_id,
            quantity_packed: quantity,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn shipments_are_summed_per_allocation_across_boxes() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let line = Uuid::new_v4();
        let items = vec![packed(a, line, 10), packed(b, line, 5), packed(a, line, 7)];

        let totals = totals_by(&items, |i| i.allocation_id);
        assert_eq!(totals.len(), 2);
        assert_eq!(totals[&a], 17);
        assert_eq!(totals[&b], 5);
    }
}
