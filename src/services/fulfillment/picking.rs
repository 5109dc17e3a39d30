use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::{info, instrument};
use uuid::Uuid;

use super::{
    ensure_task_transition, find_by_id, lock_by_id, mark_order_processing, set_plan_status,
    transition_audit, PipelineDeps,
};
use crate::audit::AuditEntry;
use crate::context::OperationContext;
use crate::db;
use crate::entities::allocation::{self, AllocationStatus};
use crate::entities::batch::Entity as BatchEntity;
use crate::entities::generate_number;
use crate::entities::packing_order::{self, PackingStatus};
use crate::entities::picking_list::{self, Entity as PickingListEntity, PickingStatus};
use crate::entities::picking_list_item::{self, Entity as PickingListItemEntity};
use crate::entities::shipping_plan::{Entity as ShippingPlanEntity, ShippingPlanStatus};
use crate::entities::shipping_plan_allocation::{self, Entity as ShippingPlanAllocationEntity};
use crate::entities::shipping_plan_item::{self, Entity as ShippingPlanItemEntity};
use crate::entities::stock_movement::MovementType;
use crate::errors::ServiceError;
use crate::events::Event;
use crate::services::allocation::{release_reservation_in, reserve_for_picking_in};
use crate::services::ledger::{record_movement, NewMovement, StockReference};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PickingListDetails {
    pub list: picking_list::Model,
    pub items: Vec<picking_list_item::Model>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PickingCompletion {
    pub list: picking_list::Model,
    pub packing_order: packing_order::Model,
}

/// One line of a picking list before it is numbered.
#[derive(Debug, Clone)]
struct PickLine {
    shipping_plan_item_id: Uuid,
    allocation_id: Uuid,
    batch_id: Uuid,
    product_id: Uuid,
    location: Option<String>,
    expiry_date: chrono::NaiveDate,
    quantity: i32,
}

/// Walk order: by location (unlocated lines last), then earliest expiry.
fn walk_order(a: &PickLine, b: &PickLine) -> Ordering {
    match (&a.location, &b.location) {
        (Some(x), Some(y)) => x.cmp(y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then(a.expiry_date.cmp(&b.expiry_date))
}

#[derive(Clone)]
pub struct PickingService {
    deps: PipelineDeps,
}

impl PickingService {
    pub fn new(deps: PipelineDeps) -> Self {
        Self { deps }
    }

    #[instrument(skip(self))]
    pub async fn get_picking_list(&self, list_id: Uuid) -> Result<PickingListDetails, ServiceError> {
        let db = &*self.deps.db_pool;
        let list = find_by_id::<PickingListEntity, _>(db, "PickingList", list_id).await?;
        let items = list_items(db, list_id).await?;
        Ok(PickingListDetails { list, items })
    }

    /// Builds the pick walk for an ALLOCATED plan, one line per allocation,
    /// and moves the plan to PROCESSING.
    ///
    /// The walk is location-first: lines are grouped by rack location and
    /// FEFO-ordered within each location.
    #[instrument(skip(self, ctx))]
    pub async fn create_picking_list_from_plan(
        &self,
        ctx: &OperationContext,
        plan_id: Uuid,
    ) -> Result<PickingListDetails, ServiceError> {
        let txn = db::begin(&self.deps.db_pool).await?;
        let result: Result<_, ServiceError> = async {
            let plan = lock_by_id::<ShippingPlanEntity, _>(&txn, "ShippingPlan", plan_id).await?;
            if plan.status != ShippingPlanStatus::Allocated {
                return Err(ServiceError::invalid_state(
                    "ShippingPlan",
                    plan_id,
                    plan.status,
                    "ALLOCATED",
                ));
            }
            let open = PickingListEntity::find()
                .filter(picking_list::Column::ShippingPlanId.eq(plan_id))
                .filter(picking_list::Column::Status.is_in([
                    PickingStatus::Pending,
                    PickingStatus::Assigned,
                    PickingStatus::InProgress,
                ]))
                .one(&txn)
                .await?;
            if let Some(open) = open {
                return Err(ServiceError::Conflict(format!(
                    "shipping plan {} already has open picking list {}",
                    plan.plan_number, open.picking_number
                )));
            }

            let mut lines = self.pick_lines(&txn, plan_id).await?;
            if lines.is_empty() {
                return Err(ServiceError::PickingError(format!(
                    "shipping plan {} has nothing left to pick",
                    plan.plan_number
                )));
            }
            lines.sort_by(walk_order);

            let list = picking_list::ActiveModel {
                picking_number: Set(generate_number("PICK")),
                shipping_plan_id: Set(plan_id),
                sales_order_id: Set(plan.sales_order_id),
                status: Set(PickingStatus::Pending),
                assigned_to: Set(None),
                started_at: Set(None),
                completed_at: Set(None),
                created_by: Set(ctx.actor.clone()),
                ..Default::default()
            }
            .insert(&txn)
            .await?;

            let mut items = Vec::with_capacity(lines.len());
            for (index, line) in lines.into_iter().enumerate() {
                let item = picking_list_item::ActiveModel {
                    picking_list_id: Set(list.id),
                    shipping_plan_item_id: Set(line.shipping_plan_item_id),
                    allocation_id: Set(line.allocation_id),
                    batch_id: Set(line.batch_id),
                    product_id: Set(line.product_id),
                    location: Set(line.location),
                    sequence: Set(index as i32 + 1),
                    quantity_to_pick: Set(line.quantity),
                    quantity_picked: Set(0),
                    picked_at: Set(None),
                    ..Default::default()
                }
                .insert(&txn)
                .await?;
                items.push(item);
            }

            let (_, event) = set_plan_status(&txn, plan, ShippingPlanStatus::Processing).await?;
            Ok((PickingListDetails { list, items }, event))
        }
        .await;
        let (details, event) = db::finish(txn, result).await?;

        self.deps.publish_all(event.into_iter().collect()).await;
        self.deps
            .audit(
                AuditEntry::new(ctx, "PickingList", details.list.id, "create_picking_list")
                    .with_new(&details),
            )
            .await;
        info!(
            picking_list_id = %details.list.id,
            plan_id = %plan_id,
            lines = details.items.len(),
            "Picking list created"
        );
        Ok(details)
    }

    #[instrument(skip(self, ctx))]
    pub async fn assign_picking_list(
        &self,
        ctx: &OperationContext,
        list_id: Uuid,
        assignee: String,
    ) -> Result<picking_list::Model, ServiceError> {
        if assignee.trim().is_empty() {
            return Err(ServiceError::ValidationError("assignee is required".to_string()));
        }
        let txn = db::begin(&self.deps.db_pool).await?;
        let result: Result<_, ServiceError> = async {
            let list = lock_by_id::<PickingListEntity, _>(&txn, "PickingList", list_id).await?;
            ensure_task_transition("PickingList", list_id, list.status, PickingStatus::Assigned)?;
            let before = list.clone();
            let mut active: picking_list::ActiveModel = list.into();
            active.status = Set(PickingStatus::Assigned);
            active.assigned_to = Set(Some(assignee.clone()));
            let updated = active.update(&txn).await?;
            Ok((before, updated))
        }
        .await;
        let (before, updated) = db::finish(txn, result).await?;

        self.after_transition(ctx, "assign_picking_list", &before, &updated, Vec::new())
            .await;
        Ok(updated)
    }

    /// Reserves every line's allocation for the picker and marks the order
    /// PROCESSING.
    #[instrument(skip(self, ctx))]
    pub async fn start_picking(
        &self,
        ctx: &OperationContext,
        list_id: Uuid,
    ) -> Result<picking_list::Model, ServiceError> {
        let reference = StockReference::new("picking_list", list_id);
        let txn = db::begin(&self.deps.db_pool).await?;
        let result: Result<_, ServiceError> = async {
            let list = lock_by_id::<PickingListEntity, _>(&txn, "PickingList", list_id).await?;
            ensure_task_transition("PickingList", list_id, list.status, PickingStatus::InProgress)?;

            let mut events = Vec::new();
            for item in list_items(&txn, list_id).await? {
                reserve_for_picking_in(&txn, ctx, item.allocation_id, item.quantity_to_pick, reference.clone())
                    .await?;
                events.push(Event::AllocationReserved {
                    allocation_id: item.allocation_id,
                    quantity: item.quantity_to_pick,
                });
            }

            let before = list.clone();
            let mut active: picking_list::ActiveModel = list.into();
            active.status = Set(PickingStatus::InProgress);
            active.started_at = Set(Some(Utc::now()));
            let updated = active.update(&txn).await?;

            events.extend(mark_order_processing(&txn, updated.sales_order_id).await?);
            Ok((before, updated, events))
        }
        .await;
        let (before, updated, events) = db::finish(txn, result).await?;

        self.after_transition(ctx, "start_picking", &before, &updated, events)
            .await;
        Ok(updated)
    }

    /// Sets the picked quantity of a line. The value is absolute; the ledger
    /// records the signed change.
    #[instrument(skip(self, ctx))]
    pub async fn record_pick(
        &self,
        ctx: &OperationContext,
        item_id: Uuid,
        quantity_picked: i32,
    ) -> Result<picking_list_item::Model, ServiceError> {
        let txn = db::begin(&self.deps.db_pool).await?;
        let result: Result<_, ServiceError> = async {
            let item = lock_by_id::<PickingListItemEntity, _>(&txn, "PickingListItem", item_id).await?;
            let list = find_by_id::<PickingListEntity, _>(&txn, "PickingList", item.picking_list_id).await?;
            if list.status != PickingStatus::InProgress {
                return Err(ServiceError::invalid_state(
                    "PickingList",
                    list.id,
                    list.status,
                    "IN_PROGRESS",
                ));
            }
            if !(0..=item.quantity_to_pick).contains(&quantity_picked) {
                return Err(ServiceError::PickingError(format!(
                    "picked quantity {} must be between 0 and {} for line {}",
                    quantity_picked, item.quantity_to_pick, item.sequence
                )));
            }

            let delta = quantity_picked - item.quantity_picked;
            if delta == 0 {
                return Ok(item);
            }
            let mut active: picking_list_item::ActiveModel = item.clone().into();
            active.quantity_picked = Set(quantity_picked);
            active.picked_at = Set(Some(Utc::now()));
            let updated = active.update(&txn).await?;

            record_movement(
                &txn,
                ctx,
                NewMovement {
                    allocation_id: Some(item.allocation_id),
                    batch_id: item.batch_id,
                    product_id: item.product_id,
                    movement_type: MovementType::Pick,
                    quantity: delta,
                    reference: StockReference::new("picking_list", list.id),
                    notes: None,
                },
            )
            .await?;
            Ok(updated)
        }
        .await;
        let updated = db::finish(txn, result).await?;

        info!(
            item_id = %item_id,
            quantity_picked = updated.quantity_picked,
            quantity_to_pick = updated.quantity_to_pick,
            "Pick recorded"
        );
        Ok(updated)
    }

    /// Closes a fully picked list and opens its packing order.
    #[instrument(skip(self, ctx))]
    pub async fn complete_picking(
        &self,
        ctx: &OperationContext,
        list_id: Uuid,
    ) -> Result<PickingCompletion, ServiceError> {
        let txn = db::begin(&self.deps.db_pool).await?;
        let result: Result<_, ServiceError> = async {
            let list = lock_by_id::<PickingListEntity, _>(&txn, "PickingList", list_id).await?;
            ensure_task_transition("PickingList", list_id, list.status, PickingStatus::Completed)?;

            let short: Vec<i32> = list_items(&txn, list_id)
                .await?
                .iter()
                .filter(|i| !i.is_complete())
                .map(|i| i.sequence)
                .collect();
            if !short.is_empty() {
                return Err(ServiceError::PickingError(format!(
                    "picking list {} has incomplete lines {:?}",
                    list.picking_number, short
                )));
            }

            let before = list.clone();
            let mut active: picking_list::ActiveModel = list.into();
            active.status = Set(PickingStatus::Completed);
            active.completed_at = Set(Some(Utc::now()));
            let updated = active.update(&txn).await?;

            let packing_order = packing_order::ActiveModel {
                packing_number: Set(generate_number("PACK")),
                picking_list_id: Set(updated.id),
                shipping_plan_id: Set(updated.shipping_plan_id),
                sales_order_id: Set(updated.sales_order_id),
                status: Set(PackingStatus::Pending),
                assigned_to: Set(None),
                started_at: Set(None),
                completed_at: Set(None),
                created_by: Set(ctx.actor.clone()),
                ..Default::default()
            }
            .insert(&txn)
            .await?;
            Ok((before, updated, packing_order))
        }
        .await;
        let (before, list, packing_order) = db::finish(txn, result).await?;

        self.after_transition(ctx, "complete_picking", &before, &list, Vec::new())
            .await;
        info!(packing_order_id = %packing_order.id, "Packing order opened");
        Ok(PickingCompletion {
            list,
            packing_order,
        })
    }

    /// Abandons a list. Reservations taken at start are released, recorded
    /// picks are reversed in the ledger and the plan goes back to ALLOCATED
    /// so it can be picked again.
    #[instrument(skip(self, ctx))]
    pub async fn cancel_picking_list(
        &self,
        ctx: &OperationContext,
        list_id: Uuid,
    ) -> Result<picking_list::Model, ServiceError> {
        let txn = db::begin(&self.deps.db_pool).await?;
        let result: Result<_, ServiceError> = async {
            let list = lock_by_id::<PickingListEntity, _>(&txn, "PickingList", list_id).await?;
            ensure_task_transition("PickingList", list_id, list.status, PickingStatus::Cancelled)?;

            let mut events = Vec::new();
            if list.status == PickingStatus::InProgress {
                let reference = StockReference::new("picking_list", list_id);
                for item in list_items(&txn, list_id).await? {
                    release_reservation_in(&txn, ctx, item.allocation_id, item.quantity_to_pick, reference.clone())
                        .await?;
                    if item.quantity_picked > 0 {
                        record_movement(
                            &txn,
                            ctx,
                            NewMovement {
                                allocation_id: Some(item.allocation_id),
                                batch_id: item.batch_id,
                                product_id: item.product_id,
                                movement_type: MovementType::Pick,
                                quantity: -item.quantity_picked,
                                reference: reference.clone(),
                                notes: Some("picking list cancelled".to_string()),
                            },
                        )
                        .await?;
                    }
                    events.push(Event::AllocationReleased {
                        allocation_id: item.allocation_id,
                        quantity: item.quantity_to_pick,
                    });
                }
            }

            let before = list.clone();
            let mut active: picking_list::ActiveModel = list.into();
            active.status = Set(PickingStatus::Cancelled);
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

        self.after_transition(ctx, "cancel_picking_list", &before, &updated, events)
            .await;
        Ok(updated)
    }

    async fn pick_lines<C: ConnectionTrait>(
        &self,
        conn: &C,
        plan_id: Uuid,
    ) -> Result<Vec<PickLine>, ServiceError> {
        let plan_items = ShippingPlanItemEntity::find()
            .filter(shipping_plan_item::Column::ShippingPlanId.eq(plan_id))
            .all(conn)
            .await?;

        let mut lines = Vec::new();
        for plan_item in plan_items {
            let links = ShippingPlanAllocationEntity::find()
                .filter(shipping_plan_allocation::Column::ShippingPlanItemId.eq(plan_item.id))
                .order_by_asc(shipping_plan_allocation::Column::CreatedAt)
                .all(conn)
                .await?;
            for link in links {
                let allocation = find_by_id::<allocation::Entity, _>(conn, "Allocation", link.allocation_id).await?;
                if allocation.status != AllocationStatus::Active {
                    continue;
                }
                let quantity = link.quantity.min(allocation.quantities().reservable());
                if quantity <= 0 {
                    continue;
                }
                let batch = find_by_id::<BatchEntity, _>(conn, "Batch", allocation.batch_id).await?;
                let location = match batch.rack_location {
                    Some(location) => Some(location),
                    None => self.deps.master_data.get_rack_location(allocation.product_id).await?,
                };
                lines.push(PickLine {
                    shipping_plan_item_id: plan_item.id,
                    allocation_id: allocation.id,
                    batch_id: batch.id,
                    product_id: allocation.product_id,
                    location,
                    expiry_date: batch.expiry_date,
                    quantity,
                });
            }
        }
        Ok(lines)
    }

    async fn after_transition(
        &self,
        ctx: &OperationContext,
        action: &str,
        before: &picking_list::Model,
        after: &picking_list::Model,
        mut events: Vec<Event>,
    ) {
        if before.status != after.status {
            events.insert(
                0,
                Event::PickingListStatusChanged {
                    picking_list_id: after.id,
                    old_status: before.status.to_string(),
                    new_status: after.status.to_string(),
                },
            );
        }
        self.deps.publish_all(events).await;
        self.deps
            .audit(transition_audit(ctx, "PickingList", after.id, action, before, after))
            .await;
        info!(
            picking_list_id = %after.id,
            old_status = %before.status,
            new_status = %after.status,
            "Picking list updated"
        );
    }
}

pub(crate) async fn list_items<C: ConnectionTrait>(
    conn: &C,
    list_id: Uuid,
) -> Result<Vec<picking_list_item::Model>, ServiceError> {
    Ok(PickingListItemEntity::find()
        .filter(picking_list_item::Column::PickingListId.eq(list_id))
        .order_by_asc(picking_list_item::Column::Sequence)
        .all(conn)
        .await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn line(location: Option<&str>, expiry: (i32, u32, u32)) -> PickLine {
        PickLine {
            shipping_plan_item_id: Uuid::nil(),
            allocation_id: Uuid::new_v4(),
            batch_id: Uuid::nil(),
            product_id: Uuid::nil(),
            location: location.map(str::to_string),
            expiry_date: NaiveDate::from_ymd_opt(expiry.0, expiry.1, expiry.2).unwrap(),
            quantity: 1,
        }
    }

    #[test]
    fn walk_visits_locations_in_order_then_earliest_expiry() {
        let mut lines = vec![
            line(None, (2025, 1, 1)),
            line(Some("B-02"), (2025, 6, 1)),
            line(Some("A-01"), (2025, 9, 1)),
            line(Some("B-02"), (2025, 3, 1)),
        ];
        lines.sort_by(walk_order);

        let order: Vec<(Option<&str>, u32)> = lines
            .iter()
            .map(|l| (l.location.as_deref(), chrono::Datelike::month(&l.expiry_date)))
            .collect();
        assert_eq!(
            order,
            vec![
                (Some("A-01"), 9),
                (Some("B-02"), 3),
                (Some("B-02"), 6),
                (None, 1),
            ]
        );
    }
}
