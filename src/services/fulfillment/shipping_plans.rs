use chrono::Utc;
use metrics::counter;
use sea_orm::{ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{find_by_id, lock_by_id, set_plan_status, transition_audit, PipelineDeps};
use crate::context::OperationContext;
use crate::db;
use crate::entities::allocation::{self, AllocationStatus};
use crate::entities::sales_order::Entity as SalesOrderEntity;
use crate::entities::shipping_plan::{self, Entity as ShippingPlanEntity, ShippingPlanStatus};
use crate::entities::shipping_plan_allocation::{self, Entity as ShippingPlanAllocationEntity};
use crate::entities::shipping_plan_item::{self, Entity as ShippingPlanItemEntity};
use crate::errors::ServiceError;
use crate::events::Event;
use crate::notifications::{notify_quietly, NotificationType};
use crate::services::allocation::{cancel_allocation_in, AutoAllocateRequest};
use crate::services::ledger::StockReference;
use crate::services::today;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanDetails {
    pub plan: shipping_plan::Model,
    pub items: Vec<shipping_plan_item::Model>,
    pub allocations: Vec<shipping_plan_allocation::Model>,
}

/// A plan item that could not be covered in full.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Shortfall {
    pub plan_item_id: Uuid,
    pub product_id: Uuid,
    pub requested: i32,
    pub allocated: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanAllocationResult {
    pub details: PlanDetails,
    pub shortfalls: Vec<Shortfall>,
}

impl PlanAllocationResult {
    pub fn is_fully_allocated(&self) -> bool {
        self.details.plan.status == ShippingPlanStatus::Allocated
    }
}

pub(crate) struct PlanCancellation {
    pub plan: shipping_plan::Model,
    pub events: Vec<Event>,
    pub released: Vec<Uuid>,
}

#[derive(Clone)]
pub struct ShippingPlanService {
    deps: PipelineDeps,
}

impl ShippingPlanService {
    pub fn new(deps: PipelineDeps) -> Self {
        Self { deps }
    }

    #[instrument(skip(self))]
    pub async fn get_plan(&self, plan_id: Uuid) -> Result<PlanDetails, ServiceError> {
        let db = &*self.deps.db_pool;
        let plan = find_by_id::<ShippingPlanEntity, _>(db, "ShippingPlan", plan_id).await?;
        load_details(db, plan).await
    }

    #[instrument(skip(self))]
    pub async fn list_plans_for_order(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<shipping_plan::Model>, ServiceError> {
        Ok(ShippingPlanEntity::find()
            .filter(shipping_plan::Column::SalesOrderId.eq(order_id))
            .order_by_asc(shipping_plan::Column::CreatedAt)
            .all(&*self.deps.db_pool)
            .await?)
    }

    /// Confirms a DRAFT or PLANNED plan and allocates stock to its items.
    /// Items that cannot be covered are allocated as far as stock allows and
    /// reported as shortfalls; the plan then stays CONFIRMED.
    #[instrument(skip(self, ctx))]
    pub async fn confirm_plan(
        &self,
        ctx: &OperationContext,
        plan_id: Uuid,
    ) -> Result<PlanAllocationResult, ServiceError> {
        let txn = db::begin(&self.deps.db_pool).await?;
        let result: Result<_, ServiceError> = async {
            let plan = lock_by_id::<ShippingPlanEntity, _>(&txn, "ShippingPlan", plan_id).await?;
            if !matches!(plan.status, ShippingPlanStatus::Draft | ShippingPlanStatus::Planned) {
                return Err(ServiceError::invalid_state(
                    "ShippingPlan",
                    plan_id,
                    plan.status,
                    "DRAFT or PLANNED",
                ));
            }
            let item_count = ShippingPlanItemEntity::find()
                .filter(shipping_plan_item::Column::ShippingPlanId.eq(plan_id))
                .all(&txn)
                .await?
                .len();
            if item_count == 0 {
                return Err(ServiceError::BusinessRule(format!(
                    "shipping plan {} has no items",
                    plan.plan_number
                )));
            }

            let before = plan.clone();
            let (confirmed, event) = set_plan_status(&txn, plan, ShippingPlanStatus::Confirmed).await?;
            let mut outcome = allocate_plan_items_in(&self.deps, &txn, ctx, confirmed).await?;
            outcome.events.splice(0..0, event);
            Ok((before, outcome))
        }
        .await;
        let (before, outcome) = db::finish(txn, result).await?;

        self.after_allocation(ctx, "confirm_plan", &before, outcome).await
    }

    /// Retries allocation for a CONFIRMED plan, e.g. after replenishment.
    #[instrument(skip(self, ctx))]
    pub async fn allocate_plan_items(
        &self,
        ctx: &OperationContext,
        plan_id: Uuid,
    ) -> Result<PlanAllocationResult, ServiceError> {
        let txn = db::begin(&self.deps.db_pool).await?;
        let result: Result<_, ServiceError> = async {
            let plan = lock_by_id::<ShippingPlanEntity, _>(&txn, "ShippingPlan", plan_id).await?;
            if plan.status != ShippingPlanStatus::Confirmed {
                return Err(ServiceError::invalid_state(
                    "ShippingPlan",
                    plan_id,
                    plan.status,
                    "CONFIRMED",
                ));
            }
            let before = plan.clone();
            let outcome = allocate_plan_items_in(&self.deps, &txn, ctx, plan).await?;
            Ok((before, outcome))
        }
        .await;
        let (before, outcome) = db::finish(txn, result).await?;

        self.after_allocation(ctx, "allocate_plan_items", &before, outcome).await
    }

    /// Cancels a plan that has not reached the floor and releases its
    /// allocations.
    #[instrument(skip(self, ctx))]
    pub async fn cancel_plan(
        &self,
        ctx: &OperationContext,
        plan_id: Uuid,
    ) -> Result<shipping_plan::Model, ServiceError> {
        let txn = db::begin(&self.deps.db_pool).await?;
        let result: Result<_, ServiceError> = async {
            let plan = lock_by_id::<ShippingPlanEntity, _>(&txn, "ShippingPlan", plan_id).await?;
            let before = plan.clone();
            let cancellation = cancel_plan_in(&txn, ctx, plan).await?;
            Ok((before, cancellation))
        }
        .await;
        let (before, cancellation) = db::finish(txn, result).await?;

        for allocation_id in &cancellation.released {
            self.deps
                .event_sender
                .publish(Event::AllocationCancelled(*allocation_id))
                .await;
        }
        self.deps.publish_all(cancellation.events).await;
        self.deps
            .audit(transition_audit(
                ctx,
                "ShippingPlan",
                plan_id,
                "cancel_plan",
                &before,
                &cancellation.plan,
            ))
            .await;
        info!(plan_id = %plan_id, released = cancellation.released.len(), "Shipping plan cancelled");
        Ok(cancellation.plan)
    }

    async fn after_allocation(
        &self,
        ctx: &OperationContext,
        action: &str,
        before: &shipping_plan::Model,
        outcome: AllocationOutcome,
    ) -> Result<PlanAllocationResult, ServiceError> {
        let AllocationOutcome {
            details,
            shortfalls,
            created,
            events,
        } = outcome;
        let plan_id = details.plan.id;

        counter!("pharma_wms.allocations.created", created.len() as u64);
        for allocation in &created {
            self.deps
                .event_sender
                .publish(Event::AllocationCreated {
                    allocation_id: allocation.id,
                    batch_id: allocation.batch_id,
                    quantity: allocation.allocated_quantity,
                })
                .await;
        }
        self.deps.publish_all(events).await;

        for shortfall in &shortfalls {
            warn!(
                plan_id = %plan_id,
                product_id = %shortfall.product_id,
                requested = shortfall.requested,
                allocated = shortfall.allocated,
                "Shipping plan item only partially allocated"
            );
            self.deps
                .event_sender
                .publish(Event::PartialAllocationWarning {
                    reference_id: plan_id,
                    reference_type: "shipping_plan".to_string(),
                    requested_quantity: shortfall.requested,
                    allocated_quantity: shortfall.allocated,
                })
                .await;
        }
        if !shortfalls.is_empty() {
            notify_quietly(
                &self.deps.notifier,
                NotificationType::AllocationShortfall,
                &self.deps.recipients.warehouse,
                serde_json::json!({
                    "plan_id": plan_id,
                    "plan_number": details.plan.plan_number,
                    "shortfalls": shortfalls,
                }),
            )
            .await;
        }

        self.deps
            .audit(transition_audit(ctx, "ShippingPlan", plan_id, action, before, &details.plan))
            .await;
        info!(
            plan_id = %plan_id,
            status = %details.plan.status,
            allocations = created.len(),
            shortfalls = shortfalls.len(),
            "Shipping plan allocation run finished"
        );
        Ok(PlanAllocationResult { details, shortfalls })
    }
}

pub(crate) struct AllocationOutcome {
    pub details: PlanDetails,
    pub shortfalls: Vec<Shortfall>,
    pub created: Vec<allocation::Model>,
    pub events: Vec<Event>,
}

async fn load_details<C: ConnectionTrait>(
    conn: &C,
    plan: shipping_plan::Model,
) -> Result<PlanDetails, ServiceError> {
    let items = ShippingPlanItemEntity::find()
        .filter(shipping_plan_item::Column::ShippingPlanId.eq(plan.id))
        .order_by_asc(shipping_plan_item::Column::CreatedAt)
        .all(conn)
        .await?;
    let item_ids: Vec<Uuid> = items.iter().map(|i| i.id).collect();
    let allocations = if item_ids.is_empty() {
        Vec::new()
    } else {
        ShippingPlanAllocationEntity::find()
            .filter(shipping_plan_allocation::Column::ShippingPlanItemId.is_in(item_ids))
            .order_by_asc(shipping_plan_allocation::Column::CreatedAt)
            .all(conn)
            .await?
    };
    Ok(PlanDetails {
        plan,
        items,
        allocations,
    })
}

/// Allocates every outstanding plan item with the engine's default
/// strategy. An item that cannot be covered takes what is available.
/// The plan becomes ALLOCATED once no item is short.
pub(crate) async fn allocate_plan_items_in<C: ConnectionTrait>(
    deps: &PipelineDeps,
    conn: &C,
    ctx: &OperationContext,
    plan: shipping_plan::Model,
) -> Result<AllocationOutcome, ServiceError> {
    let order = find_by_id::<SalesOrderEntity, _>(conn, "SalesOrder", plan.sales_order_id).await?;
    let items = ShippingPlanItemEntity::find()
        .filter(shipping_plan_item::Column::ShippingPlanId.eq(plan.id))
        .order_by_asc(shipping_plan_item::Column::CreatedAt)
        .all(conn)
        .await?;
    let reference = StockReference::new("shipping_plan", plan.id);

    let mut created = Vec::new();
    let mut shortfalls = Vec::new();
    let mut fully_allocated = true;

    for item in items {
        let outstanding = item.outstanding();
        if outstanding == 0 {
            continue;
        }
        let request = |quantity: i32| AutoAllocateRequest {
            product_id: item.product_id,
            quantity,
            allocation_type: order.allocation_type,
            strategy: None,
            customer_id: Some(order.customer_id),
            tender_contract_id: order.tender_contract_id,
            reference: Some(reference.clone()),
        };

        let allocations = match deps
            .allocation
            .auto_allocate_in(conn, ctx, request(outstanding), today())
            .await
        {
            Ok(allocations) => allocations,
            Err(ServiceError::InsufficientStock { available, .. }) if available > 0 => {
                deps.allocation
                    .auto_allocate_in(conn, ctx, request(available), today())
                    .await?
            }
            Err(ServiceError::InsufficientStock { .. }) => Vec::new(),
            Err(e) => return Err(e),
        };

        let taken: i32 = allocations.iter().map(|a| a.allocated_quantity).sum();
        for allocation in &allocations {
            ShippingPlanAllocationEntity::insert(shipping_plan_allocation::ActiveModel {
                id: Set(Uuid::new_v4()),
                shipping_plan_item_id: Set(item.id),
                allocation_id: Set(allocation.id),
                quantity: Set(allocation.allocated_quantity),
                created_at: Set(Utc::now()),
            })
            .exec(conn)
            .await?;
        }

        if taken > 0 {
            let mut active: shipping_plan_item::ActiveModel = item.clone().into();
            active.allocated_quantity = Set(item.allocated_quantity + taken);
            active.update(conn).await?;
        }
        if taken < outstanding {
            fully_allocated = false;
            shortfalls.push(Shortfall {
                plan_item_id: item.id,
                product_id: item.product_id,
                requested: outstanding,
                allocated: taken,
            });
        }
        created.extend(allocations);
    }

    let mut events = Vec::new();
    let plan = if fully_allocated {
        let (plan, event) = set_plan_status(conn, plan, ShippingPlanStatus::Allocated).await?;
        events.extend(event);
        plan
    } else {
        plan
    };

    let details = load_details(conn, plan).await?;
    Ok(AllocationOutcome {
        details,
        shortfalls,
        created,
        events,
    })
}

/// Cancels a plan that has no picking in flight, voiding its allocations.
pub(crate) async fn cancel_plan_in<C: ConnectionTrait>(
    conn: &C,
    ctx: &OperationContext,
    plan: shipping_plan::Model,
) -> Result<PlanCancellation, ServiceError> {
    if !matches!(
        plan.status,
        ShippingPlanStatus::Draft
            | ShippingPlanStatus::Planned
            | ShippingPlanStatus::Confirmed
            | ShippingPlanStatus::Allocated
    ) {
        return Err(ServiceError::invalid_state(
            "ShippingPlan",
            plan.id,
            plan.status,
            "DRAFT, PLANNED, CONFIRMED or ALLOCATED",
        ));
    }

    let details = load_details(conn, plan).await?;
    let mut released = Vec::new();
    for link in &details.allocations {
        let current = allocation::Entity::find_by_id(link.allocation_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::not_found("Allocation", link.allocation_id))?;
        if current.status != AllocationStatus::Active {
            continue;
        }
        cancel_allocation_in(conn, ctx, current.id).await?;
        released.push(current.id);
    }

    let (plan, event) = set_plan_status(conn, details.plan, ShippingPlanStatus::Cancelled).await?;
    Ok(PlanCancellation {
        plan,
        events: event.into_iter().collect(),
        released,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shortfalls_serialize_for_notifications() {
        let shortfall = Shortfall {
            plan_item_id: Uuid::nil(),
            product_id: Uuid::nil(),
            requested: 80,
            allocated: 50,
        };
        let value = serde_json::to_value(&shortfall).unwrap();
        assert_eq!(value["requested"], 80);
        assert_eq!(value["allocated"], 50);
    }
}
