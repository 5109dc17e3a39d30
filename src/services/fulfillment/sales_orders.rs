use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use super::shipping_plans::{cancel_plan_in, PlanCancellation};
use super::{find_by_id, lock_by_id, open_plans_for_order, set_order_status, PipelineDeps};
use crate::audit::AuditEntry;
use crate::context::OperationContext;
use crate::db;
use crate::entities::allocation::AllocationType;
use crate::entities::generate_number;
use crate::entities::sales_order::{self, Entity as SalesOrderEntity, SalesOrderStatus};
use crate::entities::sales_order_item::{self, Entity as SalesOrderItemEntity};
use crate::entities::shipping_plan::{self, ShippingPlanStatus};
use crate::entities::shipping_plan_item;
use crate::entities::tender_contract::Entity as TenderContractEntity;
use crate::errors::ServiceError;
use crate::events::Event;
use crate::master_data::{require_customer, require_product};
use crate::services::today;

#[derive(Debug, Clone, Validate, Serialize, Deserialize)]
pub struct OrderItemRequest {
    pub product_id: Uuid,
    #[validate(range(min = 1))]
    pub quantity: i32,
}

#[derive(Debug, Clone, Validate, Serialize, Deserialize)]
pub struct CreateSalesOrderRequest {
    pub customer_id: Uuid,
    pub allocation_type: AllocationType,
    pub tender_contract_id: Option<Uuid>,
    pub required_date: Option<chrono::NaiveDate>,
    pub notes: Option<String>,
    #[validate]
    pub items: Vec<OrderItemRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDetails {
    pub order: sales_order::Model,
    pub items: Vec<sales_order_item::Model>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderConfirmation {
    pub order: sales_order::Model,
    pub plan: shipping_plan::Model,
    pub plan_items: Vec<shipping_plan_item::Model>,
}

/// Sales order lifecycle up to handing work to a shipping plan.
#[derive(Clone)]
pub struct SalesOrderService {
    deps: PipelineDeps,
}

impl SalesOrderService {
    pub fn new(deps: PipelineDeps) -> Self {
        Self { deps }
    }

    #[instrument(skip(self))]
    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderDetails, ServiceError> {
        let db = &*self.deps.db_pool;
        let order = find_by_id::<SalesOrderEntity, _>(db, "SalesOrder", order_id).await?;
        let items = SalesOrderItemEntity::find()
            .filter(sales_order_item::Column::SalesOrderId.eq(order_id))
            .order_by_asc(sales_order_item::Column::CreatedAt)
            .all(db)
            .await?;
        Ok(OrderDetails { order, items })
    }

    #[instrument(skip(self, ctx, request), fields(customer_id = %request.customer_id))]
    pub async fn create_sales_order(
        &self,
        ctx: &OperationContext,
        request: CreateSalesOrderRequest,
    ) -> Result<OrderDetails, ServiceError> {
        request.validate()?;
        require_customer(self.deps.master_data.as_ref(), request.customer_id).await?;
        for item in &request.items {
            require_product(self.deps.master_data.as_ref(), item.product_id).await?;
        }
        if request.tender_contract_id.is_some() && request.allocation_type != AllocationType::Tender {
            return Err(ServiceError::ValidationError(
                "only TENDER orders may reference a tender contract".to_string(),
            ));
        }

        let txn = db::begin(&self.deps.db_pool).await?;
        let result: Result<_, ServiceError> = async {
            if let Some(contract_id) = request.tender_contract_id {
                find_by_id::<TenderContractEntity, _>(&txn, "TenderContract", contract_id).await?;
            }

            let order = sales_order::ActiveModel {
                order_number: Set(generate_number("SO")),
                customer_id: Set(request.customer_id),
                status: Set(SalesOrderStatus::Pending),
                allocation_type: Set(request.allocation_type),
                tender_contract_id: Set(request.tender_contract_id),
                order_date: Set(today()),
                required_date: Set(request.required_date),
                notes: Set(request.notes.clone()),
                confirmed_at: Set(None),
                cancelled_at: Set(None),
                created_by: Set(ctx.actor.clone()),
                ..Default::default()
            }
            .insert(&txn)
            .await?;

            let mut items = Vec::with_capacity(request.items.len());
            for item in &request.items {
                items.push(insert_item(&txn, order.id, item).await?);
            }
            Ok(OrderDetails { order, items })
        }
        .await;
        let details = db::finish(txn, result).await?;

        self.deps
            .audit(
                AuditEntry::new(ctx, "SalesOrder", details.order.id, "create_sales_order")
                    .with_new(&details),
            )
            .await;
        info!(order_id = %details.order.id, items = details.items.len(), "Sales order created");
        Ok(details)
    }

    /// Adds a line to a PENDING order.
    #[instrument(skip(self, ctx, item))]
    pub async fn add_order_item(
        &self,
        ctx: &OperationContext,
        order_id: Uuid,
        item: OrderItemRequest,
    ) -> Result<sales_order_item::Model, ServiceError> {
        item.validate()?;
        require_product(self.deps.master_data.as_ref(), item.product_id).await?;

        let txn = db::begin(&self.deps.db_pool).await?;
        let result: Result<_, ServiceError> = async {
            let order = lock_by_id::<SalesOrderEntity, _>(&txn, "SalesOrder", order_id).await?;
            if order.status != SalesOrderStatus::Pending {
                return Err(ServiceError::invalid_state(
                    "SalesOrder",
                    order_id,
                    order.status,
                    "PENDING",
                ));
            }
            insert_item(&txn, order_id, &item).await
        }
        .await;
        let created = db::finish(txn, result).await?;

        self.deps
            .audit(
                AuditEntry::new(ctx, "SalesOrder", order_id, "add_order_item")
                    .with_new(&created),
            )
            .await;
        Ok(created)
    }

    /// Confirms a PENDING order and opens a PLANNED shipping plan for every
    /// unshipped quantity.
    #[instrument(skip(self, ctx))]
    pub async fn confirm_order(
        &self,
        ctx: &OperationContext,
        order_id: Uuid,
    ) -> Result<OrderConfirmation, ServiceError> {
        let txn = db::begin(&self.deps.db_pool).await?;
        let result: Result<_, ServiceError> = async {
            let order = lock_by_id::<SalesOrderEntity, _>(&txn, "SalesOrder", order_id).await?;
            if order.status != SalesOrderStatus::Pending {
                return Err(ServiceError::invalid_state(
                    "SalesOrder",
                    order_id,
                    order.status,
                    "PENDING",
                ));
            }
            let items = SalesOrderItemEntity::find()
                .filter(sales_order_item::Column::SalesOrderId.eq(order_id))
                .order_by_asc(sales_order_item::Column::CreatedAt)
                .all(&txn)
                .await?;
            let pending: Vec<_> = items.iter().filter(|i| i.pending_quantity() > 0).collect();
            if pending.is_empty() {
                return Err(ServiceError::BusinessRule(format!(
                    "sales order {} has no items to confirm",
                    order.order_number
                )));
            }

            let plan = shipping_plan::ActiveModel {
                plan_number: Set(generate_number("SP")),
                sales_order_id: Set(order_id),
                status: Set(ShippingPlanStatus::Planned),
                planned_ship_date: Set(order.required_date),
                confirmed_at: Set(None),
                created_by: Set(ctx.actor.clone()),
                ..Default::default()
            }
            .insert(&txn)
            .await?;

            let mut plan_items = Vec::with_capacity(pending.len());
            for item in pending {
                let plan_item = shipping_plan_item::ActiveModel {
                    shipping_plan_id: Set(plan.id),
                    sales_order_item_id: Set(item.id),
                    product_id: Set(item.product_id),
                    planned_quantity: Set(item.pending_quantity()),
                    allocated_quantity: Set(0),
                    ..Default::default()
                }
                .insert(&txn)
                .await?;
                plan_items.push(plan_item);
            }

            let event = set_order_status(&txn, order.clone(), SalesOrderStatus::Confirmed).await?;
            let confirmed = find_by_id::<SalesOrderEntity, _>(&txn, "SalesOrder", order_id).await?;
            Ok((
                order,
                OrderConfirmation {
                    order: confirmed,
                    plan,
                    plan_items,
                },
                event,
            ))
        }
        .await;
        let (before, confirmation, event) = db::finish(txn, result).await?;

        self.deps.publish_all(event.into_iter().collect()).await;
        self.deps
            .audit(super::transition_audit(
                ctx,
                "SalesOrder",
                order_id,
                "confirm_order",
                &before,
                &confirmation.order,
            ))
            .await;
        info!(
            order_id = %order_id,
            plan_id = %confirmation.plan.id,
            "Sales order confirmed"
        );
        Ok(confirmation)
    }

    /// Cancels a PENDING or CONFIRMED order with nothing shipped. Open plans
    /// are cancelled and their allocations released.
    #[instrument(skip(self, ctx))]
    pub async fn cancel_order(
        &self,
        ctx: &OperationContext,
        order_id: Uuid,
    ) -> Result<sales_order::Model, ServiceError> {
        let txn = db::begin(&self.deps.db_pool).await?;
        let result: Result<_, ServiceError> = async {
            let order = lock_by_id::<SalesOrderEntity, _>(&txn, "SalesOrder", order_id).await?;
            if !order.status.is_cancellable() {
                return Err(ServiceError::invalid_state(
                    "SalesOrder",
                    order_id,
                    order.status,
                    "PENDING or CONFIRMED",
                ));
            }
            let shipped = SalesOrderItemEntity::find()
                .filter(sales_order_item::Column::SalesOrderId.eq(order_id))
                .filter(sales_order_item::Column::ShippedQuantity.gt(0))
                .one(&txn)
                .await?;
            if shipped.is_some() {
                return Err(ServiceError::BusinessRule(format!(
                    "sales order {} has shipped items",
                    order.order_number
                )));
            }

            let mut events = Vec::new();
            let mut cancellations = Vec::new();
            for plan in open_plans_for_order(&txn, order_id).await? {
                let PlanCancellation {
                    plan: cancelled,
                    events: plan_events,
                    released,
                } = cancel_plan_in(&txn, ctx, plan).await?;
                events.extend(plan_events);
                cancellations.push((cancelled.id, released));
            }

            events.extend(set_order_status(&txn, order.clone(), SalesOrderStatus::Cancelled).await?);
            let cancelled = find_by_id::<SalesOrderEntity, _>(&txn, "SalesOrder", order_id).await?;
            Ok((order, cancelled, events, cancellations))
        }
        .await;
        let (before, after, events, cancellations) = db::finish(txn, result).await?;

        for (_, released) in &cancellations {
            for allocation_id in released {
                self.deps
                    .event_sender
                    .publish(Event::AllocationCancelled(*allocation_id))
                    .await;
            }
        }
        self.deps.publish_all(events).await;
        self.deps
            .audit(super::transition_audit(
                ctx,
                "SalesOrder",
                order_id,
                "cancel_order",
                &before,
                &after,
            ))
            .await;
        info!(order_id = %order_id, plans = cancellations.len(), "Sales order cancelled");
        Ok(after)
    }
}

async fn insert_item<C: sea_orm::ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    item: &OrderItemRequest,
) -> Result<sales_order_item::Model, ServiceError> {
    Ok(sales_order_item::ActiveModel {
        sales_order_id: Set(order_id),
        product_id: Set(item.product_id),
        quantity: Set(item.quantity),
        shipped_quantity: Set(0),
        ..Default::default()
    }
    .insert(conn)
    .await?)
}
