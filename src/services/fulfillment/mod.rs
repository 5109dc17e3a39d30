//! Fulfillment pipeline: sales order → shipping plan → picking list →
//! packing order → shipment.
//!
//! Every transition is one guarded status check plus its side effect, run in
//! a single transaction. Status-change events are collected inside the
//! transaction and published only after it commits.

pub mod packing;
pub mod picking;
pub mod sales_orders;
pub mod shipments;
pub mod shipping_plans;

use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PrimaryKeyTrait, QueryFilter,
    QuerySelect, Set,
};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::audit::{record_best_effort, AuditEntry, AuditSink};
use crate::config::NotificationRecipients;
use crate::context::OperationContext;
use crate::db::DbPool;
use crate::entities::sales_order::{self, Entity as SalesOrderEntity, SalesOrderStatus};
use crate::entities::shipping_plan::{self, ShippingPlanStatus};
use crate::entities::task_status::TaskStatus;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::master_data::MasterDataLookup;
use crate::notifications::Notifier;
use crate::services::allocation::AllocationService;

pub use packing::PackingService;
pub use picking::PickingService;
pub use sales_orders::SalesOrderService;
pub use shipments::ShipmentService;
pub use shipping_plans::ShippingPlanService;

/// Collaborators shared by every pipeline stage.
#[derive(Clone)]
pub struct PipelineDeps {
    pub db_pool: Arc<DbPool>,
    pub event_sender: Arc<EventSender>,
    pub audit: Arc<dyn AuditSink>,
    pub notifier: Arc<dyn Notifier>,
    pub master_data: Arc<dyn MasterDataLookup>,
    pub allocation: Arc<AllocationService>,
    pub recipients: NotificationRecipients,
}

impl PipelineDeps {
    /// Publishes events gathered inside a committed transaction.
    pub(crate) async fn publish_all(&self, events: Vec<Event>) {
        for event in events {
            self.event_sender.publish(event).await;
        }
    }

    pub(crate) async fn audit(&self, entry: AuditEntry) {
        record_best_effort(&self.audit, entry).await;
    }
}

/// Loads a row by id under an exclusive lock.
pub(crate) async fn lock_by_id<E, C>(
    conn: &C,
    entity: &'static str,
    id: Uuid,
) -> Result<E::Model, ServiceError>
where
    E: EntityTrait,
    E::PrimaryKey: PrimaryKeyTrait<ValueType = Uuid>,
    C: ConnectionTrait,
{
    E::find_by_id(id)
        .lock_exclusive()
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::not_found(entity, id))
}

pub(crate) async fn find_by_id<E, C>(
    conn: &C,
    entity: &'static str,
    id: Uuid,
) -> Result<E::Model, ServiceError>
where
    E: EntityTrait,
    E::PrimaryKey: PrimaryKeyTrait<ValueType = Uuid>,
    C: ConnectionTrait,
{
    E::find_by_id(id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::not_found(entity, id))
}

/// Guard for picking-list and packing-order transitions.
pub(crate) fn ensure_task_transition(
    entity: &'static str,
    id: Uuid,
    current: TaskStatus,
    next: TaskStatus,
) -> Result<(), ServiceError> {
    if !current.can_transition_to(next) {
        let required = match next {
            TaskStatus::Assigned => "PENDING or ASSIGNED",
            TaskStatus::InProgress => "ASSIGNED",
            TaskStatus::Completed => "IN_PROGRESS",
            TaskStatus::Cancelled => "PENDING, ASSIGNED or IN_PROGRESS",
            TaskStatus::Pending => "a new task",
        };
        return Err(ServiceError::invalid_state(entity, id, current, required));
    }
    Ok(())
}

/// Moves the sales order to `next` and returns the event to publish, or
/// nothing when the order already holds that status.
pub(crate) async fn set_order_status<C: ConnectionTrait>(
    conn: &C,
    order: sales_order::Model,
    next: SalesOrderStatus,
) -> Result<Option<Event>, ServiceError> {
    if order.status == next {
        return Ok(None);
    }
    let old = order.status;
    let order_id = order.id;
    let mut active: sales_order::ActiveModel = order.into();
    active.status = Set(next);
    match next {
        SalesOrderStatus::Confirmed => active.confirmed_at = Set(Some(chrono::Utc::now())),
        SalesOrderStatus::Cancelled => active.cancelled_at = Set(Some(chrono::Utc::now())),
        _ => {}
    }
    active.update(conn).await?;

    info!(order_id = %order_id, old_status = %old, new_status = %next, "Sales order status changed");
    Ok(Some(Event::OrderStatusChanged {
        order_id,
        old_status: old.to_string(),
        new_status: next.to_string(),
    }))
}

/// Order moves to PROCESSING once warehouse work on it has started.
pub(crate) async fn mark_order_processing<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<Option<Event>, ServiceError> {
    let order = lock_by_id::<SalesOrderEntity, _>(conn, "SalesOrder", order_id).await?;
    if order.status != SalesOrderStatus::Confirmed {
        return Ok(None);
    }
    set_order_status(conn, order, SalesOrderStatus::Processing).await
}

pub(crate) async fn set_plan_status<C: ConnectionTrait>(
    conn: &C,
    plan: shipping_plan::Model,
    next: ShippingPlanStatus,
) -> Result<(shipping_plan::Model, Option<Event>), ServiceError> {
    if plan.status == next {
        return Ok((plan, None));
    }
    let old = plan.status;
    let mut active: shipping_plan::ActiveModel = plan.into();
    active.status = Set(next);
    if next == ShippingPlanStatus::Confirmed {
        active.confirmed_at = Set(Some(chrono::Utc::now()));
    }
    let updated = active.update(conn).await?;
    let event = Event::ShippingPlanStatusChanged {
        plan_id: updated.id,
        old_status: old.to_string(),
        new_status: next.to_string(),
    };
    Ok((updated, Some(event)))
}

/// Open shipping plans of an order, locked.
pub(crate) async fn open_plans_for_order<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<Vec<shipping_plan::Model>, ServiceError> {
    Ok(shipping_plan::Entity::find()
        .filter(shipping_plan::Column::SalesOrderId.eq(order_id))
        .filter(
            shipping_plan::Column::Status
                .is_not_in([ShippingPlanStatus::Completed, ShippingPlanStatus::Cancelled]),
        )
        .lock_exclusive()
        .all(conn)
        .await?)
}

/// Audit entry for a status transition.
pub(crate) fn transition_audit<T: serde::Serialize>(
    ctx: &OperationContext,
    entity: &str,
    id: Uuid,
    action: &str,
    before: &T,
    after: &T,
) -> AuditEntry {
    AuditEntry::new(ctx, entity, id, action)
        .with_old(before)
        .with_new(after)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn task_guard_names_required_state() {
        let id = Uuid::new_v4();
        assert!(ensure_task_transition("PickingList", id, TaskStatus::Assigned, TaskStatus::InProgress).is_ok());

        let err = ensure_task_transition("PickingList", id, TaskStatus::Pending, TaskStatus::InProgress)
            .unwrap_err();
        assert_matches!(
            &err,
            ServiceError::InvalidState { entity: "PickingList", current, required, .. }
                if current == "PENDING" && required == "ASSIGNED"
        );
    }

    #[test]
    fn completed_tasks_cannot_be_cancelled() {
        assert!(ensure_task_transition(
            "PackingOrder",
            Uuid::nil(),
            TaskStatus::Completed,
            TaskStatus::Cancelled
        )
        .is_err());
    }
}
