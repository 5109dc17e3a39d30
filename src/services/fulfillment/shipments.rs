use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use super::{find_by_id, lock_by_id, set_order_status, transition_audit, PipelineDeps};
use crate::audit::AuditEntry;
use crate::context::OperationContext;
use crate::db;
use crate::entities::generate_number;
use crate::entities::packing_slip::{self, Entity as PackingSlipEntity, PackingSlipStatus};
use crate::entities::sales_order::{Entity as SalesOrderEntity, SalesOrderStatus};
use crate::entities::sales_order_item::{self, Entity as SalesOrderItemEntity};
use crate::entities::shipment::{self, Entity as ShipmentEntity, ShipmentStatus};
use crate::errors::ServiceError;
use crate::events::Event;
use crate::notifications::{notify_quietly, NotificationType};

#[derive(Debug, Clone, Default, Validate, Serialize, Deserialize)]
pub struct CreateShipmentRequest {
    pub carrier_id: Option<Uuid>,
    #[validate(length(min = 1, max = 100))]
    pub tracking_number: Option<String>,
}

#[derive(Clone)]
pub struct ShipmentService {
    deps: PipelineDeps,
}

impl ShipmentService {
    pub fn new(deps: PipelineDeps) -> Self {
        Self { deps }
    }

    #[instrument(skip(self))]
    pub async fn get_shipment(&self, shipment_id: Uuid) -> Result<shipment::Model, ServiceError> {
        find_by_id::<ShipmentEntity, _>(&*self.deps.db_pool, "Shipment", shipment_id).await
    }

    #[instrument(skip(self))]
    pub async fn list_shipments_for_order(&self, order_id: Uuid) -> Result<Vec<shipment::Model>, ServiceError> {
        Ok(ShipmentEntity::find()
            .filter(shipment::Column::SalesOrderId.eq(order_id))
            .order_by_asc(shipment::Column::CreatedAt)
            .all(&*self.deps.db_pool)
            .await?)
    }

    /// Opens a PENDING shipment for a FINALIZED slip and marks the slip SHIPPED.
    #[instrument(skip(self, ctx, request))]
    pub async fn create_shipment_from_packing_slip(
        &self,
        ctx: &OperationContext,
        slip_id: Uuid,
        request: CreateShipmentRequest,
    ) -> Result<shipment::Model, ServiceError> {
        request.validate()?;

        let txn = db::begin(&self.deps.db_pool).await?;
        let result: Result<_, ServiceError> = async {
            let slip = lock_by_id::<PackingSlipEntity, _>(&txn, "PackingSlip", slip_id).await?;
            if slip.status != PackingSlipStatus::Finalized {
                return Err(ServiceError::invalid_state(
                    "PackingSlip",
                    slip_id,
                    slip.status,
                    "FINALIZED",
                ));
            }
            let existing = ShipmentEntity::find()
                .filter(shipment::Column::PackingSlipId.eq(slip_id))
                .filter(shipment::Column::Status.ne(ShipmentStatus::Cancelled))
                .one(&txn)
                .await?;
            if let Some(existing) = existing {
                return Err(ServiceError::Conflict(format!(
                    "packing slip {} already has shipment {}",
                    slip.slip_number, existing.shipment_number
                )));
            }

            let created = shipment::ActiveModel {
                shipment_number: Set(generate_number("SHP")),
                packing_slip_id: Set(slip_id),
                sales_order_id: Set(slip.sales_order_id),
                status: Set(ShipmentStatus::Pending),
                carrier_id: Set(request.carrier_id),
                tracking_number: Set(request.tracking_number.clone()),
                dispatched_at: Set(None),
                delivered_at: Set(None),
                received_by: Set(None),
                created_by: Set(ctx.actor.clone()),
                ..Default::default()
            }
            .insert(&txn)
            .await?;

            set_slip_status(&txn, slip, PackingSlipStatus::Shipped).await?;
            Ok(created)
        }
        .await;
        let created = db::finish(txn, result).await?;

        self.deps
            .event_sender
            .publish(Event::ShipmentCreated {
                shipment_id: created.id,
                order_id: created.sales_order_id,
            })
            .await;
        self.deps
            .audit(AuditEntry::new(ctx, "Shipment", created.id, "create_shipment").with_new(&created))
            .await;
        info!(shipment_id = %created.id, slip_id = %slip_id, "Shipment created");
        Ok(created)
    }

    /// Hands the shipment to the carrier. The order becomes SHIPPED once
    /// every line is fully shipped.
    #[instrument(skip(self, ctx))]
    pub async fn dispatch_shipment(
        &self,
        ctx: &OperationContext,
        shipment_id: Uuid,
    ) -> Result<shipment::Model, ServiceError> {
        let txn = db::begin(&self.deps.db_pool).await?;
        let result: Result<_, ServiceError> = async {
            let current = lock_by_id::<ShipmentEntity, _>(&txn, "Shipment", shipment_id).await?;
            if current.status != ShipmentStatus::Pending {
                return Err(ServiceError::invalid_state(
                    "Shipment",
                    shipment_id,
                    current.status,
                    "PENDING",
                ));
            }
            let before = current.clone();
            let mut active: shipment::ActiveModel = current.into();
            active.status = Set(ShipmentStatus::Dispatched);
            active.dispatched_at = Set(Some(Utc::now()));
            let updated = active.update(&txn).await?;

            let mut events = vec![Event::ShipmentDispatched {
                shipment_id,
                order_id: updated.sales_order_id,
            }];
            let order = lock_by_id::<SalesOrderEntity, _>(&txn, "SalesOrder", updated.sales_order_id).await?;
            if order.status == SalesOrderStatus::Processing && order_fully_shipped(&txn, order.id).await? {
                events.extend(set_order_status(&txn, order, SalesOrderStatus::Shipped).await?);
            }
            Ok((before, updated, events))
        }
        .await;
        let (before, updated, events) = db::finish(txn, result).await?;

        self.deps.publish_all(events).await;
        notify_quietly(
            &self.deps.notifier,
            NotificationType::ShipmentDispatched,
            &self.deps.recipients.warehouse,
            serde_json::json!({
                "shipment_id": updated.id,
                "shipment_number": updated.shipment_number,
                "order_id": updated.sales_order_id,
                "tracking_number": updated.tracking_number,
            }),
        )
        .await;
        self.deps
            .audit(transition_audit(ctx, "Shipment", shipment_id, "dispatch_shipment", &before, &updated))
            .await;
        info!(shipment_id = %shipment_id, "Shipment dispatched");
        Ok(updated)
    }

    /// Records delivery. A SHIPPED order is DELIVERED once all of its
    /// non-cancelled shipments are.
    #[instrument(skip(self, ctx))]
    pub async fn confirm_delivery(
        &self,
        ctx: &OperationContext,
        shipment_id: Uuid,
        received_by: Option<String>,
    ) -> Result<shipment::Model, ServiceError> {
        let txn = db::begin(&self.deps.db_pool).await?;
        let result: Result<_, ServiceError> = async {
            let current = lock_by_id::<ShipmentEntity, _>(&txn, "Shipment", shipment_id).await?;
            if current.status != ShipmentStatus::Dispatched {
                return Err(ServiceError::invalid_state(
                    "Shipment",
                    shipment_id,
                    current.status,
                    "DISPATCHED",
                ));
            }
            let before = current.clone();
            let mut active: shipment::ActiveModel = current.into();
            active.status = Set(ShipmentStatus::Delivered);
            active.delivered_at = Set(Some(Utc::now()));
            active.received_by = Set(received_by.clone());
            let updated = active.update(&txn).await?;

            let mut events = vec![Event::ShipmentDelivered {
                shipment_id,
                order_id: updated.sales_order_id,
            }];
            let order = lock_by_id::<SalesOrderEntity, _>(&txn, "SalesOrder", updated.sales_order_id).await?;
            if order.status == SalesOrderStatus::Shipped {
                let pending = ShipmentEntity::find()
                    .filter(shipment::Column::SalesOrderId.eq(order.id))
                    .filter(
                        shipment::Column::Status
                            .is_not_in([ShipmentStatus::Delivered, ShipmentStatus::Cancelled]),
                    )
                    .count(&txn)
                    .await?;
                if pending == 0 {
                    events.extend(set_order_status(&txn, order, SalesOrderStatus::Delivered).await?);
                }
            }
            Ok((before, updated, events))
        }
        .await;
        let (before, updated, events) = db::finish(txn, result).await?;

        self.deps.publish_all(events).await;
        self.deps
            .audit(transition_audit(ctx, "Shipment", shipment_id, "confirm_delivery", &before, &updated))
            .await;
        info!(shipment_id = %shipment_id, "Delivery confirmed");
        Ok(updated)
    }

    /// Cancels a PENDING or DISPATCHED shipment and puts its slip back to
    /// FINALIZED. A SHIPPED order falls back to PROCESSING.
    #[instrument(skip(self, ctx))]
    pub async fn cancel_shipment(
        &self,
        ctx: &OperationContext,
        shipment_id: Uuid,
    ) -> Result<shipment::Model, ServiceError> {
        let txn = db::begin(&self.deps.db_pool).await?;
        let result: Result<_, ServiceError> = async {
            let current = lock_by_id::<ShipmentEntity, _>(&txn, "Shipment", shipment_id).await?;
            if !matches!(current.status, ShipmentStatus::Pending | ShipmentStatus::Dispatched) {
                return Err(ServiceError::invalid_state(
                    "Shipment",
                    shipment_id,
                    current.status,
                    "PENDING or DISPATCHED",
                ));
            }
            let before = current.clone();
            let mut active: shipment::ActiveModel = current.into();
            active.status = Set(ShipmentStatus::Cancelled);
            let updated = active.update(&txn).await?;

            let slip = lock_by_id::<PackingSlipEntity, _>(&txn, "PackingSlip", updated.packing_slip_id).await?;
            set_slip_status(&txn, slip, PackingSlipStatus::Finalized).await?;

            let mut events = vec![Event::ShipmentCancelled {
                shipment_id,
                order_id: updated.sales_order_id,
            }];
            let order = lock_by_id::<SalesOrderEntity, _>(&txn, "SalesOrder", updated.sales_order_id).await?;
            if order.status == SalesOrderStatus::Shipped {
                events.extend(set_order_status(&txn, order, SalesOrderStatus::Processing).await?);
            }
            Ok((before, updated, events))
        }
        .await;
        let (before, updated, events) = db::finish(txn, result).await?;

        self.deps.publish_all(events).await;
        self.deps
            .audit(transition_audit(ctx, "Shipment", shipment_id, "cancel_shipment", &before, &updated))
            .await;
        warn!(shipment_id = %shipment_id, "Shipment cancelled");
        Ok(updated)
    }
}

async fn set_slip_status<C: ConnectionTrait>(
    conn: &C,
    slip: packing_slip::Model,
    next: PackingSlipStatus,
) -> Result<packing_slip::Model, ServiceError> {
    let mut active: packing_slip::ActiveModel = slip.into();
    active.status = Set(next);
    Ok(active.update(conn).await?)
}

async fn order_fully_shipped<C: ConnectionTrait>(conn: &C, order_id: Uuid) -> Result<bool, ServiceError> {
    let items = SalesOrderItemEntity::find()
        .filter(sales_order_item::Column::SalesOrderId.eq(order_id))
        .all(conn)
        .await?;
    Ok(!items.is_empty() && items.iter().all(|i| i.is_fully_shipped()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracking_number_must_not_be_blank() {
        let request = CreateShipmentRequest {
            carrier_id: None,
            tracking_number: Some(String::new()),
        };
        assert!(request.validate().is_err());
        assert!(CreateShipmentRequest::default().validate().is_ok());
    }
}
