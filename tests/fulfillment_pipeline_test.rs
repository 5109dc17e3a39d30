mod common;

use assert_matches::assert_matches;
use common::TestApp;
use pharma_wms::{
    entities::allocation::{AllocationStatus, AllocationType},
    entities::packing_slip::PackingSlipStatus,
    entities::sales_order::SalesOrderStatus,
    entities::shipment::ShipmentStatus,
    entities::shipping_plan::ShippingPlanStatus,
    entities::stock_movement::MovementType,
    entities::task_status::TaskStatus,
    errors::ServiceError,
    notifications::NotificationType,
    services::fulfillment::{
        sales_orders::{CreateSalesOrderRequest, OrderConfirmation, OrderItemRequest},
        shipments::CreateShipmentRequest,
    },
};
use uuid::Uuid;

fn order_request(customer_id: Uuid, items: Vec<(Uuid, i32)>) -> CreateSalesOrderRequest {
    CreateSalesOrderRequest {
        customer_id,
        allocation_type: AllocationType::Regular,
        tender_contract_id: None,
        required_date: None,
        notes: None,
        items: items
            .into_iter()
            .map(|(product_id, quantity)| OrderItemRequest {
                product_id,
                quantity,
            })
            .collect(),
    }
}

async fn confirmed_order(app: &TestApp, product: Uuid, quantity: i32) -> OrderConfirmation {
    let customer = app.customer();
    let order = app
        .services
        .sales_orders
        .create_sales_order(&app.ctx, order_request(customer, vec![(product, quantity)]))
        .await
        .unwrap();
    app.services
        .sales_orders
        .confirm_order(&app.ctx, order.order.id)
        .await
        .unwrap()
}

#[tokio::test]
async fn order_flows_from_confirmation_to_delivery() {
    let app = TestApp::new().await;
    let product = app.product();
    let batch = app.released_batch(product, 100, 200, 10).await;
    let s = &app.services;

    let confirmation = confirmed_order(&app, product, 30).await;
    let order_id = confirmation.order.id;
    assert_eq!(confirmation.order.status, SalesOrderStatus::Confirmed);
    assert_eq!(confirmation.plan.status, ShippingPlanStatus::Planned);
    assert_eq!(confirmation.plan_items.len(), 1);

    let allocated = s
        .shipping_plans
        .confirm_plan(&app.ctx, confirmation.plan.id)
        .await
        .unwrap();
    assert!(allocated.is_fully_allocated());
    assert_eq!(allocated.details.plan.status, ShippingPlanStatus::Allocated);
    assert_eq!(allocated.details.allocations.len(), 1);

    // Picking
    let picking = s
        .picking
        .create_picking_list_from_plan(&app.ctx, confirmation.plan.id)
        .await
        .unwrap();
    assert_eq!(picking.items.len(), 1);
    let line = picking.items[0].clone();
    assert_eq!(line.quantity_to_pick, 30);
    assert_eq!(line.batch_id, batch.id);

    s.picking
        .assign_picking_list(&app.ctx, picking.list.id, "picker-1".into())
        .await
        .unwrap();
    let started = s.picking.start_picking(&app.ctx, picking.list.id).await.unwrap();
    assert_eq!(started.status, TaskStatus::InProgress);
    let reserved = s.allocations.get_allocation(line.allocation_id).await.unwrap();
    assert_eq!(reserved.reserved_quantity, 30);
    let order = s.sales_orders.get_order(order_id).await.unwrap();
    assert_eq!(order.order.status, SalesOrderStatus::Processing);

    s.picking.record_pick(&app.ctx, line.id, 30).await.unwrap();
    let picked = s.picking.complete_picking(&app.ctx, picking.list.id).await.unwrap();
    assert_eq!(picked.list.status, TaskStatus::Completed);
    let packing_id = picked.packing_order.id;

    // Packing
    s.packing
        .assign_packing_order(&app.ctx, packing_id, "packer-1".into())
        .await
        .unwrap();
    s.packing.start_packing(&app.ctx, packing_id).await.unwrap();
    let carton = s.packing.create_box(&app.ctx, packing_id).await.unwrap();
    s.packing
        .add_item_to_box(&app.ctx, carton.id, line.id, 30)
        .await
        .unwrap();
    s.packing.seal_box(&app.ctx, carton.id, Some(1200)).await.unwrap();
    let packed = s.packing.complete_packing(&app.ctx, packing_id).await.unwrap();
    assert_eq!(packed.order.status, TaskStatus::Completed);
    assert_eq!(packed.slip.status, PackingSlipStatus::Draft);
    assert_eq!(packed.shipped.values().sum::<i32>(), 30);

    let shipped = s.allocations.get_allocation(line.allocation_id).await.unwrap();
    assert_eq!(shipped.shipped_quantity, 30);
    assert_eq!(shipped.reserved_quantity, 0);
    assert_eq!(shipped.status, AllocationStatus::Shipped);
    assert_eq!(s.allocations.available_stock(batch.id).await.unwrap(), 70);

    let plan = s.shipping_plans.get_plan(confirmation.plan.id).await.unwrap();
    assert_eq!(plan.plan.status, ShippingPlanStatus::Completed);

    // Shipping
    let slip = s
        .packing
        .finalize_packing_slip(&app.ctx, packed.slip.id)
        .await
        .unwrap();
    assert_eq!(slip.status, PackingSlipStatus::Finalized);

    let shipment = s
        .shipments
        .create_shipment_from_packing_slip(
            &app.ctx,
            slip.id,
            CreateShipmentRequest {
                carrier_id: None,
                tracking_number: Some("1Z999".into()),
            },
        )
        .await
        .unwrap();
    assert_eq!(shipment.status, ShipmentStatus::Pending);

    let again = s
        .shipments
        .create_shipment_from_packing_slip(&app.ctx, slip.id, CreateShipmentRequest::default())
        .await
        .unwrap_err();
    assert_matches!(again, ServiceError::InvalidState { .. });

    s.shipments.dispatch_shipment(&app.ctx, shipment.id).await.unwrap();
    let order = s.sales_orders.get_order(order_id).await.unwrap();
    assert_eq!(order.order.status, SalesOrderStatus::Shipped);
    assert_eq!(order.items[0].shipped_quantity, 30);
    assert!(app.notifier.types().contains(&NotificationType::ShipmentDispatched));

    let delivered = s
        .shipments
        .confirm_delivery(&app.ctx, shipment.id, Some("Ward 4 pharmacy".into()))
        .await
        .unwrap();
    assert_eq!(delivered.status, ShipmentStatus::Delivered);
    let order = s.sales_orders.get_order(order_id).await.unwrap();
    assert_eq!(order.order.status, SalesOrderStatus::Delivered);

    let mut kinds: Vec<String> = s
        .ledger
        .movements_for_allocation(line.allocation_id)
        .await
        .unwrap()
        .iter()
        .map(|m| m.movement_type.to_string())
        .collect();
    kinds.sort();
    assert_eq!(kinds, vec!["ALLOCATE", "PICK", "RESERVE", "SHIP"]);
}

#[tokio::test]
async fn incomplete_pick_blocks_completion() {
    let app = TestApp::new().await;
    let product = app.product();
    app.released_batch(product, 50, 200, 10).await;
    let s = &app.services;

    let confirmation = confirmed_order(&app, product, 20).await;
    s.shipping_plans
        .confirm_plan(&app.ctx, confirmation.plan.id)
        .await
        .unwrap();
    let picking = s
        .picking
        .create_picking_list_from_plan(&app.ctx, confirmation.plan.id)
        .await
        .unwrap();
    let line = &picking.items[0];

    let before_start = s.picking.record_pick(&app.ctx, line.id, 5).await.unwrap_err();
    assert_matches!(before_start, ServiceError::InvalidState { .. });

    s.picking
        .assign_picking_list(&app.ctx, picking.list.id, "picker-2".into())
        .await
        .unwrap();
    s.picking.start_picking(&app.ctx, picking.list.id).await.unwrap();

    let over = s.picking.record_pick(&app.ctx, line.id, 21).await.unwrap_err();
    assert_matches!(over, ServiceError::PickingError(_));

    s.picking.record_pick(&app.ctx, line.id, 12).await.unwrap();
    let err = s
        .picking
        .complete_picking(&app.ctx, picking.list.id)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::PickingError(_));

    let cancelled = s
        .picking
        .cancel_picking_list(&app.ctx, picking.list.id)
        .await
        .unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    let allocation = s.allocations.get_allocation(line.allocation_id).await.unwrap();
    assert_eq!(allocation.reserved_quantity, 0);
    let plan = s.shipping_plans.get_plan(confirmation.plan.id).await.unwrap();
    assert_eq!(plan.plan.status, ShippingPlanStatus::Allocated);

    let mut picks: Vec<i32> = s
        .ledger
        .movements_for_reference("picking_list", &picking.list.id.to_string())
        .await
        .unwrap()
        .iter()
        .filter(|m| m.movement_type == MovementType::Pick)
        .map(|m| m.quantity)
        .collect();
    picks.sort();
    assert_eq!(picks, vec![-12, 12]);
    assert_eq!(
        s.ledger
            .net_quantity(line.allocation_id, MovementType::Pick)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn order_without_items_cannot_be_confirmed() {
    let app = TestApp::new().await;
    let customer = app.customer();
    let order = app
        .services
        .sales_orders
        .create_sales_order(&app.ctx, order_request(customer, Vec::new()))
        .await
        .unwrap();

    let err = app
        .services
        .sales_orders
        .confirm_order(&app.ctx, order.order.id)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::BusinessRule(_));
}

#[tokio::test]
async fn shortfall_keeps_plan_confirmed_and_alerts_warehouse() {
    let app = TestApp::new().await;
    let product = app.product();
    app.released_batch(product, 10, 200, 10).await;

    let confirmation = confirmed_order(&app, product, 25).await;
    let result = app
        .services
        .shipping_plans
        .confirm_plan(&app.ctx, confirmation.plan.id)
        .await
        .unwrap();

    assert!(!result.is_fully_allocated());
    assert_eq!(result.shortfalls.len(), 1);
    assert_eq!(result.shortfalls[0].requested, 25);
    assert_eq!(result.shortfalls[0].allocated, 10);
    assert_eq!(result.details.plan.status, ShippingPlanStatus::Confirmed);

    let sent = app.notifier.sent.lock().unwrap().clone();
    let (_, recipients) = sent
        .iter()
        .find(|(kind, _)| *kind == NotificationType::AllocationShortfall)
        .expect("shortfall notification");
    assert_eq!(recipients, &vec!["wh@test".to_string()]);

    let err = app
        .services
        .picking
        .create_picking_list_from_plan(&app.ctx, confirmation.plan.id)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidState { .. });
}

#[tokio::test]
async fn cancelling_order_releases_its_stock() {
    let app = TestApp::new().await;
    let product = app.product();
    let batch = app.released_batch(product, 100, 200, 10).await;
    let s = &app.services;

    let confirmation = confirmed_order(&app, product, 40).await;
    s.shipping_plans
        .confirm_plan(&app.ctx, confirmation.plan.id)
        .await
        .unwrap();
    assert_eq!(s.allocations.available_stock(batch.id).await.unwrap(), 60);

    let cancelled = s
        .sales_orders
        .cancel_order(&app.ctx, confirmation.order.id)
        .await
        .unwrap();
    assert_eq!(cancelled.status, SalesOrderStatus::Cancelled);
    assert_eq!(s.allocations.available_stock(batch.id).await.unwrap(), 100);

    let plan = s.shipping_plans.get_plan(confirmation.plan.id).await.unwrap();
    assert_eq!(plan.plan.status, ShippingPlanStatus::Cancelled);
}
