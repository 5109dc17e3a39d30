mod common;

use assert_matches::assert_matches;
use common::TestApp;
use pharma_wms::{
    entities::allocation::{AllocationStatus, AllocationType},
    entities::stock_movement::MovementType,
    errors::ServiceError,
    services::allocation::{AllocationStrategy, CreateAllocationRequest},
    services::ledger::StockReference,
};

#[tokio::test]
async fn fefo_takes_earliest_expiry_first() {
    let app = TestApp::new().await;
    let product = app.product();
    let early = app.released_batch(product, 100, 100, 30).await;
    let late = app.released_batch(product, 50, 160, 60).await;

    let mut request = app.auto_request(product, 120);
    request.strategy = Some(AllocationStrategy::Fefo);
    let allocations = app
        .services
        .allocations
        .auto_allocate(&app.ctx, request)
        .await
        .unwrap();

    assert_eq!(allocations.len(), 2);
    assert_eq!(allocations[0].batch_id, early.id);
    assert_eq!(allocations[0].allocated_quantity, 100);
    assert_eq!(allocations[1].batch_id, late.id);
    assert_eq!(allocations[1].allocated_quantity, 20);

    let allocs = &app.services.allocations;
    assert_eq!(allocs.available_stock(early.id).await.unwrap(), 0);
    assert_eq!(allocs.available_stock(late.id).await.unwrap(), 30);
    assert_eq!(allocs.product_available_stock(product).await.unwrap(), 30);
}

#[tokio::test]
async fn fifo_and_lifo_follow_receipt_order() {
    let app = TestApp::new().await;
    let product = app.product();
    let older = app.released_batch(product, 40, 200, 90).await;
    let newer = app.released_batch(product, 40, 100, 5).await;

    let mut request = app.auto_request(product, 10);
    request.strategy = Some(AllocationStrategy::Fifo);
    let fifo = app.services.allocations.auto_allocate(&app.ctx, request).await.unwrap();
    assert_eq!(fifo[0].batch_id, older.id);

    let mut request = app.auto_request(product, 10);
    request.strategy = Some(AllocationStrategy::Lifo);
    let lifo = app.services.allocations.auto_allocate(&app.ctx, request).await.unwrap();
    assert_eq!(lifo[0].batch_id, newer.id);
}

#[tokio::test]
async fn shortfall_writes_nothing() {
    let app = TestApp::new().await;
    let product = app.product();
    let first = app.released_batch(product, 100, 100, 10).await;
    let second = app.released_batch(product, 50, 160, 10).await;

    let err = app
        .services
        .allocations
        .auto_allocate(&app.ctx, app.auto_request(product, 200))
        .await
        .unwrap_err();
    assert_matches!(
        err,
        ServiceError::InsufficientStock {
            requested: 200,
            available: 150,
            ..
        }
    );

    for batch in [&first, &second] {
        let rows = app
            .services
            .allocations
            .list_allocations_for_batch(batch.id)
            .await
            .unwrap();
        assert!(rows.is_empty());
        let movements = app.services.ledger.movements_for_batch(batch.id).await.unwrap();
        assert!(movements.is_empty());
    }
}

#[tokio::test]
async fn unreleased_batch_cannot_be_allocated() {
    let app = TestApp::new().await;
    let product = app.product();
    let pending = app.batch(product, 100, 100, 1).await;

    let err = app
        .services
        .allocations
        .create_allocation(
            &app.ctx,
            CreateAllocationRequest {
                batch_id: pending.id,
                allocation_type: AllocationType::Regular,
                quantity: 10,
                customer_id: None,
                tender_contract_id: None,
                reference: None,
            },
        )
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));
}

#[tokio::test]
async fn tender_allocation_requires_customer() {
    let app = TestApp::new().await;
    let product = app.product();
    let batch = app.released_batch(product, 100, 100, 1).await;

    let err = app
        .services
        .allocations
        .create_allocation(
            &app.ctx,
            CreateAllocationRequest {
                batch_id: batch.id,
                allocation_type: AllocationType::Tender,
                quantity: 10,
                customer_id: None,
                tender_contract_id: None,
                reference: None,
            },
        )
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));
}

#[tokio::test]
async fn allocate_reserve_ship_leaves_three_movements() {
    let app = TestApp::new().await;
    let product = app.product();
    let batch = app.released_batch(product, 200, 120, 3).await;
    let allocation = app.regular_allocation(batch.id, 50).await;
    let reference = StockReference::new("shipment", "SH-1");

    let allocs = &app.services.allocations;
    let reserved = allocs
        .reserve_for_picking(&app.ctx, allocation.id, 50, reference.clone())
        .await
        .unwrap();
    assert_eq!(reserved.reserved_quantity, 50);

    let shipped = allocs
        .ship_allocation(&app.ctx, allocation.id, 50, reference)
        .await
        .unwrap();
    assert_eq!(shipped.allocated_quantity, 50);
    assert_eq!(shipped.reserved_quantity, 0);
    assert_eq!(shipped.shipped_quantity, 50);
    assert_eq!(shipped.status, AllocationStatus::Shipped);

    let mut kinds: Vec<String> = app
        .services
        .ledger
        .movements_for_allocation(allocation.id)
        .await
        .unwrap()
        .iter()
        .map(|m| m.movement_type.to_string())
        .collect();
    kinds.sort();
    assert_eq!(kinds, vec!["ALLOCATE", "RESERVE", "SHIP"]);
    assert_eq!(allocs.available_stock(batch.id).await.unwrap(), 150);
}

#[tokio::test]
async fn release_returns_reserved_units() {
    let app = TestApp::new().await;
    let product = app.product();
    let batch = app.released_batch(product, 100, 120, 3).await;
    let allocation = app.regular_allocation(batch.id, 40).await;
    let reference = StockReference::new("picking_list", "PL-1");

    let allocs = &app.services.allocations;
    allocs
        .reserve_for_picking(&app.ctx, allocation.id, 30, reference.clone())
        .await
        .unwrap();
    let released = allocs
        .release_reservation(&app.ctx, allocation.id, 30, reference)
        .await
        .unwrap();
    assert_eq!(released.reserved_quantity, 0);
    assert_eq!(released.status, AllocationStatus::Active);

    let over = allocs
        .reserve_for_picking(&app.ctx, allocation.id, 41, StockReference::new("picking_list", "PL-2"))
        .await
        .unwrap_err();
    assert_matches!(over, ServiceError::AllocationError(_));

    let net = app
        .services
        .ledger
        .net_quantity(allocation.id, MovementType::Reserve)
        .await
        .unwrap();
    assert_eq!(net, 30);
}

#[tokio::test]
async fn oversized_quantity_is_rejected_without_writes() {
    let app = TestApp::new().await;
    let product = app.product();
    let batch = app.released_batch(product, 100, 120, 3).await;
    let allocation = app.regular_allocation(batch.id, 50).await;

    let allocs = &app.services.allocations;
    allocs
        .reserve_for_picking(&app.ctx, allocation.id, 1, StockReference::new("picking_list", "PL-7"))
        .await
        .unwrap();
    let err = allocs
        .reserve_for_picking(
            &app.ctx,
            allocation.id,
            i32::MAX,
            StockReference::new("picking_list", "PL-8"),
        )
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    allocs
        .ship_allocation(&app.ctx, allocation.id, 1, StockReference::new("shipment", "SH-7"))
        .await
        .unwrap();
    let err = allocs
        .ship_allocation(
            &app.ctx,
            allocation.id,
            i32::MAX,
            StockReference::new("shipment", "SH-8"),
        )
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    let current = allocs.get_allocation(allocation.id).await.unwrap();
    assert_eq!(current.reserved_quantity, 0);
    assert_eq!(current.shipped_quantity, 1);
    assert_eq!(current.status, AllocationStatus::Active);
}

#[tokio::test]
async fn repeated_ship_reference_is_rejected() {
    let app = TestApp::new().await;
    let product = app.product();
    let batch = app.released_batch(product, 100, 120, 3).await;
    let allocation = app.regular_allocation(batch.id, 60).await;
    let reference = StockReference::new("shipment", "SH-9");

    let allocs = &app.services.allocations;
    allocs
        .ship_allocation(&app.ctx, allocation.id, 20, reference.clone())
        .await
        .unwrap();
    let err = allocs
        .ship_allocation(&app.ctx, allocation.id, 20, reference)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Conflict(_));

    let current = allocs.get_allocation(allocation.id).await.unwrap();
    assert_eq!(current.shipped_quantity, 20);
    assert_eq!(current.status, AllocationStatus::Active);
}

#[tokio::test]
async fn transfer_moves_tender_quantity_to_new_customer() {
    let app = TestApp::new().await;
    let product = app.product();
    let hospital = app.customer();
    let clinic = app.customer();
    let batch = app.released_batch(product, 100, 120, 3).await;

    let allocs = &app.services.allocations;
    let tender = allocs
        .create_allocation(
            &app.ctx,
            CreateAllocationRequest {
                batch_id: batch.id,
                allocation_type: AllocationType::Tender,
                quantity: 50,
                customer_id: Some(hospital),
                tender_contract_id: None,
                reference: None,
            },
        )
        .await
        .unwrap();

    let (source, target) = allocs
        .transfer_allocation(&app.ctx, tender.id, clinic, Some(20))
        .await
        .unwrap();
    assert_eq!(source.allocated_quantity, 30);
    assert_eq!(target.allocated_quantity, 20);
    assert_eq!(target.customer_id, Some(clinic));
    assert_eq!(target.batch_id, batch.id);
    assert_eq!(allocs.available_stock(batch.id).await.unwrap(), 50);

    let regular = app.regular_allocation(batch.id, 10).await;
    let err = allocs
        .transfer_allocation(&app.ctx, regular.id, clinic, None)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::AllocationError(_));
}

#[tokio::test]
async fn cancel_frees_quantity_once() {
    let app = TestApp::new().await;
    let product = app.product();
    let batch = app.released_batch(product, 100, 120, 3).await;
    let allocation = app.regular_allocation(batch.id, 70).await;

    let allocs = &app.services.allocations;
    assert_eq!(allocs.available_stock(batch.id).await.unwrap(), 30);

    let cancelled = allocs.cancel_allocation(&app.ctx, allocation.id).await.unwrap();
    assert_eq!(cancelled.status, AllocationStatus::Consumed);
    assert_eq!(allocs.available_stock(batch.id).await.unwrap(), 100);

    let again = allocs.cancel_allocation(&app.ctx, allocation.id).await.unwrap_err();
    assert_matches!(again, ServiceError::InvalidState { .. });
    assert!(app.audit.actions().iter().any(|a| a == "cancel_allocation"));
}
