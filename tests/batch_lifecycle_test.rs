mod common;

use assert_matches::assert_matches;
use chrono::Days;
use common::{today, TestApp};
use pharma_wms::{
    entities::allocation::{AllocationStatus, AllocationType},
    entities::batch::{BatchStatus, QcStatus},
    entities::stock_movement::MovementType,
    errors::ServiceError,
    notifications::NotificationType,
    services::allocation::CreateAllocationRequest,
};

#[tokio::test]
async fn failed_qc_recalls_batch_and_alerts_quality() {
    let app = TestApp::new().await;
    let product = app.product();
    let batch = app.batch(product, 100, 200, 1).await;
    assert_eq!(batch.qc_status, QcStatus::Pending);

    let failed = app
        .services
        .batches
        .fail_qc(&app.ctx, batch.id, Some("assay out of range".into()))
        .await
        .unwrap();
    assert_eq!(failed.qc_status, QcStatus::Failed);
    assert_eq!(failed.status, BatchStatus::Recalled);

    let sent = app.notifier.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, NotificationType::QcFailed);
    assert_eq!(sent[0].1, vec!["qa@test".to_string()]);

    let again = app
        .services
        .batches
        .pass_qc(&app.ctx, batch.id, None)
        .await
        .unwrap_err();
    assert_matches!(again, ServiceError::InvalidState { .. });
}

#[tokio::test]
async fn recall_expires_live_allocations() {
    let app = TestApp::new().await;
    let product = app.product();
    let batch = app.released_batch(product, 100, 200, 1).await;
    let allocation = app.regular_allocation(batch.id, 40).await;

    let recalled = app
        .services
        .batches
        .recall_batch(&app.ctx, batch.id, "supplier notice".into())
        .await
        .unwrap();
    assert_eq!(recalled.status, BatchStatus::Recalled);

    let expired = app
        .services
        .allocations
        .get_allocation(allocation.id)
        .await
        .unwrap();
    assert_eq!(expired.status, AllocationStatus::Expired);
    assert_eq!(expired.allocated_quantity, 0);

    let sent = app.notifier.sent.lock().unwrap().clone();
    let (_, recipients) = sent
        .iter()
        .find(|(kind, _)| *kind == NotificationType::BatchRecalled)
        .expect("recall notification");
    assert_eq!(recipients, &vec!["qa@test".to_string(), "wh@test".to_string()]);

    let blank = app
        .services
        .batches
        .recall_batch(&app.ctx, batch.id, "  ".into())
        .await
        .unwrap_err();
    assert_matches!(blank, ServiceError::ValidationError(_));
}

#[tokio::test]
async fn adjustment_cannot_undercut_allocations() {
    let app = TestApp::new().await;
    let product = app.product();
    let batch = app.released_batch(product, 100, 200, 1).await;
    app.regular_allocation(batch.id, 60).await;
    let batches = &app.services.batches;

    let err = batches
        .adjust_quantity(&app.ctx, batch.id, 50, "cycle count".into())
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InsufficientStock { .. });

    let adjusted = batches
        .adjust_quantity(&app.ctx, batch.id, 80, "cycle count".into())
        .await
        .unwrap();
    assert_eq!(adjusted.received_quantity, 80);
    assert_eq!(
        app.services.allocations.available_stock(batch.id).await.unwrap(),
        20
    );

    let adjustments: Vec<i32> = app
        .services
        .ledger
        .movements_for_batch(batch.id)
        .await
        .unwrap()
        .iter()
        .filter(|m| m.movement_type == MovementType::Adjust)
        .map(|m| m.quantity)
        .collect();
    assert_eq!(adjustments, vec![-20]);
}

#[tokio::test]
async fn recount_revives_zeroed_batch() {
    let app = TestApp::new().await;
    let product = app.product();
    let batch = app.released_batch(product, 30, 200, 1).await;
    let batches = &app.services.batches;

    let emptied = batches
        .adjust_quantity(&app.ctx, batch.id, 0, "write-off".into())
        .await
        .unwrap();
    assert_eq!(emptied.status, BatchStatus::Consumed);

    let found = batches
        .adjust_quantity(&app.ctx, batch.id, 12, "found in returns cage".into())
        .await
        .unwrap();
    assert_eq!(found.status, BatchStatus::Active);
    assert_eq!(found.received_quantity, 12);

    let allocation = app.regular_allocation(batch.id, 12).await;
    assert_eq!(allocation.allocated_quantity, 12);
}

#[tokio::test]
async fn quarantine_blocks_allocation_until_released() {
    let app = TestApp::new().await;
    let product = app.product();
    let batch = app.released_batch(product, 100, 200, 1).await;
    let batches = &app.services.batches;

    let held = batches
        .quarantine(&app.ctx, batch.id, "temperature excursion".into())
        .await
        .unwrap();
    assert_eq!(held.qc_status, QcStatus::Quarantine);

    let request = CreateAllocationRequest {
        batch_id: batch.id,
        allocation_type: AllocationType::Regular,
        quantity: 5,
        customer_id: None,
        tender_contract_id: None,
        reference: None,
    };
    let blocked = app
        .services
        .allocations
        .create_allocation(&app.ctx, request.clone())
        .await
        .unwrap_err();
    assert_matches!(blocked, ServiceError::ValidationError(_));

    let restored = batches
        .release_from_quarantine(&app.ctx, batch.id, Some("sensor faulty".into()))
        .await
        .unwrap();
    assert_eq!(restored.qc_status, QcStatus::Passed);
    app.services
        .allocations
        .create_allocation(&app.ctx, request)
        .await
        .unwrap();
}

#[tokio::test]
async fn expiry_sweep_only_touches_due_batches() {
    let app = TestApp::new().await;
    let product = app.product();
    let soon = app.released_batch(product, 100, 5, 30).await;
    let later = app.released_batch(product, 100, 100, 30).await;
    let allocation = app.regular_allocation(soon.id, 30).await;

    let summary = app
        .services
        .batches
        .expire_batches(&app.ctx, today() + Days::new(10))
        .await
        .unwrap();
    assert_eq!(summary.expired_batches, vec![soon.id]);
    assert_eq!(summary.expired_allocations, 1);

    let swept = app.services.batches.get_batch(soon.id).await.unwrap();
    assert_eq!(swept.status, BatchStatus::Expired);
    let untouched = app.services.batches.get_batch(later.id).await.unwrap();
    assert_eq!(untouched.status, BatchStatus::Active);

    let expired = app
        .services
        .allocations
        .get_allocation(allocation.id)
        .await
        .unwrap();
    assert_eq!(expired.status, AllocationStatus::Expired);
    assert!(app.notifier.types().contains(&NotificationType::BatchesExpired));

    let rerun = app
        .services
        .batches
        .expire_batches(&app.ctx, today() + Days::new(10))
        .await
        .unwrap();
    assert!(rerun.expired_batches.is_empty());
}

#[tokio::test]
async fn expiry_warning_lists_batches_in_window() {
    let app = TestApp::new().await;
    let product = app.product();
    app.released_batch(product, 10, 10, 30).await;
    app.released_batch(product, 10, 300, 30).await;

    let warned = app
        .services
        .batches
        .notify_expiring_batches(Some(30))
        .await
        .unwrap();
    assert_eq!(warned, 1);
    assert_eq!(app.notifier.types(), vec![NotificationType::ExpiryWarning]);
}
