mod common;

use common::{test_config, TestApp};
use pharma_wms::{
    entities::allocation::{self, AllocationType},
    errors::ServiceError,
    services::allocation::{AllocationStrategy, CreateAllocationRequest},
};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// File-backed SQLite with a real pool, so transactions overlap and the
/// store reports lock contention.
async fn pooled_sqlite(dir: &TempDir) -> TestApp {
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("wms.db").display());
    let mut cfg = test_config(&url);
    cfg.db_retry_attempts = 30;
    cfg.db_retry_initial_delay_ms = 2;
    cfg.db_retry_max_delay_ms = 50;
    TestApp::with_config(cfg, 8).await
}

/// Tallies racing outcomes: granted allocations and stock refusals. Anything
/// else fails the test.
async fn settle(
    tasks: Vec<JoinHandle<Result<Vec<allocation::Model>, ServiceError>>>,
) -> (Vec<allocation::Model>, usize) {
    let mut granted = Vec::new();
    let mut refused = 0;
    for task in tasks {
        match task.await.expect("allocation task panicked") {
            Ok(allocations) => granted.extend(allocations),
            Err(ServiceError::InsufficientStock { .. }) => refused += 1,
            Err(other) => panic!("unexpected failure under contention: {other}"),
        }
    }
    (granted, refused)
}

async fn claimed_on(app: &TestApp, batch_id: Uuid) -> i32 {
    app.services
        .allocations
        .list_allocations_for_batch(batch_id)
        .await
        .unwrap()
        .iter()
        .map(|a| a.allocated_quantity)
        .sum()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_allocations_never_oversell_a_batch() {
    let dir = TempDir::new().unwrap();
    let app = pooled_sqlite(&dir).await;
    let product = app.product();
    let batch = app.released_batch(product, 10, 200, 5).await;

    let mut tasks = Vec::new();
    for _ in 0..20 {
        let allocations = app.services.allocations.clone();
        let ctx = app.ctx.clone();
        let batch_id = batch.id;
        tasks.push(tokio::spawn(async move {
            allocations
                .create_allocation(
                    &ctx,
                    CreateAllocationRequest {
                        batch_id,
                        allocation_type: AllocationType::Regular,
                        quantity: 1,
                        customer_id: None,
                        tender_contract_id: None,
                        reference: None,
                    },
                )
                .await
                .map(|a| vec![a])
        }));
    }

    let (granted, refused) = settle(tasks).await;
    assert_eq!(granted.len(), 10, "every unit should be claimed exactly once");
    assert_eq!(refused, 10);
    assert_eq!(claimed_on(&app, batch.id).await, 10);
    assert_eq!(
        app.services.allocations.available_stock(batch.id).await.unwrap(),
        0
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_auto_allocation_spreads_over_batches_without_overselling() {
    let dir = TempDir::new().unwrap();
    let app = pooled_sqlite(&dir).await;
    let product = app.product();
    let early = app.released_batch(product, 6, 100, 5).await;
    let late = app.released_batch(product, 6, 200, 5).await;

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let allocations = app.services.allocations.clone();
        let ctx = app.ctx.clone();
        let mut request = app.auto_request(product, 2);
        request.strategy = Some(AllocationStrategy::Fefo);
        tasks.push(tokio::spawn(async move {
            allocations.auto_allocate(&ctx, request).await
        }));
    }

    let (granted, refused) = settle(tasks).await;
    let total: i32 = granted.iter().map(|a| a.allocated_quantity).sum();
    assert_eq!(total, 12);
    assert_eq!(refused, 10);
    assert_eq!(claimed_on(&app, early.id).await, 6);
    assert_eq!(claimed_on(&app, late.id).await, 6);
}

// Needs a reachable Postgres; row locks replace SQLite's retry path there.
// Run with: PHARMA_WMS_TEST_DATABASE_URL=postgres://... cargo test -- --ignored postgres
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn postgres_row_locks_serialise_allocators() {
    let Ok(url) = std::env::var("PHARMA_WMS_TEST_DATABASE_URL") else {
        return;
    };
    let app = TestApp::with_config(test_config(&url), 8).await;
    let product = app.product();
    let batch = app.released_batch(product, 10, 200, 5).await;

    let mut tasks = Vec::new();
    for _ in 0..20 {
        let allocations = app.services.allocations.clone();
        let ctx = app.ctx.clone();
        let request = app.auto_request(product, 1);
        tasks.push(tokio::spawn(async move {
            allocations.auto_allocate(&ctx, request).await
        }));
    }

    let (granted, refused) = settle(tasks).await;
    assert_eq!(granted.len(), 10);
    assert_eq!(refused, 10);
    assert_eq!(claimed_on(&app, batch.id).await, 10);
}
