mod common;

use assert_matches::assert_matches;
use chrono::Days;
use common::{today, TestApp};
use pharma_wms::{
    entities::allocation::{self, AllocationType},
    entities::contract_reservation::ReservationStatus,
    entities::stock_movement::MovementType,
    entities::tender_contract::{self, ContractStatus},
    errors::ServiceError,
    services::allocation::CreateAllocationRequest,
    services::contracts::{CreateContractRequest, CreateReservationRequest},
    services::ledger::CONTRACT_CLAIM_REFERENCE,
};
use uuid::Uuid;

struct TenderSetup {
    contract: tender_contract::Model,
    batch_id: Uuid,
    source: allocation::Model,
}

async fn tender_setup(app: &TestApp, customer: Uuid) -> TenderSetup {
    let product = app.product();
    let batch = app.released_batch(product, 200, 200, 5).await;
    let contract = app
        .services
        .contracts
        .create_contract(
            &app.ctx,
            CreateContractRequest {
                contract_number: format!("TND-{}", &Uuid::new_v4().simple().to_string()[..6]),
                customer_id: customer,
                start_date: today() - Days::new(10),
                end_date: today() + Days::new(300),
                notes: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(contract.status, ContractStatus::Draft);

    let contract = app
        .services
        .contracts
        .activate_contract(&app.ctx, contract.id)
        .await
        .unwrap();

    let source = app
        .services
        .allocations
        .create_allocation(
            &app.ctx,
            CreateAllocationRequest {
                batch_id: batch.id,
                allocation_type: AllocationType::Tender,
                quantity: 100,
                customer_id: Some(customer),
                tender_contract_id: Some(contract.id),
                reference: None,
            },
        )
        .await
        .unwrap();

    TenderSetup {
        contract,
        batch_id: batch.id,
        source,
    }
}

fn reservation_request(setup: &TenderSetup, quantity: i32) -> CreateReservationRequest {
    CreateReservationRequest {
        contract_id: setup.contract.id,
        batch_id: setup.batch_id,
        allocation_id: setup.source.id,
        quantity,
    }
}

#[tokio::test]
async fn suspended_contract_cannot_reserve() {
    let app = TestApp::new().await;
    let customer = app.customer();
    let setup = tender_setup(&app, customer).await;
    app.services
        .contracts
        .suspend_contract(&app.ctx, setup.contract.id)
        .await
        .unwrap();

    let err = app
        .services
        .contracts
        .create_reservation(&app.ctx, reservation_request(&setup, 10))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidState { .. });
}

#[tokio::test]
async fn contract_needs_known_customer() {
    let app = TestApp::new().await;
    let err = app
        .services
        .contracts
        .create_contract(
            &app.ctx,
            CreateContractRequest {
                contract_number: "TND-404".into(),
                customer_id: Uuid::new_v4(),
                start_date: today(),
                end_date: today() + Days::new(30),
                notes: None,
            },
        )
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));
}

#[tokio::test]
async fn reservation_draw_and_release() {
    let app = TestApp::new().await;
    let hospital = app.customer();
    let clinic = app.customer();
    let setup = tender_setup(&app, hospital).await;
    let contracts = &app.services.contracts;

    let reservation = contracts
        .create_reservation(&app.ctx, reservation_request(&setup, 60))
        .await
        .unwrap();
    assert_eq!(reservation.reserved_quantity, 60);
    assert_eq!(reservation.remaining_quantity, 60);

    let duplicate = contracts
        .create_reservation(&app.ctx, reservation_request(&setup, 10))
        .await
        .unwrap_err();
    assert_matches!(duplicate, ServiceError::Conflict(_));

    let blocked = app
        .services
        .allocations
        .cancel_allocation(&app.ctx, setup.source.id)
        .await
        .unwrap_err();
    assert_matches!(blocked, ServiceError::ContractError(_));

    let draw = contracts
        .allocate_from_reservation(&app.ctx, reservation.id, 25, clinic)
        .await
        .unwrap();
    assert_eq!(draw.reservation.allocated_quantity, 25);
    assert_eq!(draw.reservation.remaining_quantity, 35);
    assert_eq!(draw.source_allocation.allocated_quantity, 75);
    assert_eq!(draw.allocation.allocated_quantity, 25);
    assert_eq!(draw.allocation.customer_id, Some(clinic));
    assert_eq!(draw.allocation.contract_reservation_id, Some(reservation.id));
    assert_eq!(draw.allocation.tender_contract_id, Some(setup.contract.id));

    let too_much = contracts
        .allocate_from_reservation(&app.ctx, reservation.id, 40, clinic)
        .await
        .unwrap_err();
    assert_matches!(too_much, ServiceError::ContractError(_));

    let released = contracts
        .release_reservation(&app.ctx, reservation.id, None)
        .await
        .unwrap();
    assert_eq!(released.remaining_quantity, 0);
    assert_eq!(released.reserved_quantity, 25);
    assert_ne!(released.status, ReservationStatus::Released);

    // Splitting never changes what the batch has promised in total.
    let available = app
        .services
        .allocations
        .available_stock(setup.batch_id)
        .await
        .unwrap();
    assert_eq!(available, 100);
}

#[tokio::test]
async fn contract_claims_stay_out_of_picking_reservations() {
    let app = TestApp::new().await;
    let hospital = app.customer();
    let setup = tender_setup(&app, hospital).await;
    let contracts = &app.services.contracts;
    let ledger = &app.services.ledger;

    let reservation = contracts
        .create_reservation(&app.ctx, reservation_request(&setup, 30))
        .await
        .unwrap();
    contracts
        .release_reservation(&app.ctx, reservation.id, Some(10))
        .await
        .unwrap();

    let mut claims: Vec<i32> = ledger
        .movements_for_reference(CONTRACT_CLAIM_REFERENCE, &reservation.id.to_string())
        .await
        .unwrap()
        .iter()
        .map(|m| m.quantity)
        .collect();
    claims.sort();
    assert_eq!(claims, vec![-10, 30]);

    let source = app
        .services
        .allocations
        .get_allocation(setup.source.id)
        .await
        .unwrap();
    assert_eq!(source.reserved_quantity, 0);
    assert_eq!(ledger.net_quantity(source.id, MovementType::Reserve).await.unwrap(), 0);
    assert_eq!(ledger.net_quantity(source.id, MovementType::Release).await.unwrap(), 0);
}

#[tokio::test]
async fn completing_contract_returns_unused_capacity() {
    let app = TestApp::new().await;
    let hospital = app.customer();
    let setup = tender_setup(&app, hospital).await;
    let contracts = &app.services.contracts;

    let reservation = contracts
        .create_reservation(&app.ctx, reservation_request(&setup, 40))
        .await
        .unwrap();
    let completed = contracts
        .complete_contract(&app.ctx, setup.contract.id)
        .await
        .unwrap();
    assert_eq!(completed.status, ContractStatus::Completed);

    let after = contracts.get_reservation(reservation.id).await.unwrap();
    assert_eq!(after.remaining_quantity, 0);
    assert_eq!(after.status, ReservationStatus::Released);

    let cancelled = app
        .services
        .allocations
        .cancel_allocation(&app.ctx, setup.source.id)
        .await
        .unwrap();
    assert_eq!(cancelled.allocated_quantity, 0);
}
