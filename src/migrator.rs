use anyhow::Result;
use sea_orm::{ConnectOptions, Database};
use sea_orm_migration::prelude::*;
use std::time::Duration;
use tracing::{error, info};

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240301_000001_create_batches_table::Migration),
            Box::new(m20240301_000002_create_allocations_table::Migration),
            Box::new(m20240301_000003_create_stock_movements_table::Migration),
            Box::new(m20240301_000004_create_contract_tables::Migration),
            Box::new(m20240301_000005_create_sales_order_tables::Migration),
            Box::new(m20240301_000006_create_shipping_plan_tables::Migration),
            Box::new(m20240301_000007_create_picking_tables::Migration),
            Box::new(m20240301_000008_create_packing_tables::Migration),
            Box::new(m20240301_000009_create_shipment_tables::Migration),
        ]
    }
}

mod m20240301_000001_create_batches_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000001_create_batches_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Batches::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Batches::Id).uuid().primary_key().not_null())
                        .col(
                            ColumnDef::new(Batches::BatchNumber)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Batches::ProductId).uuid().not_null())
                        .col(ColumnDef::new(Batches::ReceivedQuantity).integer().not_null())
                        .col(ColumnDef::new(Batches::ManufacturingDate).date().not_null())
                        .col(ColumnDef::new(Batches::ExpiryDate).date().not_null())
                        .col(ColumnDef::new(Batches::ReceivedDate).date().not_null())
                        .col(ColumnDef::new(Batches::QcStatus).string_len(32).not_null())
                        .col(
                            ColumnDef::new(Batches::PreQuarantineQcStatus)
                                .string_len(32)
                                .null(),
                        )
                        .col(ColumnDef::new(Batches::Status).string_len(32).not_null())
                        .col(ColumnDef::new(Batches::RackLocation).string().null())
                        .col(ColumnDef::new(Batches::QcNotes).text().null())
                        .col(ColumnDef::new(Batches::QcBy).string().null())
                        .col(ColumnDef::new(Batches::QcAt).timestamp_with_time_zone().null())
                        .col(ColumnDef::new(Batches::CreatedBy).string().not_null())
                        .col(
                            ColumnDef::new(Batches::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Batches::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .check(Expr::cust("received_quantity >= 0"))
                        .check(Expr::cust("expiry_date > manufacturing_date"))
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_batches_product_expiry")
                        .table(Batches::Table)
                        .col(Batches::ProductId)
                        .col(Batches::ExpiryDate)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Batches::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum Batches {
        Table,
        Id,
        BatchNumber,
        ProductId,
        ReceivedQuantity,
        ManufacturingDate,
        ExpiryDate,
        ReceivedDate,
        QcStatus,
        PreQuarantineQcStatus,
        Status,
        RackLocation,
        QcNotes,
        QcBy,
        QcAt,
        CreatedBy,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240301_000002_create_allocations_table {
    use super::m20240301_000001_create_batches_table::Batches;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000002_create_allocations_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Allocations::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Allocations::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Allocations::AllocationNumber)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Allocations::BatchId).uuid().not_null())
                        .col(ColumnDef::new(Allocations::ProductId).uuid().not_null())
                        .col(
                            ColumnDef::new(Allocations::AllocationType)
                                .string_len(32)
                                .not_null(),
                        )
                        .col(ColumnDef::new(Allocations::CustomerId).uuid().null())
                        .col(ColumnDef::new(Allocations::TenderContractId).uuid().null())
                        .col(
                            ColumnDef::new(Allocations::ContractReservationId)
                                .uuid()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Allocations::AllocatedQuantity)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Allocations::ShippedQuantity)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Allocations::ReservedQuantity)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Allocations::Status).string_len(16).not_null())
                        .col(ColumnDef::new(Allocations::ReferenceType).string().null())
                        .col(ColumnDef::new(Allocations::ReferenceId).string().null())
                        .col(ColumnDef::new(Allocations::CreatedBy).string().not_null())
                        .col(
                            ColumnDef::new(Allocations::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Allocations::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .check(Expr::cust("allocated_quantity >= 0"))
                        .check(Expr::cust("shipped_quantity >= 0"))
                        .check(Expr::cust("reserved_quantity >= 0"))
                        .check(Expr::cust(
                            "shipped_quantity + reserved_quantity <= allocated_quantity",
                        ))
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_allocations_batch_id")
                                .from(Allocations::Table, Allocations::BatchId)
                                .to(Batches::Table, Batches::Id)
                                .on_delete(ForeignKeyAction::Restrict),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_allocations_batch_status")
                        .table(Allocations::Table)
                        .col(Allocations::BatchId)
                        .col(Allocations::Status)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_allocations_product_id")
                        .table(Allocations::Table)
                        .col(Allocations::ProductId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Allocations::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum Allocations {
        Table,
        Id,
        AllocationNumber,
        BatchId,
        ProductId,
        AllocationType,
        CustomerId,
        TenderContractId,
        ContractReservationId,
        AllocatedQuantity,
        ShippedQuantity,
        ReservedQuantity,
        Status,
        ReferenceType,
        ReferenceId,
        CreatedBy,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240301_000003_create_stock_movements_table {
    use super::m20240301_000001_create_batches_table::Batches;
    use super::m20240301_000002_create_allocations_table::Allocations;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000003_create_stock_movements_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(StockMovements::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(StockMovements::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(StockMovements::AllocationId).uuid().null())
                        .col(ColumnDef::new(StockMovements::BatchId).uuid().not_null())
                        .col(ColumnDef::new(StockMovements::ProductId).uuid().not_null())
                        .col(
                            ColumnDef::new(StockMovements::MovementType)
                                .string_len(16)
                                .not_null(),
                        )
                        .col(ColumnDef::new(StockMovements::Quantity).integer().not_null())
                        .col(
                            ColumnDef::new(StockMovements::ReferenceType)
                                .string()
                                .not_null(),
                        )
                        .col(ColumnDef::new(StockMovements::ReferenceId).string().not_null())
                        .col(ColumnDef::new(StockMovements::Notes).text().null())
                        .col(ColumnDef::new(StockMovements::CreatedBy).string().not_null())
                        .col(
                            ColumnDef::new(StockMovements::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_stock_movements_allocation_id")
                                .from(StockMovements::Table, StockMovements::AllocationId)
                                .to(Allocations::Table, Allocations::Id)
                                .on_delete(ForeignKeyAction::Restrict),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_stock_movements_batch_id")
                                .from(StockMovements::Table, StockMovements::BatchId)
                                .to(Batches::Table, Batches::Id)
                                .on_delete(ForeignKeyAction::Restrict),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_stock_movements_allocation_type")
                        .table(StockMovements::Table)
                        .col(StockMovements::AllocationId)
                        .col(StockMovements::MovementType)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_stock_movements_reference")
                        .table(StockMovements::Table)
                        .col(StockMovements::ReferenceType)
                        .col(StockMovements::ReferenceId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(StockMovements::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum StockMovements {
        Table,
        Id,
        AllocationId,
        BatchId,
        ProductId,
        MovementType,
        Quantity,
        ReferenceType,
        ReferenceId,
        Notes,
        CreatedBy,
        CreatedAt,
    }
}

mod m20240301_000004_create_contract_tables {
    use super::m20240301_000002_create_allocations_table::Allocations;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000004_create_contract_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(TenderContracts::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(TenderContracts::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(TenderContracts::ContractNumber)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(TenderContracts::CustomerId).uuid().not_null())
                        .col(
                            ColumnDef::new(TenderContracts::Status)
                                .string_len(16)
                                .not_null(),
                        )
                        .col(ColumnDef::new(TenderContracts::StartDate).date().not_null())
                        .col(ColumnDef::new(TenderContracts::EndDate).date().not_null())
                        .col(ColumnDef::new(TenderContracts::Notes).text().null())
                        .col(ColumnDef::new(TenderContracts::CreatedBy).string().not_null())
                        .col(
                            ColumnDef::new(TenderContracts::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(TenderContracts::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .check(Expr::cust("end_date >= start_date"))
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(ContractReservations::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(ContractReservations::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ContractReservations::TenderContractId)
                                .uuid()
                                .not_null(),
                        )
                        .col(ColumnDef::new(ContractReservations::BatchId).uuid().not_null())
                        .col(
                            ColumnDef::new(ContractReservations::AllocationId)
                                .uuid()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ContractReservations::ReservedQuantity)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ContractReservations::AllocatedQuantity)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(ContractReservations::RemainingQuantity)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ContractReservations::ShippedQuantity)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(ContractReservations::Status)
                                .string_len(16)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ContractReservations::CreatedBy)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ContractReservations::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ContractReservations::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .check(Expr::cust("allocated_quantity >= 0"))
                        .check(Expr::cust("allocated_quantity <= reserved_quantity"))
                        .check(Expr::cust(
                            "remaining_quantity = reserved_quantity - allocated_quantity",
                        ))
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_contract_reservations_contract_id")
                                .from(
                                    ContractReservations::Table,
                                    ContractReservations::TenderContractId,
                                )
                                .to(TenderContracts::Table, TenderContracts::Id)
                                .on_delete(ForeignKeyAction::Restrict),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_contract_reservations_allocation_id")
                                .from(
                                    ContractReservations::Table,
                                    ContractReservations::AllocationId,
                                )
                                .to(Allocations::Table, Allocations::Id)
                                .on_delete(ForeignKeyAction::Restrict),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("uq_contract_reservations_contract_allocation")
                        .table(ContractReservations::Table)
                        .col(ContractReservations::TenderContractId)
                        .col(ContractReservations::AllocationId)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(ContractReservations::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(TenderContracts::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum TenderContracts {
        Table,
        Id,
        ContractNumber,
        CustomerId,
        Status,
        StartDate,
        EndDate,
        Notes,
        CreatedBy,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum ContractReservations {
        Table,
        Id,
        TenderContractId,
        BatchId,
        AllocationId,
        ReservedQuantity,
        AllocatedQuantity,
        RemainingQuantity,
        ShippedQuantity,
        Status,
        CreatedBy,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240301_000005_create_sales_order_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000005_create_sales_order_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(SalesOrders::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(SalesOrders::Id).uuid().primary_key().not_null())
                        .col(
                            ColumnDef::new(SalesOrders::OrderNumber)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(SalesOrders::CustomerId).uuid().not_null())
                        .col(ColumnDef::new(SalesOrders::Status).string_len(16).not_null())
                        .col(
                            ColumnDef::new(SalesOrders::AllocationType)
                                .string_len(32)
                                .not_null(),
                        )
                        .col(ColumnDef::new(SalesOrders::TenderContractId).uuid().null())
                        .col(ColumnDef::new(SalesOrders::OrderDate).date().not_null())
                        .col(ColumnDef::new(SalesOrders::RequiredDate).date().null())
                        .col(ColumnDef::new(SalesOrders::Notes).text().null())
                        .col(
                            ColumnDef::new(SalesOrders::ConfirmedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(SalesOrders::CancelledAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(ColumnDef::new(SalesOrders::CreatedBy).string().not_null())
                        .col(
                            ColumnDef::new(SalesOrders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SalesOrders::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(SalesOrderItems::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(SalesOrderItems::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(SalesOrderItems::SalesOrderId).uuid().not_null())
                        .col(ColumnDef::new(SalesOrderItems::ProductId).uuid().not_null())
                        .col(ColumnDef::new(SalesOrderItems::Quantity).integer().not_null())
                        .col(
                            ColumnDef::new(SalesOrderItems::ShippedQuantity)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(SalesOrderItems::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(SalesOrderItems::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .check(Expr::cust("quantity > 0"))
                        .check(Expr::cust("shipped_quantity >= 0"))
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_sales_order_items_order_id")
                                .from(SalesOrderItems::Table, SalesOrderItems::SalesOrderId)
                                .to(SalesOrders::Table, SalesOrders::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_sales_order_items_order_id")
                        .table(SalesOrderItems::Table)
                        .col(SalesOrderItems::SalesOrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(SalesOrderItems::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(SalesOrders::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum SalesOrders {
        Table,
        Id,
        OrderNumber,
        CustomerId,
        Status,
        AllocationType,
        TenderContractId,
        OrderDate,
        RequiredDate,
        Notes,
        ConfirmedAt,
        CancelledAt,
        CreatedBy,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    pub(super) enum SalesOrderItems {
        Table,
        Id,
        SalesOrderId,
        ProductId,
        Quantity,
        ShippedQuantity,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240301_000006_create_shipping_plan_tables {
    use super::m20240301_000002_create_allocations_table::Allocations;
    use super::m20240301_000005_create_sales_order_tables::{SalesOrderItems, SalesOrders};
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000006_create_shipping_plan_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(ShippingPlans::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(ShippingPlans::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ShippingPlans::PlanNumber)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(ShippingPlans::SalesOrderId).uuid().not_null())
                        .col(ColumnDef::new(ShippingPlans::Status).string_len(16).not_null())
                        .col(ColumnDef::new(ShippingPlans::PlannedShipDate).date().null())
                        .col(
                            ColumnDef::new(ShippingPlans::ConfirmedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(ColumnDef::new(ShippingPlans::CreatedBy).string().not_null())
                        .col(
                            ColumnDef::new(ShippingPlans::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ShippingPlans::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_shipping_plans_order_id")
                                .from(ShippingPlans::Table, ShippingPlans::SalesOrderId)
                                .to(SalesOrders::Table, SalesOrders::Id)
                                .on_delete(ForeignKeyAction::Restrict),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(ShippingPlanItems::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(ShippingPlanItems::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ShippingPlanItems::ShippingPlanId)
                                .uuid()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ShippingPlanItems::SalesOrderItemId)
                                .uuid()
                                .not_null(),
                        )
                        .col(ColumnDef::new(ShippingPlanItems::ProductId).uuid().not_null())
                        .col(
                            ColumnDef::new(ShippingPlanItems::PlannedQuantity)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ShippingPlanItems::AllocatedQuantity)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(ShippingPlanItems::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ShippingPlanItems::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .check(Expr::cust("allocated_quantity >= 0"))
                        .check(Expr::cust("allocated_quantity <= planned_quantity"))
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_shipping_plan_items_plan_id")
                                .from(ShippingPlanItems::Table, ShippingPlanItems::ShippingPlanId)
                                .to(ShippingPlans::Table, ShippingPlans::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_shipping_plan_items_order_item_id")
                                .from(
                                    ShippingPlanItems::Table,
                                    ShippingPlanItems::SalesOrderItemId,
                                )
                                .to(SalesOrderItems::Table, SalesOrderItems::Id)
                                .on_delete(ForeignKeyAction::Restrict),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(ShippingPlanAllocations::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(ShippingPlanAllocations::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ShippingPlanAllocations::ShippingPlanItemId)
                                .uuid()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ShippingPlanAllocations::AllocationId)
                                .uuid()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ShippingPlanAllocations::Quantity)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ShippingPlanAllocations::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .check(Expr::cust("quantity > 0"))
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_shipping_plan_allocations_item_id")
                                .from(
                                    ShippingPlanAllocations::Table,
                                    ShippingPlanAllocations::ShippingPlanItemId,
                                )
                                .to(ShippingPlanItems::Table, ShippingPlanItems::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_shipping_plan_allocations_allocation_id")
                                .from(
                                    ShippingPlanAllocations::Table,
                                    ShippingPlanAllocations::AllocationId,
                                )
                                .to(Allocations::Table, Allocations::Id)
                                .on_delete(ForeignKeyAction::Restrict),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(
                    Table::drop()
                        .table(ShippingPlanAllocations::Table)
                        .to_owned(),
                )
                .await?;
            manager
                .drop_table(Table::drop().table(ShippingPlanItems::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(ShippingPlans::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum ShippingPlans {
        Table,
        Id,
        PlanNumber,
        SalesOrderId,
        Status,
        PlannedShipDate,
        ConfirmedAt,
        CreatedBy,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    pub(super) enum ShippingPlanItems {
        Table,
        Id,
        ShippingPlanId,
        SalesOrderItemId,
        ProductId,
        PlannedQuantity,
        AllocatedQuantity,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum ShippingPlanAllocations {
        Table,
        Id,
        ShippingPlanItemId,
        AllocationId,
        Quantity,
        CreatedAt,
    }
}

mod m20240301_000007_create_picking_tables {
    use super::m20240301_000002_create_allocations_table::Allocations;
    use super::m20240301_000006_create_shipping_plan_tables::ShippingPlans;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000007_create_picking_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(PickingLists::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(PickingLists::Id).uuid().primary_key().not_null())
                        .col(
                            ColumnDef::new(PickingLists::PickingNumber)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(PickingLists::ShippingPlanId).uuid().not_null())
                        .col(ColumnDef::new(PickingLists::SalesOrderId).uuid().not_null())
                        .col(ColumnDef::new(PickingLists::Status).string_len(16).not_null())
                        .col(ColumnDef::new(PickingLists::AssignedTo).string().null())
                        .col(
                            ColumnDef::new(PickingLists::StartedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(PickingLists::CompletedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(ColumnDef::new(PickingLists::CreatedBy).string().not_null())
                        .col(
                            ColumnDef::new(PickingLists::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PickingLists::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_picking_lists_plan_id")
                                .from(PickingLists::Table, PickingLists::ShippingPlanId)
                                .to(ShippingPlans::Table, ShippingPlans::Id)
                                .on_delete(ForeignKeyAction::Restrict),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(PickingListItems::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(PickingListItems::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PickingListItems::PickingListId)
                                .uuid()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PickingListItems::ShippingPlanItemId)
                                .uuid()
                                .not_null(),
                        )
                        .col(ColumnDef::new(PickingListItems::AllocationId).uuid().not_null())
                        .col(ColumnDef::new(PickingListItems::BatchId).uuid().not_null())
                        .col(ColumnDef::new(PickingListItems::ProductId).uuid().not_null())
                        .col(ColumnDef::new(PickingListItems::Location).string().null())
                        .col(ColumnDef::new(PickingListItems::Sequence).integer().not_null())
                        .col(
                            ColumnDef::new(PickingListItems::QuantityToPick)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PickingListItems::QuantityPicked)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(PickingListItems::PickedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(PickingListItems::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PickingListItems::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .check(Expr::cust("quantity_to_pick > 0"))
                        .check(Expr::cust(
                            "quantity_picked >= 0 AND quantity_picked <= quantity_to_pick",
                        ))
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_picking_list_items_list_id")
                                .from(PickingListItems::Table, PickingListItems::PickingListId)
                                .to(PickingLists::Table, PickingLists::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_picking_list_items_allocation_id")
                                .from(PickingListItems::Table, PickingListItems::AllocationId)
                                .to(Allocations::Table, Allocations::Id)
                                .on_delete(ForeignKeyAction::Restrict),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(PickingListItems::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(PickingLists::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum PickingLists {
        Table,
        Id,
        PickingNumber,
        ShippingPlanId,
        SalesOrderId,
        Status,
        AssignedTo,
        StartedAt,
        CompletedAt,
        CreatedBy,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    pub(super) enum PickingListItems {
        Table,
        Id,
        PickingListId,
        ShippingPlanItemId,
        AllocationId,
        BatchId,
        ProductId,
        Location,
        Sequence,
        QuantityToPick,
        QuantityPicked,
        PickedAt,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240301_000008_create_packing_tables {
    use super::m20240301_000007_create_picking_tables::{PickingListItems, PickingLists};
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000008_create_packing_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(PackingOrders::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(PackingOrders::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PackingOrders::PackingNumber)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(PackingOrders::PickingListId).uuid().not_null())
                        .col(ColumnDef::new(PackingOrders::ShippingPlanId).uuid().not_null())
                        .col(ColumnDef::new(PackingOrders::SalesOrderId).uuid().not_null())
                        .col(ColumnDef::new(PackingOrders::Status).string_len(16).not_null())
                        .col(ColumnDef::new(PackingOrders::AssignedTo).string().null())
                        .col(
                            ColumnDef::new(PackingOrders::StartedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(PackingOrders::CompletedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(ColumnDef::new(PackingOrders::CreatedBy).string().not_null())
                        .col(
                            ColumnDef::new(PackingOrders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PackingOrders::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_packing_orders_picking_list_id")
                                .from(PackingOrders::Table, PackingOrders::PickingListId)
                                .to(PickingLists::Table, PickingLists::Id)
                                .on_delete(ForeignKeyAction::Restrict),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(PackingBoxes::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(PackingBoxes::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(PackingBoxes::PackingOrderId).uuid().not_null())
                        .col(ColumnDef::new(PackingBoxes::BoxNumber).integer().not_null())
                        .col(ColumnDef::new(PackingBoxes::Status).string_len(16).not_null())
                        .col(ColumnDef::new(PackingBoxes::WeightGrams).integer().null())
                        .col(
                            ColumnDef::new(PackingBoxes::SealedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(PackingBoxes::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PackingBoxes::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_packing_boxes_order_id")
                                .from(PackingBoxes::Table, PackingBoxes::PackingOrderId)
                                .to(PackingOrders::Table, PackingOrders::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("uq_packing_boxes_order_box_number")
                        .table(PackingBoxes::Table)
                        .col(PackingBoxes::PackingOrderId)
                        .col(PackingBoxes::BoxNumber)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(PackingBoxItems::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(PackingBoxItems::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(PackingBoxItems::PackingBoxId).uuid().not_null())
                        .col(
                            ColumnDef::new(PackingBoxItems::PickingListItemId)
                                .uuid()
                                .not_null(),
                        )
                        .col(ColumnDef::new(PackingBoxItems::AllocationId).uuid().not_null())
                        .col(
                            ColumnDef::new(PackingBoxItems::QuantityPacked)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PackingBoxItems::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .check(Expr::cust("quantity_packed > 0"))
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_packing_box_items_box_id")
                                .from(PackingBoxItems::Table, PackingBoxItems::PackingBoxId)
                                .to(PackingBoxes::Table, PackingBoxes::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_packing_box_items_picking_item_id")
                                .from(PackingBoxItems::Table, PackingBoxItems::PickingListItemId)
                                .to(PickingListItems::Table, PickingListItems::Id)
                                .on_delete(ForeignKeyAction::Restrict),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(PackingBoxItems::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(PackingBoxes::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(PackingOrders::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum PackingOrders {
        Table,
        Id,
        PackingNumber,
        PickingListId,
        ShippingPlanId,
        SalesOrderId,
        Status,
        AssignedTo,
        StartedAt,
        CompletedAt,
        CreatedBy,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum PackingBoxes {
        Table,
        Id,
        PackingOrderId,
        BoxNumber,
        Status,
        WeightGrams,
        SealedAt,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum PackingBoxItems {
        Table,
        Id,
        PackingBoxId,
        PickingListItemId,
        AllocationId,
        QuantityPacked,
        CreatedAt,
    }
}

mod m20240301_000009_create_shipment_tables {
    use super::m20240301_000008_create_packing_tables::PackingOrders;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000009_create_shipment_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(PackingSlips::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(PackingSlips::Id).uuid().primary_key().not_null())
                        .col(
                            ColumnDef::new(PackingSlips::SlipNumber)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(PackingSlips::PackingOrderId).uuid().not_null())
                        .col(ColumnDef::new(PackingSlips::SalesOrderId).uuid().not_null())
                        .col(ColumnDef::new(PackingSlips::Status).string_len(16).not_null())
                        .col(ColumnDef::new(PackingSlips::TotalBoxes).integer().not_null())
                        .col(ColumnDef::new(PackingSlips::TotalUnits).integer().not_null())
                        .col(
                            ColumnDef::new(PackingSlips::FinalizedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(ColumnDef::new(PackingSlips::CreatedBy).string().not_null())
                        .col(
                            ColumnDef::new(PackingSlips::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PackingSlips::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_packing_slips_packing_order_id")
                                .from(PackingSlips::Table, PackingSlips::PackingOrderId)
                                .to(PackingOrders::Table, PackingOrders::Id)
                                .on_delete(ForeignKeyAction::Restrict),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Shipments::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Shipments::Id).uuid().primary_key().not_null())
                        .col(
                            ColumnDef::new(Shipments::ShipmentNumber)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Shipments::PackingSlipId).uuid().not_null())
                        .col(ColumnDef::new(Shipments::SalesOrderId).uuid().not_null())
                        .col(ColumnDef::new(Shipments::Status).string_len(16).not_null())
                        .col(ColumnDef::new(Shipments::CarrierId).uuid().null())
                        .col(ColumnDef::new(Shipments::TrackingNumber).string().null())
                        .col(
                            ColumnDef::new(Shipments::DispatchedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Shipments::DeliveredAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(ColumnDef::new(Shipments::ReceivedBy).string().null())
                        .col(ColumnDef::new(Shipments::CreatedBy).string().not_null())
                        .col(
                            ColumnDef::new(Shipments::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Shipments::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_shipments_packing_slip_id")
                                .from(Shipments::Table, Shipments::PackingSlipId)
                                .to(PackingSlips::Table, PackingSlips::Id)
                                .on_delete(ForeignKeyAction::Restrict),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_shipments_sales_order_id")
                        .table(Shipments::Table)
                        .col(Shipments::SalesOrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Shipments::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(PackingSlips::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum PackingSlips {
        Table,
        Id,
        SlipNumber,
        PackingOrderId,
        SalesOrderId,
        Status,
        TotalBoxes,
        TotalUnits,
        FinalizedAt,
        CreatedBy,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum Shipments {
        Table,
        Id,
        ShipmentNumber,
        PackingSlipId,
        SalesOrderId,
        Status,
        CarrierId,
        TrackingNumber,
        DispatchedAt,
        DeliveredAt,
        ReceivedBy,
        CreatedBy,
        CreatedAt,
        UpdatedAt,
    }
}

/// Standalone migration runner used by the bootstrap binary's `migrate` mode.
pub async fn run_migration(db_url: &str) -> Result<()> {
    info!("Setting up database connection for migrations");

    let mut opt = ConnectOptions::new(db_url);
    opt.max_connections(2)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(30))
        .acquire_timeout(Duration::from_secs(30))
        .sqlx_logging(false);

    let db = Database::connect(opt).await?;

    info!("Running database migrations");

    match Migrator::up(&db, None).await {
        Ok(_) => {
            info!("Migrations completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Migration failed: {}", e);
            Err(e.into())
        }
    }
}
