//! Pharmaceutical warehouse core.
//!
//! Batches are received and QC-gated, stock is allocated from them by
//! FIFO/FEFO/LIFO or by explicit batch, tender contracts carve reserved
//! capacity out of allocations, and sales orders flow through shipping
//! plans, picking, packing and shipment. Every stock-affecting operation
//! writes an immutable movement to the stock ledger.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod audit;
pub mod config;
pub mod context;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod master_data;
pub mod migrator;
pub mod notifications;
pub mod services;

pub mod prelude {
    pub use crate::context::OperationContext;
    pub use crate::errors::{ErrorKind, ServiceError};
    pub use crate::events::{Event, EventSender};
    pub use crate::services::allocation::{AllocationService, AllocationStrategy};
    pub use crate::services::batches::BatchService;
    pub use crate::services::contracts::ContractService;
    pub use crate::services::factory::{ServiceContainer, ServiceFactory};
    pub use crate::services::fulfillment::{
        PackingService, PickingService, SalesOrderService, ShipmentService, ShippingPlanService,
    };
    pub use crate::services::ledger::{StockLedger, StockReference};
}
