// Stock bookkeeping
pub mod allocation;
pub mod batches;
pub mod ledger;

// Tender contracts and their capacity carve-outs
pub mod contracts;

// Sales order → shipment pipeline
pub mod fulfillment;

// Service factory for dependency injection
pub mod factory;

use chrono::{NaiveDate, Utc};

/// Calendar day used for expiry checks.
pub(crate) fn today() -> NaiveDate {
    Utc::now().date_naive()
}
