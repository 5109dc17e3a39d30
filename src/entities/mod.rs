pub mod allocation;
pub mod batch;
pub mod contract_reservation;
pub mod packing_box;
pub mod packing_box_item;
pub mod packing_order;
pub mod packing_slip;
pub mod picking_list;
pub mod picking_list_item;
pub mod sales_order;
pub mod sales_order_item;
pub mod shipment;
pub mod shipping_plan;
pub mod shipping_plan_allocation;
pub mod shipping_plan_item;
pub mod stock_movement;
pub mod task_status;
pub mod tender_contract;

use chrono::Utc;
use uuid::Uuid;

/// Builds a document number of the form `PREFIX-YYYYMMDD-XXXXXXXX`.
pub fn generate_number(prefix: &str) -> String {
    let timestamp = Utc::now().format("%Y%m%d");
    let simple = Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", prefix, timestamp, simple[..8].to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_numbers_have_prefix_date_and_suffix() {
        let number = generate_number("ALC");
        let parts: Vec<&str> = number.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "ALC");
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 8);
        assert_eq!(parts[2], parts[2].to_uppercase());
        assert_ne!(generate_number("ALC"), number);
    }
}
