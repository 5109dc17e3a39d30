use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelBehavior, ActiveValue, Set};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::ServiceError;

/// Kind of claim an allocation represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum AllocationType {
    #[sea_orm(string_value = "REGULAR")]
    Regular,

    #[sea_orm(string_value = "TENDER")]
    Tender,

    #[sea_orm(string_value = "CONSIGNMENT")]
    Consignment,

    #[sea_orm(string_value = "RESERVE")]
    Reserve,
}

impl AllocationType {
    /// Tender and consignment stock is always held for a named customer.
    pub fn requires_customer(&self) -> bool {
        matches!(self, AllocationType::Tender | AllocationType::Consignment)
    }
}

impl fmt::Display for AllocationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationType::Regular => write!(f, "REGULAR"),
            AllocationType::Tender => write!(f, "TENDER"),
            AllocationType::Consignment => write!(f, "CONSIGNMENT"),
            AllocationType::Reserve => write!(f, "RESERVE"),
        }
    }
}

impl FromStr for AllocationType {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "REGULAR" => Ok(AllocationType::Regular),
            "TENDER" => Ok(AllocationType::Tender),
            "CONSIGNMENT" => Ok(AllocationType::Consignment),
            "RESERVE" => Ok(AllocationType::Reserve),
            other => Err(ServiceError::ValidationError(format!(
                "unknown allocation type '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum AllocationStatus {
    #[sea_orm(string_value = "active")]
    Active,

    #[sea_orm(string_value = "shipped")]
    Shipped,

    #[sea_orm(string_value = "consumed")]
    Consumed,

    #[sea_orm(string_value = "expired")]
    Expired,
}

impl AllocationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AllocationStatus::Active)
    }
}

impl fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationStatus::Active => write!(f, "active"),
            AllocationStatus::Shipped => write!(f, "shipped"),
            AllocationStatus::Consumed => write!(f, "consumed"),
            AllocationStatus::Expired => write!(f, "expired"),
        }
    }
}

/// A claim against part of one batch's quantity.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "allocations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub allocation_number: String,
    pub batch_id: Uuid,
    pub product_id: Uuid,
    pub allocation_type: AllocationType,
    pub customer_id: Option<Uuid>,
    pub tender_contract_id: Option<Uuid>,
    pub contract_reservation_id: Option<Uuid>,
    pub allocated_quantity: i32,
    pub shipped_quantity: i32,
    pub reserved_quantity: i32,
    pub status: AllocationStatus,
    pub reference_type: Option<String>,
    pub reference_id: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C: ConnectionTrait>(self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;
        let now = Utc::now();

        if insert {
            active_model.created_at = Set(now);
            if let ActiveValue::NotSet = active_model.id {
                active_model.id = Set(Uuid::new_v4());
            }
        }

        active_model.updated_at = Set(now);
        Ok(active_model)
    }
}

impl Model {
    pub fn quantities(&self) -> AllocationQuantities {
        AllocationQuantities {
            allocated: self.allocated_quantity,
            shipped: self.shipped_quantity,
            reserved: self.reserved_quantity,
        }
    }

    /// Quantity still held against the batch (allocated but not yet shipped).
    pub fn outstanding(&self) -> i32 {
        self.allocated_quantity - self.shipped_quantity
    }
}

/// The three quantities of an allocation, with the arithmetic of every
/// mutation checked against `0 <= shipped`, `0 <= reserved` and
/// `shipped + reserved <= allocated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationQuantities {
    pub allocated: i32,
    pub shipped: i32,
    pub reserved: i32,
}

impl AllocationQuantities {
    pub fn new(allocated: i32) -> Self {
        Self {
            allocated,
            shipped: 0,
            reserved: 0,
        }
    }

    pub fn holds_invariant(&self) -> bool {
        self.shipped >= 0
            && self.reserved >= 0
            && self
                .shipped
                .checked_add(self.reserved)
                .map_or(false, |committed| committed <= self.allocated)
    }

    /// Room left for new reservations.
    pub fn reservable(&self) -> i32 {
        self.allocated - self.shipped - self.reserved
    }

    pub fn reserve(self, quantity: i32) -> Result<Self, ServiceError> {
        ensure_positive(quantity)?;
        let limit = self.allocated - self.shipped;
        let reserved = checked_sum(self.reserved, quantity)?;
        if reserved > limit {
            return Err(ServiceError::AllocationError(format!(
                "cannot reserve {}: already reserved {} of {} unshipped",
                quantity, self.reserved, limit
            )));
        }
        Ok(Self { reserved, ..self })
    }

    pub fn release(self, quantity: i32) -> Result<Self, ServiceError> {
        ensure_positive(quantity)?;
        if quantity > self.reserved {
            return Err(ServiceError::AllocationError(format!(
                "cannot release {}: only {} reserved",
                quantity, self.reserved
            )));
        }
        Ok(Self {
            reserved: self.reserved - quantity,
            ..self
        })
    }

    /// Shipping consumes the reservation first; any excess must come from
    /// unreserved headroom.
    pub fn ship(self, quantity: i32) -> Result<Self, ServiceError> {
        ensure_positive(quantity)?;
        let shipped = checked_sum(self.shipped, quantity)?;
        if shipped > self.allocated {
            return Err(ServiceError::AllocationError(format!(
                "cannot ship {}: {} of {} already shipped",
                quantity, self.shipped, self.allocated
            )));
        }
        let reserved = self.reserved - quantity.min(self.reserved);
        Ok(Self {
            shipped,
            reserved,
            ..self
        })
    }

    /// Removes unreserved, unshipped quantity from the allocation.
    pub fn reduce(self, quantity: i32) -> Result<Self, ServiceError> {
        ensure_positive(quantity)?;
        if quantity > self.reservable() {
            return Err(ServiceError::AllocationError(format!(
                "cannot reduce by {}: only {} unreserved and unshipped",
                quantity,
                self.reservable()
            )));
        }
        Ok(Self {
            allocated: self.allocated - quantity,
            ..self
        })
    }

    /// Status implied by the quantities for an allocation that is still live.
    pub fn settled_status(&self) -> AllocationStatus {
        if self.allocated > 0 && self.shipped == self.allocated {
            AllocationStatus::Shipped
        } else if self.allocated == self.shipped {
            AllocationStatus::Consumed
        } else {
            AllocationStatus::Active
        }
    }
}

fn checked_sum(current: i32, quantity: i32) -> Result<i32, ServiceError> {
    current.checked_add(quantity).ok_or_else(|| {
        ServiceError::ValidationError(format!("quantity {} is out of range", quantity))
    })
}

fn ensure_positive(quantity: i32) -> Result<(), ServiceError> {
    if quantity <= 0 {
        return Err(ServiceError::ValidationError(format!(
            "quantity must be positive, got {}",
            quantity
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    #[test]
    fn only_active_allocations_are_live() {
        assert!(!AllocationStatus::Active.is_terminal());
        for status in [
            AllocationStatus::Shipped,
            AllocationStatus::Consumed,
            AllocationStatus::Expired,
        ] {
            assert!(status.is_terminal(), "{status}");
        }
    }

    #[test]
    fn requires_customer_flag() {
        assert!(AllocationType::Tender.requires_customer());
        assert!(AllocationType::Consignment.requires_customer());
        assert!(!AllocationType::Regular.requires_customer());
        assert!(!AllocationType::Reserve.requires_customer());
    }

    #[test]
    fn allocation_type_parses_case_insensitively() {
        assert_eq!("tender".parse::<AllocationType>().unwrap(), AllocationType::Tender);
        assert_matches!(
            "bogus".parse::<AllocationType>(),
            Err(ServiceError::ValidationError(_))
        );
    }

    #[test]
    fn reserve_is_bounded_by_unshipped_quantity() {
        let q = AllocationQuantities {
            allocated: 50,
            shipped: 20,
            reserved: 10,
        };
        assert_eq!(q.reserve(20).unwrap().reserved, 30);
        assert_matches!(q.reserve(21), Err(ServiceError::AllocationError(_)));
    }

    #[test]
    fn full_reserve_then_release_round_trips() {
        let q = AllocationQuantities::new(50);
        let reserved = q.reserve(50).unwrap();
        let released = reserved.release(50).unwrap();
        assert_eq!(released, q);
    }

    #[test]
    fn ship_nets_out_reservation() {
        let q = AllocationQuantities::new(50).reserve(50).unwrap();
        let shipped = q.ship(50).unwrap();
        assert_eq!(shipped.reserved, 0);
        assert_eq!(shipped.shipped, 50);
        assert_eq!(shipped.settled_status(), AllocationStatus::Shipped);
    }

    #[test]
    fn ship_beyond_reservation_uses_headroom() {
        let q = AllocationQuantities::new(50).reserve(10).unwrap();
        let shipped = q.ship(30).unwrap();
        assert_eq!(shipped.reserved, 0);
        assert_eq!(shipped.shipped, 30);
        assert_eq!(shipped.settled_status(), AllocationStatus::Active);
    }

    #[test]
    fn reduce_to_zero_consumes() {
        let q = AllocationQuantities::new(10).reduce(10).unwrap();
        assert_eq!(q.allocated, 0);
        assert_eq!(q.settled_status(), AllocationStatus::Consumed);
    }

    #[test]
    fn non_positive_quantities_are_rejected() {
        let q = AllocationQuantities::new(10);
        assert_matches!(q.reserve(0), Err(ServiceError::ValidationError(_)));
        assert_matches!(q.ship(-1), Err(ServiceError::ValidationError(_)));
    }

    #[test]
    fn overflowing_quantities_are_rejected() {
        let q = AllocationQuantities::new(50).reserve(1).unwrap();
        assert_matches!(q.reserve(i32::MAX), Err(ServiceError::ValidationError(_)));

        let shipped = AllocationQuantities::new(50).ship(10).unwrap();
        assert_matches!(shipped.ship(i32::MAX), Err(ServiceError::ValidationError(_)));
        assert_eq!(q.reserve(49).unwrap().reserved, 50);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Reserve(i32),
        Release(i32),
        Ship(i32),
        Reduce(i32),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1..60i32).prop_map(Op::Reserve),
            (1..60i32).prop_map(Op::Release),
            (1..60i32).prop_map(Op::Ship),
            (1..60i32).prop_map(Op::Reduce),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        #[test]
        fn invariant_survives_any_operation_sequence(
            allocated in 1..200i32,
            ops in proptest::collection::vec(op(), 0..40),
        ) {
            let mut q = AllocationQuantities::new(allocated);
            for op in ops {
                let next = match op {
                    Op::Reserve(n) => q.reserve(n),
                    Op::Release(n) => q.release(n),
                    Op::Ship(n) => q.ship(n),
                    Op::Reduce(n) => q.reduce(n),
                };
                if let Ok(next) = next {
                    q = next;
                }
                prop_assert!(q.holds_invariant(), "{:?}", q);
            }
        }
    }
}
