use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelBehavior, ActiveValue, Set};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum ReservationStatus {
    #[sea_orm(string_value = "ACTIVE")]
    Active,

    #[sea_orm(string_value = "FULFILLED")]
    Fulfilled,

    #[sea_orm(string_value = "RELEASED")]
    Released,
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReservationStatus::Active => write!(f, "ACTIVE"),
            ReservationStatus::Fulfilled => write!(f, "FULFILLED"),
            ReservationStatus::Released => write!(f, "RELEASED"),
        }
    }
}

/// Capacity on one tender allocation carved out for a contract.
///
/// `remaining_quantity` is stored so it can be queried and constrained, and is
/// always rewritten from `reserved_quantity - allocated_quantity`.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "contract_reservations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub tender_contract_id: Uuid,
    pub batch_id: Uuid,
    pub allocation_id: Uuid,
    pub reserved_quantity: i32,
    pub allocated_quantity: i32,
    pub remaining_quantity: i32,
    pub shipped_quantity: i32,
    pub status: ReservationStatus,
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
    pub fn holds_invariant(&self) -> bool {
        self.remaining_quantity == self.reserved_quantity - self.allocated_quantity
            && self.allocated_quantity <= self.reserved_quantity
            && self.allocated_quantity >= 0
    }

    /// Status implied by the quantities while the reservation is open.
    /// Fully drawn capacity whose allocations have all shipped is fulfilled.
    pub fn settled_status(&self) -> ReservationStatus {
        if self.reserved_quantity == 0 {
            ReservationStatus::Released
        } else if self.remaining_quantity == 0 && self.shipped_quantity >= self.allocated_quantity {
            ReservationStatus::Fulfilled
        } else {
            ReservationStatus::Active
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reservation(reserved: i32, allocated: i32, shipped: i32) -> Model {
        let now = Utc::now();
        Model {
            id: Uuid::new_v4(),
            tender_contract_id: Uuid::new_v4(),
            batch_id: Uuid::new_v4(),
            allocation_id: Uuid::new_v4(),
            reserved_quantity: reserved,
            allocated_quantity: allocated,
            remaining_quantity: reserved - allocated,
            shipped_quantity: shipped,
            status: ReservationStatus::Active,
            created_by: "test".into(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn fulfilled_only_once_drawn_capacity_has_shipped() {
        assert_eq!(reservation(40, 10, 0).settled_status(), ReservationStatus::Active);
        assert_eq!(reservation(40, 40, 25).settled_status(), ReservationStatus::Active);
        assert_eq!(reservation(40, 40, 40).settled_status(), ReservationStatus::Fulfilled);
        assert_eq!(reservation(0, 0, 0).settled_status(), ReservationStatus::Released);
    }

    #[test]
    fn remaining_must_track_reserved_minus_allocated() {
        assert!(reservation(40, 10, 0).holds_invariant());
        let mut broken = reservation(40, 10, 0);
        broken.remaining_quantity = 35;
        assert!(!broken.holds_invariant());
    }
}
