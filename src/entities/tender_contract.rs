use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelBehavior, ActiveValue, Set};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum ContractStatus {
    #[sea_orm(string_value = "DRAFT")]
    Draft,

    #[sea_orm(string_value = "ACTIVE")]
    Active,

    #[sea_orm(string_value = "SUSPENDED")]
    Suspended,

    #[sea_orm(string_value = "COMPLETED")]
    Completed,

    #[sea_orm(string_value = "CANCELLED")]
    Cancelled,
}

impl ContractStatus {
    pub fn can_transition_to(&self, next: ContractStatus) -> bool {
        use ContractStatus::*;
        matches!(
            (self, next),
            (Draft, Active)
                | (Draft, Cancelled)
                | (Active, Suspended)
                | (Active, Completed)
                | (Active, Cancelled)
                | (Suspended, Active)
                | (Suspended, Cancelled)
        )
    }
}

impl fmt::Display for ContractStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContractStatus::Draft => write!(f, "DRAFT"),
            ContractStatus::Active => write!(f, "ACTIVE"),
            ContractStatus::Suspended => write!(f, "SUSPENDED"),
            ContractStatus::Completed => write!(f, "COMPLETED"),
            ContractStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// A contractual commitment entitling a customer to reserved stock.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tender_contracts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub contract_number: String,
    pub customer_id: Uuid,
    pub status: ContractStatus,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub notes: Option<String>,
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
    /// ACTIVE and within its validity window on `today`.
    pub fn is_in_force(&self, today: NaiveDate) -> bool {
        self.status == ContractStatus::Active && self.start_date <= today && today <= self.end_date
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_transitions() {
        use ContractStatus::*;
        assert!(Draft.can_transition_to(Active));
        assert!(Active.can_transition_to(Suspended));
        assert!(Suspended.can_transition_to(Active));
        assert!(!Completed.can_transition_to(Active));
        assert!(!Cancelled.can_transition_to(Active));
        assert!(!Draft.can_transition_to(Completed));
    }
}
