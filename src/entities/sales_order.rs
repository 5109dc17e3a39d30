use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelBehavior, ActiveValue, Set};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::allocation::AllocationType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum SalesOrderStatus {
    #[sea_orm(string_value = "PENDING")]
    Pending,

    #[sea_orm(string_value = "CONFIRMED")]
    Confirmed,

    #[sea_orm(string_value = "PROCESSING")]
    Processing,

    #[sea_orm(string_value = "SHIPPED")]
    Shipped,

    #[sea_orm(string_value = "DELIVERED")]
    Delivered,

    #[sea_orm(string_value = "CANCELLED")]
    Cancelled,
}

impl SalesOrderStatus {
    pub fn is_cancellable(&self) -> bool {
        matches!(self, SalesOrderStatus::Pending | SalesOrderStatus::Confirmed)
    }
}

impl fmt::Display for SalesOrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SalesOrderStatus::Pending => write!(f, "PENDING"),
            SalesOrderStatus::Confirmed => write!(f, "CONFIRMED"),
            SalesOrderStatus::Processing => write!(f, "PROCESSING"),
            SalesOrderStatus::Shipped => write!(f, "SHIPPED"),
            SalesOrderStatus::Delivered => write!(f, "DELIVERED"),
            SalesOrderStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sales_orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub order_number: String,
    pub customer_id: Uuid,
    pub status: SalesOrderStatus,
    pub allocation_type: AllocationType,
    pub tender_contract_id: Option<Uuid>,
    pub order_date: NaiveDate,
    pub required_date: Option<NaiveDate>,
    pub notes: Option<String>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
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
