use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelBehavior, ActiveValue, Set};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum ShippingPlanStatus {
    #[sea_orm(string_value = "DRAFT")]
    Draft,

    #[sea_orm(string_value = "PLANNED")]
    Planned,

    #[sea_orm(string_value = "CONFIRMED")]
    Confirmed,

    #[sea_orm(string_value = "ALLOCATED")]
    Allocated,

    #[sea_orm(string_value = "PROCESSING")]
    Processing,

    #[sea_orm(string_value = "COMPLETED")]
    Completed,

    #[sea_orm(string_value = "CANCELLED")]
    Cancelled,
}

impl ShippingPlanStatus {
    pub fn is_open(&self) -> bool {
        !matches!(
            self,
            ShippingPlanStatus::Completed | ShippingPlanStatus::Cancelled
        )
    }
}

impl fmt::Display for ShippingPlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShippingPlanStatus::Draft => write!(f, "DRAFT"),
            ShippingPlanStatus::Planned => write!(f, "PLANNED"),
            ShippingPlanStatus::Confirmed => write!(f, "CONFIRMED"),
            ShippingPlanStatus::Allocated => write!(f, "ALLOCATED"),
            ShippingPlanStatus::Processing => write!(f, "PROCESSING"),
            ShippingPlanStatus::Completed => write!(f, "COMPLETED"),
            ShippingPlanStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "shipping_plans")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub plan_number: String,
    pub sales_order_id: Uuid,
    pub status: ShippingPlanStatus,
    pub planned_ship_date: Option<NaiveDate>,
    pub confirmed_at: Option<DateTime<Utc>>,
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
