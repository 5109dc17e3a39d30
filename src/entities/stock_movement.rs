use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelBehavior, ActiveValue, Set};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum MovementType {
    #[sea_orm(string_value = "ALLOCATE")]
    Allocate,

    #[sea_orm(string_value = "RESERVE")]
    Reserve,

    #[sea_orm(string_value = "RELEASE")]
    Release,

    #[sea_orm(string_value = "PICK")]
    Pick,

    #[sea_orm(string_value = "SHIP")]
    Ship,

    #[sea_orm(string_value = "TRANSFER")]
    Transfer,

    #[sea_orm(string_value = "ADJUST")]
    Adjust,
}

impl fmt::Display for MovementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MovementType::Allocate => "ALLOCATE",
            MovementType::Reserve => "RESERVE",
            MovementType::Release => "RELEASE",
            MovementType::Pick => "PICK",
            MovementType::Ship => "SHIP",
            MovementType::Transfer => "TRANSFER",
            MovementType::Adjust => "ADJUST",
        };
        f.write_str(s)
    }
}

/// Immutable ledger row. Rows are inserted once and never updated.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "stock_movements")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub allocation_id: Option<Uuid>,
    pub batch_id: Uuid,
    pub product_id: Uuid,
    pub movement_type: MovementType,
    pub quantity: i32,
    pub reference_type: String,
    pub reference_id: String,
    pub notes: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C: ConnectionTrait>(self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        if !insert {
            return Err(DbErr::Custom(
                "stock movements are append-only and cannot be updated".to_string(),
            ));
        }

        let mut active_model = self;
        if let ActiveValue::NotSet = active_model.id {
            active_model.id = Set(Uuid::new_v4());
        }
        active_model.created_at = Set(Utc::now());
        Ok(active_model)
    }
}
