use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelBehavior, ActiveValue, Set};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Quality-control status of a received lot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum QcStatus {
    #[sea_orm(string_value = "PENDING")]
    Pending,

    #[sea_orm(string_value = "PASSED")]
    Passed,

    #[sea_orm(string_value = "FAILED")]
    Failed,

    #[sea_orm(string_value = "QUARANTINE")]
    Quarantine,
}

impl fmt::Display for QcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QcStatus::Pending => write!(f, "PENDING"),
            QcStatus::Passed => write!(f, "PASSED"),
            QcStatus::Failed => write!(f, "FAILED"),
            QcStatus::Quarantine => write!(f, "QUARANTINE"),
        }
    }
}

/// Lifecycle status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum BatchStatus {
    #[sea_orm(string_value = "ACTIVE")]
    Active,

    #[sea_orm(string_value = "CONSUMED")]
    Consumed,

    #[sea_orm(string_value = "EXPIRED")]
    Expired,

    #[sea_orm(string_value = "RECALLED")]
    Recalled,
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchStatus::Active => write!(f, "ACTIVE"),
            BatchStatus::Consumed => write!(f, "CONSUMED"),
            BatchStatus::Expired => write!(f, "EXPIRED"),
            BatchStatus::Recalled => write!(f, "RECALLED"),
        }
    }
}

/// A received lot of one product.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "batches")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub batch_number: String,
    pub product_id: Uuid,
    pub received_quantity: i32,
    pub manufacturing_date: NaiveDate,
    pub expiry_date: NaiveDate,
    pub received_date: NaiveDate,
    pub qc_status: QcStatus,
    pub pre_quarantine_qc_status: Option<QcStatus>,
    pub status: BatchStatus,
    pub rack_location: Option<String>,
    pub qc_notes: Option<String>,
    pub qc_by: Option<String>,
    pub qc_at: Option<DateTime<Utc>>,
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
    /// Returns why the batch cannot back an allocation on `today`, if anything.
    pub fn ineligibility_reason(&self, today: NaiveDate) -> Option<String> {
        if self.status != BatchStatus::Active {
            return Some(format!(
                "batch {} has status {}, expected ACTIVE",
                self.batch_number, self.status
            ));
        }
        if self.qc_status != QcStatus::Passed {
            return Some(format!(
                "batch {} has QC status {}, expected PASSED",
                self.batch_number, self.qc_status
            ));
        }
        if self.expiry_date <= today {
            return Some(format!(
                "batch {} expired on {}",
                self.batch_number, self.expiry_date
            ));
        }
        None
    }

    pub fn is_allocatable(&self, today: NaiveDate) -> bool {
        self.ineligibility_reason(today).is_none()
    }

    /// RECALLED and EXPIRED batches accept no further changes.
    pub fn is_frozen(&self) -> bool {
        matches!(self.status, BatchStatus::Recalled | BatchStatus::Expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(qc: QcStatus, status: BatchStatus, expiry: NaiveDate) -> Model {
        let now = Utc::now();
        Model {
            id: Uuid::new_v4(),
            batch_number: "B-001".into(),
            product_id: Uuid::new_v4(),
            received_quantity: 100,
            manufacturing_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            expiry_date: expiry,
            received_date: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            qc_status: qc,
            pre_quarantine_qc_status: None,
            status,
            rack_location: None,
            qc_notes: None,
            qc_by: None,
            qc_at: None,
            created_by: "test".into(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn only_active_passed_unexpired_batches_are_allocatable() {
        let today = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let later = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();

        assert!(batch(QcStatus::Passed, BatchStatus::Active, later).is_allocatable(today));
        assert!(!batch(QcStatus::Pending, BatchStatus::Active, later).is_allocatable(today));
        assert!(!batch(QcStatus::Quarantine, BatchStatus::Active, later).is_allocatable(today));
        assert!(!batch(QcStatus::Passed, BatchStatus::Recalled, later).is_allocatable(today));
        // expiry on the same day is already too late
        assert!(!batch(QcStatus::Passed, BatchStatus::Active, today).is_allocatable(today));
    }

    #[test]
    fn recalled_and_expired_batches_are_frozen() {
        let later = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        assert!(batch(QcStatus::Failed, BatchStatus::Recalled, later).is_frozen());
        assert!(batch(QcStatus::Passed, BatchStatus::Expired, later).is_frozen());
        assert!(!batch(QcStatus::Passed, BatchStatus::Active, later).is_frozen());
    }
}
