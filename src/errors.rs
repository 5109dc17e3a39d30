use sea_orm::error::DbErr;
use serde::Serialize;
use uuid::Uuid;

/// Coarse classification of a [`ServiceError`], used by callers to render
/// an actionable message without matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    BusinessRule,
    Internal,
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        DbErr,
    ),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// The store aborted the transaction because of a concurrent writer.
    /// Safe to retry.
    #[error("Concurrent update: {0}")]
    Contention(String),

    #[error("Business rule violated: {0}")]
    BusinessRule(String),

    #[error("Insufficient stock for {scope}: requested {requested}, available {available}")]
    InsufficientStock {
        scope: String,
        requested: i32,
        available: i32,
    },

    #[error("Allocation error: {0}")]
    AllocationError(String),

    #[error("Contract error: {0}")]
    ContractError(String),

    #[error("Picking error: {0}")]
    PickingError(String),

    #[error("Packing error: {0}")]
    PackingError(String),

    #[error("Shipment error: {0}")]
    ShipmentError(String),

    #[error("{entity} {id} is {current}; operation requires {required}")]
    InvalidState {
        entity: &'static str,
        id: Uuid,
        current: String,
        required: String,
    },

    #[error("Event error: {0}")]
    EventError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    pub fn not_found(entity: &str, id: impl std::fmt::Display) -> Self {
        ServiceError::NotFound(format!("{} {} not found", entity, id))
    }

    /// Builds the error returned by every guarded state transition.
    pub fn invalid_state(
        entity: &'static str,
        id: Uuid,
        current: impl std::fmt::Display,
        required: impl Into<String>,
    ) -> Self {
        ServiceError::InvalidState {
            entity,
            id,
            current: current.to_string(),
            required: required.into(),
        }
    }

    /// Single source of truth for the error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ValidationError(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) | Self::Contention(_) => ErrorKind::Conflict,
            Self::BusinessRule(_)
            | Self::InsufficientStock { .. }
            | Self::AllocationError(_)
            | Self::ContractError(_)
            | Self::PickingError(_)
            | Self::PackingError(_)
            | Self::ShipmentError(_)
            | Self::InvalidState { .. } => ErrorKind::BusinessRule,
            Self::DatabaseError(_) | Self::EventError(_) | Self::InternalError(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn is_business_rule(&self) -> bool {
        self.kind() == ErrorKind::BusinessRule
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Contention(_))
    }

    /// Message suitable for showing to an operator.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::Contention(_) => "Concurrent update, retry the operation".to_string(),
            Self::EventError(_) | Self::InternalError(_) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specialisations_classify_as_business_rule() {
        let errors = [
            ServiceError::InsufficientStock {
                scope: "product x".into(),
                requested: 10,
                available: 2,
            },
            ServiceError::AllocationError("x".into()),
            ServiceError::ContractError("x".into()),
            ServiceError::PickingError("x".into()),
            ServiceError::PackingError("x".into()),
            ServiceError::ShipmentError("x".into()),
            ServiceError::invalid_state("PickingList", Uuid::nil(), "PENDING", "ASSIGNED"),
        ];
        for err in errors {
            assert_eq!(err.kind(), ErrorKind::BusinessRule, "{err}");
        }
    }

    #[test]
    fn taxonomy_mapping() {
        assert_eq!(
            ServiceError::NotFound("x".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            ServiceError::ValidationError("x".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(ServiceError::Conflict("x".into()).kind(), ErrorKind::Conflict);
        let contended = ServiceError::Contention("database is locked".into());
        assert_eq!(contended.kind(), ErrorKind::Conflict);
        assert!(contended.is_retryable());
        assert!(!ServiceError::Conflict("x".into()).is_retryable());
        assert!(!contended.response_message().contains("locked"));
        assert_eq!(
            ServiceError::DatabaseError(DbErr::Custom("boom".into())).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn invalid_state_names_current_and_required_state() {
        let id = Uuid::new_v4();
        let err = ServiceError::invalid_state("ShippingPlan", id, "CONFIRMED", "ALLOCATED");
        let msg = err.to_string();
        assert!(msg.contains("CONFIRMED"));
        assert!(msg.contains("ALLOCATED"));
        assert!(msg.contains(&id.to_string()));
    }

    #[test]
    fn insufficient_stock_message_carries_quantities() {
        let err = ServiceError::InsufficientStock {
            scope: "batch B-1".into(),
            requested: 120,
            available: 100,
        };
        assert_eq!(
            err.response_message(),
            "Insufficient stock for batch B-1: requested 120, available 100"
        );
    }

    #[test]
    fn response_message_hides_internal_details() {
        assert_eq!(
            ServiceError::InternalError("sensitive".into()).response_message(),
            "Internal server error"
        );
        assert_eq!(
            ServiceError::DatabaseError(DbErr::Custom("connection refused".into())).response_message(),
            "Database error"
        );
        assert_eq!(
            ServiceError::NotFound("Batch not found".into()).response_message(),
            "Not found: Batch not found"
        );
    }
}
