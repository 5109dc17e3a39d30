use serde::{Deserialize, Serialize};

/// Identifies who is performing an operation. Carried into audit entries and
/// the `created_by` column of ledger rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationContext {
    pub actor: String,
    pub request_id: Option<String>,
}

impl OperationContext {
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Context for scheduled sweeps and bootstrap work.
    pub fn system() -> Self {
        Self::new("system")
    }
}
