//! Audit trail sink.
//!
//! Every mutating engine operation reports one [`AuditEntry`] after its
//! transaction commits. Persistence of the trail lives outside this crate;
//! the default sink writes entries to the `audit` tracing target.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::context::OperationContext;
use crate::errors::ServiceError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Info,
    Warning,
    Critical,
}

/// Audit log entry for compliance tracking
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub entity_type: String,
    pub entity_id: Uuid,
    /// Operation name, e.g. `ship_allocation`
    pub action: String,
    pub old_values: Option<serde_json::Value>,
    pub new_values: Option<serde_json::Value>,
    pub actor: String,
    pub request_id: Option<String>,
    pub severity: AuditSeverity,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        ctx: &OperationContext,
        entity_type: impl Into<String>,
        entity_id: Uuid,
        action: impl Into<String>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id,
            action: action.into(),
            old_values: None,
            new_values: None,
            actor: ctx.actor.clone(),
            request_id: ctx.request_id.clone(),
            severity: AuditSeverity::Info,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_old<T: Serialize>(mut self, old: &T) -> Self {
        self.old_values = serde_json::to_value(old).ok();
        self
    }

    pub fn with_new<T: Serialize>(mut self, new: &T) -> Self {
        self.new_values = serde_json::to_value(new).ok();
        self
    }

    pub fn severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = severity;
        self
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> Result<(), ServiceError>;
}

/// Best-effort recording: a failing sink is logged and never surfaces to the
/// caller, whose transaction has already committed.
pub async fn record_best_effort(sink: &Arc<dyn AuditSink>, entry: AuditEntry) {
    let entity_type = entry.entity_type.clone();
    let entity_id = entry.entity_id;
    let action = entry.action.clone();
    if let Err(e) = sink.record(entry).await {
        warn!(
            %entity_type,
            %entity_id,
            %action,
            error = %e,
            "Failed to record audit entry"
        );
    }
}

/// Writes audit entries as structured log lines.
#[derive(Debug, Default, Clone)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, entry: AuditEntry) -> Result<(), ServiceError> {
        let payload = serde_json::to_string(&entry)
            .map_err(|e| ServiceError::InternalError(format!("audit serialization: {}", e)))?;
        info!(
            target: "audit",
            entity_type = %entry.entity_type,
            entity_id = %entry.entity_id,
            action = %entry.action,
            actor = %entry.actor,
            severity = ?entry.severity,
            "{}",
            payload
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failing_sink_is_swallowed() {
        let mut mock = MockAuditSink::new();
        mock.expect_record()
            .times(1)
            .returning(|_| Err(ServiceError::InternalError("disk full".into())));
        let sink: Arc<dyn AuditSink> = Arc::new(mock);

        let ctx = OperationContext::system();
        record_best_effort(&sink, AuditEntry::new(&ctx, "Batch", Uuid::nil(), "pass_qc")).await;
    }

    #[tokio::test]
    async fn entry_carries_actor_and_values() {
        let ctx = OperationContext::new("qa.lead").with_request_id("req-7");
        let entry = AuditEntry::new(&ctx, "Allocation", Uuid::nil(), "ship_allocation")
            .with_old(&serde_json::json!({"shipped": 0}))
            .with_new(&serde_json::json!({"shipped": 50}))
            .severity(AuditSeverity::Warning);

        assert_eq!(entry.actor, "qa.lead");
        assert_eq!(entry.request_id.as_deref(), Some("req-7"));
        assert_eq!(entry.new_values, Some(serde_json::json!({"shipped": 50})));
        assert!(TracingAuditSink.record(entry).await.is_ok());
    }
}
