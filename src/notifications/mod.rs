use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

/// Types of outbound notifications
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    QcFailed,
    BatchRecalled,
    BatchesExpired,
    ExpiryWarning,
    AllocationShortfall,
    ShipmentDispatched,
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NotificationType::QcFailed => "qc_failed",
            NotificationType::BatchRecalled => "batch_recalled",
            NotificationType::BatchesExpired => "batches_expired",
            NotificationType::ExpiryWarning => "expiry_warning",
            NotificationType::AllocationShortfall => "allocation_shortfall",
            NotificationType::ShipmentDispatched => "shipment_dispatched",
        };
        f.write_str(s)
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        event_type: NotificationType,
        recipients: Vec<String>,
        context: serde_json::Value,
    ) -> Result<(), ServiceError>;
}

/// Fire-and-forget delivery: failures are logged and dropped.
pub async fn notify_quietly(
    notifier: &Arc<dyn Notifier>,
    event_type: NotificationType,
    recipients: &[String],
    context: serde_json::Value,
) {
    if recipients.is_empty() {
        debug!(%event_type, "No recipients configured; skipping notification");
        return;
    }
    if let Err(e) = notifier.send(event_type, recipients.to_vec(), context).await {
        warn!(%event_type, error = %e, "Notification delivery failed");
    }
}

/// Publishes notifications onto the domain event bus, where a delivery
/// subscriber picks them up.
#[derive(Debug, Clone)]
pub struct EventBusNotifier {
    events: EventSender,
}

impl EventBusNotifier {
    pub fn new(events: EventSender) -> Self {
        Self { events }
    }
}

#[async_trait]
impl Notifier for EventBusNotifier {
    async fn send(
        &self,
        event_type: NotificationType,
        recipients: Vec<String>,
        context: serde_json::Value,
    ) -> Result<(), ServiceError> {
        self.events
            .send(Event::Notification {
                event_type: event_type.to_string(),
                recipients,
                context,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    #[tokio::test]
    async fn event_bus_notifier_publishes_notification_event() {
        let (sender, mut rx) = EventSender::channel(4);
        let notifier = EventBusNotifier::new(sender);

        notifier
            .send(
                NotificationType::BatchRecalled,
                vec!["qa@example.com".into()],
                serde_json::json!({"batch_number": "B-1"}),
            )
            .await
            .unwrap();

        match rx.recv().await {
            Some(Event::Notification {
                event_type,
                recipients,
                context,
            }) => {
                assert_eq!(event_type, "batch_recalled");
                assert_eq!(recipients, vec!["qa@example.com".to_string()]);
                assert_eq!(context["batch_number"], "B-1");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn empty_recipient_list_skips_delivery() {
        let mut mock = MockNotifier::new();
        mock.expect_send().never();
        let notifier: Arc<dyn Notifier> = Arc::new(mock);
        notify_quietly(&notifier, NotificationType::QcFailed, &[], serde_json::json!({})).await;
    }

    #[tokio::test]
    async fn delivery_failure_is_swallowed() {
        let mut mock = MockNotifier::new();
        mock.expect_send()
            .with(
                eq(NotificationType::QcFailed),
                eq(vec!["qa@example.com".to_string()]),
                mockall::predicate::always(),
            )
            .times(1)
            .returning(|_, _, _| Err(ServiceError::EventError("smtp down".into())));
        let notifier: Arc<dyn Notifier> = Arc::new(mock);

        notify_quietly(
            &notifier,
            NotificationType::QcFailed,
            &["qa@example.com".to_string()],
            serde_json::json!({}),
        )
        .await;
    }
}
