use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::ServiceError;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Creates a sender together with the receiving end of a bounded channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), ServiceError> {
        self.sender
            .send(event)
            .await
            .map_err(|e| ServiceError::EventError(format!("Failed to send event: {}", e)))
    }

    /// Sends an event after a transaction has committed. A closed bus is
    /// logged; the committed work stands.
    pub async fn publish(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!(error = %e, "Dropping domain event");
        }
    }
}

// Domain events published after each committed operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Event {
    // Batch lifecycle
    BatchReceived {
        batch_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    },
    BatchQcChanged {
        batch_id: Uuid,
        old_status: String,
        new_status: String,
    },
    BatchQuantityAdjusted {
        batch_id: Uuid,
        old_quantity: i32,
        new_quantity: i32,
        reason: String,
    },
    BatchRecalled {
        batch_id: Uuid,
        released_allocations: Vec<Uuid>,
    },
    BatchExpired(Uuid),

    // Allocation engine
    AllocationCreated {
        allocation_id: Uuid,
        batch_id: Uuid,
        quantity: i32,
    },
    AllocationReserved {
        allocation_id: Uuid,
        quantity: i32,
    },
    AllocationReleased {
        allocation_id: Uuid,
        quantity: i32,
    },
    AllocationShipped {
        allocation_id: Uuid,
        quantity: i32,
        reference_type: String,
        reference_id: String,
    },
    AllocationTransferred {
        source_allocation_id: Uuid,
        target_allocation_id: Uuid,
        quantity: i32,
    },
    AllocationCancelled(Uuid),
    PartialAllocationWarning {
        reference_id: Uuid,
        reference_type: String,
        requested_quantity: i32,
        allocated_quantity: i32,
    },

    // Tender contracts
    ContractStatusChanged {
        contract_id: Uuid,
        old_status: String,
        new_status: String,
    },
    ReservationCreated {
        reservation_id: Uuid,
        contract_id: Uuid,
        quantity: i32,
    },
    ReservationDrawn {
        reservation_id: Uuid,
        allocation_id: Uuid,
        quantity: i32,
    },
    ReservationReleased {
        reservation_id: Uuid,
        quantity: i32,
    },

    // Fulfillment pipeline
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
    },
    ShippingPlanStatusChanged {
        plan_id: Uuid,
        old_status: String,
        new_status: String,
    },
    PickingListStatusChanged {
        picking_list_id: Uuid,
        old_status: String,
        new_status: String,
    },
    PackingOrderStatusChanged {
        packing_order_id: Uuid,
        old_status: String,
        new_status: String,
    },
    ShipmentCreated {
        shipment_id: Uuid,
        order_id: Uuid,
    },
    ShipmentDispatched {
        shipment_id: Uuid,
        order_id: Uuid,
    },
    ShipmentDelivered {
        shipment_id: Uuid,
        order_id: Uuid,
    },
    ShipmentCancelled {
        shipment_id: Uuid,
        order_id: Uuid,
    },

    /// Outbound notification request; delivery is handled by a subscriber.
    Notification {
        event_type: String,
        recipients: Vec<String>,
        context: serde_json::Value,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::BatchReceived { .. } => "batch_received",
            Event::BatchQcChanged { .. } => "batch_qc_changed",
            Event::BatchQuantityAdjusted { .. } => "batch_quantity_adjusted",
            Event::BatchRecalled { .. } => "batch_recalled",
            Event::BatchExpired(_) => "batch_expired",
            Event::AllocationCreated { .. } => "allocation_created",
            Event::AllocationReserved { .. } => "allocation_reserved",
            Event::AllocationReleased { .. } => "allocation_released",
            Event::AllocationShipped { .. } => "allocation_shipped",
            Event::AllocationTransferred { .. } => "allocation_transferred",
            Event::AllocationCancelled(_) => "allocation_cancelled",
            Event::PartialAllocationWarning { .. } => "partial_allocation_warning",
            Event::ContractStatusChanged { .. } => "contract_status_changed",
            Event::ReservationCreated { .. } => "reservation_created",
            Event::ReservationDrawn { .. } => "reservation_drawn",
            Event::ReservationReleased { .. } => "reservation_released",
            Event::OrderStatusChanged { .. } => "order_status_changed",
            Event::ShippingPlanStatusChanged { .. } => "shipping_plan_status_changed",
            Event::PickingListStatusChanged { .. } => "picking_list_status_changed",
            Event::PackingOrderStatusChanged { .. } => "packing_order_status_changed",
            Event::ShipmentCreated { .. } => "shipment_created",
            Event::ShipmentDispatched { .. } => "shipment_dispatched",
            Event::ShipmentDelivered { .. } => "shipment_delivered",
            Event::ShipmentCancelled { .. } => "shipment_cancelled",
            Event::Notification { .. } => "notification",
        }
    }
}

/// Subscriber invoked by [`process_events`] for every event on the bus.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: &Event) -> Result<(), ServiceError>;
}

/// Drains the bus until every sender is dropped, fanning events out to the
/// registered handlers. Handler failures are logged and do not stop the loop.
pub async fn process_events(mut rx: mpsc::Receiver<Event>, handlers: Vec<Arc<dyn EventHandler>>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::PartialAllocationWarning {
                reference_id,
                reference_type,
                requested_quantity,
                allocated_quantity,
            } => {
                warn!(
                    %reference_id,
                    %reference_type,
                    requested_quantity,
                    allocated_quantity,
                    "Partial allocation"
                );
            }
            Event::BatchRecalled {
                batch_id,
                released_allocations,
            } => {
                warn!(
                    %batch_id,
                    released = released_allocations.len(),
                    "Batch recalled"
                );
            }
            Event::Notification {
                event_type,
                recipients,
                ..
            } => {
                info!(%event_type, recipients = recipients.len(), "Notification queued");
            }
            other => {
                debug!(event = other.name(), "Received event: {:?}", other);
            }
        }

        let results = join_all(handlers.iter().map(|h| h.handle_event(&event))).await;
        for e in results.into_iter().filter_map(Result::err) {
            error!(event = event.name(), error = %e, "Event handler failed");
        }
    }

    warn!("Event processing loop has ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle_event(&self, event: &Event) -> Result<(), ServiceError> {
            self.seen.lock().await.push(event.name());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EventHandler for Failing {
        async fn handle_event(&self, _event: &Event) -> Result<(), ServiceError> {
            Err(ServiceError::EventError("boom".into()))
        }
    }

    #[tokio::test]
    async fn events_reach_every_handler_despite_failures() {
        let (sender, rx) = EventSender::channel(8);
        let recorder = Arc::new(Recorder::default());
        let handlers: Vec<Arc<dyn EventHandler>> = vec![Arc::new(Failing), recorder.clone()];

        sender.publish(Event::AllocationCancelled(Uuid::new_v4())).await;
        sender.publish(Event::BatchExpired(Uuid::new_v4())).await;
        drop(sender);

        process_events(rx, handlers).await;

        let seen = recorder.seen.lock().await;
        assert_eq!(*seen, vec!["allocation_cancelled", "batch_expired"]);
    }

    #[tokio::test]
    async fn send_fails_once_receiver_is_gone() {
        let (sender, rx) = EventSender::channel(1);
        drop(rx);
        let result = sender.send(Event::BatchExpired(Uuid::nil())).await;
        assert!(matches!(result, Err(ServiceError::EventError(_))));
        // publish swallows the same failure
        sender.publish(Event::BatchExpired(Uuid::nil())).await;
    }
}
