use crate::models::{ConnectivityState, PendingChange};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

const BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum Notification {
    ConnectivityChanged(ConnectivityState),
    /// Re-fetch everything shown; cached data may be stale.
    RefreshData,
    /// Out-of-band resource exhaustion signal.
    ResourceError,
    OperationFailed { title: String, message: String },
    ChangeQueued { id: String },
    ChangesAtRisk { changes: Vec<PendingChange> },
}

impl Notification {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ConnectivityChanged(_) => "connectivity-changed",
            Self::RefreshData => "refresh-data",
            Self::ResourceError => "resource-error",
            Self::OperationFailed { .. } => "operation-failed",
            Self::ChangeQueued { .. } => "change-queued",
            Self::ChangesAtRisk { .. } => "changes-at-risk",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusEnvelope {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub notification: Notification,
}

/// Publish/subscribe fan-out. Cloning shares the same channel.
#[derive(Debug, Clone)]
pub struct NotificationBus {
    sender: broadcast::Sender<BusEnvelope>,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEnvelope> {
        self.sender.subscribe()
    }

    /// Returns the number of subscribers reached. Publishing with none is not an error.
    pub fn publish(&self, notification: Notification) -> usize {
        tracing::debug!(event = notification.event_type(), "bus publish");
        let envelope = BusEnvelope {
            event_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            notification,
        };
        self.sender.send(envelope).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::{Notification, NotificationBus};
    use crate::models::ConnectivityState;

    #[tokio::test]
    async fn subscribers_receive_in_publish_order() {
        let bus = NotificationBus::new();
        let mut receiver = bus.subscribe();

        assert_eq!(bus.publish(Notification::ConnectivityChanged(ConnectivityState::Offline)), 1);
        bus.publish(Notification::RefreshData);

        let first = receiver.recv().await.expect("first");
        let second = receiver.recv().await.expect("second");
        assert_eq!(first.notification, Notification::ConnectivityChanged(ConnectivityState::Offline));
        assert_eq!(second.notification, Notification::RefreshData);
        assert_ne!(first.event_id, second.event_id);
    }

    #[test]
    fn publishing_without_subscribers_is_harmless() {
        let bus = NotificationBus::new();
        assert_eq!(bus.publish(Notification::ResourceError), 0);
    }

    #[test]
    fn separate_buses_are_isolated() {
        let left = NotificationBus::new();
        let right = NotificationBus::new();
        let _left_rx = left.subscribe();
        assert_eq!(left.subscriber_count(), 1);
        assert_eq!(right.subscriber_count(), 0);
    }
}
