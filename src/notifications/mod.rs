use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::events::{Event, EventSender};

/// Represents an outbound notification
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Notification {
    pub id: Uuid,
    pub event: NotificationEvent,
    pub recipient: Recipient,
    pub order_id: Uuid,
    pub store_order_id: Option<Uuid>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        event: NotificationEvent,
        recipient: Recipient,
        order_id: Uuid,
        store_order_id: Option<Uuid>,
        payload: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event,
            recipient,
            order_id,
            store_order_id,
            payload,
            created_at,
        }
    }
}

/// Notification topics. Redelivery of the same topic for the same ids is harmless.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum NotificationEvent {
    #[serde(rename = "order.placed")]
    OrderPlaced,
    #[serde(rename = "order.paid")]
    OrderPaid,
}

impl NotificationEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationEvent::OrderPlaced => "order.placed",
            NotificationEvent::OrderPaid => "order.paid",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "role", content = "user_id", rename_all = "snake_case")]
pub enum Recipient {
    Buyer(Uuid),
    Seller(Uuid),
}

impl Recipient {
    pub fn user_id(&self) -> Uuid {
        match self {
            Recipient::Buyer(id) | Recipient::Seller(id) => *id,
        }
    }
}

/// Notification dispatch errors
#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Delivery failed: {0}")]
    Delivery(String),
}

/// Fire-and-forget sink for settlement notifications
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn send(&self, notification: Notification) -> Result<(), NotificationError>;
}

/// Sends every notification, logging and dropping failures.
pub async fn dispatch_all(dispatcher: &dyn NotificationDispatcher, notifications: Vec<Notification>) {
    for notification in notifications {
        let event = notification.event.as_str();
        let recipient = notification.recipient.user_id();
        if let Err(e) = dispatcher.send(notification).await {
            warn!(event, %recipient, error = %e, "Notification dispatch failed");
        }
    }
}

/// Forwards notifications onto the in-process event bus
#[derive(Clone)]
pub struct EventNotificationDispatcher {
    events: Arc<EventSender>,
}

impl EventNotificationDispatcher {
    pub fn new(events: Arc<EventSender>) -> Self {
        Self { events }
    }
}

#[async_trait]
impl NotificationDispatcher for EventNotificationDispatcher {
    #[instrument(skip(self, notification), fields(event = notification.event.as_str()))]
    async fn send(&self, notification: Notification) -> Result<(), NotificationError> {
        let mut payload = notification.payload;
        if let serde_json::Value::Object(map) = &mut payload {
            map.insert("order_id".into(), serde_json::json!(notification.order_id));
            if let Some(id) = notification.store_order_id {
                map.insert("store_order_id".into(), serde_json::json!(id));
            }
        }

        self.events
            .send(Event::Notification {
                event_type: notification.event.as_str().to_string(),
                recipient_id: notification.recipient.user_id(),
                payload,
            })
            .await
            .map_err(NotificationError::Delivery)
    }
}

/// Keeps notifications in memory. Used by tests and local runs.
#[derive(Clone, Default)]
pub struct RecordingDispatcher {
    sent: Arc<RwLock<Vec<Notification>>>,
    fail: bool,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A dispatcher that rejects every notification
    pub fn failing() -> Self {
        Self {
            sent: Arc::default(),
            fail: true,
        }
    }

    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.read().await.clone()
    }

    pub async fn sent_for(&self, event: NotificationEvent) -> Vec<Notification> {
        self.sent
            .read()
            .await
            .iter()
            .filter(|n| n.event == event)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingDispatcher {
    async fn send(&self, notification: Notification) -> Result<(), NotificationError> {
        if self.fail {
            return Err(NotificationError::Delivery("dispatcher unavailable".into()));
        }
        self.sent.write().await.push(notification);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn placed(recipient: Recipient) -> Notification {
        Notification::new(
            NotificationEvent::OrderPlaced,
            recipient,
            Uuid::new_v4(),
            None,
            serde_json::json!({ "order_number": "COL-20240301-000001" }),
            Utc::now(),
        )
    }

    #[test]
    fn topics_use_dotted_names() {
        assert_eq!(
            serde_json::to_value(NotificationEvent::OrderPaid).unwrap(),
            serde_json::json!("order.paid")
        );
        assert_eq!(NotificationEvent::OrderPlaced.as_str(), "order.placed");
    }

    #[tokio::test]
    async fn recording_dispatcher_keeps_notifications() {
        let dispatcher = RecordingDispatcher::new();
        let buyer = Uuid::new_v4();
        dispatch_all(&dispatcher, vec![placed(Recipient::Buyer(buyer))]).await;

        let sent = dispatcher.sent_for(NotificationEvent::OrderPlaced).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient, Recipient::Buyer(buyer));
        assert!(dispatcher.sent_for(NotificationEvent::OrderPaid).await.is_empty());
    }

    #[tokio::test]
    async fn failures_are_swallowed() {
        let dispatcher = RecordingDispatcher::failing();
        dispatch_all(&dispatcher, vec![placed(Recipient::Seller(Uuid::new_v4()))]).await;
        assert!(dispatcher.sent().await.is_empty());
    }

    #[tokio::test]
    async fn event_dispatcher_forwards_to_bus() {
        let (tx, mut rx) = mpsc::channel(4);
        let dispatcher = EventNotificationDispatcher::new(Arc::new(EventSender::new(tx)));
        let seller = Uuid::new_v4();
        let notification = placed(Recipient::Seller(seller));
        let order_id = notification.order_id;

        dispatcher.send(notification).await.unwrap();

        match rx.recv().await {
            Some(Event::Notification {
                event_type,
                recipient_id,
                payload,
            }) => {
                assert_eq!(event_type, "order.placed");
                assert_eq!(recipient_id, seller);
                assert_eq!(payload["order_id"], serde_json::json!(order_id));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
