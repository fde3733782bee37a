use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::{BalanceKind, StoreOrderStatus};

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the bus is gone.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!(error = %e, "Dropping domain event");
        }
    }
}

/// Domain events emitted by the settlement pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Cart events
    CartItemAdded {
        cart_id: Uuid,
        item_id: Uuid,
        product_id: Uuid,
    },
    CartItemUpdated {
        cart_id: Uuid,
        item_id: Uuid,
    },
    CartItemRemoved {
        cart_id: Uuid,
        item_id: Uuid,
    },
    CartCleared(Uuid),

    // Order events
    OrderPlaced {
        order_id: Uuid,
        order_number: String,
        buyer_id: Uuid,
        store_order_ids: Vec<Uuid>,
    },
    OrderArchived(Uuid),

    // Store order events
    StoreOrderStatusChanged {
        store_order_id: Uuid,
        order_id: Uuid,
        from: StoreOrderStatus,
        to: StoreOrderStatus,
    },
    DeliveryCodeRejected {
        store_order_id: Uuid,
        attempts: i32,
    },

    // Escrow events
    EscrowLocked {
        escrow_id: Uuid,
        store_order_id: Uuid,
        amount: Decimal,
        shipping_fee: Decimal,
    },
    EscrowReleased {
        escrow_id: Uuid,
        store_order_id: Uuid,
    },

    // Ledger events
    WalletDebited {
        user_id: Uuid,
        transaction_id: Uuid,
        kind: BalanceKind,
        amount: Decimal,
    },
    WalletCredited {
        user_id: Uuid,
        transaction_id: Uuid,
        kind: BalanceKind,
        amount: Decimal,
    },
    PointsRedeemed {
        user_id: Uuid,
        points: i64,
        discount: Decimal,
    },
    CouponRedeemed {
        coupon_id: Uuid,
        order_id: Uuid,
    },

    /// Outbound notification handed to the dispatcher
    Notification {
        event_type: String,
        recipient_id: Uuid,
        payload: serde_json::Value,
    },

    Generic {
        message: String,
        timestamp: DateTime<Utc>,
        metadata: serde_json::Value,
    },
}

impl Event {
    /// Create a generic event with string data
    pub fn with_data(data: String) -> Self {
        Event::Generic {
            message: data,
            timestamp: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }
}

/// Drains the event channel, logging every event.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");
    while let Some(event) = rx.recv().await {
        match &event {
            Event::OrderPlaced {
                order_id,
                order_number,
                store_order_ids,
                ..
            } => {
                info!(
                    %order_id,
                    %order_number,
                    store_orders = store_order_ids.len(),
                    "Order placed"
                );
            }
            Event::StoreOrderStatusChanged {
                store_order_id,
                from,
                to,
                ..
            } => {
                info!(%store_order_id, %from, %to, "Store order transitioned");
            }
            Event::DeliveryCodeRejected {
                store_order_id,
                attempts,
            } => {
                warn!(%store_order_id, attempts, "Wrong delivery code presented");
            }
            Event::EscrowLocked {
                escrow_id, amount, ..
            } => {
                info!(%escrow_id, %amount, "Escrow locked");
            }
            Event::EscrowReleased { escrow_id, .. } => {
                info!(%escrow_id, "Escrow released");
            }
            Event::Notification {
                event_type,
                recipient_id,
                ..
            } => {
                info!(%event_type, %recipient_id, "Notification dispatched");
            }
            _ => {
                info!("Received event: {:?}", event);
            }
        }
    }
    warn!("Event processing loop has ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_delivers_to_receiver() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = EventSender::new(tx);
        let order_id = Uuid::new_v4();

        sender.send(Event::OrderArchived(order_id)).await.unwrap();

        match rx.recv().await {
            Some(Event::OrderArchived(id)) => assert_eq!(id, order_id),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn send_or_log_tolerates_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = EventSender::new(tx);

        assert!(sender.send(Event::CartCleared(Uuid::new_v4())).await.is_err());
        sender.send_or_log(Event::CartCleared(Uuid::new_v4())).await;
    }
}
