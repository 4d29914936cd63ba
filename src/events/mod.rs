use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Handle used by services to publish domain events.
///
/// Publishing never fails the operation that produced the event: events are
/// emitted after the owning transaction has committed and a full or closed
/// channel is only logged.
#[derive(Clone, Debug)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
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

    /// Sends an event, logging instead of propagating delivery failures
    pub async fn send_or_log(&self, event: Event) {
        let name = event.name();
        if let Err(err) = self.send(event).await {
            warn!(event = name, error = %err, "dropping domain event");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    OrderPlaced {
        order_id: Uuid,
        member_id: Uuid,
        total_price: i64,
    },
    OrderAwaitingPayment {
        order_id: Uuid,
        intent_id: String,
    },
    OrderPaid {
        order_id: Uuid,
        imp_uid: String,
        amount: i64,
    },
    OrderCancelled {
        order_id: Uuid,
        refunded: i64,
    },
    OrderRefunded {
        order_id: Uuid,
        amount: i64,
        fully_refunded: bool,
    },
    OrderFailed {
        order_id: Uuid,
        reason: String,
    },
    StockDepleted {
        sku_id: Uuid,
    },
    StockReplenished {
        sku_id: Uuid,
        product_stock: i32,
    },
    MemberRegistered {
        member_id: Uuid,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::OrderPlaced { .. } => "order_placed",
            Event::OrderAwaitingPayment { .. } => "order_awaiting_payment",
            Event::OrderPaid { .. } => "order_paid",
            Event::OrderCancelled { .. } => "order_cancelled",
            Event::OrderRefunded { .. } => "order_refunded",
            Event::OrderFailed { .. } => "order_failed",
            Event::StockDepleted { .. } => "stock_depleted",
            Event::StockReplenished { .. } => "stock_replenished",
            Event::MemberRegistered { .. } => "member_registered",
        }
    }
}

/// Consumes the event channel until every sender has been dropped
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        metrics::counter!("storefront.events", 1, "event" => event.name());
        match &event {
            Event::StockDepleted { sku_id } => {
                warn!(sku_id = %sku_id, "sku sold out");
            }
            Event::OrderFailed { order_id, reason } => {
                warn!(order_id = %order_id, reason = %reason, "order failed");
            }
            Event::OrderRefunded {
                order_id,
                amount,
                fully_refunded,
            } => {
                info!(order_id = %order_id, amount, fully_refunded, "order refunded");
            }
            other => debug!(event = ?other, "domain event"),
        }
    }

    info!("Event channel closed; event processing loop stopped");
}
