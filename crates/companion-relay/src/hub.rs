// Fan-out of relay messages to every connected WebSocket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use companion_core::protocol::RelayMessage;

/// Frames buffered per subscriber before a slow socket starts skipping.
pub const HUB_CAPACITY: usize = 64;

/// Broadcast channel of serialized `RelayMessage` frames. Cloning shares the
/// same channel.
#[derive(Clone)]
pub struct BroadcastHub {
    tx: broadcast::Sender<String>,
    next_id: Arc<AtomicU64>,
}

/// One connected front end's view of the hub.
pub struct Subscription {
    pub id: u64,
    pub rx: broadcast::Receiver<String>,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Subscription {
            id,
            rx: self.tx.subscribe(),
        }
    }

    /// Live subscribers. Dropped sockets drop their receiver and stop counting.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Serialize and publish `message`. Returns how many subscribers it was
    /// queued for; zero subscribers is not an error.
    pub fn publish(&self, message: &RelayMessage) -> Result<usize, serde_json::Error> {
        let frame = serde_json::to_string(message)?;
        Ok(self.publish_text(frame))
    }

    pub fn publish_text(&self, frame: String) -> usize {
        let delivered = self.tx.send(frame).unwrap_or(0);
        debug!(delivered, "relay message published");
        delivered
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(HUB_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use companion_core::protocol::TriggerCommand;
    use tokio::sync::broadcast::error::RecvError;

    #[tokio::test]
    async fn publish_without_subscribers_reports_zero() {
        let hub = BroadcastHub::default();
        let msg = RelayMessage::from(TriggerCommand::expression("happy"));
        assert_eq!(hub.publish(&msg).unwrap(), 0);
    }

    #[tokio::test]
    async fn every_subscriber_gets_the_same_frame() {
        let hub = BroadcastHub::default();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        assert_ne!(a.id, b.id);
        assert_eq!(hub.subscriber_count(), 2);

        let msg = RelayMessage::from(TriggerCommand::expression("happy"));
        assert_eq!(hub.publish(&msg).unwrap(), 2);

        let expected = r#"{"type":"expression","data":{"name":"happy"}}"#;
        assert_eq!(a.rx.recv().await.unwrap(), expected);
        assert_eq!(b.rx.recv().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn dropped_subscriber_stops_counting() {
        let hub = BroadcastHub::default();
        let a = hub.subscribe();
        let _b = hub.subscribe();
        drop(a);
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(hub.publish_text("x".into()), 1);
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let hub = BroadcastHub::new(2);
        let mut slow = hub.subscribe();
        for i in 0..5 {
            hub.publish_text(format!("frame {i}"));
        }
        assert!(matches!(slow.rx.recv().await, Err(RecvError::Lagged(3))));
        assert_eq!(slow.rx.recv().await.unwrap(), "frame 3");
        assert_eq!(slow.rx.recv().await.unwrap(), "frame 4");
    }
}
