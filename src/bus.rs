// =============================================================================
// Message bus — fire-and-forget publication of raw trade frames
// =============================================================================
//
// `publish` never blocks and never reports failure to the caller.  The Redis
// backend queues payloads onto an unbounded channel drained by a background
// task that owns the connection and logs `PUBLISH` errors.  Delivery is
// at-least-once at best; nothing is queued durably.
// =============================================================================

use anyhow::{Context, Result};
use redis::AsyncCommands;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub trait MessageBus: Send + Sync {
    fn publish(&self, topic: &str, payload: String);
}

/// One message as seen by a [`LocalBus`] subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: String,
}

// ---------------------------------------------------------------------------
// Redis pub/sub
// ---------------------------------------------------------------------------

pub struct RedisBus {
    tx: mpsc::UnboundedSender<BusMessage>,
}

impl RedisBus {
    /// Open a multiplexed connection and spawn the publisher task.  The task
    /// ends once every `RedisBus` handle has been dropped.
    pub async fn connect(url: &str) -> Result<(Self, JoinHandle<()>)> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .context("failed to connect to redis")?;

        let (tx, mut rx) = mpsc::unbounded_channel::<BusMessage>();
        let handle = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let sent: redis::RedisResult<i64> = conn.publish(&msg.topic, &msg.payload).await;
                match sent {
                    Ok(receivers) => debug!(topic = %msg.topic, receivers, "published"),
                    Err(e) => warn!(topic = %msg.topic, error = %e, "redis publish failed"),
                }
            }
            debug!("redis publisher stopped");
        });

        info!("redis message bus connected");
        Ok((Self { tx }, handle))
    }
}

impl MessageBus for RedisBus {
    fn publish(&self, topic: &str, payload: String) {
        let msg = BusMessage {
            topic: topic.to_string(),
            payload,
        };
        if self.tx.send(msg).is_err() {
            warn!(topic = %topic, "redis publisher task is gone; message dropped");
        }
    }
}

// ---------------------------------------------------------------------------
// In-process broadcast
// ---------------------------------------------------------------------------

/// Broadcast bus for single-process deployments and tests.  Messages published
/// with no live subscriber are dropped.
#[derive(Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<BusMessage>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl MessageBus for LocalBus {
    fn publish(&self, topic: &str, payload: String) {
        let _ = self.tx.send(BusMessage {
            topic: topic.to_string(),
            payload,
        });
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_bus_delivers_to_every_subscriber() {
        let bus = LocalBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish("trades", "{\"x\":1}".to_string());

        let expected = BusMessage {
            topic: "trades".into(),
            payload: "{\"x\":1}".into(),
        };
        assert_eq!(a.recv().await.unwrap(), expected);
        assert_eq!(b.recv().await.unwrap(), expected);
    }

    #[test]
    fn publishing_without_subscribers_is_silent() {
        let bus = LocalBus::default();
        bus.publish("trades", "dropped".to_string());
    }

    #[tokio::test]
    async fn redis_connect_rejects_bad_url() {
        assert!(RedisBus::connect("not-a-redis-url").await.is_err());
    }
}
