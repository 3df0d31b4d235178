//! Pub/sub transport for session lifecycle events.
//!
//! The controller and every worker talk to each other exclusively through a
//! [`Bus`]. Production uses [`RedisBus`]; tests and single-process setups use
//! [`LocalBus`], which has the same delivery semantics (fan-out to every
//! subscriber of a channel, no persistence).

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Capacity of the per-subscription delivery queue.
const SUBSCRIPTION_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus closed")]
    Closed,
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish a raw payload on `channel`.
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError>;

    /// Subscribe to a set of channels. Messages from all of them arrive on
    /// the returned receiver, which ends when the bus is closed.
    async fn subscribe(&self, channels: &[&str]) -> Result<mpsc::Receiver<BusMessage>, BusError>;

    /// Stop all subscriptions and release connections.
    async fn close(&self);
}

/// Serialize `value` as JSON and publish it.
pub async fn publish_json<T: serde::Serialize + Sync>(
    bus: &dyn Bus,
    channel: &str,
    value: &T,
) -> Result<(), BusError> {
    let payload = serde_json::to_string(value)?;
    bus.publish(channel, payload).await
}

// ── In-process bus ─────────────────────────────────────────────────

/// In-memory bus backed by a single broadcast channel.
pub struct LocalBus {
    tx: broadcast::Sender<BusMessage>,
    closed: CancellationToken,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            tx,
            closed: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError> {
        if self.closed.is_cancelled() {
            return Err(BusError::Closed);
        }
        // No subscribers is not an error; pub/sub drops the message.
        let _ = self.tx.send(BusMessage {
            channel: channel.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, channels: &[&str]) -> Result<mpsc::Receiver<BusMessage>, BusError> {
        if self.closed.is_cancelled() {
            return Err(BusError::Closed);
        }
        let wanted: Vec<String> = channels.iter().map(|c| c.to_string()).collect();
        let mut rx = self.tx.subscribe();
        let (out_tx, out_rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let closed = self.closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Ok(msg) => {
                            if wanted.iter().any(|c| *c == msg.channel)
                                && out_tx.send(msg).await.is_err()
                            {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(skipped = n, "local bus subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = closed.cancelled() => break,
                }
            }
        });
        Ok(out_rx)
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

// ── Redis bus ──────────────────────────────────────────────────────

/// Redis pub/sub bus. Publishing goes through a shared connection manager;
/// each subscription owns a dedicated pub/sub connection.
pub struct RedisBus {
    client: redis::Client,
    publisher: redis::aio::ConnectionManager,
    closed: CancellationToken,
}

impl RedisBus {
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url)?;
        let publisher = client.get_connection_manager().await?;
        Ok(Self {
            client,
            publisher,
            closed: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError> {
        if self.closed.is_cancelled() {
            return Err(BusError::Closed);
        }
        let mut conn = self.publisher.clone();
        let _receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channels: &[&str]) -> Result<mpsc::Receiver<BusMessage>, BusError> {
        if self.closed.is_cancelled() {
            return Err(BusError::Closed);
        }
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in channels {
            pubsub.subscribe(*channel).await?;
        }
        let (out_tx, out_rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let closed = self.closed.clone();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            loop {
                tokio::select! {
                    msg = messages.next() => {
                        let Some(msg) = msg else {
                            tracing::warn!("redis subscription stream ended");
                            break;
                        };
                        let payload: String = match msg.get_payload() {
                            Ok(p) => p,
                            Err(e) => {
                                tracing::warn!(error = %e, "dropping non-utf8 bus payload");
                                continue;
                            }
                        };
                        let message = BusMessage {
                            channel: msg.get_channel_name().to_string(),
                            payload,
                        };
                        if out_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    _ = closed.cancelled() => break,
                }
            }
        });
        Ok(out_rx)
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn local_bus_round_trip() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe(&["session:create"]).await.unwrap();
        bus.publish("session:create", "{}".into()).await.unwrap();
        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.channel, "session:create");
        assert_eq!(msg.payload, "{}");
    }

    #[tokio::test]
    async fn local_bus_filters_channels() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe(&["session:heartbeat"]).await.unwrap();
        bus.publish("session:create", "a".into()).await.unwrap();
        bus.publish("session:heartbeat", "b".into()).await.unwrap();
        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.payload, "b");
        let extra = tokio::time::timeout(Duration::from_millis(50), sub.recv()).await;
        assert!(extra.is_err(), "no further messages expected");
    }

    #[tokio::test]
    async fn local_bus_fans_out() {
        let bus = LocalBus::new();
        let mut a = bus.subscribe(&["x"]).await.unwrap();
        let mut b = bus.subscribe(&["x"]).await.unwrap();
        bus.publish("x", "hello".into()).await.unwrap();
        assert_eq!(a.recv().await.unwrap().payload, "hello");
        assert_eq!(b.recv().await.unwrap().payload, "hello");
    }

    #[tokio::test]
    async fn close_ends_subscriptions() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe(&["x"]).await.unwrap();
        bus.close().await;
        assert!(sub.recv().await.is_none());
        assert!(matches!(
            bus.publish("x", "late".into()).await,
            Err(BusError::Closed)
        ));
    }

    #[tokio::test]
    async fn publish_json_encodes_payload() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe(&["session:heartbeat"]).await.unwrap();
        let hb = crate::events::SessionHeartbeat {
            session_id: "S1".into(),
        };
        publish_json(&bus, "session:heartbeat", &hb).await.unwrap();
        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.payload, r#"{"sessionId":"S1"}"#);
    }
}
