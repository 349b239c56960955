//! Live event fan-out.
//!
//! The durable log in Postgres is the source of truth for replay; this layer
//! only carries already-committed events to online subscribers with low
//! latency. Publish therefore always happens AFTER the owning transaction
//! commits — an event on the wire is guaranteed to exist in the log.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::BroadcastStream;

/// Fan-out channel for committed session events, keyed by topic.
#[async_trait]
pub trait EventFanout: Send + Sync {
    /// Push one committed event to live subscribers. Best-effort: replay
    /// from the durable log covers any subscriber that misses it.
    async fn publish(&self, topic: &str, event: serde_json::Value) -> Result<()>;

    /// Attach to the live feed for a topic.
    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, serde_json::Value>>;

    /// Cheap liveness probe for the health endpoint.
    async fn ping(&self) -> Result<()>;
}

// =============================================================================
// In-process fan-out (single-node deployments, tests)
// =============================================================================

/// Per-topic broadcast channels. A channel is created on first subscribe
/// and pruned once its last subscriber is gone, so session topics do not
/// accumulate for the lifetime of the process.
pub struct HubFanout {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<serde_json::Value>>>>,
    capacity: usize,
}

impl HubFanout {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }
}

impl Default for HubFanout {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventFanout for HubFanout {
    async fn publish(&self, topic: &str, event: serde_json::Value) -> Result<()> {
        let orphaned = {
            let channels = self.channels.read().await;
            match channels.get(topic) {
                // A send error means every receiver is gone.
                Some(tx) => tx.send(event).is_err(),
                None => false,
            }
        };

        if orphaned {
            let mut channels = self.channels.write().await;
            if let Some(tx) = channels.get(topic) {
                if tx.receiver_count() == 0 {
                    channels.remove(topic);
                }
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, serde_json::Value>> {
        let rx = {
            let mut channels = self.channels.write().await;
            channels
                .entry(topic.to_string())
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe()
        };

        let stream = BroadcastStream::new(rx).filter_map(|result| async move {
            // A lagged receiver dropped messages; the stream endpoint
            // detects the seq gap and refills from the durable log.
            result.ok()
        });
        Ok(stream.boxed())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// NATS fan-out (multi-node deployments)
// =============================================================================

pub struct NatsFanout {
    client: async_nats::Client,
}

impl NatsFanout {
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url).await?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl EventFanout for NatsFanout {
    async fn publish(&self, topic: &str, event: serde_json::Value) -> Result<()> {
        let payload = serde_json::to_vec(&event)?;
        self.client
            .publish(topic.to_string(), bytes::Bytes::from(payload))
            .await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, serde_json::Value>> {
        let subscriber = self.client.subscribe(topic.to_string()).await?;
        let stream = subscriber.filter_map(|message| async move {
            match serde_json::from_slice(&message.payload) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!(error = %e, "dropping unparseable fan-out message");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn ping(&self) -> Result<()> {
        self.client.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hub_fanout_roundtrip() {
        let fanout = HubFanout::new();
        let mut stream = fanout.subscribe("sessions.abc.events").await.unwrap();

        let event = serde_json::json!({"kind": "session_created", "seq": 1});
        fanout
            .publish("sessions.abc.events", event.clone())
            .await
            .unwrap();

        assert_eq!(stream.next().await.unwrap(), event);
    }

    #[tokio::test]
    async fn hub_fanout_topics_are_isolated() {
        let fanout = HubFanout::new();
        let mut a = fanout.subscribe("sessions.a.events").await.unwrap();
        let _b = fanout.subscribe("sessions.b.events").await.unwrap();

        fanout
            .publish("sessions.a.events", serde_json::json!({"seq": 1}))
            .await
            .unwrap();
        fanout
            .publish("sessions.b.events", serde_json::json!({"seq": 9}))
            .await
            .unwrap();

        assert_eq!(a.next().await.unwrap(), serde_json::json!({"seq": 1}));
    }

    #[tokio::test]
    async fn hub_fanout_publish_without_subscribers_is_noop() {
        let fanout = HubFanout::new();
        fanout
            .publish("sessions.nobody.events", serde_json::json!({"seq": 1}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn hub_fanout_prunes_abandoned_topics() {
        let fanout = HubFanout::new();
        let stream = fanout.subscribe("sessions.gone.events").await.unwrap();
        assert_eq!(fanout.channels.read().await.len(), 1);

        drop(stream);
        fanout
            .publish("sessions.gone.events", serde_json::json!({"seq": 1}))
            .await
            .unwrap();

        assert_eq!(fanout.channels.read().await.len(), 0);
    }

    #[tokio::test]
    async fn hub_fanout_ping_is_always_healthy() {
        let fanout = HubFanout::new();
        assert!(fanout.ping().await.is_ok());
    }
}
