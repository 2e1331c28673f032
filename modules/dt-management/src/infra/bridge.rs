//! Outbound event bridge: domain events to the message broker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::relay::{BoundedRelay, RelayHandler};
use crate::config::KafkaConfig;
use crate::domain::events::DomainEvent;

/// Broker client used by the bridge workers.
#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    /// Publishes one serialized event on `topic`, keyed by module id.
    ///
    /// # Errors
    /// Any transport or broker failure.
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> anyhow::Result<()>;
}

struct PublishHandler {
    publisher: Arc<dyn BrokerPublisher>,
}

#[async_trait]
impl RelayHandler<DomainEvent> for PublishHandler {
    async fn handle(&self, event: DomainEvent) {
        let payload = match event.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(topic = event.topic(), module_id = %event.module_id, error = %e, "failed to serialize event");
                return;
            }
        };
        match self
            .publisher
            .publish(event.topic(), &event.module_id, payload)
            .await
        {
            Ok(()) => {
                tracing::debug!(topic = event.topic(), module_id = %event.module_id, "event published");
            }
            Err(e) => {
                tracing::error!(topic = event.topic(), module_id = %event.module_id, error = %e, "failed to publish event");
            }
        }
    }
}

/// Relays domain events to the broker through a bounded queue.
///
/// `publish` never blocks and never fails; overflow and broker errors are logged.
pub struct EventBridge {
    relay: BoundedRelay<DomainEvent>,
    shutdown_grace: Duration,
}

impl EventBridge {
    /// Creates a bridge whose workers are not yet running.
    #[must_use]
    pub fn new(publisher: Arc<dyn BrokerPublisher>, cfg: &KafkaConfig) -> Self {
        Self {
            relay: BoundedRelay::new(
                "event-bridge",
                cfg.queue_size,
                cfg.thread_count,
                Arc::new(PublishHandler { publisher }),
            ),
            shutdown_grace: cfg.shutdown_grace,
        }
    }

    /// Creates a bridge and starts its workers.
    #[must_use]
    pub fn started(publisher: Arc<dyn BrokerPublisher>, cfg: &KafkaConfig) -> Self {
        let bridge = Self::new(publisher, cfg);
        bridge.start();
        bridge
    }

    pub fn start(&self) {
        self.relay.start();
    }

    pub fn publish(&self, event: DomainEvent) {
        let topic = event.topic();
        if !self.relay.offer(event) {
            tracing::error!(topic, "event dropped");
        }
    }

    /// Events dropped because the queue was full.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.relay.dropped_count()
    }

    /// Stops accepting events and drains; returns the number of undelivered events.
    pub async fn shutdown(&self) -> usize {
        self.relay.shutdown(self.shutdown_grace).await
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::domain::events::{EventPayload, ModuleDetails};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<(String, String, serde_json::Value)>>,
        fail: bool,
    }

    #[async_trait]
    impl BrokerPublisher for Recording {
        async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("broker down");
            }
            let value = serde_json::from_slice(&payload)?;
            self.sent
                .lock()
                .push((topic.to_owned(), key.to_owned(), value));
            Ok(())
        }
    }

    fn created(id: &str) -> DomainEvent {
        DomainEvent::new(
            id,
            EventPayload::ModuleCreated(ModuleDetails {
                module_id: id.to_owned(),
                name: "Robot".to_owned(),
                endpoint: None,
            }),
        )
    }

    #[tokio::test]
    async fn events_are_published_on_their_topic() {
        let publisher = Arc::new(Recording::default());
        let bridge = EventBridge::started(publisher.clone(), &KafkaConfig::default());
        bridge.publish(created("m1"));
        bridge.publish(DomainEvent::new("m1", EventPayload::ModuleDeleted));
        assert_eq!(bridge.shutdown().await, 0);

        let sent = publisher.sent.lock().clone();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(_, key, _)| key == "m1"));
        let topics: Vec<_> = sent.iter().map(|(t, _, _)| t.as_str()).collect();
        assert!(topics.contains(&"modapto-module-creation"));
        assert!(topics.contains(&"modapto-module-deletion"));
    }

    #[tokio::test]
    async fn broker_failures_are_not_surfaced() {
        let publisher = Arc::new(Recording {
            fail: true,
            ..Recording::default()
        });
        let bridge = EventBridge::started(publisher.clone(), &KafkaConfig::default());
        bridge.publish(created("m1"));
        assert_eq!(bridge.shutdown().await, 0);
        assert!(publisher.sent.lock().is_empty());
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn undelivered_events_are_reported_on_shutdown() {
        let bridge = EventBridge::new(Arc::new(Recording::default()), &KafkaConfig::default());
        bridge.publish(created("m1"));
        bridge.publish(created("m2"));
        assert_eq!(bridge.shutdown().await, 2);
        assert!(logs_contain("undelivered"));
    }
}
