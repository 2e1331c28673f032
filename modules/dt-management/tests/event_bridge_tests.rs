#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dt_management::config::KafkaConfig;
use dt_management::domain::events::{DomainEvent, EventPayload};
use dt_management::infra::bridge::{BrokerPublisher, EventBridge};
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};

/// Publisher whose calls block until permits are released.
struct GatedPublisher {
    gate: Semaphore,
    entered: Notify,
    delivered: Mutex<Vec<String>>,
}

impl GatedPublisher {
    fn new() -> Self {
        Self {
            gate: Semaphore::new(0),
            entered: Notify::new(),
            delivered: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl BrokerPublisher for GatedPublisher {
    async fn publish(&self, _topic: &str, key: &str, _payload: Vec<u8>) -> anyhow::Result<()> {
        self.entered.notify_one();
        self.gate.acquire().await?.forget();
        self.delivered.lock().push(key.to_owned());
        Ok(())
    }
}

fn deleted(i: usize) -> DomainEvent {
    DomainEvent::new(format!("m{i}"), EventPayload::ModuleDeleted)
}

fn config(capacity: usize) -> KafkaConfig {
    KafkaConfig {
        queue_size: capacity,
        thread_count: 1,
        shutdown_grace: Duration::from_secs(2),
        ..KafkaConfig::default()
    }
}

#[tokio::test]
async fn blocked_workers_retain_capacity_and_drop_the_excess() {
    const CAPACITY: usize = 3;
    let publisher = Arc::new(GatedPublisher::new());
    let bridge = EventBridge::started(publisher.clone(), &config(CAPACITY));

    // the single worker takes the first event and blocks in the broker call
    let entered = publisher.entered.notified();
    bridge.publish(deleted(0));
    entered.await;

    for i in 1..=10 {
        bridge.publish(deleted(i));
    }
    assert_eq!(bridge.dropped_count(), (10 - CAPACITY) as u64);

    publisher.gate.add_permits(100);
    assert_eq!(bridge.shutdown().await, 0);

    let delivered = publisher.delivered.lock().clone();
    assert_eq!(delivered, ["m0", "m1", "m2", "m3"]);
}

#[tokio::test]
async fn events_published_before_start_are_bounded_by_capacity() {
    let publisher = Arc::new(GatedPublisher::new());
    publisher.gate.add_permits(100);
    let bridge = EventBridge::new(publisher.clone(), &config(2));

    for i in 0..5 {
        bridge.publish(deleted(i));
    }
    assert_eq!(bridge.dropped_count(), 3);

    bridge.start();
    assert_eq!(bridge.shutdown().await, 0);
    assert_eq!(publisher.delivered.lock().len(), 2);
}

#[tokio::test]
async fn shutdown_with_stuck_broker_reports_undelivered_events() {
    let publisher = Arc::new(GatedPublisher::new());
    let mut cfg = config(4);
    cfg.shutdown_grace = Duration::from_millis(100);
    let bridge = EventBridge::started(publisher.clone(), &cfg);

    let entered = publisher.entered.notified();
    bridge.publish(deleted(0));
    entered.await;
    bridge.publish(deleted(1));
    bridge.publish(deleted(2));

    assert_eq!(bridge.shutdown().await, 2);
    assert!(publisher.delivered.lock().is_empty());
}
