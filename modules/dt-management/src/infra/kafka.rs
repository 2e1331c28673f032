//! Kafka publisher backed by `rskafka`.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rskafka::client::partition::{Compression, PartitionClient, UnknownTopicHandling};
use rskafka::client::{Client, ClientBuilder};
use rskafka::record::Record;
use tokio::sync::OnceCell;

use super::bridge::BrokerPublisher;

const PARTITION: i32 = 0;
const TOPIC_PARTITIONS: i32 = 1;
const TOPIC_REPLICATION: i16 = 1;
const TOPIC_CREATE_TIMEOUT_MS: i32 = 5_000;

/// Publishes to partition 0 of each topic; connects lazily on first use.
pub struct KafkaPublisher {
    bootstrap_servers: Vec<String>,
    client: OnceCell<Client>,
    partitions: DashMap<String, Arc<PartitionClient>>,
}

impl KafkaPublisher {
    #[must_use]
    pub fn new(bootstrap_servers: Vec<String>) -> Self {
        Self {
            bootstrap_servers,
            client: OnceCell::new(),
            partitions: DashMap::new(),
        }
    }

    async fn client(&self) -> anyhow::Result<&Client> {
        self.client
            .get_or_try_init(|| async {
                let client = ClientBuilder::new(self.bootstrap_servers.clone())
                    .build()
                    .await
                    .with_context(|| {
                        format!("failed to connect to kafka at {:?}", self.bootstrap_servers)
                    })?;
                tracing::info!(servers = ?self.bootstrap_servers, "connected to kafka");
                Ok(client)
            })
            .await
    }

    async fn partition(&self, topic: &str) -> anyhow::Result<Arc<PartitionClient>> {
        if let Some(existing) = self.partitions.get(topic) {
            return Ok(Arc::clone(existing.value()));
        }
        let client = self.client().await?;

        // topics may not exist yet; creation failures (usually "already exists") are benign
        match client.controller_client() {
            Ok(controller) => {
                if let Err(e) = controller
                    .create_topic(
                        topic,
                        TOPIC_PARTITIONS,
                        TOPIC_REPLICATION,
                        TOPIC_CREATE_TIMEOUT_MS,
                    )
                    .await
                {
                    tracing::trace!(topic, error = %e, "create topic skipped");
                }
            }
            Err(e) => tracing::debug!(error = %e, "kafka controller client unavailable"),
        }

        let partition = client
            .partition_client(topic.to_owned(), PARTITION, UnknownTopicHandling::Retry)
            .await
            .with_context(|| format!("failed to open kafka topic '{topic}'"))?;
        let partition = Arc::new(partition);
        self.partitions
            .insert(topic.to_owned(), Arc::clone(&partition));
        Ok(partition)
    }
}

#[async_trait]
impl BrokerPublisher for KafkaPublisher {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        let partition = self.partition(topic).await?;
        let record = Record {
            key: Some(key.as_bytes().to_vec()),
            value: Some(payload),
            headers: BTreeMap::new(),
            timestamp: Utc::now(),
        };
        partition
            .produce(vec![record], Compression::NoCompression)
            .await
            .with_context(|| format!("failed to produce to kafka topic '{topic}'"))?;
        Ok(())
    }
}
