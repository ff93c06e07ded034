use crate::config::{Config, PartitionAssignment};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use kafka::consumer::{Consumer, FetchOffset, GroupOffsetStorage};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub value: Vec<u8>,
}

/// Offset of the last message handled in a partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Position {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

#[async_trait]
pub trait MessageSource: Send {
    /// Waits up to the configured fetch time; an empty vec means no traffic.
    async fn poll(&mut self) -> Result<Vec<InboundMessage>>;
    async fn commit(&mut self, positions: &[Position]) -> Result<()>;
}

/// Group-offset consumer on the blocking `kafka` client; every broker call
/// runs on the blocking pool. Offsets are stored under the group, but the
/// client does not take part in rebalances, so partitions are assigned
/// statically through `KAFKA_PARTITIONS`.
pub struct KafkaSource {
    consumer: Arc<Mutex<Consumer>>,
}

impl KafkaSource {
    pub async fn connect(config: &Config) -> Result<Self> {
        let hosts = config.kafka_brokers.clone();
        let topic = config.kafka_topic.clone();
        let group = config.kafka_group_id.clone();
        let client_id = config.kafka_client_id.clone();
        let partitions = topic_partitions(&config.kafka_partitions)?;
        let fetch_wait = config.poll_timeout();
        let idle_timeout = config.session_timeout();

        let consumer = tokio::task::spawn_blocking(move || {
            let builder = Consumer::from_hosts(hosts);
            let builder = match partitions.as_deref() {
                Some(partitions) => builder.with_topic_partitions(topic, partitions),
                None => builder.with_topic(topic),
            };
            builder
                .with_group(group)
                .with_client_id(client_id)
                .with_fallback_offset(FetchOffset::Earliest)
                .with_offset_storage(Some(GroupOffsetStorage::Kafka))
                .with_fetch_max_wait_time(fetch_wait)
                .with_connection_idle_timeout(idle_timeout.max(Duration::from_secs(1)))
                .create()
        })
        .await
        .context("kafka connect task panicked")?
        .context("failed to create kafka consumer")?;

        Ok(Self {
            consumer: Arc::new(Mutex::new(consumer)),
        })
    }
}

/// `None` reads every partition of the topic. An unassigned instance is
/// refused: two of them in one group would both read everything.
fn topic_partitions(assignment: &PartitionAssignment) -> Result<Option<Vec<i32>>> {
    match assignment {
        PartitionAssignment::Unassigned => Err(anyhow!(
            "KAFKA_PARTITIONS is required: list this instance's partitions, or `all` for a single instance"
        )),
        PartitionAssignment::All => Ok(None),
        PartitionAssignment::Only(partitions) => Ok(Some(partitions.clone())),
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn poll(&mut self) -> Result<Vec<InboundMessage>> {
        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || {
            let mut consumer = consumer
                .lock()
                .map_err(|_| anyhow!("kafka consumer lock poisoned"))?;
            let sets = consumer.poll().context("kafka poll failed")?;
            let mut messages = Vec::new();
            for set in sets.iter() {
                for message in set.messages() {
                    let key = if message.key.is_empty() {
                        None
                    } else {
                        Some(String::from_utf8_lossy(message.key).into_owned())
                    };
                    messages.push(InboundMessage {
                        topic: set.topic().to_string(),
                        partition: set.partition(),
                        offset: message.offset,
                        key,
                        value: message.value.to_vec(),
                    });
                }
            }
            Ok(messages)
        })
        .await
        .context("kafka poll task panicked")?
    }

    async fn commit(&mut self, positions: &[Position]) -> Result<()> {
        if positions.is_empty() {
            return Ok(());
        }
        let consumer = self.consumer.clone();
        let positions = positions.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut consumer = consumer
                .lock()
                .map_err(|_| anyhow!("kafka consumer lock poisoned"))?;
            for position in &positions {
                consumer
                    .consume_message(&position.topic, position.partition, position.offset)
                    .with_context(|| {
                        format!(
                            "failed to mark {}:{}@{} consumed",
                            position.topic, position.partition, position.offset
                        )
                    })?;
            }
            consumer
                .commit_consumed()
                .context("failed to commit kafka offsets")
        })
        .await
        .context("kafka commit task panicked")?
    }
}
