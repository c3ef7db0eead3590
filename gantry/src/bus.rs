//! Publish/subscribe façade over a Kafka cluster.
//!
//! The bus hides the broker client behind a small surface: a round-robin
//! producer with counted sends, consumer groups that auto-commit once per
//! second and deliver either per message or in timed batches, cluster
//! metadata lookup, and a stats snapshot. A consumer read failure is
//! terminal for that subscription; re-subscribing is the caller's call.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rdkafka::ClientConfig;
use rdkafka::Message;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use serde::Serialize;
use tracing::{error, info};

use crate::errors::{Error, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// A message to publish or a message delivered to a subscriber.
#[derive(Debug, Clone, Default)]
pub struct BusMessage {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

pub type BusHandler = Arc<dyn Fn(Vec<BusMessage>) + Send + Sync>;

/// Stats snapshot: broker address, timeout, counters, start time.
#[derive(Debug, Clone, Serialize)]
pub struct MessageStats {
    pub brokers: String,
    #[serde(rename = "timeoutSeconds")]
    pub timeout_seconds: u64,
    pub sent: u64,
    pub received: u64,
    #[serde(rename = "startEpoch")]
    pub start_epoch: i64,
}

/// Partition metadata returned by [`MessageBus::cluster_info`].
#[derive(Debug, Clone, Serialize)]
pub struct PartitionInfo {
    pub topic: String,
    pub id: i32,
    pub leader: i32,
    pub replicas: Vec<i32>,
    pub isr: Vec<i32>,
}

pub struct MessageBus {
    brokers: String,
    timeout: Duration,
    producer: FutureProducer,
    sent: AtomicU64,
    received: Arc<AtomicU64>,
    start_epoch: i64,
}

impl MessageBus {
    /// Dial the broker cluster (comma-separated endpoints). The timeout
    /// defaults to 20 s and bounds dialing, producing, and metadata calls.
    pub fn create(brokers: &str, timeout: Option<Duration>) -> Result<Self> {
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            // partitioner default is effectively round robin for unkeyed sends
            .create()
            .map_err(|err| Error::Broker(err.to_string()))?;
        info!(%brokers, "message bus connected");
        Ok(MessageBus {
            brokers: brokers.to_string(),
            timeout,
            producer,
            sent: AtomicU64::new(0),
            received: Arc::new(AtomicU64::new(0)),
            start_epoch: chrono::Utc::now().timestamp_millis(),
        })
    }

    /// Publish one or more messages. At least one is required.
    pub async fn send(&self, messages: &[BusMessage]) -> Result<()> {
        if messages.is_empty() {
            return Err(Error::EmptyBatch);
        }
        self.sent.fetch_add(messages.len() as u64, Ordering::Relaxed);
        for message in messages {
            let mut record: FutureRecord<'_, String, Vec<u8>> = FutureRecord::to(&message.topic).payload(&message.payload);
            if let Some(key) = &message.key {
                record = record.key(key);
            }
            self.producer
                .send(record, self.timeout)
                .await
                .map_err(|(err, _)| Error::Broker(err.to_string()))?;
        }
        Ok(())
    }

    /// Start a consumer group member on `topic`. With `batch_window = 0`
    /// the handler fires per message; otherwise messages accumulate and the
    /// handler fires once per window with the non-empty batch. Offsets
    /// auto-commit once per second.
    pub fn subscribe(&self, topic: &str, group_id: &str, batch_window: Duration, handler: BusHandler) -> Result<()> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "true")
            .set("auto.commit.interval.ms", "1000")
            .set("session.timeout.ms", "6000")
            .create()
            .map_err(|err| Error::Broker(err.to_string()))?;
        consumer
            .subscribe(&[topic])
            .map_err(|err| Error::Broker(err.to_string()))?;

        let received = self.received.clone();
        let topic = topic.to_string();
        tokio::spawn(async move {
            let mut batcher = Batcher::new(batch_window);
            let mut flush = tokio::time::interval(if batch_window.is_zero() {
                Duration::from_secs(3600)
            } else {
                batch_window
            });
            flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    incoming = consumer.recv() => {
                        let message = match incoming {
                            Ok(message) => message,
                            Err(err) => {
                                // terminal for this subscription
                                error!(%topic, %err, "consumer read failed, subscription ends");
                                return;
                            }
                        };
                        received.fetch_add(1, Ordering::Relaxed);
                        let delivered = BusMessage {
                            topic: message.topic().to_string(),
                            key: message.key().map(|k| String::from_utf8_lossy(k).into_owned()),
                            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                        };
                        if let Some(batch) = batcher.push(delivered) {
                            handler(batch);
                        }
                    }
                    _ = flush.tick() => {
                        if let Some(batch) = batcher.drain() {
                            handler(batch);
                        }
                    }
                }
            }
        });
        Ok(())
    }

    /// Partition metadata for the whole cluster, bounded by the configured
    /// timeout.
    pub fn cluster_info(&self) -> Result<Vec<PartitionInfo>> {
        let metadata = self
            .producer
            .client()
            .fetch_metadata(None, self.timeout)
            .map_err(|err| Error::Broker(err.to_string()))?;
        let mut partitions = Vec::new();
        for topic in metadata.topics() {
            for partition in topic.partitions() {
                partitions.push(PartitionInfo {
                    topic: topic.name().to_string(),
                    id: partition.id(),
                    leader: partition.leader(),
                    replicas: partition.replicas().to_vec(),
                    isr: partition.isr().to_vec(),
                });
            }
        }
        Ok(partitions)
    }

    pub fn stats(&self) -> MessageStats {
        MessageStats {
            brokers: self.brokers.clone(),
            timeout_seconds: self.timeout.as_secs(),
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            start_epoch: self.start_epoch,
        }
    }
}

/// Accumulates messages for windowed delivery. With a zero window every
/// message flushes immediately; otherwise only the timer drains, and only
/// when something accumulated.
struct Batcher {
    window: Duration,
    pending: Vec<BusMessage>,
}

impl Batcher {
    fn new(window: Duration) -> Self {
        Batcher {
            window,
            pending: Vec::new(),
        }
    }

    fn push(&mut self, message: BusMessage) -> Option<Vec<BusMessage>> {
        if self.window.is_zero() {
            return Some(vec![message]);
        }
        self.pending.push(message);
        None
    }

    fn drain(&mut self) -> Option<Vec<BusMessage>> {
        if self.pending.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.pending))
    }
}
