use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{MultigrainError, Result};
use crate::message::Message;
use crate::queue::{deliver, JobQueue, Record, RecordHandler, RecordMetadata, Role, Subscription};

/// Retained suffix of a partition. Offsets below `base` have been trimmed.
#[derive(Default)]
struct PartitionLog {
    base: u64,
    records: VecDeque<Record>,
}

impl PartitionLog {
    fn next_offset(&self) -> u64 {
        self.base + self.records.len() as u64
    }

    fn get(&self, offset: u64) -> Option<&Record> {
        let index = offset.checked_sub(self.base)?;
        self.records.get(index as usize)
    }

    /// Drop the oldest records while more than `max` remain, never past `floor`.
    fn trim(&mut self, max: usize, floor: u64) -> usize {
        let mut dropped = 0;
        while self.records.len() > max && self.base < floor {
            self.records.pop_front();
            self.base += 1;
            dropped += 1;
        }
        dropped
    }
}

struct Partition {
    log: RwLock<PartitionLog>,
    /// Consumer id -> next offset that consumer will read
    cursors: Mutex<HashMap<u64, u64>>,
    /// Next offset to be written; bumped after every append
    high_water: watch::Sender<u64>,
}

impl Partition {
    fn new() -> Self {
        let (high_water, _) = watch::channel(0);
        Self {
            log: RwLock::new(PartitionLog::default()),
            cursors: Mutex::new(HashMap::new()),
            high_water,
        }
    }

    /// Register a consumer at the earliest retained offset.
    async fn attach(&self, consumer: u64) -> u64 {
        let log = self.log.write().await;
        self.cursors.lock().await.insert(consumer, log.base);
        log.base
    }

    async fn detach(&self, consumer: u64) {
        self.cursors.lock().await.remove(&consumer);
    }

    /// Record that `consumer` has taken everything below `next`, then trim.
    async fn advance(&self, consumer: u64, next: u64, max_retained: Option<usize>) -> usize {
        let mut log = self.log.write().await;
        let mut cursors = self.cursors.lock().await;
        cursors.insert(consumer, next);
        match max_retained {
            Some(max) => trim(&mut log, &cursors, max),
            None => 0,
        }
    }
}

/// Trim `log` to `max` records without dropping anything a consumer still needs.
/// Lock order is log, then cursors.
fn trim(log: &mut PartitionLog, cursors: &HashMap<u64, u64>, max: usize) -> usize {
    let floor = cursors
        .values()
        .copied()
        .min()
        .unwrap_or_else(|| log.next_offset());
    log.trim(max, floor)
}

struct Topic {
    name: String,
    partitions: Vec<Partition>,
}

/// In-process [`JobQueue`].
///
/// Each partition keeps at most `max_retained` records once every attached
/// consumer has read past them. A consumer that lags keeps the records it has
/// not yet read, so the bound can be exceeded while it catches up.
pub struct MemoryQueue {
    config: QueueConfig,
    producer_open: AtomicBool,
    consumer_open: AtomicBool,
    next_consumer: AtomicU64,
    topics: RwLock<HashMap<String, Arc<Topic>>>,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl MemoryQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            producer_open: AtomicBool::new(false),
            consumer_open: AtomicBool::new(false),
            next_consumer: AtomicU64::new(0),
            topics: RwLock::new(HashMap::new()),
        }
    }

    async fn topic(&self, name: &str) -> Arc<Topic> {
        if let Some(topic) = self.topics.read().await.get(name) {
            return topic.clone();
        }

        let partitions = self.config.partitions.max(1);
        self.topics
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(topic = name, partitions, "Topic created");
                Arc::new(Topic {
                    name: name.to_string(),
                    partitions: (0..partitions).map(|_| Partition::new()).collect(),
                })
            })
            .clone()
    }

    /// Number of records retained in `topic` across all partitions.
    pub async fn len(&self, topic: &str) -> usize {
        let Some(topic) = self.topics.read().await.get(topic).cloned() else {
            return 0;
        };
        let mut total = 0;
        for partition in &topic.partitions {
            total += partition.log.read().await.records.len();
        }
        total
    }

    pub async fn is_empty(&self, topic: &str) -> bool {
        self.len(topic).await == 0
    }
}

fn partition_for(key: &str, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions as u64) as usize
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn open(&self, role: Role) -> Result<()> {
        if role.produces() {
            self.producer_open.store(true, Ordering::SeqCst);
        }
        if role.consumes() {
            self.consumer_open.store(true, Ordering::SeqCst);
        }
        tracing::info!(role = ?role, "Queue opened");
        Ok(())
    }

    async fn put(&self, topic: &str, message: &Message) -> Result<RecordMetadata> {
        if !self.producer_open.load(Ordering::SeqCst) {
            return Err(MultigrainError::Publish(
                "producer connection is not open".to_string(),
            ));
        }

        let value = message.to_vec()?;
        let topic = self.topic(topic).await;
        let key = Uuid::new_v4().to_string();
        let index = partition_for(&key, topic.partitions.len());
        let partition = &topic.partitions[index];

        let (offset, trimmed) = {
            let mut log = partition.log.write().await;
            let offset = log.next_offset();
            log.records.push_back(Record {
                topic: topic.name.clone(),
                partition: index,
                offset,
                key,
                value,
                timestamp: Utc::now(),
            });
            let trimmed = match self.config.max_retained {
                Some(max) => trim(&mut log, &*partition.cursors.lock().await, max),
                None => 0,
            };
            (offset, trimmed)
        };
        partition.high_water.send_replace(offset + 1);

        tracing::debug!(
            topic = %topic.name,
            partition = index,
            offset,
            trimmed,
            "Record published"
        );
        Ok(RecordMetadata {
            topic: topic.name.clone(),
            partition: index,
            offset,
        })
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn RecordHandler>,
    ) -> Result<Subscription> {
        if !self.consumer_open.load(Ordering::SeqCst) {
            return Err(MultigrainError::Subscribe(
                "consumer connection is not open".to_string(),
            ));
        }

        let topic = self.topic(topic).await;
        let consumer = self.next_consumer.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let mut tasks = Vec::with_capacity(topic.partitions.len());
        for (index, partition) in topic.partitions.iter().enumerate() {
            let start = partition.attach(consumer).await;
            let consumer = Consumer {
                id: consumer,
                topic: topic.clone(),
                index,
                max_retained: self.config.max_retained,
            };
            let handler = handler.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                consumer.run(start, handler, cancel).await
            }));
        }

        tracing::info!(
            topic = %topic.name,
            partitions = topic.partitions.len(),
            consumer,
            "Subscribed"
        );
        Ok(Subscription::new(cancel, tasks))
    }
}

struct Consumer {
    id: u64,
    topic: Arc<Topic>,
    index: usize,
    max_retained: Option<usize>,
}

impl Consumer {
    async fn run(self, mut offset: u64, handler: Arc<dyn RecordHandler>, cancel: CancellationToken) {
        let partition = &self.topic.partitions[self.index];
        let mut high_water = partition.high_water.subscribe();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let record = partition.log.read().await.get(offset).cloned();
            let Some(record) = record else {
                tokio::select! {
                    changed = high_water.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
                continue;
            };
            offset += 1;

            let trimmed = partition.advance(self.id, offset, self.max_retained).await;
            if trimmed > 0 {
                tracing::trace!(
                    topic = %self.topic.name,
                    partition = self.index,
                    trimmed,
                    "Partition log trimmed"
                );
            }
            deliver(handler.as_ref(), record).await;
        }

        partition.detach(self.id).await;
        tracing::debug!(topic = %self.topic.name, partition = self.index, "Consumer stopped");
    }
}
