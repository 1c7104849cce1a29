//! [`JobQueue`] backed by a NATS JetStream stream.
//!
//! Every topic is a subject `<prefix>.<topic>` inside one stream. JetStream has
//! no partitions, so records always report partition 0 and use the stream
//! sequence (starting at 1) as their offset. Each subscription is a durable pull
//! consumer named after the stream and topic, so a restarted dispatcher resumes
//! where the previous one stopped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_nats::jetstream::consumer::{pull, AckPolicy, DeliverPolicy, PullConsumer};
use async_nats::jetstream::{self, stream};
use async_nats::{ConnectOptions, HeaderMap};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::NatsConfig;
use crate::error::{MultigrainError, Result};
use crate::message::Message;
use crate::queue::{deliver, JobQueue, Record, RecordHandler, RecordMetadata, Role, Subscription};

/// Header carrying the record key.
pub const KEY_HEADER: &str = "Multigrain-Key";

#[derive(Clone)]
struct Connection {
    context: jetstream::Context,
    stream: stream::Stream,
}

pub struct NatsQueue {
    config: NatsConfig,
    /// Per-topic message limit applied when the stream is created
    max_retained: Option<usize>,
    producer_open: AtomicBool,
    consumer_open: AtomicBool,
    connection: RwLock<Option<Connection>>,
}

impl NatsQueue {
    pub fn new(config: NatsConfig) -> Self {
        Self {
            config,
            max_retained: None,
            producer_open: AtomicBool::new(false),
            consumer_open: AtomicBool::new(false),
            connection: RwLock::new(None),
        }
    }

    pub fn with_max_retained(mut self, max_retained: Option<usize>) -> Self {
        self.max_retained = max_retained;
        self
    }

    pub fn subject(&self, topic: &str) -> String {
        format!("{}.{}", self.config.subject_prefix, topic)
    }

    /// Durable consumer name for `topic`. JetStream names cannot hold subject
    /// tokens or whitespace.
    pub fn durable_name(&self, topic: &str) -> String {
        format!("{}-{}", self.config.stream, topic)
            .chars()
            .map(|c| match c {
                '.' | '*' | '>' | '/' | '\\' => '-',
                c if c.is_whitespace() => '-',
                c => c,
            })
            .collect()
    }

    async fn connect(&self) -> Result<Connection> {
        if let Some(connection) = self.connection.read().await.as_ref() {
            return Ok(connection.clone());
        }

        let mut slot = self.connection.write().await;
        if let Some(connection) = slot.as_ref() {
            return Ok(connection.clone());
        }

        let client = ConnectOptions::new()
            .connection_timeout(self.config.connect_timeout)
            .connect(self.config.url.as_str())
            .await
            .map_err(|e| MultigrainError::Broker(format!("connect {}: {}", self.config.url, e)))?;
        let context = jetstream::new(client);

        let stream = context
            .get_or_create_stream(stream::Config {
                name: self.config.stream.clone(),
                subjects: vec![format!("{}.>", self.config.subject_prefix)],
                retention: stream::RetentionPolicy::Limits,
                max_messages_per_subject: self.max_retained.map_or(-1, |max| max as i64),
                discard: stream::DiscardPolicy::Old,
                ..Default::default()
            })
            .await
            .map_err(|e| {
                MultigrainError::Broker(format!("stream {}: {}", self.config.stream, e))
            })?;

        tracing::info!(
            url = %self.config.url,
            stream = %self.config.stream,
            "Connected to JetStream"
        );
        let connection = Connection { context, stream };
        *slot = Some(connection.clone());
        Ok(connection)
    }

    async fn open_connection(&self, error: fn(String) -> MultigrainError) -> Result<Connection> {
        match self.connection.read().await.as_ref() {
            Some(connection) => Ok(connection.clone()),
            None => Err(error("broker connection is not open".to_string())),
        }
    }
}

#[async_trait]
impl JobQueue for NatsQueue {
    async fn open(&self, role: Role) -> Result<()> {
        self.connect().await?;
        if role.produces() {
            self.producer_open.store(true, Ordering::SeqCst);
        }
        if role.consumes() {
            self.consumer_open.store(true, Ordering::SeqCst);
        }
        tracing::info!(role = ?role, stream = %self.config.stream, "Queue opened");
        Ok(())
    }

    async fn put(&self, topic: &str, message: &Message) -> Result<RecordMetadata> {
        if !self.producer_open.load(Ordering::SeqCst) {
            return Err(MultigrainError::Publish(
                "producer connection is not open".to_string(),
            ));
        }
        let connection = self.open_connection(MultigrainError::Publish).await?;

        let value = message.to_vec()?;
        let key = Uuid::new_v4().to_string();
        let mut headers = HeaderMap::new();
        headers.insert(KEY_HEADER, key.as_str());

        let subject = self.subject(topic);
        let ack = connection
            .context
            .publish_with_headers(subject.clone(), headers, value.into())
            .await
            .map_err(|e| MultigrainError::Publish(e.to_string()))?
            .await
            .map_err(|e| MultigrainError::Publish(e.to_string()))?;

        tracing::debug!(subject = %subject, offset = ack.sequence, "Record published");
        Ok(RecordMetadata {
            topic: topic.to_string(),
            partition: 0,
            offset: ack.sequence,
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
        let connection = self.open_connection(MultigrainError::Subscribe).await?;

        let durable = self.durable_name(topic);
        let consumer: PullConsumer = connection
            .stream
            .get_or_create_consumer(
                &durable,
                pull::Config {
                    durable_name: Some(durable.clone()),
                    filter_subject: self.subject(topic),
                    deliver_policy: DeliverPolicy::All,
                    ack_policy: AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| MultigrainError::Subscribe(e.to_string()))?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(consume(
            topic.to_string(),
            consumer,
            handler,
            cancel.clone(),
        ));

        tracing::info!(topic, consumer = %durable, "Subscribed");
        Ok(Subscription::new(cancel, vec![task]))
    }
}

async fn consume(
    topic: String,
    consumer: PullConsumer,
    handler: Arc<dyn RecordHandler>,
    cancel: CancellationToken,
) {
    let mut messages = match consumer.messages().await {
        Ok(messages) => messages,
        Err(e) => {
            tracing::error!(topic = %topic, error = %e, "Failed to open consumer stream");
            return;
        }
    };

    loop {
        let next = tokio::select! {
            next = messages.next() => next,
            _ = cancel.cancelled() => break,
        };
        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                tracing::warn!(topic = %topic, error = %e, "Consumer stream error");
                continue;
            }
            None => break,
        };

        // Acknowledged before handling: a record is never redelivered.
        if let Err(e) = message.ack().await {
            tracing::warn!(topic = %topic, error = %e, "Failed to ack record");
        }

        let (offset, timestamp) = match message.info() {
            Ok(info) => (
                info.stream_sequence,
                DateTime::from_timestamp_nanos(info.published.unix_timestamp_nanos() as i64),
            ),
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "Record without delivery info");
                (0, Utc::now())
            }
        };
        let key = message
            .headers
            .as_ref()
            .and_then(|headers| headers.get(KEY_HEADER))
            .map(|value| value.as_str().to_string())
            .unwrap_or_default();

        let record = Record {
            topic: topic.clone(),
            partition: 0,
            offset,
            key,
            value: message.payload.to_vec(),
            timestamp,
        };
        deliver(handler.as_ref(), record).await;
    }

    tracing::debug!(topic = %topic, "Consumer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> NatsQueue {
        NatsQueue::new(NatsConfig::default())
    }

    #[test]
    fn topics_map_to_prefixed_subjects() {
        assert_eq!(queue().subject("ingress"), "multigrain.ingress");
        let custom = NatsQueue::new(NatsConfig {
            subject_prefix: "ovens".to_string(),
            ..NatsConfig::default()
        });
        assert_eq!(custom.subject("jobs.v2"), "ovens.jobs.v2");
    }

    #[test]
    fn durable_names_drop_subject_tokens() {
        assert_eq!(queue().durable_name("ingress"), "MULTIGRAIN-ingress");
        assert_eq!(queue().durable_name("jobs.v2 *"), "MULTIGRAIN-jobs-v2--");
        assert_eq!(queue().durable_name("a>b"), "MULTIGRAIN-a-b");
    }
}
