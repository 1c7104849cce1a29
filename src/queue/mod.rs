//! Produce/consume abstraction over a partitioned topic log.
//!
//! Delivery is at-most-once from the handler's point of view: a record whose
//! handler fails (or panics) is logged and counted as consumed. Nothing is
//! redelivered or dead-lettered, so a failing handler loses that record's work.
//!
//! Two implementations ship: [`MemoryQueue`] keeps a bounded log in process,
//! [`NatsQueue`] appends to a NATS JetStream stream.

pub mod memory;
pub mod nats;

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{QueueBackend, QueueConfig};
use crate::error::{MultigrainError, Result};
use crate::message::Message;

pub use memory::MemoryQueue;
pub use nats::NatsQueue;

/// Build the queue selected by `config.backend`. Nothing connects until `open`.
pub fn from_config(config: &QueueConfig) -> Arc<dyn JobQueue> {
    match &config.backend {
        QueueBackend::Memory => Arc::new(MemoryQueue::new(config.clone())),
        QueueBackend::Nats(nats) => {
            Arc::new(NatsQueue::new(nats.clone()).with_max_retained(config.max_retained))
        }
    }
}

/// Which side of the queue a client uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Producer,
    Consumer,
    Both,
}

impl Role {
    pub fn produces(&self) -> bool {
        matches!(self, Role::Producer | Role::Both)
    }

    pub fn consumes(&self) -> bool {
        matches!(self, Role::Consumer | Role::Both)
    }
}

#[derive(Debug, Clone)]
pub struct Record {
    pub topic: String,
    pub partition: usize,
    pub offset: u64,
    pub key: String,
    pub value: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: usize,
    pub offset: u64,
}

#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, record: Record) -> Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> RecordHandler for FnHandler<F>
where
    F: Fn(Record) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, record: Record) -> Result<()> {
        (self.0)(record).await
    }
}

/// Adapt an async closure into a [`RecordHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn RecordHandler>
where
    F: Fn(Record) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Connect the producer and/or consumer side. Must precede `put` and
    /// `subscribe`.
    async fn open(&self, role: Role) -> Result<()>;

    /// Append a serialized envelope to `topic`.
    async fn put(&self, topic: &str, message: &Message) -> Result<RecordMetadata>;

    /// Consume `topic` from its earliest retained offset, one loop per
    /// partition, awaiting `handler` for each record in offset order.
    async fn subscribe(&self, topic: &str, handler: Arc<dyn RecordHandler>)
        -> Result<Subscription>;
}

/// Running consumer loops for one `subscribe` call.
#[derive(Debug)]
pub struct Subscription {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(cancel: CancellationToken, tasks: Vec<JoinHandle<()>>) -> Self {
        Self { cancel, tasks }
    }

    /// Stop consuming. A record whose handler is already running is finished
    /// first.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Run `handler` on one record. An error or panic is logged and the record is
/// treated as consumed.
pub(crate) async fn deliver(handler: &dyn RecordHandler, record: Record) {
    let topic = record.topic.clone();
    let partition = record.partition;
    let offset = record.offset;

    let outcome = match AssertUnwindSafe(handler.handle(record)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(MultigrainError::Handler(panic_message(panic.as_ref()))),
    };
    if let Err(e) = outcome {
        tracing::error!(
            topic = %topic,
            partition,
            offset,
            error = %e,
            "Record handler failed, record will not be redelivered"
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked".to_string()
    }
}
