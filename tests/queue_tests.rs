
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::Notify;

use multigrain::config::{NatsConfig, QueueBackend, QueueConfig};
use multigrain::error::MultigrainError;
use multigrain::message::{Message, MessageBody, MessageHeader};
use multigrain::queue::{self, handler_fn, JobQueue, MemoryQueue, NatsQueue, Record, Role};
use test_harness::assert_eventually;

const TOPIC: &str = "ingress";

fn message(n: u64) -> Message {
    let header = MessageHeader::new(&format!("urn:test:{}", n), "create", "cook.job").unwrap();
    Message::new(header, MessageBody::new(json!({ "n": n })))
}

fn collecting() -> (Arc<Mutex<Vec<Record>>>, Arc<dyn multigrain::queue::RecordHandler>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler = handler_fn(move |record: Record| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(record);
            Ok(())
        }
    });
    (seen, handler)
}

#[tokio::test]
async fn test_put_requires_open_producer() {
    let queue = MemoryQueue::default();
    assert!(matches!(
        queue.put(TOPIC, &message(0)).await,
        Err(MultigrainError::Publish(_))
    ));

    queue.open(Role::Consumer).await.unwrap();
    assert!(matches!(
        queue.put(TOPIC, &message(0)).await,
        Err(MultigrainError::Publish(_))
    ));
}

#[tokio::test]
async fn test_subscribe_requires_open_consumer() {
    let queue = MemoryQueue::default();
    queue.open(Role::Producer).await.unwrap();

    let (_, handler) = collecting();
    assert!(matches!(
        queue.subscribe(TOPIC, handler).await,
        Err(MultigrainError::Subscribe(_))
    ));
}

#[tokio::test]
async fn test_put_assigns_sequential_offsets() {
    let queue = MemoryQueue::default();
    queue.open(Role::Producer).await.unwrap();

    for expected in 0..3 {
        let metadata = queue.put(TOPIC, &message(expected)).await.unwrap();
        assert_eq!(metadata.topic, TOPIC);
        assert_eq!(metadata.partition, 0);
        assert_eq!(metadata.offset, expected);
    }
    assert_eq!(queue.len(TOPIC).await, 3);
    assert!(queue.is_empty("other").await);
}

#[tokio::test]
async fn test_consumer_reads_from_earliest_in_order() {
    let queue = MemoryQueue::default();
    queue.open(Role::Both).await.unwrap();

    for n in 0..3 {
        queue.put(TOPIC, &message(n)).await.unwrap();
    }

    let (seen, handler) = collecting();
    let subscription = queue.subscribe(TOPIC, handler).await.unwrap();

    for n in 3..5 {
        queue.put(TOPIC, &message(n)).await.unwrap();
    }

    let observed = seen.clone();
    assert_eventually(
        || {
            let observed = observed.clone();
            async move { observed.lock().unwrap().len() == 5 }
        },
        Duration::from_secs(2),
        "all records should be delivered",
    )
    .await;

    let records = seen.lock().unwrap().clone();
    let offsets: Vec<u64> = records.iter().map(|r| r.offset).collect();
    assert_eq!(offsets, vec![0, 1, 2, 3, 4]);

    let decoded: Vec<u64> = records
        .iter()
        .map(|r| Message::from_slice(&r.value).unwrap().payload["n"].as_u64().unwrap())
        .collect();
    assert_eq!(decoded, vec![0, 1, 2, 3, 4]);
    assert!(records.iter().all(|r| !r.key.is_empty()));

    subscription.shutdown().await;
}

#[tokio::test]
async fn test_failed_handler_does_not_stop_consumer() {
    let queue = MemoryQueue::default();
    queue.open(Role::Both).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler = handler_fn(move |record: Record| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(record.offset);
            if record.offset == 0 {
                return Err(MultigrainError::Handler("boom".to_string()));
            }
            Ok(())
        }
    });
    let subscription = queue.subscribe(TOPIC, handler).await.unwrap();

    for n in 0..3 {
        queue.put(TOPIC, &message(n)).await.unwrap();
    }

    let observed = seen.clone();
    assert_eventually(
        || {
            let observed = observed.clone();
            async move { observed.lock().unwrap().len() == 3 }
        },
        Duration::from_secs(2),
        "records after a failure should still be delivered",
    )
    .await;

    // The failed record is not redelivered.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);

    subscription.shutdown().await;
}

#[tokio::test]
async fn test_partitions_all_consumed() {
    let queue = MemoryQueue::new(QueueConfig {
        partitions: 4,
        ..QueueConfig::default()
    });
    queue.open(Role::Both).await.unwrap();

    let (seen, handler) = collecting();
    let subscription = queue.subscribe(TOPIC, handler).await.unwrap();

    for n in 0..20 {
        let metadata = queue.put(TOPIC, &message(n)).await.unwrap();
        assert!(metadata.partition < 4);
    }

    let observed = seen.clone();
    assert_eventually(
        || {
            let observed = observed.clone();
            async move { observed.lock().unwrap().len() == 20 }
        },
        Duration::from_secs(2),
        "every partition should be consumed",
    )
    .await;

    // Offsets are per partition and increase within each.
    let records = seen.lock().unwrap().clone();
    for partition in 0..4 {
        let offsets: Vec<u64> = records
            .iter()
            .filter(|r| r.partition == partition)
            .map(|r| r.offset)
            .collect();
        let expected: Vec<u64> = (0..offsets.len() as u64).collect();
        assert_eq!(offsets, expected);
    }

    subscription.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_delivery() {
    let queue = MemoryQueue::default();
    queue.open(Role::Both).await.unwrap();

    let (seen, handler) = collecting();
    let subscription = queue.subscribe(TOPIC, handler).await.unwrap();
    queue.put(TOPIC, &message(0)).await.unwrap();

    let observed = seen.clone();
    assert_eventually(
        || {
            let observed = observed.clone();
            async move { observed.lock().unwrap().len() == 1 }
        },
        Duration::from_secs(2),
        "first record should be delivered",
    )
    .await;

    subscription.shutdown().await;
    queue.put(TOPIC, &message(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(queue.len(TOPIC).await, 2);
}

#[tokio::test]
async fn test_panicking_handler_does_not_stop_consumer() {
    let queue = MemoryQueue::default();
    queue.open(Role::Both).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler = handler_fn(move |record: Record| {
        let sink = sink.clone();
        async move {
            if record.offset == 0 {
                panic!("handler blew up");
            }
            sink.lock().unwrap().push(record.offset);
            Ok(())
        }
    });
    let subscription = queue.subscribe(TOPIC, handler).await.unwrap();

    queue.put(TOPIC, &message(0)).await.unwrap();
    queue.put(TOPIC, &message(1)).await.unwrap();

    let observed = seen.clone();
    assert_eventually(
        || {
            let observed = observed.clone();
            async move { *observed.lock().unwrap() == vec![1] }
        },
        Duration::from_secs(2),
        "record after a panic should still be delivered",
    )
    .await;

    subscription.shutdown().await;
}

fn retaining(max: usize) -> MemoryQueue {
    MemoryQueue::new(QueueConfig {
        max_retained: Some(max),
        ..QueueConfig::default()
    })
}

#[tokio::test]
async fn test_retention_trims_log_without_consumers() {
    let queue = retaining(3);
    queue.open(Role::Both).await.unwrap();

    for n in 0..10 {
        let metadata = queue.put(TOPIC, &message(n)).await.unwrap();
        assert_eq!(metadata.offset, n);
    }
    assert_eq!(queue.len(TOPIC).await, 3);

    let (seen, handler) = collecting();
    let subscription = queue.subscribe(TOPIC, handler).await.unwrap();

    let observed = seen.clone();
    assert_eventually(
        || {
            let observed = observed.clone();
            async move { observed.lock().unwrap().len() == 3 }
        },
        Duration::from_secs(2),
        "retained records should be delivered",
    )
    .await;

    let offsets: Vec<u64> = seen.lock().unwrap().iter().map(|r| r.offset).collect();
    assert_eq!(offsets, vec![7, 8, 9]);

    subscription.shutdown().await;
}

#[tokio::test]
async fn test_retention_keeps_records_a_lagging_consumer_needs() {
    let queue = retaining(3);
    queue.open(Role::Both).await.unwrap();

    let entered = Arc::new(AtomicBool::new(false));
    let release = Arc::new(Notify::new());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let handler = {
        let entered = entered.clone();
        let release = release.clone();
        let sink = seen.clone();
        handler_fn(move |record: Record| {
            let entered = entered.clone();
            let release = release.clone();
            let sink = sink.clone();
            async move {
                if record.offset == 0 {
                    entered.store(true, Ordering::SeqCst);
                    release.notified().await;
                }
                sink.lock().unwrap().push(record.offset);
                Ok(())
            }
        })
    };
    let subscription = queue.subscribe(TOPIC, handler).await.unwrap();

    queue.put(TOPIC, &message(0)).await.unwrap();
    let flag = entered.clone();
    assert_eventually(
        || {
            let flag = flag.clone();
            async move { flag.load(Ordering::SeqCst) }
        },
        Duration::from_secs(2),
        "consumer should pick up the first record",
    )
    .await;

    for n in 1..10 {
        queue.put(TOPIC, &message(n)).await.unwrap();
    }
    // Offset 0 has been taken; everything after it is still unread.
    assert_eq!(queue.len(TOPIC).await, 9);

    release.notify_one();

    let observed = seen.clone();
    assert_eventually(
        || {
            let observed = observed.clone();
            async move { observed.lock().unwrap().len() == 10 }
        },
        Duration::from_secs(2),
        "every record should reach the lagging consumer",
    )
    .await;
    assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<u64>>());
    assert_eq!(queue.len(TOPIC).await, 3);

    subscription.shutdown().await;
}

#[tokio::test]
async fn test_unbounded_retention_keeps_everything() {
    let queue = MemoryQueue::new(QueueConfig {
        max_retained: None,
        ..QueueConfig::default()
    });
    queue.open(Role::Producer).await.unwrap();

    for n in 0..50 {
        queue.put(TOPIC, &message(n)).await.unwrap();
    }
    assert_eq!(queue.len(TOPIC).await, 50);
}

fn unreachable_broker() -> NatsConfig {
    NatsConfig {
        url: "nats://127.0.0.1:1".to_string(),
        connect_timeout: Duration::from_millis(500),
        ..NatsConfig::default()
    }
}

#[tokio::test]
async fn test_nats_queue_requires_open_connection() {
    let queue = NatsQueue::new(unreachable_broker());
    assert!(matches!(
        queue.put(TOPIC, &message(0)).await,
        Err(MultigrainError::Publish(_))
    ));

    let (_, handler) = collecting();
    assert!(matches!(
        queue.subscribe(TOPIC, handler).await,
        Err(MultigrainError::Subscribe(_))
    ));
}

#[tokio::test]
async fn test_nats_queue_open_reports_unreachable_broker() {
    let queue = NatsQueue::new(unreachable_broker());
    let opened = tokio::time::timeout(Duration::from_secs(5), queue.open(Role::Both))
        .await
        .expect("connect should give up");
    assert!(matches!(opened, Err(MultigrainError::Broker(_))));

    // A failed open leaves the queue closed.
    assert!(matches!(
        queue.put(TOPIC, &message(0)).await,
        Err(MultigrainError::Publish(_))
    ));
}

#[tokio::test]
async fn test_queue_backend_selected_from_config() {
    let memory = queue::from_config(&QueueConfig::default());
    memory.open(Role::Producer).await.unwrap();
    assert_eq!(memory.put(TOPIC, &message(0)).await.unwrap().offset, 0);

    let nats = queue::from_config(&QueueConfig {
        backend: QueueBackend::Nats(unreachable_broker()),
        ..QueueConfig::default()
    });
    let opened = tokio::time::timeout(Duration::from_secs(5), nats.open(Role::Producer))
        .await
        .expect("connect should give up");
    assert!(matches!(opened, Err(MultigrainError::Broker(_))));
}
