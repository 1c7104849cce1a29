
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use multigrain::client::{HttpWorkerClient, WorkerClient};
use multigrain::config::{DiscoveryConfig, DispatcherConfig};
use multigrain::directory::{ServiceDirectory, ServiceInstance};
use multigrain::dispatcher::Dispatcher;
use multigrain::error::MultigrainError;
use multigrain::queue::{JobQueue, MemoryQueue, Role};
use multigrain::worker::{self, DeviceSettings, DeviceStatus, SchemaVersion, StateName, Worker};
use test_harness::{assert_eventually, fast_timings, settings_with_timer};

const NS: &str = "hypertoast";

/// Serve a worker API on an ephemeral port. The server stops when `shutdown` fires.
async fn spawn_worker(name: &str, shutdown: CancellationToken) -> (Worker, ServiceInstance) {
    let worker = Worker::new(name, DeviceSettings::preset(SchemaVersion::V2), fast_timings());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let app = worker::api::router(worker.clone(), shutdown.clone());
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .unwrap();
    });

    let instance = ServiceInstance {
        namespace: NS.to_string(),
        host: "127.0.0.1".to_string(),
        port,
        name: name.to_string(),
        registered_at: Utc::now(),
    };
    (worker, instance)
}

#[tokio::test]
async fn test_http_client_drives_cycle_and_receives_completion() {
    let shutdown = CancellationToken::new();
    let (_worker, instance) = spawn_worker("toaster-1", shutdown.clone()).await;
    let client = HttpWorkerClient::new();

    let status = client.status(&instance).await.unwrap();
    assert_eq!(status.device_name, "toaster-1");
    assert_eq!(status.state.name, StateName::Idle);

    let settings = settings_with_timer(SchemaVersion::V2, 100).with_job_id("urn:job:1");
    let status = client.push_settings(&instance, &settings).await.unwrap();
    assert_eq!(status.settings.job_id.as_deref(), Some("urn:job:1"));

    let mut events = client.events(&instance).await.unwrap();
    let status = client.start(&instance).await.unwrap();
    assert_eq!(status.state.name, StateName::Starting);

    let mut names = Vec::new();
    let completion = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.next().await {
            let envelope = event.unwrap();
            names.push(envelope.name().to_string());
            if envelope.name() == StateName::Idle.as_str() {
                return Some(envelope);
            }
        }
        None
    })
    .await
    .expect("completion event should arrive")
    .expect("event stream ended early");

    assert_eq!(names.first().map(String::as_str), Some("starting"));
    assert_eq!(names.last().map(String::as_str), Some("idle"));
    let status: DeviceStatus = serde_json::from_value(completion.payload).unwrap();
    assert_eq!(status.state.job_id.as_deref(), Some("urn:job:1"));

    shutdown.cancel();
}

#[tokio::test]
async fn test_http_client_surfaces_worker_rejection() {
    let shutdown = CancellationToken::new();
    let (_worker, instance) = spawn_worker("toaster-2", shutdown.clone()).await;
    let client = HttpWorkerClient::new();

    // Settings without a cook config cannot start a cycle.
    let unusable = DeviceSettings::new(SchemaVersion::V2, json!({ "mode": "bagel" }));
    client.push_settings(&instance, &unusable).await.unwrap();

    match client.start(&instance).await {
        Err(MultigrainError::WorkerRejected { worker, status }) => {
            assert_eq!(worker, "toaster-2");
            assert_eq!(status, 400);
        }
        other => panic!("expected a rejection, got {:?}", other.map(|s| s.state.name)),
    }

    shutdown.cancel();
}

#[tokio::test]
async fn test_dispatcher_completes_job_over_http() {
    let shutdown = CancellationToken::new();
    let (worker, instance) = spawn_worker("toaster-3", shutdown.clone()).await;

    let directory = ServiceDirectory::new();
    directory
        .register(NS, &instance.host, instance.port, &instance.name)
        .await
        .unwrap();

    let config = DispatcherConfig {
        discovery: DiscoveryConfig {
            max_cycles: 2,
            base_delay: Duration::from_millis(10),
            probe_timeout: Duration::from_secs(1),
        },
        ..DispatcherConfig::default()
    }
    .with_cook_timer(1, 100);

    let queue = Arc::new(MemoryQueue::default());
    queue.open(Role::Both).await.unwrap();
    let dispatcher = Arc::new(Dispatcher::new(
        config,
        directory,
        queue,
        Arc::new(HttpWorkerClient::new()),
        shutdown.clone(),
    ));
    let subscription = dispatcher.clone().start().await.unwrap();

    let accepted = dispatcher
        .submit_job(json!({ "mode": "bagel", "level": 1 }))
        .await
        .unwrap();
    let urn = accepted["urn"].as_str().unwrap().to_string();

    let results = dispatcher.results().clone();
    assert_eventually(
        || {
            let results = results.clone();
            async move { results.len().await == 1 }
        },
        Duration::from_secs(5),
        "job should complete over HTTP",
    )
    .await;

    let result = results.get(&urn).await.unwrap();
    assert_eq!(result.device_name, "toaster-3");
    assert_eq!(worker.status().await.state.job_id.as_deref(), Some(urn.as_str()));

    subscription.shutdown().await;
    shutdown.cancel();
}
