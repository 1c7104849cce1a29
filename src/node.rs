use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::client::HttpWorkerClient;
use crate::config::{DispatcherConfig, WorkerConfig};
use crate::directory::ServiceDirectory;
use crate::dispatcher::api::{RegisterRequest, SERVICES_PATH};
use crate::dispatcher::{self, Dispatcher};
use crate::error::{MultigrainError, Result};
use crate::queue::{self, JobQueue, Role};
use crate::worker::{self, Worker};

/// Dispatcher process: directory, ingress queue, consumer loop and HTTP API.
pub struct DispatcherNode {
    pub config: DispatcherConfig,
    pub queue: Arc<dyn JobQueue>,
    pub dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
}

impl DispatcherNode {
    pub fn new(config: DispatcherConfig, shutdown: CancellationToken) -> Self {
        let queue = queue::from_config(&config.queue);
        let dispatcher = Arc::new(Dispatcher::new(
            config.clone(),
            ServiceDirectory::new(),
            queue.clone(),
            Arc::new(HttpWorkerClient::new()),
            shutdown.clone(),
        ));

        Self {
            config,
            queue,
            dispatcher,
            shutdown,
        }
    }

    /// Run until the shutdown token fires:
    /// 1. Opens the queue for producing and consuming
    /// 2. Starts the ingress consumer
    /// 3. Serves the HTTP API (blocking)
    pub async fn run(self) -> std::result::Result<(), Box<dyn std::error::Error>> {
        self.queue.open(Role::Both).await?;
        let subscription = self.dispatcher.clone().start().await?;

        let app = dispatcher::api::router(self.dispatcher.clone());
        let listener = tokio::net::TcpListener::bind(self.config.listen_addr).await?;
        tracing::info!(
            addr = %self.config.listen_addr,
            namespace = %self.config.namespace,
            topic = %self.config.ingress_topic,
            "Dispatcher listening"
        );

        let shutdown = self.shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        subscription.shutdown().await;
        tracing::info!("Dispatcher stopped");
        Ok(())
    }
}

/// Worker process: one device plus its HTTP API, optionally registered with a
/// dispatcher for the lifetime of the process.
pub struct WorkerNode {
    pub config: WorkerConfig,
    pub worker: Worker,
    http: reqwest::Client,
    shutdown: CancellationToken,
}

impl WorkerNode {
    pub fn new(config: WorkerConfig, shutdown: CancellationToken) -> Self {
        let worker = Worker::new(
            config.name.clone(),
            config.initial_settings.clone(),
            config.timings,
        );
        Self {
            config,
            worker,
            http: reqwest::Client::new(),
            shutdown,
        }
    }

    pub async fn run(self) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let listener = tokio::net::TcpListener::bind(self.config.listen_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until the shutdown token fires.
    /// Open event streams are closed so in-flight connections can drain.
    pub async fn serve(
        self,
        listener: tokio::net::TcpListener,
    ) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let app = worker::api::router(self.worker.clone(), self.shutdown.clone());
        tracing::info!(
            addr = %listener.local_addr()?,
            worker = %self.config.name,
            "Worker listening"
        );

        if let Some(url) = &self.config.dispatcher_url {
            if let Err(e) = self.register(url).await {
                tracing::warn!(dispatcher = %url, error = %e, "Registration failed");
            }
        }

        let shutdown = self.shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        self.worker.stop().await;
        if let Some(url) = &self.config.dispatcher_url {
            if let Err(e) = self.deregister(url).await {
                tracing::warn!(dispatcher = %url, error = %e, "Deregistration failed");
            }
        }
        tracing::info!(worker = %self.config.name, "Worker stopped");
        Ok(())
    }

    fn urn(&self) -> String {
        format!("urn:{}:{}", self.config.namespace, self.config.name)
    }

    async fn register(&self, dispatcher_url: &str) -> Result<()> {
        let request = RegisterRequest {
            namespace: self.config.namespace.clone(),
            host: self.config.advertise_host.clone(),
            port: self.config.port(),
            name: self.config.name.clone(),
        };
        let response = self
            .http
            .post(format!("{}{}", dispatcher_url, SERVICES_PATH))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(MultigrainError::Registration(format!(
                "dispatcher answered {}",
                response.status()
            )));
        }
        tracing::info!(dispatcher = %dispatcher_url, urn = %self.urn(), "Registered with dispatcher");
        Ok(())
    }

    async fn deregister(&self, dispatcher_url: &str) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}{}/{}", dispatcher_url, SERVICES_PATH, self.urn()))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(MultigrainError::NotFound(self.urn()));
        }
        Ok(())
    }
}
