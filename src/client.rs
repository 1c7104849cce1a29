//! Dispatcher-side access to worker devices.

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use reqwest::header::ACCEPT;

use crate::directory::ServiceInstance;
use crate::error::{MultigrainError, Result};
use crate::message::EventEnvelope;
use crate::worker::api::{EVENTS_PATH, SETTINGS_PATH, START_PATH, STATUS_PATH};
use crate::worker::{DeviceSettings, DeviceStatus};

pub type EventStream = BoxStream<'static, Result<EventEnvelope>>;

/// Operations the dispatcher performs against a worker.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Current status; used as the health probe.
    async fn status(&self, instance: &ServiceInstance) -> Result<DeviceStatus>;

    async fn push_settings(
        &self,
        instance: &ServiceInstance,
        settings: &DeviceSettings,
    ) -> Result<DeviceStatus>;

    async fn start(&self, instance: &ServiceInstance) -> Result<DeviceStatus>;

    /// Open the worker's event stream. Events published before this returns
    /// are not delivered.
    async fn events(&self, instance: &ServiceInstance) -> Result<EventStream>;
}

/// [`WorkerClient`] over the worker's HTTP API.
#[derive(Debug, Clone, Default)]
pub struct HttpWorkerClient {
    http: reqwest::Client,
}

impl HttpWorkerClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn read_status(
        instance: &ServiceInstance,
        response: reqwest::Response,
    ) -> Result<DeviceStatus> {
        let status = response.status();
        if !status.is_success() {
            return Err(MultigrainError::WorkerRejected {
                worker: instance.name.clone(),
                status: status.as_u16(),
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn status(&self, instance: &ServiceInstance) -> Result<DeviceStatus> {
        let url = format!("{}{}", instance.base_url(), STATUS_PATH);
        let response = self.http.get(url).send().await?;
        Self::read_status(instance, response).await
    }

    async fn push_settings(
        &self,
        instance: &ServiceInstance,
        settings: &DeviceSettings,
    ) -> Result<DeviceStatus> {
        let url = format!("{}{}", instance.base_url(), SETTINGS_PATH);
        let response = self.http.put(url).json(settings).send().await?;
        Self::read_status(instance, response).await
    }

    async fn start(&self, instance: &ServiceInstance) -> Result<DeviceStatus> {
        let url = format!("{}{}", instance.base_url(), START_PATH);
        let response = self.http.put(url).send().await?;
        Self::read_status(instance, response).await
    }

    async fn events(&self, instance: &ServiceInstance) -> Result<EventStream> {
        let url = format!("{}{}", instance.base_url(), EVENTS_PATH);
        let response = self
            .http
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(MultigrainError::WorkerRejected {
                worker: instance.name.clone(),
                status: response.status().as_u16(),
            });
        }

        Ok(decode_event_stream(Box::pin(response.bytes_stream())).boxed())
    }
}

/// Turn a Server-Sent Events byte stream into envelopes. Comment and
/// keep-alive frames are skipped.
pub fn decode_event_stream<S, B>(bytes: S) -> impl Stream<Item = Result<EventEnvelope>>
where
    S: Stream<Item = reqwest::Result<B>> + Unpin + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    stream::unfold((bytes, Vec::<u8>::new()), |(mut bytes, mut buffer)| async move {
        loop {
            if let Some(frame) = take_frame(&mut buffer) {
                match parse_frame(&frame) {
                    Some(event) => return Some((event, (bytes, buffer))),
                    None => continue,
                }
            }

            match bytes.next().await {
                Some(Ok(chunk)) => buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => return Some((Err(e.into()), (bytes, buffer))),
                None => return None,
            }
        }
    })
}

fn take_frame(buffer: &mut Vec<u8>) -> Option<String> {
    let end = buffer.windows(2).position(|w| w == b"\n\n")?;
    let frame: Vec<u8> = buffer.drain(..end + 2).collect();
    Some(String::from_utf8_lossy(&frame).into_owned())
}

fn parse_frame(frame: &str) -> Option<Result<EventEnvelope>> {
    let data: Vec<&str> = frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.strip_prefix(' ').unwrap_or(data))
        .collect();

    if data.is_empty() {
        return None;
    }

    Some(serde_json::from_str(&data.join("\n")).map_err(MultigrainError::from))
}
