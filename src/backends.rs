//! Worker pool (C8) — bounded, per-backend concurrent upstream HTTP callers.
//!
//! Grounded on the teacher's `BackendClient`/`OllamaAdapter` pair: one
//! persistent `reqwest::Client` per backend (buffered requests, a request
//! timeout) plus a second streaming client with no request-level timeout,
//! exactly as `OllamaAdapter::new` sets up `client`/`stream_client`. Calls
//! are gated by a `tokio::sync::Semaphore` sized to
//! `per_backend_concurrency`, so the hard cap holds even if the dispatcher's
//! own `in_flight`-based check races a concurrent request.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::Stream;
use futures_util::StreamExt as _;
use reqwest::Client;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::BackendEntryConfig;
use crate::domain::{BackendId, ErrorClass};

/// A `Send`-able, heap-allocated byte stream proxying an upstream streaming
/// response chunk-for-chunk.
pub type UpstreamStream = Pin<Box<dyn Stream<Item = Result<Bytes, ErrorClass>> + Send>>;

/// One of the Ollama-compatible endpoints this pool knows how to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Chat,
    Generate,
    Embed,
    /// `/api/tags` — used by the health prober (C2), never by dispatch.
    Tags,
}

impl Endpoint {
    fn path(self) -> &'static str {
        match self {
            Self::Chat => "/api/chat",
            Self::Generate => "/api/generate",
            Self::Embed => "/api/embed",
            Self::Tags => "/api/tags",
        }
    }
}

struct Worker {
    client: Client,
    stream_client: Client,
    semaphore: Arc<Semaphore>,
}

fn build_worker(per_backend_concurrency: usize) -> Worker {
    let client = Client::builder().build().expect("failed to build reqwest client");
    let stream_client = Client::builder().build().expect("failed to build streaming reqwest client");
    Worker { client, stream_client, semaphore: Arc::new(Semaphore::new(per_backend_concurrency)) }
}

pub struct WorkerPool {
    workers: DashMap<BackendId, Worker>,
    per_backend_concurrency: usize,
}

impl WorkerPool {
    pub fn new(backends: &[BackendEntryConfig], per_backend_concurrency: usize) -> Self {
        let workers = DashMap::new();
        for cfg in backends {
            let id = BackendId::new(cfg.host.clone(), cfg.port);
            workers.insert(id, build_worker(per_backend_concurrency));
        }
        Self { workers, per_backend_concurrency }
    }

    /// Non-blocking capacity check, consulted by the dispatcher before it
    /// commits to a candidate (spec §4.7's "if a chosen candidate is at its
    /// cap, the scorer is consulted for the next").
    pub fn has_capacity(&self, id: &BackendId) -> bool {
        self.workers.get(id).map(|w| w.semaphore.available_permits() > 0).unwrap_or(false)
    }

    /// Acquire a permit for one dispatch attempt. Held for the duration of
    /// the upstream call; dropping it frees the slot on every exit path
    /// (success, error, cancellation) for free via RAII.
    async fn acquire(&self, id: &BackendId) -> Result<OwnedSemaphorePermit, ErrorClass> {
        let semaphore = self
            .workers
            .get(id)
            .map(|w| Arc::clone(&w.semaphore))
            .ok_or(ErrorClass::NetworkError)?;
        semaphore.acquire_owned().await.map_err(|_| ErrorClass::Cancelled)
    }

    /// Call one Ollama-compatible endpoint on `id` and parse the JSON
    /// response. Returns a classified [`ErrorClass`] on any failure.
    pub async fn call(
        &self,
        id: &BackendId,
        endpoint: Endpoint,
        body: Value,
        timeout: Duration,
    ) -> Result<Value, ErrorClass> {
        let _permit = self.acquire(id).await?;
        let client = self.workers.get(id).map(|w| w.client.clone()).ok_or(ErrorClass::NetworkError)?;
        let url = format!("{}{}", id.base_url(), endpoint.path());

        let response = tokio::time::timeout(timeout, client.post(&url).json(&body).send())
            .await
            .map_err(|_| ErrorClass::Timeout)?
            .map_err(classify_transport_error)?;

        let status = response.status();
        let text = response.text().await.map_err(classify_transport_error)?;

        if !status.is_success() {
            return Err(classify_status(status));
        }

        serde_json::from_str(&text).map_err(|_| ErrorClass::Malformed)
    }

    /// Call a streaming endpoint and proxy the response body chunk-for-chunk.
    /// Uses the no-timeout streaming client, matching the teacher's
    /// `chat_completions_stream`; per-chunk backpressure, not a request-level
    /// deadline, is the caller's concern.
    pub async fn call_streaming(
        &self,
        id: &BackendId,
        endpoint: Endpoint,
        body: Value,
    ) -> Result<UpstreamStream, ErrorClass> {
        let _permit = self.acquire(id).await?;
        let client = self.workers.get(id).map(|w| w.stream_client.clone()).ok_or(ErrorClass::NetworkError)?;
        let url = format!("{}{}", id.base_url(), endpoint.path());

        let response = client.post(&url).json(&body).send().await.map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }

        let stream = response.bytes_stream().map(|r| r.map_err(classify_transport_error));
        Ok(Box::pin(stream))
    }

    /// Probe `/api/tags` for liveness. Returns the round-trip time on
    /// success; used by the health prober (C2), counted against neither the
    /// dispatcher's retry budget nor the metrics recorder.
    pub async fn probe(&self, id: &BackendId, timeout: Duration) -> Result<u64, ErrorClass> {
        let client = self.workers.get(id).map(|w| w.client.clone()).ok_or(ErrorClass::NetworkError)?;
        let url = format!("{}{}", id.base_url(), Endpoint::Tags.path());
        let started = std::time::Instant::now();

        let response = tokio::time::timeout(timeout, client.get(&url).send())
            .await
            .map_err(|_| ErrorClass::Timeout)?
            .map_err(classify_transport_error)?;

        if !response.status().is_success() {
            return Err(classify_status(response.status()));
        }
        Ok(started.elapsed().as_millis() as u64)
    }

    /// Rebuild a backend's connection pool, dropping any keep-alive
    /// connections accumulated before a long exclusion (spec §5: "connection
    /// pools ... may be drained when a backend is reinstated").
    pub fn drain_connections(&self, id: &BackendId) {
        if let Some(mut worker) = self.workers.get_mut(id) {
            *worker = build_worker(self.per_backend_concurrency);
        }
    }

    /// Add a backend discovered via a config hot-reload. A no-op if already present.
    pub fn ensure_worker(&self, id: &BackendId) {
        self.workers.entry(id.clone()).or_insert_with(|| build_worker(self.per_backend_concurrency));
    }
}

fn classify_transport_error(err: reqwest::Error) -> ErrorClass {
    if err.is_timeout() {
        ErrorClass::Timeout
    } else if err.is_decode() {
        ErrorClass::Malformed
    } else {
        ErrorClass::NetworkError
    }
}

fn classify_status(status: reqwest::StatusCode) -> ErrorClass {
    if status.is_client_error() {
        ErrorClass::UpstreamClientError
    } else {
        ErrorClass::UpstreamServerError
    }
}
