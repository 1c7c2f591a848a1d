//! Gateway facade (C9) — shared application state, background-task startup,
//! and the classify→admit→await pipeline every inbound request goes through.
//!
//! Grounded on the teacher's `RouterState`/`route` pair: a `RwLock<Arc<Config>>`
//! for hot-reloadable config, an admin token resolved once at startup from
//! `admin_token_env`, and a free async function that takes `&RouterState`
//! plus the inbound payload. Where the teacher's `route` walks a fixed tier
//! list directly, `submit` hands the request to the priority queue (C6) and
//! lets the dispatcher (C7) own tier/candidate selection — the routing
//! decision itself lives in `scorer`/`dispatcher`, not here.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;

use crate::analyzer;
use crate::backends::{UpstreamStream, WorkerPool};
use crate::config::Config;
use crate::dispatcher::{self, DefaultHedgingPolicy, Dispatcher};
use crate::domain::{BackendId, ErrorClass, PerformanceSample, RoutedResponse};
use crate::error::RouterError;
use crate::health;
use crate::metrics_recorder::MetricsRecorder;
use crate::queue::PriorityQueue;
use crate::registry::Registry;
use crate::request::InboundRequest;
use crate::scorer::{decision_for, DefaultScorer, Scorer};

/// Shared application state injected into every request handler via
/// [`axum::extract::State`].
pub struct RouterState {
    /// Atomically-swappable live config; the lock is held only for the
    /// duration of `Arc::clone`, so it never blocks request handling —
    /// same contract as the teacher's `config_lock`.
    config_lock: RwLock<Arc<Config>>,
    /// Path to the config file — read by the hot-reload background task.
    pub config_path: PathBuf,
    pub registry: Arc<Registry>,
    pub metrics: Arc<MetricsRecorder>,
    pub queue: Arc<PriorityQueue>,
    pub backends: Arc<WorkerPool>,
    pub dispatcher: Arc<Dispatcher>,
    pub started_at: std::time::Instant,
    /// Bearer token required for admin API access. `None` disables admin
    /// auth (the admin port should then be firewalled). Resolved once at
    /// startup from `gateway.admin_token_env`; not updated on hot-reload.
    pub admin_token: Option<String>,
}

impl RouterState {
    pub fn new(config: Arc<Config>, config_path: PathBuf) -> Self {
        let registry = Arc::new(Registry::new(&config.backends, &config.health, &config.metrics));
        let metrics = Arc::new(MetricsRecorder::new(Arc::clone(&registry), &config.metrics));
        let queue = Arc::new(PriorityQueue::new(&config.queue));
        let backends =
            Arc::new(WorkerPool::new(&config.backends, config.dispatcher.per_backend_concurrency));

        let scorer: Arc<dyn Scorer> = Arc::new(DefaultScorer::new(config.scoring.clone()));
        let hedging = Arc::new(DefaultHedgingPolicy::new(&config.dispatcher));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&metrics),
            scorer,
            Arc::clone(&backends),
            config.dispatcher.clone(),
            hedging,
        ));

        let admin_token = config
            .gateway
            .admin_token_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|t| !t.is_empty());

        Self {
            config_lock: RwLock::new(config),
            config_path,
            registry,
            metrics,
            queue,
            backends,
            dispatcher,
            started_at: std::time::Instant::now(),
            admin_token,
        }
    }

    /// Returns a snapshot of the current live config. The `RwLock` is held
    /// only for the duration of `Arc::clone`, so callers get a stable
    /// reference with no contention risk.
    pub fn config(&self) -> Arc<Config> {
        self.config_lock.read().expect("config lock poisoned").clone()
    }

    /// Hot-reload entry point: reconciles the registry's backend set and
    /// ensures a worker pool slot exists for anything newly added, then
    /// swaps the live config. Fields already baked into constructed
    /// components — queue tunables, per-backend concurrency caps, the
    /// admin token — are not live-updated; a restart picks those up. See
    /// SPEC_FULL.md §10.2.
    pub fn replace_config(&self, new: Arc<Config>) {
        self.registry.reconcile_backends(&new.backends);
        for cfg in &new.backends {
            self.backends.ensure_worker(&BackendId::new(cfg.host.clone(), cfg.port));
        }
        *self.config_lock.write().expect("config lock poisoned") = new;
    }

    /// Spawn the dispatcher's drain loop and one health prober per
    /// configured backend. Call once at startup; these hold no sockets so
    /// they don't need to precede binding the listeners.
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        tokio::spawn(Arc::clone(&self.dispatcher).run(Arc::clone(&self.queue)));
        let health_config = self.config().health.clone();
        health::spawn_all(&self.registry.ids(), Arc::clone(&self.registry), Arc::clone(&self.backends), health_config);
    }
}

/// Classify, admit, and await completion of one inbound request (spec §4.9).
///
/// Cancellation-safe: dropping the returned future before it resolves (the
/// caller's HTTP handler future being dropped on client disconnect) trips
/// the entry's cancellation token via `drop_guard`, which the dispatcher
/// races against the in-flight upstream call.
pub async fn submit(
    state: &RouterState,
    payload: InboundRequest,
    deadline: Option<Duration>,
) -> Result<RoutedResponse, RouterError> {
    let config = state.config();
    let context = analyzer::analyze(&payload, &state.metrics, &config.analyzer);

    let (rx, cancel_token) = state.queue.submit(context, payload, deadline)?;
    let _cancel_on_drop = cancel_token.drop_guard();

    rx.await.unwrap_or(Err(RouterError::Cancelled))
}

/// The subset of [`RoutingMeta`](crate::domain::RoutingMeta) known before the
/// first streamed chunk has arrived — `actual_duration_ms` isn't known until
/// the stream ends, so it's surfaced as an `X-Sollol-Backend` response header
/// instead of a trailing JSON field (spec §4.8/§4.9).
pub struct StreamHandle {
    pub backend: BackendId,
    pub decision_score: f64,
    pub rationale: String,
    pub stream: UpstreamStream,
}

/// Streaming counterpart to [`submit`] (spec §4.8: "pass through streaming
/// responses ... emitting chunks in order"). Retrying mid-stream makes no
/// sense once bytes are already flowing to the caller, so this path takes a
/// single fresh ranking, commits to the first candidate with spare capacity,
/// and does not retry or hedge on failure — a failure here surfaces directly
/// to the caller rather than trying the next candidate. See DESIGN.md.
pub async fn submit_streaming(
    state: &RouterState,
    payload: InboundRequest,
) -> Result<StreamHandle, RouterError> {
    let config = state.config();
    let context = analyzer::analyze(&payload, &state.metrics, &config.analyzer);

    let ranked = state.dispatcher.rank(&context);
    let Some((idx, candidate)) = ranked
        .iter()
        .enumerate()
        .find(|(_, c)| state.backends.has_capacity(&c.backend))
    else {
        return Err(RouterError::NoBackendAvailable);
    };
    let decision = decision_for(&ranked, idx);
    let backend_id = candidate.backend.clone();

    let endpoint = dispatcher::endpoint_for(&payload);
    let body = payload.to_upstream_body(&context.model_name);

    state.registry.begin_dispatch(&backend_id);
    let started_at = chrono::Utc::now();
    let attempt_clock = std::time::Instant::now();

    let handle = RouterStateHandle::clone_from(state);

    let upstream = match state.backends.call_streaming(&backend_id, endpoint, body).await {
        Ok(s) => s,
        Err(error_class) => {
            finish_streaming_track(&handle, &backend_id, &context, started_at, attempt_clock.elapsed().as_millis() as u64, Err(error_class));
            return Err(RouterError::AllAttemptsFailed(vec![crate::domain::AttemptDiagnostic {
                backend_id,
                error_class,
                message: format!("stream open returned {error_class}"),
            }]));
        }
    };

    let tracked = TrackedStream {
        inner: upstream,
        state: Some(StreamTrackState {
            router_state: handle,
            backend_id: backend_id.clone(),
            context,
            started_at,
            attempt_clock,
            saw_error: false,
        }),
    };

    Ok(StreamHandle {
        backend: backend_id,
        decision_score: decision.score,
        rationale: decision.rationale,
        stream: Box::pin(tracked),
    })
}

/// Cheap `Arc`-cloneable handle to the pieces [`TrackedStream`] needs to
/// finish bookkeeping without borrowing `RouterState` across an `'static`
/// stream. `RouterState` itself is always held behind an `Arc` by callers
/// (axum `State`), so this just re-bundles clones of those `Arc`s.
#[derive(Clone)]
struct RouterStateHandle {
    registry: Arc<Registry>,
    metrics: Arc<MetricsRecorder>,
}

impl RouterStateHandle {
    fn clone_from(state: &RouterState) -> Self {
        Self { registry: Arc::clone(&state.registry), metrics: Arc::clone(&state.metrics) }
    }
}

struct StreamTrackState {
    router_state: RouterStateHandle,
    backend_id: BackendId,
    context: crate::domain::RequestContext,
    started_at: chrono::DateTime<chrono::Utc>,
    attempt_clock: std::time::Instant,
    saw_error: bool,
}

/// Proxies an [`UpstreamStream`] chunk-for-chunk while tracking the
/// dispatch's lifecycle: `in_flight`/`failure_streak` on natural completion
/// or error, and the same on early drop (the client disconnecting mid-stream)
/// via the `Drop` impl below — the streaming equivalent of the non-streaming
/// path's `cancel_token` race.
struct TrackedStream {
    inner: UpstreamStream,
    state: Option<StreamTrackState>,
}

impl Stream for TrackedStream {
    type Item = Result<Bytes, ErrorClass>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let poll = self.inner.as_mut().poll_next(cx);
        match &poll {
            Poll::Ready(Some(Err(_))) => {
                if let Some(st) = &mut self.state {
                    st.saw_error = true;
                }
            }
            Poll::Ready(None) => {
                if let Some(st) = self.state.take() {
                    let duration_ms = st.attempt_clock.elapsed().as_millis() as u64;
                    let outcome = if st.saw_error { Err(ErrorClass::NetworkError) } else { Ok(()) };
                    finish_streaming_track(&st.router_state, &st.backend_id, &st.context, st.started_at, duration_ms, outcome);
                }
            }
            _ => {}
        }
        poll
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        if let Some(st) = self.state.take() {
            let duration_ms = st.attempt_clock.elapsed().as_millis() as u64;
            finish_streaming_track(&st.router_state, &st.backend_id, &st.context, st.started_at, duration_ms, Err(ErrorClass::Cancelled));
        }
    }
}

fn finish_streaming_track(
    handle: &RouterStateHandle,
    id: &BackendId,
    context: &crate::domain::RequestContext,
    started_at: chrono::DateTime<chrono::Utc>,
    duration_ms: u64,
    outcome: Result<(), ErrorClass>,
) {
    let success = outcome.is_ok();
    if let Err(error_class) = outcome {
        if error_class.counts_against_backend() {
            handle.registry.end_dispatch(id, false);
        } else {
            handle.registry.cancel_dispatch(id);
        }
    } else {
        handle.registry.end_dispatch(id, true);
    }
    handle.metrics.record(PerformanceSample {
        backend_id: id.clone(),
        task_type: context.task_type,
        model_name: context.model_name.clone(),
        started_at,
        finished_at: chrono::Utc::now(),
        success,
        error_class: outcome.err(),
        actual_duration_ms: duration_ms,
        prompt_size: context.estimated_tokens,
        completion_size: 0,
    });
}
