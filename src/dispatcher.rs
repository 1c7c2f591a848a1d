//! Dispatcher (C7) — pops admitted requests, ranks candidates fresh on every
//! attempt, and drives retries/backoff/hedging against the worker pool.
//!
//! The attempt loop is grounded on the teacher's `router::escalate`:
//! try a candidate, classify the outcome, decide whether to continue. Where
//! `escalate` walks a fixed tier list, this walks a freshly-ranked candidate
//! list per attempt, since backend state (and therefore the ranking) changes
//! between attempts. The hedging policy is a narrow trait in the shape of
//! the retrieval pack's `SpeculativeExecutionPolicy` (max extra attempts +
//! retry delay), reimplemented rather than copied since this dispatcher
//! hedges by backend choice, not by repeating the same target.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, warn};

use crate::backends::{Endpoint, WorkerPool};
use crate::config::DispatcherConfig;
use crate::domain::{AttemptDiagnostic, BackendId, ErrorClass, PerformanceSample, RoutedResponse, RoutingMeta};
use crate::error::RouterError;
use crate::metrics_recorder::MetricsRecorder;
use crate::queue::{PriorityQueue, QueueEntry};
use crate::registry::Registry;
use crate::request::InboundRequest;
use crate::scorer::{decision_for, RankedCandidate, Scorer};

/// Narrow, swappable capability deciding whether and how a request hedges
/// (spec §4.7 "Hedging (optional)"). `DefaultHedgingPolicy` implements the
/// spec's literal rule; alternate policies (e.g. latency-percentile driven,
/// mirroring `PercentileSpeculativeExecutionPolicy`) can be swapped in.
pub trait HedgingPolicy: Send + Sync {
    fn should_hedge(&self, priority: u8) -> bool;
    fn delay(&self) -> Duration;
}

pub struct DefaultHedgingPolicy {
    enabled: bool,
    delay: Duration,
}

impl DefaultHedgingPolicy {
    pub fn new(config: &DispatcherConfig) -> Self {
        Self { enabled: config.hedging_enabled, delay: Duration::from_millis(config.hedging_delay_ms) }
    }
}

impl HedgingPolicy for DefaultHedgingPolicy {
    fn should_hedge(&self, priority: u8) -> bool {
        self.enabled && priority >= 9
    }

    fn delay(&self) -> Duration {
        self.delay
    }
}

/// Exposed `pub(crate)` so the streaming path in `router`, which bypasses
/// the attempt loop below entirely, maps payload to endpoint the same way.
pub(crate) fn endpoint_for(payload: &InboundRequest) -> Endpoint {
    match payload {
        InboundRequest::Chat(_) => Endpoint::Chat,
        InboundRequest::Generate(_) => Endpoint::Generate,
        InboundRequest::Embed(_) => Endpoint::Embed,
    }
}

pub(crate) fn timeout_for(payload: &InboundRequest, config: &DispatcherConfig) -> Duration {
    match payload {
        InboundRequest::Embed(_) => Duration::from_millis(config.embed_timeout_ms),
        InboundRequest::Chat(_) | InboundRequest::Generate(_) => Duration::from_millis(config.chat_timeout_ms),
    }
}

/// Re-queue age credit applied when every untried candidate is at its
/// concurrency cap (spec §4.7). A few seconds is enough for an in-flight
/// call elsewhere to free a slot without starving the rest of the queue.
const SATURATED_REQUEUE_CREDIT_MS: u64 = 3_000;

const MAX_BACKOFF_MS: u64 = 2_000;
const BASE_BACKOFF_MS: u64 = 100;

/// Exponential backoff with ±25% jitter (spec §4.7). No `rand` dependency
/// is introduced — jitter is derived from a monotonically increasing
/// counter, which is uniform enough for spreading out retries without
/// pulling in a crate the rest of the stack doesn't use.
fn jittered_backoff(attempt: u32, counter: &AtomicU64) -> Duration {
    let base_ms = (BASE_BACKOFF_MS.saturating_mul(1u64 << attempt.min(16))).min(MAX_BACKOFF_MS);
    let n = counter.fetch_add(1, Ordering::Relaxed);
    let jitter_pct = ((n % 51) as f64 - 25.0) / 100.0; // -0.25..=+0.25
    let jittered_ms = (base_ms as f64 * (1.0 + jitter_pct)).max(0.0);
    Duration::from_millis(jittered_ms as u64)
}

/// Resolves at `deadline`, or never if there isn't one. Raced against the
/// attempt future so a caller-supplied total-budget (spec §4.7/§5) cuts off
/// an attempt even if the backend never errors or times out on its own.
async fn until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
        None => std::future::pending().await,
    }
}

type AttemptOutcome = Result<(BackendId, serde_json::Value), (BackendId, ErrorClass)>;
type AttemptFuture<'a> = Pin<Box<dyn Future<Output = AttemptOutcome> + Send + 'a>>;

pub struct Dispatcher {
    registry: Arc<Registry>,
    metrics: Arc<MetricsRecorder>,
    scorer: Arc<dyn Scorer>,
    backends: Arc<WorkerPool>,
    config: DispatcherConfig,
    hedging: Arc<dyn HedgingPolicy>,
    backoff_counter: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        metrics: Arc<MetricsRecorder>,
        scorer: Arc<dyn Scorer>,
        backends: Arc<WorkerPool>,
        config: DispatcherConfig,
        hedging: Arc<dyn HedgingPolicy>,
    ) -> Self {
        Self { registry, metrics, scorer, backends, config, hedging, backoff_counter: AtomicU64::new(0) }
    }

    /// Fresh registry snapshot + ranked candidate list for `ctx`, the same
    /// call the non-streaming attempt loop makes at the top of every
    /// attempt. Exposed so the streaming path (`router::submit_streaming`),
    /// which bypasses the retry loop entirely, can still reuse C5's
    /// candidate selection instead of re-implementing it.
    pub fn rank(&self, ctx: &crate::domain::RequestContext) -> Vec<RankedCandidate> {
        let snapshot = self.registry.snapshot();
        self.scorer.rank(ctx, &snapshot, &self.metrics, &self.config)
    }

    /// Drain the queue forever, handing each admitted entry its own task so
    /// independent requests never block each other on retry backoff.
    pub async fn run(self: Arc<Self>, queue: Arc<PriorityQueue>) {
        loop {
            let entry = queue.pop_ready().await;
            let dispatcher = Arc::clone(&self);
            let queue_handle = Arc::clone(&queue);
            tokio::spawn(async move {
                dispatcher.process(&queue_handle, entry).await;
            });
        }
    }

    fn pick_candidate<'a>(
        &self,
        ranked: &'a [RankedCandidate],
        tried: &HashSet<BackendId>,
    ) -> Option<(usize, &'a RankedCandidate)> {
        ranked.iter().enumerate().find(|(_, c)| !tried.contains(&c.backend) && self.backends.has_capacity(&c.backend))
    }

    async fn process(&self, queue: &PriorityQueue, entry: QueueEntry) {
        if entry.is_cancelled() {
            return;
        }

        let endpoint = endpoint_for(&entry.payload);
        let timeout = timeout_for(&entry.payload, &self.config);

        let initial_snapshot = self.registry.snapshot();
        let initial_ranked = self.scorer.rank(&entry.context, &initial_snapshot, &self.metrics, &self.config);
        if initial_ranked.is_empty() {
            entry.complete(Err(RouterError::NoBackendAvailable));
            return;
        }

        let mut tried: HashSet<BackendId> = HashSet::new();
        let mut failed_attempts: Vec<AttemptDiagnostic> = Vec::new();

        for attempt in 0..self.config.max_retries {
            if entry.is_cancelled() {
                return;
            }

            let snapshot = self.registry.snapshot();
            let ranked = self.scorer.rank(&entry.context, &snapshot, &self.metrics, &self.config);

            let Some((idx, candidate)) = self.pick_candidate(&ranked, &tried) else {
                let any_untried = ranked.iter().any(|c| !tried.contains(&c.backend));
                if any_untried && attempt == 0 {
                    debug!(request_id = %entry.request_id, "all untried candidates at capacity, requeuing with age credit");
                    queue.requeue_with_age_credit(entry, SATURATED_REQUEUE_CREDIT_MS);
                    return;
                }
                break;
            };

            let decision = decision_for(&ranked, idx);
            let backend_id = candidate.backend.clone();
            tried.insert(backend_id.clone());

            let hedge_candidate = if self.hedging.should_hedge(entry.context.priority) {
                self.pick_candidate(&ranked, &tried).map(|(_, c)| c.backend.clone())
            } else {
                None
            };

            let body = entry.payload.to_upstream_body(&entry.context.model_name);
            let started_at = Utc::now();
            let attempt_clock = std::time::Instant::now();

            self.registry.begin_dispatch(&backend_id);
            let hedge_id_for_cancel = hedge_candidate.clone();
            if let Some(hedge_id) = &hedge_candidate {
                tried.insert(hedge_id.clone());
                self.registry.begin_dispatch(hedge_id);
            }

            let call_fut: AttemptFuture = if let Some(hedge_id) = hedge_candidate {
                Box::pin(self.dispatch_hedged(backend_id.clone(), hedge_id, endpoint, body, timeout))
            } else {
                let id = backend_id.clone();
                Box::pin(async move {
                    self.backends
                        .call(&id, endpoint, body, timeout)
                        .await
                        .map(|v| (id.clone(), v))
                        .map_err(|e| (id.clone(), e))
                })
            };

            let outcome = tokio::select! {
                biased;
                _ = entry.cancel_token.cancelled() => {
                    self.registry.cancel_dispatch(&backend_id);
                    if let Some(h) = &hedge_id_for_cancel {
                        self.registry.cancel_dispatch(h);
                    }
                    debug!(request_id = %entry.request_id, "client disconnected mid-dispatch, aborting attempt");
                    entry.complete(Err(RouterError::Cancelled));
                    return;
                }
                _ = until_deadline(entry.deadline) => {
                    self.registry.cancel_dispatch(&backend_id);
                    if let Some(h) = &hedge_id_for_cancel {
                        self.registry.cancel_dispatch(h);
                    }
                    debug!(request_id = %entry.request_id, "deadline elapsed mid-dispatch, aborting attempt");
                    entry.complete(Err(RouterError::Cancelled));
                    return;
                }
                outcome = call_fut => outcome,
            };

            let actual_duration_ms = attempt_clock.elapsed().as_millis() as u64;

            match outcome {
                Ok((winner, response_body)) => {
                    self.finish_success(&winner, &entry, started_at, actual_duration_ms, &response_body);
                    let routing = RoutingMeta {
                        chosen_backend: winner.to_string(),
                        task_type: entry.context.task_type,
                        complexity: entry.context.complexity,
                        decision_score: decision.score,
                        rationale: decision.rationale,
                        actual_duration_ms,
                        failed_attempts,
                    };
                    entry.complete(Ok(RoutedResponse { body: response_body, routing }));
                    return;
                }
                Err((failed_id, error_class)) => {
                    self.finish_failure(&failed_id, &entry, started_at, actual_duration_ms, error_class);
                    failed_attempts.push(AttemptDiagnostic {
                        backend_id: failed_id,
                        error_class,
                        message: format!("attempt {} returned {error_class}", attempt + 1),
                    });

                    if !matches!(error_class, ErrorClass::UpstreamClientError) {
                        let backoff = jittered_backoff(attempt, &self.backoff_counter);
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        entry.complete(Err(RouterError::AllAttemptsFailed(failed_attempts)));
    }

    /// Race the primary candidate against a hedge. The first success wins;
    /// the loser is classified as `Cancelled` so it isn't counted against
    /// its backend's success rate (spec §4.7).
    async fn dispatch_hedged(
        &self,
        primary: BackendId,
        hedge: BackendId,
        endpoint: Endpoint,
        body: serde_json::Value,
        timeout: Duration,
    ) -> Result<(BackendId, serde_json::Value), (BackendId, ErrorClass)> {
        let primary_id = primary.clone();
        let hedge_id = hedge.clone();
        let primary_fut = self.backends.call(&primary, endpoint, body.clone(), timeout);
        let delay = self.hedging.delay();
        let hedge_fut = async {
            tokio::time::sleep(delay).await;
            self.backends.call(&hedge_id, endpoint, body, timeout).await
        };

        tokio::select! {
            result = primary_fut => {
                // The hedge, win or lose, never reaches a terminal outcome here —
                // it is cancelled, not failed, and must not count against its
                // backend's success rate (spec §4.7/§8).
                self.registry.cancel_dispatch(&hedge_id);
                match result {
                    Ok(v) => Ok((primary_id, v)),
                    Err(e) => Err((primary_id, e)),
                }
            }
            result = hedge_fut => {
                self.registry.cancel_dispatch(&primary_id);
                match result {
                    Ok(v) => Ok((hedge_id, v)),
                    Err(e) => Err((hedge_id, e)),
                }
            }
        }
    }

    fn finish_success(&self, id: &BackendId, entry: &QueueEntry, started_at: chrono::DateTime<Utc>, duration_ms: u64, body: &serde_json::Value) {
        self.registry.end_dispatch(id, true);
        self.metrics.record(PerformanceSample {
            backend_id: id.clone(),
            task_type: entry.context.task_type,
            model_name: entry.context.model_name.clone(),
            started_at,
            finished_at: Utc::now(),
            success: true,
            error_class: None,
            actual_duration_ms: duration_ms,
            prompt_size: entry.context.estimated_tokens,
            completion_size: body.to_string().len() as u32,
        });
    }

    fn finish_failure(
        &self,
        id: &BackendId,
        entry: &QueueEntry,
        started_at: chrono::DateTime<Utc>,
        duration_ms: u64,
        error_class: ErrorClass,
    ) {
        // Only errors that are actually the backend's fault feed the
        // failure streak / exclusion machinery; a cancelled or
        // client-malformed attempt just releases the in-flight slot
        // (spec §7/§8).
        if error_class.counts_against_backend() {
            self.registry.end_dispatch(id, false);
            warn!(backend = %id, ?error_class, "dispatch attempt failed");
        } else {
            self.registry.cancel_dispatch(id);
        }
        self.metrics.record(PerformanceSample {
            backend_id: id.clone(),
            task_type: entry.context.task_type,
            model_name: entry.context.model_name.clone(),
            started_at,
            finished_at: Utc::now(),
            success: false,
            error_class: Some(error_class),
            actual_duration_ms: duration_ms,
            prompt_size: entry.context.estimated_tokens,
            completion_size: 0,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jittered_backoff_stays_within_plus_minus_25_percent() {
        let counter = AtomicU64::new(0);
        for attempt in 0..5 {
            for _ in 0..60 {
                let d = jittered_backoff(attempt, &counter);
                let base = (BASE_BACKOFF_MS * (1u64 << attempt.min(16))).min(MAX_BACKOFF_MS) as f64;
                let lower = (base * 0.75).floor() as u64;
                let upper = (base * 1.25).ceil() as u64;
                let ms = d.as_millis() as u64;
                assert!(ms >= lower && ms <= upper, "attempt {attempt}: {ms}ms not in [{lower},{upper}]");
            }
        }
    }

    #[test]
    fn jittered_backoff_caps_at_two_seconds() {
        let counter = AtomicU64::new(0);
        let d = jittered_backoff(10, &counter);
        assert!(d.as_millis() as u64 <= (MAX_BACKOFF_MS as f64 * 1.25) as u64);
    }

    #[test]
    fn default_hedging_policy_only_hedges_enabled_high_priority() {
        let mut config = DispatcherConfig::default();
        config.hedging_enabled = true;
        let policy = DefaultHedgingPolicy::new(&config);
        assert!(policy.should_hedge(9));
        assert!(policy.should_hedge(10));
        assert!(!policy.should_hedge(8));

        config.hedging_enabled = false;
        let disabled = DefaultHedgingPolicy::new(&config);
        assert!(!disabled.should_hedge(10));
    }

    // The scenarios below exercise the dispatcher end-to-end against real
    // wiremock servers, one per spec §8 scenario: a single healthy backend,
    // failover past a failing one, exclusion after repeated failures, and
    // client cancellation mid-call. Scorer GPU preference and queue
    // fairness/age-boost are already covered at their own unit level
    // (`scorer.rs`, `queue.rs`) and aren't duplicated here.
    mod end_to_end {
        use super::*;
        use crate::config::{HealthConfig, MetricsConfig, QueueConfig, ScoringConfig};
        use crate::domain::{Complexity, DeclaredTier, TaskType};
        use crate::request::{ChatMessage, ChatRequest, InboundRequest};
        use crate::scorer::DefaultScorer;
        use serde_json::{json, Map};
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        fn backend_cfg(host: &str, port: u16) -> crate::config::BackendEntryConfig {
            crate::config::BackendEntryConfig {
                host: host.into(),
                port,
                declared_tier: DeclaredTier::Standard,
                has_gpu: false,
                gpu_memory_total_mb: 0,
                cpu_capacity: 1.0,
            }
        }

        fn id_for(server: &MockServer) -> BackendId {
            let uri = server.uri();
            let stripped = uri.trim_start_matches("http://");
            let (host, port) = stripped.split_once(':').unwrap();
            BackendId::new(host, port.parse::<u16>().unwrap())
        }

        fn ctx() -> crate::domain::RequestContext {
            crate::domain::RequestContext {
                task_type: TaskType::Generation,
                complexity: Complexity::Low,
                requires_gpu: false,
                estimated_tokens: 10,
                estimated_duration_ms: 100,
                model_name: "m".into(),
                priority: 5,
                submitted_at: Utc::now(),
            }
        }

        fn payload() -> InboundRequest {
            InboundRequest::Chat(ChatRequest {
                model: "m".into(),
                messages: vec![ChatMessage { role: "user".into(), content: "hi".into() }],
                stream: false,
                priority: None,
                extra: Map::new(),
            })
        }

        /// Build a full `Dispatcher` + `PriorityQueue` + `Registry` stack wired
        /// against the given set of already-mocked servers.
        fn harness(ids: &[BackendId], config: DispatcherConfig) -> (Arc<Dispatcher>, Arc<PriorityQueue>, Arc<Registry>) {
            let backend_cfgs: Vec<_> = ids.iter().map(|id| backend_cfg(&id.host, id.port)).collect();
            let health = HealthConfig::default();
            let metrics_cfg = MetricsConfig::default();

            let registry = Arc::new(Registry::new(&backend_cfgs, &health, &metrics_cfg));
            let metrics = Arc::new(MetricsRecorder::new(Arc::clone(&registry), &metrics_cfg));
            let backends = Arc::new(WorkerPool::new(&backend_cfgs, config.per_backend_concurrency));
            let scorer: Arc<dyn Scorer> = Arc::new(DefaultScorer::new(ScoringConfig::default()));
            let hedging: Arc<dyn HedgingPolicy> = Arc::new(DefaultHedgingPolicy::new(&config));
            let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry), metrics, scorer, backends, config, hedging));
            let queue = Arc::new(PriorityQueue::new(&QueueConfig {
                max_queue_size: 10,
                age_boost_step_ms: 2_000,
                age_boost_cap: 9,
            }));
            (dispatcher, queue, registry)
        }

        fn success_response() -> ResponseTemplate {
            ResponseTemplate::new(200).set_body_json(json!({
                "message": {"role": "assistant", "content": "hi"},
                "done": true,
                "model": "m",
            }))
        }

        /// Scenario 1 — a single healthy backend serves the request directly,
        /// with no failed attempts recorded.
        #[tokio::test]
        async fn single_healthy_backend_serves_the_request() {
            let server = MockServer::start().await;
            Mock::given(method("POST")).and(path("/api/chat")).respond_with(success_response()).mount(&server).await;
            let id = id_for(&server);
            let (dispatcher, queue, _registry) = harness(&[id.clone()], DispatcherConfig::default());

            let (rx, _token) = queue.submit(ctx(), payload(), None).unwrap();
            let entry = queue.pop_ready().await;
            dispatcher.process(&queue, entry).await;

            let routed = rx.await.unwrap().expect("request should succeed");
            assert_eq!(routed.routing.chosen_backend, id.to_string());
            assert!(routed.routing.failed_attempts.is_empty());
        }

        /// Scenario 2 — the first-ranked backend returns 500, the dispatcher
        /// falls over to the next candidate without surfacing an error to the
        /// caller.
        #[tokio::test]
        async fn failover_past_a_failing_backend() {
            let server_x = MockServer::start().await;
            let server_y = MockServer::start().await;
            let id_x = id_for(&server_x);
            let id_y = id_for(&server_y);
            // Tie-broken lowest BackendId first (scorer.rs); let the failing
            // mock be whichever one actually ranks first so the test doesn't
            // depend on which ephemeral port the OS handed out.
            let (failing, failing_id, healthy, healthy_id) =
                if id_x < id_y { (&server_x, id_x, &server_y, id_y) } else { (&server_y, id_y, &server_x, id_x) };

            Mock::given(method("POST")).and(path("/api/chat")).respond_with(ResponseTemplate::new(500)).mount(failing).await;
            Mock::given(method("POST")).and(path("/api/chat")).respond_with(success_response()).mount(healthy).await;

            let (dispatcher, queue, registry) =
                harness(&[failing_id.clone(), healthy_id.clone()], DispatcherConfig::default());

            let (rx, _token) = queue.submit(ctx(), payload(), None).unwrap();
            let entry = queue.pop_ready().await;
            dispatcher.process(&queue, entry).await;

            let routed = rx.await.unwrap().expect("request should succeed via failover");
            assert_eq!(routed.routing.chosen_backend, healthy_id.to_string());
            assert_eq!(routed.routing.failed_attempts.len(), 1);
            assert_eq!(routed.routing.failed_attempts[0].backend_id, failing_id);
            assert_eq!(registry.get(&failing_id).unwrap().failure_streak, 1);
        }

        /// Scenario 3 — three separate requests each fail against the same
        /// always-failing backend; on the third it crosses the failure-streak
        /// threshold and is excluded, so a fourth request never tries it at
        /// all (no failed attempt recorded for it).
        #[tokio::test]
        async fn three_consecutive_failures_exclude_the_backend() {
            let server_x = MockServer::start().await;
            let server_y = MockServer::start().await;
            let id_x = id_for(&server_x);
            let id_y = id_for(&server_y);
            let (failing, failing_id, healthy, healthy_id) =
                if id_x < id_y { (&server_x, id_x, &server_y, id_y) } else { (&server_y, id_y, &server_x, id_x) };

            Mock::given(method("POST")).and(path("/api/chat")).respond_with(ResponseTemplate::new(500)).mount(failing).await;
            Mock::given(method("POST")).and(path("/api/chat")).respond_with(success_response()).mount(healthy).await;

            let (dispatcher, queue, registry) =
                harness(&[failing_id.clone(), healthy_id.clone()], DispatcherConfig::default());

            for _ in 0..3 {
                let (rx, _token) = queue.submit(ctx(), payload(), None).unwrap();
                let entry = queue.pop_ready().await;
                dispatcher.process(&queue, entry).await;
                rx.await.unwrap().expect("each request still succeeds via the healthy backend");
            }
            assert!(registry.get(&failing_id).unwrap().is_excluded(Utc::now()));

            let (rx, _token) = queue.submit(ctx(), payload(), None).unwrap();
            let entry = queue.pop_ready().await;
            dispatcher.process(&queue, entry).await;
            let routed = rx.await.unwrap().expect("fourth request succeeds without trying the excluded backend");
            assert_eq!(routed.routing.chosen_backend, healthy_id.to_string());
            assert!(routed.routing.failed_attempts.is_empty());
        }

        /// Scenario 5 — a client that disconnects mid-dispatch (its
        /// cancellation token fires) gets `Cancelled` back instead of waiting
        /// for the slow upstream call, and the backend's in-flight count and
        /// success rate are left untouched.
        #[tokio::test]
        async fn cancellation_aborts_a_slow_dispatch() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/api/chat"))
                .respond_with(success_response().set_delay(Duration::from_millis(500)))
                .mount(&server)
                .await;
            let id = id_for(&server);
            let (dispatcher, queue, registry) = harness(&[id.clone()], DispatcherConfig::default());

            let (rx, cancel_token) = queue.submit(ctx(), payload(), None).unwrap();
            let entry = queue.pop_ready().await;
            let dispatcher_handle = Arc::clone(&dispatcher);
            let queue_handle = Arc::clone(&queue);
            let task = tokio::spawn(async move {
                dispatcher_handle.process(&queue_handle, entry).await;
            });

            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel_token.cancel();

            let result = rx.await.unwrap();
            assert!(matches!(result, Err(RouterError::Cancelled)));
            task.await.unwrap();

            let backend = registry.get(&id).unwrap();
            assert_eq!(backend.in_flight, 0);
            assert_eq!(backend.sample_count, 0);
        }
    }
}
