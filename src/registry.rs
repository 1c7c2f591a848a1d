//! Host registry (C1) — the authoritative store of backend identity and
//! mutable performance/resource state.
//!
//! All mutation goes through the named methods below; nothing outside this
//! module writes backend state directly. Backed by a [`DashMap`] so reads
//! (`snapshot`) never block writers for long and writers only ever contend
//! per-shard, the same structure the teacher crate uses for the rate
//! limiter's per-IP buckets.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::config::{BackendEntryConfig, HealthConfig, MetricsConfig};
use crate::domain::{BackendId, DeclaredTier, PerformanceSample};

/// Below this many recorded outcomes, `success_rate` defaults to 1.0 and the
/// backend is never excluded on that basis alone (spec §3 warm-up rule).
const WARM_UP_THRESHOLD: usize = 5;

/// EWMA smoothing factor for `latency_ewma_ms` (spec §4.1).
const LATENCY_EWMA_ALPHA: f64 = 0.2;

/// A resource update (`update_resources`) older than this is ignored (spec §6).
const RESOURCE_STALENESS: chrono::Duration = chrono::Duration::seconds(30);

/// Public, cloneable snapshot of one backend's identity and state (spec §3).
#[derive(Debug, Clone)]
pub struct Backend {
    pub id: BackendId,
    pub has_gpu: bool,
    pub gpu_memory_total_mb: u64,
    pub cpu_capacity: f64,
    pub declared_tier: DeclaredTier,

    pub alive: bool,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub latency_ewma_ms: f64,
    pub success_rate: f64,
    pub sample_count: u32,
    pub in_flight: u32,
    pub failure_streak: u32,
    pub excluded_until: Option<DateTime<Utc>>,
    pub exclusion_episodes: u32,
    pub gpu_memory_free_mb: u64,
    pub cpu_load_01: f64,
    pub resources_updated_at: Option<DateTime<Utc>>,
}

impl Backend {
    fn new(cfg: &BackendEntryConfig) -> Self {
        Self {
            id: BackendId::new(cfg.host.clone(), cfg.port),
            has_gpu: cfg.has_gpu,
            gpu_memory_total_mb: cfg.gpu_memory_total_mb,
            cpu_capacity: cfg.cpu_capacity,
            declared_tier: cfg.declared_tier,
            alive: true,
            last_probe_at: None,
            latency_ewma_ms: 0.0,
            success_rate: 1.0,
            sample_count: 0,
            in_flight: 0,
            failure_streak: 0,
            excluded_until: None,
            exclusion_episodes: 0,
            gpu_memory_free_mb: cfg.gpu_memory_total_mb,
            cpu_load_01: 0.0,
            resources_updated_at: None,
        }
    }

    /// `success_rate` for scoring purposes: 1.0 while under the warm-up
    /// threshold, regardless of what's actually been observed (spec §3).
    pub fn success_rate_for_scoring(&self) -> f64 {
        if (self.sample_count as usize) < WARM_UP_THRESHOLD {
            1.0
        } else {
            self.success_rate
        }
    }

    pub fn is_excluded(&self, now: DateTime<Utc>) -> bool {
        self.excluded_until.map(|t| t > now).unwrap_or(false)
    }
}

/// Internal bookkeeping kept alongside each [`Backend`] but not exposed in
/// snapshots: the rolling outcome window backing `success_rate`.
struct Record {
    backend: Backend,
    outcomes: VecDeque<bool>,
}

pub struct Registry {
    records: DashMap<BackendId, Record>,
    outcome_window: usize,
    exclusion_backoff_schedule_ms: Vec<u64>,
    failure_streak_threshold: u32,
}

impl Registry {
    pub fn new(backends: &[BackendEntryConfig], health: &HealthConfig, metrics: &MetricsConfig) -> Self {
        let records = DashMap::new();
        for cfg in backends {
            let backend = Backend::new(cfg);
            records.insert(backend.id.clone(), Record { backend, outcomes: VecDeque::new() });
        }
        Self {
            records,
            outcome_window: metrics.outcome_window,
            exclusion_backoff_schedule_ms: health.exclusion_backoff_schedule_ms.clone(),
            failure_streak_threshold: health.failure_streak_threshold,
        }
    }

    /// Identity order, used by the scorer as the last tie-break. Computed
    /// fresh from the map rather than cached, so it can never go stale
    /// against [`reconcile_backends`] — a `DashMap` iteration plus a sort is
    /// cheap at the fleet sizes this registry is sized for.
    pub fn ids(&self) -> Vec<BackendId> {
        let mut ids: Vec<BackendId> = self.records.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Reconcile the live backend set against a freshly hot-reloaded config:
    /// add backends that are new, drop ones no longer listed. Existing
    /// backends keep their accumulated health/performance state untouched —
    /// only membership changes (spec §6, backend list is hot-reloadable).
    pub fn reconcile_backends(&self, backends: &[BackendEntryConfig]) {
        let wanted: std::collections::HashSet<BackendId> =
            backends.iter().map(|cfg| BackendId::new(cfg.host.clone(), cfg.port)).collect();

        self.records.retain(|id, _| wanted.contains(id));

        for cfg in backends {
            let id = BackendId::new(cfg.host.clone(), cfg.port);
            if !self.records.contains_key(&id) {
                let backend = Backend::new(cfg);
                self.records.insert(id, Record { backend, outcomes: VecDeque::new() });
            }
        }
    }

    /// Immutable, point-in-time copy of every backend's state. Cheap: a
    /// `DashMap` iteration plus one clone per entry, no caller-visible lock.
    pub fn snapshot(&self) -> Vec<Backend> {
        let mut backends: Vec<Backend> = self.records.iter().map(|r| r.backend.clone()).collect();
        backends.sort_by(|a, b| a.id.cmp(&b.id));
        backends
    }

    pub fn get(&self, id: &BackendId) -> Option<Backend> {
        self.records.get(id).map(|r| r.backend.clone())
    }

    /// Called by the health prober on every probe result.
    pub fn update_probe(
        &self,
        id: &BackendId,
        alive: bool,
        rtt_ms: u64,
        gpu_free_mb: Option<u64>,
        cpu_load: Option<f64>,
    ) {
        let Some(mut record) = self.records.get_mut(id) else { return };
        let now = Utc::now();
        record.backend.last_probe_at = Some(now);

        if alive {
            record.backend.latency_ewma_ms = ewma(record.backend.latency_ewma_ms, rtt_ms as f64);
            if let Some(free) = gpu_free_mb {
                record.backend.gpu_memory_free_mb = free;
                record.backend.resources_updated_at = Some(now);
            }
            if let Some(load) = cpu_load {
                record.backend.cpu_load_01 = load;
                record.backend.resources_updated_at = Some(now);
            }
            // A reachable backend is only "alive" if it isn't still serving
            // out an exclusion window — reinstatement is `reinstate`'s
            // explicit decision once `excluded_until` has actually passed,
            // not an automatic side effect of a single successful probe
            // (spec §3 invariant: `alive` implies `excluded_until <= now`).
            record.backend.alive = !record.backend.is_excluded(now);
        } else {
            record.backend.alive = false;
        }
    }

    /// Narrow interface for external telemetry pushing GPU/CPU state
    /// (spec §6). Stale updates (we accept a caller-supplied timestamp) are
    /// ignored rather than erroring.
    pub fn update_resources(&self, id: &BackendId, gpu_free_mb: u64, cpu_load: f64, observed_at: DateTime<Utc>) {
        if Utc::now().signed_duration_since(observed_at) > RESOURCE_STALENESS {
            return;
        }
        if let Some(mut record) = self.records.get_mut(id) {
            record.backend.gpu_memory_free_mb = gpu_free_mb;
            record.backend.cpu_load_01 = cpu_load;
            record.backend.resources_updated_at = Some(observed_at);
        }
    }

    /// Called by the metrics recorder (C3) for every terminal outcome.
    /// Updates the latency EWMA and the rolling success-rate window. Does
    /// *not* touch `failure_streak`/exclusion — that's `end_dispatch`'s job,
    /// driven directly off the attempt result rather than the (possibly
    /// batched/sampled) metrics path. See DESIGN.md for why the two are split.
    pub fn record_outcome(&self, id: &BackendId, sample: &PerformanceSample) {
        let Some(mut record) = self.records.get_mut(id) else { return };
        record.backend.latency_ewma_ms = ewma(record.backend.latency_ewma_ms, sample.actual_duration_ms as f64);
        record.outcomes.push_back(sample.success);
        if record.outcomes.len() > self.outcome_window {
            record.outcomes.pop_front();
        }
        record.backend.sample_count = record.outcomes.len() as u32;
        let successes = record.outcomes.iter().filter(|s| **s).count();
        record.backend.success_rate = successes as f64 / record.outcomes.len() as f64;
    }

    /// Increment `in_flight` before an upstream call begins.
    pub fn begin_dispatch(&self, id: &BackendId) {
        if let Some(mut record) = self.records.get_mut(id) {
            record.backend.in_flight += 1;
        }
    }

    /// Decrement `in_flight` on every exit path (success, failure,
    /// cancellation) and, on failure, advance the exclusion rule.
    pub fn end_dispatch(&self, id: &BackendId, succeeded: bool) {
        let Some(mut record) = self.records.get_mut(id) else { return };
        record.backend.in_flight = record.backend.in_flight.saturating_sub(1);

        if succeeded {
            record.backend.failure_streak = 0;
            return;
        }

        record.backend.failure_streak += 1;
        if record.backend.failure_streak >= self.failure_streak_threshold {
            Self::apply_exclusion_backoff(&mut record.backend, &self.exclusion_backoff_schedule_ms);
        }
    }

    /// Step one backend into its next exclusion episode using the
    /// configured backoff schedule, indexed by how many times it has
    /// already been excluded (spec §4.1: "backoff is exponential in
    /// consecutive exclusion episodes").
    fn apply_exclusion_backoff(backend: &mut Backend, schedule_ms: &[u64]) {
        let episode = backend.exclusion_episodes as usize;
        let backoff_ms = schedule_ms.get(episode).or(schedule_ms.last()).copied().unwrap_or(300_000);
        backend.excluded_until = Some(Utc::now() + chrono::Duration::milliseconds(backoff_ms as i64));
        backend.exclusion_episodes += 1;
        backend.alive = false;
    }

    /// Called by the health prober (C2) on the third consecutive probe
    /// failure (spec §4.2: "mark not-alive and set an exclusion window if
    /// not already excluded"). A no-op if the backend is already excluded —
    /// probe failures while excluded don't restart or extend the window;
    /// only a fresh dispatch failure streak or another probe episode after
    /// reinstatement does.
    pub fn exclude_on_probe_failure(&self, id: &BackendId) {
        let Some(mut record) = self.records.get_mut(id) else { return };
        record.backend.alive = false;
        if record.backend.is_excluded(Utc::now()) {
            return;
        }
        Self::apply_exclusion_backoff(&mut record.backend, &self.exclusion_backoff_schedule_ms);
    }

    /// Decrement `in_flight` for a dispatch that was cancelled rather than
    /// won or lost outright (e.g. the losing side of a hedge race). Touches
    /// neither `failure_streak` nor `success_rate` — a cancellation says
    /// nothing about whether the backend would have succeeded.
    pub fn cancel_dispatch(&self, id: &BackendId) {
        if let Some(mut record) = self.records.get_mut(id) {
            record.backend.in_flight = record.backend.in_flight.saturating_sub(1);
        }
    }

    /// Explicitly exclude a backend for `duration_ms`.
    pub fn exclude(&self, id: &BackendId, duration_ms: u64) {
        if let Some(mut record) = self.records.get_mut(id) {
            record.backend.excluded_until = Some(Utc::now() + chrono::Duration::milliseconds(duration_ms as i64));
            record.backend.alive = false;
        }
    }

    /// Clear a backend's exclusion and mark it alive again. Called by the
    /// health prober after a successful probe once `excluded_until` has
    /// actually passed.
    pub fn reinstate(&self, id: &BackendId) {
        if let Some(mut record) = self.records.get_mut(id) {
            record.backend.excluded_until = None;
            record.backend.failure_streak = 0;
            record.backend.alive = true;
        }
    }
}

fn ewma(previous: f64, sample: f64) -> f64 {
    if previous == 0.0 {
        sample
    } else {
        LATENCY_EWMA_ALPHA * sample + (1.0 - LATENCY_EWMA_ALPHA) * previous
    }
}
