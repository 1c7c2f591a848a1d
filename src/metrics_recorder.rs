//! Metrics recorder (C3) — records every terminal dispatch outcome into the
//! registry and maintains the rolling performance history the scorer and
//! analyzer read from.
//!
//! Three ring buffers, as spec §4.3 prescribes: global-per-backend, per
//! `(backend, task_type, model)`, and per `(task_type, model)`. The
//! `per_backend_task_model` ring backs `backend_task_success_rate` and holds
//! every outcome, success or failure, since a rate needs both. The other two
//! rings back duration prediction, which is only meaningful for successful
//! completions, so they hold successes only. Every outcome (success or not)
//! still updates the registry's EWMA/success-rate/failure-streak state via
//! [`crate::registry::Registry::record_outcome`] / `end_dispatch`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::{debug, error, warn};

use crate::config::MetricsConfig;
use crate::domain::{BackendId, PerformanceSample, TaskType};
use crate::registry::Registry;

/// Minimum sample count before a `(task_type, model)` median is trusted for
/// duration estimation (spec §4.4) or a per-backend rate counts toward
/// specialization (spec §4.5).
pub const SPECIALIZATION_MIN_SAMPLES: usize = 10;
pub const DURATION_MEDIAN_MIN_SAMPLES: usize = 5;

pub struct MetricsRecorder {
    registry: std::sync::Arc<Registry>,
    global_per_backend: DashMap<BackendId, VecDeque<PerformanceSample>>,
    per_backend_task_model: DashMap<(BackendId, TaskType, String), VecDeque<PerformanceSample>>,
    per_task_model: DashMap<(TaskType, String), VecDeque<PerformanceSample>>,
    ring_capacity: usize,
    sampling_rate_info: f64,
    sample_counter: AtomicU64,
}

impl MetricsRecorder {
    pub fn new(registry: std::sync::Arc<Registry>, config: &MetricsConfig) -> Self {
        Self {
            registry,
            global_per_backend: DashMap::new(),
            per_backend_task_model: DashMap::new(),
            per_task_model: DashMap::new(),
            ring_capacity: config.ring_capacity,
            sampling_rate_info: config.sampling_rate_info,
            sample_counter: AtomicU64::new(0),
        }
    }

    /// Record one terminal dispatch outcome. Samples whose `error_class`
    /// doesn't count against the backend (cancellation, a client's own
    /// malformed request) still get logged but are kept out of the
    /// registry's failure-streak bookkeeping and the success-rate rings —
    /// counting them would penalize a backend for something that wasn't its
    /// fault (spec §7).
    pub fn record(&self, sample: PerformanceSample) {
        self.emit_event(&sample);

        let counts = sample.success || sample.error_class.map(|e| e.counts_against_backend()).unwrap_or(true);
        if !counts {
            return;
        }

        self.registry.record_outcome(&sample.backend_id, &sample);

        let cap = self.ring_capacity;

        let mut ring = self
            .per_backend_task_model
            .entry((sample.backend_id.clone(), sample.task_type, sample.model_name.clone()))
            .or_default();
        if ring.len() >= cap {
            ring.pop_front();
        }
        ring.push_back(sample.clone());
        drop(ring);

        if !sample.success {
            return;
        }

        let mut ring = self.global_per_backend.entry(sample.backend_id.clone()).or_default();
        if ring.len() >= cap {
            ring.pop_front();
        }
        ring.push_back(sample.clone());
        drop(ring);

        let mut ring = self.per_task_model.entry((sample.task_type, sample.model_name.clone())).or_default();
        if ring.len() >= cap {
            ring.pop_front();
        }
        ring.push_back(sample);
    }

    /// Structured event, sampled at `sampling_rate_info` for successes and
    /// always emitted for errors (spec §4.3).
    fn emit_event(&self, sample: &PerformanceSample) {
        if !sample.success {
            warn!(
                backend = %sample.backend_id,
                task_type = %sample.task_type,
                model = %sample.model_name,
                error_class = ?sample.error_class,
                duration_ms = sample.actual_duration_ms,
                "dispatch outcome: failure"
            );
            if sample.error_class.is_none() {
                error!(backend = %sample.backend_id, "failure sample missing error_class");
            }
            return;
        }

        if self.should_sample() {
            debug!(
                backend = %sample.backend_id,
                task_type = %sample.task_type,
                model = %sample.model_name,
                duration_ms = sample.actual_duration_ms,
                "dispatch outcome: success"
            );
        }
    }

    fn should_sample(&self) -> bool {
        if self.sampling_rate_info <= 0.0 {
            return false;
        }
        if self.sampling_rate_info >= 1.0 {
            return true;
        }
        let n = self.sample_counter.fetch_add(1, Ordering::Relaxed);
        let denom = (1.0 / self.sampling_rate_info).round().max(1.0) as u64;
        n % denom == 0
    }

    /// Median `actual_duration_ms` over the `(task_type, model)` ring, if at
    /// least [`DURATION_MEDIAN_MIN_SAMPLES`] successful samples exist.
    pub fn median_duration_ms(&self, task_type: TaskType, model: &str) -> Option<u64> {
        let ring = self.per_task_model.get(&(task_type, model.to_string()))?;
        if ring.len() < DURATION_MEDIAN_MIN_SAMPLES {
            return None;
        }
        let mut durations: Vec<u64> = ring.iter().map(|s| s.actual_duration_ms).collect();
        durations.sort_unstable();
        Some(durations[durations.len() / 2])
    }

    /// This backend's success rate for `(task_type, model)`, plus the sample
    /// count backing it, for the scorer's `task_specialization` factor.
    pub fn backend_task_success_rate(&self, id: &BackendId, task_type: TaskType, model: &str) -> Option<(f64, usize)> {
        let ring = self.per_backend_task_model.get(&(id.clone(), task_type, model.to_string()))?;
        if ring.is_empty() {
            return None;
        }
        let successes = ring.iter().filter(|s| s.success).count();
        Some((successes as f64 / ring.len() as f64, ring.len()))
    }

    /// Fleet-average success rate for `(task_type, model)` across all
    /// backends with any recorded samples, for the scorer's comparison.
    pub fn fleet_average_success_rate(&self, task_type: TaskType, model: &str) -> Option<f64> {
        let mut total = 0.0;
        let mut count = 0usize;
        for entry in self.per_backend_task_model.iter() {
            let (_, t, m) = entry.key();
            if *t != task_type || m != model {
                continue;
            }
            let ring = entry.value();
            if ring.is_empty() {
                continue;
            }
            let successes = ring.iter().filter(|s| s.success).count();
            total += successes as f64 / ring.len() as f64;
            count += 1;
        }
        if count == 0 {
            None
        } else {
            Some(total / count as f64)
        }
    }
}
