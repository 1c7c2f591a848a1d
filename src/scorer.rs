//! Scorer (C5) — a pure function from `(RequestContext, registry snapshot)`
//! to a ranked candidate list, kept behind a narrow trait so it is swappable
//! (spec §9's plugin-surface requirement, e.g. for A/B testing formulas).

use crate::config::{DispatcherConfig, ScoringConfig};
use crate::domain::{BackendId, Complexity, DeclaredTier, RequestContext, ScoringDecision};
use crate::metrics_recorder::{MetricsRecorder, SPECIALIZATION_MIN_SAMPLES};
use crate::registry::Backend;

/// One backend's score plus the factor breakdown that produced it, kept
/// around only long enough to build a rationale string.
#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub backend: BackendId,
    pub score: f64,
    pub in_flight: u32,
    pub latency_ewma_ms: f64,
    factors: Factors,
}

#[derive(Debug, Clone, Copy)]
struct Factors {
    success_rate: f64,
    latency_penalty: f64,
    gpu_bonus: f64,
    load_penalty: f64,
    priority_alignment: f64,
    task_specialization: f64,
    duration_headroom_penalty: f64,
}

impl Factors {
    /// Name + multiplier of the two factors that deviate furthest from
    /// neutral (1.0 for multipliers, 0.0 for penalties), used to build the
    /// rationale string.
    fn top_two(&self) -> [(&'static str, f64); 2] {
        let mut scored = [
            ("success_rate", (self.success_rate - 1.0).abs()),
            ("latency_penalty", self.latency_penalty),
            ("gpu_bonus", (self.gpu_bonus - 1.0).abs()),
            ("load_penalty", self.load_penalty),
            ("priority_alignment", (self.priority_alignment - 1.0).abs()),
            ("task_specialization", (self.task_specialization - 1.0).abs()),
            ("duration_headroom_penalty", self.duration_headroom_penalty),
        ];
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        [(scored[0].0, scored[0].1), (scored[1].0, scored[1].1)]
    }
}

/// Narrow, swappable scoring capability (spec §9).
pub trait Scorer: Send + Sync {
    fn rank(
        &self,
        ctx: &RequestContext,
        snapshot: &[Backend],
        metrics: &MetricsRecorder,
        dispatcher: &DispatcherConfig,
    ) -> Vec<RankedCandidate>;
}

/// The formula in spec §4.5.
pub struct DefaultScorer {
    pub weights: ScoringConfig,
}

impl DefaultScorer {
    pub fn new(weights: ScoringConfig) -> Self {
        Self { weights }
    }

    fn complexity_memory_floor_mb(complexity: Complexity) -> u64 {
        match complexity {
            Complexity::Low => 2_000,
            Complexity::Medium => 6_000,
            Complexity::High => 12_000,
        }
    }

    fn gpu_bonus(&self, ctx: &RequestContext, backend: &Backend) -> f64 {
        if !ctx.requires_gpu {
            return 1.0;
        }
        let floor = Self::complexity_memory_floor_mb(ctx.complexity);
        if backend.has_gpu && backend.gpu_memory_free_mb >= floor {
            self.weights.gpu_bonus_match
        } else {
            self.weights.gpu_bonus_mismatch
        }
    }

    fn priority_alignment(&self, ctx: &RequestContext, backend: &Backend) -> f64 {
        let is_high_tier = backend.declared_tier == DeclaredTier::High || backend.has_gpu;
        if ctx.priority >= 8 {
            if is_high_tier { self.weights.priority_boost_high } else { 1.0 }
        } else if ctx.priority <= 2 {
            if is_high_tier { self.weights.priority_damp_low } else { 1.0 }
        } else {
            1.0
        }
    }

    fn task_specialization(&self, ctx: &RequestContext, backend: &Backend, metrics: &MetricsRecorder) -> f64 {
        let Some((backend_rate, samples)) =
            metrics.backend_task_success_rate(&backend.id, ctx.task_type, &ctx.model_name)
        else {
            return 1.0;
        };
        if samples < SPECIALIZATION_MIN_SAMPLES {
            return 1.0;
        }
        let Some(fleet_avg) = metrics.fleet_average_success_rate(ctx.task_type, &ctx.model_name) else {
            return 1.0;
        };
        if backend_rate - fleet_avg >= self.weights.specialization_margin_pp {
            self.weights.specialization_bonus
        } else {
            1.0
        }
    }

    fn expected_capacity_ms(backend: &Backend, per_backend_concurrency: usize) -> f64 {
        let free_slots = (per_backend_concurrency as i64 - backend.in_flight as i64).max(1);
        free_slots as f64 * 1_000.0
    }

    fn factors(&self, ctx: &RequestContext, backend: &Backend, metrics: &MetricsRecorder, dispatcher: &DispatcherConfig) -> Factors {
        Factors {
            success_rate: backend.success_rate_for_scoring(),
            latency_penalty: backend.latency_ewma_ms / 1_000.0,
            gpu_bonus: self.gpu_bonus(ctx, backend),
            load_penalty: backend.cpu_load_01 + 0.1 * backend.in_flight as f64,
            priority_alignment: self.priority_alignment(ctx, backend),
            task_specialization: self.task_specialization(ctx, backend, metrics),
            duration_headroom_penalty: ctx.estimated_duration_ms as f64
                / Self::expected_capacity_ms(backend, dispatcher.per_backend_concurrency),
        }
    }

    fn score(&self, factors: &Factors) -> f64 {
        self.weights.baseline_score
            * factors.success_rate
            / (1.0 + factors.latency_penalty)
            * factors.gpu_bonus
            / (1.0 + factors.load_penalty)
            * factors.priority_alignment
            * factors.task_specialization
            / (1.0 + factors.duration_headroom_penalty)
    }
}

impl Scorer for DefaultScorer {
    fn rank(
        &self,
        ctx: &RequestContext,
        snapshot: &[Backend],
        metrics: &MetricsRecorder,
        dispatcher: &DispatcherConfig,
    ) -> Vec<RankedCandidate> {
        let now = chrono::Utc::now();
        let mut ranked: Vec<RankedCandidate> = snapshot
            .iter()
            .filter(|b| b.alive && !b.is_excluded(now))
            .map(|b| {
                let factors = self.factors(ctx, b, metrics, dispatcher);
                RankedCandidate {
                    backend: b.id.clone(),
                    score: self.score(&factors),
                    in_flight: b.in_flight,
                    latency_ewma_ms: b.latency_ewma_ms,
                    factors,
                }
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.in_flight.cmp(&b.in_flight))
                .then_with(|| a.latency_ewma_ms.partial_cmp(&b.latency_ewma_ms).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| a.backend.cmp(&b.backend))
        });
        ranked
    }
}

/// Build the response-facing [`ScoringDecision`] for a specific chosen
/// candidate out of a ranked list (spec §3/§4.9).
pub fn decision_for(ranked: &[RankedCandidate], chosen_index: usize) -> ScoringDecision {
    let chosen = &ranked[chosen_index];
    let [top1, top2] = chosen.factors.top_two();
    let rationale = format!(
        "chosen for {} ({:.3}) and {} ({:.3})",
        top1.0, top1.1, top2.0, top2.1
    );
    let alternatives = ranked
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != chosen_index)
        .take(5)
        .map(|(_, c)| (c.backend.clone(), c.score))
        .collect();

    ScoringDecision { chosen: chosen.backend.clone(), score: chosen.score, alternatives, rationale }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HealthConfig, MetricsConfig};
    use crate::domain::TaskType;
    use crate::registry::Registry;
    use chrono::Utc;
    use std::sync::Arc;

    fn ctx(task_type: TaskType, complexity: Complexity, requires_gpu: bool, priority: u8) -> RequestContext {
        RequestContext {
            task_type,
            complexity,
            requires_gpu,
            estimated_tokens: 100,
            estimated_duration_ms: 1_000,
            model_name: "m".into(),
            priority,
            submitted_at: Utc::now(),
        }
    }

    fn test_registry(specs: &[(&str, u16, bool, u64, DeclaredTier)]) -> Vec<Backend> {
        let configs: Vec<crate::config::BackendEntryConfig> = specs
            .iter()
            .map(|(host, port, has_gpu, gpu_mb, tier)| crate::config::BackendEntryConfig {
                host: (*host).into(),
                port: *port,
                declared_tier: *tier,
                has_gpu: *has_gpu,
                gpu_memory_total_mb: *gpu_mb,
                cpu_capacity: 1.0,
            })
            .collect();
        let registry = Registry::new(&configs, &HealthConfig::default(), &MetricsConfig::default());
        registry.snapshot()
    }

    fn metrics() -> MetricsRecorder {
        let registry = Arc::new(Registry::new(&[], &HealthConfig::default(), &MetricsConfig::default()));
        MetricsRecorder::new(registry, &MetricsConfig::default())
    }

    #[test]
    fn gpu_backend_wins_for_high_complexity_generation() {
        let backends = test_registry(&[
            ("gpu-host", 1, true, 16_000, DeclaredTier::Standard),
            ("cpu-host", 2, false, 0, DeclaredTier::Standard),
        ]);
        let scorer = DefaultScorer::new(ScoringConfig::default());
        let request_ctx = ctx(TaskType::Generation, Complexity::High, true, 5);
        let ranked = scorer.rank(&request_ctx, &backends, &metrics(), &DispatcherConfig::default());

        assert_eq!(ranked[0].backend, BackendId::new("gpu-host", 1));
    }

    #[test]
    fn embedding_does_not_require_gpu() {
        let backends = test_registry(&[
            ("gpu-host", 1, true, 16_000, DeclaredTier::Standard),
            ("cpu-host", 2, false, 0, DeclaredTier::Standard),
        ]);
        let scorer = DefaultScorer::new(ScoringConfig::default());
        let request_ctx = ctx(TaskType::Embedding, Complexity::Low, false, 5);
        let ranked = scorer.rank(&request_ctx, &backends, &metrics(), &DispatcherConfig::default());

        // Both backends are viable; neither is penalized for lacking a GPU.
        assert_eq!(ranked.len(), 2);
    }

    #[test]
    fn excluded_backend_is_never_ranked() {
        let configs = [crate::config::BackendEntryConfig {
            host: "a".into(),
            port: 1,
            declared_tier: DeclaredTier::Standard,
            has_gpu: false,
            gpu_memory_total_mb: 0,
            cpu_capacity: 1.0,
        }];
        let registry = Registry::new(&configs, &HealthConfig::default(), &MetricsConfig::default());
        registry.exclude(&BackendId::new("a", 1), 60_000);
        let snapshot = registry.snapshot();

        let scorer = DefaultScorer::new(ScoringConfig::default());
        let request_ctx = ctx(TaskType::Generation, Complexity::Low, false, 5);
        let ranked = scorer.rank(&request_ctx, &snapshot, &metrics(), &DispatcherConfig::default());
        assert!(ranked.is_empty());
    }

    #[test]
    fn scoring_is_idempotent_on_an_unchanged_snapshot() {
        let backends = test_registry(&[("a", 1, false, 0, DeclaredTier::Standard)]);
        let scorer = DefaultScorer::new(ScoringConfig::default());
        let request_ctx = ctx(TaskType::Generation, Complexity::Low, false, 5);
        let first = scorer.rank(&request_ctx, &backends, &metrics(), &DispatcherConfig::default());
        let second = scorer.rank(&request_ctx, &backends, &metrics(), &DispatcherConfig::default());
        assert_eq!(first[0].score, second[0].score);
    }

    #[test]
    fn priority_nine_boosts_gpu_backends() {
        let low_priority_backends = test_registry(&[
            ("gpu-host", 1, true, 16_000, DeclaredTier::Standard),
            ("cpu-host", 2, false, 0, DeclaredTier::Standard),
        ]);
        let scorer = DefaultScorer::new(ScoringConfig::default());

        let low = ctx(TaskType::Generation, Complexity::Low, false, 2);
        let high = ctx(TaskType::Generation, Complexity::Low, false, 9);

        let ranked_low = scorer.rank(&low, &low_priority_backends, &metrics(), &DispatcherConfig::default());
        let ranked_high = scorer.rank(&high, &low_priority_backends, &metrics(), &DispatcherConfig::default());

        let gpu_score_low = ranked_low.iter().find(|c| c.backend.host == "gpu-host").unwrap().score;
        let gpu_score_high = ranked_high.iter().find(|c| c.backend.host == "gpu-host").unwrap().score;
        assert!(gpu_score_high > gpu_score_low);
    }
}
