//! Health prober (C2) — an independent background loop per backend that
//! feeds liveness and latency into the registry.
//!
//! Structured the way the teacher's `main::config_watcher` is: a
//! `tokio::spawn`ed loop driven by `tokio::time::interval`, logging via
//! `tracing`. Unlike `config_watcher`'s fixed five-second tick, each
//! backend's interval is adaptive — it widens while the backend looks
//! healthy and narrows when it doesn't, per spec §4.2's four-tier model.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::backends::WorkerPool;
use crate::config::HealthConfig;
use crate::domain::BackendId;
use crate::registry::Registry;

/// A backend's recent-probe stability, driving which interval tier applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StabilityTier {
    VeryStable,
    Stable,
    Degraded,
    Unstable,
}

/// How many trailing probe results this component keeps per backend to
/// compute its own stability tier, independent of the registry's
/// `failure_streak` (which the dispatcher drives off request outcomes, not
/// background probes).
const PROBE_HISTORY: usize = 10;

struct ProbeHistory {
    outcomes: std::collections::VecDeque<bool>,
}

impl ProbeHistory {
    fn new() -> Self {
        Self { outcomes: std::collections::VecDeque::with_capacity(PROBE_HISTORY) }
    }

    fn push(&mut self, ok: bool) {
        if self.outcomes.len() >= PROBE_HISTORY {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(ok);
    }

    fn consecutive_failures(&self) -> u32 {
        self.outcomes.iter().rev().take_while(|ok| !**ok).count() as u32
    }

    fn tier(&self) -> StabilityTier {
        if self.outcomes.len() < 3 {
            return StabilityTier::Stable;
        }
        let failures = self.outcomes.iter().filter(|ok| !**ok).count();
        match failures {
            0 => StabilityTier::VeryStable,
            1 => StabilityTier::Stable,
            2 => StabilityTier::Degraded,
            _ => StabilityTier::Unstable,
        }
    }
}

fn interval_for(tier: StabilityTier, config: &HealthConfig) -> Duration {
    let ms = match tier {
        StabilityTier::VeryStable => config.very_stable_interval_ms,
        StabilityTier::Stable => config.stable_interval_ms,
        StabilityTier::Degraded => config.degraded_interval_ms,
        StabilityTier::Unstable => config.unstable_interval_ms,
    };
    Duration::from_millis(ms)
}

/// Probe one backend forever, sleeping for an interval chosen by its current
/// stability tier. Runs until the process exits; there is no cancellation
/// handle because the prober outlives every individual request and is only
/// ever torn down with the process.
pub async fn run_prober(id: BackendId, registry: Arc<Registry>, backends: Arc<WorkerPool>, config: HealthConfig) {
    let mut history = ProbeHistory::new();

    loop {
        let timeout = Duration::from_millis(config.probe_timeout_ms);
        let probe = backends.probe(&id, timeout).await;

        match probe {
            Ok(rtt_ms) => {
                history.push(true);
                let was_excluded = registry.get(&id).map(|b| b.excluded_until.is_some()).unwrap_or(false);
                registry.update_probe(&id, true, rtt_ms, None, None);

                if was_excluded {
                    if let Some(backend) = registry.get(&id) {
                        if !backend.is_excluded(chrono::Utc::now()) {
                            registry.reinstate(&id);
                            backends.drain_connections(&id);
                            info!(backend = %id, "backend reinstated after successful probe");
                        }
                    }
                }
            }
            Err(error_class) => {
                history.push(false);
                registry.update_probe(&id, false, 0, None, None);
                let streak = history.consecutive_failures();
                if streak >= config.failure_streak_threshold {
                    warn!(backend = %id, ?error_class, streak, "probe failures exceeded threshold, excluding");
                    registry.exclude_on_probe_failure(&id);
                }
            }
        }

        let tier = history.tier();
        tokio::time::sleep(interval_for(tier, &config)).await;
    }
}

/// Spawn one prober task per configured backend.
pub fn spawn_all(ids: &[BackendId], registry: Arc<Registry>, backends: Arc<WorkerPool>, config: HealthConfig) {
    for id in ids {
        tokio::spawn(run_prober(
            id.clone(),
            Arc::clone(&registry),
            Arc::clone(&backends),
            config.clone(),
        ));
    }
}
