//! Priority queue (C6) — age-weighted admission layer.
//!
//! Grounded on the retrieval pack's `QueuedRequest: Ord` (priority, then
//! submission order) comparator pattern, adapted to spec §4.6's age-boosted
//! *effective* priority: `effective_priority(priority, submitted_at)` is not
//! a fixed key, it grows with wait time, so a classic `BinaryHeap` (whose
//! ordering must stay valid while an element sits inside it) doesn't fit —
//! the comparator recomputes against `Instant::now()` on every comparison.
//! Instead entries live in a `Vec` guarded by a mutex and `pop_ready` takes
//! the effective-priority maximum by linear scan, which is fine at the
//! `max_queue_size` scale (default 1000) this queue is sized for. See
//! DESIGN.md.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::domain::{RequestContext, RequestId};
use crate::error::RouterError;
use crate::request::InboundRequest;

/// One queued request. Owned by the queue until popped; ownership transfers
/// to the dispatcher on `pop_ready`.
pub struct QueueEntry {
    pub request_id: RequestId,
    pub context: RequestContext,
    pub payload: InboundRequest,
    pub deadline: Option<Instant>,
    /// Cancelled when the caller's side of `submit`'s receiver is dropped
    /// (the gateway handler's future was cancelled, i.e. the client
    /// disconnected). The dispatcher races this against the in-flight
    /// upstream call so a vanished client aborts the attempt instead of
    /// running it to completion for nobody.
    pub cancel_token: CancellationToken,
    enqueued_at: Instant,
    seq: u64,
    extra_age_credit_ms: u64,
    completion: oneshot::Sender<Result<crate::domain::RoutedResponse, RouterError>>,
}

impl QueueEntry {
    /// Fulfil the caller's future with a terminal result. A dropped
    /// receiver (client disconnected) makes this a no-op.
    pub fn complete(self, result: Result<crate::domain::RoutedResponse, RouterError>) {
        let _ = self.completion.send(result);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

fn age_boost(waited_ms: u64, step_ms: u64, cap: u8) -> u8 {
    let steps = waited_ms / step_ms.max(1);
    steps.min(cap as u64) as u8
}

fn effective_priority(priority: u8, waited_ms: u64, step_ms: u64, cap: u8) -> u8 {
    (priority + age_boost(waited_ms, step_ms, cap)).min(10)
}

struct Inner {
    entries: Vec<QueueEntry>,
    next_seq: u64,
    wait_samples: std::collections::HashMap<u8, VecDeque<u64>>,
}

pub struct PriorityQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    max_queue_size: usize,
    age_boost_step_ms: u64,
    age_boost_cap: u8,
}

const WAIT_SAMPLE_WINDOW: usize = 200;

impl PriorityQueue {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            inner: Mutex::new(Inner { entries: Vec::new(), next_seq: 0, wait_samples: Default::default() }),
            notify: Notify::new(),
            max_queue_size: config.max_queue_size,
            age_boost_step_ms: config.age_boost_step_ms,
            age_boost_cap: config.age_boost_cap,
        }
    }

    /// Admit a request. `O(1)` append; validates `priority ∈ [1,10]` and
    /// enforces `max_queue_size`. Returns the completion receiver alongside
    /// the entry's cancellation token — the caller is expected to cancel
    /// the token (typically via [`CancellationToken::drop_guard`]) when it
    /// stops waiting on the receiver.
    pub fn submit(
        &self,
        context: RequestContext,
        payload: InboundRequest,
        deadline: Option<Duration>,
    ) -> Result<(oneshot::Receiver<Result<crate::domain::RoutedResponse, RouterError>>, CancellationToken), RouterError>
    {
        if !(1..=10).contains(&context.priority) {
            return Err(RouterError::ClientError(format!(
                "priority {} out of range [1,10]",
                context.priority
            )));
        }

        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if inner.entries.len() >= self.max_queue_size {
            return Err(RouterError::QueueFull);
        }

        let (tx, rx) = oneshot::channel();
        let cancel_token = CancellationToken::new();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.push(QueueEntry {
            request_id: Uuid::new_v4(),
            context,
            payload,
            deadline: deadline.map(|d| Instant::now() + d),
            cancel_token: cancel_token.clone(),
            enqueued_at: Instant::now(),
            seq,
            extra_age_credit_ms: 0,
            completion: tx,
        });
        drop(inner);
        self.notify.notify_one();
        Ok((rx, cancel_token))
    }

    /// Pop the highest effective-priority entry, FIFO among ties. Waits
    /// cooperatively until an entry is available.
    pub async fn pop_ready(&self) -> QueueEntry {
        loop {
            {
                let mut inner = self.inner.lock().expect("queue lock poisoned");
                if let Some(index) = self.best_index(&inner.entries) {
                    let entry = inner.entries.remove(index);
                    let waited_ms = entry.enqueued_at.elapsed().as_millis() as u64;
                    inner
                        .wait_samples
                        .entry(entry.context.priority)
                        .or_default()
                        .push_back(waited_ms);
                    let samples = inner.wait_samples.get_mut(&entry.context.priority).unwrap();
                    if samples.len() > WAIT_SAMPLE_WINDOW {
                        samples.pop_front();
                    }
                    return entry;
                }
            }
            self.notify.notified().await;
        }
    }

    fn best_index(&self, entries: &[QueueEntry]) -> Option<usize> {
        let now = Instant::now();
        entries
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                let a_eff = effective_priority(
                    a.context.priority,
                    now.duration_since(a.enqueued_at).as_millis() as u64 + a.extra_age_credit_ms,
                    self.age_boost_step_ms,
                    self.age_boost_cap,
                );
                let b_eff = effective_priority(
                    b.context.priority,
                    now.duration_since(b.enqueued_at).as_millis() as u64 + b.extra_age_credit_ms,
                    self.age_boost_step_ms,
                    self.age_boost_cap,
                );
                a_eff.cmp(&b_eff).then_with(|| b.seq.cmp(&a.seq))
            })
            .map(|(i, _)| i)
    }

    /// Idempotent removal by request ID. Returns `true` if an entry was
    /// actually removed (it may already have been popped).
    pub fn cancel(&self, request_id: RequestId) -> bool {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let Some(index) = inner.entries.iter().position(|e| e.request_id == request_id) else {
            return false;
        };
        let entry = inner.entries.remove(index);
        entry.cancel_token.cancel();
        entry.complete(Err(RouterError::Cancelled));
        true
    }

    /// Re-admit an entry at the head of its priority, with an extra age
    /// credit so it is re-picked ahead of same-priority peers (spec §4.7:
    /// "briefly re-queued with a small age credit" when every candidate is
    /// at its concurrency cap).
    pub fn requeue_with_age_credit(&self, mut entry: QueueEntry, credit_ms: u64) {
        entry.extra_age_credit_ms += credit_ms;
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.entries.push(entry);
        drop(inner);
        self.notify.notify_one();
    }

    pub fn depth(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").entries.len()
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().expect("queue lock poisoned");
        let mut per_priority_depth = std::collections::HashMap::new();
        for entry in &inner.entries {
            *per_priority_depth.entry(entry.context.priority).or_insert(0usize) += 1;
        }

        let mut per_priority_wait = std::collections::HashMap::new();
        for (priority, samples) in &inner.wait_samples {
            if samples.is_empty() {
                continue;
            }
            let mut sorted: Vec<u64> = samples.iter().copied().collect();
            sorted.sort_unstable();
            let p50 = sorted[sorted.len() / 2];
            let p95_index = ((sorted.len() as f64) * 0.95) as usize;
            let p95 = sorted[p95_index.min(sorted.len() - 1)];
            per_priority_wait.insert(*priority, (p50, p95));
        }

        QueueStats { depth: inner.entries.len(), per_priority_depth, per_priority_wait_ms: per_priority_wait }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStats {
    pub depth: usize,
    pub per_priority_depth: std::collections::HashMap<u8, usize>,
    pub per_priority_wait_ms: std::collections::HashMap<u8, (u64, u64)>,
}
