//! Core data model shared by every component: backend identity and state,
//! request classification, scoring output, and performance samples.
//!
//! These types cross component boundaries (registry ⇄ scorer ⇄ dispatcher
//! ⇄ gateway) and the admin API, so they derive `Serialize`/`Deserialize`
//! the way the teacher crate derives them on `TrafficEntry`/`TrafficStats`.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of one configured upstream backend: `(host, port)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct BackendId {
    pub host: String,
    pub port: u16,
}

impl BackendId {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Operator-declared capacity tier. Drives `priority_alignment` in the scorer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeclaredTier {
    #[default]
    Standard,
    High,
}

/// Classification of an inbound request. Produced once by the analyzer and
/// immutable thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Generation,
    Embedding,
    Classification,
    Extraction,
    Summarization,
    Analysis,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Generation => "generation",
            Self::Embedding => "embedding",
            Self::Classification => "classification",
            Self::Extraction => "extraction",
            Self::Summarization => "summarization",
            Self::Analysis => "analysis",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl Complexity {
    /// One bucket up from `self`, saturating at `High`.
    pub fn upgrade(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium | Self::High => Self::High,
        }
    }
}

/// The classification a request carries through the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    pub task_type: TaskType,
    pub complexity: Complexity,
    pub requires_gpu: bool,
    pub estimated_tokens: u32,
    pub estimated_duration_ms: u64,
    pub model_name: String,
    /// Clamped to `[1, 10]` by the analyzer before construction.
    pub priority: u8,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub submitted_at: chrono::DateTime<chrono::Utc>,
}

/// Upstream failure classification, used by the dispatcher's retry policy
/// and by the registry's exclusion rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    NetworkError,
    Timeout,
    UpstreamClientError,
    UpstreamServerError,
    Malformed,
    Cancelled,
}

impl ErrorClass {
    /// Errors that count against a backend's failure streak / exclusion.
    pub fn counts_against_backend(self) -> bool {
        !matches!(self, Self::Cancelled | Self::UpstreamClientError)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NetworkError => "network_error",
            Self::Timeout => "timeout",
            Self::UpstreamClientError => "upstream_client_error",
            Self::UpstreamServerError => "upstream_server_error",
            Self::Malformed => "malformed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A single terminal dispatch outcome, appended to the metrics recorder's
/// ring buffers for everything except cancellations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub backend_id: BackendId,
    pub task_type: TaskType,
    pub model_name: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub started_at: chrono::DateTime<chrono::Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub finished_at: chrono::DateTime<chrono::Utc>,
    pub success: bool,
    pub error_class: Option<ErrorClass>,
    pub actual_duration_ms: u64,
    pub prompt_size: u32,
    pub completion_size: u32,
}

/// The ranked outcome of one scoring call, attached to the response and the
/// metrics sample for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringDecision {
    pub chosen: BackendId,
    pub score: f64,
    pub alternatives: Vec<(BackendId, f64)>,
    pub rationale: String,
}

/// Per-attempt diagnostic recorded when a dispatch attempt fails, surfaced
/// to the caller in `AllAttemptsFailed` responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptDiagnostic {
    pub backend_id: BackendId,
    pub error_class: ErrorClass,
    pub message: String,
}

/// Unique identifier for one queued/dispatched request.
pub type RequestId = Uuid;

/// The outcome handed back to the caller awaiting a dispatched request:
/// the raw upstream JSON body plus the routing metadata attached along the
/// way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutedResponse {
    pub body: serde_json::Value,
    pub routing: RoutingMeta,
}

/// The `routing` envelope section described in spec §4.9.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingMeta {
    pub chosen_backend: String,
    pub task_type: TaskType,
    pub complexity: Complexity,
    pub decision_score: f64,
    pub rationale: String,
    pub actual_duration_ms: u64,
    pub failed_attempts: Vec<AttemptDiagnostic>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complexity_upgrade_saturates() {
        assert_eq!(Complexity::Low.upgrade(), Complexity::Medium);
        assert_eq!(Complexity::Medium.upgrade(), Complexity::High);
        assert_eq!(Complexity::High.upgrade(), Complexity::High);
    }

    #[test]
    fn error_class_counts_against_backend() {
        assert!(ErrorClass::NetworkError.counts_against_backend());
        assert!(ErrorClass::Timeout.counts_against_backend());
        assert!(ErrorClass::UpstreamServerError.counts_against_backend());
        assert!(!ErrorClass::Cancelled.counts_against_backend());
        assert!(!ErrorClass::UpstreamClientError.counts_against_backend());
    }

    #[test]
    fn backend_id_formats_host_port() {
        let id = BackendId::new("10.0.0.1", 11434);
        assert_eq!(id.to_string(), "10.0.0.1:11434");
        assert_eq!(id.base_url(), "http://10.0.0.1:11434");
    }
}
