//! Request analyzer (C4) — pure classification from payload alone, no
//! network I/O. Mirrors the teacher's `router::is_sufficient`: a pure
//! function plus a table-driven `#[cfg(test)]` block.

use chrono::Utc;

use crate::config::AnalyzerConfig;
use crate::domain::{Complexity, RequestContext, TaskType};
use crate::metrics_recorder::MetricsRecorder;
use crate::request::InboundRequest;

/// Static duration table (spec §4.4), used until a `(task_type, model)`
/// history with enough samples exists.
fn static_duration_ms(task_type: TaskType, complexity: Complexity) -> u64 {
    use Complexity::*;
    use TaskType::*;
    match (task_type, complexity) {
        (Embedding, Low) => 50,
        (Embedding, Medium) => 150,
        (Embedding, High) => 400,
        (Classification, Low) => 80,
        (Classification, Medium) => 250,
        (Classification, High) => 600,
        (_, Low) => 800,
        (_, Medium) => 2_500,
        (_, High) => 6_000,
    }
}

fn task_type(request: &InboundRequest) -> TaskType {
    if matches!(request, InboundRequest::Embed(_)) {
        return TaskType::Embedding;
    }

    let text = request.analyzable_text().to_lowercase();
    if text.contains("summarize") {
        TaskType::Summarization
    } else if text.contains("classify") {
        TaskType::Classification
    } else if text.contains("analyse") || text.contains("analyze") || text.contains("analysis") {
        TaskType::Analysis
    } else if text.contains("extract") {
        TaskType::Extraction
    } else {
        TaskType::Generation
    }
}

fn complexity(estimated_tokens: u32, turn_depth: usize) -> Complexity {
    let mut bucket = if estimated_tokens < 500 {
        Complexity::Low
    } else if estimated_tokens < 2_000 {
        Complexity::Medium
    } else {
        Complexity::High
    };
    if turn_depth >= 4 {
        bucket = bucket.upgrade();
    }
    bucket
}

fn requires_gpu(task_type: TaskType, estimated_tokens: u32, gpu_token_threshold: u32) -> bool {
    matches!(task_type, TaskType::Generation | TaskType::Summarization | TaskType::Analysis)
        || estimated_tokens > gpu_token_threshold
}

/// Classify an inbound request into a [`RequestContext`].
///
/// `metrics` supplies observed `(task_type, model)` duration history; falls
/// back to [`static_duration_ms`] when fewer than
/// [`crate::metrics_recorder::DURATION_MEDIAN_MIN_SAMPLES`] samples exist.
pub fn analyze(request: &InboundRequest, metrics: &MetricsRecorder, config: &AnalyzerConfig) -> RequestContext {
    let char_len = request.char_len();
    let estimated_tokens = (char_len / 4) as u32;
    let task_type = task_type(request);
    let complexity = complexity(estimated_tokens, request.turn_depth());
    let requires_gpu = requires_gpu(task_type, estimated_tokens, config.gpu_token_threshold);

    let estimated_duration_ms = metrics
        .median_duration_ms(task_type, request.model())
        .unwrap_or_else(|| static_duration_ms(task_type, complexity));

    let priority = request.priority().unwrap_or(5).clamp(1, 10);
    if request.priority().is_some_and(|p| !(1..=10).contains(&p)) {
        tracing::warn!(
            requested_priority = request.priority().unwrap(),
            clamped_to = priority,
            "priority out of range [1,10] — clamped"
        );
    }

    RequestContext {
        task_type,
        complexity,
        requires_gpu,
        estimated_tokens,
        estimated_duration_ms,
        model_name: request.model().to_string(),
        priority,
        submitted_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetricsConfig;
    use crate::registry::Registry;
    use crate::request::{ChatMessage, ChatRequest, EmbedInput, EmbedRequest, GenerateRequest};
    use serde_json::Map;
    use std::sync::Arc;

    fn metrics() -> MetricsRecorder {
        let registry = Arc::new(Registry::new(&[], &Default::default(), &Default::default()));
        MetricsRecorder::new(registry, &MetricsConfig::default())
    }

    fn cfg() -> AnalyzerConfig {
        AnalyzerConfig::default()
    }

    fn chat(content: &str, priority: Option<u8>) -> InboundRequest {
        InboundRequest::Chat(ChatRequest {
            model: "m".into(),
            messages: vec![ChatMessage { role: "user".into(), content: content.into() }],
            stream: false,
            priority,
            extra: Map::new(),
        })
    }

    #[test]
    fn embed_endpoint_is_always_embedding_task() {
        let req = InboundRequest::Embed(EmbedRequest {
            model: "m".into(),
            input: EmbedInput::Single("summarize this please".into()),
            priority: None,
            extra: Map::new(),
        });
        let ctx = analyze(&req, &metrics(), &cfg());
        assert_eq!(ctx.task_type, TaskType::Embedding);
        assert!(!ctx.requires_gpu);
    }

    #[test]
    fn keyword_scan_detects_summarization() {
        let req = chat("Please summarize this document for me.", None);
        let ctx = analyze(&req, &metrics(), &cfg());
        assert_eq!(ctx.task_type, TaskType::Summarization);
        assert!(ctx.requires_gpu);
    }

    #[test]
    fn keyword_scan_defaults_to_generation() {
        let req = chat("Write me a poem about the ocean.", None);
        let ctx = analyze(&req, &metrics(), &cfg());
        assert_eq!(ctx.task_type, TaskType::Generation);
    }

    #[test]
    fn complexity_buckets_by_char_length() {
        let short = chat("hi", None);
        assert_eq!(analyze(&short, &metrics(), &cfg()).complexity, Complexity::Low);

        let medium = chat(&"x".repeat(1_000), None);
        assert_eq!(analyze(&medium, &metrics(), &cfg()).complexity, Complexity::Medium);

        let long = chat(&"x".repeat(10_000), None);
        assert_eq!(analyze(&long, &metrics(), &cfg()).complexity, Complexity::High);
    }

    #[test]
    fn multi_turn_conversation_upgrades_complexity_one_bucket() {
        let req = InboundRequest::Chat(ChatRequest {
            model: "m".into(),
            messages: vec![
                ChatMessage { role: "user".into(), content: "hi".into() },
                ChatMessage { role: "assistant".into(), content: "hello".into() },
                ChatMessage { role: "user".into(), content: "ok".into() },
                ChatMessage { role: "assistant".into(), content: "ok".into() },
            ],
            stream: false,
            priority: None,
            extra: Map::new(),
        });
        // Total chars are tiny (low bucket) but depth >= 4 upgrades to medium.
        assert_eq!(analyze(&req, &metrics(), &cfg()).complexity, Complexity::Medium);
    }

    #[test]
    fn priority_defaults_to_five_and_clamps_out_of_range() {
        assert_eq!(analyze(&chat("hi", None), &metrics(), &cfg()).priority, 5);
        assert_eq!(analyze(&chat("hi", Some(0)), &metrics(), &cfg()).priority, 1);
        assert_eq!(analyze(&chat("hi", Some(200)), &metrics(), &cfg()).priority, 10);
        assert_eq!(analyze(&chat("hi", Some(7)), &metrics(), &cfg()).priority, 7);
    }

    #[test]
    fn generate_requires_gpu_by_task_type() {
        let req = InboundRequest::Generate(GenerateRequest {
            model: "m".into(),
            prompt: "short".into(),
            stream: false,
            priority: None,
            extra: Map::new(),
        });
        assert!(analyze(&req, &metrics(), &cfg()).requires_gpu);
    }

    #[test]
    fn small_embedding_does_not_require_gpu() {
        let req = InboundRequest::Embed(EmbedRequest {
            model: "m".into(),
            input: EmbedInput::Single("hi".into()),
            priority: None,
            extra: Map::new(),
        });
        assert!(!analyze(&req, &metrics(), &cfg()).requires_gpu);
    }

    #[test]
    fn large_embedding_requires_gpu_via_token_threshold() {
        let req = InboundRequest::Embed(EmbedRequest {
            model: "m".into(),
            input: EmbedInput::Single("x".repeat(40_000)),
            priority: None,
            extra: Map::new(),
        });
        assert!(analyze(&req, &metrics(), &cfg()).requires_gpu);
    }
}
