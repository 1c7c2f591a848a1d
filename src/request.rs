//! Inbound request payloads.
//!
//! Spec §9 models inbound bodies as tagged variants over `{chat, generate,
//! embed}` plus a free-form passthrough `extra` mapping for forward
//! compatibility — the wire discriminator is the endpoint path, not a JSON
//! field, so [`InboundRequest`] is a plain Rust enum built by the handler
//! for the route it's serving rather than a `#[serde(tag = ...)]` type.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Ollama's `/api/embed` accepts either a single string or a batch.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum EmbedInput {
    Single(String),
    Batch(Vec<String>),
}

impl EmbedInput {
    fn char_len(&self) -> usize {
        match self {
            Self::Single(s) => s.len(),
            Self::Batch(items) => items.iter().map(String::len).sum(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbedRequest {
    pub model: String,
    pub input: EmbedInput,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One inbound request, tagged by the route that received it.
#[derive(Debug, Clone)]
pub enum InboundRequest {
    Chat(ChatRequest),
    Generate(GenerateRequest),
    Embed(EmbedRequest),
}

impl InboundRequest {
    pub fn model(&self) -> &str {
        match self {
            Self::Chat(r) => &r.model,
            Self::Generate(r) => &r.model,
            Self::Embed(r) => &r.model,
        }
    }

    pub fn priority(&self) -> Option<u8> {
        match self {
            Self::Chat(r) => r.priority,
            Self::Generate(r) => r.priority,
            Self::Embed(r) => r.priority,
        }
    }

    pub fn stream(&self) -> bool {
        match self {
            Self::Chat(r) => r.stream,
            Self::Generate(r) => r.stream,
            Self::Embed(_) => false,
        }
    }

    /// The text the analyzer scans for task-type keywords: the last user
    /// message for chat, the prompt for generate, the joined input for embed.
    pub fn analyzable_text(&self) -> String {
        match self {
            Self::Chat(r) => r
                .messages
                .iter()
                .rev()
                .find(|m| m.role == "user")
                .map(|m| m.content.clone())
                .unwrap_or_default(),
            Self::Generate(r) => r.prompt.clone(),
            Self::Embed(_) => String::new(),
        }
    }

    /// Character length used as the `chars / 4` token-count proxy (spec §4.4).
    pub fn char_len(&self) -> usize {
        match self {
            Self::Chat(r) => r.messages.iter().map(|m| m.content.len()).sum(),
            Self::Generate(r) => r.prompt.len(),
            Self::Embed(r) => r.input.char_len(),
        }
    }

    /// Conversation depth, for the multi-turn complexity upgrade rule.
    pub fn turn_depth(&self) -> usize {
        match self {
            Self::Chat(r) => r.messages.len(),
            Self::Generate(_) | Self::Embed(_) => 1,
        }
    }

    /// Serialize the request back to the JSON body forwarded upstream,
    /// with `model` rewritten to the chosen backend's view of the model name.
    pub fn to_upstream_body(&self, model: &str) -> Value {
        let mut value = match self {
            Self::Chat(r) => serde_json::to_value(r),
            Self::Generate(r) => serde_json::to_value(r),
            Self::Embed(r) => serde_json::to_value(r),
        }
        .unwrap_or_else(|_| Value::Object(Map::new()));

        if let Some(obj) = value.as_object_mut() {
            obj.insert("model".into(), Value::String(model.to_string()));
            obj.remove("priority");
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(messages: &[(&str, &str)]) -> InboundRequest {
        InboundRequest::Chat(ChatRequest {
            model: "m".into(),
            messages: messages
                .iter()
                .map(|(role, content)| ChatMessage { role: (*role).into(), content: (*content).into() })
                .collect(),
            stream: false,
            priority: None,
            extra: Map::new(),
        })
    }

    #[test]
    fn analyzable_text_picks_last_user_message() {
        let req = chat(&[("user", "first"), ("assistant", "reply"), ("user", "second")]);
        assert_eq!(req.analyzable_text(), "second");
    }

    #[test]
    fn turn_depth_counts_all_messages() {
        let req = chat(&[("user", "a"), ("assistant", "b"), ("user", "c")]);
        assert_eq!(req.turn_depth(), 3);
    }

    #[test]
    fn to_upstream_body_rewrites_model_and_drops_priority() {
        let req = InboundRequest::Generate(GenerateRequest {
            model: "original".into(),
            prompt: "hi".into(),
            stream: false,
            priority: Some(9),
            extra: Map::new(),
        });
        let body = req.to_upstream_body("llama3");
        assert_eq!(body["model"], "llama3");
        assert!(body.get("priority").is_none());
    }

    #[test]
    fn embed_char_len_sums_batch_entries() {
        let req = InboundRequest::Embed(EmbedRequest {
            model: "m".into(),
            input: EmbedInput::Batch(vec!["abcd".into(), "ef".into()]),
            priority: None,
            extra: Map::new(),
        });
        assert_eq!(req.char_len(), 6);
    }
}
