//! Hyde generation boundary.
//!
//! Epistemic foundation:
//! - K_i: Positions are 1-based and follow request order
//! - B_i: The model may wrap, pad or mangle its JSON → fence strip, one recovery
//! - I^B: A malformed mapping cannot be trusted in part → whole batch dropped
//!
//! Callers see only `Generator::generate`: an ordered list of queries in,
//! a map from 1-based batch position to replacement text out. Prompting,
//! fence stripping and JSON recovery stay inside the adapter.
//!
//! Contract:
//! - `Err` means the service call itself failed; the caller stops the run.
//! - `Ok(empty)` means the response could not be parsed or held an unusable
//!   entry; the whole batch is lost and the caller moves on.
//! - A position absent from the map is missing for that record only.

use crate::client::{ChatClient, Message};
use crate::models::{ModelSpec, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Replacement texts keyed by 1-based position in the requested batch.
pub type Generated = BTreeMap<usize, String>;

/// Anything that can turn a batch of queries into replacement texts.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, queries: &[String]) -> Result<Generated>;
}

/// Generates hyde snippets through a chat-completions endpoint.
pub struct HydeGenerator {
    client: Arc<ChatClient>,
    model: ModelSpec,
}

impl HydeGenerator {
    pub fn new(client: Arc<ChatClient>, model: ModelSpec) -> Self {
        Self { client, model }
    }

    /// The underlying client, for usage reporting.
    pub fn client(&self) -> &Arc<ChatClient> {
        &self.client
    }
}

#[async_trait]
impl Generator for HydeGenerator {
    async fn generate(&self, queries: &[String]) -> Result<Generated> {
        let prompt = build_hyde_prompt(queries);
        let completion = self
            .client
            .complete(&self.model, &[Message::user(prompt)])
            .await?;

        debug!(
            model = %completion.model,
            input_tokens = completion.input_tokens,
            output_tokens = completion.output_tokens,
            duration_ms = completion.duration.as_millis() as u64,
            "Generation call complete"
        );

        match parse_generated(&completion.content) {
            Some(generated) => Ok(generated),
            None => {
                warn!(
                    response = %preview(&completion.content, 500),
                    "Could not parse generation response, batch yields no repairs"
                );
                Ok(Generated::new())
            }
        }
    }
}

/// Build the instruction prompt for one batch.
pub fn build_hyde_prompt(queries: &[String]) -> String {
    let numbered: Vec<String> = queries
        .iter()
        .enumerate()
        .map(|(i, q)| format!("{}. {q}", i + 1))
        .collect();

    format!(
        r#"Generate hypothetical document snippets (hyde) for each query below.

Requirements:
- 100-180 characters each
- Query-specific factual information
- Written as if from an actual document that would answer the query
- NO generic phrases like "comprehensive guide" or "everything you need to know"
- Include actual facts, numbers, names, or specifics

Example:
Query: "kubernetes pod networking"
Hyde: "Pods communicate via cluster IP. Use CNI plugins like Calico or Flannel. Service discovery through DNS. NetworkPolicy controls traffic between namespaces."

Queries to process:
{}

Output ONLY valid JSON - a single object mapping query numbers to hyde texts:
{{"1": "hyde text for query 1", "2": "hyde text for query 2", ...}}"#,
        numbered.join("\n")
    )
}

/// Parse a service response into position → text.
///
/// Returns `None` when no JSON object can be recovered, or when any entry
/// has a key that is not a positive integer or a value that is not a string.
/// A malformed mapping is never partially applied.
pub fn parse_generated(content: &str) -> Option<Generated> {
    let body = strip_fences(content);

    let object = serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(body)
        .ok()
        .or_else(|| {
            // One recovery attempt: the outermost braces, ignoring surrounding prose.
            let start = body.find('{')?;
            let end = body.rfind('}')?;
            (start < end)
                .then(|| serde_json::from_str(&body[start..=end]).ok())
                .flatten()
        })?;

    let mut generated = Generated::new();
    for (key, value) in object {
        match (key.trim().parse::<usize>(), value.as_str()) {
            (Ok(pos), Some(text)) if pos > 0 => {
                generated.insert(pos, text.to_string());
            }
            _ => {
                debug!(key = %key, "Unusable entry in generation response, rejecting mapping");
                return None;
            }
        }
    }
    Some(generated)
}

/// Remove a surrounding markdown code fence, with or without a language tag.
fn strip_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner
        .strip_prefix("json")
        .or_else(|| inner.strip_prefix("JSON"))
        .unwrap_or(inner);
    let inner = match inner.find("```") {
        Some(end) => &inner[..end],
        None => inner,
    };
    inner.trim()
}

/// First `max_chars` characters of `text`, for log lines.
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_numbers_queries_in_order() {
        let prompt = build_hyde_prompt(&["pod networking".to_string(), "rust lifetimes".to_string()]);
        assert!(prompt.contains("1. pod networking\n2. rust lifetimes"));
        assert!(prompt.contains("100-180 characters"));
        assert!(prompt.contains(r#"{"1": "hyde text for query 1""#));
    }

    #[test]
    fn test_parse_plain_object() {
        let parsed = parse_generated(r#"{"1": "alpha", "2": "beta"}"#).unwrap();
        assert_eq!(parsed.get(&1).map(String::as_str), Some("alpha"));
        assert_eq!(parsed.get(&2).map(String::as_str), Some("beta"));
    }

    #[test]
    fn test_parse_fenced_object() {
        let content = "```json\n{\"1\": \"Pods use a flat network.\"}\n```";
        let parsed = parse_generated(content).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[&1], "Pods use a flat network.");
    }

    #[test]
    fn test_parse_fence_without_language_tag() {
        let parsed = parse_generated("```\n{\"3\": \"x\"}\n```").unwrap();
        assert_eq!(parsed[&3], "x");
    }

    #[test]
    fn test_parse_recovers_from_surrounding_prose() {
        let content = "Here are your snippets:\n{\"1\": \"a\"}\nLet me know if you need more.";
        let parsed = parse_generated(content).unwrap();
        assert_eq!(parsed[&1], "a");
    }

    #[test]
    fn test_parse_failure_is_none() {
        assert!(parse_generated("I cannot help with that.").is_none());
        assert!(parse_generated("{\"1\": \"unterminated").is_none());
        assert!(parse_generated("[\"a\", \"b\"]").is_none());
        assert!(parse_generated("").is_none());
    }

    #[test]
    fn test_parse_rejects_mapping_with_unusable_entries() {
        assert!(parse_generated(r#"{"1": "good text", "two": "bad key", "3": 42}"#).is_none());
        assert!(parse_generated(r#"{"1": "ok", "0": "zero"}"#).is_none());
        assert!(parse_generated(r#"{"1": "ok", "2": null}"#).is_none());
    }

    #[test]
    fn test_parse_keeps_positions_beyond_batch() {
        // Positions outside the batch are dropped by the caller, not here.
        let parsed = parse_generated(r#"{"1": "a", "99": "b"}"#).unwrap();
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_parse_empty_object() {
        assert_eq!(parse_generated("{}"), Some(Generated::new()));
    }

    #[test]
    fn test_preview_respects_char_boundaries() {
        assert_eq!(preview("héllo wörld", 4), "héll...");
        assert_eq!(preview("short", 10), "short");
    }
}
