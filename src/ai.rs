//! Text-generation seam and helpers for pulling JSON out of model replies.

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, OnceLock};

use crate::doc_service::IndexingService;

/// An opaque remote text function: prompt in, free text out.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, system: &str, prompt: &str) -> Result<String>;
}

/// Chat against a workspace of the indexing service, so the model answers
/// with the workspace's embedded documents in context.
pub struct WorkspaceChat {
    service: Arc<dyn IndexingService>,
    workspace: String,
}

impl WorkspaceChat {
    pub fn new(service: Arc<dyn IndexingService>, workspace: impl Into<String>) -> Self {
        Self {
            service,
            workspace: workspace.into(),
        }
    }
}

#[async_trait]
impl TextGenerator for WorkspaceChat {
    async fn generate(&self, system: &str, prompt: &str) -> Result<String> {
        let message = format!("{}\n\n{}", system, prompt);
        self.service
            .chat(&self.workspace, &message)
            .await
            .with_context(|| format!("Workspace chat failed for {}", self.workspace))
    }
}

fn fence_regex() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)```").expect("fence regex is valid")
    })
}

/// Locate the JSON payload inside a model reply.
///
/// Prefers a fenced block; otherwise takes the span from the first opening
/// brace or bracket to the last matching closer.
pub fn extract_json_payload(response: &str) -> Option<&str> {
    if let Some(block) = fence_regex()
        .captures(response)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
    {
        if !block.is_empty() {
            return Some(block);
        }
    }

    let start = response.find(['{', '['])?;
    let closer = if response[start..].starts_with('{') { '}' } else { ']' };
    let end = response.rfind(closer)?;
    (end > start).then(|| response[start..=end].trim())
}

pub fn parse_llm_json<T: serde::de::DeserializeOwned>(response: &str) -> Result<T> {
    let json_str = extract_json_payload(response).with_context(|| {
        format!(
            "No JSON found in response: {}",
            response.chars().take(200).collect::<String>()
        )
    })?;

    // First validate syntax
    let _: serde_json::Value = serde_json::from_str(json_str).context(format!(
        "Invalid JSON syntax: {}",
        &json_str.chars().take(200).collect::<String>()
    ))?;

    // Parse as expected type
    serde_json::from_str(json_str).context(format!(
        "JSON structure mismatch: {}",
        &json_str.chars().take(200).collect::<String>()
    ))
}

/// Truncate to at most `max_chars` bytes on a char boundary.
pub fn truncate_for_context(text: &str, max_chars: usize) -> &str {
    if text.len() <= max_chars {
        text
    } else {
        let mut end = max_chars;
        while !text.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        &text[..end]
    }
}
