//! AI-assisted re-ranking of documents against one template.

use anyhow::{bail, Result};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::ai::{parse_llm_json, TextGenerator};
use crate::schema::{DocumentMetadata, TemplateMetadata};

/// Longest reasoning kept from a model reply, in words.
pub const MAX_REASONING_WORDS: usize = 40;

const SYSTEM_PROMPT: &str = "You rank customer documents by how well their content can \
feed a document-generation template. Score each document from 0 to 10, where 10 means the \
template can be filled almost entirely from it. Judge content, not file format. Respond \
with JSON only.";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AiScore {
    pub filename: String,
    pub score: f64,
    #[serde(default)]
    pub reasoning: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AiReply {
    List(Vec<AiScore>),
    Wrapped { results: Vec<AiScore> },
}

fn build_prompt(template: &TemplateMetadata, docs: &[&DocumentMetadata]) -> String {
    let requirements = json!({
        "templateName": template.template_name,
        "requiredDataTypes": template.required_data_types,
        "expectedEntities": template.expected_entities,
        "dataStructureNeeds": template.data_structure_needs,
        "requiresAggregation": template.requires_aggregation,
        "requiresTimeSeries": template.requires_time_series,
        "requiresComparisons": template.requires_comparisons,
    });
    let documents: Vec<_> = docs
        .iter()
        .map(|d| {
            json!({
                "filename": d.filename,
                "documentType": d.document_type,
                "purpose": d.purpose,
                "dataCategories": d.data_categories,
                "keyTopics": d.key_topics,
                "hasTables": d.has_tables,
                "dateRange": d.date_range,
            })
        })
        .collect();

    format!(
        "Template requirements:\n{}\n\nDocuments:\n{}\n\nReturn a JSON array with one entry \
         per document: [{{\"filename\": \"...\", \"score\": 0-10, \
         \"reasoning\": \"at most {} words\"}}]",
        serde_json::to_string_pretty(&requirements).unwrap_or_default(),
        serde_json::to_string_pretty(&documents).unwrap_or_default(),
        MAX_REASONING_WORDS
    )
}

pub fn truncate_words(text: &str, max_words: usize) -> String {
    text.split_whitespace()
        .take(max_words)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Ask the generator to score `docs`. Entries naming unknown files or
/// carrying a non-finite score are dropped; an empty reply is an error.
pub async fn rerank(
    generator: &dyn TextGenerator,
    template: &TemplateMetadata,
    docs: &[&DocumentMetadata],
) -> Result<Vec<AiScore>> {
    let prompt = build_prompt(template, docs);
    let response = generator.generate(SYSTEM_PROMPT, &prompt).await?;
    let reply: AiReply = parse_llm_json(&response)?;
    let entries = match reply {
        AiReply::List(entries) => entries,
        AiReply::Wrapped { results } => results,
    };

    let scores: Vec<AiScore> = entries
        .into_iter()
        .filter(|e| e.score.is_finite())
        .filter(|e| docs.iter().any(|d| d.filename == e.filename))
        .map(|e| AiScore {
            reasoning: truncate_words(&e.reasoning, MAX_REASONING_WORDS),
            ..e
        })
        .collect();
    if scores.is_empty() {
        bail!("AI ranking named none of the {} documents", docs.len());
    }
    debug!(
        "AI ranking scored {}/{} documents for {}",
        scores.len(),
        docs.len(),
        template.template_slug
    );
    Ok(scores)
}
