//! AI characterization of a generation template: what data it needs.

use anyhow::bail;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

use crate::ai::{parse_llm_json, TextGenerator};
use crate::document_text::DocumentPreview;
use crate::error::AppError;
use crate::poll::retry;
use crate::schema::TemplateMetadata;

const SYSTEM_PROMPT: &str = "You analyze document-generation templates and describe the \
source data needed to fill them. Respond with a single JSON object and nothing else.";

const ANALYSIS_SHAPE: &str = r#"{
  "requiredDataTypes": ["kinds of data the template needs, e.g. invoices, headcount"],
  "expectedEntities": ["records the template reports on, e.g. customer, vendor"],
  "dataStructureNeeds": ["e.g. line items, monthly totals"],
  "hasTables": true,
  "requiresAggregation": false,
  "requiresTimeSeries": false,
  "requiresComparisons": false,
  "requiresFiltering": false,
  "compatibleDocumentTypes": ["document types likely to supply the data"]
}"#;

pub const ANALYSIS_ATTEMPTS: u32 = 2;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct TemplateAnalysis {
    required_data_types: Option<Vec<String>>,
    expected_entities: Option<Vec<String>>,
    data_structure_needs: Option<Vec<String>>,
    has_tables: Option<bool>,
    requires_aggregation: Option<bool>,
    requires_time_series: Option<bool>,
    requires_comparisons: Option<bool>,
    requires_filtering: Option<bool>,
    compatible_document_types: Option<Vec<String>>,
}

impl TemplateAnalysis {
    fn is_useful(&self) -> bool {
        let any = |v: &Option<Vec<String>>| v.as_ref().is_some_and(|v| !v.is_empty());
        any(&self.required_data_types) || any(&self.expected_entities)
    }
}

fn cleaned(values: Option<Vec<String>>) -> Vec<String> {
    values
        .unwrap_or_default()
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn build_prompt(name: &str, preview: &DocumentPreview) -> String {
    let mut prompt = format!("Template: {}\n", name);
    if !preview.sheet_names.is_empty() {
        prompt.push_str(&format!("Sheets: {}\n", preview.sheet_names.join(", ")));
    }
    prompt.push_str(&format!(
        "\n--- TEMPLATE START ---\n{}\n--- TEMPLATE END ---\n\n\
         Return ONLY valid JSON with this structure:\n{}",
        preview.text, ANALYSIS_SHAPE
    ));
    prompt
}

pub struct TemplateAnalyzer {
    attempts: u32,
    backoff: Duration,
}

impl Default for TemplateAnalyzer {
    fn default() -> Self {
        Self::new(ANALYSIS_ATTEMPTS, Duration::from_secs(2))
    }
}

impl TemplateAnalyzer {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self { attempts, backoff }
    }

    /// Characterize a template. Generation statistics carry over from
    /// `existing` when the template is re-analyzed.
    pub async fn analyze(
        &self,
        generator: &dyn TextGenerator,
        slug: &str,
        name: &str,
        preview: &DocumentPreview,
        existing: Option<&TemplateMetadata>,
    ) -> Result<TemplateMetadata, AppError> {
        let prompt = build_prompt(name, preview);
        let prompt = prompt.as_str();

        let analysis = retry(self.attempts, self.backoff, move |attempt| async move {
            debug!(template = slug, attempt, "Requesting template analysis");
            let response = generator.generate(SYSTEM_PROMPT, prompt).await?;
            let analysis: TemplateAnalysis = parse_llm_json(&response)?;
            if !analysis.is_useful() {
                bail!("analysis lists no required data types or entities");
            }
            Ok::<_, anyhow::Error>(analysis)
        })
        .await
        .map_err(|e| AppError::ExtractionFailed {
            filename: name.to_string(),
            reason: format!("{:#}", e),
        })?;

        let mut template = TemplateMetadata::new(slug, name);
        template.required_data_types = cleaned(analysis.required_data_types);
        template.expected_entities = cleaned(analysis.expected_entities);
        template.data_structure_needs = cleaned(analysis.data_structure_needs);
        template.has_tables = analysis.has_tables.unwrap_or(preview.has_tables);
        template.requires_aggregation = analysis.requires_aggregation.unwrap_or(false);
        template.requires_time_series = analysis.requires_time_series.unwrap_or(false);
        template.requires_comparisons = analysis.requires_comparisons.unwrap_or(false);
        template.requires_filtering = analysis.requires_filtering.unwrap_or(false);
        template.compatible_document_types = cleaned(analysis.compatible_document_types);
        if let Some(previous) = existing {
            template.generation_stats = previous.generation_stats.clone();
        }

        info!(
            template = slug,
            "Template characterized: {} data types, {} entities",
            template.required_data_types.len(),
            template.expected_entities.len()
        );
        Ok(template)
    }
}
