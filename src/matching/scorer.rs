//! Deterministic rule-based relevance scoring.
//!
//! Weights (points, before clamping to 0..=10):
//! - required data types covered by the document's categories: up to 4.0
//! - compatible document type: +0.5
//! - expected entities covered (topics, else stakeholders, else primary entities): up to 3.0
//! - secondary signals, capped at 2.0 together: systems +0.75, audience +0.5,
//!   shared purpose vocabulary +0.25 per word (at most 1.0)
//! - structure: both tabular +0.5, aggregation backed by metrics +0.75,
//!   time series backed by a date range +0.75

use std::collections::BTreeSet;

use crate::schema::{DocumentMetadata, MatchResult, TemplateMetadata};

pub const MAX_SCORE: f64 = 10.0;
pub const NEUTRAL_REASON: &str = "General compatibility with template requirements";

const DATA_TYPE_POINTS: f64 = 4.0;
const DOCUMENT_TYPE_BONUS: f64 = 0.5;
const ENTITY_POINTS: f64 = 3.0;
const SECONDARY_CAP: f64 = 2.0;
const SYSTEMS_BONUS: f64 = 0.75;
const AUDIENCE_BONUS: f64 = 0.5;
const VOCABULARY_PER_WORD: f64 = 0.25;
const VOCABULARY_CAP: f64 = 1.0;
const TABULAR_BONUS: f64 = 0.5;
const AGGREGATION_BONUS: f64 = 0.75;
const TIME_SERIES_BONUS: f64 = 0.75;

const STOPWORDS: &[&str] = &[
    "with", "from", "that", "this", "into", "about", "over", "their", "them", "have", "will",
    "each", "data", "document", "documents", "report", "information",
];

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreBreakdown {
    /// Clamped to 0..=10, one decimal.
    pub score: f64,
    /// Never empty.
    pub reasons: Vec<String>,
}

impl ScoreBreakdown {
    pub fn into_match(self, template_slug: &str, filename: &str) -> MatchResult {
        MatchResult {
            filename: filename.to_string(),
            template_slug: template_slug.to_string(),
            relevance_score: self.score,
            reasoning: self.reasons.join("; "),
        }
    }
}

pub fn round_score(raw: f64) -> f64 {
    if raw.is_nan() {
        return 0.0;
    }
    (raw.clamp(0.0, MAX_SCORE) * 10.0).round() / 10.0
}

/// Case-insensitive substring match in either direction.
fn overlaps(a: &str, b: &str) -> bool {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    !a.is_empty() && !b.is_empty() && (a.contains(&b) || b.contains(&a))
}

/// Members of `wanted` that overlap any member of `have`.
fn covered<'a>(wanted: &'a [String], have: &[String]) -> Vec<&'a str> {
    wanted
        .iter()
        .filter(|w| have.iter().any(|h| overlaps(w, h)))
        .map(String::as_str)
        .collect()
}

fn vocabulary<'a>(texts: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
    texts
        .into_iter()
        .flat_map(|t| t.split(|c: char| !c.is_alphanumeric()))
        .map(str::to_lowercase)
        .filter(|w| w.chars().count() >= 4 && !STOPWORDS.contains(&w.as_str()))
        .collect()
}

/// Everything the template says it needs, as free-form terms.
fn template_terms(template: &TemplateMetadata) -> Vec<String> {
    let mut terms = vec![template.template_name.clone()];
    terms.extend(template.required_data_types.iter().cloned());
    terms.extend(template.expected_entities.iter().cloned());
    terms.extend(template.data_structure_needs.iter().cloned());
    terms
}

/// Topics, falling back to stakeholders, then to the primary entities field.
fn entity_signal(doc: &DocumentMetadata) -> Vec<String> {
    if !doc.key_topics.is_empty() {
        return doc.key_topics.clone();
    }
    if !doc.stakeholders.is_empty() {
        return doc.stakeholders.clone();
    }
    doc.extra_strings("primaryEntities")
}

pub fn score(template: &TemplateMetadata, doc: &DocumentMetadata) -> ScoreBreakdown {
    let mut total = 0.0;
    let mut reasons = Vec::new();

    if !template.required_data_types.is_empty() {
        let hits = covered(&template.required_data_types, &doc.data_categories);
        if !hits.is_empty() {
            let fraction = hits.len() as f64 / template.required_data_types.len() as f64;
            total += DATA_TYPE_POINTS * fraction;
            reasons.push(format!(
                "Covers {}/{} required data types ({})",
                hits.len(),
                template.required_data_types.len(),
                hits.join(", ")
            ));
        }
    }

    if let Some(doc_type) = &doc.document_type {
        if template
            .compatible_document_types
            .iter()
            .any(|t| overlaps(t, doc_type))
        {
            total += DOCUMENT_TYPE_BONUS;
            reasons.push(format!("Document type '{}' is compatible", doc_type));
        }
    }

    let entities = entity_signal(doc);
    if !template.expected_entities.is_empty() && !entities.is_empty() {
        let hits = covered(&template.expected_entities, &entities);
        if !hits.is_empty() {
            let fraction = hits.len() as f64 / template.expected_entities.len() as f64;
            total += ENTITY_POINTS * fraction;
            reasons.push(format!("Mentions expected entities ({})", hits.join(", ")));
        }
    }

    let terms = template_terms(template);
    let mut secondary = 0.0;

    let mut systems = doc.extra_strings("systems");
    systems.extend(doc.extra_strings("platforms"));
    if !covered(&systems, &terms).is_empty() {
        secondary += SYSTEMS_BONUS;
        reasons.push("References systems the template draws on".to_string());
    }

    let mut audience = doc.extra_strings("departments");
    audience.extend(doc.extra_strings("audience"));
    if !covered(&audience, &terms).is_empty() {
        secondary += AUDIENCE_BONUS;
        reasons.push("Audience overlaps the template's scope".to_string());
    }

    if let Some(purpose) = &doc.purpose {
        let doc_words = vocabulary([purpose.as_str()]);
        let template_words = vocabulary(terms.iter().map(String::as_str));
        let shared: Vec<&String> = doc_words.intersection(&template_words).collect();
        if !shared.is_empty() {
            secondary += (shared.len() as f64 * VOCABULARY_PER_WORD).min(VOCABULARY_CAP);
            let words: Vec<&str> = shared.iter().map(|w| w.as_str()).collect();
            reasons.push(format!("Purpose shares vocabulary ({})", words.join(", ")));
        }
    }
    total += secondary.min(SECONDARY_CAP);

    if template.has_tables && doc.has_tables {
        total += TABULAR_BONUS;
        reasons.push("Tabular data available".to_string());
    }

    if template.requires_aggregation
        && (!doc.extra_strings("metrics").is_empty()
            || !doc.extra_strings("aggregations").is_empty())
    {
        total += AGGREGATION_BONUS;
        reasons.push("Exposes metrics for aggregation".to_string());
    }

    if template.requires_time_series && doc.date_range.is_some() {
        total += TIME_SERIES_BONUS;
        reasons.push("Covers a date range for time series".to_string());
    }

    if reasons.is_empty() {
        reasons.push(NEUTRAL_REASON.to_string());
    }

    ScoreBreakdown {
        score: round_score(total),
        reasons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template() -> TemplateMetadata {
        let mut t = TemplateMetadata::new("monthly-finance", "Monthly finance summary");
        t.required_data_types = vec!["invoices".into(), "payments".into()];
        t.expected_entities = vec!["vendor".into(), "customer".into(), "account".into()];
        t.compatible_document_types = vec!["spreadsheet".into()];
        t.has_tables = true;
        t.requires_aggregation = true;
        t.requires_time_series = true;
        t
    }

    fn invoice_doc() -> DocumentMetadata {
        let mut d = DocumentMetadata::new(7, "invoice.xlsx");
        d.document_type = Some("Spreadsheet".into());
        d.purpose = Some("Track monthly invoices per vendor".into());
        d.data_categories = vec!["Invoice".into(), "tax".into()];
        d.key_topics = vec!["Vendor payments".into(), "customer accounts".into()];
        d.has_tables = true;
        d.date_range = Some("2024-01 to 2024-06".into());
        d.extra_fields.insert("metrics".into(), json!(["total due"]));
        d
    }

    #[test]
    fn test_weighted_components() {
        let result = score(&template(), &invoice_doc());
        // 4 * 1/2 + 0.5 + 3 * 3/3 + 0.25 * 3 (invoices, monthly, vendor) + 0.5 + 0.75 + 0.75
        assert_eq!(result.score, 8.3);
        assert!(result.reasons.iter().any(|r| r.contains("1/2 required")));
        assert!(result.reasons.iter().any(|r| r.contains("vendor")));
    }

    #[test]
    fn test_repeat_calls_identical() {
        let t = template();
        let d = invoice_doc();
        assert_eq!(score(&t, &d), score(&t, &d));
    }

    #[test]
    fn test_no_signal_is_explained() {
        let t = TemplateMetadata::new("blank", "Blank");
        let d = DocumentMetadata::new(1, "notes.txt");
        let result = score(&t, &d);
        assert_eq!(result.score, 0.0);
        assert_eq!(result.reasons, vec![NEUTRAL_REASON.to_string()]);
    }

    #[test]
    fn test_entity_fallbacks() {
        let mut t = TemplateMetadata::new("hr", "HR");
        t.expected_entities = vec!["employee".into()];

        let mut d = DocumentMetadata::new(1, "roster.csv");
        d.stakeholders = vec!["Employees".into()];
        assert_eq!(score(&t, &d).score, 3.0);

        let mut d = DocumentMetadata::new(1, "roster.csv");
        d.extra_fields
            .insert("primaryEntities".into(), json!([{"name": "employee"}]));
        assert_eq!(score(&t, &d).score, 3.0);

        // Topics win over stakeholders even when they do not match
        let mut d = DocumentMetadata::new(1, "roster.csv");
        d.key_topics = vec!["payroll".into()];
        d.stakeholders = vec!["employee".into()];
        assert_eq!(score(&t, &d).score, 0.0);
    }

    #[test]
    fn test_secondary_signals_capped() {
        let mut t = TemplateMetadata::new("ops", "Operations platform review");
        t.required_data_types = vec!["salesforce".into()];
        t.expected_entities = vec!["sales team".into()];
        t.data_structure_needs = vec!["pipeline stages conversion quarterly revenue".into()];

        let mut d = DocumentMetadata::new(1, "crm.pdf");
        d.purpose = Some("Quarterly revenue pipeline conversion stages for operations".into());
        d.extra_fields.insert("systems".into(), json!(["Salesforce"]));
        d.extra_fields.insert("departments".into(), json!(["Sales"]));

        let result = score(&t, &d);
        // secondary: 0.75 + 0.5 + min(6 * 0.25, 1.0) = 2.25, capped at 2.0
        assert_eq!(result.score, 2.0);
    }

    #[test]
    fn test_score_bounds() {
        assert_eq!(round_score(-3.0), 0.0);
        assert_eq!(round_score(12.4), 10.0);
        assert_eq!(round_score(6.66), 6.7);
        assert_eq!(round_score(f64::NAN), 0.0);
    }
}
