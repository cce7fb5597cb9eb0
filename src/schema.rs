//! Record types shared by the ingestion pipeline, the matching engine and the
//! batch job scheduler.
//!
//! Everything here serializes as camelCase JSON, which is the shape the HTTP
//! surface returns and the shape stored in JSON-valued store columns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use uuid::Uuid;

pub type CustomerId = i64;

/// Key inside [`DocumentMetadata::extra_fields`] holding the denormalized
/// per-template relevance cache.
pub const TEMPLATE_RELEVANCE_KEY: &str = "templateRelevance";

/// How many recent generation durations a template keeps.
const GENERATION_WINDOW: usize = 10;

// ============================================================================
// Correlation store
// ============================================================================

/// Links one locally stored upload to its counterpart(s) in the indexing service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationEntry {
    pub local_filename: String,
    /// Primary identifier, relative to the service's document root.
    pub external_document_name: String,
    /// Further identifiers created for the same source (one per sheet of a workbook).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sibling_document_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_document_id: Option<String>,
    pub workspace_id: String,
    pub uploaded_at: DateTime<Utc>,
}

impl CorrelationEntry {
    /// Every external identifier this upload maps to, primary first.
    pub fn document_names(&self) -> Vec<String> {
        let mut names = vec![self.external_document_name.clone()];
        for sibling in &self.sibling_document_names {
            if !names.contains(sibling) {
                names.push(sibling.clone());
            }
        }
        names
    }
}

// ============================================================================
// Document metadata
// ============================================================================

/// Structured description of one customer document, produced by the
/// metadata extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    pub id: String,
    pub customer_id: CustomerId,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    #[serde(default)]
    pub data_categories: Vec<String>,
    #[serde(default)]
    pub key_topics: Vec<String>,
    #[serde(default)]
    pub stakeholders: Vec<String>,
    #[serde(default)]
    pub has_tables: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_range: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_document_path: Option<String>,
    /// Open-ended fields (metrics, systems, departments, template relevance).
    #[serde(default)]
    pub extra_fields: Map<String, Value>,
    pub analyzed_at: DateTime<Utc>,
}

impl DocumentMetadata {
    pub fn new(customer_id: CustomerId, filename: impl Into<String>) -> Self {
        Self {
            id: format!("doc_{}", Uuid::new_v4().simple()),
            customer_id,
            filename: filename.into(),
            document_type: None,
            purpose: None,
            data_categories: Vec::new(),
            key_topics: Vec::new(),
            stakeholders: Vec::new(),
            has_tables: false,
            date_range: None,
            external_document_path: None,
            extra_fields: Map::new(),
            analyzed_at: Utc::now(),
        }
    }

    /// Read a string array out of `extra_fields`, ignoring non-string members.
    pub fn extra_strings(&self, key: &str) -> Vec<String> {
        self.extra_fields
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| match v {
                        Value::String(s) => Some(s.clone()),
                        Value::Object(obj) => obj
                            .get("name")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Cached relevance scores, as last written by the matching engine.
    pub fn template_relevance(&self) -> Vec<TemplateRelevance> {
        self.extra_fields
            .get(TEMPLATE_RELEVANCE_KEY)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    pub fn relevance_for(&self, template_slug: &str) -> Option<TemplateRelevance> {
        self.template_relevance()
            .into_iter()
            .find(|r| r.template_slug == template_slug)
    }

    /// Replace (or add) the cached relevance entry for one template.
    pub fn set_template_relevance(&mut self, entry: TemplateRelevance) {
        let mut entries = self.template_relevance();
        entries.retain(|r| r.template_slug != entry.template_slug);
        entries.push(entry);
        entries.sort_by(|a, b| a.template_slug.cmp(&b.template_slug));
        self.extra_fields.insert(
            TEMPLATE_RELEVANCE_KEY.to_string(),
            serde_json::to_value(entries).unwrap_or(Value::Array(Vec::new())),
        );
    }
}

/// One entry of the denormalized relevance cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateRelevance {
    pub template_slug: String,
    pub score: f64,
    #[serde(default)]
    pub reasoning: String,
}

// ============================================================================
// Template metadata
// ============================================================================

/// What a document-generation template needs from its source documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMetadata {
    pub template_slug: String,
    pub template_name: String,
    #[serde(default)]
    pub required_data_types: Vec<String>,
    #[serde(default)]
    pub expected_entities: Vec<String>,
    #[serde(default)]
    pub data_structure_needs: Vec<String>,
    #[serde(default)]
    pub has_tables: bool,
    #[serde(default)]
    pub requires_aggregation: bool,
    #[serde(default)]
    pub requires_time_series: bool,
    #[serde(default)]
    pub requires_comparisons: bool,
    #[serde(default)]
    pub requires_filtering: bool,
    #[serde(default)]
    pub compatible_document_types: Vec<String>,
    #[serde(default)]
    pub generation_stats: GenerationStats,
    pub analyzed_at: DateTime<Utc>,
}

impl TemplateMetadata {
    pub fn new(template_slug: impl Into<String>, template_name: impl Into<String>) -> Self {
        Self {
            template_slug: template_slug.into(),
            template_name: template_name.into(),
            required_data_types: Vec::new(),
            expected_entities: Vec::new(),
            data_structure_needs: Vec::new(),
            has_tables: false,
            requires_aggregation: false,
            requires_time_series: false,
            requires_comparisons: false,
            requires_filtering: false,
            compatible_document_types: Vec::new(),
            generation_stats: GenerationStats::default(),
            analyzed_at: Utc::now(),
        }
    }
}

/// Rolling statistics over recent generation runs of a template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationStats {
    #[serde(default)]
    pub recent_durations_ms: Vec<u64>,
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub average_ms: f64,
}

impl GenerationStats {
    /// Add one run; the average covers the retained window only.
    pub fn record(&mut self, duration: Duration) {
        self.recent_durations_ms.push(duration.as_millis() as u64);
        if self.recent_durations_ms.len() > GENERATION_WINDOW {
            let overflow = self.recent_durations_ms.len() - GENERATION_WINDOW;
            self.recent_durations_ms.drain(..overflow);
        }
        self.count += 1;
        let total: u64 = self.recent_durations_ms.iter().sum();
        self.average_ms = total as f64 / self.recent_durations_ms.len() as f64;
    }
}

// ============================================================================
// Matching
// ============================================================================

/// Derived relevance of one document to one template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub filename: String,
    pub template_slug: String,
    pub relevance_score: f64,
    pub reasoning: String,
}

// ============================================================================
// Notifications
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Processing,
    Complete,
    Error,
}

/// Progress event for one file, as seen by pollers and stream subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Monotonic sequence number assigned by the bus.
    pub seq: u64,
    pub customer_id: CustomerId,
    pub filename: String,
    pub status: NotificationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Matching jobs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Progress record of one batch relevance run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchingJob {
    pub id: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_slugs: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_ids: Option<Vec<CustomerId>>,
    pub force_recalculate: bool,
    pub total_documents: u64,
    pub processed_documents: u64,
    pub matched_documents: u64,
    pub skipped_documents: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

impl MatchingJob {
    pub fn new(
        template_slugs: Option<Vec<String>>,
        customer_ids: Option<Vec<CustomerId>>,
        force_recalculate: bool,
        created_by: Option<String>,
    ) -> Self {
        Self {
            id: format!("job_{}", Uuid::new_v4().simple()),
            status: JobStatus::Pending,
            template_slugs,
            customer_ids,
            force_recalculate,
            total_documents: 0,
            processed_documents: 0,
            matched_documents: 0,
            skipped_documents: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            created_by,
        }
    }
}
