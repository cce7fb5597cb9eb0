//! AI analysis of an uploaded document into a [`DocumentMetadata`] record.

use anyhow::{bail, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::ai::{parse_llm_json, TextGenerator, WorkspaceChat};
use crate::config::ExtractionConfig;
use crate::doc_service::IndexingService;
use crate::document_text::{self, DocumentPreview};
use crate::error::AppError;
use crate::notifications::NotificationBus;
use crate::poll::{poll_until, retry};
use crate::schema::{CustomerId, DocumentMetadata, NotificationStatus, TEMPLATE_RELEVANCE_KEY};
use crate::store::MetadataStore;

const SYSTEM_PROMPT: &str = "You are a document analyst. Describe what a business document \
contains so it can later be matched to report templates. Respond with a single JSON object \
and nothing else.";

const ANALYSIS_SHAPE: &str = r#"{
  "documentType": "short type, e.g. invoice ledger, sales pipeline export, policy",
  "purpose": "one sentence on what the document is used for",
  "dataCategories": ["kinds of data present, e.g. invoices, payments, headcount"],
  "keyTopics": ["main subjects and named entities"],
  "stakeholders": ["people, teams or organisations involved"],
  "hasTables": true,
  "dateRange": "period covered, or null",
  "metrics": ["quantities that can be aggregated"],
  "systems": ["software systems or platforms referenced"],
  "departments": ["departments or audiences"],
  "primaryEntities": ["records the rows describe, e.g. customer, vendor, employee"]
}"#;

/// Raw analysis as returned by the model. Unknown fields are kept.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentAnalysis {
    #[serde(default)]
    document_type: Option<String>,
    #[serde(default)]
    purpose: Option<String>,
    #[serde(default)]
    data_categories: Option<Vec<Value>>,
    #[serde(default)]
    key_topics: Option<Vec<Value>>,
    #[serde(default)]
    stakeholders: Option<Vec<Value>>,
    #[serde(default)]
    has_tables: Option<bool>,
    #[serde(default)]
    date_range: Option<Value>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl DocumentAnalysis {
    /// At least a type or a purpose, otherwise the analysis is retried.
    fn is_useful(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        present(&self.document_type) || present(&self.purpose)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn strings(values: Option<Vec<Value>>) -> Vec<String> {
    values
        .unwrap_or_default()
        .into_iter()
        .filter_map(|v| match v {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Object(obj) => obj
                .get("name")
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string()),
            _ => None,
        })
        .filter(|s| !s.is_empty())
        .collect()
}

/// Models answer either a plain string or `{start, end}`.
fn date_range_text(value: Option<Value>) -> Option<String> {
    match value? {
        Value::String(s) => non_empty(Some(s)),
        Value::Object(obj) => {
            let start = obj.get("start").and_then(Value::as_str);
            let end = obj.get("end").and_then(Value::as_str);
            match (start, end) {
                (Some(s), Some(e)) => Some(format!("{} to {}", s, e)),
                (Some(s), None) => Some(format!("from {}", s)),
                (None, Some(e)) => Some(format!("until {}", e)),
                (None, None) => None,
            }
        }
        _ => None,
    }
}

fn build_prompt(filename: &str, preview: &DocumentPreview) -> String {
    let mut prompt = format!("Filename: {}\n", filename);
    if !preview.sheet_names.is_empty() {
        prompt.push_str(&format!("Sheets: {}\n", preview.sheet_names.join(", ")));
    }
    if preview.text.trim().is_empty() {
        prompt.push_str(
            "\nNo text preview is available; use the document as indexed in this workspace.\n",
        );
    } else {
        prompt.push_str(&format!(
            "\n--- DOCUMENT START ---\n{}\n--- DOCUMENT END ---\n",
            preview.text
        ));
    }
    prompt.push_str(&format!(
        "\nDescribe the document. Return ONLY valid JSON with this structure:\n{}",
        ANALYSIS_SHAPE
    ));
    prompt
}

pub struct MetadataExtractor {
    service: Arc<dyn IndexingService>,
    store: Arc<dyn MetadataStore>,
    notifications: NotificationBus,
    /// Dedicated model. Without one, analysis runs as a workspace chat.
    generator: Option<Arc<dyn TextGenerator>>,
    config: ExtractionConfig,
}

impl MetadataExtractor {
    pub fn new(
        service: Arc<dyn IndexingService>,
        store: Arc<dyn MetadataStore>,
        notifications: NotificationBus,
        generator: Option<Arc<dyn TextGenerator>>,
        config: ExtractionConfig,
    ) -> Self {
        Self {
            service,
            store,
            notifications,
            generator,
            config,
        }
    }

    fn generator_for(&self, workspace: &str) -> Arc<dyn TextGenerator> {
        match &self.generator {
            Some(generator) => generator.clone(),
            None => Arc::new(WorkspaceChat::new(self.service.clone(), workspace)),
        }
    }

    /// Analyze one uploaded file and persist the result.
    ///
    /// Always publishes `processing` first, then `complete` or `error`.
    pub async fn extract(
        &self,
        customer_id: CustomerId,
        file_path: &Path,
        filename: &str,
        workspace: &str,
        document_name: Option<&str>,
    ) -> Result<DocumentMetadata, AppError> {
        self.notifications.publish(
            customer_id,
            filename,
            NotificationStatus::Processing,
            Some("Analyzing document".to_string()),
        );

        match self
            .analyze(customer_id, file_path, filename, workspace, document_name)
            .await
        {
            Ok(metadata) => {
                let label = metadata
                    .document_type
                    .clone()
                    .or_else(|| metadata.purpose.clone())
                    .unwrap_or_default();
                self.notifications.publish(
                    customer_id,
                    filename,
                    NotificationStatus::Complete,
                    Some(format!("Analyzed as {}", label)),
                );
                info!(customer_id, filename, "Metadata extraction complete");
                self.spawn_index_refresh(customer_id, workspace);
                Ok(metadata)
            }
            Err(e) => {
                warn!(customer_id, filename, "Metadata extraction failed: {}", e);
                self.notifications.publish(
                    customer_id,
                    filename,
                    NotificationStatus::Error,
                    Some(e.to_string()),
                );
                Err(e)
            }
        }
    }

    async fn analyze(
        &self,
        customer_id: CustomerId,
        file_path: &Path,
        filename: &str,
        workspace: &str,
        document_name: Option<&str>,
    ) -> Result<DocumentMetadata, AppError> {
        if let Some(name) = document_name {
            let service = self.service.as_ref();
            let ready = poll_until(
                self.config.readiness_poll_interval(),
                self.config.readiness_wait(),
                move || async move { service.get_document(name).await.ok().flatten() },
            )
            .await;
            if ready.is_none() {
                warn!(
                    filename,
                    "{} not reported as indexed, analyzing anyway", name
                );
            }
        }

        let preview = match document_text::preview_file(file_path, self.config.preview_chars).await
        {
            Ok(preview) => preview,
            Err(e) => {
                warn!(filename, "No text preview: {:#}", e);
                DocumentPreview::default()
            }
        };

        let generator = self.generator_for(workspace);
        let generator = generator.as_ref();
        let prompt = build_prompt(filename, &preview);
        let prompt = prompt.as_str();

        let analysis = retry(
            self.config.attempts,
            self.config.backoff(),
            move |attempt| async move {
                debug!(filename, attempt, "Requesting document analysis");
                let response = generator.generate(SYSTEM_PROMPT, prompt).await?;
                let analysis: DocumentAnalysis = parse_llm_json(&response)?;
                if !analysis.is_useful() {
                    bail!("analysis has neither documentType nor purpose");
                }
                Ok::<_, anyhow::Error>(analysis)
            },
        )
        .await
        .map_err(|e| AppError::ExtractionFailed {
            filename: filename.to_string(),
            reason: format!("{:#}", e),
        })?;

        let mut metadata = DocumentMetadata::new(customer_id, filename);
        metadata.document_type = non_empty(analysis.document_type);
        metadata.purpose = non_empty(analysis.purpose);
        metadata.data_categories = strings(analysis.data_categories);
        metadata.key_topics = strings(analysis.key_topics);
        metadata.stakeholders = strings(analysis.stakeholders);
        metadata.has_tables = analysis.has_tables.unwrap_or(false) || preview.has_tables;
        metadata.date_range = date_range_text(analysis.date_range);
        metadata.external_document_path = document_name.map(str::to_string);
        metadata.extra_fields = analysis.extra;
        // A fresh analysis invalidates every cached relevance score.
        metadata.extra_fields.remove(TEMPLATE_RELEVANCE_KEY);
        if !preview.sheet_names.is_empty() {
            metadata
                .extra_fields
                .insert("sheetNames".to_string(), preview.sheet_names.clone().into());
        }

        self.store.upsert_document(&metadata).await?;
        Ok(metadata)
    }

    fn spawn_index_refresh(&self, customer_id: CustomerId, workspace: &str) {
        let service = self.service.clone();
        let store = self.store.clone();
        let workspace = workspace.to_string();
        tokio::spawn(async move {
            if let Err(e) =
                refresh_workspace_index(service.as_ref(), store.as_ref(), customer_id, &workspace)
                    .await
            {
                warn!(customer_id, "Workspace index refresh failed: {:#}", e);
            }
        });
    }
}

/// Markdown overview of a customer's analyzed documents.
pub fn render_index(customer_id: CustomerId, docs: &[DocumentMetadata]) -> String {
    let mut out = format!("# Document index for customer {}\n\n", customer_id);
    for doc in docs {
        out.push_str(&format!("## {}\n", doc.filename));
        if let Some(t) = &doc.document_type {
            out.push_str(&format!("- Type: {}\n", t));
        }
        if let Some(p) = &doc.purpose {
            out.push_str(&format!("- Purpose: {}\n", p));
        }
        if !doc.data_categories.is_empty() {
            out.push_str(&format!("- Data: {}\n", doc.data_categories.join(", ")));
        }
        if !doc.key_topics.is_empty() {
            out.push_str(&format!("- Topics: {}\n", doc.key_topics.join(", ")));
        }
        if let Some(range) = &doc.date_range {
            out.push_str(&format!("- Period: {}\n", range));
        }
        out.push('\n');
    }
    out
}

/// Replace the workspace's index document with a fresh rendering.
pub async fn refresh_workspace_index(
    service: &dyn IndexingService,
    store: &dyn MetadataStore,
    customer_id: CustomerId,
    workspace: &str,
) -> Result<()> {
    let docs = store.list_documents(customer_id).await?;
    let title = format!("{}-document-index", workspace);
    let previous: Vec<String> = service
        .list_documents()
        .await?
        .into_iter()
        .filter(|d| d.title == title)
        .map(|d| d.name)
        .collect();

    let uploaded = service
        .upload_raw_text(&title, &render_index(customer_id, &docs))
        .await?;
    let added: Vec<String> = uploaded.iter().map(|d| d.location.relative()).collect();
    let stale: Vec<String> = previous
        .into_iter()
        .filter(|name| !added.contains(name))
        .collect();

    let outcome = service.update_embeddings(workspace, &added, &stale).await?;
    if outcome.looks_failed() {
        bail!(
            "index embedding not applied: {}",
            outcome.message.unwrap_or_default()
        );
    }
    if !stale.is_empty() {
        service.remove_documents(&stale).await?;
    }
    debug!(workspace, "Workspace index refreshed ({} documents)", docs.len());
    Ok(())
}
