//! Supabase (PostgREST) implementation of [`MetadataStore`].
//!
//! Array and object fields live in jsonb columns. Uniqueness is enforced by
//! the table constraints `(customer_id, filename)` and `template_slug`, and
//! every write is an upsert on that constraint. PostgREST caps each response,
//! so listings are fetched page by page.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::StoreConfig;
use crate::schema::{CustomerId, DocumentMetadata, GenerationStats, TemplateMetadata};
use crate::store::{MetadataStore, StoreError};

const DOCUMENTS_TABLE: &str = "document_metadata";
const TEMPLATES_TABLE: &str = "template_metadata";
/// Supabase's default `max-rows`.
const PAGE_SIZE: usize = 1000;

#[derive(Clone)]
pub struct SupabaseStore {
    client: Client,
    base_url: String,
    service_role_key: String,
    page_size: usize,
}

impl SupabaseStore {
    /// Returns `None` unless both the URL and the service role key are configured.
    pub fn from_config(client: Client, config: &StoreConfig) -> Option<Self> {
        let base_url = config.supabase_url.as_ref()?;
        let service_role_key = config.service_role_key.clone()?;
        Some(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            service_role_key,
            page_size: PAGE_SIZE,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.service_role_key)
            .header("Authorization", format!("Bearer {}", self.service_role_key))
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(StoreError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        columns: &str,
        filters: &[(&str, String)],
    ) -> Result<Vec<T>, StoreError> {
        let resp = self
            .authorize(self.client.get(self.table_url(table)))
            .query(&[("select", columns)])
            .query(filters)
            .send()
            .await?;
        let text = Self::check(resp).await?.text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Every matching row. `filters` must include a total `order`.
    async fn select_all<T: DeserializeOwned>(
        &self,
        table: &str,
        filters: &[(&str, String)],
    ) -> Result<Vec<T>, StoreError> {
        let mut rows = Vec::new();
        loop {
            let mut page_filters = filters.to_vec();
            page_filters.push(("limit", self.page_size.to_string()));
            page_filters.push(("offset", rows.len().to_string()));
            let page: Vec<T> = self.select(table, "*", &page_filters).await?;
            let full = page.len() >= self.page_size;
            rows.extend(page);
            if !full {
                return Ok(rows);
            }
        }
    }

    async fn upsert<T: Serialize>(
        &self,
        table: &str,
        on_conflict: &str,
        row: &T,
    ) -> Result<(), StoreError> {
        let resp = self
            .authorize(self.client.post(self.table_url(table)))
            .query(&[("on_conflict", on_conflict)])
            .header("Content-Type", "application/json")
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(row)
            .send()
            .await?;
        Self::check(resp).await?;
        debug!("Upserted row into {}", table);
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for SupabaseStore {
    async fn upsert_document(&self, doc: &DocumentMetadata) -> Result<(), StoreError> {
        self.upsert(DOCUMENTS_TABLE, "customer_id,filename", &DocumentRow::from(doc))
            .await
    }

    async fn get_document(
        &self,
        customer_id: CustomerId,
        filename: &str,
    ) -> Result<Option<DocumentMetadata>, StoreError> {
        let rows: Vec<DocumentRow> = self
            .select(
                DOCUMENTS_TABLE,
                "*",
                &[
                    ("customer_id", format!("eq.{}", customer_id)),
                    ("filename", format!("eq.{}", filename)),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;
        Ok(rows.into_iter().next().map(DocumentMetadata::from))
    }

    async fn list_documents(
        &self,
        customer_id: CustomerId,
    ) -> Result<Vec<DocumentMetadata>, StoreError> {
        let rows: Vec<DocumentRow> = self
            .select_all(
                DOCUMENTS_TABLE,
                &[
                    ("customer_id", format!("eq.{}", customer_id)),
                    ("order", "filename.asc".to_string()),
                ],
            )
            .await?;
        Ok(rows.into_iter().map(DocumentMetadata::from).collect())
    }

    async fn list_customer_ids(&self) -> Result<Vec<CustomerId>, StoreError> {
        #[derive(Deserialize)]
        struct CustomerRow {
            customer_id: CustomerId,
        }

        // Keyset paging: each page starts past the highest id seen so far.
        let mut ids: Vec<CustomerId> = Vec::new();
        loop {
            let mut filters = vec![
                ("order", "customer_id.asc".to_string()),
                ("limit", self.page_size.to_string()),
            ];
            if let Some(last) = ids.last() {
                filters.push(("customer_id", format!("gt.{}", last)));
            }
            let rows: Vec<CustomerRow> =
                self.select(DOCUMENTS_TABLE, "customer_id", &filters).await?;
            let full = rows.len() >= self.page_size;
            for row in rows {
                if ids.last() != Some(&row.customer_id) {
                    ids.push(row.customer_id);
                }
            }
            if !full {
                return Ok(ids);
            }
        }
    }

    async fn delete_document(
        &self,
        customer_id: CustomerId,
        filename: &str,
    ) -> Result<bool, StoreError> {
        let resp = self
            .authorize(self.client.delete(self.table_url(DOCUMENTS_TABLE)))
            .query(&[
                ("customer_id", format!("eq.{}", customer_id)),
                ("filename", format!("eq.{}", filename)),
            ])
            .header("Prefer", "return=representation")
            .send()
            .await?;
        let text = Self::check(resp).await?.text().await?;
        let deleted: Vec<Value> = serde_json::from_str(&text)?;
        Ok(!deleted.is_empty())
    }

    async fn upsert_template(&self, template: &TemplateMetadata) -> Result<(), StoreError> {
        self.upsert(TEMPLATES_TABLE, "template_slug", &TemplateRow::from(template))
            .await
    }

    async fn get_template(&self, slug: &str) -> Result<Option<TemplateMetadata>, StoreError> {
        let rows: Vec<TemplateRow> = self
            .select(
                TEMPLATES_TABLE,
                "*",
                &[
                    ("template_slug", format!("eq.{}", slug)),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;
        Ok(rows.into_iter().next().map(TemplateMetadata::from))
    }

    async fn list_templates(&self) -> Result<Vec<TemplateMetadata>, StoreError> {
        let rows: Vec<TemplateRow> = self
            .select_all(
                TEMPLATES_TABLE,
                &[("order", "template_slug.asc".to_string())],
            )
            .await?;
        Ok(rows.into_iter().map(TemplateMetadata::from).collect())
    }
}

// ============================================================================
// Supabase row types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct DocumentRow {
    id: String,
    customer_id: CustomerId,
    filename: String,
    document_type: Option<String>,
    purpose: Option<String>,
    #[serde(default)]
    data_categories: Vec<String>,
    #[serde(default)]
    key_topics: Vec<String>,
    #[serde(default)]
    stakeholders: Vec<String>,
    #[serde(default)]
    has_tables: bool,
    date_range: Option<String>,
    external_document_path: Option<String>,
    #[serde(default)]
    extra_fields: Option<Map<String, Value>>,
    analyzed_at: DateTime<Utc>,
}

impl From<&DocumentMetadata> for DocumentRow {
    fn from(doc: &DocumentMetadata) -> Self {
        Self {
            id: doc.id.clone(),
            customer_id: doc.customer_id,
            filename: doc.filename.clone(),
            document_type: doc.document_type.clone(),
            purpose: doc.purpose.clone(),
            data_categories: doc.data_categories.clone(),
            key_topics: doc.key_topics.clone(),
            stakeholders: doc.stakeholders.clone(),
            has_tables: doc.has_tables,
            date_range: doc.date_range.clone(),
            external_document_path: doc.external_document_path.clone(),
            extra_fields: Some(doc.extra_fields.clone()),
            analyzed_at: doc.analyzed_at,
        }
    }
}

impl From<DocumentRow> for DocumentMetadata {
    fn from(row: DocumentRow) -> Self {
        Self {
            id: row.id,
            customer_id: row.customer_id,
            filename: row.filename,
            document_type: row.document_type,
            purpose: row.purpose,
            data_categories: row.data_categories,
            key_topics: row.key_topics,
            stakeholders: row.stakeholders,
            has_tables: row.has_tables,
            date_range: row.date_range,
            external_document_path: row.external_document_path,
            extra_fields: row.extra_fields.unwrap_or_default(),
            analyzed_at: row.analyzed_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TemplateRow {
    template_slug: String,
    template_name: String,
    #[serde(default)]
    required_data_types: Vec<String>,
    #[serde(default)]
    expected_entities: Vec<String>,
    #[serde(default)]
    data_structure_needs: Vec<String>,
    #[serde(default)]
    has_tables: bool,
    #[serde(default)]
    requires_aggregation: bool,
    #[serde(default)]
    requires_time_series: bool,
    #[serde(default)]
    requires_comparisons: bool,
    #[serde(default)]
    requires_filtering: bool,
    #[serde(default)]
    compatible_document_types: Vec<String>,
    #[serde(default)]
    generation_stats: Option<GenerationStats>,
    analyzed_at: DateTime<Utc>,
}

impl From<&TemplateMetadata> for TemplateRow {
    fn from(t: &TemplateMetadata) -> Self {
        Self {
            template_slug: t.template_slug.clone(),
            template_name: t.template_name.clone(),
            required_data_types: t.required_data_types.clone(),
            expected_entities: t.expected_entities.clone(),
            data_structure_needs: t.data_structure_needs.clone(),
            has_tables: t.has_tables,
            requires_aggregation: t.requires_aggregation,
            requires_time_series: t.requires_time_series,
            requires_comparisons: t.requires_comparisons,
            requires_filtering: t.requires_filtering,
            compatible_document_types: t.compatible_document_types.clone(),
            generation_stats: Some(t.generation_stats.clone()),
            analyzed_at: t.analyzed_at,
        }
    }
}

impl From<TemplateRow> for TemplateMetadata {
    fn from(row: TemplateRow) -> Self {
        Self {
            template_slug: row.template_slug,
            template_name: row.template_name,
            required_data_types: row.required_data_types,
            expected_entities: row.expected_entities,
            data_structure_needs: row.data_structure_needs,
            has_tables: row.has_tables,
            requires_aggregation: row.requires_aggregation,
            requires_time_series: row.requires_time_series,
            requires_comparisons: row.requires_comparisons,
            requires_filtering: row.requires_filtering,
            compatible_document_types: row.compatible_document_types,
            generation_stats: row.generation_stats.unwrap_or_default(),
            analyzed_at: row.analyzed_at,
        }
    }
}
