//! Persistence seam for document and template metadata.
//!
//! Both implementations keep at most one live row per (customer, filename)
//! and per template slug: writes replace, never append.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use thiserror::Error;

use crate::schema::{CustomerId, DocumentMetadata, TemplateMetadata, TemplateRelevance};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("store returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("store row could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn upsert_document(&self, doc: &DocumentMetadata) -> Result<(), StoreError>;
    async fn get_document(
        &self,
        customer_id: CustomerId,
        filename: &str,
    ) -> Result<Option<DocumentMetadata>, StoreError>;
    async fn list_documents(
        &self,
        customer_id: CustomerId,
    ) -> Result<Vec<DocumentMetadata>, StoreError>;
    async fn list_customer_ids(&self) -> Result<Vec<CustomerId>, StoreError>;
    /// Returns whether a row was deleted.
    async fn delete_document(
        &self,
        customer_id: CustomerId,
        filename: &str,
    ) -> Result<bool, StoreError>;

    /// Write one entry of a document's relevance cache (last write wins).
    async fn save_template_relevance(
        &self,
        customer_id: CustomerId,
        filename: &str,
        entry: TemplateRelevance,
    ) -> Result<(), StoreError> {
        let mut doc = self
            .get_document(customer_id, filename)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                kind: "document",
                name: format!("{}/{}", customer_id, filename),
            })?;
        doc.set_template_relevance(entry);
        self.upsert_document(&doc).await
    }

    async fn upsert_template(&self, template: &TemplateMetadata) -> Result<(), StoreError>;
    async fn get_template(&self, slug: &str) -> Result<Option<TemplateMetadata>, StoreError>;
    async fn list_templates(&self) -> Result<Vec<TemplateMetadata>, StoreError>;
}

/// Process-local store, used when no database is configured and in tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    documents: Arc<RwLock<HashMap<(CustomerId, String), DocumentMetadata>>>,
    templates: Arc<RwLock<HashMap<String, TemplateMetadata>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn upsert_document(&self, doc: &DocumentMetadata) -> Result<(), StoreError> {
        let mut docs = self.documents.write().unwrap_or_else(|e| e.into_inner());
        docs.insert((doc.customer_id, doc.filename.clone()), doc.clone());
        Ok(())
    }

    async fn get_document(
        &self,
        customer_id: CustomerId,
        filename: &str,
    ) -> Result<Option<DocumentMetadata>, StoreError> {
        let docs = self.documents.read().unwrap_or_else(|e| e.into_inner());
        Ok(docs.get(&(customer_id, filename.to_string())).cloned())
    }

    async fn list_documents(
        &self,
        customer_id: CustomerId,
    ) -> Result<Vec<DocumentMetadata>, StoreError> {
        let docs = self.documents.read().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<DocumentMetadata> = docs
            .values()
            .filter(|d| d.customer_id == customer_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(rows)
    }

    async fn list_customer_ids(&self) -> Result<Vec<CustomerId>, StoreError> {
        let docs = self.documents.read().unwrap_or_else(|e| e.into_inner());
        let ids: BTreeSet<CustomerId> = docs.keys().map(|(id, _)| *id).collect();
        Ok(ids.into_iter().collect())
    }

    async fn delete_document(
        &self,
        customer_id: CustomerId,
        filename: &str,
    ) -> Result<bool, StoreError> {
        let mut docs = self.documents.write().unwrap_or_else(|e| e.into_inner());
        Ok(docs.remove(&(customer_id, filename.to_string())).is_some())
    }

    async fn upsert_template(&self, template: &TemplateMetadata) -> Result<(), StoreError> {
        let mut templates = self.templates.write().unwrap_or_else(|e| e.into_inner());
        templates.insert(template.template_slug.clone(), template.clone());
        Ok(())
    }

    async fn get_template(&self, slug: &str) -> Result<Option<TemplateMetadata>, StoreError> {
        let templates = self.templates.read().unwrap_or_else(|e| e.into_inner());
        Ok(templates.get(slug).cloned())
    }

    async fn list_templates(&self) -> Result<Vec<TemplateMetadata>, StoreError> {
        let templates = self.templates.read().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<TemplateMetadata> = templates.values().cloned().collect();
        rows.sort_by(|a, b| a.template_slug.cmp(&b.template_slug));
        Ok(rows)
    }
}
