//! Temporary pinning of a template's most relevant documents around a
//! generation run.
//!
//! Relevance comes from the persisted cache on each document; nothing is
//! rescored here. Pinning is best-effort. Unpinning always runs, including
//! when the run is dropped mid-flight or panics.

use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::doc_service::IndexingService;
use crate::schema::CustomerId;
use crate::store::{MetadataStore, StoreError};

pub struct PinningController {
    service: Arc<dyn IndexingService>,
    store: Arc<dyn MetadataStore>,
    top_n: usize,
}

/// Documents pinned for one run. Whatever is still held when the guard is
/// dropped gets unpinned from a spawned task.
struct PinGuard {
    service: Arc<dyn IndexingService>,
    workspace: String,
    pinned: Vec<String>,
}

impl PinGuard {
    async fn release(mut self) {
        let pinned = std::mem::take(&mut self.pinned);
        unpin_all(self.service.as_ref(), &self.workspace, &pinned).await;
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        if self.pinned.is_empty() {
            return;
        }
        let pinned = std::mem::take(&mut self.pinned);
        let service = self.service.clone();
        let workspace = std::mem::take(&mut self.workspace);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(
                    workspace = %workspace,
                    "Generation abandoned, unpinning {} documents",
                    pinned.len()
                );
                handle.spawn(async move {
                    unpin_all(service.as_ref(), &workspace, &pinned).await;
                });
            }
            Err(_) => warn!(
                workspace = %workspace,
                "No runtime left to unpin {}",
                pinned.join(", ")
            ),
        }
    }
}

async fn unpin_all(service: &dyn IndexingService, workspace: &str, pinned: &[String]) {
    for path in pinned {
        match service.update_pin(workspace, path, false).await {
            Ok(()) => debug!("Unpinned {}", path),
            Err(e) => warn!("Failed to unpin {} in {}: {}", path, workspace, e),
        }
    }
}

impl PinningController {
    pub fn new(
        service: Arc<dyn IndexingService>,
        store: Arc<dyn MetadataStore>,
        top_n: usize,
    ) -> Self {
        Self {
            service,
            store,
            top_n: top_n.max(1),
        }
    }

    /// External paths of the customer's documents scoring at least
    /// `min_score` for the template, best first, at most `top_n`.
    pub async fn relevant_documents(
        &self,
        template_slug: &str,
        customer_id: CustomerId,
        min_score: f64,
    ) -> Result<Vec<String>, StoreError> {
        let docs = self.store.list_documents(customer_id).await?;
        let mut scored: Vec<(f64, String, String)> = docs
            .into_iter()
            .filter_map(|d| {
                let relevance = d.relevance_for(template_slug)?;
                let path = d.external_document_path.clone()?;
                (relevance.score >= min_score).then_some((relevance.score, d.filename, path))
            })
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        Ok(scored
            .into_iter()
            .take(self.top_n)
            .map(|(_, _, path)| path)
            .collect())
    }

    /// Pin the relevant set, run `operation`, then unpin everything that was
    /// pinned, whether or not `operation` succeeded.
    pub async fn with_pinning<T, E, F, Fut>(
        &self,
        workspace: &str,
        template_slug: &str,
        customer_id: CustomerId,
        min_score: f64,
        operation: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let candidates = match self
            .relevant_documents(template_slug, customer_id, min_score)
            .await
        {
            Ok(paths) => paths,
            Err(e) => {
                warn!(
                    customer_id,
                    template = template_slug,
                    "Could not load relevance for pinning: {}",
                    e
                );
                Vec::new()
            }
        };

        let mut guard = PinGuard {
            service: self.service.clone(),
            workspace: workspace.to_string(),
            pinned: Vec::with_capacity(candidates.len()),
        };
        for path in candidates {
            match self.service.update_pin(workspace, &path, true).await {
                Ok(()) => guard.pinned.push(path),
                Err(e) => warn!("Failed to pin {} in {}: {}", path, workspace, e),
            }
        }
        if !guard.pinned.is_empty() {
            info!(
                workspace,
                template = template_slug,
                "Pinned {} documents",
                guard.pinned.len()
            );
        }

        let result = operation().await;
        guard.release().await;
        result
    }
}
