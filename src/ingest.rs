//! Registration of an uploaded file with the indexing service.
//!
//! Steps after the remote upload: wait for the listing to show it, move it
//! into the customer's folder, verify its final identifiers and record them,
//! embed it into the customer's workspace, then hand off to metadata
//! extraction. Each step after the upload degrades to a warning on failure.

use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{DocServiceConfig, PipelineConfig};
use crate::correlation::CorrelationStore;
use crate::doc_service::{DocumentLocation, IndexingService, RemoteDocument, UploadedDocument};
use crate::metadata_extractor::MetadataExtractor;
use crate::notifications::NotificationBus;
use crate::poll::{poll_until, retry};
use crate::schema::{CorrelationEntry, CustomerId, NotificationStatus};

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    /// Embedded into the customer's workspace.
    pub registered: bool,
    pub warnings: Vec<String>,
    /// Final identifiers in the indexing service, primary first.
    pub document_names: Vec<String>,
}

pub struct IngestionPipeline {
    service: Arc<dyn IndexingService>,
    correlations: CorrelationStore,
    notifications: NotificationBus,
    extractor: Arc<MetadataExtractor>,
    doc_service: DocServiceConfig,
    config: PipelineConfig,
}

impl IngestionPipeline {
    pub fn new(
        service: Arc<dyn IndexingService>,
        correlations: CorrelationStore,
        notifications: NotificationBus,
        extractor: Arc<MetadataExtractor>,
        doc_service: DocServiceConfig,
        config: PipelineConfig,
    ) -> Self {
        Self {
            service,
            correlations,
            notifications,
            extractor,
            doc_service,
            config,
        }
    }

    pub fn workspace_for(&self, customer_id: CustomerId) -> String {
        self.doc_service.workspace_for(customer_id)
    }

    /// Make sure the customer's workspace exists. Returns its slug.
    pub async fn prepare_workspace(&self, customer_id: CustomerId) -> Result<String, String> {
        let workspace = self.workspace_for(customer_id);
        match self.service.ensure_workspace(&workspace).await {
            Ok(()) => Ok(workspace),
            Err(e) => {
                warn!(customer_id, "Workspace {} unavailable: {}", workspace, e);
                Err(format!("Workspace {} unavailable: {}", workspace, e))
            }
        }
    }

    /// Upload bounded by the configured timeout. A failure leaves the file
    /// stored locally only and publishes an `error` event.
    pub async fn upload_remote(
        &self,
        customer_id: CustomerId,
        filename: &str,
        data: Vec<u8>,
    ) -> Result<Vec<UploadedDocument>, String> {
        let timeout = self.config.upload_timeout();
        let outcome = tokio::time::timeout(timeout, self.service.upload(filename, data)).await;
        let failure = match outcome {
            Ok(Ok(uploaded)) if !uploaded.is_empty() => {
                debug!(customer_id, filename, "Uploaded as {} documents", uploaded.len());
                return Ok(uploaded);
            }
            Ok(Ok(_)) => "indexing service created no documents".to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {:?}", timeout),
        };

        warn!(customer_id, filename, "Remote upload failed: {}", failure);
        let warning = format!("Stored locally only, remote upload failed: {}", failure);
        self.notifications.publish(
            customer_id,
            filename,
            NotificationStatus::Error,
            Some(warning.clone()),
        );
        Err(warning)
    }

    /// Everything after the upload: wait, organize, verify, record, embed,
    /// then spawn metadata extraction.
    pub async fn complete_registration(
        &self,
        customer_id: CustomerId,
        local_path: PathBuf,
        filename: &str,
        uploaded: Vec<UploadedDocument>,
    ) -> IngestReport {
        let workspace = self.workspace_for(customer_id);
        let mut report = IngestReport::default();
        self.notifications.publish(
            customer_id,
            filename,
            NotificationStatus::Processing,
            Some("Registering with the indexing service".to_string()),
        );

        let predicted: Vec<String> = uploaded.iter().map(|d| d.location.relative()).collect();

        if !self.wait_until_indexed(filename, &predicted, &uploaded).await {
            report.warnings.push(format!(
                "{} not visible in the document listing after {:?}",
                filename,
                self.config.index_wait()
            ));
        }

        let locations: Vec<DocumentLocation> =
            uploaded.iter().map(|d| d.location.clone()).collect();
        let organized = self
            .organize(&workspace, &locations, &mut report.warnings)
            .await;

        let names = match self.verify(filename, &workspace, &organized, &uploaded).await {
            Some(found) => found,
            None => {
                report.warnings.push(format!(
                    "Could not confirm final location of {}, using expected names",
                    filename
                ));
                organized
            }
        };

        let entry = CorrelationEntry {
            local_filename: filename.to_string(),
            external_document_name: names.first().cloned().unwrap_or_default(),
            sibling_document_names: names.iter().skip(1).cloned().collect(),
            external_document_id: uploaded.first().and_then(|d| d.id.clone()),
            workspace_id: workspace.clone(),
            uploaded_at: Utc::now(),
        };
        if let Err(e) = self.correlations.save(customer_id, &entry).await {
            warn!(customer_id, filename, "Could not record correlation: {}", e);
            report
                .warnings
                .push(format!("Could not record document mapping: {}", e));
        }

        match self.embed(&workspace, &names).await {
            Ok(()) => report.registered = true,
            Err(e) => {
                warn!(customer_id, filename, "Embedding failed: {}", e);
                report
                    .warnings
                    .push(format!("Not embedded into {}: {}", workspace, e));
            }
        }

        info!(
            customer_id,
            filename,
            registered = report.registered,
            "Registered as {}",
            names.join(", ")
        );

        let extractor = self.extractor.clone();
        let primary = entry.external_document_name.clone();
        let filename_owned = filename.to_string();
        tokio::spawn(async move {
            let document = Some(primary.as_str()).filter(|p| !p.is_empty());
            // Outcome is reported through notifications.
            let _ = extractor
                .extract(customer_id, &local_path, &filename_owned, &workspace, document)
                .await;
        });

        report.document_names = names;
        report
    }

    async fn wait_until_indexed(
        &self,
        filename: &str,
        predicted: &[String],
        uploaded: &[UploadedDocument],
    ) -> bool {
        let service = self.service.as_ref();
        poll_until(
            self.config.index_poll_interval(),
            self.config.index_wait(),
            move || async move {
                match service.list_documents().await {
                    Ok(docs) => docs
                        .iter()
                        .any(|d| {
                            predicted.contains(&d.name) || is_from_upload(d, filename, uploaded)
                        })
                        .then_some(()),
                    Err(e) => {
                        debug!("Listing unavailable while waiting for {}: {}", filename, e);
                        None
                    }
                }
            },
        )
        .await
        .is_some()
    }

    /// Move each document into `folder`. Documents that cannot be moved keep
    /// their upload location.
    async fn organize(
        &self,
        folder: &str,
        locations: &[DocumentLocation],
        warnings: &mut Vec<String>,
    ) -> Vec<String> {
        let names: Vec<String> = locations.iter().map(DocumentLocation::relative).collect();
        if let Err(e) = self.service.create_folder(folder).await {
            warnings.push(format!("Could not create folder {}: {}", folder, e));
            return names;
        }

        let service = self.service.as_ref();
        let mut organized = Vec::with_capacity(names.len());
        for (name, location) in names.iter().zip(locations) {
            if name.starts_with(&format!("{}/", folder)) {
                organized.push(name.clone());
                continue;
            }
            let target = format!("{}/{}", folder, location.file_name());
            let (from, to) = (name.as_str(), target.as_str());
            match retry(
                self.config.organize_attempts,
                self.config.organize_backoff(),
                move |_| service.move_document(from, to),
            )
            .await
            {
                Ok(()) => organized.push(target),
                Err(e) => {
                    warnings.push(format!("Could not move {} into {}: {}", name, folder, e));
                    organized.push(name.clone());
                }
            }
        }
        organized
    }

    /// Final identifiers as the listing reports them: expected names first,
    /// then any other document of this upload in the customer or upload folder.
    async fn verify(
        &self,
        filename: &str,
        folder: &str,
        expected: &[String],
        uploaded: &[UploadedDocument],
    ) -> Option<Vec<String>> {
        let service = self.service.as_ref();
        let folders = [folder, self.doc_service.upload_folder.as_str()];
        let folders = &folders;
        poll_until(
            self.config.verify_poll_interval(),
            self.config.verify_wait(),
            move || async move {
                let docs = service.list_documents().await.ok()?;
                let mut found: Vec<String> = expected
                    .iter()
                    .filter(|n| docs.iter().any(|d| &d.name == *n))
                    .cloned()
                    .collect();
                for doc in &docs {
                    let in_folder = doc.folder().is_some_and(|f| folders.contains(&f));
                    let ours = in_folder && is_from_upload(doc, filename, uploaded);
                    if ours && !found.contains(&doc.name) {
                        found.push(doc.name.clone());
                    }
                }
                (!found.is_empty()).then_some(found)
            },
        )
        .await
    }

    async fn embed(&self, workspace: &str, names: &[String]) -> Result<(), String> {
        let service = self.service.as_ref();
        retry(
            self.config.embed_attempts,
            self.config.embed_backoff(),
            move |attempt| async move {
                debug!(workspace, attempt, "Embedding {} documents", names.len());
                let outcome = service
                    .update_embeddings(workspace, names, &[])
                    .await
                    .map_err(|e| e.to_string())?;
                if outcome.looks_failed() {
                    return Err(outcome
                        .message
                        .unwrap_or_else(|| "embedding not applied".to_string()));
                }
                Ok(())
            },
        )
        .await
    }
}

/// Whether a listed document came from this upload: it carries one of the
/// upload's ids or titles, or is titled after the file itself.
fn is_from_upload(doc: &RemoteDocument, filename: &str, uploaded: &[UploadedDocument]) -> bool {
    let ours = uploaded.iter().any(|u| {
        let same_id = u.id.is_some() && u.id == doc.id;
        let same_title = !u.title.is_empty() && u.title.eq_ignore_ascii_case(&doc.title);
        same_id || same_title
    });
    ours || doc.matches_source(filename, &[])
}
