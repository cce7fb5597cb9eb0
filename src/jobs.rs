//! Batch relevance recomputation as cancellable background jobs.
//!
//! A job walks templates x documents, scoring each pair with the rule-based
//! scorer and writing the result into the document's relevance cache. Jobs
//! live in an in-memory registry; cancellation is a flag checked between units.

use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};

use crate::matching;
use crate::schema::{
    CustomerId, DocumentMetadata, JobStatus, MatchingJob, TemplateMetadata, TemplateRelevance,
};
use crate::store::{MetadataStore, StoreError};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    #[serde(default)]
    pub template_slugs: Option<Vec<String>>,
    #[serde(default)]
    pub customer_ids: Option<Vec<CustomerId>>,
    #[serde(default)]
    pub force_recalculate: bool,
    #[serde(default)]
    pub created_by: Option<String>,
}

struct JobEntry {
    job: MatchingJob,
    cancel: Arc<AtomicBool>,
}

/// How a run ended, short of a store failure.
enum RunEnd {
    Completed,
    Cancelled,
}

#[derive(Clone)]
pub struct JobScheduler {
    jobs: Arc<RwLock<HashMap<String, JobEntry>>>,
    store: Arc<dyn MetadataStore>,
    match_threshold: f64,
}

impl JobScheduler {
    pub fn new(store: Arc<dyn MetadataStore>, match_threshold: f64) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            store,
            match_threshold,
        }
    }

    /// Register a job and run it in the background. Returns its id.
    pub fn start(&self, request: JobRequest) -> String {
        let job = MatchingJob::new(
            request.template_slugs,
            request.customer_ids,
            request.force_recalculate,
            request.created_by,
        );
        let id = job.id.clone();
        let cancel = Arc::new(AtomicBool::new(false));
        {
            let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
            jobs.insert(
                id.clone(),
                JobEntry {
                    job,
                    cancel: cancel.clone(),
                },
            );
        }
        info!(job_id = %id, "Matching job queued");

        let scheduler = self.clone();
        let job_id = id.clone();
        tokio::spawn(async move {
            scheduler.run(&job_id, cancel).await;
        });
        id
    }

    /// Request cancellation. Takes effect at the job's next checkpoint.
    pub fn cancel(&self, job_id: &str) -> Option<MatchingJob> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        let entry = jobs.get(job_id)?;
        if !entry.job.status.is_terminal() {
            entry.cancel.store(true, Ordering::SeqCst);
            info!(job_id, "Cancellation requested");
        }
        Some(entry.job.clone())
    }

    pub fn get(&self, job_id: &str) -> Option<MatchingJob> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        jobs.get(job_id).map(|e| e.job.clone())
    }

    /// All jobs, newest first.
    pub fn list_jobs(&self) -> Vec<MatchingJob> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<MatchingJob> = jobs.values().map(|e| e.job.clone()).collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        list
    }

    /// Drop every finished job. Running and pending jobs are kept.
    pub fn clear_all(&self) -> usize {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let before = jobs.len();
        jobs.retain(|_, e| !e.job.status.is_terminal());
        before - jobs.len()
    }

    /// Mutate a job unless it has already reached a terminal state.
    fn update(&self, job_id: &str, f: impl FnOnce(&mut MatchingJob)) {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = jobs.get_mut(job_id) {
            if !entry.job.status.is_terminal() {
                f(&mut entry.job);
            }
        }
    }

    async fn run(&self, job_id: &str, cancel: Arc<AtomicBool>) {
        let Some(job) = self.get(job_id) else {
            return;
        };
        self.update(job_id, |j| {
            j.status = JobStatus::Running;
            j.started_at = Some(Utc::now());
        });

        let outcome = self.run_units(&job, &cancel).await;
        let now = Utc::now();
        match outcome {
            Ok(RunEnd::Completed) => {
                self.update(job_id, |j| {
                    j.status = JobStatus::Completed;
                    j.completed_at = Some(now);
                });
                info!(job_id, "Matching job completed");
            }
            Ok(RunEnd::Cancelled) => {
                self.update(job_id, |j| {
                    j.status = JobStatus::Cancelled;
                    j.completed_at = Some(now);
                });
                info!(job_id, "Matching job cancelled");
            }
            Err(e) => {
                error!(job_id, "Matching job failed: {}", e);
                self.update(job_id, |j| {
                    j.status = JobStatus::Failed;
                    j.error = Some(e.to_string());
                    j.completed_at = Some(now);
                });
            }
        }
    }

    async fn select(
        &self,
        job: &MatchingJob,
    ) -> Result<(Vec<TemplateMetadata>, Vec<DocumentMetadata>), StoreError> {
        let mut templates = self.store.list_templates().await?;
        if let Some(slugs) = &job.template_slugs {
            templates.retain(|t| slugs.contains(&t.template_slug));
            if templates.len() < slugs.len() {
                warn!(job_id = %job.id, "Some requested templates do not exist");
            }
        }

        let customers = match &job.customer_ids {
            Some(ids) => ids.clone(),
            None => self.store.list_customer_ids().await?,
        };
        let mut docs = Vec::new();
        for customer_id in customers {
            docs.extend(self.store.list_documents(customer_id).await?);
        }
        Ok((templates, docs))
    }

    async fn run_units(
        &self,
        job: &MatchingJob,
        cancel: &AtomicBool,
    ) -> Result<RunEnd, StoreError> {
        let (templates, docs) = self.select(job).await?;
        let total = (templates.len() * docs.len()) as u64;
        self.update(&job.id, |j| j.total_documents = total);
        debug!(
            job_id = %job.id,
            "{} templates x {} documents",
            templates.len(),
            docs.len()
        );

        for template in &templates {
            for doc in &docs {
                if cancel.load(Ordering::SeqCst) {
                    return Ok(RunEnd::Cancelled);
                }

                let cached = !job.force_recalculate
                    && doc.relevance_for(&template.template_slug).is_some();
                let matched = if cached {
                    false
                } else {
                    let result = matching::score(template, doc);
                    let saved = self
                        .store
                        .save_template_relevance(
                            doc.customer_id,
                            &doc.filename,
                            TemplateRelevance {
                                template_slug: template.template_slug.clone(),
                                score: result.score,
                                reasoning: result.reasons.join("; "),
                            },
                        )
                        .await;
                    match saved {
                        Ok(()) => result.score >= self.match_threshold,
                        // Deleted since selection
                        Err(StoreError::NotFound { .. }) => {
                            debug!(
                                job_id = %job.id,
                                filename = %doc.filename,
                                "Document gone, skipping"
                            );
                            false
                        }
                        Err(e) => return Err(e),
                    }
                };

                self.update(&job.id, |j| {
                    j.processed_documents += 1;
                    if matched {
                        j.matched_documents += 1;
                    } else {
                        j.skipped_documents += 1;
                    }
                });
                tokio::task::yield_now().await;
            }
        }

        if cancel.load(Ordering::SeqCst) {
            return Ok(RunEnd::Cancelled);
        }
        Ok(RunEnd::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    async fn seeded_store(docs: usize) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let mut template = TemplateMetadata::new("sales", "Sales");
        template.required_data_types = vec!["orders".into()];
        template.has_tables = true;
        store.upsert_template(&template).await.unwrap();
        for i in 0..docs {
            let mut doc = DocumentMetadata::new(7, format!("doc-{:02}.csv", i));
            if i % 2 == 0 {
                doc.data_categories = vec!["orders".into()];
                doc.has_tables = true;
            }
            store.upsert_document(&doc).await.unwrap();
        }
        store
    }

    async fn wait_terminal(scheduler: &JobScheduler, id: &str) -> MatchingJob {
        loop {
            let job = scheduler.get(id).unwrap();
            assert!(job.processed_documents <= job.total_documents);
            assert!(job.matched_documents + job.skipped_documents <= job.processed_documents);
            if job.status.is_terminal() {
                return job;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_job_completes_and_persists_scores() {
        let store = seeded_store(4).await;
        let scheduler = JobScheduler::new(store.clone(), 4.0);
        let id = scheduler.start(JobRequest::default());

        let job = wait_terminal(&scheduler, &id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.total_documents, 4);
        assert_eq!(job.processed_documents, 4);
        // Even docs: 4.0 + 0.5 = 4.5 clears the threshold
        assert_eq!(job.matched_documents, 2);
        assert_eq!(job.skipped_documents, 2);
        assert!(job.started_at.is_some() && job.completed_at.is_some());

        let doc = store.get_document(7, "doc-00.csv").await.unwrap().unwrap();
        assert_eq!(doc.relevance_for("sales").unwrap().score, 4.5);
    }

    #[tokio::test]
    async fn test_cached_scores_skipped_unless_forced() {
        let store = seeded_store(3).await;
        let scheduler = JobScheduler::new(store.clone(), 4.0);
        let first = scheduler.start(JobRequest::default());
        wait_terminal(&scheduler, &first).await;

        let second = scheduler.start(JobRequest::default());
        let job = wait_terminal(&scheduler, &second).await;
        assert_eq!(job.processed_documents, 3);
        assert_eq!(job.skipped_documents, 3);
        assert_eq!(job.matched_documents, 0);

        let forced = scheduler.start(JobRequest {
            force_recalculate: true,
            ..Default::default()
        });
        let job = wait_terminal(&scheduler, &forced).await;
        assert_eq!(job.matched_documents, 2);
    }

    #[tokio::test]
    async fn test_cancel_mid_run() {
        let store = seeded_store(50).await;
        let scheduler = JobScheduler::new(store, 4.0);
        let id = scheduler.start(JobRequest::default());

        loop {
            tokio::task::yield_now().await;
            if scheduler.get(&id).unwrap().processed_documents >= 10 {
                scheduler.cancel(&id);
                break;
            }
        }

        let job = wait_terminal(&scheduler, &id).await;
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!((10..=50).contains(&job.processed_documents));
        assert_eq!(job.total_documents, 50);

        // Terminal jobs ignore further cancellation and get cleared
        assert_eq!(scheduler.cancel(&id).unwrap().status, JobStatus::Cancelled);
        assert_eq!(scheduler.clear_all(), 1);
        assert!(scheduler.list_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_selection_filters() {
        let store = seeded_store(2).await;
        store
            .upsert_document(&DocumentMetadata::new(9, "other.pdf"))
            .await
            .unwrap();
        store
            .upsert_template(&TemplateMetadata::new("hr", "HR"))
            .await
            .unwrap();

        let scheduler = JobScheduler::new(store, 4.0);
        let id = scheduler.start(JobRequest {
            template_slugs: Some(vec!["hr".into()]),
            customer_ids: Some(vec![9]),
            ..Default::default()
        });
        let job = wait_terminal(&scheduler, &id).await;
        assert_eq!(job.total_documents, 1);
        assert_eq!(job.processed_documents, 1);
    }

    enum Fault {
        /// Every document write fails.
        Writes,
        /// Listed documents are gone by the time they are read back.
        Vanished,
    }

    struct FaultyStore(MemoryStore, Fault);

    #[async_trait]
    impl MetadataStore for FaultyStore {
        async fn upsert_document(&self, doc: &DocumentMetadata) -> Result<(), StoreError> {
            match self.1 {
                Fault::Writes => Err(StoreError::Status {
                    status: 503,
                    body: "unavailable".into(),
                }),
                Fault::Vanished => self.0.upsert_document(doc).await,
            }
        }
        async fn get_document(
            &self,
            customer_id: CustomerId,
            filename: &str,
        ) -> Result<Option<DocumentMetadata>, StoreError> {
            match self.1 {
                Fault::Writes => self.0.get_document(customer_id, filename).await,
                Fault::Vanished => Ok(None),
            }
        }
        async fn list_documents(
            &self,
            customer_id: CustomerId,
        ) -> Result<Vec<DocumentMetadata>, StoreError> {
            self.0.list_documents(customer_id).await
        }
        async fn list_customer_ids(&self) -> Result<Vec<CustomerId>, StoreError> {
            self.0.list_customer_ids().await
        }
        async fn delete_document(
            &self,
            customer_id: CustomerId,
            filename: &str,
        ) -> Result<bool, StoreError> {
            self.0.delete_document(customer_id, filename).await
        }
        async fn upsert_template(&self, template: &TemplateMetadata) -> Result<(), StoreError> {
            self.0.upsert_template(template).await
        }
        async fn get_template(&self, slug: &str) -> Result<Option<TemplateMetadata>, StoreError> {
            self.0.get_template(slug).await
        }
        async fn list_templates(&self) -> Result<Vec<TemplateMetadata>, StoreError> {
            self.0.list_templates().await
        }
    }

    #[tokio::test]
    async fn test_store_error_fails_whole_job() {
        let seeded = seeded_store(3).await;
        let store = Arc::new(FaultyStore((*seeded).clone(), Fault::Writes));
        let scheduler = JobScheduler::new(store, 4.0);
        let id = scheduler.start(JobRequest::default());

        let job = wait_terminal(&scheduler, &id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("503"));
        assert_eq!(job.processed_documents, 0);
        assert_eq!(scheduler.list_jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_document_deleted_mid_run_is_skipped() {
        let seeded = seeded_store(3).await;
        let store = Arc::new(FaultyStore((*seeded).clone(), Fault::Vanished));
        let scheduler = JobScheduler::new(store, 4.0);
        let id = scheduler.start(JobRequest::default());

        let job = wait_terminal(&scheduler, &id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.error.is_none());
        assert_eq!(job.processed_documents, job.total_documents);
        assert_eq!(job.skipped_documents, job.total_documents);
        assert_eq!(job.matched_documents, 0);
    }
}
