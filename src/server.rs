//! HTTP surface: uploads, notifications, metadata, templates, matching and jobs.

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::{get, post},
    Router,
};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::ai::{TextGenerator, WorkspaceChat};
use crate::config::AppConfig;
use crate::correlation::CorrelationStore;
use crate::doc_service::IndexingService;
use crate::document_text;
use crate::error::AppError;
use crate::ingest::IngestionPipeline;
use crate::jobs::{JobRequest, JobScheduler};
use crate::matching::MatchingEngine;
use crate::metadata_extractor::MetadataExtractor;
use crate::notifications::NotificationBus;
use crate::pinning::PinningController;
use crate::schema::{
    CustomerId, DocumentMetadata, MatchResult, MatchingJob, Notification, TemplateMetadata,
};
use crate::store::MetadataStore;
use crate::template_analyzer::TemplateAnalyzer;
use crate::uploads::{parse_customer_id, validate_filename, validate_slug, LocalUploads, StoredFile};

/// Workspace used for template characterization when no dedicated model is configured.
const TEMPLATE_WORKSPACE: &str = "template-analysis";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    config: Arc<AppConfig>,
    service: Arc<dyn IndexingService>,
    store: Arc<dyn MetadataStore>,
    generator: Option<Arc<dyn TextGenerator>>,
    uploads: LocalUploads,
    correlations: CorrelationStore,
    notifications: NotificationBus,
    pipeline: Arc<IngestionPipeline>,
    extractor: Arc<MetadataExtractor>,
    matching: Arc<MatchingEngine>,
    jobs: JobScheduler,
    pinning: Arc<PinningController>,
    templates: Arc<TemplateAnalyzer>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        service: Arc<dyn IndexingService>,
        store: Arc<dyn MetadataStore>,
        generator: Option<Arc<dyn TextGenerator>>,
    ) -> Self {
        let uploads = LocalUploads::new(config.server.storage_dir.clone());
        let correlations = CorrelationStore::new(config.server.storage_dir.clone());
        let notifications = NotificationBus::new(
            config.notifications.capacity,
            config.notifications.dedup_window(),
        );
        let extractor = Arc::new(MetadataExtractor::new(
            service.clone(),
            store.clone(),
            notifications.clone(),
            generator.clone(),
            config.extraction.clone(),
        ));
        let pipeline = Arc::new(IngestionPipeline::new(
            service.clone(),
            correlations.clone(),
            notifications.clone(),
            extractor.clone(),
            config.doc_service.clone(),
            config.pipeline.clone(),
        ));
        let matching = Arc::new(MatchingEngine::new(&config.matching).with_store(store.clone()));
        let jobs = JobScheduler::new(store.clone(), config.matching.match_threshold);
        let pinning = Arc::new(PinningController::new(
            service.clone(),
            store.clone(),
            config.matching.pin_top_n,
        ));

        Self {
            config: Arc::new(config),
            service,
            store,
            generator,
            uploads,
            correlations,
            notifications,
            pipeline,
            extractor,
            matching,
            jobs,
            pinning,
            templates: Arc::new(TemplateAnalyzer::default()),
        }
    }

    /// Dedicated model when configured, otherwise a chat in `workspace`.
    fn generator_for(&self, workspace: &str) -> Arc<dyn TextGenerator> {
        match &self.generator {
            Some(generator) => generator.clone(),
            None => Arc::new(WorkspaceChat::new(self.service.clone(), workspace)),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.config.server.body_limit_bytes;
    Router::new()
        .route("/health", get(health))
        .route(
            "/uploads/metadata-notifications/:customer_id",
            get(recent_notifications),
        )
        .route("/uploads/metadata-stream/:customer_id", get(stream_notifications))
        .route(
            "/uploads/:customer_id",
            post(upload_file).get(list_uploads).delete(delete_upload),
        )
        .route("/uploads/:customer_id/metadata-extract", post(trigger_extraction))
        .route("/documents/:customer_id", get(list_documents))
        .route("/templates", post(create_template).get(list_templates))
        .route(
            "/matching/jobs",
            post(start_job).get(list_jobs).delete(clear_jobs),
        )
        .route("/matching/jobs/:job_id", get(get_job))
        .route("/matching/jobs/:job_id/cancel", post(cancel_job))
        .route("/matching/:template_slug/:customer_id", get(match_documents))
        .route("/generate/:template_slug/:customer_id", post(generate))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> &'static str {
    "ok"
}

/// Read the `file` field of a multipart body, plus any text fields.
async fn read_multipart(
    mut multipart: Multipart,
) -> Result<(Option<(String, Vec<u8>)>, Vec<(String, String)>), AppError> {
    let mut file = None;
    let mut fields = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::validation(format!("Multipart error: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            let filename = field.file_name().unwrap_or_default().to_string();
            let data = field
                .bytes()
                .await
                .map_err(|e| AppError::validation(format!("Failed to read file: {}", e)))?;
            file = Some((filename, data.to_vec()));
        } else {
            let value = field
                .text()
                .await
                .map_err(|e| AppError::validation(format!("Failed to read {}: {}", name, e)))?;
            fields.push((name, value));
        }
    }
    Ok((file, fields))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    ok: bool,
    file: StoredFile,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    embedding_warning: Option<String>,
}

/// Store an upload locally, push it to the indexing service, and finish
/// registration in the background. Downstream failures only add warnings.
async fn upload_file(
    State(state): State<AppState>,
    Path(customer_id): Path<String>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), AppError> {
    let customer_id = parse_customer_id(&customer_id)?;
    let (file, _) = read_multipart(multipart).await?;
    let (raw_name, data) = file.ok_or_else(|| AppError::validation("No file uploaded"))?;
    let filename = validate_filename(&raw_name)?;
    if data.is_empty() {
        return Err(AppError::validation("Uploaded file is empty"));
    }

    let path = state.uploads.save(customer_id, &filename, &data).await?;
    info!(customer_id, filename = %filename, "Stored upload ({} bytes)", data.len());

    let mut response = UploadResponse {
        ok: true,
        file: StoredFile {
            name: filename.clone(),
            size_bytes: data.len() as u64,
        },
        warning: None,
        embedding_warning: None,
    };

    if let Err(warning) = state.pipeline.prepare_workspace(customer_id).await {
        response.embedding_warning = Some(warning);
    }

    match state.pipeline.upload_remote(customer_id, &filename, data).await {
        Ok(uploaded) => {
            let pipeline = state.pipeline.clone();
            tokio::spawn(async move {
                let report = pipeline
                    .complete_registration(customer_id, path, &filename, uploaded)
                    .await;
                for warning in &report.warnings {
                    warn!(customer_id, filename = %filename, "{}", warning);
                }
            });
        }
        Err(warning) => response.warning = Some(warning),
    }

    Ok((StatusCode::CREATED, Json(response)))
}

async fn list_uploads(
    State(state): State<AppState>,
    Path(customer_id): Path<String>,
) -> Result<Json<Vec<StoredFile>>, AppError> {
    let customer_id = parse_customer_id(&customer_id)?;
    Ok(Json(state.uploads.list(customer_id).await?))
}

#[derive(Debug, Deserialize)]
struct DeleteQuery {
    name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteResponse {
    removed_local: bool,
    removed_names: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    documents_warning: Option<String>,
}

/// External identifiers for an upload: the recorded correlation, otherwise a
/// search of the listing for documents produced from the same file. Runs
/// before the local copy is removed so a workbook's sheet names are known.
async fn remote_names(
    state: &AppState,
    customer_id: CustomerId,
    filename: &str,
    workspace: &str,
) -> Result<Vec<String>, String> {
    match state.correlations.load(customer_id, filename).await {
        Ok(Some(entry)) => return Ok(entry.document_names()),
        Ok(None) => {}
        Err(e) => warn!(customer_id, filename, "Unreadable correlation record: {}", e),
    }

    let local = state.uploads.path_for(customer_id, filename);
    let sheet_names = document_text::preview_file(&local, state.config.extraction.preview_chars)
        .await
        .map(|preview| preview.sheet_names)
        .unwrap_or_default();

    let folders = [workspace, state.config.doc_service.upload_folder.as_str()];
    let docs = state
        .service
        .list_documents()
        .await
        .map_err(|e| format!("Could not search the document listing: {}", e))?;
    Ok(docs
        .into_iter()
        .filter(|d| {
            d.folder().is_some_and(|f| folders.contains(&f))
                && d.matches_source(filename, &sheet_names)
        })
        .map(|d| d.name)
        .collect())
}

async fn delete_upload(
    State(state): State<AppState>,
    Path(customer_id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<DeleteResponse>, AppError> {
    let customer_id = parse_customer_id(&customer_id)?;
    let filename = validate_filename(&query.name)?;
    let workspace = state.pipeline.workspace_for(customer_id);

    let remote = remote_names(&state, customer_id, &filename, &workspace).await;
    let removed_local = state.uploads.delete(customer_id, &filename).await?;
    let mut warnings = Vec::new();
    let mut removed_names = Vec::new();
    let mut all_removed = true;

    match remote {
        Ok(names) if names.is_empty() => {}
        Ok(names) => {
            match state.service.update_embeddings(&workspace, &[], &names).await {
                Ok(outcome) if outcome.looks_failed() => warnings.push(format!(
                    "Embedding removal not confirmed: {}",
                    outcome.message.unwrap_or_default()
                )),
                Ok(_) => {}
                Err(e) => warnings.push(format!("Embedding removal failed: {}", e)),
            }
            match state.service.remove_documents(&names).await {
                Ok(()) => removed_names = names,
                Err(e) => {
                    all_removed = false;
                    warnings.push(format!("Could not remove {}: {}", names.join(", "), e));
                }
            }
        }
        Err(warning) => {
            all_removed = false;
            warnings.push(warning);
        }
    }

    if all_removed {
        if let Err(e) = state.correlations.remove(customer_id, &filename).await {
            warnings.push(format!("Could not remove document mapping: {}", e));
        }
    }
    if let Err(e) = state.store.delete_document(customer_id, &filename).await {
        warnings.push(format!("Could not remove metadata: {}", e));
    }

    info!(
        customer_id,
        filename = %filename,
        removed_local,
        "Deleted upload ({} external documents)",
        removed_names.len()
    );
    Ok(Json(DeleteResponse {
        removed_local,
        removed_names,
        documents_warning: (!warnings.is_empty()).then(|| warnings.join("; ")),
    }))
}

#[derive(Debug, Deserialize)]
struct ExtractRequest {
    filename: String,
}

/// Re-run metadata extraction for a stored upload. Results arrive as notifications.
async fn trigger_extraction(
    State(state): State<AppState>,
    Path(customer_id): Path<String>,
    Json(request): Json<ExtractRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let customer_id = parse_customer_id(&customer_id)?;
    let filename = validate_filename(&request.filename)?;
    if !state.uploads.exists(customer_id, &filename).await {
        return Err(AppError::not_found("upload", filename));
    }

    let document = state
        .correlations
        .load(customer_id, &filename)
        .await
        .ok()
        .flatten()
        .map(|entry| entry.external_document_name)
        .filter(|name| !name.is_empty());
    let workspace = state.pipeline.workspace_for(customer_id);
    let path = state.uploads.path_for(customer_id, &filename);
    let extractor = state.extractor.clone();
    let name = filename.clone();
    tokio::spawn(async move {
        let _ = extractor
            .extract(customer_id, &path, &name, &workspace, document.as_deref())
            .await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "started": true, "filename": filename })),
    ))
}

async fn recent_notifications(
    State(state): State<AppState>,
    Path(customer_id): Path<String>,
) -> Result<Json<Vec<Notification>>, AppError> {
    let customer_id = parse_customer_id(&customer_id)?;
    let limit = state.config.notifications.recent_limit;
    Ok(Json(state.notifications.recent(customer_id, limit)))
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    filename: Option<String>,
}

/// Server-sent events: the tracked file's latest event, then every new event
/// for the customer, checked once per stream interval.
async fn stream_notifications(
    State(state): State<AppState>,
    Path(customer_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    let customer_id = parse_customer_id(&customer_id)?;
    let bus = state.notifications.clone();
    let after = bus.last_seq();
    let snapshot: Vec<Notification> = query
        .filename
        .as_deref()
        .and_then(|f| bus.latest_for(customer_id, f))
        .into_iter()
        .collect();
    let ticker = tokio::time::interval(state.config.notifications.stream_interval());

    let updates = stream::unfold(
        (bus, after, ticker),
        move |(bus, mut after, mut ticker)| async move {
            loop {
                ticker.tick().await;
                let fresh = bus.since(customer_id, after);
                if let Some(last) = fresh.last() {
                    after = last.seq;
                    return Some((stream::iter(fresh), (bus, after, ticker)));
                }
            }
        },
    )
    .flatten();

    let events = stream::iter(snapshot)
        .chain(updates)
        .map(|n| Event::default().event("notification").json_data(&n));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn list_documents(
    State(state): State<AppState>,
    Path(customer_id): Path<String>,
) -> Result<Json<Vec<DocumentMetadata>>, AppError> {
    let customer_id = parse_customer_id(&customer_id)?;
    Ok(Json(state.store.list_documents(customer_id).await?))
}

/// Characterize an uploaded template (multipart `slug`, `name`, `file`).
async fn create_template(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<TemplateMetadata>), AppError> {
    let (file, fields) = read_multipart(multipart).await?;
    let field = |key: &str| {
        fields
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.trim().to_string())
    };
    let slug = validate_slug(&field("slug").unwrap_or_default())?;
    let (filename, data) = file.ok_or_else(|| AppError::validation("No template file uploaded"))?;
    let name = field("name")
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| slug.clone());

    let preview = document_text::preview(&filename, &data, state.config.extraction.preview_chars)
        .map_err(|e| AppError::validation(format!("Unreadable template {}: {:#}", filename, e)))?;
    let existing = state.store.get_template(&slug).await?;

    let generator = match &state.generator {
        Some(generator) => generator.clone(),
        None => {
            state.service.ensure_workspace(TEMPLATE_WORKSPACE).await?;
            state.generator_for(TEMPLATE_WORKSPACE)
        }
    };
    let template = state
        .templates
        .analyze(generator.as_ref(), &slug, &name, &preview, existing.as_ref())
        .await?;
    state.store.upsert_template(&template).await?;
    Ok((StatusCode::CREATED, Json(template)))
}

async fn list_templates(
    State(state): State<AppState>,
) -> Result<Json<Vec<TemplateMetadata>>, AppError> {
    Ok(Json(state.store.list_templates().await?))
}

async fn load_template(state: &AppState, slug: &str) -> Result<TemplateMetadata, AppError> {
    let slug = validate_slug(slug)?;
    state
        .store
        .get_template(&slug)
        .await?
        .ok_or_else(|| AppError::not_found("template", slug))
}

#[derive(Debug, Deserialize)]
struct MatchingQuery {
    ai: Option<bool>,
}

/// Customer documents ranked against a template, best first.
async fn match_documents(
    State(state): State<AppState>,
    Path((template_slug, customer_id)): Path<(String, String)>,
    Query(query): Query<MatchingQuery>,
) -> Result<Json<Vec<MatchResult>>, AppError> {
    let customer_id = parse_customer_id(&customer_id)?;
    let template = load_template(&state, &template_slug).await?;
    let docs = state.store.list_documents(customer_id).await?;

    let generator = query
        .ai
        .unwrap_or(true)
        .then(|| state.generator_for(&state.pipeline.workspace_for(customer_id)));
    let results = state
        .matching
        .build_matching_context(&template, &docs, generator.as_deref())
        .await;
    Ok(Json(results))
}

async fn start_job(
    State(state): State<AppState>,
    Json(request): Json<JobRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    if let Some(slugs) = &request.template_slugs {
        for slug in slugs {
            validate_slug(slug)?;
        }
    }
    let job_id = state.jobs.start(request);
    Ok((StatusCode::ACCEPTED, Json(json!({ "jobId": job_id }))))
}

async fn list_jobs(State(state): State<AppState>) -> Json<Vec<MatchingJob>> {
    Json(state.jobs.list_jobs())
}

async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<MatchingJob>, AppError> {
    state
        .jobs
        .get(&job_id)
        .map(Json)
        .ok_or_else(|| AppError::not_found("job", job_id))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<MatchingJob>, AppError> {
    state
        .jobs
        .cancel(&job_id)
        .map(Json)
        .ok_or_else(|| AppError::not_found("job", job_id))
}

async fn clear_jobs(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "cleared": state.jobs.clear_all() }))
}

#[derive(Debug, Default, Deserialize)]
struct GenerateRequest {
    prompt: Option<String>,
}

fn default_generation_prompt(template: &TemplateMetadata) -> String {
    format!(
        "Using the documents in this workspace, produce the content for the template \"{}\". \
         It needs: {}. Answer with the content only.",
        template.template_name,
        if template.required_data_types.is_empty() {
            "any relevant business data".to_string()
        } else {
            template.required_data_types.join(", ")
        }
    )
}

/// Workspace chat with the template's most relevant documents pinned.
async fn generate(
    State(state): State<AppState>,
    Path((template_slug, customer_id)): Path<(String, String)>,
    request: Option<Json<GenerateRequest>>,
) -> Result<Json<Value>, AppError> {
    let customer_id = parse_customer_id(&customer_id)?;
    let mut template = load_template(&state, &template_slug).await?;
    let workspace = state.pipeline.workspace_for(customer_id);
    let prompt = request
        .and_then(|Json(r)| r.prompt)
        .unwrap_or_else(|| default_generation_prompt(&template));

    let started = Instant::now();
    let service = state.service.clone();
    let text = state
        .pinning
        .with_pinning(
            &workspace,
            &template.template_slug,
            customer_id,
            state.config.matching.pin_min_score,
            || async { service.chat(&workspace, &prompt).await },
        )
        .await?;
    let elapsed = started.elapsed();

    template.generation_stats.record(elapsed);
    if let Err(e) = state.store.upsert_template(&template).await {
        warn!(template = %template.template_slug, "Could not record generation stats: {}", e);
    }
    info!(
        template = %template.template_slug,
        customer_id,
        "Generation finished in {:?}",
        elapsed
    );

    Ok(Json(json!({
        "templateSlug": template.template_slug,
        "durationMs": elapsed.as_millis() as u64,
        "text": text,
    })))
}
