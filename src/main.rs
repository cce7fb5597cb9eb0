//! docmatch - document ingestion, metadata extraction and template relevance matching server.

mod ai;
mod config;
mod correlation;
mod doc_service;
mod document_text;
mod error;
mod ingest;
mod jobs;
mod matching;
mod metadata_extractor;
mod notifications;
mod openrouter;
mod pinning;
mod poll;
mod schema;
mod server;
mod store;
mod supabase;
mod template_analyzer;
mod uploads;

#[cfg(test)]
mod testing;

use ai::TextGenerator;
use config::AppConfig;
use doc_service::{DocServiceClient, IndexingService};
use openrouter::OpenRouterClient;
use server::AppState;
use std::sync::Arc;
use store::{MemoryStore, MetadataStore};
use supabase::SupabaseStore;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docmatch=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::load()?;
    tokio::fs::create_dir_all(&config.server.storage_dir).await?;
    info!("Storing uploads under {:?}", config.server.storage_dir);

    let http = reqwest::Client::builder()
        .user_agent(concat!("docmatch/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let service: Arc<dyn IndexingService> =
        Arc::new(DocServiceClient::new(http.clone(), &config.doc_service));
    info!("Indexing service at {}", config.doc_service.base_url);

    let supabase = SupabaseStore::from_config(http.clone(), &config.store);
    let store: Arc<dyn MetadataStore> = match supabase {
        Some(store) => {
            info!("Metadata store: Supabase");
            Arc::new(store)
        }
        None => {
            warn!("SUPABASE_URL not set, metadata is kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let generator: Option<Arc<dyn TextGenerator>> =
        match OpenRouterClient::from_config(http, &config.ai) {
            Some(client) => {
                info!("OpenRouter client initialized");
                Some(Arc::new(client))
            }
            None => {
                info!("OPENROUTER_API_KEY not set, analysis runs as workspace chat");
                None
            }
        };

    let bind = config.server.bind.clone();
    let app = server::router(AppState::new(config, service, store, generator));

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!("Server listening on http://{}", bind);
    axum::serve(listener, app).await?;

    Ok(())
}
