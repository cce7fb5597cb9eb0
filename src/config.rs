//! Service configuration.
//!
//! Layered as: built-in defaults, then an optional JSON file named by
//! `DOCMATCH_CONFIG`, then individual environment variables.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub doc_service: DocServiceConfig,
    pub pipeline: PipelineConfig,
    pub extraction: ExtractionConfig,
    pub matching: MatchingConfig,
    pub notifications: NotificationConfig,
    pub store: StoreConfig,
    pub ai: AiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Root under which uploads are stored, one directory per customer.
    pub storage_dir: PathBuf,
    pub body_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
            storage_dir: PathBuf::from("storage/uploads"),
            body_limit_bytes: 100 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DocServiceConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Workspaces are named `{prefix}{customer_id}`; customer folders share the name.
    pub workspace_prefix: String,
    /// Folder the service drops fresh uploads into.
    pub upload_folder: String,
}

impl Default for DocServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3001/api/v1".to_string(),
            api_key: None,
            workspace_prefix: "customer-".to_string(),
            upload_folder: "custom-documents".to_string(),
        }
    }
}

impl DocServiceConfig {
    pub fn workspace_for(&self, customer_id: i64) -> String {
        format!("{}{}", self.workspace_prefix, customer_id)
    }
}

/// Timings of the ingestion pipeline. All waits are bounded by a deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub upload_timeout_ms: u64,
    pub index_poll_interval_ms: u64,
    pub index_wait_ms: u64,
    pub organize_attempts: u32,
    pub organize_backoff_ms: u64,
    pub verify_poll_interval_ms: u64,
    pub verify_wait_ms: u64,
    pub embed_attempts: u32,
    pub embed_backoff_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            upload_timeout_ms: 30_000,
            index_poll_interval_ms: 2_000,
            index_wait_ms: 30_000,
            organize_attempts: 2,
            organize_backoff_ms: 1_000,
            verify_poll_interval_ms: 2_000,
            verify_wait_ms: 20_000,
            embed_attempts: 3,
            embed_backoff_ms: 2_000,
        }
    }
}

impl PipelineConfig {
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms)
    }
    pub fn index_poll_interval(&self) -> Duration {
        Duration::from_millis(self.index_poll_interval_ms)
    }
    pub fn index_wait(&self) -> Duration {
        Duration::from_millis(self.index_wait_ms)
    }
    pub fn organize_backoff(&self) -> Duration {
        Duration::from_millis(self.organize_backoff_ms)
    }
    pub fn verify_poll_interval(&self) -> Duration {
        Duration::from_millis(self.verify_poll_interval_ms)
    }
    pub fn verify_wait(&self) -> Duration {
        Duration::from_millis(self.verify_wait_ms)
    }
    pub fn embed_backoff(&self) -> Duration {
        Duration::from_millis(self.embed_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub attempts: u32,
    pub backoff_ms: u64,
    pub readiness_poll_interval_ms: u64,
    pub readiness_wait_ms: u64,
    /// Characters of document text included in the analysis prompt.
    pub preview_chars: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 3_000,
            readiness_poll_interval_ms: 2_000,
            readiness_wait_ms: 30_000,
            preview_chars: 12_000,
        }
    }
}

impl ExtractionConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
    pub fn readiness_poll_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_interval_ms)
    }
    pub fn readiness_wait(&self) -> Duration {
        Duration::from_millis(self.readiness_wait_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub ai_timeout_ms: u64,
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
    /// Minimum score a batch job counts as a match.
    pub match_threshold: f64,
    pub pin_min_score: f64,
    pub pin_top_n: usize,
    /// Maximum documents presented to the AI re-ranker in one prompt.
    pub ai_shortlist: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            ai_timeout_ms: 10_000,
            cache_ttl_secs: 15 * 60,
            cache_capacity: 100,
            match_threshold: 5.0,
            pin_min_score: 6.0,
            pin_top_n: 5,
            ai_shortlist: 25,
        }
    }
}

impl MatchingConfig {
    pub fn ai_timeout(&self) -> Duration {
        Duration::from_millis(self.ai_timeout_ms)
    }
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub capacity: usize,
    pub dedup_window_ms: u64,
    pub recent_limit: usize,
    pub stream_interval_ms: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            capacity: 200,
            dedup_window_ms: 5_000,
            recent_limit: 20,
            stream_interval_ms: 2_000,
        }
    }
}

impl NotificationConfig {
    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }
    pub fn stream_interval(&self) -> Duration {
        Duration::from_millis(self.stream_interval_ms)
    }
}

/// Relational store connection. With no URL the service keeps metadata in memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub supabase_url: Option<String>,
    pub service_role_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub api_key: Option<String>,
    pub model: Option<String>,
}

impl AppConfig {
    /// Defaults, then `DOCMATCH_CONFIG` (JSON) if set, then env overrides.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("DOCMATCH_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {:?}", path))?;
        let config: AppConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config: {:?}", path))?;
        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the process env in production).
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("BIND_ADDR") {
            self.server.bind = v;
        }
        if let Some(v) = lookup("STORAGE_DIR") {
            self.server.storage_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("DOC_SERVICE_URL") {
            self.doc_service.base_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = lookup("DOC_SERVICE_API_KEY") {
            self.doc_service.api_key = Some(v);
        }
        if let Some(v) = lookup("WORKSPACE_PREFIX") {
            self.doc_service.workspace_prefix = v;
        }
        if let Some(v) = lookup("OPENROUTER_API_KEY") {
            self.ai.api_key = Some(v);
        }
        if let Some(v) = lookup("OPENROUTER_MODEL") {
            self.ai.model = Some(v);
        }
        if let Some(v) = lookup("SUPABASE_URL") {
            self.store.supabase_url = Some(v);
        }
        if let Some(v) = lookup("SUPABASE_SERVICE_ROLE_KEY") {
            self.store.service_role_key = Some(v);
        }
    }
}
