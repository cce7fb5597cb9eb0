//! Local upload storage and request input validation.
//!
//! An upload counts as received once it is written here; everything that
//! talks to the indexing service happens afterwards.

use regex::Regex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::OnceLock;
use tokio::fs;

use crate::correlation::CorrelationStore;
use crate::error::AppError;
use crate::schema::CustomerId;

fn slug_regex() -> &'static Regex {
    static SLUG: OnceLock<Regex> = OnceLock::new();
    SLUG.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9_-]{0,63}$").expect("slug regex is valid"))
}

pub fn parse_customer_id(raw: &str) -> Result<CustomerId, AppError> {
    match raw.trim().parse::<CustomerId>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(AppError::validation(format!("Invalid customer id: {}", raw))),
    }
}

/// Accept a bare file name only: no separators, no parent references.
pub fn validate_filename(raw: &str) -> Result<String, AppError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(AppError::validation("Missing filename"));
    }
    if name.len() > 255
        || name.contains(['/', '\\'])
        || name.contains("..")
        || name.chars().any(char::is_control)
        || name.starts_with('.')
    {
        return Err(AppError::validation(format!("Invalid filename: {}", name)));
    }
    Ok(name.to_string())
}

pub fn validate_slug(raw: &str) -> Result<String, AppError> {
    let slug = raw.trim();
    if slug_regex().is_match(slug) {
        Ok(slug.to_string())
    } else {
        Err(AppError::validation(format!("Invalid template slug: {}", raw)))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    pub name: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct LocalUploads {
    root: PathBuf,
}

impl LocalUploads {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, customer_id: CustomerId, filename: &str) -> PathBuf {
        self.root.join(customer_id.to_string()).join(filename)
    }

    pub async fn save(
        &self,
        customer_id: CustomerId,
        filename: &str,
        data: &[u8],
    ) -> std::io::Result<PathBuf> {
        let path = self.path_for(customer_id, filename);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, data).await?;
        Ok(path)
    }

    /// Returns whether a file was removed.
    pub async fn delete(&self, customer_id: CustomerId, filename: &str) -> std::io::Result<bool> {
        match fs::remove_file(self.path_for(customer_id, filename)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn exists(&self, customer_id: CustomerId, filename: &str) -> bool {
        fs::metadata(self.path_for(customer_id, filename))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// Uploaded files for a customer, sorted by name, sidecars excluded.
    pub async fn list(&self, customer_id: CustomerId) -> std::io::Result<Vec<StoredFile>> {
        let dir = self.root.join(customer_id.to_string());
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || CorrelationStore::is_sidecar(&name) {
                continue;
            }
            let meta = entry.metadata().await?;
            if meta.is_file() {
                files.push(StoredFile {
                    name,
                    size_bytes: meta.len(),
                });
            }
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }
}
