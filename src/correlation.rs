//! Sidecar records linking an uploaded file to its external identifiers.
//!
//! Each record is a small JSON file stored next to the upload it describes,
//! so concurrent ingestions of different files never touch the same record.

use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use crate::schema::{CorrelationEntry, CustomerId};

const SIDECAR_SUFFIX: &str = ".correlation.json";

#[derive(Debug, Clone)]
pub struct CorrelationStore {
    root: PathBuf,
}

impl CorrelationStore {
    /// `root` is the upload root; customer directories live directly below it.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sidecar_path(&self, customer_id: CustomerId, filename: &str) -> PathBuf {
        self.root
            .join(customer_id.to_string())
            .join(format!(".{}{}", filename, SIDECAR_SUFFIX))
    }

    /// Whether a directory entry is a sidecar rather than an upload.
    pub fn is_sidecar(name: &str) -> bool {
        name.starts_with('.') && name.ends_with(SIDECAR_SUFFIX)
    }

    /// Write (or overwrite) the record for one upload.
    pub async fn save(
        &self,
        customer_id: CustomerId,
        entry: &CorrelationEntry,
    ) -> std::io::Result<()> {
        let path = self.sidecar_path(customer_id, &entry.local_filename);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(entry)?;
        write_atomic(&path, &json).await?;
        debug!(
            "Saved correlation {} -> {}",
            entry.local_filename, entry.external_document_name
        );
        Ok(())
    }

    /// Read the record for one upload. A corrupt record reads as absent.
    pub async fn load(
        &self,
        customer_id: CustomerId,
        filename: &str,
    ) -> std::io::Result<Option<CorrelationEntry>> {
        let path = self.sidecar_path(customer_id, filename);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        match serde_json::from_slice(&bytes) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!("Ignoring unreadable correlation record {:?}: {}", path, e);
                Ok(None)
            }
        }
    }

    /// Delete the record. Returns whether one existed.
    pub async fn remove(&self, customer_id: CustomerId, filename: &str) -> std::io::Result<bool> {
        match fs::remove_file(self.sidecar_path(customer_id, filename)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await
}
