//! Client for the external document indexing and embedding service.
//!
//! The service stores documents in folders, indexes them asynchronously and
//! embeds them into per-customer workspaces. Listings are eventually
//! consistent and moves are unreliable, so callers treat every call here as
//! fallible and retry at the pipeline level.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::DocServiceConfig;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("indexing service request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("indexing service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("indexing service rejected request: {0}")]
    Rejected(String),
    #[error("unexpected indexing service response: {0}")]
    Decode(String),
}

/// Where the service says a document lives.
///
/// Responses carry either an absolute storage path or a path relative to the
/// document root; this is resolved once here instead of at each call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentLocation {
    FullPath(String),
    RelativePath(String),
}

impl DocumentLocation {
    const ROOT_MARKER: &'static str = "/documents/";

    pub fn parse(raw: &str) -> Self {
        let normalized = raw.trim().replace('\\', "/");
        let is_absolute = normalized.starts_with('/')
            || normalized.as_bytes().get(1) == Some(&b':')
            || normalized.contains(Self::ROOT_MARKER);
        if is_absolute {
            Self::FullPath(normalized)
        } else {
            Self::RelativePath(normalized.trim_start_matches("./").to_string())
        }
    }

    /// Identifier relative to the document root (`folder/file.json`).
    pub fn relative(&self) -> String {
        match self {
            Self::RelativePath(path) => path.clone(),
            Self::FullPath(path) => match path.rfind(Self::ROOT_MARKER) {
                Some(idx) => path[idx + Self::ROOT_MARKER.len()..].to_string(),
                None => {
                    let parts: Vec<&str> = path.rsplitn(3, '/').collect();
                    match parts.as_slice() {
                        [file, folder, ..] => format!("{}/{}", folder, file),
                        _ => path.trim_start_matches('/').to_string(),
                    }
                }
            },
        }
    }

    pub fn file_name(&self) -> String {
        let relative = self.relative();
        relative
            .rsplit('/')
            .next()
            .unwrap_or(relative.as_str())
            .to_string()
    }
}

/// A document as it appears in the service's listing.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteDocument {
    /// Relative identifier, `folder/file.json`.
    pub name: String,
    pub title: String,
    pub id: Option<String>,
}

impl RemoteDocument {
    pub fn folder(&self) -> Option<&str> {
        self.name.rsplit_once('/').map(|(folder, _)| folder)
    }

    /// Whether this document was produced from the local file `filename`.
    ///
    /// The service titles documents after the source file. Workbooks produce
    /// one document per sheet titled `{stem}-{sheet}`, which only match when
    /// the sheet is listed in `sheet_names`. A title naming another file never
    /// matches, even when it shares the stem.
    pub fn matches_source(&self, filename: &str, sheet_names: &[String]) -> bool {
        let filename = filename.to_lowercase();
        let stem = filename
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(filename.as_str());
        let is_sheet_of = |name: &str| {
            sheet_names
                .iter()
                .any(|s| name == format!("{}-{}", stem, s.to_lowercase()))
        };

        let title = self.title.trim().to_lowercase();
        if !title.is_empty() {
            return title == filename || is_sheet_of(&title);
        }

        let file_part = self.name.rsplit('/').next().unwrap_or(&self.name).to_lowercase();
        let file_part = file_part.trim_end_matches(".json");
        let suffixed = file_part
            .strip_prefix(filename.as_str())
            .and_then(|rest| rest.strip_prefix('-'))
            .is_some_and(|id| !id.is_empty() && !id.contains('.'));
        file_part == filename || suffixed || is_sheet_of(file_part)
    }
}

/// Document created by an upload.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedDocument {
    pub location: DocumentLocation,
    pub title: String,
    pub id: Option<String>,
}

/// Result of an embedding update.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbedOutcome {
    pub ok: bool,
    pub message: Option<String>,
}

impl EmbedOutcome {
    /// The service sometimes answers 200 with a message describing a failure.
    pub fn looks_failed(&self) -> bool {
        if !self.ok {
            return true;
        }
        self.message
            .as_deref()
            .map(|m| {
                let m = m.to_lowercase();
                m.contains("fail") || m.contains("error")
            })
            .unwrap_or(false)
    }
}

/// Operations consumed from the indexing service.
#[async_trait]
pub trait IndexingService: Send + Sync {
    async fn ensure_workspace(&self, slug: &str) -> Result<(), ServiceError>;
    async fn upload(
        &self,
        filename: &str,
        data: Vec<u8>,
    ) -> Result<Vec<UploadedDocument>, ServiceError>;
    async fn list_documents(&self) -> Result<Vec<RemoteDocument>, ServiceError>;
    async fn get_document(&self, name: &str) -> Result<Option<RemoteDocument>, ServiceError>;
    async fn create_folder(&self, name: &str) -> Result<(), ServiceError>;
    async fn move_document(&self, from: &str, to: &str) -> Result<(), ServiceError>;
    async fn update_embeddings(
        &self,
        workspace: &str,
        adds: &[String],
        deletes: &[String],
    ) -> Result<EmbedOutcome, ServiceError>;
    async fn update_pin(
        &self,
        workspace: &str,
        document: &str,
        pinned: bool,
    ) -> Result<(), ServiceError>;
    async fn remove_documents(&self, names: &[String]) -> Result<(), ServiceError>;
    async fn upload_raw_text(
        &self,
        title: &str,
        text: &str,
    ) -> Result<Vec<UploadedDocument>, ServiceError>;
    async fn chat(&self, workspace: &str, message: &str) -> Result<String, ServiceError>;
}

/// HTTP implementation of [`IndexingService`].
#[derive(Clone)]
pub struct DocServiceClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl DocServiceClient {
    pub fn new(client: Client, config: &DocServiceConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ServiceError> {
        let resp = self.authorize(request).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ServiceError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let text = resp.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            ServiceError::Decode(format!(
                "{}: {}",
                e,
                text.chars().take(200).collect::<String>()
            ))
        })
    }
}

#[async_trait]
impl IndexingService for DocServiceClient {
    async fn ensure_workspace(&self, slug: &str) -> Result<(), ServiceError> {
        let existing: WorkspaceLookup = self
            .send(self.client.get(self.url(&format!("workspace/{}", slug))))
            .await?;
        if !existing.workspace.is_empty() {
            return Ok(());
        }
        info!("Creating workspace {}", slug);
        let _: serde_json::Value = self
            .send(
                self.client
                    .post(self.url("workspace/new"))
                    .json(&json!({ "name": slug })),
            )
            .await?;
        Ok(())
    }

    async fn upload(
        &self,
        filename: &str,
        data: Vec<u8>,
    ) -> Result<Vec<UploadedDocument>, ServiceError> {
        use reqwest::multipart::{Form, Part};

        debug!("Uploading {} ({} bytes)", filename, data.len());
        let part = Part::bytes(data).file_name(filename.to_string());
        let form = Form::new().part("file", part);
        let resp: UploadResponse = self
            .send(self.client.post(self.url("document/upload")).multipart(form))
            .await?;
        resp.into_documents()
    }

    async fn list_documents(&self) -> Result<Vec<RemoteDocument>, ServiceError> {
        let resp: ListingResponse = self.send(self.client.get(self.url("documents"))).await?;
        Ok(flatten_root(&resp.local_files))
    }

    async fn get_document(&self, name: &str) -> Result<Option<RemoteDocument>, ServiceError> {
        let resp = self
            .authorize(self.client.get(self.url(&format!("document/{}", name))))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ServiceError::Status { status, body });
        }
        let body: DocumentLookup = resp
            .json()
            .await
            .map_err(|e| ServiceError::Decode(e.to_string()))?;
        Ok(flatten_root(&body.local_files).into_iter().find(|d| {
            d.name == name || d.name.rsplit('/').next() == name.rsplit('/').next()
        }))
    }

    async fn create_folder(&self, name: &str) -> Result<(), ServiceError> {
        let resp: SuccessResponse = self
            .send(
                self.client
                    .post(self.url("document/create-folder"))
                    .json(&json!({ "name": name })),
            )
            .await?;
        match resp.into_result() {
            Err(ServiceError::Rejected(msg)) if msg.to_lowercase().contains("already exists") => {
                Ok(())
            }
            other => other,
        }
    }

    async fn move_document(&self, from: &str, to: &str) -> Result<(), ServiceError> {
        let resp: SuccessResponse = self
            .send(
                self.client
                    .post(self.url("document/move-files"))
                    .json(&json!({ "files": [{ "from": from, "to": to }] })),
            )
            .await?;
        resp.into_result()
    }

    async fn update_embeddings(
        &self,
        workspace: &str,
        adds: &[String],
        deletes: &[String],
    ) -> Result<EmbedOutcome, ServiceError> {
        let resp: EmbeddingsResponse = self
            .send(
                self.client
                    .post(self.url(&format!("workspace/{}/update-embeddings", workspace)))
                    .json(&json!({ "adds": adds, "deletes": deletes })),
            )
            .await?;
        Ok(EmbedOutcome {
            ok: resp.workspace.is_some() && resp.error.is_none(),
            message: resp.message.or(resp.error),
        })
    }

    async fn update_pin(
        &self,
        workspace: &str,
        document: &str,
        pinned: bool,
    ) -> Result<(), ServiceError> {
        let _: serde_json::Value = self
            .send(
                self.client
                    .post(self.url(&format!("workspace/{}/update-pin", workspace)))
                    .json(&json!({ "docPath": document, "pinStatus": pinned })),
            )
            .await?;
        Ok(())
    }

    async fn remove_documents(&self, names: &[String]) -> Result<(), ServiceError> {
        let resp: SuccessResponse = self
            .send(
                self.client
                    .delete(self.url("system/remove-documents"))
                    .json(&json!({ "names": names })),
            )
            .await?;
        resp.into_result()
    }

    async fn upload_raw_text(
        &self,
        title: &str,
        text: &str,
    ) -> Result<Vec<UploadedDocument>, ServiceError> {
        let resp: UploadResponse = self
            .send(self.client.post(self.url("document/raw-text")).json(&json!({
                "textContent": text,
                "metadata": { "title": title },
            })))
            .await?;
        resp.into_documents()
    }

    async fn chat(&self, workspace: &str, message: &str) -> Result<String, ServiceError> {
        let resp: ChatResponse = self
            .send(
                self.client
                    .post(self.url(&format!("workspace/{}/chat", workspace)))
                    .json(&json!({ "message": message, "mode": "chat" })),
            )
            .await?;
        if let Some(error) = resp.error {
            return Err(ServiceError::Rejected(error));
        }
        Ok(resp.text_response.unwrap_or_default())
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct WorkspaceLookup {
    #[serde(default)]
    workspace: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct SuccessResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl SuccessResponse {
    fn into_result(self) -> Result<(), ServiceError> {
        if self.success {
            Ok(())
        } else {
            Err(ServiceError::Rejected(
                self.error
                    .or(self.message)
                    .unwrap_or_else(|| "request not applied".to_string()),
            ))
        }
    }
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    documents: Vec<UploadedRow>,
}

#[derive(Debug, Deserialize)]
struct UploadedRow {
    location: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    id: Option<String>,
}

impl UploadResponse {
    fn into_documents(self) -> Result<Vec<UploadedDocument>, ServiceError> {
        if !self.success {
            return Err(ServiceError::Rejected(
                self.error.unwrap_or_else(|| "upload rejected".to_string()),
            ));
        }
        if self.documents.is_empty() {
            return Err(ServiceError::Decode("upload returned no documents".to_string()));
        }
        Ok(self
            .documents
            .into_iter()
            .map(|row| UploadedDocument {
                location: DocumentLocation::parse(&row.location),
                title: row.title,
                id: row.id,
            })
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct ListingResponse {
    #[serde(rename = "localFiles")]
    local_files: ListingNode,
}

#[derive(Debug, Deserialize)]
struct DocumentLookup {
    #[serde(rename = "localFiles")]
    local_files: ListingNode,
}

#[derive(Debug, Deserialize)]
struct ListingNode {
    #[serde(default)]
    name: String,
    #[serde(rename = "type", default)]
    node_type: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    items: Vec<ListingNode>,
}

/// Flatten the folder tree into `folder/file` identifiers. The root node is
/// the document store itself and is not part of any identifier.
fn flatten_root(root: &ListingNode) -> Vec<RemoteDocument> {
    let mut out = Vec::new();
    for item in &root.items {
        flatten_listing(item, None, &mut out);
    }
    out
}

fn flatten_listing(node: &ListingNode, folder: Option<&str>, out: &mut Vec<RemoteDocument>) {
    if node.node_type == "file" {
        let name = match folder {
            Some(folder) => format!("{}/{}", folder, node.name),
            None => node.name.clone(),
        };
        out.push(RemoteDocument {
            name,
            title: node.title.clone().unwrap_or_else(|| node.name.clone()),
            id: node.id.clone(),
        });
        return;
    }
    for item in &node.items {
        flatten_listing(item, Some(node.name.as_str()), out);
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    #[serde(default)]
    workspace: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(rename = "textResponse", default)]
    text_response: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_full_path() {
        let loc = DocumentLocation::parse(
            "/app/server/storage/documents/custom-documents/invoice.xlsx-1a2b.json",
        );
        assert!(matches!(loc, DocumentLocation::FullPath(_)));
        assert_eq!(loc.relative(), "custom-documents/invoice.xlsx-1a2b.json");
        assert_eq!(loc.file_name(), "invoice.xlsx-1a2b.json");
    }

    #[test]
    fn test_location_windows_path() {
        let loc = DocumentLocation::parse(r"C:\data\documents\customer-7\report.json");
        assert!(matches!(loc, DocumentLocation::FullPath(_)));
        assert_eq!(loc.relative(), "customer-7/report.json");
    }

    #[test]
    fn test_location_relative_path() {
        let loc = DocumentLocation::parse("custom-documents/report.pdf-99.json");
        assert_eq!(
            loc,
            DocumentLocation::RelativePath("custom-documents/report.pdf-99.json".to_string())
        );
        assert_eq!(loc.relative(), "custom-documents/report.pdf-99.json");
    }

    #[test]
    fn test_matches_source() {
        let sheets = vec!["Sheet2".to_string()];
        let doc = RemoteDocument {
            name: "customer-7/invoice-Sheet2.json".to_string(),
            title: "invoice-Sheet2".to_string(),
            id: None,
        };
        assert!(doc.matches_source("invoice.xlsx", &sheets));
        assert!(!doc.matches_source("invoice.xlsx", &[]));
        assert!(!doc.matches_source("receipt.xlsx", &sheets));

        let exact = RemoteDocument {
            name: "custom-documents/report.pdf-abc.json".to_string(),
            title: "report.pdf".to_string(),
            id: Some("abc".to_string()),
        };
        assert!(exact.matches_source("Report.PDF", &[]));
        assert_eq!(exact.folder(), Some("custom-documents"));

        let untitled = RemoteDocument {
            name: "custom-documents/report.pdf-abc.json".to_string(),
            title: String::new(),
            id: None,
        };
        assert!(untitled.matches_source("report.pdf", &[]));
    }

    #[test]
    fn test_shared_stem_is_not_a_match() {
        let other = RemoteDocument {
            name: "customer-7/report-2024.pdf-0.json".to_string(),
            title: "report-2024.pdf".to_string(),
            id: Some("id-1".to_string()),
        };
        assert!(!other.matches_source("report.pdf", &[]));

        let untitled = RemoteDocument {
            name: "customer-7/report-2024.pdf-0.json".to_string(),
            title: String::new(),
            id: None,
        };
        assert!(!untitled.matches_source("report.pdf", &[]));

        let backup = RemoteDocument {
            name: "customer-7/a.csv-backup.csv-3.json".to_string(),
            title: String::new(),
            id: None,
        };
        assert!(!backup.matches_source("a.csv", &[]));
    }

    #[test]
    fn test_embed_outcome_ambiguous_message() {
        let ok = EmbedOutcome {
            ok: true,
            message: Some("Workspace updated".to_string()),
        };
        assert!(!ok.looks_failed());
        let ambiguous = EmbedOutcome {
            ok: true,
            message: Some("1 documents failed to add".to_string()),
        };
        assert!(ambiguous.looks_failed());
        assert!(EmbedOutcome { ok: false, message: None }.looks_failed());
    }

    #[test]
    fn test_flatten_listing() {
        let listing: ListingResponse = serde_json::from_value(serde_json::json!({
            "localFiles": {
                "name": "documents",
                "type": "folder",
                "items": [
                    {"name": "custom-documents", "type": "folder", "items": [
                        {"name": "a.pdf-1.json", "type": "file", "title": "a.pdf", "id": "1"}
                    ]},
                    {"name": "customer-7", "type": "folder", "items": [
                        {"name": "b-Sheet1.json", "type": "file", "title": "b-Sheet1"}
                    ]}
                ]
            }
        }))
        .unwrap();

        let docs = flatten_root(&listing.local_files);
        let names: Vec<_> = docs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["custom-documents/a.pdf-1.json", "customer-7/b-Sheet1.json"]);
        assert_eq!(docs[1].title, "b-Sheet1");
    }
}
