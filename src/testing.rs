//! In-process fakes behind the service traits, shared by module tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crate::ai::TextGenerator;
use crate::doc_service::{
    DocumentLocation, EmbedOutcome, IndexingService, RemoteDocument, ServiceError,
    UploadedDocument,
};

#[derive(Default)]
struct FakeState {
    /// Documents the listing currently shows.
    visible: Vec<RemoteDocument>,
    /// Uploaded documents that appear after `hidden_lists` more listing calls.
    pending: Vec<RemoteDocument>,
    hidden_lists: u32,
    /// Extra documents an upload creates per source file (one per sheet).
    upload_names: HashMap<String, Vec<String>>,
    upload_error: Option<String>,
    upload_delay: Option<Duration>,
    workspaces: HashSet<String>,
    workspace_error: bool,
    move_failures: u32,
    embed_script: VecDeque<Result<EmbedOutcome, String>>,
    embedded: HashMap<String, Vec<String>>,
    pinned: HashSet<String>,
    pin_failures: HashSet<String>,
    remove_failures: HashSet<String>,
    raw_texts: Vec<(String, String)>,
    chat_reply: String,
    chat_delay: Option<Duration>,
    calls: Vec<String>,
    next_id: u32,
}

/// Scriptable stand-in for the indexing service.
#[derive(Default)]
pub struct FakeDocService {
    state: Mutex<FakeState>,
}

impl FakeDocService {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn add_document(&self, name: &str, title: &str) {
        self.with_state(|s| {
            s.visible.push(RemoteDocument {
                name: name.to_string(),
                title: title.to_string(),
                id: None,
            })
        });
    }

    /// Uploaded documents stay out of the listing for this many listing calls.
    pub fn hide_uploads_for(&self, lists: u32) {
        self.with_state(|s| s.hidden_lists = lists);
    }

    /// Make an upload of `filename` create the given file names (one per sheet).
    pub fn upload_creates(&self, filename: &str, file_names: &[&str]) {
        self.with_state(|s| {
            s.upload_names.insert(
                filename.to_string(),
                file_names.iter().map(|n| n.to_string()).collect(),
            )
        });
    }

    pub fn fail_uploads(&self, message: &str) {
        self.with_state(|s| s.upload_error = Some(message.to_string()));
    }

    pub fn delay_uploads(&self, delay: Duration) {
        self.with_state(|s| s.upload_delay = Some(delay));
    }

    pub fn fail_workspaces(&self) {
        self.with_state(|s| s.workspace_error = true);
    }

    pub fn fail_moves(&self, times: u32) {
        self.with_state(|s| s.move_failures = times);
    }

    /// Queue embedding responses; once drained every call succeeds.
    pub fn script_embeds(&self, script: Vec<Result<EmbedOutcome, String>>) {
        self.with_state(|s| s.embed_script = script.into());
    }

    pub fn fail_pin(&self, document: &str) {
        self.with_state(|s| {
            s.pin_failures.insert(document.to_string());
        });
    }

    pub fn fail_remove(&self, document: &str) {
        self.with_state(|s| {
            s.remove_failures.insert(document.to_string());
        });
    }

    pub fn set_chat_reply(&self, reply: &str, delay: Option<Duration>) {
        self.with_state(|s| {
            s.chat_reply = reply.to_string();
            s.chat_delay = delay;
        });
    }

    pub fn document_names(&self) -> Vec<String> {
        self.with_state(|s| {
            s.visible
                .iter()
                .chain(s.pending.iter())
                .map(|d| d.name.clone())
                .collect()
        })
    }

    pub fn embedded(&self, workspace: &str) -> Vec<String> {
        self.with_state(|s| s.embedded.get(workspace).cloned().unwrap_or_default())
    }

    pub fn pinned(&self) -> HashSet<String> {
        self.with_state(|s| s.pinned.clone())
    }

    pub fn raw_texts(&self) -> Vec<(String, String)> {
        self.with_state(|s| s.raw_texts.clone())
    }

    pub fn calls(&self) -> Vec<String> {
        self.with_state(|s| s.calls.clone())
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.with_state(|s| s.calls.iter().filter(|c| c.starts_with(prefix)).count())
    }
}

#[async_trait]
impl IndexingService for FakeDocService {
    async fn ensure_workspace(&self, slug: &str) -> Result<(), ServiceError> {
        self.with_state(|s| {
            s.calls.push(format!("ensure_workspace {}", slug));
            if s.workspace_error {
                return Err(ServiceError::Rejected("workspace unavailable".to_string()));
            }
            s.workspaces.insert(slug.to_string());
            Ok(())
        })
    }

    async fn upload(
        &self,
        filename: &str,
        _data: Vec<u8>,
    ) -> Result<Vec<UploadedDocument>, ServiceError> {
        let delay = self.with_state(|s| s.upload_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.with_state(|s| {
            s.calls.push(format!("upload {}", filename));
            if let Some(message) = &s.upload_error {
                return Err(ServiceError::Rejected(message.clone()));
            }
            let file_names = s
                .upload_names
                .get(filename)
                .cloned()
                .unwrap_or_else(|| vec![format!("{}-{}.json", filename, s.next_id)]);
            let mut created = Vec::new();
            for file_name in file_names {
                s.next_id += 1;
                let title = file_name.trim_end_matches(".json").to_string();
                let doc = RemoteDocument {
                    name: format!("custom-documents/{}", file_name),
                    title: if title.starts_with(filename) {
                        filename.to_string()
                    } else {
                        title
                    },
                    id: Some(format!("id-{}", s.next_id)),
                };
                created.push(UploadedDocument {
                    location: DocumentLocation::parse(&format!(
                        "/srv/storage/documents/{}",
                        doc.name
                    )),
                    title: doc.title.clone(),
                    id: doc.id.clone(),
                });
                if s.hidden_lists > 0 {
                    s.pending.push(doc);
                } else {
                    s.visible.push(doc);
                }
            }
            Ok(created)
        })
    }

    async fn list_documents(&self) -> Result<Vec<RemoteDocument>, ServiceError> {
        Ok(self.with_state(|s| {
            s.calls.push("list_documents".to_string());
            if s.hidden_lists > 0 {
                s.hidden_lists -= 1;
            } else {
                let pending = std::mem::take(&mut s.pending);
                s.visible.extend(pending);
            }
            s.visible.clone()
        }))
    }

    async fn get_document(&self, name: &str) -> Result<Option<RemoteDocument>, ServiceError> {
        Ok(self.with_state(|s| {
            s.calls.push(format!("get_document {}", name));
            s.visible.iter().find(|d| d.name == name).cloned()
        }))
    }

    async fn create_folder(&self, name: &str) -> Result<(), ServiceError> {
        self.with_state(|s| s.calls.push(format!("create_folder {}", name)));
        Ok(())
    }

    async fn move_document(&self, from: &str, to: &str) -> Result<(), ServiceError> {
        self.with_state(|s| {
            s.calls.push(format!("move_document {} -> {}", from, to));
            if s.move_failures > 0 {
                s.move_failures -= 1;
                return Err(ServiceError::Rejected("move not applied".to_string()));
            }
            match s.visible.iter_mut().find(|d| d.name == from) {
                Some(doc) => {
                    doc.name = to.to_string();
                    Ok(())
                }
                None => Err(ServiceError::Rejected(format!("{} not found", from))),
            }
        })
    }

    async fn update_embeddings(
        &self,
        workspace: &str,
        adds: &[String],
        deletes: &[String],
    ) -> Result<EmbedOutcome, ServiceError> {
        self.with_state(|s| {
            s.calls.push(format!(
                "update_embeddings {} +{} -{}",
                workspace,
                adds.len(),
                deletes.len()
            ));
            if let Some(scripted) = s.embed_script.pop_front() {
                match scripted {
                    Ok(outcome) if outcome.looks_failed() => return Ok(outcome),
                    Ok(_) => {}
                    Err(message) => return Err(ServiceError::Rejected(message)),
                }
            }
            let embedded = s.embedded.entry(workspace.to_string()).or_default();
            embedded.retain(|n| !deletes.contains(n));
            embedded.extend(adds.iter().cloned());
            Ok(EmbedOutcome {
                ok: true,
                message: Some("Workspace updated".to_string()),
            })
        })
    }

    async fn update_pin(
        &self,
        workspace: &str,
        document: &str,
        pinned: bool,
    ) -> Result<(), ServiceError> {
        self.with_state(|s| {
            s.calls
                .push(format!("update_pin {} {} {}", workspace, document, pinned));
            if s.pin_failures.contains(document) {
                return Err(ServiceError::Rejected("pin failed".to_string()));
            }
            if pinned {
                s.pinned.insert(document.to_string());
            } else {
                s.pinned.remove(document);
            }
            Ok(())
        })
    }

    async fn remove_documents(&self, names: &[String]) -> Result<(), ServiceError> {
        self.with_state(|s| {
            s.calls.push(format!("remove_documents {}", names.join(",")));
            if let Some(name) = names.iter().find(|n| s.remove_failures.contains(*n)) {
                return Err(ServiceError::Rejected(format!("{} is locked", name)));
            }
            s.visible.retain(|d| !names.contains(&d.name));
            Ok(())
        })
    }

    async fn upload_raw_text(
        &self,
        title: &str,
        text: &str,
    ) -> Result<Vec<UploadedDocument>, ServiceError> {
        self.with_state(|s| {
            s.calls.push(format!("upload_raw_text {}", title));
            s.raw_texts.push((title.to_string(), text.to_string()));
            Ok(vec![UploadedDocument {
                location: DocumentLocation::RelativePath(format!(
                    "custom-documents/{}.json",
                    title
                )),
                title: title.to_string(),
                id: None,
            }])
        })
    }

    async fn chat(&self, workspace: &str, _message: &str) -> Result<String, ServiceError> {
        let (reply, delay) = self.with_state(|s| {
            s.calls.push(format!("chat {}", workspace));
            (s.chat_reply.clone(), s.chat_delay)
        });
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(reply)
    }
}

/// Text generator that replays queued replies.
#[derive(Default)]
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<Result<String, String>>>,
    delay: Option<Duration>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new(replies: Vec<Result<String, String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            delay: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Every reply is delayed by `delay` before it is returned.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, _system: &str, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no scripted reply left")),
        }
    }
}
