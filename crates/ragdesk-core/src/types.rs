//! Common types used across the Ragdesk client

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::citation;

/// Author of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Map a backend role string; anything that is not the assistant is shown as user input
    pub fn from_wire(role: &str) -> Self {
        if role.eq_ignore_ascii_case("assistant") {
            Role::Assistant
        } else {
            Role::User
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A chat message as held by the session.
///
/// `raw_content` is exactly what the backend stored or streamed. `content`
/// and `citations` are projections of it and are recomputed, never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub raw_content: String,
    pub content: String,
    pub citations: Vec<Citation>,
}

impl Message {
    /// Create an undecoded message; display content mirrors the raw text
    pub fn new(id: impl Into<String>, role: Role, raw_content: impl Into<String>) -> Self {
        let raw_content = raw_content.into();
        Self {
            id: id.into(),
            role,
            content: raw_content.clone(),
            raw_content,
            citations: Vec::new(),
        }
    }

    /// Return a decoded copy. Only assistant turns carry a citation payload.
    pub fn decoded(&self) -> Self {
        match self.role {
            Role::Assistant => {
                let decoded = citation::decode(&self.raw_content);
                Self {
                    id: self.id.clone(),
                    role: self.role,
                    raw_content: self.raw_content.clone(),
                    content: decoded.content,
                    citations: decoded.citations,
                }
            }
            Role::User => Self::new(self.id.clone(), self.role, self.raw_content.clone()),
        }
    }
}

/// A retrieved passage referenced from an answer by its 1-based ordinal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub id: usize,
    pub text: String,
    pub metadata: Map<String, Value>,
}

impl Citation {
    pub fn kb_id(&self) -> Option<String> {
        self.metadata.get("kb_id").and_then(metadata_id)
    }

    pub fn document_id(&self) -> Option<String> {
        self.metadata.get("document_id").and_then(metadata_id)
    }

    /// Cache key for the citation's source, present only when both ids are known
    pub fn info_key(&self) -> Option<String> {
        match (self.kb_id(), self.document_id()) {
            (Some(kb_id), Some(document_id)) => Some(info_key(&kb_id, &document_id)),
            _ => None,
        }
    }

    /// Metadata as display pairs, values rendered the way a string cast would show them
    pub fn metadata_pairs(&self) -> Vec<(String, String)> {
        self.metadata
            .iter()
            .map(|(key, value)| (key.clone(), display_value(value)))
            .collect()
    }
}

pub fn info_key(kb_id: &str, document_id: &str) -> String {
    format!("{}-{}", kb_id, document_id)
}

fn metadata_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Names resolved for a citation's source document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitationInfo {
    pub knowledge_base_name: String,
    pub document_file_name: String,
}

impl CitationInfo {
    /// File extension used for the icon label, empty when the name has none
    pub fn extension(&self) -> &str {
        match self.document_file_name.rsplit_once('.') {
            Some((_, ext)) => ext,
            None => "",
        }
    }

    pub fn header(&self) -> String {
        format!("{} / {}", self.knowledge_base_name, self.document_file_name)
    }
}

/// Per-file state in the upload/processing workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Uploaded,
    Processing,
    Completed,
    Error,
}

impl UploadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadStatus::Completed | UploadStatus::Error)
    }

    /// Forward-only transitions; `Error` is reachable from the two in-flight states
    pub fn can_transition_to(&self, next: UploadStatus) -> bool {
        use UploadStatus::*;
        matches!(
            (self, next),
            (Pending, Uploading)
                | (Uploading, Uploaded)
                | (Uploading, Completed)
                | (Uploading, Error)
                | (Uploaded, Processing)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, Error)
        )
    }

    pub fn icon(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "⏳",
            UploadStatus::Uploading => "📤",
            UploadStatus::Uploaded => "📄",
            UploadStatus::Processing => "🔄",
            UploadStatus::Completed => "✅",
            UploadStatus::Error => "❌",
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Uploaded => "uploaded",
            UploadStatus::Processing => "processing",
            UploadStatus::Completed => "completed",
            UploadStatus::Error => "error",
        };
        f.write_str(label)
    }
}

/// Tracking entry for one user-selected file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileStatus {
    pub path: PathBuf,
    pub file_name: String,
    pub status: UploadStatus,
    pub upload_id: Option<i64>,
    pub document_id: Option<i64>,
    pub task_id: Option<i64>,
    pub error: Option<String>,
    /// Informational note from the backend, e.g. for duplicate uploads
    pub message: Option<String>,
}

impl FileStatus {
    pub fn pending(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file_name = file_name_of(&path);
        Self {
            path,
            file_name,
            status: UploadStatus::Pending,
            upload_id: None,
            document_id: None,
            task_id: None,
            error: None,
            message: None,
        }
    }
}

/// Name the backend sees for a local file
pub fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// Pairs a client-side upload with the backend job processing it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessingTask {
    pub upload_id: i64,
    pub task_id: i64,
}
