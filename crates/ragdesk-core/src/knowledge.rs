//! Knowledge-base backend contract and wire types

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::Result;
use crate::chat::lenient_timestamp;
use crate::types::ProcessingTask;

/// Default chunking parameters offered for previews
pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub documents: Vec<DocumentRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: i64,
    pub file_name: String,
    #[serde(default)]
    pub knowledge_base_id: Option<i64>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub processing_tasks: Vec<DocumentTask>,
}

impl DocumentRecord {
    /// Most recent processing task, if the backend reported any
    pub fn latest_task(&self) -> Option<&DocumentTask> {
        self.processing_tasks.iter().max_by_key(|task| task.id)
    }
}

/// Processing history entry attached to a stored document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentTask {
    pub id: i64,
    pub status: String,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Whether the backend already holds identical content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    Exists,
    #[default]
    Pending,
}

/// One entry of the upload response, matched to local files by name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadResult {
    #[serde(default)]
    pub upload_id: Option<i64>,
    #[serde(default)]
    pub document_id: Option<i64>,
    pub file_name: String,
    #[serde(default)]
    pub status: UploadState,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub skip_processing: bool,
    #[serde(default)]
    pub temp_path: Option<String>,
}

impl UploadResult {
    /// Content was ingested before; no processing step is needed
    pub fn already_ingested(&self) -> bool {
        self.skip_processing || self.status == UploadState::Exists
    }
}

/// Entry of the processing request body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessItem {
    pub upload_id: i64,
    pub file_name: String,
    pub status: UploadState,
    pub skip_processing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskList {
    pub tasks: Vec<ProcessingTask>,
}

/// Backend state of a processing task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    #[serde(default)]
    pub document_id: Option<i64>,
    pub status: TaskState,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub upload_id: Option<i64>,
    #[serde(default)]
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewRequest {
    pub document_ids: Vec<i64>,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl PreviewRequest {
    pub fn for_document(document_id: i64) -> Self {
        Self {
            document_ids: vec![document_id],
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewChunk {
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewResponse {
    pub chunks: Vec<PreviewChunk>,
    pub total_chunks: usize,
}

/// Test-retrieval request against one knowledge base
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalQuery {
    pub query: String,
    pub kb_id: i64,
    pub top_k: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalHit {
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub score: f32,
}

impl RetrievalHit {
    pub fn source(&self) -> Option<&str> {
        self.metadata.get("source").and_then(Value::as_str)
    }
}

/// Knowledge-base operations offered by the backend
///
/// Source lookups take ids as strings because they come from citation
/// metadata, where the backend may encode them either way.
#[async_trait]
pub trait KnowledgeBaseApi: Send + Sync {
    /// Fetch a knowledge base by id
    async fn get_knowledge_base(&self, kb_id: &str) -> Result<KnowledgeBase>;

    /// List the documents stored in a knowledge base
    async fn list_documents(&self, kb_id: i64) -> Result<Vec<DocumentRecord>>;

    /// Fetch a single document record
    async fn get_document(&self, kb_id: &str, document_id: &str) -> Result<DocumentRecord>;

    /// Upload local files in one multipart request
    async fn upload_documents(&self, kb_id: i64, files: &[PathBuf]) -> Result<Vec<UploadResult>>;

    /// Submit uploaded files for asynchronous processing
    async fn process_documents(&self, kb_id: i64, items: &[ProcessItem]) -> Result<TaskList>;

    /// Query the state of processing tasks, keyed by task id
    async fn task_status(&self, kb_id: i64, task_ids: &[i64]) -> Result<HashMap<i64, TaskStatus>>;

    /// Preview how a document would be chunked
    async fn preview_document(&self, kb_id: i64, request: &PreviewRequest) -> Result<PreviewResponse>;

    /// Run a retrieval query without generating an answer
    async fn test_retrieval(&self, query: &RetrievalQuery) -> Result<Vec<RetrievalHit>>;
}
