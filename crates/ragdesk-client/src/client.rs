//! Backend HTTP client implementation

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ragdesk_core::{
    Chat, ChatApi, DocumentRecord, Error, KnowledgeBase, KnowledgeBaseApi, NewChat, OutgoingMessage,
    PreviewRequest, PreviewResponse, ProcessItem, Result, RetrievalHit, RetrievalQuery,
    StreamChunk, TaskList, TaskStatus, UploadResult, file_name_of,
};

use crate::auth::AuthContext;
use crate::config::ClientConfig;
use crate::stream::{DATA_STREAM_HEADER, DataStreamParser, RawTextDecoder, StreamPart};

const NETWORK_ERROR_MESSAGE: &str = "Network error or server is unreachable";
const DEFAULT_ERROR_MESSAGE: &str = "An error occurred";

/// HTTP client for the backend API
pub struct ApiClient {
    config: ClientConfig,
    auth: Arc<AuthContext>,
    client: Client,
}

#[derive(Serialize)]
struct LoginForm<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Serialize)]
struct ChatRequestBody<'a> {
    messages: &'a [OutgoingMessage],
}

#[derive(Deserialize)]
struct RetrievalResponse {
    results: Vec<RetrievalHit>,
}

/// The preview endpoint answers either with one preview or with previews
/// keyed by document id
#[derive(Deserialize)]
#[serde(untagged)]
enum PreviewPayload {
    Single(PreviewResponse),
    Keyed(HashMap<String, PreviewResponse>),
}

impl ApiClient {
    /// Create a new client around an explicit auth context
    pub fn new(config: ClientConfig, auth: Arc<AuthContext>) -> Result<Self> {
        config.validate()?;

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Network(e.to_string()))?;

        Ok(Self {
            config,
            auth,
            client,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn auth(&self) -> &Arc<AuthContext> {
        &self.auth
    }

    /// Exchange credentials for a bearer token and store it in the context
    pub async fn login(&self, username: &str, password: &str) -> Result<String> {
        let request = self
            .request(Method::POST, "auth/token")
            .timeout(self.config.timeout)
            .form(&LoginForm { username, password });

        let response = self.dispatch(request, false).await?;
        let token: TokenResponse = parse_json(response).await?;
        self.auth.set_token(token.access_token.clone());
        tracing::info!(username, "logged in");
        Ok(token.access_token)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = self.config.endpoint(path);
        tracing::debug!(%method, %url, "sending request");

        let builder = self.client.request(method, url);
        match self.auth.token() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        self.dispatch(request, true).await
    }

    /// Send a request and normalize failures.
    ///
    /// A 401 clears the token and runs the re-login hook unless this is the
    /// login call itself.
    async fn dispatch(&self, request: RequestBuilder, notify_unauthorized: bool) -> Result<Response> {
        let response = request.send().await.map_err(|e| {
            tracing::warn!(error = %e, "request did not complete");
            Error::Network(NETWORK_ERROR_MESSAGE.to_string())
        })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            tracing::warn!("backend rejected the bearer token");
            if notify_unauthorized {
                self.auth.handle_unauthorized();
            }
            return Err(Error::Unauthorized);
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = error_message(&body);
            tracing::warn!(status = status.as_u16(), %message, "request failed");
            return Err(Error::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let request = self
            .request(Method::GET, path)
            .timeout(self.config.timeout);
        parse_json(self.send(request).await?).await
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let request = self
            .request(Method::POST, path)
            .timeout(self.config.timeout)
            .json(body);
        parse_json(self.send(request).await?).await
    }
}

async fn parse_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    response
        .json()
        .await
        .map_err(|e| Error::Serialization(e.to_string()))
}

/// Pull a human-readable message out of an error body
fn error_message(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return DEFAULT_ERROR_MESSAGE.to_string();
    };

    ["message", "detail"]
        .iter()
        .filter_map(|key| value.get(*key))
        .find(|v| !v.is_null())
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| DEFAULT_ERROR_MESSAGE.to_string())
}

fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "txt" => "text/plain",
        "md" => "text/markdown",
        _ => "application/octet-stream",
    }
}

fn apply_part(
    part: StreamPart,
    full: &mut String,
    on_chunk: &(dyn Fn(StreamChunk) + Send + Sync),
) -> Result<()> {
    match part {
        StreamPart::Text(text) => {
            push_text(text, full, on_chunk);
            Ok(())
        }
        StreamPart::Error(message) => Err(Error::Api {
            status: 500,
            message,
        }),
        StreamPart::Finish => Ok(()),
    }
}

fn push_text(text: String, full: &mut String, on_chunk: &(dyn Fn(StreamChunk) + Send + Sync)) {
    if text.is_empty() {
        return;
    }
    full.push_str(&text);
    on_chunk(StreamChunk {
        delta: text,
        done: false,
    });
}

#[async_trait]
impl KnowledgeBaseApi for ApiClient {
    async fn get_knowledge_base(&self, kb_id: &str) -> Result<KnowledgeBase> {
        self.get_json(&format!("knowledge-base/{}", kb_id)).await
    }

    async fn list_documents(&self, kb_id: i64) -> Result<Vec<DocumentRecord>> {
        let kb: KnowledgeBase = self.get_json(&format!("knowledge-base/{}", kb_id)).await?;
        Ok(kb.documents)
    }

    async fn get_document(&self, kb_id: &str, document_id: &str) -> Result<DocumentRecord> {
        self.get_json(&format!("knowledge-base/{}/documents/{}", kb_id, document_id))
            .await
    }

    async fn upload_documents(&self, kb_id: i64, files: &[PathBuf]) -> Result<Vec<UploadResult>> {
        if files.is_empty() {
            return Ok(Vec::new());
        }

        let mut form = Form::new();
        for path in files {
            let bytes = tokio::fs::read(path).await?;
            let part = Part::bytes(bytes)
                .file_name(file_name_of(path))
                .mime_str(content_type_for(path))
                .map_err(|e| Error::InvalidInput(e.to_string()))?;
            form = form.part("files", part);
        }

        tracing::info!(kb_id, files = files.len(), "uploading documents");
        let request = self
            .request(Method::POST, &format!("knowledge-base/{}/documents/upload", kb_id))
            .timeout(self.config.timeout)
            .multipart(form);
        parse_json(self.send(request).await?).await
    }

    async fn process_documents(&self, kb_id: i64, items: &[ProcessItem]) -> Result<TaskList> {
        tracing::info!(kb_id, files = items.len(), "starting document processing");
        self.post_json(&format!("knowledge-base/{}/documents/process", kb_id), items)
            .await
    }

    async fn task_status(&self, kb_id: i64, task_ids: &[i64]) -> Result<HashMap<i64, TaskStatus>> {
        let ids: Vec<String> = task_ids.iter().map(|id| id.to_string()).collect();
        let raw: HashMap<String, TaskStatus> = self
            .get_json(&format!(
                "knowledge-base/{}/documents/tasks?task_ids={}",
                kb_id,
                ids.join(",")
            ))
            .await?;

        Ok(raw
            .into_iter()
            .filter_map(|(key, status)| match key.parse::<i64>() {
                Ok(task_id) => Some((task_id, status)),
                Err(_) => {
                    tracing::warn!(%key, "ignoring task status with a non-numeric id");
                    None
                }
            })
            .collect())
    }

    async fn preview_document(&self, kb_id: i64, request: &PreviewRequest) -> Result<PreviewResponse> {
        let payload: PreviewPayload = self
            .post_json(&format!("knowledge-base/{}/documents/preview", kb_id), request)
            .await?;

        match payload {
            PreviewPayload::Single(preview) => Ok(preview),
            PreviewPayload::Keyed(mut previews) => {
                let wanted = request.document_ids.first().map(|id| id.to_string());
                let found = match wanted {
                    Some(id) => previews.remove(&id),
                    None => None,
                };
                found
                    .or_else(|| previews.into_values().next())
                    .ok_or_else(|| Error::Other("preview response was empty".to_string()))
            }
        }
    }

    async fn test_retrieval(&self, query: &RetrievalQuery) -> Result<Vec<RetrievalHit>> {
        let response: RetrievalResponse = self.post_json("knowledge-base/test-retrieval", query).await?;
        Ok(response.results)
    }
}

#[async_trait]
impl ChatApi for ApiClient {
    async fn list_chats(&self) -> Result<Vec<Chat>> {
        self.get_json("chat").await
    }

    async fn create_chat(&self, chat: &NewChat) -> Result<Chat> {
        tracing::info!(title = %chat.title, kbs = ?chat.knowledge_base_ids, "creating chat");
        self.post_json("chat", chat).await
    }

    async fn get_chat(&self, chat_id: i64) -> Result<Chat> {
        self.get_json(&format!("chat/{}", chat_id)).await
    }

    async fn stream_message(
        &self,
        chat_id: i64,
        messages: &[OutgoingMessage],
        on_chunk: &(dyn Fn(StreamChunk) + Send + Sync),
    ) -> Result<String> {
        let request = self
            .request(Method::POST, &format!("chat/{}/messages", chat_id))
            .json(&ChatRequestBody { messages });
        let response = self.send(request).await?;

        let framed = response.headers().contains_key(DATA_STREAM_HEADER);
        let mut body = response.bytes_stream();
        let mut full = String::new();

        if framed {
            let mut parser = DataStreamParser::new();
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|e| Error::Network(e.to_string()))?;
                for part in parser.push(&chunk) {
                    apply_part(part, &mut full, on_chunk)?;
                }
            }
            for part in parser.finish() {
                apply_part(part, &mut full, on_chunk)?;
            }
            if parser.is_unframed() {
                tracing::debug!(chat_id, "announced data stream carried plain text");
            }
        } else {
            let mut decoder = RawTextDecoder::new();
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|e| Error::Network(e.to_string()))?;
                push_text(decoder.push(&chunk), &mut full, on_chunk);
            }
            push_text(decoder.finish(), &mut full, on_chunk);
        }

        on_chunk(StreamChunk {
            delta: String::new(),
            done: true,
        });
        tracing::debug!(chat_id, bytes = full.len(), "assistant reply complete");
        Ok(full)
    }
}
