use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use ragdesk_client::{ApiClient, AuthContext, ChatApi, ClientConfig, Error, KnowledgeBaseApi};
use ragdesk_core::{NewChat, OutgoingMessage, PreviewRequest, RetrievalQuery, StreamChunk};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

#[derive(Clone, Default)]
struct MockState {
    authorization: Arc<Mutex<Vec<Option<String>>>>,
    task_queries: Arc<Mutex<Vec<String>>>,
    upload_bodies: Arc<Mutex<Vec<(String, String)>>>,
    chat_bodies: Arc<Mutex<Vec<Value>>>,
    created_chats: Arc<Mutex<Vec<Value>>>,
}

impl MockState {
    fn record_auth(&self, headers: &HeaderMap) {
        let value = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        self.authorization.lock().expect("auth lock").push(value);
    }
}

async fn knowledge_base(
    State(state): State<MockState>,
    headers: HeaderMap,
    Path(kb_id): Path<String>,
) -> Response {
    state.record_auth(&headers);
    match kb_id.as_str() {
        "1" => Json(json!({
            "id": 1,
            "name": "Handbook",
            "description": null,
            "documents": [
                {"id": 8, "file_name": "policy.pdf", "file_size": 2048, "content_type": "application/pdf",
                 "created_at": "2024-05-01T10:00:00", "processing_tasks": [{"id": 3, "status": "completed", "error_message": null}]},
                {"id": 9, "file_name": "notes.md", "knowledge_base_id": 1}
            ]
        }))
        .into_response(),
        "401" => (StatusCode::UNAUTHORIZED, Json(json!({"detail": "expired"}))).into_response(),
        _ => (StatusCode::NOT_FOUND, Json(json!({"detail": "Knowledge base not found"}))).into_response(),
    }
}

async fn document(Path((kb_id, doc_id)): Path<(i64, i64)>) -> Json<Value> {
    Json(json!({"id": doc_id, "file_name": "guide.pdf", "knowledge_base_id": kb_id}))
}

async fn tasks(
    State(state): State<MockState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let ids = params.get("task_ids").cloned().unwrap_or_default();
    state.task_queries.lock().expect("task lock").push(ids);
    Json(json!({
        "11": {"document_id": 7, "status": "completed", "error_message": null, "upload_id": 1, "file_name": "a.pdf"},
        "12": {"document_id": null, "status": "processing"},
        "bogus": {"status": "failed"}
    }))
}

async fn upload(State(state): State<MockState>, headers: HeaderMap, body: Bytes) -> Json<Value> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    let body = String::from_utf8_lossy(&body).into_owned();
    state
        .upload_bodies
        .lock()
        .expect("upload lock")
        .push((content_type, body));
    Json(json!([
        {"upload_id": 1, "file_name": "notes.md", "status": "pending", "temp_path": "/tmp/u1"},
        {"document_id": 4, "file_name": "old.txt", "status": "exists", "message": "duplicate"}
    ]))
}

async fn preview() -> Json<Value> {
    Json(json!({
        "8": {"chunks": [{"content": "first", "metadata": {"page": 1}}], "total_chunks": 1}
    }))
}

async fn retrieval(Json(query): Json<Value>) -> Json<Value> {
    Json(json!({
        "results": [{
            "content": format!("about {}", query["query"].as_str().unwrap_or_default()),
            "metadata": {"source": "guide.pdf"},
            "score": 0.87
        }]
    }))
}

async fn framed_chat(State(state): State<MockState>, Json(body): Json<Value>) -> Response {
    state.chat_bodies.lock().expect("chat lock").push(body);
    let payload = "0:\"Hello\"\n0:\" wörld\"\nd:{\"finishReason\":\"stop\"}\n";
    ([("x-vercel-ai-data-stream", "v1")], Body::from(payload)).into_response()
}

async fn raw_chat() -> &'static str {
    "plain answer"
}

async fn announced_raw_chat() -> Response {
    let payload = "Refunds take 5 days.\n\nNote: see policy.";
    ([("x-vercel-ai-data-stream", "v1")], Body::from(payload)).into_response()
}

async fn list_chats(State(state): State<MockState>, headers: HeaderMap) -> Json<Value> {
    state.record_auth(&headers);
    Json(json!([
        {"id": 4, "title": "Onboarding", "user_id": 1, "knowledge_base_ids": [1],
         "created_at": "2024-05-01T10:00:00", "updated_at": "2024-05-02T08:30:00"},
        {"id": 5, "title": "Refunds", "user_id": 1, "messages": [
            {"id": 1, "content": "hi", "role": "user", "chat_id": 5}
        ]}
    ]))
}

async fn create_chat(State(state): State<MockState>, Json(body): Json<Value>) -> Response {
    state.created_chats.lock().expect("create lock").push(body.clone());
    if body["knowledge_base_ids"].as_array().is_some_and(|ids| ids.contains(&json!(99))) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"detail": "One or more knowledge bases not found"})),
        )
            .into_response();
    }
    Json(json!({
        "id": 6,
        "title": body["title"],
        "user_id": 1,
        "messages": [],
        "knowledge_base_ids": body["knowledge_base_ids"]
    }))
    .into_response()
}

async fn failing_chat() -> Response {
    let payload = "0:\"par\"\n3:\"model overloaded\"\n";
    ([("x-vercel-ai-data-stream", "v1")], Body::from(payload)).into_response()
}

async fn token(body: String) -> Response {
    if body.contains("password=secret") {
        Json(json!({"access_token": "fresh-token", "token_type": "bearer"})).into_response()
    } else {
        (StatusCode::UNAUTHORIZED, Json(json!({"detail": "Incorrect username or password"})))
            .into_response()
    }
}

async fn spawn_mock_server() -> (String, MockState, oneshot::Sender<()>) {
    let state = MockState::default();
    let app = Router::new()
        .route("/api/auth/token", post(token))
        .route("/api/knowledge-base/test-retrieval", post(retrieval))
        .route("/api/knowledge-base/{kb_id}", get(knowledge_base))
        .route("/api/knowledge-base/{kb_id}/documents/{doc_id}", get(document))
        .route("/api/knowledge-base/{kb_id}/documents/tasks", get(tasks))
        .route("/api/knowledge-base/{kb_id}/documents/upload", post(upload))
        .route("/api/knowledge-base/{kb_id}/documents/preview", post(preview))
        .route("/api/chat/1/messages", post(framed_chat))
        .route("/api/chat/2/messages", post(raw_chat))
        .route("/api/chat/3/messages", post(failing_chat))
        .route("/api/chat/4/messages", post(announced_raw_chat))
        .route("/api/chat", get(list_chats).post(create_chat))
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let address: SocketAddr = listener.local_addr().expect("mock listener local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        server.await.expect("run mock server");
    });
    (format!("http://{address}/api"), state, shutdown_tx)
}

fn client_for(base_url: &str, auth: Arc<AuthContext>) -> ApiClient {
    ApiClient::new(ClientConfig::new(base_url), auth).expect("build client")
}

#[tokio::test]
async fn test_bearer_token_is_attached() {
    let (base_url, state, shutdown) = spawn_mock_server().await;
    let auth = Arc::new(AuthContext::with_token(Some("abc".to_string())));
    let client = client_for(&base_url, auth);

    let kb = client.get_knowledge_base("1").await.expect("knowledge base");
    assert_eq!(kb.name, "Handbook");

    let doc = client.get_document("1", "42").await.expect("document");
    assert_eq!(doc.file_name, "guide.pdf");
    assert_eq!(doc.knowledge_base_id, Some(1));

    let seen = state.authorization.lock().expect("auth lock").clone();
    assert_eq!(seen, vec![Some("Bearer abc".to_string())]);
    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_unauthorized_clears_token_and_notifies() {
    let (base_url, _state, shutdown) = spawn_mock_server().await;
    let notified = Arc::new(AtomicUsize::new(0));
    let counter = notified.clone();
    let auth = Arc::new(
        AuthContext::with_token(Some("stale".to_string())).with_unauthorized_handler(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );
    let client = client_for(&base_url, auth.clone());

    let err = client.get_knowledge_base("401").await.unwrap_err();
    assert!(err.is_unauthorized());
    assert_eq!(err.to_string(), "Unauthorized - Please log in again");
    assert!(!auth.is_authenticated());
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_error_detail_becomes_message() {
    let (base_url, _state, shutdown) = spawn_mock_server().await;
    let client = client_for(&base_url, Arc::new(AuthContext::new()));

    match client.get_knowledge_base("99").await {
        Err(Error::Api { status, message }) => {
            assert_eq!(status, 404);
            assert_eq!(message, "Knowledge base not found");
        }
        other => panic!("expected api error, got {:?}", other.map(|kb| kb.id)),
    }
    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_unreachable_server_is_a_network_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("addr");
    drop(listener);

    let client = client_for(&format!("http://{address}/api"), Arc::new(AuthContext::new()));
    match client.get_knowledge_base("1").await {
        Err(Error::Network(message)) => {
            assert_eq!(message, "Network error or server is unreachable")
        }
        other => panic!("expected network error, got {:?}", other.map(|kb| kb.id)),
    }
}

#[tokio::test]
async fn test_login_stores_token_without_notifying() {
    let (base_url, _state, shutdown) = spawn_mock_server().await;
    let notified = Arc::new(AtomicUsize::new(0));
    let counter = notified.clone();
    let auth = Arc::new(AuthContext::new().with_unauthorized_handler(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    let client = client_for(&base_url, auth.clone());

    assert!(client.login("ada", "wrong").await.unwrap_err().is_unauthorized());
    assert_eq!(notified.load(Ordering::SeqCst), 0);

    let token = client.login("ada", "secret").await.expect("login");
    assert_eq!(token, "fresh-token");
    assert_eq!(auth.token().as_deref(), Some("fresh-token"));
    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_task_status_query_and_keys() {
    let (base_url, state, shutdown) = spawn_mock_server().await;
    let client = client_for(&base_url, Arc::new(AuthContext::new()));

    let statuses = client.task_status(5, &[11, 12]).await.expect("task status");
    assert_eq!(statuses.len(), 2);
    assert!(statuses[&11].status.is_terminal());
    assert_eq!(statuses[&11].document_id, Some(7));
    assert!(!statuses[&12].status.is_terminal());

    let queries = state.task_queries.lock().expect("task lock").clone();
    assert_eq!(queries, vec!["11,12".to_string()]);
    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_upload_sends_multipart_files_field() {
    let (base_url, state, shutdown) = spawn_mock_server().await;
    let client = client_for(&base_url, Arc::new(AuthContext::new()));

    let dir = tempfile::tempdir().expect("tempdir");
    let notes = dir.path().join("notes.md");
    let old = dir.path().join("old.txt");
    std::fs::write(&notes, "# Notes").expect("write notes");
    std::fs::write(&old, "old content").expect("write old");

    let results = client
        .upload_documents(5, &[notes, old])
        .await
        .expect("upload");
    assert_eq!(results.len(), 2);
    assert!(!results[0].already_ingested());
    assert_eq!(results[0].temp_path.as_deref(), Some("/tmp/u1"));
    assert!(results[1].already_ingested());

    let bodies = state.upload_bodies.lock().expect("upload lock").clone();
    let (content_type, body) = &bodies[0];
    assert!(content_type.starts_with("multipart/form-data"));
    assert!(body.contains(r#"name="files"; filename="notes.md""#));
    assert!(body.contains(r#"name="files"; filename="old.txt""#));
    assert!(body.contains("Content-Type: text/markdown"));
    assert!(body.contains("old content"));
    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_preview_and_retrieval() {
    let (base_url, _state, shutdown) = spawn_mock_server().await;
    let client = client_for(&base_url, Arc::new(AuthContext::new()));

    let preview = client
        .preview_document(5, &PreviewRequest::for_document(8))
        .await
        .expect("preview");
    assert_eq!(preview.total_chunks, 1);
    assert_eq!(preview.chunks[0].content, "first");

    let hits = client
        .test_retrieval(&RetrievalQuery {
            query: "refunds".to_string(),
            kb_id: 5,
            top_k: 3,
        })
        .await
        .expect("retrieval");
    assert_eq!(hits[0].content, "about refunds");
    assert_eq!(hits[0].source(), Some("guide.pdf"));
    let _ = shutdown.send(());
}

fn collector() -> (Arc<Mutex<Vec<StreamChunk>>>, impl Fn(StreamChunk) + Send + Sync) {
    let chunks = Arc::new(Mutex::new(Vec::new()));
    let sink = chunks.clone();
    (chunks, move |chunk| sink.lock().expect("chunk lock").push(chunk))
}

#[tokio::test]
async fn test_framed_stream_is_parsed() {
    let (base_url, state, shutdown) = spawn_mock_server().await;
    let client = client_for(&base_url, Arc::new(AuthContext::new()));
    let (chunks, on_chunk) = collector();

    let history = vec![OutgoingMessage {
        role: "user".to_string(),
        content: "hi".to_string(),
    }];
    let full = client
        .stream_message(1, &history, &on_chunk)
        .await
        .expect("stream");
    assert_eq!(full, "Hello wörld");

    let chunks = chunks.lock().expect("chunk lock").clone();
    let deltas: Vec<&str> = chunks.iter().map(|c| c.delta.as_str()).collect();
    assert_eq!(deltas, vec!["Hello", " wörld", ""]);
    assert!(chunks.last().is_some_and(|c| c.done));

    let bodies = state.chat_bodies.lock().expect("chat lock").clone();
    assert_eq!(bodies[0], json!({"messages": [{"role": "user", "content": "hi"}]}));
    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_unframed_stream_is_passed_through() {
    let (base_url, _state, shutdown) = spawn_mock_server().await;
    let client = client_for(&base_url, Arc::new(AuthContext::new()));
    let (chunks, on_chunk) = collector();

    let full = client.stream_message(2, &[], &on_chunk).await.expect("stream");
    assert_eq!(full, "plain answer");
    assert!(chunks.lock().expect("chunk lock").last().is_some_and(|c| c.done));
    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_stream_error_part_fails_the_send() {
    let (base_url, _state, shutdown) = spawn_mock_server().await;
    let client = client_for(&base_url, Arc::new(AuthContext::new()));
    let (_chunks, on_chunk) = collector();

    match client.stream_message(3, &[], &on_chunk).await {
        Err(Error::Api { message, .. }) => assert_eq!(message, "model overloaded"),
        other => panic!("expected stream error, got {:?}", other),
    }
    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_announced_stream_with_plain_body_keeps_text() {
    let (base_url, _state, shutdown) = spawn_mock_server().await;
    let client = client_for(&base_url, Arc::new(AuthContext::new()));
    let (chunks, on_chunk) = collector();

    let full = client.stream_message(4, &[], &on_chunk).await.expect("stream");
    assert_eq!(full, "Refunds take 5 days.\n\nNote: see policy.");

    let chunks = chunks.lock().expect("chunk lock").clone();
    let streamed: String = chunks.iter().map(|c| c.delta.as_str()).collect();
    assert_eq!(streamed, full);
    assert!(chunks.last().is_some_and(|c| c.done));
    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_list_and_create_chats() {
    let (base_url, state, shutdown) = spawn_mock_server().await;
    let auth = Arc::new(AuthContext::with_token(Some("abc".to_string())));
    let client = client_for(&base_url, auth);

    let chats = client.list_chats().await.expect("list chats");
    assert_eq!(chats.len(), 2);
    assert_eq!(chats[0].title, "Onboarding");
    assert_eq!(chats[0].knowledge_base_ids, vec![1]);
    assert!(chats[0].updated_at.is_some());
    assert_eq!(chats[1].messages.len(), 1);
    assert_eq!(
        state.authorization.lock().expect("auth lock").clone(),
        vec![Some("Bearer abc".to_string())]
    );

    let created = client
        .create_chat(&NewChat {
            title: "Pricing".to_string(),
            knowledge_base_ids: vec![1, 2],
        })
        .await
        .expect("create chat");
    assert_eq!(created.id, 6);
    assert_eq!(created.knowledge_base_ids, vec![1, 2]);

    match client
        .create_chat(&NewChat {
            title: "Ghost".to_string(),
            knowledge_base_ids: vec![99],
        })
        .await
    {
        Err(Error::Api { status, message }) => {
            assert_eq!(status, 400);
            assert_eq!(message, "One or more knowledge bases not found");
        }
        other => panic!("expected api error, got {:?}", other.map(|chat| chat.id)),
    }

    let bodies = state.created_chats.lock().expect("create lock").clone();
    assert_eq!(bodies[0], json!({"title": "Pricing", "knowledge_base_ids": [1, 2]}));
    let _ = shutdown.send(());
}

#[tokio::test]
async fn test_list_documents_of_knowledge_base() {
    let (base_url, _state, shutdown) = spawn_mock_server().await;
    let client = client_for(&base_url, Arc::new(AuthContext::new()));

    let documents = client.list_documents(1).await.expect("documents");
    assert_eq!(documents.len(), 2);
    assert_eq!(documents[0].file_name, "policy.pdf");
    assert_eq!(documents[0].file_size, Some(2048));
    assert_eq!(documents[0].latest_task().map(|t| t.status.as_str()), Some("completed"));
    assert_eq!(documents[1].content_type, None);

    assert!(matches!(
        client.list_documents(99).await,
        Err(Error::Api { status: 404, .. })
    ));
    let _ = shutdown.send(());
}
