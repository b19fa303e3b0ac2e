//! Core traits and types for Ragdesk
//!
//! This crate defines the backend contract as async traits, the chat and
//! upload data model, and the pure pieces of the client: the citation payload
//! decoder and the markdown/citation renderer.

pub mod chat;
pub mod citation;
pub mod error;
pub mod knowledge;
pub mod render;
pub mod types;

pub use chat::{Chat, ChatApi, NewChat, OutgoingMessage, StoredMessage, StreamChunk};
pub use citation::{
    ContextEntry, DecodedMessage, SENTINEL, StreamSplitter, decode, encode_context,
    normalize_citation_markers,
};
pub use error::{Error, Result};
pub use knowledge::{
    DocumentRecord, DocumentTask, KnowledgeBase, KnowledgeBaseApi, PreviewChunk, PreviewRequest,
    PreviewResponse, ProcessItem, RetrievalHit, RetrievalQuery, TaskList, TaskState, TaskStatus,
    UploadResult, UploadState,
};
pub use render::{CitationMarker, CitationPopover, RenderedAnswer, render_answer};
pub use types::*;
