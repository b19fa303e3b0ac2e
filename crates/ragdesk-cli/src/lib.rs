//! Controllers and terminal output for the Ragdesk CLI

mod chat;
mod citation_info;
mod upload;
pub mod ui;


pub use chat::{ChatSession, ScrollTracker};
pub use citation_info::CitationInfoCache;
pub use upload::{PipelineSnapshot, PollHandle, UploadPipeline};

// Re-export core types
pub use ragdesk_core::{Error, Result};
