//! HTTP client for the Ragdesk backend
//!
//! This crate provides the `reqwest` implementation of the knowledge-base and
//! chat traits, the explicit auth context, and the chat stream decoders.

mod auth;
mod client;
mod config;
pub mod stream;


pub use auth::AuthContext;
pub use client::ApiClient;
pub use config::{ClientConfig, DEFAULT_API_URL, DEFAULT_POLL_INTERVAL, DEFAULT_TIMEOUT};

// Re-export core types for convenience
pub use ragdesk_core::{ChatApi, Error, KnowledgeBaseApi, Result};
