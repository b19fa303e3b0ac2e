//! Chat session controller

use std::sync::{Arc, Mutex, PoisonError};

use ragdesk_core::{
    ChatApi, KnowledgeBaseApi, Message, OutgoingMessage, RenderedAnswer, Result, Role,
    StreamChunk, StreamSplitter, render_answer,
};

use crate::citation_info::CitationInfoCache;

/// Decides when the view should follow the newest message.
///
/// Content changes before the initial history load are ignored so opening a
/// conversation does not jump.
#[derive(Debug, Default)]
pub struct ScrollTracker {
    history_loaded: bool,
    pending: bool,
}

impl ScrollTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_history_loaded(&mut self) {
        self.history_loaded = true;
    }

    pub fn is_history_loaded(&self) -> bool {
        self.history_loaded
    }

    /// Record a content change; returns whether a scroll was requested
    pub fn content_changed(&mut self) -> bool {
        if self.history_loaded {
            self.pending = true;
        }
        self.pending
    }

    /// Consume the pending scroll request
    pub fn take_scroll_request(&mut self) -> bool {
        std::mem::take(&mut self.pending)
    }
}

/// One open conversation
pub struct ChatSession<A: ChatApi + KnowledgeBaseApi + ?Sized + 'static> {
    api: Arc<A>,
    chat_id: i64,
    title: String,
    messages: Vec<Message>,
    infos: CitationInfoCache,
    scroll: ScrollTracker,
    local_ids: usize,
}

impl<A: ChatApi + KnowledgeBaseApi + ?Sized + 'static> ChatSession<A> {
    /// Fetch the conversation history and decode it.
    ///
    /// Citation sources are looked up in the background; the history is
    /// ready to render as soon as this returns.
    pub async fn open(api: Arc<A>, chat_id: i64) -> Result<Self> {
        let chat = api.get_chat(chat_id).await?;
        tracing::debug!(chat_id, messages = chat.messages.len(), "loaded chat history");

        let mut session = Self {
            api,
            chat_id,
            title: chat.title,
            messages: Vec::with_capacity(chat.messages.len()),
            infos: CitationInfoCache::new(),
            scroll: ScrollTracker::new(),
            local_ids: 0,
        };

        for stored in &chat.messages {
            let message = stored.to_message().decoded();
            session.infos.resolve_for(&session.api, &message.citations);
            session.messages.push(message);
            session.scroll.content_changed();
        }

        session.scroll.mark_history_loaded();
        Ok(session)
    }

    pub fn chat_id(&self) -> i64 {
        self.chat_id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn citation_infos(&self) -> &CitationInfoCache {
        &self.infos
    }

    pub fn scroll(&mut self) -> &mut ScrollTracker {
        &mut self.scroll
    }

    /// Send a question and stream the answer.
    ///
    /// `on_delta` receives the visible answer text as it arrives; the
    /// citation payload in front of it is held back. The finished reply is
    /// stored raw and decoded once complete.
    pub async fn send(
        &mut self,
        text: &str,
        on_delta: &(dyn Fn(&str) + Send + Sync),
    ) -> Result<&Message> {
        let user = Message::new(self.next_local_id(), Role::User, text);
        self.messages.push(user);
        self.scroll.content_changed();

        let history: Vec<OutgoingMessage> = self.messages.iter().map(OutgoingMessage::from).collect();
        let splitter = Mutex::new(StreamSplitter::new());
        let forward = |chunk: StreamChunk| {
            let mut splitter = splitter.lock().unwrap_or_else(PoisonError::into_inner);
            let visible = if chunk.done {
                splitter.finish()
            } else {
                splitter.push(&chunk.delta)
            };
            if let Some(visible) = visible {
                on_delta(&visible);
            }
        };

        let raw = self
            .api
            .stream_message(self.chat_id, &history, &forward)
            .await?;

        let reply = Message::new(self.next_local_id(), Role::Assistant, raw).decoded();
        self.infos.resolve_for(&self.api, &reply.citations);
        self.messages.push(reply);
        self.scroll.content_changed();

        let index = self.messages.len() - 1;
        Ok(&self.messages[index])
    }

    /// Wait for outstanding citation source lookups
    pub async fn resolve_citations(&mut self) {
        self.infos.settle().await;
    }

    /// Render a message with whatever citation sources have resolved
    pub fn render(&self, message: &Message) -> RenderedAnswer {
        render_answer(&message.content, &message.citations, &self.infos.snapshot())
    }

    fn next_local_id(&mut self) -> String {
        self.local_ids += 1;
        format!("local-{}", self.local_ids)
    }
}
