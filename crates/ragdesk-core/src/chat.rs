//! Chat backend contract and wire types

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};

use crate::Result;
use crate::types::{Message, Role};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub messages: Vec<StoredMessage>,
    #[serde(default)]
    pub knowledge_base_ids: Vec<i64>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub updated_at: Option<NaiveDateTime>,
}

/// Request body for starting a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewChat {
    pub title: String,
    pub knowledge_base_ids: Vec<i64>,
}

/// A message as persisted by the backend
///
/// Newer backends send `role`; older ones only flag bot turns with `is_bot`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub content: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub is_bot: Option<bool>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<NaiveDateTime>,
}

impl StoredMessage {
    pub fn role(&self) -> Role {
        match (&self.role, self.is_bot) {
            (Some(role), _) => Role::from_wire(role),
            (None, Some(true)) => Role::Assistant,
            _ => Role::User,
        }
    }

    /// Undecoded session message carrying the stored text verbatim
    pub fn to_message(&self) -> Message {
        Message::new(self.id.to_string(), self.role(), self.content.clone())
    }
}

/// Accepts naive timestamps as well as RFC 3339; anything else becomes `None`
pub(crate) fn lenient_timestamp<'de, D>(deserializer: D) -> std::result::Result<Option<NaiveDateTime>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|s| {
        s.parse::<NaiveDateTime>()
            .ok()
            .or_else(|| DateTime::parse_from_rfc3339(&s).ok().map(|dt| dt.naive_utc()))
    }))
}

/// Message sent as conversation history with a new question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub role: String,
    pub content: String,
}

impl From<&Message> for OutgoingMessage {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role.as_str().to_string(),
            content: message.raw_content.clone(),
        }
    }
}

/// Incremental piece of a streamed assistant answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub delta: String,
    pub done: bool,
}

/// Chat operations offered by the backend
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// List the user's conversations
    async fn list_chats(&self) -> Result<Vec<Chat>>;

    /// Start a conversation over the given knowledge bases
    async fn create_chat(&self, chat: &NewChat) -> Result<Chat>;

    /// Fetch a conversation with its full message history
    async fn get_chat(&self, chat_id: i64) -> Result<Chat>;

    /// Send the conversation and stream the assistant reply.
    ///
    /// Every text delta is passed to `on_chunk`, followed by one chunk with
    /// `done` set. Returns the complete raw reply.
    async fn stream_message(
        &self,
        chat_id: i64,
        messages: &[OutgoingMessage],
        on_chunk: &(dyn Fn(StreamChunk) + Send + Sync),
    ) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stored_message_roles() {
        let messages: Vec<StoredMessage> = serde_json::from_value(json!([
            {"id": 1, "content": "q", "role": "user", "created_at": "2024-05-01T10:00:00.123456"},
            {"id": 2, "content": "a", "role": "assistant", "created_at": "2024-05-01T10:00:01Z"},
            {"id": 3, "content": "a", "is_bot": true},
            {"id": 4, "content": "s", "role": "system", "created_at": "yesterday"}
        ]))
        .unwrap();

        let roles: Vec<Role> = messages.iter().map(StoredMessage::role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Assistant, Role::User]);
        assert!(messages[0].created_at.is_some());
        assert!(messages[1].created_at.is_some());
        assert!(messages[3].created_at.is_none());
    }
}
