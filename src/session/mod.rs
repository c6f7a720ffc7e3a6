//! Per-conversation agent state, owned by the caller.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// One message of a BYOK conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// What a runtime needs to continue a conversation in the next turn.
#[derive(Debug, Default)]
pub struct ConversationState {
    /// Session id reported by the CLI, passed back with `--resume`
    pub cli_session_id: Option<String>,
    /// Thread id on the app-server
    pub app_thread_id: Option<String>,
    /// Messages sent to and received from a BYOK endpoint
    pub history: Vec<ChatMessage>,
}

pub type SharedConversation = Arc<tokio::sync::Mutex<ConversationState>>;

/// Maps conversation ids to their state.
///
/// A turn holds its conversation's lock for its whole duration, so turns of
/// one conversation run one after another while different conversations
/// run concurrently.
#[derive(Default, Clone)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, SharedConversation>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_or_get(&self, conversation_id: &str) -> SharedConversation {
        let mut sessions = self.sessions.lock().unwrap();
        sessions
            .entry(conversation_id.to_string())
            .or_insert_with(|| {
                tracing::debug!("Creating conversation {conversation_id}");
                Arc::new(tokio::sync::Mutex::new(ConversationState::default()))
            })
            .clone()
    }

    pub fn get(&self, conversation_id: &str) -> Option<SharedConversation> {
        self.sessions.lock().unwrap().get(conversation_id).cloned()
    }

    /// Forgets a conversation. A turn still running keeps its own handle and
    /// finishes normally.
    pub fn evict(&self, conversation_id: &str) -> bool {
        let removed = self.sessions.lock().unwrap().remove(conversation_id).is_some();
        if removed {
            tracing::debug!("Evicted conversation {conversation_id}");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
