//! Deterministic conversation identity and an append-only message log.
//!
//! Grounded in the original's `conversation_tracker.py` for the UUIDv5
//! scheme and the first-100-chars near-match heuristic, and in the
//! teacher's `dashmap`-backed concurrent map (`traffic.rs`'s ring buffer
//! plays the same "shared mutable state behind a lock-free map" role) for
//! the Rust shape. Relational schema and SQL dialect are out of scope (spec
//! §1); this is the key-value contract the spec actually names.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::council::{Ranking, Synthesis};
use crate::model_client::{ModelReply, Turn};

/// Namespace UUID for deterministic conversation identity (spec §6). Fixed —
/// must never change, or existing client continuity breaks.
const CONTINUE_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6b, 0xa7, 0xb8, 0x10, 0x9d, 0xad, 0x11, 0xd1, 0x80, 0xb4, 0x00, 0xc0, 0x4f, 0xd4, 0x30, 0xc8,
]);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageArtifacts {
    pub stage1: Vec<ModelReply>,
    pub stage2: Vec<Ranking>,
    pub stage3: Synthesis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_artifacts: Option<StageArtifacts>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub source: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationMetadata {
    pub id: String,
    pub title: String,
    pub message_count: usize,
    pub created_at: i64,
    pub updated_at: i64,
}

/// UUIDv5 over the first user message content; falls back to hashing the
/// full serialized message array when no user message is present (I5).
pub fn id_for(messages: &[Turn]) -> String {
    let name = match messages.iter().find(|m| m.role == "user") {
        Some(first_user) => format!("continue:{}", first_user.content),
        None => {
            let serialized = serde_json::to_string(messages).unwrap_or_default();
            format!("continue:{serialized}")
        }
    };
    Uuid::new_v5(&CONTINUE_NAMESPACE, name.as_bytes()).to_string()
}

fn default_title(first_user_text: &str) -> String {
    if first_user_text.chars().count() > 50 {
        let truncated: String = first_user_text.chars().take(47).collect();
        format!("{truncated}...")
    } else {
        first_user_text.to_string()
    }
}

/// Append-only, in-memory conversation log keyed by deterministic id.
///
/// `schema_ready` models the spec's "schema-evolution tolerance" cache: once
/// the store has observed that optional fields are supported, the flag is
/// never unset within the process lifetime. This implementation's schema is
/// fixed (no external table), so the flag is trivially `true`, but the cache
/// itself is kept to preserve the monotonic-check API a real backing store
/// would need.
pub struct ConversationStore {
    conversations: DashMap<String, Conversation>,
    schema_ready: AtomicBool,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self {
            conversations: DashMap::new(),
            schema_ready: AtomicBool::new(true),
        }
    }

    /// Cacheable, monotonic: once true, stays true.
    pub fn schema_ready(&self) -> bool {
        self.schema_ready.load(Ordering::Relaxed)
    }

    pub fn create(&self, id: &str, first_user_text: &str, title: Option<String>) -> Conversation {
        let now = Utc::now().timestamp_millis();
        let conversation = Conversation {
            id: id.to_string(),
            title: title.unwrap_or_else(|| default_title(first_user_text)),
            source: "continue".to_string(),
            created_at: now,
            updated_at: now,
            messages: vec![Message {
                role: "user".to_string(),
                content: first_user_text.to_string(),
                timestamp: Utc::now().to_rfc3339(),
                stage_artifacts: None,
            }],
        };
        self.conversations.insert(id.to_string(), conversation.clone());
        conversation
    }

    pub fn get(&self, id: &str) -> Option<Conversation> {
        self.conversations.get(id).map(|c| c.clone())
    }

    /// Appends a message; updates `updated_at`. Returns false if the
    /// conversation does not exist (spec §4.E).
    pub fn append(
        &self,
        id: &str,
        role: &str,
        content: &str,
        stage_artifacts: Option<StageArtifacts>,
    ) -> bool {
        match self.conversations.get_mut(id) {
            Some(mut conversation) => {
                conversation.messages.push(Message {
                    role: role.to_string(),
                    content: content.to_string(),
                    timestamp: Utc::now().to_rfc3339(),
                    // Only assistant messages carry stage artifacts (spec §4.E).
                    stage_artifacts: if role == "assistant" { stage_artifacts } else { None },
                });
                conversation.updated_at = Utc::now().timestamp_millis();
                true
            }
            None => false,
        }
    }

    pub fn update_title(&self, id: &str, title: &str) -> bool {
        match self.conversations.get_mut(id) {
            Some(mut conversation) => {
                conversation.title = title.to_string();
                true
            }
            None => false,
        }
    }

    pub fn list(&self, limit: usize, offset: usize) -> Vec<ConversationMetadata> {
        let mut all: Vec<ConversationMetadata> = self
            .conversations
            .iter()
            .map(|e| ConversationMetadata {
                id: e.id.clone(),
                title: e.title.clone(),
                message_count: e.messages.len(),
                created_at: e.created_at,
                updated_at: e.updated_at,
            })
            .collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all.into_iter().skip(offset).take(limit).collect()
    }

    pub fn delete(&self, id: &str) -> bool {
        self.conversations.remove(id).is_some()
    }

    /// Recompute the deterministic id for `messages`; if that conversation
    /// exists, return it. Otherwise fall back to a first-100-chars near
    /// match against the most recent conversations.
    pub fn find_by_first_message(&self, messages: &[Turn]) -> Option<String> {
        let expected_id = id_for(messages);
        if self.conversations.contains_key(&expected_id) {
            return Some(expected_id);
        }

        let first_user_msg = messages.iter().find(|m| m.role == "user")?;
        let prefix: String = first_user_msg.content.chars().take(100).collect();

        let mut candidates: Vec<Conversation> = self.conversations.iter().map(|e| e.clone()).collect();
        candidates.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        for conversation in candidates {
            if let Some(first) = conversation.messages.iter().find(|m| m.role == "user") {
                let candidate_prefix: String = first.content.chars().take(100).collect();
                if candidate_prefix == prefix {
                    return Some(conversation.id);
                }
            }
        }
        None
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(role: &str, content: &str) -> Turn {
        Turn {
            role: role.to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn same_first_user_message_yields_same_id() {
        let a = id_for(&[turn("user", "What does 2+2 equal?")]);
        let b = id_for(&[
            turn("system", "be helpful"),
            turn("user", "What does 2+2 equal?"),
        ]);
        assert_eq!(a, b);
    }

    #[test]
    fn different_first_user_message_yields_different_id() {
        let a = id_for(&[turn("user", "one")]);
        let b = id_for(&[turn("user", "two")]);
        assert_ne!(a, b);
    }

    #[test]
    fn title_truncates_to_fifty_chars_total() {
        let long = "x".repeat(80);
        let title = default_title(&long);
        assert_eq!(title.chars().count(), 50);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn append_then_get_returns_conversation_with_new_last_message() {
        let store = ConversationStore::new();
        let id = id_for(&[turn("user", "hello")]);
        store.create(&id, "hello", None);
        store.append(&id, "assistant", "hi there", None);

        let conversation = store.get(&id).unwrap();
        assert_eq!(conversation.messages.last().unwrap().content, "hi there");
    }

    #[test]
    fn delete_then_lookup_is_idempotent() {
        let store = ConversationStore::new();
        let id = id_for(&[turn("user", "hello")]);
        store.create(&id, "hello", None);

        assert!(store.delete(&id));
        assert!(store.get(&id).is_none());
        assert!(!store.delete(&id));
    }

    #[test]
    fn append_to_missing_conversation_returns_false() {
        let store = ConversationStore::new();
        assert!(!store.append("does-not-exist", "user", "hi", None));
    }

    #[test]
    fn find_by_first_message_matches_on_prefix_when_id_differs() {
        let store = ConversationStore::new();
        let real_id = "some-other-stored-id".to_string();
        let conversation = Conversation {
            id: real_id.clone(),
            title: "t".into(),
            source: "continue".into(),
            created_at: 1,
            updated_at: 1,
            messages: vec![Message {
                role: "user".into(),
                content: "hello world".into(),
                timestamp: "now".into(),
                stage_artifacts: None,
            }],
        };
        store.conversations.insert(real_id.clone(), conversation);

        let found = store.find_by_first_message(&[turn("user", "hello world")]);
        assert_eq!(found, Some(real_id));
    }
}
