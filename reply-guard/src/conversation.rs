//! Read-only view of the host conversation and reply slot identity.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// One reply-producing turn: a position inside a specific conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotId {
    pub conversation_id: String,
    pub index: usize,
}

impl SlotId {
    pub fn new(conversation_id: impl Into<String>, index: usize) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            index,
        }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.conversation_id, self.index)
    }
}

/// A single message as seen by the guard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationEntry {
    #[serde(alias = "isUser")]
    pub is_user: bool,
    /// System notes, narrator inserts and other entries that are neither a
    /// user turn nor a reply.
    #[serde(alias = "isSideChannel")]
    pub is_side_channel: bool,
    /// Absent until the host has materialized the message body.
    pub text: Option<String>,
}

impl ConversationEntry {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            is_user: true,
            is_side_channel: false,
            text: Some(text.into()),
        }
    }

    pub fn reply(text: impl Into<String>) -> Self {
        Self {
            is_user: false,
            is_side_channel: false,
            text: Some(text.into()),
        }
    }

    /// A reply entry whose body has not been written yet.
    pub fn pending_reply() -> Self {
        Self::default()
    }

    pub fn side_channel(text: impl Into<String>) -> Self {
        Self {
            is_user: false,
            is_side_channel: true,
            text: Some(text.into()),
        }
    }

    pub fn is_reply(&self) -> bool {
        !self.is_user && !self.is_side_channel
    }

    /// Reply with non-empty text.
    pub fn is_materialized_reply(&self) -> bool {
        self.is_reply() && self.text.as_deref().is_some_and(|text| !text.is_empty())
    }
}

/// Snapshot returned by the host's chat-state accessor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationSnapshot {
    #[serde(alias = "conversationId")]
    pub conversation_id: String,
    pub entries: Vec<ConversationEntry>,
}

impl ConversationSnapshot {
    pub fn new(conversation_id: impl Into<String>, entries: Vec<ConversationEntry>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            entries,
        }
    }

    pub fn slot(&self, index: usize) -> SlotId {
        SlotId::new(self.conversation_id.clone(), index)
    }

    pub fn entry(&self, index: usize) -> Option<&ConversationEntry> {
        self.entries.get(index)
    }

    /// Index and entry of the last entry that is not side-channel.
    pub fn last_turn(&self) -> Option<(usize, &ConversationEntry)> {
        self.entries
            .iter()
            .enumerate()
            .rev()
            .find(|(_, entry)| !entry.is_side_channel)
    }

    /// Slot index a generation starting now is expected to fill: one past a
    /// trailing user turn, or the trailing reply itself when regenerating in
    /// place.
    pub fn expected_reply_index(&self) -> usize {
        match self.last_turn() {
            Some((index, entry)) if entry.is_user => index + 1,
            Some((index, _)) => index,
            None => 0,
        }
    }

    /// True when `index` is the newest non-side-channel entry and a reply.
    pub fn is_latest_reply(&self, index: usize) -> bool {
        matches!(self.last_turn(), Some((last, entry)) if last == index && entry.is_reply())
    }

    /// Text at `slot` if it belongs to this conversation and is a reply.
    pub fn reply_text(&self, slot: &SlotId) -> Option<&str> {
        if slot.conversation_id != self.conversation_id {
            return None;
        }
        self.entry(slot.index)
            .filter(|entry| entry.is_reply())
            .and_then(|entry| entry.text.as_deref())
    }
}
