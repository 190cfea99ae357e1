use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::{
    error::{SyncError, SyncErrorCategory},
    types::{MessageAdded, MessageEntry, MessageRole},
};

const LOCAL_ID_PREFIX: &str = "local-";

/// Reasons a local send is refused before anything is queued.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TranscriptError {
    #[error("message content is empty")]
    EmptyContent,
    #[error("an identical message is still waiting for confirmation")]
    DuplicatePending,
    #[error("conversation is closed")]
    ConversationClosed,
}

impl From<TranscriptError> for SyncError {
    fn from(err: TranscriptError) -> Self {
        let code = match err {
            TranscriptError::EmptyContent => "empty_content",
            TranscriptError::DuplicatePending => "duplicate_pending",
            TranscriptError::ConversationClosed => "conversation_closed",
        };
        SyncError::new(SyncErrorCategory::Config, code, err.to_string())
    }
}

/// How an inbound `message` event was merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    /// A pending local echo was replaced by the confirmed message.
    ConfirmedPending { temp_id: String },
    Appended,
    /// An entry with the same server ID already exists.
    Duplicate,
    /// ID-less echo of a message that is still pending locally.
    EchoIgnored,
}

/// Whether an ID was generated locally for an optimistic entry.
pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

/// Ordered message list of one conversation, including optimistic entries.
#[derive(Debug, Clone)]
pub struct TranscriptBuffer {
    conversation_id: String,
    entries: Vec<MessageEntry>,
    max_items: usize,
}

impl TranscriptBuffer {
    /// Create a buffer with an item cap (`max_items >= 1`).
    pub fn new(conversation_id: impl Into<String>, max_items: usize) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            entries: Vec::new(),
            max_items: max_items.max(1),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Current entries in display order.
    pub fn entries(&self) -> &[MessageEntry] {
        &self.entries
    }

    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|entry| !entry.confirmed).count()
    }

    /// Append an unconfirmed user message and return a copy of it.
    pub fn push_pending(
        &mut self,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<MessageEntry, TranscriptError> {
        if content.trim().is_empty() {
            return Err(TranscriptError::EmptyContent);
        }
        if self.find_pending(MessageRole::User, content).is_some() {
            return Err(TranscriptError::DuplicatePending);
        }

        let entry = MessageEntry {
            id: format!("{LOCAL_ID_PREFIX}{}", Uuid::new_v4()),
            conversation_id: self.conversation_id.clone(),
            role: MessageRole::User,
            content: content.to_owned(),
            timestamp: now,
            confirmed: false,
        };
        self.entries.push(entry.clone());
        self.trim_to_max();
        Ok(entry)
    }

    /// Drop an optimistic entry after its send failed.
    pub fn discard_pending(&mut self, temp_id: &str) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|entry| entry.confirmed || entry.id != temp_id);
        before != self.entries.len()
    }

    /// Merge a pushed `message` event.
    pub fn apply_message(&mut self, added: MessageAdded, now: DateTime<Utc>) -> Reconciled {
        match added.role {
            MessageRole::User => self.apply_user_message(added, now),
            MessageRole::Agent | MessageRole::Admin => {
                if let Some(id) = added.id.as_deref()
                    && self.contains_id(id)
                {
                    return Reconciled::Duplicate;
                }
                let entry = self.confirmed_entry(added, now);
                self.entries.push(entry);
                self.trim_to_max();
                Reconciled::Appended
            }
        }
    }

    /// Replace confirmed history with an authoritative fetch.
    ///
    /// Pending entries already present in `history` (same role and content)
    /// are dropped; the rest stay at the end, still unconfirmed. Returns the
    /// number of pending entries that were kept.
    pub fn replace_history(&mut self, history: Vec<MessageEntry>) -> usize {
        let pending: Vec<MessageEntry> = self
            .entries
            .drain(..)
            .filter(|entry| !entry.confirmed)
            .filter(|entry| {
                !history.iter().any(|confirmed| {
                    confirmed.role == entry.role && confirmed.content == entry.content
                })
            })
            .collect();

        let kept = pending.len();
        self.entries = history
            .into_iter()
            .map(|mut entry| {
                entry.confirmed = true;
                entry
            })
            .collect();
        self.entries.extend(pending);
        self.trim_to_max();
        debug!(
            conversation_id = %self.conversation_id,
            total = self.entries.len(),
            pending_kept = kept,
            "transcript history replaced"
        );
        kept
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn apply_user_message(&mut self, added: MessageAdded, now: DateTime<Utc>) -> Reconciled {
        let pending_index = added
            .client_id
            .as_deref()
            .and_then(|client_id| {
                self.entries
                    .iter()
                    .position(|entry| !entry.confirmed && entry.id == client_id)
            })
            .or_else(|| self.find_pending(MessageRole::User, &added.content));

        let Some(server_id) = added.id.clone() else {
            if pending_index.is_some() {
                return Reconciled::EchoIgnored;
            }
            let entry = self.confirmed_entry(added, now);
            self.entries.push(entry);
            self.trim_to_max();
            return Reconciled::Appended;
        };

        let temp_id = pending_index.map(|index| self.entries.remove(index).id);
        let outcome = if self.contains_id(&server_id) {
            Reconciled::Duplicate
        } else {
            let entry = self.confirmed_entry(added, now);
            self.entries.push(entry);
            self.trim_to_max();
            Reconciled::Appended
        };

        match temp_id {
            Some(temp_id) => {
                trace!(%temp_id, %server_id, "pending message confirmed");
                Reconciled::ConfirmedPending { temp_id }
            }
            None => outcome,
        }
    }

    fn confirmed_entry(&self, added: MessageAdded, now: DateTime<Utc>) -> MessageEntry {
        MessageEntry {
            id: added
                .id
                .unwrap_or_else(|| format!("anon-{}", Uuid::new_v4())),
            conversation_id: added
                .conversation_id
                .unwrap_or_else(|| self.conversation_id.clone()),
            role: added.role,
            content: added.content,
            timestamp: added.timestamp.unwrap_or(now),
            confirmed: true,
        }
    }

    fn find_pending(&self, role: MessageRole, content: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| !entry.confirmed && entry.role == role && entry.content == content)
    }

    fn contains_id(&self, id: &str) -> bool {
        self.entries.iter().any(|entry| entry.id == id)
    }

    fn trim_to_max(&mut self) {
        if self.entries.len() <= self.max_items {
            return;
        }

        let excess = self.entries.len() - self.max_items;
        self.entries.drain(0..excess);
    }
}
