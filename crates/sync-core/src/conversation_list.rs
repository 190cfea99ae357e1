use std::{cmp::Ordering, collections::HashMap};

use tracing::{debug, trace};

use crate::types::{ConversationFilter, ConversationStatus, ConversationSummary, DashboardStats};

/// Effect of one merged push update on the visible collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListChange {
    Inserted,
    Updated,
    /// The entry stopped matching the filter and left the visible set.
    Removed,
    /// Not visible before or after the update.
    Ignored,
}

/// Display order: status priority ascending, then most recently updated.
pub fn compare_conversations(a: &ConversationSummary, b: &ConversationSummary) -> Ordering {
    a.status
        .priority()
        .cmp(&b.status.priority())
        .then_with(|| b.updated_at.cmp(&a.updated_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Filtered, sorted conversation collection with a needs-attention counter.
#[derive(Debug, Clone, Default)]
pub struct ConversationList {
    filter: ConversationFilter,
    visible: Vec<ConversationSummary>,
    /// Last status seen per conversation, visible or not.
    known_statuses: HashMap<String, ConversationStatus>,
    needs_attention: u64,
}

impl ConversationList {
    pub fn new(filter: ConversationFilter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    pub fn filter(&self) -> &ConversationFilter {
        &self.filter
    }

    /// Visible conversations in display order.
    pub fn items(&self) -> &[ConversationSummary] {
        &self.visible
    }

    pub fn needs_attention(&self) -> u64 {
        self.needs_attention
    }

    /// Change the filter and drop entries that no longer match.
    ///
    /// Entries hidden by the old filter only reappear after the next
    /// authoritative [`ConversationList::replace_all`].
    pub fn set_filter(&mut self, filter: ConversationFilter) {
        self.filter = filter;
        let filter = &self.filter;
        self.visible.retain(|conversation| filter.matches(conversation));
    }

    /// Merge one pushed conversation update.
    pub fn apply_update(&mut self, conversation: ConversationSummary) -> ListChange {
        let previous = self
            .known_statuses
            .insert(conversation.id.clone(), conversation.status);
        self.adjust_counter(previous, conversation.status);

        let matches = self.filter.matches(&conversation);
        let position = self
            .visible
            .iter()
            .position(|existing| existing.id == conversation.id);

        let change = match (position, matches) {
            (None, true) => {
                self.visible.push(conversation);
                ListChange::Inserted
            }
            (None, false) => ListChange::Ignored,
            (Some(index), true) => {
                self.visible[index] = conversation;
                ListChange::Updated
            }
            (Some(index), false) => {
                self.visible.remove(index);
                ListChange::Removed
            }
        };

        if change != ListChange::Ignored {
            self.sort();
        }
        trace!(
            ?change,
            needs_attention = self.needs_attention,
            "merged conversation update"
        );
        change
    }

    /// Replace the collection with an authoritative server snapshot.
    ///
    /// The counter is recomputed from the whole snapshot, not only the
    /// entries visible under the current filter.
    pub fn replace_all(&mut self, conversations: Vec<ConversationSummary>) {
        self.known_statuses = conversations
            .iter()
            .map(|conversation| (conversation.id.clone(), conversation.status))
            .collect();
        self.needs_attention = conversations
            .iter()
            .filter(|conversation| conversation.status == ConversationStatus::NeedsHuman)
            .count() as u64;

        let filter = &self.filter;
        self.visible = conversations
            .into_iter()
            .filter(|conversation| filter.matches(conversation))
            .collect();
        self.sort();
        debug!(
            visible = self.visible.len(),
            needs_attention = self.needs_attention,
            "conversation list replaced"
        );
    }

    /// Overwrite the counter from server stats; returns whether it changed.
    pub fn apply_stats(&mut self, stats: &DashboardStats) -> bool {
        match stats.needs_human {
            Some(total) if total != self.needs_attention => {
                debug!(
                    from = self.needs_attention,
                    to = total,
                    "needs-attention counter corrected from stats"
                );
                self.needs_attention = total;
                true
            }
            _ => false,
        }
    }

    fn adjust_counter(
        &mut self,
        previous: Option<ConversationStatus>,
        next: ConversationStatus,
    ) {
        let was = previous == Some(ConversationStatus::NeedsHuman);
        let is = next == ConversationStatus::NeedsHuman;
        match (was, is) {
            (true, false) => self.needs_attention = self.needs_attention.saturating_sub(1),
            (false, true) => self.needs_attention += 1,
            _ => {}
        }
    }

    fn sort(&mut self) {
        self.visible.sort_by(compare_conversations);
    }
}
