use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use sync_core::{
    ConversationQuery, ConversationStatus, ConversationSummary, DashboardStats, MessageEntry,
    MessageRole, SyncError, SyncErrorCategory,
};

use crate::api::SupportApi;

#[derive(Debug, Default)]
pub(crate) struct FakeState {
    pub conversations: Vec<ConversationSummary>,
    pub stats: DashboardStats,
    pub history: Vec<MessageEntry>,
    pub queries: Vec<ConversationQuery>,
    pub history_calls: usize,
    pub submitted: Vec<String>,
    pub fail_list: bool,
    pub fail_history: bool,
    pub fail_submit: bool,
}

/// Scripted [`SupportApi`] shared between a test and the synchronizer.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeApi {
    state: Arc<Mutex<FakeState>>,
}

impl FakeApi {
    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake api lock")
    }

    pub fn list_calls(&self) -> usize {
        self.state().queries.len()
    }
}

impl SupportApi for FakeApi {
    async fn list_conversations(
        &self,
        query: &ConversationQuery,
    ) -> Result<Vec<ConversationSummary>, SyncError> {
        let mut state = self.state();
        state.queries.push(query.clone());
        if state.fail_list {
            return Err(SyncError::new(
                SyncErrorCategory::Network,
                "http_request_failed",
                "list unavailable",
            ));
        }
        Ok(state.conversations.clone())
    }

    async fn message_history(
        &self,
        _conversation_id: &str,
    ) -> Result<Vec<MessageEntry>, SyncError> {
        let mut state = self.state();
        state.history_calls += 1;
        if state.fail_history {
            return Err(SyncError::new(
                SyncErrorCategory::Network,
                "http_timeout",
                "history request timed out",
            ));
        }
        Ok(state.history.clone())
    }

    async fn submit_message(
        &self,
        conversation_id: &str,
        content: &str,
    ) -> Result<MessageEntry, SyncError> {
        let mut state = self.state();
        if state.fail_submit {
            return Err(SyncError::new(
                SyncErrorCategory::Network,
                "http_status",
                "submit failed with HTTP 503",
            ));
        }
        state.submitted.push(content.to_owned());
        let entry = message(
            &format!("m{}", state.history.len() + 1),
            conversation_id,
            MessageRole::User,
            content,
        );
        state.history.push(entry.clone());
        Ok(entry)
    }

    async fn fetch_stats(&self) -> Result<DashboardStats, SyncError> {
        Ok(self.state().stats.clone())
    }
}

pub(crate) fn at(minutes: i64) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-01-05T10:00:00Z")
        .expect("timestamp")
        .with_timezone(&Utc)
        + Duration::minutes(minutes)
}

pub(crate) fn summary(id: &str, status: ConversationStatus, minute: i64) -> ConversationSummary {
    ConversationSummary {
        id: id.to_owned(),
        agent_id: "agent-1".to_owned(),
        channel: "web".to_owned(),
        status,
        created_at: at(0),
        updated_at: at(minute),
        external_user_id: None,
        external_user_name: None,
        marketing_status: None,
    }
}

pub(crate) fn message(
    id: &str,
    conversation_id: &str,
    role: MessageRole,
    content: &str,
) -> MessageEntry {
    MessageEntry {
        id: id.to_owned(),
        conversation_id: conversation_id.to_owned(),
        role,
        content: content.to_owned(),
        timestamp: at(1),
        confirmed: true,
    }
}
