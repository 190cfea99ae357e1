use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle status of a support conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationStatus {
    /// The AI agent is handling the conversation.
    AiActive,
    /// The conversation was escalated and waits for a human.
    NeedsHuman,
    /// A human operator has taken over.
    HumanActive,
    /// The conversation is finished.
    Closed,
}

impl ConversationStatus {
    /// Sort priority used by conversation lists (lower sorts first).
    pub fn priority(self) -> u8 {
        match self {
            Self::NeedsHuman => 0,
            Self::HumanActive => 1,
            Self::AiActive | Self::Closed => 2,
        }
    }

    /// Wire representation, as used in query strings.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AiActive => "AI_ACTIVE",
            Self::NeedsHuman => "NEEDS_HUMAN",
            Self::HumanActive => "HUMAN_ACTIVE",
            Self::Closed => "CLOSED",
        }
    }
}

/// Conversation metadata shown in dashboard lists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationSummary {
    /// Server conversation ID.
    pub id: String,
    /// ID of the agent that owns the conversation.
    pub agent_id: String,
    /// Channel the end user reached the agent through (web, whatsapp, ...).
    pub channel: String,
    /// Current lifecycle status.
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// End-user identifier on the external channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_user_id: Option<String>,
    /// End-user display name on the external channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_user_name: Option<String>,
    /// Marketing opt-in status, when the channel reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marketing_status: Option<String>,
}

/// Author role of a transcript message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Agent,
    Admin,
}

/// One message of an open transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageEntry {
    /// Server message ID, or a `local-` temporary ID while unconfirmed.
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// `false` while the entry is an optimistic local echo.
    #[serde(default = "confirmed_by_default")]
    pub confirmed: bool,
}

fn confirmed_by_default() -> bool {
    true
}

/// Aggregate dashboard counters. Every field is optional on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DashboardStats {
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub needs_human: Option<u64>,
    #[serde(default)]
    pub human_active: Option<u64>,
    #[serde(default)]
    pub ai_active: Option<u64>,
    #[serde(default)]
    pub closed: Option<u64>,
}

/// Payload of a chat `message` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageAdded {
    /// Server-issued message ID, absent for some echo frames.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Temporary ID of the optimistic entry, when the server echoes it back.
    #[serde(default)]
    pub client_id: Option<String>,
}

/// Inbound push-channel event, discriminated by the `type` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelEvent {
    /// Server greeting after the channel opened.
    Connected,
    ConversationUpdated {
        conversation: ConversationSummary,
    },
    ConversationEscalated {
        conversation: ConversationSummary,
        #[serde(default)]
        reason: Option<String>,
    },
    StatsUpdated {
        stats: DashboardStats,
    },
    #[serde(rename = "message")]
    MessageAdded(MessageAdded),
    Typing,
    /// Authoritative status change of the open conversation.
    Status {
        status: ConversationStatus,
    },
    Handoff {
        #[serde(default)]
        reason: Option<String>,
    },
    Error {
        #[serde(default)]
        message: String,
    },
    Ping,
    Pong,
    /// Well-formed envelope of a type this client does not model.
    #[serde(skip)]
    Unrecognized { kind: String, payload: Value },
}

impl ChannelEvent {
    /// Wire discriminator, for logging.
    pub fn kind(&self) -> &str {
        match self {
            Self::Connected => "connected",
            Self::ConversationUpdated { .. } => "conversation_updated",
            Self::ConversationEscalated { .. } => "conversation_escalated",
            Self::StatsUpdated { .. } => "stats_updated",
            Self::MessageAdded(_) => "message",
            Self::Typing => "typing",
            Self::Status { .. } => "status",
            Self::Handoff { .. } => "handoff",
            Self::Error { .. } => "error",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Unrecognized { kind, .. } => kind,
        }
    }
}

/// Frames the client writes to the push channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Pong,
    Message {
        content: String,
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },
    Typing,
}

/// Connection status reported to transport observers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Status category used by conversation list filters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum StatusFilter {
    /// Every conversation.
    #[default]
    All,
    /// Everything except closed conversations.
    Open,
    /// Exactly one status.
    Only(ConversationStatus),
}

/// Filter predicate applied to the visible conversation collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ConversationFilter {
    pub status: StatusFilter,
    /// Restrict to conversations owned by one agent.
    pub agent_id: Option<String>,
}

impl ConversationFilter {
    pub fn with_status(status: StatusFilter) -> Self {
        Self {
            status,
            agent_id: None,
        }
    }

    pub fn matches(&self, conversation: &ConversationSummary) -> bool {
        let status_ok = match self.status {
            StatusFilter::All => true,
            StatusFilter::Open => conversation.status != ConversationStatus::Closed,
            StatusFilter::Only(status) => conversation.status == status,
        };
        let agent_ok = self
            .agent_id
            .as_deref()
            .is_none_or(|agent_id| agent_id == conversation.agent_id);
        status_ok && agent_ok
    }
}

/// Query sent to the list-conversations endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConversationQuery {
    pub status: Option<ConversationStatus>,
    pub agent_id: Option<String>,
    pub limit: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(status: ConversationStatus, agent_id: &str) -> ConversationSummary {
        let at = DateTime::parse_from_rfc3339("2026-01-05T10:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc);
        ConversationSummary {
            id: "c1".into(),
            agent_id: agent_id.into(),
            channel: "web".into(),
            status,
            created_at: at,
            updated_at: at,
            external_user_id: None,
            external_user_name: None,
            marketing_status: None,
        }
    }

    #[test]
    fn status_priority_orders_escalations_first() {
        assert!(
            ConversationStatus::NeedsHuman.priority() < ConversationStatus::HumanActive.priority()
        );
        assert!(
            ConversationStatus::HumanActive.priority() < ConversationStatus::AiActive.priority()
        );
        assert_eq!(
            ConversationStatus::AiActive.priority(),
            ConversationStatus::Closed.priority()
        );
    }

    #[test]
    fn filter_matches_status_category_and_agent() {
        let open = ConversationFilter::with_status(StatusFilter::Open);
        assert!(open.matches(&summary(ConversationStatus::AiActive, "a1")));
        assert!(!open.matches(&summary(ConversationStatus::Closed, "a1")));

        let only = ConversationFilter {
            status: StatusFilter::Only(ConversationStatus::NeedsHuman),
            agent_id: Some("a1".into()),
        };
        assert!(only.matches(&summary(ConversationStatus::NeedsHuman, "a1")));
        assert!(!only.matches(&summary(ConversationStatus::NeedsHuman, "a2")));
        assert!(!only.matches(&summary(ConversationStatus::HumanActive, "a1")));
    }

    #[test]
    fn message_entries_from_server_default_to_confirmed() {
        let entry: MessageEntry = serde_json::from_str(
            r#"{"id":"m1","conversation_id":"c1","role":"agent","content":"hi","timestamp":"2026-01-05T10:00:00Z"}"#,
        )
        .expect("entry should parse");
        assert!(entry.confirmed);
        assert_eq!(entry.role, MessageRole::Agent);
    }

    #[test]
    fn outbound_message_frame_omits_missing_client_id() {
        let frame = OutboundFrame::Message {
            content: "hello".into(),
            timestamp: DateTime::parse_from_rfc3339("2026-01-05T10:00:00Z")
                .expect("timestamp")
                .with_timezone(&Utc),
            client_id: None,
        };
        let json = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(json["type"], "message");
        assert_eq!(json["content"], "hello");
        assert!(json.get("client_id").is_none());
    }
}
