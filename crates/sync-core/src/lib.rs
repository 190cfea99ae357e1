//! Core contract of the support-desk sync layer.
//!
//! This crate defines the push-channel protocol types and codec, the
//! connection lifecycle model, and the pure reducers the synchronizer
//! runtimes drive: the conversation list, the transcript buffer and the
//! escalation notifier.

/// Observer fan-out for transport events.
pub mod channel;
/// Push-channel frame encoding/decoding.
pub mod codec;
/// Filtered, sorted conversation collection.
pub mod conversation_list;
/// Stable error types and HTTP classification helpers.
pub mod error;
/// Escalation alert routing and de-duplication.
pub mod escalation;
/// Linear reconnect backoff policy.
pub mod retry;
/// Owned timers polled from synchronizer loops.
pub mod scheduler;
/// Push-channel lifecycle state machine.
pub mod state_machine;
/// Optimistic transcript buffer.
pub mod transcript;
/// Wire and domain types.
pub mod types;

pub use channel::{Subject, Subscription};
pub use codec::{FrameError, decode_frame, encode_frame};
pub use conversation_list::{ConversationList, ListChange, compare_conversations};
pub use error::{SyncError, SyncErrorCategory, classify_http_status};
pub use escalation::{
    DEFAULT_DISPLAY_WINDOW, Delivery, EscalationAlert, EscalationNotifier, NotificationOutcome,
    NotificationPermission, NotificationSurface,
};
pub use retry::ReconnectPolicy;
pub use scheduler::Timer;
pub use state_machine::{
    ABNORMAL_CLOSURE, ChannelPhase, CloseDecision, ConnectionStateMachine, NORMAL_CLOSURE,
};
pub use transcript::{Reconciled, TranscriptBuffer, TranscriptError, is_local_id};
pub use types::{
    ChannelEvent, ConnectionState, ConversationFilter, ConversationQuery, ConversationStatus,
    ConversationSummary, DashboardStats, MessageAdded, MessageEntry, MessageRole, OutboundFrame,
    StatusFilter,
};
