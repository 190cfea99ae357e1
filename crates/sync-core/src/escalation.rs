//! Escalation alerts: system notification or in-app banner.

use std::{collections::HashMap, future::Future, time::Duration};

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{error::SyncError, types::ConversationSummary};

/// How long an escalation alert counts as "on screen" for de-duplication.
pub const DEFAULT_DISPLAY_WINDOW: Duration = Duration::from_secs(10);

/// Notification permission as reported by the host platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationPermission {
    Granted,
    /// Not decided yet; the user can still be asked.
    Default,
    Denied,
}

/// One escalation alert handed to a [`NotificationSurface`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationAlert {
    /// Replacement tag; alerts with equal tags replace each other.
    pub tag: String,
    pub conversation_id: String,
    pub title: String,
    pub body: String,
    /// `true` when this alert supersedes one still on screen.
    pub replaces: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    System,
    Banner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationOutcome {
    pub delivery: Delivery,
    pub replaced: bool,
}

/// Host-side presentation of escalation alerts.
pub trait NotificationSurface: Send + Sync {
    fn permission(&self) -> NotificationPermission;

    /// Ask the user for permission. Called at most once per notifier.
    fn request_permission(&self) -> impl Future<Output = NotificationPermission> + Send;

    fn show_system(&self, alert: &EscalationAlert) -> Result<(), SyncError>;

    /// Short audible cue accompanying a system alert.
    fn play_cue(&self);

    fn show_banner(&self, alert: &EscalationAlert);
}

/// Routes escalations to a surface and collapses repeats per conversation.
#[derive(Debug)]
pub struct EscalationNotifier<S> {
    surface: S,
    display_window: Duration,
    permission_requested: bool,
    shown_at: HashMap<String, Instant>,
}

impl<S: NotificationSurface> EscalationNotifier<S> {
    pub fn new(surface: S, display_window: Duration) -> Self {
        Self {
            surface,
            display_window,
            permission_requested: false,
            shown_at: HashMap::new(),
        }
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    /// Present one escalation. Never fails: every error degrades to a banner.
    pub async fn notify(
        &mut self,
        conversation: &ConversationSummary,
        reason: Option<&str>,
    ) -> NotificationOutcome {
        let now = Instant::now();
        let window = self.display_window;
        self.shown_at
            .retain(|_, shown| now.duration_since(*shown) < window);

        let tag = alert_tag(&conversation.id);
        let replaced = self.shown_at.insert(tag.clone(), now).is_some();
        let alert = EscalationAlert {
            tag,
            conversation_id: conversation.id.clone(),
            title: "Conversation needs attention".to_owned(),
            body: alert_body(conversation, reason),
            replaces: replaced,
        };

        let delivery = match self.resolve_permission().await {
            NotificationPermission::Granted => match self.surface.show_system(&alert) {
                Ok(()) => {
                    if !replaced {
                        self.surface.play_cue();
                    }
                    Delivery::System
                }
                Err(err) => {
                    warn!(
                        conversation_id = %alert.conversation_id,
                        error = %err,
                        "system notification failed; falling back to banner"
                    );
                    self.surface.show_banner(&alert);
                    Delivery::Banner
                }
            },
            NotificationPermission::Default | NotificationPermission::Denied => {
                self.surface.show_banner(&alert);
                Delivery::Banner
            }
        };

        info!(
            conversation_id = %alert.conversation_id,
            ?delivery,
            replaced,
            "escalation notified"
        );
        NotificationOutcome { delivery, replaced }
    }

    async fn resolve_permission(&mut self) -> NotificationPermission {
        let current = self.surface.permission();
        if current != NotificationPermission::Default || self.permission_requested {
            return current;
        }

        self.permission_requested = true;
        let answer = self.surface.request_permission().await;
        debug!(?answer, "notification permission requested");
        answer
    }
}

fn alert_tag(conversation_id: &str) -> String {
    format!("escalation-{conversation_id}")
}

fn alert_body(conversation: &ConversationSummary, reason: Option<&str>) -> String {
    let who = conversation
        .external_user_name
        .as_deref()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or(conversation.id.as_str());
    match reason.filter(|reason| !reason.trim().is_empty()) {
        Some(reason) => format!("{who} ({}): {reason}", conversation.channel),
        None => format!("{who} ({}) is waiting for a human", conversation.channel),
    }
}
