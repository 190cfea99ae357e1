use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use sync_core::{EscalationAlert, NotificationPermission, NotificationSurface, SyncError};
use tracing::{debug, info, warn};

/// Alert as recorded by [`TracingSurface`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRecord {
    pub alert: EscalationAlert,
    pub system: bool,
}

#[derive(Debug)]
struct SurfaceState {
    permission: NotificationPermission,
    prompt_answer: NotificationPermission,
    /// Live alerts keyed by tag; a new alert with the same tag replaces the old.
    active: HashMap<String, NotificationRecord>,
    banner: Option<EscalationAlert>,
    cues: u64,
}

/// Headless notification surface that reports alerts through `tracing`.
///
/// Used by CLI runners and as the default surface where no desktop
/// notification service exists. Cloning shares state.
#[derive(Debug, Clone)]
pub struct TracingSurface {
    state: Arc<Mutex<SurfaceState>>,
}

impl TracingSurface {
    /// `permission` is the current state; `prompt_answer` is what a
    /// permission prompt resolves to.
    pub fn new(permission: NotificationPermission, prompt_answer: NotificationPermission) -> Self {
        Self {
            state: Arc::new(Mutex::new(SurfaceState {
                permission,
                prompt_answer,
                active: HashMap::new(),
                banner: None,
                cues: 0,
            })),
        }
    }

    /// Alerts currently shown, in tag order.
    pub fn active_alerts(&self) -> Vec<NotificationRecord> {
        let state = self.lock();
        let mut records: Vec<NotificationRecord> = state.active.values().cloned().collect();
        records.sort_by(|a, b| a.alert.tag.cmp(&b.alert.tag));
        records
    }

    pub fn banner(&self) -> Option<EscalationAlert> {
        self.lock().banner.clone()
    }

    pub fn dismiss_banner(&self) {
        self.lock().banner = None;
    }

    pub fn cue_count(&self) -> u64 {
        self.lock().cues
    }

    fn lock(&self) -> MutexGuard<'_, SurfaceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for TracingSurface {
    fn default() -> Self {
        Self::new(NotificationPermission::Default, NotificationPermission::Denied)
    }
}

impl NotificationSurface for TracingSurface {
    fn permission(&self) -> NotificationPermission {
        self.lock().permission
    }

    async fn request_permission(&self) -> NotificationPermission {
        let mut state = self.lock();
        state.permission = state.prompt_answer;
        debug!(answer = ?state.permission, "notification permission prompt answered");
        state.permission
    }

    fn show_system(&self, alert: &EscalationAlert) -> Result<(), SyncError> {
        info!(
            tag = %alert.tag,
            replaces = alert.replaces,
            title = %alert.title,
            body = %alert.body,
            "system notification"
        );
        self.lock().active.insert(
            alert.tag.clone(),
            NotificationRecord {
                alert: alert.clone(),
                system: true,
            },
        );
        Ok(())
    }

    fn play_cue(&self) {
        debug!("notification cue");
        self.lock().cues += 1;
    }

    fn show_banner(&self, alert: &EscalationAlert) {
        warn!(tag = %alert.tag, body = %alert.body, "escalation banner");
        let mut state = self.lock();
        state.active.insert(
            alert.tag.clone(),
            NotificationRecord {
                alert: alert.clone(),
                system: false,
            },
        );
        state.banner = Some(alert.clone());
    }
}
