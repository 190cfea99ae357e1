use std::{future, time::Duration};

use tokio::time::{Instant, sleep_until};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerMode {
    OneShot,
    Repeating(Duration),
}

/// Owned timer that synchronizer loops poll from `tokio::select!`.
///
/// The timer holds no task of its own: dropping it (or calling
/// [`Timer::stop`]) is all the cancellation there is. [`Timer::fired`] is
/// cancel-safe and never resolves while the timer is stopped.
#[derive(Debug)]
pub struct Timer {
    mode: TimerMode,
    deadline: Option<Instant>,
}

impl Timer {
    /// Timer that fires once per `start`/`reset`.
    pub fn one_shot() -> Self {
        Self {
            mode: TimerMode::OneShot,
            deadline: None,
        }
    }

    /// Timer that re-arms itself with `period` after every expiry.
    pub fn repeating(period: Duration) -> Self {
        Self {
            mode: TimerMode::Repeating(period),
            deadline: None,
        }
    }

    /// Arm the timer unless it is already running.
    pub fn start(&mut self, after: Duration) {
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + after);
        }
    }

    /// Arm the timer, replacing any pending deadline.
    pub fn reset(&mut self, after: Duration) {
        self.deadline = Some(Instant::now() + after);
    }

    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn is_active(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Wait for the next expiry.
    pub async fn fired(&mut self) {
        let Some(deadline) = self.deadline else {
            return future::pending().await;
        };
        sleep_until(deadline).await;
        self.deadline = match self.mode {
            TimerMode::OneShot => None,
            TimerMode::Repeating(period) => Some(Instant::now() + period),
        };
    }
}
