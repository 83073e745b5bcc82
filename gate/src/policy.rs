//! Notification permission gating.
//!
//! Decides whether the user sees the custom notification prompt before the
//! web destination, and records what they answered.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use shared::store::{KeyValueStore, StoreError};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const PROMPT_COOLDOWN_KEY: &str = "notifications.prompt_cooldown";
pub const DEFAULT_PROMPT_COOLDOWN: Duration = Duration::from_secs(3 * 24 * 60 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PermissionStatus {
    Authorized,
    Denied,
    Provisional,
    Ephemeral,
    NotDetermined,
}

impl PermissionStatus {
    /// Whether notifications can already reach the user.
    pub fn allows_delivery(&self) -> bool {
        matches!(
            self,
            PermissionStatus::Authorized | PermissionStatus::Provisional | PermissionStatus::Ephemeral
        )
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            PermissionStatus::Authorized => "authorized",
            PermissionStatus::Denied => "denied",
            PermissionStatus::Provisional => "provisional",
            PermissionStatus::Ephemeral => "ephemeral",
            PermissionStatus::NotDetermined => "not_determined",
        }
    }
}

impl fmt::Display for PermissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "authorized" => Ok(PermissionStatus::Authorized),
            "denied" => Ok(PermissionStatus::Denied),
            "provisional" => Ok(PermissionStatus::Provisional),
            "ephemeral" => Ok(PermissionStatus::Ephemeral),
            "not_determined" => Ok(PermissionStatus::NotDetermined),
            other => Err(format!("unknown permission status: {other}")),
        }
    }
}

/// The platform's notification permission facility.
#[async_trait]
pub trait PermissionService: Send + Sync {
    async fn current_status(&self) -> PermissionStatus;

    /// Asks the user for permission. Once decided, the platform answers with
    /// the existing status without asking again.
    async fn request_permission(&self) -> PermissionStatus;
}

/// A permission service with a scripted answer, for headless runs.
pub struct FixedPermissions {
    status: Mutex<PermissionStatus>,
    answer: PermissionStatus,
    requests: AtomicUsize,
}

impl FixedPermissions {
    /// `answer` is what the user picks if asked while undetermined.
    pub fn new(status: PermissionStatus, answer: PermissionStatus) -> Self {
        FixedPermissions {
            status: Mutex::new(status),
            answer,
            requests: AtomicUsize::new(0),
        }
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PermissionService for FixedPermissions {
    async fn current_status(&self) -> PermissionStatus {
        *self.status.lock()
    }

    async fn request_permission(&self) -> PermissionStatus {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let mut status = self.status.lock();
        if *status == PermissionStatus::NotDetermined {
            *status = self.answer;
        }
        *status
    }
}

pub struct NotificationGatePolicy {
    store: Arc<dyn KeyValueStore>,
    permissions: Arc<dyn PermissionService>,
    cooldown: Duration,
}

impl NotificationGatePolicy {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        permissions: Arc<dyn PermissionService>,
        cooldown: Duration,
    ) -> Self {
        NotificationGatePolicy {
            store,
            permissions,
            cooldown,
        }
    }

    /// True unless notifications already reach the user or a decline
    /// cooldown is still running.
    pub async fn should_prompt(&self) -> bool {
        let status = self.permissions.current_status().await;
        if status.allows_delivery() {
            tracing::debug!(status = %status, "Skipping notification prompt");
            return false;
        }

        match self.cooldown_until() {
            Some(until) if until > Utc::now() => {
                tracing::debug!(until = %until, "Notification prompt is cooling down");
                false
            }
            _ => true,
        }
    }

    /// End of the current decline cooldown. Unreadable values count as none.
    pub fn cooldown_until(&self) -> Option<DateTime<Utc>> {
        let raw = match self.store.get(PROMPT_COOLDOWN_KEY) {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read prompt cooldown");
                return None;
            }
        };

        match DateTime::parse_from_rfc3339(&raw) {
            Ok(until) => Some(until.with_timezone(&Utc)),
            Err(e) => {
                tracing::warn!(value = %raw, error = %e, "Ignoring malformed prompt cooldown");
                None
            }
        }
    }

    /// Granted clears the cooldown. Anything else starts a new one.
    pub fn record_prompt_outcome(&self, granted: bool) -> Result<(), StoreError> {
        if granted {
            return self.store.remove(PROMPT_COOLDOWN_KEY);
        }

        let now = Utc::now();
        let until = TimeDelta::from_std(self.cooldown)
            .ok()
            .and_then(|cooldown| now.checked_add_signed(cooldown))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.store.set(PROMPT_COOLDOWN_KEY, &until.to_rfc3339())
    }

    /// Requests the platform permission and records the result.
    pub async fn accept(&self) -> PermissionStatus {
        let status = self.permissions.request_permission().await;
        tracing::info!(status = %status, "Notification permission requested");

        if let Err(e) = self.record_prompt_outcome(status.allows_delivery()) {
            tracing::error!(error = %e, "Failed to record prompt outcome");
        }
        status
    }

    pub fn decline(&self) {
        tracing::info!(cooldown_secs = self.cooldown.as_secs(), "Notification prompt declined");

        if let Err(e) = self.record_prompt_outcome(false) {
            tracing::error!(error = %e, "Failed to record prompt outcome");
        }
    }
}
