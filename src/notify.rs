//! User-facing notification sink.
//!
//! Every failure that reaches the user is paired with the next step they can
//! take. The host UI implements [`Notifier`]; the crate ships a log-backed sink
//! and a collecting sink for embedding and tests.

use crate::error::TrackerError;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// What the user can do about a notice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoticeAction {
    Retry,
    OpenSettings,
    SignIn,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    pub severity: Severity,
    pub message: String,
    pub action: Option<NoticeAction>,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Info,
            message: message.into(),
            action: None,
        }
    }

    /// Map an error onto a notice, or `None` for diagnostics-only errors.
    pub fn from_error(err: &TrackerError) -> Option<Self> {
        if !err.is_user_visible() {
            return None;
        }
        let (severity, action) = match err {
            TrackerError::PermissionDenied(_) | TrackerError::UnsupportedRuntime => {
                (Severity::Error, Some(NoticeAction::OpenSettings))
            }
            TrackerError::SamplerAttachFailure { .. } | TrackerError::SamplerStale { .. } => {
                (Severity::Error, Some(NoticeAction::Retry))
            }
            TrackerError::PersistenceFailure(_) | TrackerError::Preferences(_) => {
                (Severity::Warning, Some(NoticeAction::Retry))
            }
            TrackerError::NotAuthenticated => (Severity::Error, Some(NoticeAction::SignIn)),
            _ => (Severity::Warning, None),
        };
        Some(Self {
            severity,
            message: err.to_string(),
            action,
        })
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Forward an error to the notifier when it is user-visible.
pub fn report(notifier: &dyn Notifier, err: &TrackerError) {
    if let Some(notice) = Notice::from_error(err) {
        notifier.notify(notice);
    }
}

/// Writes notices to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: Notice) {
        match notice.severity {
            Severity::Info => info!("[notice] {}", notice.message),
            Severity::Warning => warn!("[notice] {} ({:?})", notice.message, notice.action),
            Severity::Error => error!("[notice] {} ({:?})", notice.message, notice.action),
        }
    }
}

/// Keeps every notice in memory, in delivery order.
#[derive(Debug, Default)]
pub struct CollectingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl CollectingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.notices
            .lock()
            .map(|n| n.clone())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut notices) = self.notices.lock() {
            notices.clear();
        }
    }
}

impl Notifier for CollectingNotifier {
    fn notify(&self, notice: Notice) {
        if let Ok(mut notices) = self.notices.lock() {
            notices.push(notice);
        }
    }
}
