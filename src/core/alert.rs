use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::errors::PoisonedLockExt;

pub const JOURNAL_CATEGORY: &str = "journal";
pub const MISSING_VOLUME_CATEGORY: &str = "missing_volume";
pub const MANY_JOURNAL_FILES_CATEGORY: &str = "many_journal_files";
pub const CLEANUP_CATEGORY: &str = "cleanup";
pub const FLUSH_CATEGORY: &str = "flush";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AlertLevel {
    Normal,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub level: AlertLevel,
    pub message: String,
    pub time_millis: u64,
}

impl Event {
    pub fn new(level: AlertLevel, message: impl Into<String>) -> Self {
        let time_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            level,
            message: message.into(),
            time_millis,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AlertHistory {
    pub first: Option<Event>,
    pub last: Option<Event>,
    pub count: u64,
}

impl AlertHistory {
    pub fn level(&self) -> AlertLevel {
        self.last.as_ref().map_or(AlertLevel::Normal, |e| e.level)
    }
}

/// Operator-facing record of abnormal conditions, grouped by category.
///
/// Every posted event is also emitted through `tracing` at the matching
/// level. A `Normal` event resets its category.
#[derive(Debug, Default)]
pub struct AlertMonitor {
    histories: Mutex<HashMap<String, AlertHistory>>,
}

impl AlertMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self, event: Event, category: &str) {
        match event.level {
            AlertLevel::Normal => tracing::info!(category, message = %event.message, "alert cleared"),
            AlertLevel::Warn => tracing::warn!(category, message = %event.message, "alert"),
            AlertLevel::Error => tracing::error!(category, message = %event.message, "alert"),
        }
        let mut histories = self.histories.lock().recover_poison();
        if event.level == AlertLevel::Normal {
            histories.remove(category);
            return;
        }
        let history = histories.entry(category.to_string()).or_default();
        if history.first.is_none() {
            history.first = Some(event.clone());
        }
        history.last = Some(event);
        history.count += 1;
    }

    pub fn history(&self, category: &str) -> Option<AlertHistory> {
        self.histories.lock().recover_poison().get(category).cloned()
    }

    /// Highest level currently held by any category.
    pub fn level(&self) -> AlertLevel {
        self.histories
            .lock()
            .recover_poison()
            .values()
            .map(|h| h.level())
            .max()
            .unwrap_or(AlertLevel::Normal)
    }

    pub fn reset(&self) {
        self.histories.lock().recover_poison().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_escalate_and_clear() {
        let monitor = AlertMonitor::new();
        assert_eq!(monitor.level(), AlertLevel::Normal);

        monitor.post(Event::new(AlertLevel::Warn, "6 journal files"), MANY_JOURNAL_FILES_CATEGORY);
        monitor.post(Event::new(AlertLevel::Error, "write failed"), JOURNAL_CATEGORY);
        assert_eq!(monitor.level(), AlertLevel::Error);

        monitor.post(Event::new(AlertLevel::Error, "write failed again"), JOURNAL_CATEGORY);
        let history = monitor.history(JOURNAL_CATEGORY).unwrap();
        assert_eq!(history.count, 2);
        assert_eq!(history.first.unwrap().message, "write failed");

        monitor.post(Event::new(AlertLevel::Normal, "recovered"), JOURNAL_CATEGORY);
        assert!(monitor.history(JOURNAL_CATEGORY).is_none());
        assert_eq!(monitor.level(), AlertLevel::Warn);
    }
}
