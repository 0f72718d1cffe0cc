//! Alert and crash-report sinks.
//!
//! Both are write-only collaborators supplied by the host. Delivery is best
//! effort: implementations must swallow their own failures.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Error,
}

/// Well-known cause tags.
pub mod cause {
    pub const STREAMING: &str = "streaming";
    pub const CPU: &str = "cpu";
    pub const TIMELAPSE_COMPAT_MODE: &str = "octolapse_compat_mode";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub cause: String,
    /// Free-form diagnostics, e.g. an exit code and stderr tail
    pub detail: Option<String>,
    pub raised_at: chrono::DateTime<chrono::Utc>,
}

impl Alert {
    pub fn warning(cause: impl Into<String>) -> Self {
        Self {
            level: AlertLevel::Warning,
            cause: cause.into(),
            detail: None,
            raised_at: chrono::Utc::now(),
        }
    }

    pub fn error(cause: impl Into<String>) -> Self {
        Self {
            level: AlertLevel::Error,
            ..Self::warning(cause)
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

pub trait AlertSink: Send + Sync {
    fn add_alert(&self, alert: Alert);
}

/// Receives failures worth a crash report.
pub trait CrashReporter: Send + Sync {
    fn capture_message(&self, message: &str);

    fn capture_error(&self, error: &dyn std::error::Error) {
        self.capture_message(&error.to_string());
    }
}

/// Alert sink that writes to the log, dropping repeats of the same
/// `(level, cause)` inside the dedup window.
pub struct LogAlertSink {
    window: Duration,
    last_seen: Mutex<HashMap<(AlertLevel, String), Instant>>,
}

impl LogAlertSink {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    fn should_emit(&self, alert: &Alert) -> bool {
        let mut seen = self.last_seen.lock().expect("lock poisoned");
        let key = (alert.level, alert.cause.clone());
        let now = Instant::now();
        match seen.get(&key) {
            Some(at) if now.duration_since(*at) < self.window => false,
            _ => {
                seen.insert(key, now);
                true
            }
        }
    }
}

impl AlertSink for LogAlertSink {
    fn add_alert(&self, alert: Alert) {
        if !self.should_emit(&alert) {
            log::debug!("Suppressing repeated alert: {}", alert.cause);
            return;
        }
        let detail = alert.detail.as_deref().unwrap_or("");
        match alert.level {
            AlertLevel::Warning => log::warn!("ALERT [{}] {}", alert.cause, detail),
            AlertLevel::Error => log::error!("ALERT [{}] {}", alert.cause, detail),
        }
    }
}

/// Crash reporter that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCrashReporter;

impl CrashReporter for LogCrashReporter {
    fn capture_message(&self, message: &str) {
        log::error!("{}", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_window() {
        let sink = LogAlertSink::new(Duration::from_secs(60));
        assert!(sink.should_emit(&Alert::warning(cause::CPU)));
        assert!(!sink.should_emit(&Alert::warning(cause::CPU)));
        // Different level or cause is a different key
        assert!(sink.should_emit(&Alert::error(cause::CPU)));
        assert!(sink.should_emit(&Alert::warning(cause::STREAMING)));
    }

    #[test]
    fn test_zero_window_never_suppresses() {
        let sink = LogAlertSink::new(Duration::ZERO);
        assert!(sink.should_emit(&Alert::warning(cause::CPU)));
        assert!(sink.should_emit(&Alert::warning(cause::CPU)));
    }

    #[test]
    fn test_alert_builders() {
        let alert = Alert::error("encoder").with_detail("exit code 1");
        assert_eq!(alert.level, AlertLevel::Error);
        assert_eq!(alert.cause, "encoder");
        assert_eq!(alert.detail.as_deref(), Some("exit code 1"));
    }
}
