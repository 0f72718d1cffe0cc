use crate::alerts::{Alert, AlertSink, CrashReporter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// State shared by every worker thread of one supervisor run.
///
/// `shutting_down` is the only cancellation signal: once set, monitor loops
/// treat process exits and closed connections as expected.
#[derive(Clone)]
pub struct RunContext {
    shutting_down: Arc<AtomicBool>,
    alerts: Arc<dyn AlertSink>,
    reporter: Arc<dyn CrashReporter>,
}

impl RunContext {
    pub fn new(alerts: Arc<dyn AlertSink>, reporter: Arc<dyn CrashReporter>) -> Self {
        Self {
            shutting_down: Arc::new(AtomicBool::new(false)),
            alerts,
            reporter,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn alert(&self, alert: Alert) {
        self.alerts.add_alert(alert);
    }

    pub fn reporter(&self) -> &dyn CrashReporter {
        self.reporter.as_ref()
    }

    /// Sleep for `duration`, waking early on shutdown. Returns `false` if
    /// shutdown was signalled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_shutting_down() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}
