use tracing::warn;

/// Sink for messages that must reach the user directly.
pub trait Notifier: Send + Sync {
    fn display_notification(&self, title: &str, description: &str);
}

/// Default notifier used when no UI is attached; it only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn display_notification(&self, title: &str, description: &str) {
        warn!(title, description, "user notification");
    }
}
