use tokio::sync::broadcast;

/// Toast severity
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotificationKind {
    Success,
    Info,
    Warning,
    Error,
}

/// A user-facing message from the save-state subsystem
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    /// The UI offers a retry action for this failure
    pub retryable: bool,
}

/// Broadcasts notifications to whoever renders them
///
/// Sending never fails from the caller's point of view; with no subscriber the
/// notification is only logged.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(32);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn success(&self, title: &str, message: impl Into<String>) {
        self.send(NotificationKind::Success, title, message.into(), false);
    }

    pub fn info(&self, title: &str, message: impl Into<String>) {
        self.send(NotificationKind::Info, title, message.into(), false);
    }

    pub fn warning(&self, title: &str, message: impl Into<String>) {
        self.send(NotificationKind::Warning, title, message.into(), false);
    }

    pub fn error(&self, title: &str, message: impl Into<String>, retryable: bool) {
        self.send(NotificationKind::Error, title, message.into(), retryable);
    }

    fn send(&self, kind: NotificationKind, title: &str, message: String, retryable: bool) {
        tracing::debug!("Notification [{:?}] {}: {}", kind, title, message);

        // Ignore send errors - it's OK if no one is listening
        let _ = self.tx.send(Notification {
            kind,
            title: title.to_string(),
            message,
            retryable,
        });
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
