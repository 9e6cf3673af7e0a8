use std::fmt;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::model::UserId;
use crate::observability::{NOTIFICATIONS_FAILED_TOTAL, NOTIFICATIONS_SENT_TOTAL};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub recipient: UserId,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyError(pub String);

impl fmt::Display for NotifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "notification not delivered: {}", self.0)
    }
}

impl std::error::Error for NotifyError {}

/// Outbound messages to chat users.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, recipient: UserId, text: &str) -> Result<(), NotifyError>;
}

/// Writes every message to the log. Used when no chat transport is attached.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, recipient: UserId, text: &str) -> Result<(), NotifyError> {
        info!("notify {recipient}: {text}");
        Ok(())
    }
}

/// In-process fan-out: per-recipient channels plus one firehose of everything.
pub struct Outbox {
    channels: DashMap<UserId, broadcast::Sender<Notification>>,
    all: broadcast::Sender<Notification>,
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Outbox {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Messages for one recipient. Creates the channel if needed.
    pub fn subscribe(&self, recipient: UserId) -> broadcast::Receiver<Notification> {
        self.channels
            .entry(recipient)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Notification> {
        self.all.subscribe()
    }

    pub fn unsubscribe(&self, recipient: UserId) {
        self.channels.remove(&recipient);
    }
}

#[async_trait]
impl Notifier for Outbox {
    /// Never fails; a message nobody listens for is dropped.
    async fn send(&self, recipient: UserId, text: &str) -> Result<(), NotifyError> {
        let note = Notification {
            recipient,
            text: text.to_string(),
        };
        if let Some(sender) = self.channels.get(&recipient) {
            let _ = sender.send(note.clone());
        }
        let _ = self.all.send(note);
        Ok(())
    }
}

/// Send and swallow the error. Returns whether the message went out.
pub async fn deliver(notifier: &dyn Notifier, recipient: UserId, text: &str, kind: &'static str) -> bool {
    match notifier.send(recipient, text).await {
        Ok(()) => {
            metrics::counter!(NOTIFICATIONS_SENT_TOTAL, "kind" => kind).increment(1);
            true
        }
        Err(e) => {
            warn!("{kind} notification to {recipient} failed: {e}");
            metrics::counter!(NOTIFICATIONS_FAILED_TOTAL, "kind" => kind).increment(1);
            false
        }
    }
}

/// Best-effort broadcast to every admin. Returns how many were reached.
pub async fn notify_admins(
    notifier: &dyn Notifier,
    admins: &[UserId],
    text: &str,
    kind: &'static str,
) -> usize {
    let mut reached = 0;
    for &admin in admins {
        if deliver(notifier, admin, text, kind).await {
            reached += 1;
        }
    }
    reached
}
