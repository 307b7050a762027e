//! Notification channel.
//!
//! Delivery failures are logged and swallowed; notifications are never
//! allowed to abort the primary transaction.

use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::domain::ports::{Notifier, NotifyLevel};

/// Default channel: structured log lines plus an append-only outbox file the
/// external notification relay tails.
pub struct OutboxNotifier {
    outbox_path: PathBuf,
}

impl OutboxNotifier {
    pub fn new(logs_dir: PathBuf) -> Self {
        Self { outbox_path: logs_dir.join("notifications.jsonl") }
    }
}

#[async_trait]
impl Notifier for OutboxNotifier {
    async fn send(&self, message: &str, level: NotifyLevel, title: Option<&str>) -> Result<()> {
        match level {
            NotifyLevel::L4 => error!("[{level}] {} {message}", title.unwrap_or("")),
            NotifyLevel::L3 => warn!("[{level}] {} {message}", title.unwrap_or("")),
            _ => info!("[{level}] {} {message}", title.unwrap_or("")),
        }

        if let Some(parent) = self.outbox_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = serde_json::json!({
            "at": chrono::Utc::now().to_rfc3339(),
            "level": level.to_string(),
            "title": title,
            "message": message,
        });
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.outbox_path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

/// Fire-and-forget wrapper: failures degrade to a warning.
pub async fn notify_best_effort(
    notifier: &dyn Notifier,
    message: &str,
    level: NotifyLevel,
    title: Option<&str>,
) {
    if let Err(e) = notifier.send(message, level, title).await {
        warn!("Notification delivery failed (swallowed): {e}");
    }
}
