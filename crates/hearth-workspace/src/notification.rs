//! Operator notifications: block failures and lifecycle reports on a broadcast bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::graph::node::BlockNode;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

/// One report tied to a tab and, when known, the block that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub tab_id: String,
    pub node_id: Option<String>,
    pub extension_id: Option<String>,
    pub opcode: Option<String>,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl Notification {
    pub fn tab(level: NotificationLevel, tab_id: &str, message: impl Into<String>) -> Notification {
        Notification {
            level,
            tab_id: tab_id.to_string(),
            node_id: None,
            extension_id: None,
            opcode: None,
            message: message.into(),
            at: Utc::now(),
        }
    }

    pub fn block(
        level: NotificationLevel,
        tab_id: &str,
        node: &BlockNode,
        message: impl Into<String>,
    ) -> Notification {
        Notification {
            level,
            tab_id: tab_id.to_string(),
            node_id: Some(node.id.clone()),
            extension_id: Some(node.extension_id.clone()),
            opcode: Some(node.opcode.clone()),
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Fan-out sender. Publishing never blocks and never fails; slow subscribers
/// lose the oldest entries, and every notification is mirrored to tracing.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new() -> Notifier {
        Notifier::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Notifier {
        let (tx, _rx) = broadcast::channel(capacity);
        Notifier { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn publish(&self, notification: Notification) {
        match notification.level {
            NotificationLevel::Error => tracing::error!(
                tab = %notification.tab_id,
                node = notification.node_id.as_deref().unwrap_or("-"),
                "{}",
                notification.message
            ),
            NotificationLevel::Warning => tracing::warn!(
                tab = %notification.tab_id,
                node = notification.node_id.as_deref().unwrap_or("-"),
                "{}",
                notification.message
            ),
            NotificationLevel::Info => tracing::info!(
                tab = %notification.tab_id,
                node = notification.node_id.as_deref().unwrap_or("-"),
                "{}",
                notification.message
            ),
        }
        let _ = self.tx.send(notification);
    }
}

impl Default for Notifier {
    fn default() -> Notifier {
        Notifier::new()
    }
}
