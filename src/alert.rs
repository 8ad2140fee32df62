//! User-visible notification fan-out.
//!
//! The core layer never renders anything; it publishes alerts into a
//! broadcast hub and whatever UI surfaces exist subscribe and display them
//! however they like. Publishing with zero subscribers is fine.

use tokio::sync::broadcast;

const ALERT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Info,
    Error,
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub level: AlertLevel,
    pub message: String,
}

#[derive(Clone)]
pub struct AlertHub {
    tx: broadcast::Sender<Alert>,
}

impl AlertHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(ALERT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.tx.subscribe()
    }

    pub fn info(&self, message: impl Into<String>) {
        self.publish(AlertLevel::Info, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.publish(AlertLevel::Error, message.into());
    }

    fn publish(&self, level: AlertLevel, message: String) {
        match level {
            AlertLevel::Info => tracing::info!(alert = %message),
            AlertLevel::Error => tracing::warn!(alert = %message),
        }
        // Ignore error - means no receivers
        let _ = self.tx.send(Alert { level, message });
    }
}

impl Default for AlertHub {
    fn default() -> Self {
        Self::new()
    }
}
