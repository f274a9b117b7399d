// src/notify.rs

//! Fire-and-forget webhook notifications. Grounded on
//! `original_source/lib/notifications.py::send_webhook`. Per spec.md §7,
//! NotifierError is swallowed — a failed notification is logged, never
//! propagated to the caller.

use reqwest::Client;
use tracing::warn;

use crate::config::NotificationsConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Begin,
    Success,
    Failure,
    Completed,
}

impl Severity {
    fn key(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Begin => "begin",
            Severity::Success => "success",
            Severity::Failure => "failure",
            Severity::Completed => "completed",
        }
    }
}

pub struct Notifier {
    config: NotificationsConfig,
    client: Client,
}

impl Notifier {
    pub fn new(config: NotificationsConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    /// Substitutes `{icon}` and `{message}` into the configured body
    /// template and sends it with the configured HTTP verb. Any failure
    /// (network, non-2xx, disabled) is logged and swallowed.
    pub async fn send(&self, severity: Severity, message: &str) {
        if !self.config.enabled {
            return;
        }

        let icon = self
            .config
            .icons
            .get(severity.key())
            .cloned()
            .unwrap_or_default();

        let body = self
            .config
            .body
            .replace("{icon}", &icon)
            .replace("{message}", message);

        let result = match self.config.action.to_lowercase().as_str() {
            "get" => self.client.get(self.config.uri.as_str()).body(body).send().await,
            "put" => self.client.put(self.config.uri.as_str()).body(body).send().await,
            "patch" => self.client.patch(self.config.uri.as_str()).body(body).send().await,
            _ => self.client.post(self.config.uri.as_str()).body(body).send().await,
        };

        match result {
            Ok(resp) if !resp.status().is_success() => {
                warn!(
                    "notification webhook returned non-success status {}",
                    resp.status()
                );
            }
            Err(e) => warn!("notification webhook failed: {}", e),
            _ => {}
        }
    }
}
