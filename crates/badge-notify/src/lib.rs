//! Best-effort chat notifications for badge additions and repairs.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "badge-notify";

const BOT_USERNAME: &str = "Badge Bot";
const EMBED_COLOR: u32 = 10_181_046;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    NewSet,
    NewVersion,
    Repaired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub content: String,
    pub image_url: Option<String>,
}

impl Notification {
    pub fn new_set(name: &str, image_url: &str) -> Self {
        Self {
            kind: NotificationKind::NewSet,
            content: format!("🚀 New Badge Set: `{name}`"),
            image_url: Some(image_url.to_string()),
        }
    }

    pub fn new_version(set_id: &str, id: &str, image_url: &str) -> Self {
        Self {
            kind: NotificationKind::NewVersion,
            content: format!("✨ New Version Detected: `{set_id}` ({id})"),
            image_url: Some(image_url.to_string()),
        }
    }

    pub fn repaired(set_id: &str, id: &str, image_url: &str) -> Self {
        Self {
            kind: NotificationKind::Repaired,
            content: format!("🔧 Repaired Badge Link: `{set_id}` ({id})"),
            image_url: Some(image_url.to_string()),
        }
    }
}

/// Side channel for run events. Delivery failures never reach the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification);
}

#[derive(Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, notification: &Notification) {
        debug!(content = %notification.content, "notifications disabled; skipping");
    }
}

/// Discord-style incoming webhook.
pub struct DiscordWebhook {
    webhook_url: String,
    http: reqwest::Client,
    cooldown: Duration,
}

impl DiscordWebhook {
    pub fn new(webhook_url: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            webhook_url,
            http,
            cooldown: Duration::from_secs(2),
        })
    }

    /// Pause after each delivered message; the receiving side rate-limits.
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn payload(notification: &Notification) -> serde_json::Value {
        let mut payload = json!({
            "username": BOT_USERNAME,
            "content": notification.content,
        });
        if let Some(url) = &notification.image_url {
            payload["embeds"] = json!([{ "image": { "url": url }, "color": EMBED_COLOR }]);
        }
        payload
    }

    async fn post(&self, payload: serde_json::Value) -> anyhow::Result<()> {
        let resp = self
            .http
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "webhook returned non-success");
            anyhow::bail!("webhook returned {status}");
        }

        Ok(())
    }
}

#[async_trait]
impl Notifier for DiscordWebhook {
    async fn notify(&self, notification: &Notification) {
        match self.post(Self::payload(notification)).await {
            Ok(()) => {
                debug!(kind = ?notification.kind, "notification delivered");
                tokio::time::sleep(self.cooldown).await;
            }
            Err(err) => warn!(error = %err, kind = ?notification.kind, "notification dropped"),
        }
    }
}

/// Webhook notifier when a non-blank URL is configured, otherwise a no-op.
pub fn notifier_for(webhook_url: Option<&str>) -> anyhow::Result<Box<dyn Notifier>> {
    match webhook_url.map(str::trim).filter(|u| !u.is_empty()) {
        Some(url) => Ok(Box::new(DiscordWebhook::new(url.to_string())?)),
        None => Ok(Box::new(NoopNotifier)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn payload_embeds_badge_image() {
        let n = Notification::new_set("Subscriber", "https://static-cdn.jtvnw.net/badges/v1/1/3");
        let payload = DiscordWebhook::payload(&n);
        assert_eq!(payload["username"], "Badge Bot");
        assert_eq!(payload["content"], "🚀 New Badge Set: `Subscriber`");
        assert_eq!(
            payload["embeds"][0]["image"]["url"],
            "https://static-cdn.jtvnw.net/badges/v1/1/3"
        );
        assert_eq!(payload["embeds"][0]["color"], 10181046);
    }

    #[test]
    fn payload_without_image_omits_embeds() {
        let n = Notification {
            kind: NotificationKind::Repaired,
            content: "plain".into(),
            image_url: None,
        };
        let payload = DiscordWebhook::payload(&n);
        assert!(payload.get("embeds").is_none());
    }

    #[test]
    fn version_wording_names_set_and_id() {
        let n = Notification::new_version("subscriber", "3000", "u");
        assert_eq!(n.content, "✨ New Version Detected: `subscriber` (3000)");
        assert_eq!(n.kind, NotificationKind::NewVersion);
    }

    #[tokio::test]
    async fn unreachable_webhook_is_swallowed_without_cooldown() {
        let hook = DiscordWebhook::new("http://127.0.0.1:1/webhook".into())
            .unwrap()
            .with_cooldown(Duration::from_secs(30));
        let started = Instant::now();
        hook.notify(&Notification::new_set("x", "u")).await;
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[test]
    fn blank_webhook_disables_notifications() {
        assert!(notifier_for(None).is_ok());
        assert!(notifier_for(Some("   ")).is_ok());
    }
}
