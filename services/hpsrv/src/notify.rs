//! Operator notifications
//!
//! Recovery sequences report their outcome through a `Notifier`. Delivery is
//! best effort: failures are logged by the caller and never retried.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{HpSrvError, Result};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Notification {
    pub subject: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync + Debug {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Writes notifications to the service log
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        warn!("{}: {}", notification.subject, notification.body);
        Ok(())
    }
}

/// POSTs notifications as JSON to a webhook
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(HpSrvError::config(format!("Invalid webhook URL: {url}")));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        self.client
            .post(&self.url)
            .json(notification)
            .send()
            .await?
            .error_for_status()?;
        info!("Notification sent: {}", notification.subject);
        Ok(())
    }
}

/// Build the notifier for an optional webhook URL
pub fn from_config(webhook_url: Option<&str>) -> Result<Box<dyn Notifier>> {
    match webhook_url {
        Some(url) => Ok(Box::new(WebhookNotifier::new(url)?)),
        None => Ok(Box::new(LogNotifier)),
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn test_log_notifier_logs_subject() {
        LogNotifier
            .notify(&Notification::new("Heat Pump Failure", "inverter still offline"))
            .await
            .unwrap();
        assert!(logs_contain("Heat Pump Failure: inverter still offline"));
    }

    #[test]
    fn test_webhook_url_is_checked() {
        assert!(WebhookNotifier::new("ftp://example").is_err());
        assert!(WebhookNotifier::new("http://localhost:9000/hook").is_ok());
        assert!(from_config(None).is_ok());
    }

    #[test]
    fn test_notification_serializes() {
        let value = serde_json::to_value(Notification::new("s", "b")).unwrap();
        assert_eq!(value["subject"], "s");
        assert_eq!(value["body"], "b");
        assert!(value["timestamp"].is_string());
    }
}
