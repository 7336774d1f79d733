use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Hand-off to the push transport for a viewer who is not looking at the thread.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushNotification {
    pub user_id: Uuid,
    pub conversation_id: Uuid,
    pub title: String,
    pub body: String,
    pub unread_count: i64,
}

#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn notify(&self, notification: &PushNotification) -> AppResult<()>;
}

/// Default notifier: records the hand-off in the log only.
#[derive(Debug, Default, Clone)]
pub struct LogPushNotifier;

#[async_trait]
impl PushNotifier for LogPushNotifier {
    async fn notify(&self, notification: &PushNotification) -> AppResult<()> {
        tracing::info!(
            user_id = %notification.user_id,
            conversation_id = %notification.conversation_id,
            unread_count = notification.unread_count,
            "push notification"
        );
        Ok(())
    }
}

/// POSTs each notification as JSON to an external push gateway.
#[derive(Clone)]
pub struct WebhookPushNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookPushNotifier {
    pub fn new(url: impl Into<String>) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| AppError::Config(format!("push client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl PushNotifier for WebhookPushNotifier {
    async fn notify(&self, notification: &PushNotification) -> AppResult<()> {
        let response = self
            .client
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .map_err(|e| AppError::ServiceUnavailable(format!("push gateway: {e}")))?;

        if !response.status().is_success() {
            return Err(AppError::ServiceUnavailable(format!(
                "push gateway returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Fire-and-forget delivery; failures are logged per notification.
pub fn spawn_pushes(notifier: Arc<dyn PushNotifier>, pushes: Vec<PushNotification>) {
    if pushes.is_empty() {
        return;
    }
    tokio::spawn(async move {
        for push in pushes {
            if let Err(e) = notifier.notify(&push).await {
                crate::metrics::record_broadcast_failure("push");
                tracing::warn!(user_id = %push.user_id, error = %e, "push hand-off failed");
            }
        }
    });
}
