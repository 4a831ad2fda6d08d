// Alerting for DMPool
// Escalates persistent payout failures and reorgs to an external channel

use crate::config::AlertsConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

const MAX_HISTORY: usize = 200;

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertLevel::Info => write!(f, "INFO"),
            AlertLevel::Warning => write!(f, "WARNING"),
            AlertLevel::Critical => write!(f, "CRITICAL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub level: AlertLevel,
    pub title: String,
    pub message: String,
    pub payout_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(level: AlertLevel, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            level,
            title: title.into(),
            message: message.into(),
            payout_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn for_payout(mut self, payout_id: Uuid) -> Self {
        self.payout_id = Some(payout_id);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("Webhook request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Webhook returned status {0}")]
    Status(u16),
}

/// Delivery channel for alerts
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: &Alert) -> Result<(), AlertError>;
}

/// Writes alerts to the log only
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        match alert.level {
            AlertLevel::Info => info!("[ALERT] {}: {}", alert.title, alert.message),
            AlertLevel::Warning => warn!("[ALERT] {}: {}", alert.title, alert.message),
            AlertLevel::Critical => error!("[ALERT] {}: {}", alert.title, alert.message),
        }
        Ok(())
    }
}

/// POSTs alerts as JSON to a webhook
pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: String,
    headers: HashMap<String, String>,
}

impl WebhookAlertSink {
    pub fn new(url: String, headers: HashMap<String, String>) -> Result<Self, AlertError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url,
            headers,
        })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        let mut request = self.client.post(&self.url).json(alert);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(AlertError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Raises alerts through a sink and keeps a bounded history
pub struct AlertManager {
    sink: Arc<dyn AlertSink>,
    history: RwLock<VecDeque<Alert>>,
}

impl AlertManager {
    pub fn new(sink: Arc<dyn AlertSink>) -> Self {
        Self {
            sink,
            history: RwLock::new(VecDeque::new()),
        }
    }

    pub fn from_config(config: &AlertsConfig) -> Result<Self, AlertError> {
        let sink: Arc<dyn AlertSink> = match &config.webhook_url {
            Some(url) => Arc::new(WebhookAlertSink::new(
                url.clone(),
                config.webhook_headers.clone(),
            )?),
            None => Arc::new(LogAlertSink),
        };
        Ok(Self::new(sink))
    }

    /// Record and deliver an alert. Delivery failures are logged, not returned.
    pub async fn raise(&self, alert: Alert) {
        {
            let mut history = self.history.write().await;
            history.push_back(alert.clone());
            while history.len() > MAX_HISTORY {
                history.pop_front();
            }
        }
        if let Err(e) = self.sink.send(&alert).await {
            error!("Failed to deliver {} alert '{}': {}", alert.level, alert.title, e);
        }
    }

    /// Most recent first
    pub async fn recent(&self, limit: usize) -> Vec<Alert> {
        self.history
            .read()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }
}
