use std::time::Duration;

use anyhow::Context;
use serde::Serialize;

use crate::config::WebhookConfig;

const SECRET_HEADER: &str = "X-Secret-Key";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadyPayload<'a> {
    pod_id: &'a str,
}

/// Tells an orchestrator that the transformer finished warming up.
#[derive(Clone)]
pub struct ReadinessWebhook {
    client: reqwest::Client,
    config: WebhookConfig,
}

impl ReadinessWebhook {
    pub fn new(config: WebhookConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("build webhook client")?;
        Ok(Self { client, config })
    }

    pub async fn notify(&self) -> anyhow::Result<()> {
        let mut req = self.client.post(&self.config.url).json(&ReadyPayload {
            pod_id: &self.config.pod_id,
        });
        if let Some(secret) = &self.config.secret_key {
            req = req.header(SECRET_HEADER, secret);
        }
        req.send()
            .await
            .with_context(|| format!("post {}", self.config.url))?
            .error_for_status()?;
        log::info!("readiness webhook notified for pod {}", self.config.pod_id);
        Ok(())
    }

    /// Fire and forget. Failures are only logged.
    pub fn spawn_notify(&self) {
        let hook = self.clone();
        tokio::spawn(async move {
            if let Err(e) = hook.notify().await {
                log::warn!("readiness webhook failed: {:#}", e);
            }
        });
    }
}

#[cfg(test)]
#[path = "webhook_test.rs"]
mod webhook_test;
