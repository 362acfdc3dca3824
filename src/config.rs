use std::{path::Path, str::FromStr, time::Duration};

use anyhow::Context;
use serde::Deserialize;

/// Environment variable naming an optional JSON config file.
pub const CONFIG_FILE_ENV: &str = "FRAME_RELAY_CONFIG";

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub host: String,
    pub websocket_port: u16,
    pub settings_port: u16,
    /// Plain password, or an argon2 PHC string (`$argon2id$...`).
    pub server_password: String,

    pub batch_size: usize,
    pub frame_interval_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub auth_timeout_secs: u64,
    /// Per-connection outbound frames buffered before that viewer starts skipping.
    pub outbound_buffer: usize,

    /// Receiver -> transformer queue. Defaults to 3 x batch size.
    pub receiver_queue: Option<usize>,
    /// Batches the transformer keeps before shedding. Defaults to 2 x batch size.
    pub transformer_backlog: Option<usize>,
    /// Transformer -> broadcaster queue. Defaults to 4 x batch size.
    pub transformer_queue: Option<usize>,
    /// Results the broadcaster keeps before skipping stale ones. Defaults to batch size.
    pub broadcaster_backlog: Option<usize>,

    pub warmup_batches: usize,
    pub transform_timeout_secs: u64,
    pub close_timeout_secs: u64,

    /// Remote inference endpoint; frames are passed through unchanged when unset.
    pub transformer_url: Option<String>,
    pub prompt: Option<String>,
    pub ready_webhook: Option<WebhookConfig>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct WebhookConfig {
    pub url: String,
    pub pod_id: String,
    pub secret_key: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            websocket_port: 8765,
            settings_port: 5556,
            server_password: String::new(),
            batch_size: 4,
            frame_interval_ms: 250,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            auth_timeout_secs: 10,
            outbound_buffer: 2,
            receiver_queue: None,
            transformer_backlog: None,
            transformer_queue: None,
            broadcaster_backlog: None,
            warmup_batches: 2,
            transform_timeout_secs: 30,
            close_timeout_secs: 10,
            transformer_url: None,
            prompt: None,
            ready_webhook: None,
        }
    }
}

impl RelayConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse config file {}", path.display()))
    }

    /// Overlay values from `lookup` (normally the process environment).
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SERVER_PASSWORD") {
            self.server_password = v;
        }
        if let Some(v) = lookup("HOST") {
            self.host = v;
        }
        set_parsed(&lookup, "WEBSOCKET_PORT", &mut self.websocket_port)?;
        set_parsed(&lookup, "SETTINGS_PORT", &mut self.settings_port)?;
        set_parsed(&lookup, "BATCH_SIZE", &mut self.batch_size)?;
        set_parsed(&lookup, "FRAME_INTERVAL_MS", &mut self.frame_interval_ms)?;
        set_parsed(&lookup, "HEARTBEAT_INTERVAL_SECS", &mut self.heartbeat_interval_secs)?;
        set_parsed(&lookup, "HEARTBEAT_TIMEOUT_SECS", &mut self.heartbeat_timeout_secs)?;
        set_parsed(&lookup, "AUTH_TIMEOUT_SECS", &mut self.auth_timeout_secs)?;
        set_parsed(&lookup, "WARMUP_BATCHES", &mut self.warmup_batches)?;
        set_parsed(&lookup, "TRANSFORM_TIMEOUT_SECS", &mut self.transform_timeout_secs)?;
        set_parsed(&lookup, "CLOSE_TIMEOUT_SECS", &mut self.close_timeout_secs)?;
        if let Some(v) = lookup("TRANSFORMER_URL") {
            self.transformer_url = Some(v);
        }
        if let Some(v) = lookup("PROMPT") {
            self.prompt = Some(v);
        }
        if let Some(url) = lookup("READY_WEBHOOK_URL") {
            self.ready_webhook = Some(WebhookConfig {
                url,
                pod_id: lookup("RUNPOD_POD_ID").unwrap_or_default(),
                secret_key: lookup("READY_WEBHOOK_SECRET_KEY"),
            });
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server_password.is_empty() {
            anyhow::bail!("SERVER_PASSWORD must be set in the environment or config file");
        }
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be at least 1");
        }
        if self.frame_interval_ms == 0 {
            anyhow::bail!("frame_interval_ms must be at least 1");
        }
        if self.heartbeat_interval_secs == 0 || self.heartbeat_timeout_secs == 0 {
            anyhow::bail!("heartbeat interval and timeout must be positive");
        }
        Ok(())
    }

    pub fn websocket_addr(&self) -> String {
        format!("{}:{}", self.host, self.websocket_port)
    }

    pub fn settings_addr(&self) -> String {
        format!("{}:{}", self.host, self.settings_port)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn transform_timeout(&self) -> Duration {
        Duration::from_secs(self.transform_timeout_secs)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }

    pub fn receiver_queue(&self) -> usize {
        self.receiver_queue.unwrap_or(self.batch_size * 3)
    }

    pub fn transformer_backlog(&self) -> usize {
        self.transformer_backlog.unwrap_or(self.batch_size * 2)
    }

    pub fn transformer_queue(&self) -> usize {
        self.transformer_queue.unwrap_or(self.batch_size * 4)
    }

    pub fn broadcaster_backlog(&self) -> usize {
        self.broadcaster_backlog.unwrap_or(self.batch_size)
    }
}

fn set_parsed<F, T>(lookup: &F, key: &str, slot: &mut T) -> anyhow::Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: {:?}", key, raw))?;
    }
    Ok(())
}

/// Load from the optional config file, then the environment.
pub fn load() -> anyhow::Result<RelayConfig> {
    let mut config = match std::env::var(CONFIG_FILE_ENV) {
        Ok(path) => RelayConfig::from_file(path)?,
        Err(_) => RelayConfig::default(),
    };
    config.apply_env(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
