use std::{sync::Arc, time::Duration};

use anyhow::Context;
use bytes::Bytes;

use stage_bus::{StageContext, Worker};

use crate::{
    config::RelayConfig,
    media::FrameBatch,
    transform::FrameTransformer,
    webhook::ReadinessWebhook,
};

#[derive(Clone, Debug)]
pub struct TransformerSettings {
    /// Queued batches kept before the oldest are shed.
    pub backlog: usize,
    pub timeout: Duration,
    /// Successful runs discarded after startup.
    pub warmup_batches: usize,
}

impl From<&RelayConfig> for TransformerSettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            backlog: config.transformer_backlog(),
            timeout: config.transform_timeout(),
            warmup_batches: config.warmup_batches,
        }
    }
}

/// Runs each batch through the [`FrameTransformer`] and forwards the images one by one.
pub struct Transformer {
    collaborator: Arc<dyn FrameTransformer>,
    settings: TransformerSettings,
    webhook: Option<ReadinessWebhook>,
    runs: usize,
    failures: u64,
}

impl Transformer {
    pub fn new(collaborator: Arc<dyn FrameTransformer>, settings: TransformerSettings) -> Self {
        Self {
            collaborator,
            settings,
            webhook: None,
            runs: 0,
            failures: 0,
        }
    }

    pub fn with_webhook(mut self, webhook: Option<ReadinessWebhook>) -> Self {
        self.webhook = webhook;
        self
    }

    fn warming_up(&self) -> bool {
        self.runs < self.settings.warmup_batches
    }

    fn ready(&self) {
        log::info!("transformer {} ready", self.collaborator.name());
        if let Some(webhook) = &self.webhook {
            webhook.spawn_notify();
        }
    }

    /// Call the collaborator on a blocking thread, bounded by the timeout.
    /// A timed out call keeps its thread until the collaborator returns.
    async fn invoke(&self, batch: FrameBatch) -> anyhow::Result<Vec<Bytes>> {
        let expected = batch.len();
        let collaborator = Arc::clone(&self.collaborator);
        let call =
            tokio::task::spawn_blocking(move || collaborator.transform(&batch.frames, &batch.params));

        let images = tokio::time::timeout(self.settings.timeout, call)
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "{} timed out after {:?}",
                    self.collaborator.name(),
                    self.settings.timeout
                )
            })?
            .context("transformer call panicked")??;

        if images.len() != expected {
            anyhow::bail!(
                "{} returned {} images for a batch of {}",
                self.collaborator.name(),
                images.len(),
                expected
            );
        }
        Ok(images)
    }
}

impl Worker for Transformer {
    type Input = FrameBatch;
    type Output = Bytes;

    async fn setup(&mut self, ctx: &StageContext<FrameBatch, Bytes>) -> anyhow::Result<()> {
        if let Some(input) = ctx.input() {
            let stale = input.clear();
            if stale > 0 {
                log::info!("{}: dropped {} batches queued before start", ctx.name(), stale);
            }
        }
        if !self.warming_up() {
            self.ready();
        }
        Ok(())
    }

    async fn work(
        &mut self,
        batch: FrameBatch,
        ctx: &StageContext<FrameBatch, Bytes>,
    ) -> anyhow::Result<()> {
        if let Some(input) = ctx.input() {
            let shed = input.shed_to(self.settings.backlog);
            if shed > 0 {
                log::debug!("{}: backed up, shed {} oldest batches", ctx.name(), shed);
            }
        }

        if batch.all_passthrough() {
            for image in batch.payloads() {
                ctx.emit(image);
            }
            return Ok(());
        }

        let started = tokio::time::Instant::now();
        let images = match self.invoke(batch).await {
            Ok(images) => images,
            Err(e) => {
                self.failures += 1;
                return Err(e.context(format!("batch dropped ({} failures so far)", self.failures)));
            }
        };
        log::debug!(
            "{}: {} images in {:?}",
            ctx.name(),
            images.len(),
            started.elapsed()
        );

        if self.warming_up() {
            self.runs += 1;
            log::info!(
                "{}: warming up ({}/{}), dropping output and queued batches",
                ctx.name(),
                self.runs,
                self.settings.warmup_batches
            );
            if let Some(input) = ctx.input() {
                input.clear();
            }
            if !self.warming_up() {
                self.ready();
            }
            return Ok(());
        }

        for image in images {
            ctx.emit(image);
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "transformer_test.rs"]
mod transformer_test;
