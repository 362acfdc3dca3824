use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{Router, routing::any};
use tokio::{
    net::TcpListener,
    task::JoinHandle,
    time::{Instant, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use stage_bus::{StageContext, StageQueue, Worker};

use crate::{
    auth::Credential,
    config::RelayConfig,
    connection::{CloseReason, ConnectionRegistry},
    media::{Batcher, Frame, FrameBatch, FrameDecoder},
    params::{ParameterSnapshot, ParameterStore},
    stages::socket::{SocketState, ws_handler},
};

#[derive(Clone, Debug)]
pub struct ReceiverSettings {
    pub batch_size: usize,
    pub frame_interval: Duration,
    pub auth_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub outbound_buffer: usize,
}

impl From<&RelayConfig> for ReceiverSettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            frame_interval: config.frame_interval(),
            auth_timeout: config.auth_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_timeout: config.heartbeat_timeout(),
            outbound_buffer: config.outbound_buffer,
        }
    }
}

/// Source stage: terminates websocket clients and turns their frames into batches.
pub struct FrameReceiver {
    settings: ReceiverSettings,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    credential: Credential,
    registry: Arc<ConnectionRegistry>,
    store: ParameterStore,
    decoder: Arc<dyn FrameDecoder>,
    /// Accepted frames waiting for the batcher; full means the oldest goes.
    intake: Arc<StageQueue<(Frame, ParameterSnapshot)>>,
    batcher: Batcher,
    ticker: Option<Interval>,
    tasks: Vec<JoinHandle<()>>,
}

impl FrameReceiver {
    /// Bind the websocket port now so the address is known before the stage starts.
    pub async fn bind(
        addr: &str,
        settings: ReceiverSettings,
        credential: Credential,
        registry: Arc<ConnectionRegistry>,
        store: ParameterStore,
        decoder: Arc<dyn FrameDecoder>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind websocket listener on {}", addr))?;
        let local_addr = listener.local_addr()?;
        let intake = Arc::new(StageQueue::new(
            "receiver.intake",
            settings.batch_size.max(1) * 4,
        ));
        let batcher = Batcher::new(settings.batch_size, settings.frame_interval);
        Ok(Self {
            settings,
            listener: Some(listener),
            local_addr,
            credential,
            registry,
            store,
            decoder,
            intake,
            batcher,
            ticker: None,
            tasks: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn emit(&self, batch: FrameBatch, ctx: &StageContext<(), FrameBatch>) {
        log::debug!(
            "{}: emitting batch of {} ({} buffered, {} dropped so far)",
            ctx.name(),
            batch.len(),
            self.batcher.len(),
            self.batcher.dropped()
        );
        ctx.emit(batch);
    }
}

impl Worker for FrameReceiver {
    type Input = ();
    type Output = FrameBatch;

    async fn setup(&mut self, ctx: &StageContext<(), FrameBatch>) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .context("websocket listener already consumed")?;
        let cancel = ctx.cancel_token().clone();

        let state = SocketState {
            credential: self.credential.clone(),
            registry: Arc::clone(&self.registry),
            store: self.store.clone(),
            decoder: Arc::clone(&self.decoder),
            intake: Arc::clone(&self.intake),
            cancel: cancel.clone(),
            frame_interval: self.settings.frame_interval,
            auth_timeout: self.settings.auth_timeout,
            outbound_buffer: self.settings.outbound_buffer.max(1),
        };
        let app = Router::new()
            .route("/", any(ws_handler))
            .route("/ws", any(ws_handler))
            .with_state(state);

        let server_cancel = cancel.clone();
        let addr = self.local_addr;
        self.tasks.push(tokio::spawn(async move {
            log::info!("websocket server listening on {}", addr);
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_cancel.cancelled().await })
                .await
            {
                log::error!("websocket server error: {}", e);
            }
        }));

        self.tasks.push(tokio::spawn(heartbeat_monitor(
            Arc::clone(&self.registry),
            self.settings.heartbeat_interval,
            self.settings.heartbeat_timeout,
            cancel,
        )));

        let mut ticker = tokio::time::interval(self.settings.frame_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);
        Ok(())
    }

    async fn work(&mut self, _item: (), ctx: &StageContext<(), FrameBatch>) -> anyhow::Result<()> {
        let Some(ticker) = self.ticker.as_mut() else {
            anyhow::bail!("receiver ticker missing");
        };
        let batch = tokio::select! {
            biased;
            _ = ctx.cancelled() => None,
            (frame, params) = self.intake.pop() => {
                self.batcher.resize(params.batch_size);
                self.batcher.push(frame, params, Instant::now())
            },
            _ = ticker.tick() => self.batcher.poll(Instant::now()),
        };
        if let Some(batch) = batch {
            self.emit(batch, ctx);
        }
        Ok(())
    }

    fn cleanup(&mut self) {
        self.registry.close_all(CloseReason::SHUTDOWN);
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Close every connection whose last liveness message is older than `timeout`.
async fn heartbeat_monitor(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let expired = registry.expire_stale(Instant::now(), timeout);
                if !expired.is_empty() {
                    log::info!("heartbeat: expired {} connections, {} active", expired.len(), registry.len());
                }
            },
        }
    }
}

#[cfg(test)]
#[path = "receiver_test.rs"]
mod receiver_test;
