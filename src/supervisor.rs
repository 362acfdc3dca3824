use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use stage_bus::{CloseOutcome, Pipeline, PipelineBuilder, StageState};

use crate::{
    api::ControlServer,
    auth::Credential,
    config::RelayConfig,
    connection::ConnectionRegistry,
    handler::settings::ControlState,
    media::JpegProbe,
    params::{ParameterHandle, ParameterStore, ParameterWriter, Parameters},
    stages::{Broadcaster, FrameReceiver, ReceiverSettings, Transformer, TransformerSettings},
    transform::FrameTransformer,
    webhook::ReadinessWebhook,
};

/// Built but not yet started pieces of the control plane.
struct Pending {
    control: ControlServer,
    writer: ParameterWriter,
}

/// Owns the pipeline, the parameters and the control plane, and starts and
/// stops them in order.
pub struct Supervisor {
    config: RelayConfig,
    store: ParameterStore,
    handle: ParameterHandle,
    registry: Arc<ConnectionRegistry>,
    pipeline: Pipeline,
    websocket_addr: SocketAddr,
    control_addr: SocketAddr,
    control_cancel: CancellationToken,
    pending: Mutex<Option<Pending>>,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
    shutdown_requested: CancellationToken,
    shutting_down: AtomicBool,
}

impl Supervisor {
    pub async fn build(
        config: RelayConfig,
        collaborator: Arc<dyn FrameTransformer>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let credential = Credential::from_config(&config.server_password)?;

        let mut initial = match &config.prompt {
            Some(prompt) => Parameters::with_prompt(prompt),
            None => Parameters::default(),
        };
        initial.batch_size = config.batch_size;
        let (store, writer) = ParameterStore::new(initial);
        let handle = writer.handle();
        let registry = Arc::new(ConnectionRegistry::new());

        let receiver = FrameReceiver::bind(
            &config.websocket_addr(),
            ReceiverSettings::from(&config),
            credential,
            Arc::clone(&registry),
            store.clone(),
            Arc::new(JpegProbe),
        )
        .await?;
        let websocket_addr = receiver.local_addr();

        let webhook = config
            .ready_webhook
            .clone()
            .map(ReadinessWebhook::new)
            .transpose()?;
        let transformer = Transformer::new(collaborator, TransformerSettings::from(&config))
            .with_webhook(webhook);
        let broadcaster = Broadcaster::new(Arc::clone(&registry), config.broadcaster_backlog());

        let pipeline = PipelineBuilder::new("relay")
            .source("receiver", receiver, config.receiver_queue())
            .then("transformer", transformer, config.transformer_queue())
            .sink("broadcaster", broadcaster);

        let control = ControlServer::bind(
            &config.settings_addr(),
            ControlState {
                handle: handle.clone(),
                store: store.clone(),
            },
        )
        .await?;
        let control_addr = control.local_addr();

        Ok(Self {
            config,
            store,
            handle,
            registry,
            pipeline,
            websocket_addr,
            control_addr,
            control_cancel: CancellationToken::new(),
            pending: Mutex::new(Some(Pending { control, writer })),
            tasks: Mutex::new(Vec::new()),
            shutdown_requested: CancellationToken::new(),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn websocket_addr(&self) -> SocketAddr {
        self.websocket_addr
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn store(&self) -> &ParameterStore {
        &self.store
    }

    pub fn handle(&self) -> &ParameterHandle {
        &self.handle
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn states(&self) -> Vec<(String, StageState)> {
        self.pipeline.states()
    }

    /// Control plane first, then the stages in pipeline order.
    pub fn start(&self) -> anyhow::Result<()> {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(Pending { control, writer }) = pending else {
            anyhow::bail!("supervisor already started");
        };

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.push((
            "parameter writer",
            tokio::spawn(writer.run(self.control_cancel.clone())),
        ));
        tasks.push(("control API", control.spawn(self.control_cancel.clone())));
        drop(tasks);

        self.pipeline.start();
        log::info!(
            "relay running: websocket {}, control {}",
            self.websocket_addr,
            self.control_addr
        );
        Ok(())
    }

    /// Ask a running [`Supervisor::run`] to shut down.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.cancel();
    }

    /// Stop the pipeline in reverse order, then the control plane. Only the
    /// first call does anything; it returns false for every later call.
    pub async fn shutdown(&self) -> bool {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            log::debug!("shutdown already in progress");
            return false;
        }
        let timeout = self.config.close_timeout();
        log::info!("shutting down, {:?} per stage", timeout);

        for (name, outcome) in self.pipeline.close(timeout).await {
            if outcome == CloseOutcome::TimedOut {
                log::warn!("stage {} was force-terminated", name);
            }
        }

        self.control_cancel.cancel();
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for (name, mut task) in tasks {
            if tokio::time::timeout(timeout, &mut task).await.is_err() {
                log::warn!("{} did not stop within {:?}, aborting", name, timeout);
                task.abort();
            }
        }
        log::info!("shutdown complete");
        true
    }

    /// Start, wait for SIGINT/SIGTERM (or [`Supervisor::request_shutdown`]),
    /// then shut down. Signals arriving during shutdown are only logged.
    pub async fn run(&self) -> anyhow::Result<()> {
        self.start()?;

        tokio::select! {
            _ = shutdown_signal() => log::info!("received shutdown signal"),
            _ = self.shutdown_requested.cancelled() => log::info!("shutdown requested"),
        }

        let shutdown = self.shutdown();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = shutdown_signal() => log::warn!("already shutting down, signal ignored"),
            }
        }
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
#[path = "supervisor_test.rs"]
mod supervisor_test;
