use std::net::SocketAddr;

use anyhow::Context;
use axum::Router;
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::handler::settings::{ControlState, settings_router};

/// HTTP control plane for the shared parameters.
pub struct ControlServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: ControlState,
}

impl ControlServer {
    pub async fn bind(addr: &str, state: ControlState) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind control API on {}", addr))?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            state,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn router(state: ControlState) -> Router {
        Router::new().merge(settings_router()).with_state(state)
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let app = Self::router(self.state);
            log::info!("control API started on {}", self.local_addr);
            if let Err(e) = axum::serve(self.listener, app)
                .with_graceful_shutdown(shutdown_signal(cancel))
                .await
            {
                log::error!("control API error: {}", e);
            }
        })
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    cancel.cancelled().await;
    log::info!("shutting down control API...");
}
