use std::sync::Arc;

use frame_relay::{
    config::{self, RelayConfig},
    supervisor::Supervisor,
    transform::{FrameTransformer, HttpTransformer, Passthrough},
};

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .filter_module("frame_relay", log::LevelFilter::Debug)
        .filter_module("stage_bus", log::LevelFilter::Info)
        .parse_default_env()
        .init();
}

fn transformer(config: &RelayConfig) -> anyhow::Result<Arc<dyn FrameTransformer>> {
    match &config.transformer_url {
        Some(url) => {
            let http = HttpTransformer::new(url, config.transform_timeout())?;
            log::info!("transforming frames with {}", url);
            Ok(Arc::new(http))
        }
        None => {
            log::warn!("TRANSFORMER_URL not set, frames are relayed unchanged");
            Ok(Arc::new(Passthrough))
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let config = config::load()?;
    let collaborator = transformer(&config)?;
    let supervisor = Supervisor::build(config, collaborator).await?;
    supervisor.run().await
}

#[tokio::main]
async fn main() -> ! {
    init_logging();

    let code = match run().await {
        Ok(()) => 0,
        Err(e) => {
            log::error!("frame-relay failed: {:#}", e);
            1
        }
    };

    // collaborator calls that outlived their timeout still hold blocking threads
    std::process::exit(code);
}
