use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_PROMPT: &str = "A psychedelic landscape.";

/// Tunable inference parameters shared between the control plane and the pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Parameters {
    /// Effective prompt handed to the transformer (derived from the two prompts and the blend).
    pub prompt: String,
    pub primary_prompt: String,
    pub secondary_prompt: String,
    pub blend: f32,
    pub seed: u64,
    pub fixed_seed: bool,
    pub batch_size: usize,
    pub strength: f32,
    pub num_inference_steps: u32,
    pub passthrough: bool,
    pub compel: bool,
    pub mirror: bool,
    pub debug: bool,
    pub opacity: f32,
    pub tint_color_1: [u8; 3],
    pub tint_color_2: [u8; 3],
    pub tint_strength: f32,
    pub tint_interval_secs: f32,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            prompt: DEFAULT_PROMPT.to_string(),
            primary_prompt: DEFAULT_PROMPT.to_string(),
            secondary_prompt: DEFAULT_PROMPT.to_string(),
            blend: 0.0,
            seed: 0,
            fixed_seed: true,
            batch_size: 4,
            strength: 0.7,
            num_inference_steps: 2,
            passthrough: false,
            compel: true,
            mirror: false,
            debug: false,
            opacity: 1.0,
            tint_color_1: [255, 0, 128],
            tint_color_2: [0, 128, 255],
            tint_strength: 0.0,
            tint_interval_secs: 5.0,
        }
    }
}

impl Parameters {
    pub fn with_prompt(prompt: &str) -> Self {
        let mut params = Self {
            primary_prompt: prompt.to_string(),
            ..Default::default()
        };
        params.blend_prompt();
        params
    }

    /// Validate `update` and fold it in. On error `self` is left untouched.
    pub fn apply(&mut self, update: ParameterUpdate) -> anyhow::Result<()> {
        match update {
            ParameterUpdate::Prompt(prompt) => {
                self.primary_prompt = non_empty_prompt(prompt)?;
                self.blend_prompt();
            }
            ParameterUpdate::SecondPrompt(prompt) => {
                self.secondary_prompt = non_empty_prompt(prompt)?;
                self.blend_prompt();
            }
            ParameterUpdate::Blend(t) => {
                if !(0.0..=1.0).contains(&t) {
                    anyhow::bail!("Blend value must be between 0 and 1");
                }
                self.blend = t;
                self.blend_prompt();
            }
            ParameterUpdate::Seed(seed) => self.seed = seed,
            ParameterUpdate::FixedSeed(on) => self.fixed_seed = on,
            ParameterUpdate::BatchSize(size) => {
                if size == 0 {
                    anyhow::bail!("batch size must be at least 1");
                }
                self.batch_size = size;
            }
            ParameterUpdate::Strength(strength) => {
                if !(strength > 0.0 && strength <= 1.0) {
                    anyhow::bail!("strength must be in (0, 1]");
                }
                self.strength = strength;
            }
            ParameterUpdate::Steps(steps) => {
                if steps == 0 {
                    anyhow::bail!("steps must be at least 1");
                }
                self.num_inference_steps = steps;
            }
            ParameterUpdate::Passthrough(on) => self.passthrough = on,
            ParameterUpdate::Compel(on) => self.compel = on,
            ParameterUpdate::Mirror(on) => self.mirror = on,
            ParameterUpdate::Debug(on) => self.debug = on,
            ParameterUpdate::Opacity(opacity) => {
                if opacity.is_nan() {
                    anyhow::bail!("opacity must be a number");
                }
                self.opacity = opacity.clamp(0.0, 1.0);
            }
            ParameterUpdate::Tint {
                color_1,
                color_2,
                strength,
                interval_secs,
            } => {
                if !(0.0..=1.0).contains(&strength) {
                    anyhow::bail!("tint strength must be between 0 and 1");
                }
                if !(interval_secs > 0.0) {
                    anyhow::bail!("tint interval must be positive");
                }
                self.tint_color_1 = color_1;
                self.tint_color_2 = color_2;
                self.tint_strength = strength;
                self.tint_interval_secs = interval_secs;
            }
        }
        Ok(())
    }

    /// Recompute `prompt` from the two source prompts and the blend factor.
    fn blend_prompt(&mut self) {
        let t = self.blend;
        self.prompt = if t <= 0.0 {
            self.primary_prompt.clone()
        } else if t >= 1.0 {
            self.secondary_prompt.clone()
        } else {
            format!(
                "(\"{}\", \"{}\").blend({:.2}, {:.2})",
                self.primary_prompt,
                self.secondary_prompt,
                1.0 - t,
                t
            )
        };
    }
}

fn non_empty_prompt(prompt: String) -> anyhow::Result<String> {
    let prompt = prompt.trim();
    if prompt.is_empty() {
        anyhow::bail!("prompt must not be empty");
    }
    Ok(prompt.to_string())
}

#[derive(Clone, Debug, PartialEq)]
pub enum ParameterUpdate {
    Prompt(String),
    SecondPrompt(String),
    Blend(f32),
    Seed(u64),
    FixedSeed(bool),
    BatchSize(usize),
    Strength(f32),
    Steps(u32),
    Passthrough(bool),
    Compel(bool),
    Mirror(bool),
    Debug(bool),
    Opacity(f32),
    Tint {
        color_1: [u8; 3],
        color_2: [u8; 3],
        strength: f32,
        interval_secs: f32,
    },
}

/// Immutable point-in-time copy of [`Parameters`].
pub type ParameterSnapshot = Arc<Parameters>;

/// Read side of the shared parameters. Cloning is cheap.
#[derive(Clone)]
pub struct ParameterStore {
    rx: watch::Receiver<ParameterSnapshot>,
}

impl ParameterStore {
    /// Create the store together with its only writer.
    pub fn new(initial: Parameters) -> (Self, ParameterWriter) {
        let (tx, rx) = watch::channel(Arc::new(initial));
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let writer = ParameterWriter {
            tx,
            cmd_tx,
            cmd_rx,
        };
        (Self { rx }, writer)
    }

    pub fn snapshot(&self) -> ParameterSnapshot {
        Arc::clone(&self.rx.borrow())
    }

    /// Watch for published changes.
    pub fn subscribe(&self) -> watch::Receiver<ParameterSnapshot> {
        self.rx.clone()
    }
}

struct ParameterCommand {
    update: ParameterUpdate,
    result: oneshot::Sender<anyhow::Result<ParameterSnapshot>>,
}

/// The single writer. Every update goes through here, one at a time.
pub struct ParameterWriter {
    tx: watch::Sender<ParameterSnapshot>,
    cmd_tx: mpsc::Sender<ParameterCommand>,
    cmd_rx: mpsc::Receiver<ParameterCommand>,
}

impl ParameterWriter {
    pub fn handle(&self) -> ParameterHandle {
        ParameterHandle {
            tx: self.cmd_tx.clone(),
        }
    }

    /// Validate and publish one update.
    pub fn apply(&self, update: ParameterUpdate) -> anyhow::Result<ParameterSnapshot> {
        let mut next = Parameters::clone(&self.tx.borrow());
        next.apply(update.clone())?;
        let snapshot = Arc::new(next);
        self.tx.send_replace(Arc::clone(&snapshot));
        log::info!("parameters updated: {:?}", update);
        Ok(snapshot)
    }

    /// Serve updates from every [`ParameterHandle`] until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break;
                },
                Some(cmd) = self.cmd_rx.recv() => {
                    let result = self.apply(cmd.update);
                    if let Err(e) = &result {
                        log::warn!("rejected parameter update: {:#}", e);
                    }
                    if cmd.result.send(result).is_err() {
                        log::debug!("parameter update caller went away");
                    }
                },
            }
        }
        log::info!("parameter writer stopped");
    }
}

/// Submit updates to the [`ParameterWriter`] from anywhere.
#[derive(Clone)]
pub struct ParameterHandle {
    tx: mpsc::Sender<ParameterCommand>,
}

impl ParameterHandle {
    pub async fn apply(&self, update: ParameterUpdate) -> anyhow::Result<ParameterSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ParameterCommand { update, result: tx })
            .await
            .map_err(|_| anyhow::anyhow!("parameter writer is not running"))?;
        rx.await?
    }
}

#[cfg(test)]
#[path = "params_test.rs"]
mod params_test;
