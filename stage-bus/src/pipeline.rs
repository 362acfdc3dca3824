//! Statically wired stage pipelines.
//!
//! ```text
//!   source ──► [queue] ──► then ──► [queue] ──► then ──► ... ──► sink
//! ```
//!
//! Each `then`/`sink` step only compiles when the new worker's `Input` is the
//! previous worker's `Output`; the hand-off queue between two stages is
//! created at that point and owned jointly by both.

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::{
    queue::StageQueue,
    stage::{CloseOutcome, Stage, StageControl, StageState, Worker},
};

pub struct PipelineBuilder {
    name: String,
    cancel: CancellationToken,
}

impl PipelineBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            cancel: CancellationToken::new(),
        }
    }

    /// Make every stage's cancellation a child of `parent`.
    pub fn with_cancel(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    /// First stage; its output queue holds at most `capacity` items.
    pub fn source<W>(self, name: &str, worker: W, capacity: usize) -> PipelineChain<W::Output>
    where
        W: Worker<Input = ()>,
    {
        let output = Arc::new(StageQueue::new(&format!("{}.out", name), capacity));
        let stage = Stage::source(name, worker)
            .with_parent(&self.cancel)
            .with_output(Arc::clone(&output));
        PipelineChain {
            name: self.name,
            cancel: self.cancel,
            stages: vec![Arc::new(stage)],
            tail: output,
        }
    }
}

pub struct PipelineChain<T> {
    name: String,
    cancel: CancellationToken,
    stages: Vec<Arc<dyn StageControl>>,
    tail: Arc<StageQueue<T>>,
}

impl<T: Send + 'static> PipelineChain<T> {
    /// Append a stage fed by the current tail. Its own output queue holds at
    /// most `capacity` items.
    pub fn then<W>(mut self, name: &str, worker: W, capacity: usize) -> PipelineChain<W::Output>
    where
        W: Worker<Input = T>,
    {
        let output = Arc::new(StageQueue::new(&format!("{}.out", name), capacity));
        let stage = Stage::new(name, worker, self.tail)
            .with_parent(&self.cancel)
            .with_output(Arc::clone(&output));
        self.stages.push(Arc::new(stage));
        PipelineChain {
            name: self.name,
            cancel: self.cancel,
            stages: self.stages,
            tail: output,
        }
    }

    /// Append the terminal stage and finish the pipeline.
    pub fn sink<W>(mut self, name: &str, worker: W) -> Pipeline
    where
        W: Worker<Input = T>,
    {
        let stage = Stage::new(name, worker, self.tail).with_parent(&self.cancel);
        self.stages.push(Arc::new(stage));
        Pipeline {
            name: self.name,
            cancel: self.cancel,
            stages: self.stages,
        }
    }

    /// The queue the next stage would read from.
    pub fn tail(&self) -> Arc<StageQueue<T>> {
        Arc::clone(&self.tail)
    }

    /// Finish without a sink; the caller drains [`PipelineChain::tail`] itself.
    pub fn build(self) -> (Pipeline, Arc<StageQueue<T>>) {
        let pipeline = Pipeline {
            name: self.name,
            cancel: self.cancel,
            stages: self.stages,
        };
        (pipeline, self.tail)
    }
}

pub struct Pipeline {
    name: String,
    cancel: CancellationToken,
    stages: Vec<Arc<dyn StageControl>>,
}

impl Pipeline {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[Arc<dyn StageControl>] {
        &self.stages
    }

    /// Start every stage in composition order.
    pub fn start(&self) {
        for stage in &self.stages {
            if stage.start() {
                log::info!("{}: started stage {}", self.name, stage.name());
            }
        }
    }

    /// Signal every stage without waiting.
    pub fn stop(&self) {
        self.cancel.cancel();
        for stage in self.stages.iter().rev() {
            stage.stop();
        }
    }

    /// Stop everything, then join stages in reverse order. A stage that does
    /// not finish within `timeout` is aborted.
    pub async fn close(&self, timeout: Duration) -> Vec<(String, CloseOutcome)> {
        self.stop();

        let mut outcomes = Vec::with_capacity(self.stages.len());
        for stage in self.stages.iter().rev() {
            let outcome = stage.close(timeout).await;
            match outcome {
                CloseOutcome::TimedOut => {
                    log::error!(
                        "{}: stage {} ignored stop for {:?}, terminating",
                        self.name,
                        stage.name(),
                        timeout
                    );
                    stage.terminate();
                }
                CloseOutcome::Panicked => {
                    log::error!("{}: stage {} had panicked", self.name, stage.name());
                }
                _ => log::info!("{}: stage {} closed ({:?})", self.name, stage.name(), outcome),
            }
            outcomes.push((stage.name().to_string(), outcome));
        }
        outcomes
    }

    pub fn states(&self) -> Vec<(String, StageState)> {
        self.stages
            .iter()
            .map(|s| (s.name().to_string(), s.state()))
            .collect()
    }
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
