//! Lifecycle-managed pipeline stages connected by bounded drop-oldest queues.

pub mod pipeline;
pub mod queue;
pub mod stage;

pub use pipeline::{Pipeline, PipelineBuilder, PipelineChain};
pub use queue::StageQueue;
pub use stage::{CloseOutcome, Stage, StageContext, StageControl, StageState, Worker};
