//! Frame handling between the websocket and the transformer.
//!
//! Data Flow:
//! ```text
//! binary message ──► FrameDecoder ──► Frame ──► Batcher (rolling buffer, 4 x B)
//!                                                  │
//!                                                  └─► FrameBatch (newest B frames,
//!                                                      one ParameterSnapshot each)
//! ```
//!
//! Batches form only when at least B frames are buffered and
//! `frame_interval x B` passed since the previous batch.

pub mod batch;
pub mod codec;
pub mod types;

pub use batch::Batcher;
pub use codec::{FrameDecoder, JpegProbe};
pub use types::{DecodedImage, Frame, FrameBatch};
