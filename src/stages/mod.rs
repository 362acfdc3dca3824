//! The three relay stages.
//!
//! ```text
//! FrameReceiver ──► [FrameBatch queue, 3 x B] ──► Transformer ──► [image queue, 4 x B] ──► Broadcaster
//!      ▲                                                                                        │
//!      └──────────────────────── ConnectionRegistry (authenticated viewers) ◄──────────────────┘
//! ```

pub mod broadcaster;
pub mod receiver;
mod socket;
pub mod transformer;

pub use broadcaster::{BroadcastReport, Broadcaster, fan_out};
pub use receiver::{FrameReceiver, ReceiverSettings};
pub use transformer::{Transformer, TransformerSettings};
