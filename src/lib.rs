//! Real-time frame relay: websocket clients stream JPEG frames in, frames are
//! batched on a schedule, run through a slow transformer and the results are
//! fanned back out to every authenticated viewer.

pub mod api;
pub mod auth;
pub mod config;
pub mod connection;
pub mod handler;
pub mod media;
pub mod params;
pub mod protocol;
pub mod stages;
pub mod supervisor;
pub mod transform;
pub mod webhook;

pub use config::RelayConfig;
pub use supervisor::Supervisor;
