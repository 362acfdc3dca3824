use std::fmt::{Display, Formatter};

use bytes::Bytes;
use tokio::time::Instant;

use crate::{connection::ConnectionId, params::ParameterSnapshot};

/// An inbound still image that passed decoding. The encoded payload is kept
/// as-is; only the header was inspected.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedImage {
    pub width: u16,
    pub height: u16,
    pub components: u8,
    pub data: Bytes,
}

/// One accepted frame.
#[derive(Clone, Debug)]
pub struct Frame {
    pub connection: ConnectionId,
    pub received_at: Instant,
    pub image: DecodedImage,
}

impl Display for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Frame({}x{}x{}, {} bytes from {})",
            self.image.width,
            self.image.height,
            self.image.components,
            self.image.data.len(),
            self.connection
        )
    }
}

/// Exactly `batch_size` frames, each with the parameters in force when it
/// was accepted.
#[derive(Clone, Debug)]
pub struct FrameBatch {
    pub frames: Vec<Frame>,
    pub params: Vec<ParameterSnapshot>,
    pub formed_at: Instant,
}

impl FrameBatch {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// True when every frame asked to bypass the transformer.
    pub fn all_passthrough(&self) -> bool {
        !self.params.is_empty() && self.params.iter().all(|p| p.passthrough)
    }

    pub fn payloads(&self) -> Vec<Bytes> {
        self.frames.iter().map(|f| f.image.data.clone()).collect()
    }
}
