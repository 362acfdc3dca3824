use std::{collections::VecDeque, time::Duration};

use tokio::time::Instant;

use crate::{
    media::types::{Frame, FrameBatch},
    params::ParameterSnapshot,
};

/// Batches kept in the rolling buffer before the oldest frames are dropped.
const BUFFERED_BATCHES: usize = 4;

/// Rolling frame buffer that cuts fixed-size batches on a schedule.
pub struct Batcher {
    batch_size: usize,
    frame_interval: Duration,
    buffer: VecDeque<(Frame, ParameterSnapshot)>,
    // previous emission, or the first frame's arrival before any emission
    anchor: Option<Instant>,
    dropped: u64,
    emitted: u64,
}

impl Batcher {
    pub fn new(batch_size: usize, frame_interval: Duration) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            batch_size,
            frame_interval,
            buffer: VecDeque::with_capacity(batch_size * BUFFERED_BATCHES),
            anchor: None,
            dropped: 0,
            emitted: 0,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn capacity(&self) -> usize {
        self.batch_size * BUFFERED_BATCHES
    }

    /// Minimum time between two batches.
    pub fn window(&self) -> Duration {
        self.frame_interval
            .saturating_mul(u32::try_from(self.batch_size).unwrap_or(u32::MAX))
    }

    /// Buffer a frame and emit a batch if one is due.
    pub fn push(
        &mut self,
        frame: Frame,
        params: ParameterSnapshot,
        now: Instant,
    ) -> Option<FrameBatch> {
        if self.anchor.is_none() {
            self.anchor = Some(frame.received_at);
        }
        self.buffer.push_back((frame, params));
        self.evict_overflow();
        self.poll(now)
    }

    /// Emit the newest `batch_size` frames if enough are buffered and the
    /// window since the previous batch has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<FrameBatch> {
        if self.buffer.len() < self.batch_size {
            return None;
        }
        let anchor = self.anchor?;
        if now.saturating_duration_since(anchor) < self.window() {
            return None;
        }

        let newest = self.buffer.split_off(self.buffer.len() - self.batch_size);
        let (frames, params): (Vec<_>, Vec<_>) = newest.into_iter().unzip();
        self.anchor = Some(now);
        self.emitted += 1;
        log::debug!(
            "batch #{} formed, {} frames left buffered",
            self.emitted,
            self.buffer.len()
        );
        Some(FrameBatch {
            frames,
            params,
            formed_at: now,
        })
    }

    /// Follow a batch size change from the parameter store.
    pub fn resize(&mut self, batch_size: usize) {
        let batch_size = batch_size.max(1);
        if batch_size == self.batch_size {
            return;
        }
        log::info!("batch size {} -> {}", self.batch_size, batch_size);
        self.batch_size = batch_size;
        self.evict_overflow();
    }

    fn evict_overflow(&mut self) {
        let excess = self.buffer.len().saturating_sub(self.capacity());
        if excess > 0 {
            self.buffer.drain(..excess);
            self.dropped += excess as u64;
            log::trace!("frame buffer full, dropped {} oldest", excess);
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Frames evicted from the rolling buffer so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Buffered frames, oldest first.
    pub fn buffered(&self) -> impl Iterator<Item = &Frame> {
        self.buffer.iter().map(|(f, _)| f)
    }
}

#[cfg(test)]
#[path = "batch_test.rs"]
mod batch_test;
