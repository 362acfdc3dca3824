use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;

use stage_bus::{StageContext, Worker};

use crate::connection::{ConnectionId, ConnectionRegistry, Outbound};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Subscribers whose outbound buffer was full; they miss this image only.
    pub skipped: usize,
    pub dead: Vec<ConnectionId>,
}

/// Send `image` to every authenticated connection, then prune the ones found dead.
pub fn fan_out(registry: &ConnectionRegistry, image: &Bytes) -> BroadcastReport {
    let mut report = BroadcastReport::default();
    for (id, outbound) in registry.subscribers() {
        match outbound.try_send(Outbound::Frame(image.clone())) {
            Ok(()) => report.delivered += 1,
            Err(TrySendError::Full(_)) => {
                log::trace!("connection {} is slow, skipped one image", id);
                report.skipped += 1;
            }
            Err(TrySendError::Closed(_)) => report.dead.push(id),
        }
    }
    if !report.dead.is_empty() {
        registry.prune(&report.dead);
    }
    report
}

/// Sink stage: pushes the newest transformed image to every viewer.
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    backlog: usize,
    stale: u64,
}

impl Broadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>, backlog: usize) -> Self {
        Self {
            registry,
            backlog,
            stale: 0,
        }
    }
}

impl Worker for Broadcaster {
    type Input = Bytes;
    type Output = ();

    async fn work(&mut self, image: Bytes, ctx: &StageContext<Bytes, ()>) -> anyhow::Result<()> {
        let mut latest = image;
        if let Some(input) = ctx.input() {
            while let Some(newer) = input.pop_if_longer_than(self.backlog) {
                latest = newer;
                self.stale += 1;
            }
        }

        let report = fan_out(&self.registry, &latest);
        if report.skipped > 0 || !report.dead.is_empty() {
            log::debug!(
                "{}: delivered {}, skipped {}, dead {} ({} stale images dropped so far)",
                ctx.name(),
                report.delivered,
                report.skipped,
                report.dead.len(),
                self.stale
            );
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "broadcaster_test.rs"]
mod broadcaster_test;
