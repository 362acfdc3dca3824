use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use stage_bus::{Stage, StageQueue};
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

use super::{BroadcastReport, Broadcaster, fan_out};
use crate::connection::{ConnectionRegistry, Outbound};

#[test]
fn test_zero_subscribers_is_a_noop() {
    let registry = ConnectionRegistry::new();
    let report = fan_out(&registry, &Bytes::from_static(b"img"));
    assert_eq!(report, BroadcastReport::default());
}

#[tokio::test]
async fn test_fan_out_delivers_skips_and_prunes() {
    let registry = ConnectionRegistry::new();
    let parent = CancellationToken::new();
    let now = Instant::now();

    let (live_tx, mut live_rx) = mpsc::channel(4);
    let live = registry.register(live_tx, &parent, now);

    let (slow_tx, _slow_rx) = mpsc::channel(1);
    let slow = registry.register(slow_tx.clone(), &parent, now);
    slow_tx.try_send(Outbound::Text("backlog".into())).unwrap();

    let (dead_tx, dead_rx) = mpsc::channel(4);
    let dead = registry.register(dead_tx, &parent, now);
    drop(dead_rx);

    let report = fan_out(&registry, &Bytes::from_static(b"img"));
    assert_eq!(report.delivered, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.dead, vec![dead.id]);

    assert_eq!(
        live_rx.recv().await,
        Some(Outbound::Frame(Bytes::from_static(b"img")))
    );
    assert!(registry.contains(live.id));
    assert!(registry.contains(slow.id));
    assert!(!registry.contains(dead.id));
    assert!(dead.cancel.is_cancelled());
    assert_eq!(registry.len(), 2);
}

#[tokio::test]
async fn test_stage_skips_stale_results() {
    let registry = Arc::new(ConnectionRegistry::new());
    let parent = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(16);
    registry.register(tx, &parent, Instant::now());

    let input = Arc::new(StageQueue::new("images", 16));
    for i in 0..5u8 {
        input.push(Bytes::from(vec![i]));
    }
    let stage = Stage::new(
        "broadcaster",
        Broadcaster::new(Arc::clone(&registry), 2),
        Arc::clone(&input),
    );
    stage.start();

    // first pop takes 0 with 4 queued; drains to 2 queued, keeping 2
    let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap();
    assert_eq!(first, Some(Outbound::Frame(Bytes::from(vec![2u8]))));
    for expected in [3u8, 4] {
        let next = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(next, Some(Outbound::Frame(Bytes::from(vec![expected]))));
    }
    stage.close(Duration::from_secs(1)).await;
}
