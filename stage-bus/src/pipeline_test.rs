use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use super::PipelineBuilder;
use crate::stage::{CloseOutcome, StageContext, StageState, Worker};

struct Counter {
    next: u32,
    limit: u32,
}

impl Worker for Counter {
    type Input = ();
    type Output = u32;

    async fn work(&mut self, _item: (), ctx: &StageContext<(), u32>) -> anyhow::Result<()> {
        if self.next < self.limit {
            ctx.emit(self.next);
            self.next += 1;
            tokio::task::yield_now().await;
        } else {
            ctx.cancelled().await;
        }
        Ok(())
    }
}

struct Label;

impl Worker for Label {
    type Input = u32;
    type Output = String;

    async fn work(&mut self, item: u32, ctx: &StageContext<u32, String>) -> anyhow::Result<()> {
        ctx.emit(format!("#{}", item));
        Ok(())
    }
}

struct Collect {
    seen: Arc<Mutex<Vec<String>>>,
    cleanups: Arc<AtomicUsize>,
    order: Arc<Mutex<Vec<&'static str>>>,
}

impl Worker for Collect {
    type Input = String;
    type Output = ();

    async fn work(&mut self, item: String, _ctx: &StageContext<String, ()>) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(item);
        Ok(())
    }

    fn cleanup(&mut self) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        self.order.lock().unwrap().push("collect");
    }
}

struct Hang;

impl Worker for Hang {
    type Input = u32;
    type Output = ();

    async fn work(&mut self, _item: u32, _ctx: &StageContext<u32, ()>) -> anyhow::Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

#[tokio::test]
async fn test_items_flow_through_all_stages() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let cleanups = Arc::new(AtomicUsize::new(0));
    let order = Arc::new(Mutex::new(Vec::new()));

    let pipeline = PipelineBuilder::new("test")
        .source("counter", Counter { next: 0, limit: 3 }, 16)
        .then("label", Label, 16)
        .sink(
            "collect",
            Collect {
                seen: Arc::clone(&seen),
                cleanups: Arc::clone(&cleanups),
                order: Arc::clone(&order),
            },
        );
    assert_eq!(pipeline.stages().len(), 3);
    pipeline.start();

    tokio::time::timeout(Duration::from_secs(2), async {
        while seen.lock().unwrap().len() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("items should reach the sink");
    assert_eq!(*seen.lock().unwrap(), vec!["#0", "#1", "#2"]);

    let outcomes = pipeline.close(Duration::from_secs(1)).await;
    let names: Vec<_> = outcomes.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["collect", "label", "counter"]);
    assert!(outcomes.iter().all(|(_, o)| *o == CloseOutcome::Joined));
    assert!(
        pipeline
            .states()
            .iter()
            .all(|(_, s)| *s == StageState::Stopped)
    );
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_build_exposes_tail_queue() {
    let (pipeline, tail) = PipelineBuilder::new("test")
        .source("counter", Counter { next: 0, limit: 2 }, 4)
        .then("label", Label, 4)
        .build();
    pipeline.start();

    let first = tokio::time::timeout(Duration::from_secs(1), tail.pop())
        .await
        .unwrap();
    assert_eq!(first, "#0");
    pipeline.close(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_close_escalates_for_hung_stage() {
    let pipeline = PipelineBuilder::new("test")
        .source("counter", Counter { next: 0, limit: 1 }, 4)
        .sink("hang", Hang);
    pipeline.start();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let outcomes = pipeline.close(Duration::from_millis(50)).await;
    assert_eq!(outcomes[0], ("hang".to_string(), CloseOutcome::TimedOut));
    assert_eq!(outcomes[1], ("counter".to_string(), CloseOutcome::Joined));

    tokio::time::timeout(Duration::from_secs(1), async {
        while pipeline.states()[1].1 != StageState::Stopped {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("terminated stage should settle");
}

#[tokio::test]
async fn test_parent_token_stops_pipeline() {
    let parent = tokio_util::sync::CancellationToken::new();
    let (pipeline, _tail) = PipelineBuilder::new("test")
        .with_cancel(&parent)
        .source("counter", Counter { next: 0, limit: 0 }, 4)
        .build();
    pipeline.start();
    parent.cancel();

    tokio::time::timeout(Duration::from_secs(1), async {
        while pipeline.states()[0].1 != StageState::Stopped {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("stage should stop with its parent");
}
