use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
        mpsc as std_mpsc,
    },
    time::Duration,
};

use bytes::Bytes;
use stage_bus::{Stage, StageQueue};
use tokio::time::Instant;

use super::{Transformer, TransformerSettings};
use crate::{
    connection::ConnectionId,
    media::{DecodedImage, Frame, FrameBatch},
    params::Parameters,
    transform::FrameTransformer,
};

#[derive(Default)]
struct Upper {
    calls: AtomicUsize,
    fail_first: bool,
    short: bool,
    delay: Option<Duration>,
    gate: Option<Mutex<std_mpsc::Receiver<()>>>,
}

impl FrameTransformer for Upper {
    fn name(&self) -> &str {
        "upper"
    }

    fn transform(
        &self,
        frames: &[Frame],
        _params: &[crate::params::ParameterSnapshot],
    ) -> anyhow::Result<Vec<Bytes>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let (Some(gate), 1) = (&self.gate, call) {
            let _ = gate.lock().unwrap().recv();
        }
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.fail_first && call == 1 {
            anyhow::bail!("model exploded");
        }
        let mut out: Vec<Bytes> = frames
            .iter()
            .map(|f| Bytes::from(f.image.data.to_ascii_uppercase()))
            .collect();
        if self.short {
            out.pop();
        }
        Ok(out)
    }
}

fn batch(tags: &[&str], passthrough: bool) -> FrameBatch {
    let params = Arc::new(Parameters {
        passthrough,
        ..Default::default()
    });
    FrameBatch {
        frames: tags
            .iter()
            .map(|t| Frame {
                connection: ConnectionId::new(),
                received_at: Instant::now(),
                image: DecodedImage {
                    width: 1,
                    height: 1,
                    components: 3,
                    data: Bytes::copy_from_slice(t.as_bytes()),
                },
            })
            .collect(),
        params: tags.iter().map(|_| Arc::clone(&params)).collect(),
        formed_at: Instant::now(),
    }
}

fn settings(warmup_batches: usize) -> TransformerSettings {
    TransformerSettings {
        backlog: 8,
        timeout: Duration::from_secs(5),
        warmup_batches,
    }
}

struct Harness {
    stage: Stage<Transformer>,
    input: Arc<StageQueue<FrameBatch>>,
    output: Arc<StageQueue<Bytes>>,
}

async fn start(collaborator: Arc<Upper>, settings: TransformerSettings) -> Harness {
    let input = Arc::new(StageQueue::new("batches", 16));
    let output = Arc::new(StageQueue::new("images", 64));
    let stage = Stage::new("transformer", Transformer::new(collaborator, settings), Arc::clone(&input))
        .with_output(Arc::clone(&output));
    stage.start();
    // let setup clear the input queue before feeding it
    tokio::time::sleep(Duration::from_millis(50)).await;
    Harness {
        stage,
        input,
        output,
    }
}

async fn next(output: &StageQueue<Bytes>) -> Bytes {
    tokio::time::timeout(Duration::from_secs(2), output.pop())
        .await
        .expect("transformer should produce output")
}

async fn wait_calls(collaborator: &Upper, n: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while collaborator.calls.load(Ordering::SeqCst) < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("collaborator should be called");
}

#[tokio::test]
async fn test_transforms_and_forwards_each_image() {
    let upper = Arc::new(Upper::default());
    let h = start(Arc::clone(&upper), settings(0)).await;

    h.input.push(batch(&["ab", "cd"], false));
    assert_eq!(next(&h.output).await, Bytes::from_static(b"AB"));
    assert_eq!(next(&h.output).await, Bytes::from_static(b"CD"));
    h.stage.close(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_passthrough_batch_skips_collaborator() {
    let upper = Arc::new(Upper::default());
    let h = start(Arc::clone(&upper), settings(0)).await;

    h.input.push(batch(&["ab"], true));
    assert_eq!(next(&h.output).await, Bytes::from_static(b"ab"));
    assert_eq!(upper.calls.load(Ordering::SeqCst), 0);
    h.stage.close(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_failure_drops_only_that_batch() {
    let upper = Arc::new(Upper {
        fail_first: true,
        ..Default::default()
    });
    let h = start(Arc::clone(&upper), settings(0)).await;

    h.input.push(batch(&["bad"], false));
    wait_calls(&upper, 1).await;
    h.input.push(batch(&["good"], false));
    assert_eq!(next(&h.output).await, Bytes::from_static(b"GOOD"));
    assert!(h.output.is_empty());
    h.stage.close(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_short_result_is_a_failure() {
    let upper = Arc::new(Upper {
        short: true,
        ..Default::default()
    });
    let h = start(Arc::clone(&upper), settings(0)).await;

    h.input.push(batch(&["a", "b"], false));
    wait_calls(&upper, 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.output.is_empty());
    h.stage.close(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_timeout_drops_batch() {
    let upper = Arc::new(Upper {
        delay: Some(Duration::from_millis(300)),
        ..Default::default()
    });
    let h = start(
        Arc::clone(&upper),
        TransformerSettings {
            timeout: Duration::from_millis(50),
            ..settings(0)
        },
    )
    .await;

    h.input.push(batch(&["slow"], false));
    wait_calls(&upper, 1).await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(h.output.is_empty());
    h.stage.close(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_warmup_discards_first_runs() {
    let upper = Arc::new(Upper::default());
    let h = start(Arc::clone(&upper), settings(1)).await;

    h.input.push(batch(&["warm"], false));
    wait_calls(&upper, 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.output.is_empty());

    h.input.push(batch(&["live"], false));
    assert_eq!(next(&h.output).await, Bytes::from_static(b"LIVE"));
    h.stage.close(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_sheds_backlog_while_collaborator_is_busy() {
    let (release, gate) = std_mpsc::channel();
    let upper = Arc::new(Upper {
        gate: Some(Mutex::new(gate)),
        ..Default::default()
    });
    let h = start(
        Arc::clone(&upper),
        TransformerSettings {
            backlog: 1,
            ..settings(0)
        },
    )
    .await;

    h.input.push(batch(&["one"], false));
    wait_calls(&upper, 1).await;
    h.input.push(batch(&["two"], false));
    h.input.push(batch(&["three"], false));
    h.input.push(batch(&["four"], false));
    release.send(()).unwrap();

    assert_eq!(next(&h.output).await, Bytes::from_static(b"ONE"));
    assert_eq!(next(&h.output).await, Bytes::from_static(b"TWO"));
    assert_eq!(next(&h.output).await, Bytes::from_static(b"FOUR"));
    assert_eq!(h.input.evicted_total(), 1);
    h.stage.close(Duration::from_secs(1)).await;
}
