use std::{
    future::Future,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::queue::StageQueue;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageState {
    Created,
    Running,
    Stopping,
    Stopped,
}

impl StageState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => StageState::Created,
            1 => StageState::Running,
            2 => StageState::Stopping,
            _ => StageState::Stopped,
        }
    }
}

struct Lifecycle(AtomicU8);

impl Lifecycle {
    fn new() -> Self {
        Self(AtomicU8::new(StageState::Created as u8))
    }

    fn get(&self) -> StageState {
        StageState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: StageState) {
        self.0.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: StageState, to: StageState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Result of [`Stage::close`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The execution context finished (or had already finished).
    Joined,
    /// The stage was never started; nothing to join.
    NotStarted,
    /// The execution context ended with a panic. Cleanup still ran.
    Panicked,
    /// The execution context was aborted through [`Stage::terminate`].
    Terminated,
    /// The join deadline elapsed. The caller has to escalate.
    TimedOut,
}

/// The unit of work driven by a [`Stage`].
///
/// `setup` runs once before the loop, `work` once per input item and
/// `cleanup` exactly once when the execution context goes away, whatever the
/// reason (normal exit, failed setup, panic or forced abort).
pub trait Worker: Send + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    fn setup(
        &mut self,
        _ctx: &StageContext<Self::Input, Self::Output>,
    ) -> impl Future<Output = anyhow::Result<()>> + Send {
        async { Ok(()) }
    }

    fn work(
        &mut self,
        item: Self::Input,
        ctx: &StageContext<Self::Input, Self::Output>,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn cleanup(&mut self) {}
}

/// What a worker sees of its stage while running.
pub struct StageContext<I, O> {
    name: String,
    cancel: CancellationToken,
    input: Option<Arc<StageQueue<I>>>,
    output: Option<Arc<StageQueue<O>>>,
}

impl<I, O> StageContext<I, O> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn input(&self) -> Option<&StageQueue<I>> {
        self.input.as_deref()
    }

    pub fn output(&self) -> Option<&StageQueue<O>> {
        self.output.as_deref()
    }

    /// Hand an item downstream. Returns false when the stage has no output.
    pub fn emit(&self, item: O) -> bool {
        match &self.output {
            Some(output) => {
                if output.push(item).is_some() {
                    log::debug!("{}: {} full, dropped oldest", self.name, output.name());
                }
                true
            }
            None => false,
        }
    }
}

enum Inlet<T> {
    Queue(Arc<StageQueue<T>>),
    Source(fn() -> T),
}

impl<T> Clone for Inlet<T> {
    fn clone(&self) -> Self {
        match self {
            Inlet::Queue(q) => Inlet::Queue(Arc::clone(q)),
            Inlet::Source(f) => Inlet::Source(*f),
        }
    }
}

/// A lifecycle-managed worker running on its own tokio task.
pub struct Stage<W: Worker> {
    name: String,
    cancel: CancellationToken,
    lifecycle: Arc<Lifecycle>,
    worker: Mutex<Option<W>>,
    inlet: Inlet<W::Input>,
    output: Option<Arc<StageQueue<W::Output>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<W: Worker<Input = ()>> Stage<W> {
    /// A stage without an input queue; `work` is invoked back to back and is
    /// expected to await its own events.
    pub fn source(name: &str, worker: W) -> Self {
        Self::with_inlet(name, worker, Inlet::Source(|| ()))
    }
}

impl<W: Worker> Stage<W> {
    pub fn new(name: &str, worker: W, input: Arc<StageQueue<W::Input>>) -> Self {
        Self::with_inlet(name, worker, Inlet::Queue(input))
    }

    fn with_inlet(name: &str, worker: W, inlet: Inlet<W::Input>) -> Self {
        Self {
            name: name.to_string(),
            cancel: CancellationToken::new(),
            lifecycle: Arc::new(Lifecycle::new()),
            worker: Mutex::new(Some(worker)),
            inlet,
            output: None,
            handle: Mutex::new(None),
        }
    }

    pub fn with_output(mut self, output: Arc<StageQueue<W::Output>>) -> Self {
        self.output = Some(output);
        self
    }

    /// Tie this stage's cancellation to `parent`.
    pub fn with_parent(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> StageState {
        self.lifecycle.get()
    }

    pub fn input(&self) -> Option<&Arc<StageQueue<W::Input>>> {
        match &self.inlet {
            Inlet::Queue(q) => Some(q),
            Inlet::Source(_) => None,
        }
    }

    pub fn output(&self) -> Option<&Arc<StageQueue<W::Output>>> {
        self.output.as_ref()
    }

    fn lock_handle(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.handle.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn the execution context. Returns false if the stage was already started.
    pub fn start(&self) -> bool {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(worker) = worker else {
            log::debug!("{}: already started", self.name);
            return false;
        };

        self.lifecycle.set(StageState::Running);
        let ctx = StageContext {
            name: self.name.clone(),
            cancel: self.cancel.clone(),
            input: self.input().cloned(),
            output: self.output.clone(),
        };
        let handle = tokio::spawn(run_stage(
            worker,
            ctx,
            self.inlet.clone(),
            Arc::clone(&self.lifecycle),
        ));
        *self.lock_handle() = Some(handle);
        true
    }

    /// Signal cooperative termination. Never blocks.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.lifecycle
            .transition(StageState::Running, StageState::Stopping);
    }

    /// `stop`, then wait up to `timeout` for the execution context to finish.
    pub async fn close(&self, timeout: Duration) -> CloseOutcome {
        self.stop();

        let handle = self.lock_handle().take();
        let Some(mut handle) = handle else {
            return self.close_without_handle(timeout).await;
        };

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => CloseOutcome::Joined,
            Ok(Err(e)) if e.is_panic() => {
                log::error!("{}: execution context panicked", self.name);
                CloseOutcome::Panicked
            }
            Ok(Err(_)) => CloseOutcome::Terminated,
            Err(_) => {
                log::warn!("{}: did not stop within {:?}", self.name, timeout);
                *self.lock_handle() = Some(handle);
                CloseOutcome::TimedOut
            }
        }
    }

    async fn close_without_handle(&self, timeout: Duration) -> CloseOutcome {
        if self.state() == StageState::Created {
            let never_started = self
                .worker
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            if never_started.is_some() {
                self.lifecycle.set(StageState::Stopped);
                return CloseOutcome::NotStarted;
            }
        }

        // another close is joining the handle; wait for it to land
        let settled = tokio::time::timeout(timeout, async {
            while self.state() != StageState::Stopped {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        match settled {
            Ok(()) => CloseOutcome::Joined,
            Err(_) => CloseOutcome::TimedOut,
        }
    }

    /// Abort the execution context. Last resort for stages that ignore `stop`:
    /// a worker that never yields back to the runtime cannot be preempted.
    pub fn terminate(&self) -> bool {
        self.cancel.cancel();
        match self.lock_handle().take() {
            Some(handle) => {
                log::warn!("{}: forcing termination", self.name);
                handle.abort();
                true
            }
            None => false,
        }
    }
}

struct CleanupGuard<W: Worker> {
    name: String,
    worker: W,
    lifecycle: Arc<Lifecycle>,
}

impl<W: Worker> Drop for CleanupGuard<W> {
    fn drop(&mut self) {
        self.worker.cleanup();
        self.lifecycle.set(StageState::Stopped);
        log::info!("{}: stopped", self.name);
    }
}

async fn run_stage<W: Worker>(
    worker: W,
    ctx: StageContext<W::Input, W::Output>,
    inlet: Inlet<W::Input>,
    lifecycle: Arc<Lifecycle>,
) {
    let mut guard = CleanupGuard {
        name: ctx.name.clone(),
        worker,
        lifecycle,
    };
    if ctx.is_cancelled() {
        return;
    }

    if let Err(e) = guard.worker.setup(&ctx).await {
        log::error!("{}: setup failed: {:#}", ctx.name, e);
        return;
    }
    log::info!("{}: running", ctx.name);

    loop {
        let item = match &inlet {
            Inlet::Queue(queue) => tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => break,
                item = queue.pop() => item,
            },
            Inlet::Source(next) => {
                if ctx.is_cancelled() {
                    break;
                }
                next()
            }
        };

        if let Err(e) = guard.worker.work(item, &ctx).await {
            log::error!("{}: work failed: {:#}", ctx.name, e);
        }
    }
}

/// Type-erased lifecycle view of a stage, used by [`crate::pipeline::Pipeline`].
pub trait StageControl: Send + Sync {
    fn name(&self) -> &str;
    fn state(&self) -> StageState;
    fn start(&self) -> bool;
    fn stop(&self);
    fn close(&self, timeout: Duration) -> BoxFuture<'_, CloseOutcome>;
    fn terminate(&self) -> bool;
}

impl<W: Worker> StageControl for Stage<W> {
    fn name(&self) -> &str {
        Stage::name(self)
    }

    fn state(&self) -> StageState {
        Stage::state(self)
    }

    fn start(&self) -> bool {
        Stage::start(self)
    }

    fn stop(&self) {
        Stage::stop(self)
    }

    fn close(&self, timeout: Duration) -> BoxFuture<'_, CloseOutcome> {
        Box::pin(Stage::close(self, timeout))
    }

    fn terminate(&self) -> bool {
        Stage::terminate(self)
    }
}

#[cfg(test)]
#[path = "stage_test.rs"]
mod stage_test;
