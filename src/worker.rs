//! Per-camera capture worker.
//!
//! One OS thread per active camera drives capture → annotate → notify →
//! distribute. The worker exclusively owns its capture handle and observes a
//! cooperative stop flag once per iteration and between backoff retries.
//!
//! State machine: `Created → Opening → Running → Draining → Closed`.

use anyhow::{Context, Result};
use serde::Serialize;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::annotate::Annotator;
use crate::frame::{AnnotatedFrame, DetectionEvent, RawFrame};
use crate::ingest::{FrameSource, ReadOutcome, SourceDescriptor, SourceInterrupter, SourceOpener};
use crate::notify::EventNotifier;
use crate::sink::FrameCell;

const STOP_POLL: Duration = Duration::from_millis(5);

/// Cooperative stop flag shared by a worker and its push pump.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` in short slices. Returns `true` if the flag was
    /// raised before the full duration elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_raised() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(STOP_POLL.min(deadline - now));
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum WorkerState {
    Created = 0,
    Opening = 1,
    Running = 2,
    Draining = 3,
    Closed = 4,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Opening,
            2 => Self::Running,
            3 => Self::Draining,
            _ => Self::Closed,
        }
    }
}

/// Timing and failure policy for capture workers.
#[derive(Clone, Debug)]
pub struct WorkerSettings {
    /// First retry delay after a failed or empty read.
    pub backoff_initial: Duration,
    /// Retry delay cap; the delay doubles up to this value.
    pub backoff_max: Duration,
    /// Consecutive failed reads before the source is declared lost.
    pub max_consecutive_read_failures: u32,
    /// How long `start` waits for the source to open.
    pub open_timeout: Duration,
    /// How long a stopped worker may take to exit before it is forced.
    pub stop_grace: Duration,
    pub health_log_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            backoff_initial: Duration::from_millis(10),
            backoff_max: Duration::from_millis(250),
            max_consecutive_read_failures: 50,
            open_timeout: Duration::from_secs(10),
            stop_grace: Duration::from_secs(2),
            health_log_interval: Duration::from_secs(5),
        }
    }
}

/// Exponential backoff with a consecutive-failure ceiling.
#[derive(Clone, Debug)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    ceiling: u32,
    current: Duration,
    failures: u32,
}

impl Backoff {
    pub(crate) fn new(settings: &WorkerSettings) -> Self {
        Self {
            initial: settings.backoff_initial,
            max: settings.backoff_max.max(settings.backoff_initial),
            ceiling: settings.max_consecutive_read_failures.max(1),
            current: settings.backoff_initial,
            failures: 0,
        }
    }

    /// Record one failure. Returns the delay before the next attempt, or
    /// `None` once the ceiling is reached.
    pub(crate) fn record_failure(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= self.ceiling {
            return None;
        }
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        Some(delay)
    }

    pub(crate) fn reset(&mut self) {
        self.failures = 0;
        self.current = self.initial;
    }

    pub(crate) fn failures(&self) -> u32 {
        self.failures
    }
}

#[derive(Debug, Default)]
struct WorkerStats {
    frames_captured: AtomicU64,
    frames_annotated: AtomicU64,
    frames_distributed: AtomicU64,
    annotation_failures: AtomicU64,
    notification_failures: AtomicU64,
    read_failures: AtomicU64,
}

/// Point-in-time copy of a worker's counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    pub frames_captured: u64,
    pub frames_annotated: u64,
    pub frames_distributed: u64,
    pub annotation_failures: u64,
    pub notification_failures: u64,
    pub read_failures: u64,
}

impl WorkerStats {
    fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_annotated: self.frames_annotated.load(Ordering::Relaxed),
            frames_distributed: self.frames_distributed.load(Ordering::Relaxed),
            annotation_failures: self.annotation_failures.load(Ordering::Relaxed),
            notification_failures: self.notification_failures.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// State visible outside the worker thread.
#[derive(Default)]
struct WorkerShared {
    state: AtomicU8,
    stats: WorkerStats,
    interrupter: Mutex<Option<SourceInterrupter>>,
}

impl WorkerShared {
    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }
}

/// Why a worker thread returned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum WorkerExit {
    /// Stop flag observed.
    Stopped,
    /// The source could not be opened.
    OpenFailed(String),
    /// The source ended or exceeded the read failure ceiling.
    SourceLost(String),
}

pub(crate) type ExitHook = Box<dyn FnOnce(WorkerExit) + Send>;

/// Everything a worker needs, moved into its thread.
pub(crate) struct WorkerContext {
    pub camera_id: Arc<str>,
    pub source: SourceDescriptor,
    pub opener: Arc<dyn SourceOpener>,
    pub annotator: Box<dyn Annotator>,
    pub notifier: Arc<dyn EventNotifier>,
    pub pull_cell: Arc<FrameCell>,
    pub push_cell: Arc<FrameCell>,
    pub settings: WorkerSettings,
    pub stop: StopSignal,
}

/// Registry-side handle to a running worker thread.
pub(crate) struct WorkerHandle {
    shared: Arc<WorkerShared>,
    stop: StopSignal,
    exited: Receiver<()>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub(crate) fn state(&self) -> WorkerState {
        self.shared.state()
    }

    pub(crate) fn stats(&self) -> WorkerStatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub(crate) fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    /// Wait up to `timeout` for the thread to exit. Returns `true` if it did.
    pub(crate) fn wait_exit(&mut self, timeout: Duration) -> bool {
        match self.exited.recv_timeout(timeout) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                if let Some(join) = self.join.take() {
                    let _ = join.join();
                }
                true
            }
            Err(mpsc::RecvTimeoutError::Timeout) => false,
        }
    }

    /// Release the capture handle from outside the worker thread.
    pub(crate) fn interrupt(&self) -> bool {
        let interrupter = self
            .shared
            .interrupter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match interrupter {
            Some(interrupt) => {
                interrupt();
                true
            }
            None => false,
        }
    }
}

/// Spawn a worker thread.
///
/// The returned receiver yields the outcome of `Opening` exactly once.
/// `on_exit` runs on the worker thread after the capture handle has been
/// released.
pub(crate) fn spawn(
    ctx: WorkerContext,
    on_exit: ExitHook,
) -> Result<(WorkerHandle, Receiver<std::result::Result<(), String>>)> {
    let shared = Arc::new(WorkerShared::default());
    let (open_tx, open_rx) = mpsc::sync_channel(1);
    let (exit_tx, exit_rx) = mpsc::sync_channel(1);
    let stop = ctx.stop.clone();
    let thread_stop = ctx.stop.clone();
    let thread_shared = Arc::clone(&shared);
    let camera_id = Arc::clone(&ctx.camera_id);
    let name = format!("worker-{}", ctx.camera_id);

    let join = std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            // A panicking source or annotator still has to reach the exit
            // hook, or the registry entry is never cleared.
            let exit = match panic::catch_unwind(AssertUnwindSafe(|| {
                run(ctx, &thread_shared, open_tx)
            })) {
                Ok(exit) => exit,
                Err(payload) => {
                    let reason = format!("worker panicked: {}", panic_message(payload.as_ref()));
                    log::error!("[{}] {}", camera_id, reason);
                    let opening = thread_shared.state() == WorkerState::Opening;
                    thread_shared.set_state(WorkerState::Closed);
                    thread_stop.raise();
                    if opening {
                        WorkerExit::OpenFailed(reason)
                    } else {
                        WorkerExit::SourceLost(reason)
                    }
                }
            };
            on_exit(exit);
            let _ = exit_tx.send(());
        })
        .context("failed to spawn capture worker thread")?;

    Ok((
        WorkerHandle {
            shared,
            stop,
            exited: exit_rx,
            join: Some(join),
        },
        open_rx,
    ))
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

/// Releases the capture handle on every exit path.
struct SourceGuard<'a> {
    source: Box<dyn FrameSource>,
    shared: &'a WorkerShared,
}

impl Drop for SourceGuard<'_> {
    fn drop(&mut self) {
        self.shared.set_state(WorkerState::Draining);
        self.source.close();
        self.shared
            .interrupter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.shared.set_state(WorkerState::Closed);
    }
}

fn run(
    mut ctx: WorkerContext,
    shared: &WorkerShared,
    open_tx: SyncSender<std::result::Result<(), String>>,
) -> WorkerExit {
    shared.set_state(WorkerState::Opening);
    let source = match ctx.opener.open(&ctx.source) {
        Ok(source) => source,
        Err(e) => {
            let reason = format!("{:#}", e);
            log::warn!("[{}] open {} failed: {}", ctx.camera_id, ctx.source, reason);
            shared.set_state(WorkerState::Closed);
            let _ = open_tx.send(Err(reason.clone()));
            return WorkerExit::OpenFailed(reason);
        }
    };

    *shared
        .interrupter
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = source.interrupter();
    let mut guard = SourceGuard { source, shared };

    if ctx.stop.is_raised() {
        // Abandoned while opening.
        return WorkerExit::Stopped;
    }
    if let Err(e) = ctx.annotator.warm_up() {
        log::warn!("[{}] annotator warm-up failed: {:#}", ctx.camera_id, e);
    }
    shared.set_state(WorkerState::Running);
    let _ = open_tx.send(Ok(()));
    log::info!(
        "[{}] running {} with {} annotator",
        ctx.camera_id,
        ctx.source,
        ctx.annotator.name()
    );

    let mut backoff = Backoff::new(&ctx.settings);
    let mut sequence = 0u64;
    let mut last_health_log = Instant::now();

    let exit = loop {
        if ctx.stop.is_raised() {
            break WorkerExit::Stopped;
        }
        if last_health_log.elapsed() >= ctx.settings.health_log_interval {
            let stats = shared.stats.snapshot();
            log::info!(
                "[{}] health frames={} distributed={} read_failures={} annotation_failures={}",
                ctx.camera_id,
                stats.frames_captured,
                stats.frames_distributed,
                stats.read_failures,
                stats.annotation_failures
            );
            last_health_log = Instant::now();
        }

        let failure = match guard.source.read_frame() {
            Ok(ReadOutcome::Frame(raw)) => {
                backoff.reset();
                bump(&shared.stats.frames_captured);
                process_frame(&mut ctx, shared, raw, &mut sequence);
                continue;
            }
            Ok(ReadOutcome::Ended) => break WorkerExit::SourceLost("end of stream".to_string()),
            Ok(ReadOutcome::Pending) => None,
            Err(e) => Some(e),
        };

        bump(&shared.stats.read_failures);
        if let Some(e) = &failure {
            log::debug!("[{}] read failed: {:#}", ctx.camera_id, e);
        }
        match backoff.record_failure() {
            Some(delay) => {
                if ctx.stop.sleep(delay) {
                    break WorkerExit::Stopped;
                }
            }
            None => {
                break WorkerExit::SourceLost(format!(
                    "{} consecutive failed reads",
                    backoff.failures()
                ))
            }
        }
    };

    match &exit {
        WorkerExit::SourceLost(reason) => {
            log::warn!("[{}] source lost: {}", ctx.camera_id, reason);
            // Stops the push pump as well.
            ctx.stop.raise();
        }
        _ => log::info!("[{}] stopping", ctx.camera_id),
    }
    drop(guard);
    exit
}

fn process_frame(ctx: &mut WorkerContext, shared: &WorkerShared, raw: RawFrame, sequence: &mut u64) {
    let annotation = match ctx.annotator.annotate(&raw) {
        Ok(annotation) => annotation,
        Err(e) => {
            bump(&shared.stats.annotation_failures);
            log::warn!("[{}] annotation failed: {:#}", ctx.camera_id, e);
            return;
        }
    };

    let frame = match AnnotatedFrame::new(
        Arc::clone(&ctx.camera_id),
        *sequence + 1,
        raw.width,
        raw.height,
        annotation.pixels,
        annotation.object_count,
        raw.captured_at(),
    ) {
        Ok(frame) => Arc::new(frame),
        Err(e) => {
            bump(&shared.stats.annotation_failures);
            log::warn!("[{}] annotator output rejected: {:#}", ctx.camera_id, e);
            return;
        }
    };
    *sequence += 1;
    bump(&shared.stats.frames_annotated);

    let event = DetectionEvent::new(&ctx.camera_id, frame.object_count());
    if let Err(e) = ctx.notifier.publish(&event) {
        bump(&shared.stats.notification_failures);
        log::debug!("[{}] event not delivered: {:#}", ctx.camera_id, e);
    }

    ctx.pull_cell.store(Arc::clone(&frame));
    ctx.push_cell.store(frame);
    bump(&shared.stats.frames_distributed);
}
