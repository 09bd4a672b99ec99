//! Stream registry: camera id → worker, at most one worker per id.
//!
//! The registry is the only mutable process-wide table. It is injected as a
//! cheap `Clone` handle; every clone shares the same table. Start is
//! check-then-insert under the table mutex, so concurrent starts of the same
//! id produce exactly one worker.

use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use crate::annotate::AnnotatorFactory;
use crate::ingest::{SourceDescriptor, SourceOpener};
use crate::notify::EventNotifier;
use crate::push::{PushAttachment, PushMount, PushOutputFactory, PushPump};
use crate::sink::{FrameCell, PullSink, PushSink};
use crate::validate_camera_id;
use crate::worker::{
    self, StopSignal, WorkerContext, WorkerExit, WorkerHandle, WorkerSettings, WorkerState,
    WorkerStatsSnapshot,
};

/// Result of `StreamRegistry::start`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
    SourceUnavailable { reason: String },
}

impl StartOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::AlreadyRunning => "already_running",
            Self::SourceUnavailable { .. } => "source_unavailable",
        }
    }
}

/// Result of `StreamRegistry::stop`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotRunning,
}

impl StopOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::NotRunning => "not_running",
        }
    }
}

/// Lifecycle state of a camera id as seen by the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Stopped,
    Running,
    /// Removed from the table; the old worker has not exited yet.
    Stopping,
}

/// Conditions that end a worker without a caller asking for it, or that
/// outlive the call that caused them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "condition", rename_all = "snake_case")]
pub enum TerminalCondition {
    SourceUnavailable { reason: String },
    SourceLost { reason: String },
    StopTimedOut,
}

/// Per-camera view for status endpoints.
#[derive(Clone, Debug, Serialize)]
pub struct StreamStatus {
    pub id: String,
    pub source: String,
    pub state: StreamState,
    pub worker: WorkerState,
    pub push_output: bool,
    pub stats: WorkerStatsSnapshot,
}

/// Trait objects the registry hands to each worker.
#[derive(Clone)]
pub struct Collaborators {
    pub sources: Arc<dyn SourceOpener>,
    /// Called once per started worker; annotators are never shared.
    pub annotators: AnnotatorFactory,
    pub notifier: Arc<dyn EventNotifier>,
    pub push_output: Option<Arc<dyn PushOutputFactory>>,
    pub push_fps: u32,
}

impl Collaborators {
    pub fn new(
        sources: Arc<dyn SourceOpener>,
        annotators: AnnotatorFactory,
        notifier: Arc<dyn EventNotifier>,
    ) -> Self {
        Self {
            sources,
            annotators,
            notifier,
            push_output: None,
            push_fps: 30,
        }
    }

    pub fn with_push_output(mut self, factory: Arc<dyn PushOutputFactory>, fps: u32) -> Self {
        self.push_output = Some(factory);
        self.push_fps = fps.max(1);
        self
    }
}

struct Entry {
    generation: u64,
    source: SourceDescriptor,
    worker: WorkerHandle,
    pull_cell: Arc<FrameCell>,
    push_cell: Arc<FrameCell>,
    push: Option<PushHandle>,
}

/// A camera's live push output. Dropping a mount withdraws it.
enum PushHandle {
    Pump(PushPump),
    Mount(Box<dyn PushMount>),
}

#[derive(Default)]
struct Table {
    entries: HashMap<String, Entry>,
    /// generation → id of workers stopped but not yet exited.
    stopping: HashMap<u64, String>,
    conditions: HashMap<String, TerminalCondition>,
    next_generation: u64,
}

struct Inner {
    collaborators: Collaborators,
    settings: WorkerSettings,
    pull: PullSink,
    push: PushSink,
    table: Mutex<Table>,
}

impl Inner {
    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take `entry` out of circulation: detach its cells and signal stop.
    fn retire(&self, id: &str, entry: &Entry) {
        self.pull.unregister(id, &entry.pull_cell);
        self.push.unregister(id, &entry.push_cell);
        entry.worker.stop_signal().raise();
    }
}

impl Drop for Inner {
    /// Last handle gone: nothing can stop the remaining workers any more.
    fn drop(&mut self) {
        let table = self.table.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (id, entry) in &table.entries {
            log::debug!("[{}] registry dropped; stopping worker", id);
            entry.worker.stop_signal().raise();
        }
    }
}

/// Handle to the camera table.
#[derive(Clone)]
pub struct StreamRegistry {
    inner: Arc<Inner>,
}

impl StreamRegistry {
    pub fn new(collaborators: Collaborators, settings: WorkerSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                collaborators,
                settings,
                pull: PullSink::new(),
                push: PushSink::new(),
                table: Mutex::new(Table::default()),
            }),
        }
    }

    pub fn pull_sink(&self) -> PullSink {
        self.inner.pull.clone()
    }

    pub fn push_sink(&self) -> PushSink {
        self.inner.push.clone()
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.inner.settings
    }

    /// Start a worker for `camera_id` unless one is already active.
    ///
    /// Blocks until the source has opened, bounded by the open timeout.
    /// Errors only for invalid ids or when a thread cannot be spawned.
    pub fn start(&self, camera_id: &str, source: SourceDescriptor) -> Result<StartOutcome> {
        validate_camera_id(camera_id)?;
        let inner = &self.inner;

        let (generation, stop, open_rx) = {
            let mut table = inner.table();
            if table.entries.contains_key(camera_id) {
                log::debug!("[{}] start ignored: already running", camera_id);
                return Ok(StartOutcome::AlreadyRunning);
            }
            let generation = table.next_generation;
            table.next_generation += 1;

            let pull_cell = inner.pull.register(camera_id);
            let push_cell = inner.push.register(camera_id);
            let stop = StopSignal::new();
            let ctx = WorkerContext {
                camera_id: Arc::from(camera_id),
                source: source.clone(),
                opener: Arc::clone(&inner.collaborators.sources),
                annotator: (inner.collaborators.annotators)(),
                notifier: Arc::clone(&inner.collaborators.notifier),
                pull_cell: Arc::clone(&pull_cell),
                push_cell: Arc::clone(&push_cell),
                settings: inner.settings.clone(),
                stop: stop.clone(),
            };
            let hook = exit_hook(Arc::downgrade(inner), camera_id, generation);
            let (worker, open_rx) = match worker::spawn(ctx, hook) {
                Ok(spawned) => spawned,
                Err(e) => {
                    inner.pull.unregister(camera_id, &pull_cell);
                    inner.push.unregister(camera_id, &push_cell);
                    return Err(e);
                }
            };

            table.conditions.remove(camera_id);
            table.entries.insert(
                camera_id.to_string(),
                Entry {
                    generation,
                    source: source.clone(),
                    worker,
                    pull_cell,
                    push_cell,
                    push: None,
                },
            );
            (generation, stop, open_rx)
        };

        let open_timeout = inner.settings.open_timeout;
        let opened = match open_rx.recv_timeout(open_timeout) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(reason),
            Err(RecvTimeoutError::Timeout) => {
                Err(format!("source did not open within {:?}", open_timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err("worker exited while opening".to_string()),
        };

        match opened {
            Ok(()) => {
                self.attach_push_output(camera_id, generation, &stop);
                log::info!("[{}] started {}", camera_id, source);
                Ok(StartOutcome::Started)
            }
            Err(reason) => {
                let mut table = inner.table();
                let ours = matches!(
                    table.entries.get(camera_id),
                    Some(entry) if entry.generation == generation
                );
                if ours {
                    if let Some(entry) = table.entries.remove(camera_id) {
                        inner.retire(camera_id, &entry);
                        // An opener stuck past the timeout still owns its
                        // thread; it observes the stop flag once open returns.
                    }
                    table.conditions.insert(
                        camera_id.to_string(),
                        TerminalCondition::SourceUnavailable {
                            reason: reason.clone(),
                        },
                    );
                }
                log::warn!("[{}] source unavailable ({}): {}", camera_id, source, reason);
                Ok(StartOutcome::SourceUnavailable { reason })
            }
        }
    }

    fn attach_push_output(&self, camera_id: &str, generation: u64, stop: &StopSignal) {
        let Some(factory) = self.inner.collaborators.push_output.as_ref() else {
            return;
        };
        let attachment = match factory.open(camera_id, &self.inner.push) {
            Ok(attachment) => attachment,
            Err(e) => {
                log::warn!("[{}] push output unavailable: {:#}", camera_id, e);
                return;
            }
        };

        let mut table = self.inner.table();
        let Some(entry) = table
            .entries
            .get_mut(camera_id)
            .filter(|entry| entry.generation == generation)
        else {
            if let PushAttachment::Paced(mut output) = attachment {
                output.finish();
            }
            return;
        };
        match attachment {
            PushAttachment::Paced(output) => match PushPump::spawn(
                camera_id,
                self.inner.push.clone(),
                output,
                self.inner.collaborators.push_fps,
                stop.clone(),
            ) {
                Ok(pump) => entry.push = Some(PushHandle::Pump(pump)),
                Err(e) => log::warn!("[{}] push pump not started: {:#}", camera_id, e),
            },
            PushAttachment::OnDemand(mount) => {
                log::info!("[{}] push output at {}", camera_id, mount.url());
                entry.push = Some(PushHandle::Mount(mount));
            }
        }
    }

    /// Signal the worker for `camera_id` and remove it from the table.
    ///
    /// Returns immediately. A watchdog thread waits for the worker to exit
    /// and force-releases the capture handle if it does not within the
    /// stop grace period.
    pub fn stop(&self, camera_id: &str) -> StopOutcome {
        let inner = &self.inner;
        let entry = {
            let mut table = inner.table();
            let Some(entry) = table.entries.remove(camera_id) else {
                return StopOutcome::NotRunning;
            };
            inner.retire(camera_id, &entry);
            table
                .stopping
                .insert(entry.generation, camera_id.to_string());
            entry
        };
        log::info!("[{}] stop requested", camera_id);

        let weak = Arc::downgrade(inner);
        let id = camera_id.to_string();
        let grace = inner.settings.stop_grace;
        let spawned = std::thread::Builder::new()
            .name(format!("stop-{}", camera_id))
            .spawn(move || watch_stop(weak, id, entry, grace));
        if let Err(e) = spawned {
            log::warn!("[{}] stop watchdog not started: {}", camera_id, e);
            inner
                .table()
                .stopping
                .retain(|_, stopping| stopping.as_str() != camera_id);
        }
        StopOutcome::Stopped
    }

    /// Ids whose worker is currently Running, sorted.
    pub fn list(&self) -> Vec<String> {
        let table = self.inner.table();
        let mut ids: Vec<String> = table
            .entries
            .iter()
            .filter(|(_, entry)| entry.worker.state() == WorkerState::Running)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn stream_state(&self, camera_id: &str) -> StreamState {
        let table = self.inner.table();
        if table.entries.contains_key(camera_id) {
            StreamState::Running
        } else if table.stopping.values().any(|id| id == camera_id) {
            StreamState::Stopping
        } else {
            StreamState::Stopped
        }
    }

    pub fn status(&self, camera_id: &str) -> Option<StreamStatus> {
        let table = self.inner.table();
        table
            .entries
            .get(camera_id)
            .map(|entry| entry_status(camera_id, entry))
    }

    pub fn statuses(&self) -> Vec<StreamStatus> {
        let table = self.inner.table();
        let mut statuses: Vec<StreamStatus> = table
            .entries
            .iter()
            .map(|(id, entry)| entry_status(id, entry))
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    /// Last terminal condition recorded for `camera_id`. Cleared when the
    /// id is started again.
    pub fn last_condition(&self, camera_id: &str) -> Option<TerminalCondition> {
        self.inner.table().conditions.get(camera_id).cloned()
    }

    /// Stop every worker and wait for each to exit.
    ///
    /// Returns the ids whose worker had to be force-released.
    pub fn shutdown(&self) -> Vec<String> {
        let inner = &self.inner;
        let entries: Vec<(String, Entry)> = {
            let mut table = inner.table();
            let drained: Vec<(String, Entry)> = table.entries.drain().collect();
            for (id, entry) in &drained {
                inner.retire(id, entry);
            }
            drained
        };

        let mut timed_out = Vec::new();
        for (id, entry) in entries {
            if !finish_worker(inner, &id, entry, inner.settings.stop_grace) {
                timed_out.push(id);
            }
        }
        timed_out.sort();
        if !timed_out.is_empty() {
            log::warn!("shutdown: {} worker(s) force-released", timed_out.len());
        }
        timed_out
    }
}

fn entry_status(id: &str, entry: &Entry) -> StreamStatus {
    StreamStatus {
        id: id.to_string(),
        source: entry.source.to_string(),
        state: StreamState::Running,
        worker: entry.worker.state(),
        push_output: entry.push.is_some(),
        stats: entry.worker.stats(),
    }
}

/// Wait out a retired worker. Returns `false` if it had to be forced.
fn finish_worker(inner: &Inner, id: &str, mut entry: Entry, grace: Duration) -> bool {
    let exited = entry.worker.wait_exit(grace);
    if !exited {
        let interrupted = entry.worker.interrupt();
        log::warn!(
            "[{}] worker did not stop within {:?}; capture handle {}",
            id,
            grace,
            if interrupted {
                "force-released"
            } else {
                "has no interrupter"
            }
        );
        inner
            .table()
            .conditions
            .insert(id.to_string(), TerminalCondition::StopTimedOut);
    }
    if let Some(PushHandle::Pump(pump)) = entry.push.take() {
        pump.join();
    }
    exited
}

fn watch_stop(inner: Weak<Inner>, id: String, entry: Entry, grace: Duration) {
    let generation = entry.generation;
    let Some(inner) = inner.upgrade() else {
        return;
    };
    finish_worker(&inner, &id, entry, grace);
    inner.table().stopping.remove(&generation);
}

/// Runs on the worker thread after it has released its capture handle.
fn exit_hook(inner: Weak<Inner>, camera_id: &str, generation: u64) -> worker::ExitHook {
    let id = camera_id.to_string();
    Box::new(move |exit| {
        let WorkerExit::SourceLost(reason) = exit else {
            return;
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let mut table = inner.table();
        let ours = matches!(
            table.entries.get(&id),
            Some(entry) if entry.generation == generation
        );
        if !ours {
            return;
        }
        if let Some(entry) = table.entries.remove(&id) {
            inner.retire(&id, &entry);
        }
        table
            .conditions
            .insert(id.clone(), TerminalCondition::SourceLost { reason });
        log::info!("[{}] removed after source loss", id);
    })
}
