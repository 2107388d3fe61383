//! Live filesystem watching.
//!
//! notify callbacks only translate events and push them into a bounded
//! crossbeam channel. A dedicated thread debounces them per path and hands the
//! net changes to an [`UpdateSink`] in first-seen order. When the channel
//! fills up, or notify reports that it lost events, pending changes are
//! dropped and a full rescan is requested instead.

use crossbeam_channel::{bounded, never, select, tick, Receiver, Sender, TrySendError};
use notify::event::{ModifyKind, RenameMode};
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::error::{Result, SeekrError};

const EVENT_CAPACITY: usize = 4096;
const IDLE_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: PathBuf,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, path: impl Into<PathBuf>) -> Self {
        Self { kind, path: path.into() }
    }
}

/// What the event source feeds the watcher thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchSignal {
    Change(ChangeEvent),
    /// Events were lost; only a rescan can bring the index back in line.
    Overflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WatcherState {
    Stopped,
    Starting,
    Watching,
    Overflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RescanReason {
    Overflow,
    Periodic,
}

/// Receives the watcher's output.
pub trait UpdateSink: Send + Sync + 'static {
    fn changes(&self, events: Vec<ChangeEvent>);
    fn rescan(&self, reason: RescanReason);
}

/// Net effect of two consecutive events on one path.
pub fn merge(first: ChangeKind, then: ChangeKind) -> ChangeKind {
    use ChangeKind::*;
    match (first, then) {
        (Created, Deleted) | (Modified, Deleted) | (Deleted, Deleted) => Deleted,
        (Created, _) => Created,
        (Deleted, Created) | (Deleted, Modified) => Modified,
        (Modified, _) => Modified,
    }
}

/// A path that keeps changing is flushed after this many windows anyway.
const MAX_WAIT_WINDOWS: u32 = 10;

#[derive(Debug)]
struct Pending {
    event: ChangeEvent,
    first_seen: Instant,
    last_seen: Instant,
}

/// Collapses bursts of events per path into one net event.
///
/// A path becomes ready once no event arrived for it during `window`, or once
/// it has been pending for `max_wait`. Ready events come out in the order
/// their paths were first seen.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    max_wait: Duration,
    pending: Vec<Pending>,
    slots: HashMap<PathBuf, usize>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            max_wait: window * MAX_WAIT_WINDOWS,
            pending: Vec::new(),
            slots: HashMap::new(),
        }
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait.max(self.window);
        self
    }

    fn due(&self, pending: &Pending) -> Instant {
        (pending.last_seen + self.window).min(pending.first_seen + self.max_wait)
    }

    pub fn push(&mut self, event: ChangeEvent, now: Instant) {
        match self.slots.get(&event.path) {
            Some(&slot) => {
                let entry = &mut self.pending[slot];
                entry.event.kind = merge(entry.event.kind, event.kind);
                entry.last_seen = now;
            }
            None => {
                self.slots.insert(event.path.clone(), self.pending.len());
                self.pending.push(Pending { event, first_seen: now, last_seen: now });
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// When the earliest pending path becomes ready.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.iter().map(|p| self.due(p)).min()
    }

    pub fn take_ready(&mut self, now: Instant) -> Vec<ChangeEvent> {
        let (window, max_wait) = (self.window, self.max_wait);
        self.take_where(|p| (p.last_seen + window).min(p.first_seen + max_wait) <= now)
    }

    pub fn drain(&mut self) -> Vec<ChangeEvent> {
        self.take_where(|_| true)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.slots.clear();
    }

    fn take_where(&mut self, ready: impl Fn(&Pending) -> bool) -> Vec<ChangeEvent> {
        if !self.pending.iter().any(&ready) {
            return Vec::new();
        }
        let (out, keep): (Vec<Pending>, Vec<Pending>) = self.pending.drain(..).partition(|p| ready(p));
        self.pending = keep;
        self.slots = self
            .pending
            .iter()
            .enumerate()
            .map(|(i, p)| (p.event.path.clone(), i))
            .collect();
        out.into_iter().map(|p| p.event).collect()
    }
}

/// Maps one notify event to watcher signals.
pub fn translate(event: &Event) -> Vec<WatchSignal> {
    if event.need_rescan() {
        return vec![WatchSignal::Overflow];
    }
    let kind = match &event.kind {
        EventKind::Access(_) => return Vec::new(),
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Remove(_) => Some(ChangeKind::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(ChangeKind::Deleted),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(ChangeKind::Created),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            return vec![
                WatchSignal::Change(ChangeEvent::new(ChangeKind::Deleted, event.paths[0].clone())),
                WatchSignal::Change(ChangeEvent::new(ChangeKind::Created, event.paths[1].clone())),
            ];
        }
        // Direction unknown: look at the filesystem.
        EventKind::Modify(ModifyKind::Name(_)) | EventKind::Any | EventKind::Other => None,
        EventKind::Modify(_) => Some(ChangeKind::Modified),
    };
    if event.paths.is_empty() {
        return vec![WatchSignal::Overflow];
    }
    event
        .paths
        .iter()
        .map(|path| {
            let kind = kind.unwrap_or_else(|| {
                if path.exists() {
                    ChangeKind::Modified
                } else {
                    ChangeKind::Deleted
                }
            });
            WatchSignal::Change(ChangeEvent::new(kind, path.clone()))
        })
        .collect()
}

struct Running {
    stop_tx: Sender<()>,
    thread: Option<JoinHandle<()>>,
    // Dropped first on stop so no callback outlives the thread.
    watcher: Option<RecommendedWatcher>,
}

pub struct FileWatcher {
    config: Arc<Config>,
    sink: Arc<dyn UpdateSink>,
    state: Arc<Mutex<WatcherState>>,
    roots: Vec<PathBuf>,
    running: Option<Running>,
}

impl FileWatcher {
    pub fn new(config: Arc<Config>, sink: Arc<dyn UpdateSink>) -> Self {
        Self {
            config,
            sink,
            state: Arc::new(Mutex::new(WatcherState::Stopped)),
            roots: Vec::new(),
            running: None,
        }
    }

    pub fn state(&self) -> WatcherState {
        *self.state.lock()
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Watches `paths` recursively, replacing any previous watch.
    pub fn start(&mut self, paths: &[PathBuf]) -> Result<()> {
        self.stop();
        *self.state.lock() = WatcherState::Starting;
        let roots: Vec<PathBuf> = paths
            .iter()
            .map(|p| std::fs::canonicalize(p).unwrap_or_else(|_| p.clone()))
            .collect();

        let (tx, rx) = bounded(EVENT_CAPACITY);
        let overflowed = Arc::new(AtomicBool::new(false));
        let callback_overflow = overflowed.clone();
        let watcher = recommended_watcher(move |result: notify::Result<Event>| {
            let signals = match result {
                Ok(event) => translate(&event),
                Err(e) => {
                    tracing::warn!(error = %e, "watcher error");
                    vec![WatchSignal::Overflow]
                }
            };
            for signal in signals {
                if let Err(TrySendError::Full(_)) = tx.try_send(signal) {
                    callback_overflow.store(true, Ordering::SeqCst);
                }
            }
        });
        let mut watcher = match watcher {
            Ok(w) => w,
            Err(e) => {
                *self.state.lock() = WatcherState::Stopped;
                return Err(SeekrError::Watcher(format!("failed to create watcher: {e}")));
            }
        };
        for root in &roots {
            if let Err(e) = watcher.watch(root, RecursiveMode::Recursive) {
                *self.state.lock() = WatcherState::Stopped;
                return Err(SeekrError::Watcher(format!("failed to watch {}: {e}", root.display())));
            }
        }
        self.spawn(roots, rx, overflowed, Some(watcher));
        Ok(())
    }

    /// Runs the debounce loop over signals from `source` instead of notify.
    pub fn start_with_source(&mut self, paths: &[PathBuf], source: Receiver<WatchSignal>) -> Result<()> {
        self.stop();
        *self.state.lock() = WatcherState::Starting;
        self.spawn(paths.to_vec(), source, Arc::new(AtomicBool::new(false)), None);
        Ok(())
    }

    fn spawn(
        &mut self,
        roots: Vec<PathBuf>,
        source: Receiver<WatchSignal>,
        overflowed: Arc<AtomicBool>,
        watcher: Option<RecommendedWatcher>,
    ) {
        let (stop_tx, stop_rx) = bounded(1);
        let event_loop = EventLoop {
            config: self.config.clone(),
            sink: self.sink.clone(),
            state: self.state.clone(),
            roots: roots.clone(),
            overflowed,
        };
        let thread = std::thread::Builder::new()
            .name("seekr-watcher".into())
            .spawn(move || event_loop.run(source, stop_rx));
        match thread {
            Ok(handle) => {
                tracing::info!(roots = roots.len(), "watching for changes");
                self.roots = roots;
                self.running = Some(Running { stop_tx, thread: Some(handle), watcher });
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to spawn watcher thread");
                *self.state.lock() = WatcherState::Stopped;
            }
        }
    }

    /// Stops watching. Pending debounced changes are delivered first.
    pub fn stop(&mut self) {
        if let Some(mut running) = self.running.take() {
            drop(running.watcher.take());
            let _ = running.stop_tx.send(());
            if let Some(thread) = running.thread.take() {
                if thread.join().is_err() {
                    tracing::error!("watcher thread panicked");
                }
            }
            tracing::info!("watcher stopped");
        }
        self.roots.clear();
        *self.state.lock() = WatcherState::Stopped;
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for FileWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatcher")
            .field("state", &self.state())
            .field("roots", &self.roots)
            .finish()
    }
}

struct EventLoop {
    config: Arc<Config>,
    sink: Arc<dyn UpdateSink>,
    state: Arc<Mutex<WatcherState>>,
    roots: Vec<PathBuf>,
    overflowed: Arc<AtomicBool>,
}

impl EventLoop {
    fn run(self, source: Receiver<WatchSignal>, stop_rx: Receiver<()>) {
        let mut source = source;
        let mut debouncer = Debouncer::new(Duration::from_millis(self.config.debounce_ms));
        let rescan_tick = tick(Duration::from_secs(self.config.rescan_interval_secs.max(1)));
        *self.state.lock() = WatcherState::Watching;

        loop {
            let wait = debouncer
                .next_deadline()
                .map_or(IDLE_WAIT, |d| d.saturating_duration_since(Instant::now()));
            let mut lost_events = false;
            let mut source_closed = false;
            select! {
                recv(stop_rx) -> _ => break,
                recv(source) -> signal => match signal {
                    Ok(WatchSignal::Change(event)) => {
                        if !self.excluded(&event.path) {
                            debouncer.push(event, Instant::now());
                        }
                    }
                    Ok(WatchSignal::Overflow) => lost_events = true,
                    Err(_) => source_closed = true,
                },
                recv(rescan_tick) -> _ => {
                    tracing::debug!("periodic rescan");
                    self.sink.rescan(RescanReason::Periodic);
                }
                default(wait) => {}
            }
            // The source is gone; keep serving stop and periodic rescans.
            if source_closed {
                source = never();
            }

            if lost_events || self.overflowed.swap(false, Ordering::SeqCst) {
                *self.state.lock() = WatcherState::Overflow;
                tracing::warn!(dropped = debouncer.pending.len(), "watcher overflow, requesting rescan");
                debouncer.clear();
                self.sink.rescan(RescanReason::Overflow);
                *self.state.lock() = WatcherState::Watching;
            }

            let ready = debouncer.take_ready(Instant::now());
            if !ready.is_empty() {
                self.sink.changes(ready);
            }
        }

        let rest = debouncer.drain();
        if !rest.is_empty() {
            self.sink.changes(rest);
        }
    }

    fn excluded(&self, path: &Path) -> bool {
        self.config.excludes_under(&self.roots, path)
    }
}
