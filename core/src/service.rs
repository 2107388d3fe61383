//! The `Seekr` service: one background indexing worker, any number of
//! concurrent searches, an optional live watcher.
//!
//! Every index mutation (full passes, watcher batches, rescans, clears) goes
//! through one queue drained in order by the worker thread, so the store only
//! ever sees a single writer. Searches read snapshots and never wait on it.

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::cancel::CancelSource;
use crate::config::Config;
use crate::error::{Result, SeekrError};
use crate::index::Document;
use crate::indexer::{IndexMode, IndexStats, Indexer, PathChange};
use crate::parser::QueryParser;
use crate::progress::{ProgressHub, ProgressStream};
use crate::query::{Query, TermTarget};
use crate::search::{SearchEngine, SearchOptions, SearchResponse};
use crate::store::{self, IndexStore, LoadOutcome};
use crate::watcher::{ChangeEvent, ChangeKind, FileWatcher, RescanReason, UpdateSink, WatcherState};

type Reply<T> = Sender<Result<T>>;

enum IndexRequest {
    Index {
        paths: Vec<PathBuf>,
        mode: IndexMode,
        reply: Option<Reply<IndexStats>>,
    },
    Changes(Vec<PathChange>),
    Rescan,
    Clear {
        reply: Reply<u64>,
    },
    Shutdown,
}

/// How the persisted index looked when the service opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum Startup {
    Fresh,
    Loaded { generation: u64, documents: usize },
    /// The stored index was unreadable and is being rebuilt from the watch paths.
    Rebuilding { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    pub document_count: usize,
    /// RFC 3339 time of the last commit, if there was one.
    pub last_updated: Option<String>,
    pub generation: u64,
    /// Failures of the most recent pass.
    pub failures: usize,
    pub failed_paths: Vec<String>,
    pub roots: Vec<String>,
    pub watcher: WatcherState,
    pub pending_requests: usize,
}

#[derive(Debug, Default)]
struct WorkState {
    pending: Mutex<usize>,
    idle: Condvar,
    rescan_queued: AtomicBool,
    shutting_down: AtomicBool,
}

impl WorkState {
    fn done(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.idle.notify_all();
        }
    }
}

/// Cloneable handle for putting requests on the worker queue.
#[derive(Clone)]
struct Queue {
    tx: Sender<IndexRequest>,
    work: Arc<WorkState>,
}

impl Queue {
    /// Counts and enqueues `request` under the `pending` lock, so the worker's
    /// final drain sees every request accepted before shutdown.
    fn send(&self, request: IndexRequest) -> Result<()> {
        let mut pending = self.work.pending.lock();
        let stopping = self.work.shutting_down.load(Ordering::SeqCst);
        if stopping && !matches!(request, IndexRequest::Shutdown) {
            return Err(SeekrError::WorkerStopped);
        }
        self.tx.send(request).map_err(|_| SeekrError::WorkerStopped)?;
        *pending += 1;
        Ok(())
    }
}

impl UpdateSink for Queue {
    fn changes(&self, events: Vec<ChangeEvent>) {
        let changes = events
            .into_iter()
            .map(|event| match event.kind {
                ChangeKind::Deleted => PathChange::Remove(event.path),
                ChangeKind::Created | ChangeKind::Modified => PathChange::Upsert(event.path),
            })
            .collect();
        if let Err(e) = self.send(IndexRequest::Changes(changes)) {
            tracing::warn!(error = %e, "dropping watcher changes");
        }
    }

    fn rescan(&self, reason: RescanReason) {
        if self.work.rescan_queued.swap(true, Ordering::SeqCst) {
            tracing::debug!(?reason, "rescan already queued");
            return;
        }
        tracing::info!(?reason, "rescan requested");
        if let Err(e) = self.send(IndexRequest::Rescan) {
            self.work.rescan_queued.store(false, Ordering::SeqCst);
            tracing::warn!(error = %e, "dropping rescan request");
        }
    }
}

pub struct Seekr {
    config: Arc<Config>,
    store: Arc<IndexStore>,
    parser: QueryParser,
    engine: SearchEngine,
    progress: Arc<ProgressHub>,
    cancel: CancelSource,
    queue: Queue,
    last_stats: Arc<Mutex<Option<IndexStats>>>,
    startup: Startup,
    watcher: Mutex<FileWatcher>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Seekr {
    /// Loads the persisted index at `config.index_path` and starts the worker.
    /// A corrupt index is wiped and rebuilt in the background.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let store = Arc::new(IndexStore::new(&config.index_path));
        let startup = match store.load() {
            Ok(LoadOutcome::Fresh) => Startup::Fresh,
            Ok(LoadOutcome::Loaded { generation, documents }) => Startup::Loaded { generation, documents },
            Err(e) if e.is_corruption() => {
                tracing::warn!(error = %e, "index is corrupt, rebuilding");
                store.reset()?;
                Startup::Rebuilding { reason: e.to_string() }
            }
            Err(e) => return Err(e),
        };

        let progress = Arc::new(ProgressHub::new());
        let cancel = CancelSource::new();
        let (tx, rx) = unbounded();
        let work = Arc::new(WorkState::default());
        let queue = Queue { tx, work: work.clone() };
        let last_stats = Arc::new(Mutex::new(None));

        let worker = Worker {
            config: config.clone(),
            store: store.clone(),
            indexer: Indexer::new(config.clone(), store.clone()).with_progress(progress.clone()),
            cancel: cancel.clone(),
            work,
            last_stats: last_stats.clone(),
        };
        let handle = std::thread::Builder::new()
            .name("seekr-indexer".into())
            .spawn(move || worker.run(rx))?;

        let watcher = FileWatcher::new(config.clone(), Arc::new(queue.clone()));
        let seekr = Self {
            parser: QueryParser::from_config(&config),
            engine: SearchEngine::new(SearchOptions::from(config.as_ref())),
            config,
            store,
            progress,
            cancel,
            queue,
            last_stats,
            startup,
            watcher: Mutex::new(watcher),
            worker: Mutex::new(Some(handle)),
        };

        let rebuild = matches!(seekr.startup, Startup::Rebuilding { .. });
        if (rebuild || seekr.config.auto_index_on_startup) && !seekr.config.watch_paths.is_empty() {
            seekr.start_index(seekr.config.watch_paths.clone())?;
        }
        Ok(seekr)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn startup(&self) -> &Startup {
        &self.startup
    }

    /// Queues a full pass over `paths` and returns immediately.
    pub fn start_index(&self, paths: Vec<PathBuf>) -> Result<()> {
        self.queue.send(IndexRequest::Index { paths, mode: IndexMode::Full, reply: None })
    }

    /// Runs a pass through the worker queue and waits for its result.
    pub fn index_now(&self, paths: Vec<PathBuf>, mode: IndexMode) -> Result<IndexStats> {
        let (reply, rx) = bounded(1);
        self.queue.send(IndexRequest::Index { paths, mode, reply: Some(reply) })?;
        rx.recv().map_err(|_| SeekrError::WorkerStopped)?
    }

    /// Queues a full pass over every known root plus the configured watch paths.
    pub fn reindex_all(&self) -> Result<()> {
        let roots = known_roots(&self.config, &self.store);
        self.queue.send(IndexRequest::Index { paths: roots, mode: IndexMode::Full, reply: None })
    }

    /// Cancels the pass that is currently running. Queued requests still run.
    pub fn cancel_index(&self) {
        tracing::info!("cancelling current indexing pass");
        self.cancel.cancel();
    }

    /// Drops every document.
    pub fn clear_index(&self) -> Result<u64> {
        let (reply, rx) = bounded(1);
        self.queue.send(IndexRequest::Clear { reply })?;
        rx.recv().map_err(|_| SeekrError::WorkerStopped)?
    }

    pub fn index_stats(&self) -> IndexStatus {
        let snapshot = self.store.snapshot();
        let last = self.last_stats.lock().clone().unwrap_or_default();
        IndexStatus {
            document_count: snapshot.num_docs(),
            last_updated: (snapshot.id > 0).then(|| store::format_unix(snapshot.committed_at)),
            generation: snapshot.id,
            failures: last.failures,
            failed_paths: last.failed_paths,
            roots: snapshot.roots.clone(),
            watcher: self.watcher.lock().state(),
            pending_requests: *self.queue.work.pending.lock(),
        }
    }

    pub fn parse(&self, raw: &str) -> Query {
        self.parser.parse(raw)
    }

    /// Parses and runs `raw` with the configured result limit and timeout.
    pub fn search(&self, raw: &str) -> SearchResponse {
        self.search_with_limit(raw, self.config.max_results)
    }

    pub fn search_with_limit(&self, raw: &str, max_results: usize) -> SearchResponse {
        let query = self.parser.parse(raw);
        tracing::debug!(query = raw, notes = query.notes.len(), "search");
        self.search_query(&query, max_results)
    }

    /// Like [`Seekr::search`] with free words matched against file names only.
    pub fn search_filename(&self, raw: &str) -> SearchResponse {
        self.search_in(raw, TermTarget::Filename, self.config.max_results)
    }

    /// Like [`Seekr::search`] with free words matched against file contents only.
    pub fn search_content(&self, raw: &str) -> SearchResponse {
        self.search_in(raw, TermTarget::Content, self.config.max_results)
    }

    pub fn search_in(&self, raw: &str, target: TermTarget, max_results: usize) -> SearchResponse {
        let mut query = self.parser.parse(raw);
        if let Some(root) = &mut query.root {
            root.restrict_to(target);
        }
        tracing::debug!(query = raw, ?target, "targeted search");
        self.search_query(&query, max_results)
    }

    pub fn search_query(&self, query: &Query, max_results: usize) -> SearchResponse {
        let snapshot = self.store.snapshot();
        self.engine.execute(&snapshot, query, max_results.max(1))
    }

    /// The stored document for `path`, if indexed.
    pub fn file_info(&self, path: &Path) -> Option<Arc<Document>> {
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        self.store
            .document(&canonical.to_string_lossy())
            .or_else(|| self.store.document(&path.to_string_lossy()))
    }

    /// Starts watching `paths` (the configured watch paths when empty).
    pub fn watch_start(&self, paths: Vec<PathBuf>) -> Result<()> {
        let paths = if paths.is_empty() { self.config.watch_paths.clone() } else { paths };
        if paths.is_empty() {
            return Err(SeekrError::Watcher("no paths to watch".into()));
        }
        self.watcher.lock().start(&paths)
    }

    pub fn watch_stop(&self) {
        self.watcher.lock().stop();
    }

    pub fn watcher_state(&self) -> WatcherState {
        self.watcher.lock().state()
    }

    /// Events of the current or next indexing pass; ends with that pass.
    pub fn progress_events(&self) -> ProgressStream {
        self.progress.subscribe()
    }

    /// Blocks until the worker queue is empty.
    pub fn wait_idle(&self) {
        let mut pending = self.queue.work.pending.lock();
        while *pending > 0 {
            self.queue.work.idle.wait(&mut pending);
        }
    }

    /// Like [`Seekr::wait_idle`]; false when `timeout` passed first.
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = self.queue.work.pending.lock();
        while *pending > 0 {
            if self.queue.work.idle.wait_until(&mut pending, deadline).timed_out() {
                return *pending == 0;
            }
        }
        true
    }

    /// Stops the watcher and the worker. Queued requests are answered with
    /// [`SeekrError::WorkerStopped`].
    pub fn shutdown(&self) {
        self.watcher.lock().stop();
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        self.queue.work.shutting_down.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        let _ = self.queue.send(IndexRequest::Shutdown);
        if handle.join().is_err() {
            tracing::error!("indexing worker panicked");
        }
        tracing::info!("seekr stopped");
    }
}

impl Drop for Seekr {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Seekr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Seekr")
            .field("store", &self.store)
            .field("startup", &self.startup)
            .finish()
    }
}

/// Stored roots plus the configured watch paths, canonicalized and deduplicated.
fn known_roots(config: &Config, store: &IndexStore) -> Vec<PathBuf> {
    let snapshot = store.snapshot();
    let roots: BTreeSet<PathBuf> = snapshot
        .roots
        .iter()
        .map(PathBuf::from)
        .chain(config.watch_paths.iter().cloned())
        .map(|p| std::fs::canonicalize(&p).unwrap_or(p))
        .collect();
    roots.into_iter().collect()
}

struct Worker {
    config: Arc<Config>,
    store: Arc<IndexStore>,
    indexer: Indexer,
    cancel: CancelSource,
    work: Arc<WorkState>,
    last_stats: Arc<Mutex<Option<IndexStats>>>,
}

impl Worker {
    fn run(self, rx: Receiver<IndexRequest>) {
        for request in rx.iter() {
            if matches!(request, IndexRequest::Shutdown) {
                self.work.done();
                self.drain(&rx);
                break;
            }
            if self.work.shutting_down.load(Ordering::SeqCst) {
                self.reject(request);
            } else {
                self.handle(request);
            }
            self.work.done();
        }
        tracing::debug!("indexing worker exiting");
    }

    fn handle(&self, request: IndexRequest) {
        match request {
            IndexRequest::Index { paths, mode, reply } => {
                let result = self.indexer.index(&paths, mode, &self.cancel.token());
                self.record(&result);
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            IndexRequest::Changes(changes) => {
                let result = self.indexer.apply_changes(&changes, &self.cancel.token());
                self.record(&result);
            }
            IndexRequest::Rescan => {
                self.work.rescan_queued.store(false, Ordering::SeqCst);
                let roots = known_roots(&self.config, &self.store);
                if roots.is_empty() {
                    return;
                }
                let result = self.indexer.index(&roots, IndexMode::Full, &self.cancel.token());
                self.record(&result);
            }
            IndexRequest::Clear { reply } => {
                let result = self.store.clear();
                if result.is_ok() {
                    *self.last_stats.lock() = None;
                }
                let _ = reply.send(result);
            }
            IndexRequest::Shutdown => {}
        }
    }

    /// Rejects whatever was queued behind the shutdown request.
    fn drain(&self, rx: &Receiver<IndexRequest>) {
        let mut pending = self.work.pending.lock();
        for request in rx.try_iter() {
            self.reject(request);
            *pending = pending.saturating_sub(1);
        }
        if *pending == 0 {
            self.work.idle.notify_all();
        }
    }

    fn reject(&self, request: IndexRequest) {
        match request {
            IndexRequest::Index { reply: Some(reply), .. } => {
                let _ = reply.send(Err(SeekrError::WorkerStopped));
            }
            IndexRequest::Clear { reply } => {
                let _ = reply.send(Err(SeekrError::WorkerStopped));
            }
            _ => {}
        }
    }

    fn record(&self, result: &Result<IndexStats>) {
        match result {
            Ok(stats) => *self.last_stats.lock() = Some(stats.clone()),
            Err(e) => tracing::error!(error = %e, "index request failed"),
        }
    }
}
