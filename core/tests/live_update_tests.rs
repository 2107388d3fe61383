use crossbeam_channel::unbounded;
use parking_lot::Mutex;
use seekr_core::cancel::CancellationToken;
use seekr_core::parser::{ParserOptions, QueryParser};
use seekr_core::watcher::{RescanReason, UpdateSink, WatchSignal};
use seekr_core::{
    ChangeEvent, ChangeKind, Config, FileWatcher, IndexMode, IndexStore, Indexer, PathChange, SearchEngine,
    SearchOptions, WatcherState,
};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn test_config() -> Arc<Config> {
    Arc::new(Config {
        auto_index_on_startup: false,
        debounce_ms: 20,
        ..Config::default()
    })
}

#[test]
fn searches_see_whole_generations_during_commits() {
    let dir = tempfile::tempdir().unwrap();
    let root = fs::canonicalize(dir.path()).unwrap();
    let store = Arc::new(IndexStore::in_memory());
    let indexer = Indexer::new(test_config(), store.clone());
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let store = store.clone();
            let done = done.clone();
            thread::spawn(move || {
                let parser = QueryParser::new(ParserOptions::default());
                let engine = SearchEngine::new(SearchOptions::default());
                let query = parser.parse("batch");
                let mut checked = 0;
                while !done.load(Ordering::SeqCst) || checked == 0 {
                    let snapshot = store.snapshot();
                    assert!(snapshot.is_consistent());
                    let response = engine.search_until(&snapshot, &query, 1000, None);
                    assert_eq!(response.generation, snapshot.id);
                    // Every file of a batch lands in the same generation.
                    assert_eq!(response.total_hits % 3, 0, "generation {}", snapshot.id);
                    for hit in &response.results {
                        assert!(snapshot.docs.contains_key(&hit.doc_id));
                    }
                    checked += 1;
                }
            })
        })
        .collect();

    for batch in 0..10 {
        for i in 0..3 {
            fs::write(root.join(format!("batch{batch}_{i}.txt")), "batch entry").unwrap();
        }
        indexer.index(&[root.clone()], IndexMode::Full, &CancellationToken::noop()).unwrap();
    }
    done.store(true, Ordering::SeqCst);
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(store.snapshot().num_docs(), 30);
}

#[test]
fn cancelled_pass_commits_nothing_it_did_not_finish() {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..20 {
        fs::write(dir.path().join(format!("f{i}.txt")), "words").unwrap();
    }
    let store = Arc::new(IndexStore::in_memory());
    let indexer = Indexer::new(test_config(), store.clone());
    let source = seekr_core::CancelSource::new();
    let token = source.token();
    source.cancel();

    let stats = indexer.index(&[dir.path().to_path_buf()], IndexMode::Full, &token).unwrap();
    assert!(stats.cancelled);
    assert!(store.snapshot().is_consistent());
    assert!(store.snapshot().num_docs() < 20);

    let stats = indexer.index(&[dir.path().to_path_buf()], IndexMode::Full, &source.token()).unwrap();
    assert!(!stats.cancelled);
    assert_eq!(store.snapshot().num_docs(), 20);
}

/// Applies watcher batches straight to an indexer, recording what it saw.
struct IndexingSink {
    indexer: Indexer,
    batches: Mutex<Vec<Vec<ChangeEvent>>>,
    rescans: Mutex<Vec<RescanReason>>,
}

impl UpdateSink for IndexingSink {
    fn changes(&self, events: Vec<ChangeEvent>) {
        let changes: Vec<PathChange> = events
            .iter()
            .map(|e| match e.kind {
                ChangeKind::Deleted => PathChange::Remove(e.path.clone()),
                _ => PathChange::Upsert(e.path.clone()),
            })
            .collect();
        self.indexer.apply_changes(&changes, &CancellationToken::noop()).unwrap();
        self.batches.lock().push(events);
    }

    fn rescan(&self, reason: RescanReason) {
        self.rescans.lock().push(reason);
    }
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn watcher_batches_flow_into_the_index() {
    let dir = tempfile::tempdir().unwrap();
    let root = fs::canonicalize(dir.path()).unwrap();
    let config = Arc::new(Config { debounce_ms: 100, ..(*test_config()).clone() });
    let store = Arc::new(IndexStore::in_memory());
    let indexer = Indexer::new(config.clone(), store.clone());
    indexer.index(&[root.clone()], IndexMode::Full, &CancellationToken::noop()).unwrap();

    let sink = Arc::new(IndexingSink {
        indexer: Indexer::new(config.clone(), store.clone()),
        batches: Mutex::new(Vec::new()),
        rescans: Mutex::new(Vec::new()),
    });
    let (tx, rx) = unbounded();
    let mut watcher = FileWatcher::new(config, sink.clone());
    watcher.start_with_source(&[root.clone()], rx).unwrap();
    assert!(wait_for(|| watcher.state() == WatcherState::Watching));

    let draft = root.join("draft.md");
    fs::write(&draft, "first version").unwrap();
    tx.send(WatchSignal::Change(ChangeEvent::new(ChangeKind::Created, &draft))).unwrap();
    fs::write(&draft, "second version").unwrap();
    tx.send(WatchSignal::Change(ChangeEvent::new(ChangeKind::Modified, &draft))).unwrap();

    assert!(wait_for(|| store.snapshot().num_docs() == 1));
    let batches = sink.batches.lock().clone();
    assert_eq!(batches, vec![vec![ChangeEvent::new(ChangeKind::Created, &draft)]]);
    let doc = store.document(&draft.to_string_lossy()).unwrap();
    assert_eq!(doc.text.as_deref(), Some("second version"));

    fs::remove_file(&draft).unwrap();
    tx.send(WatchSignal::Change(ChangeEvent::new(ChangeKind::Deleted, &draft))).unwrap();
    assert!(wait_for(|| store.snapshot().num_docs() == 0));

    tx.send(WatchSignal::Overflow).unwrap();
    assert!(wait_for(|| sink.rescans.lock().contains(&RescanReason::Overflow)));

    watcher.stop();
    assert_eq!(watcher.state(), WatcherState::Stopped);
}

#[test]
fn create_then_delete_nets_to_a_delete() {
    let dir = tempfile::tempdir().unwrap();
    let root = fs::canonicalize(dir.path()).unwrap();
    let config = Arc::new(Config { debounce_ms: 200, ..(*test_config()).clone() });
    let store = Arc::new(IndexStore::in_memory());
    let sink = Arc::new(IndexingSink {
        indexer: Indexer::new(config.clone(), store.clone()),
        batches: Mutex::new(Vec::new()),
        rescans: Mutex::new(Vec::new()),
    });
    let (tx, rx) = unbounded();
    let mut watcher = FileWatcher::new(config, sink.clone());
    watcher.start_with_source(&[root.clone()], rx).unwrap();

    let scratch = root.join("scratch.tmp");
    tx.send(WatchSignal::Change(ChangeEvent::new(ChangeKind::Created, &scratch))).unwrap();
    tx.send(WatchSignal::Change(ChangeEvent::new(ChangeKind::Deleted, &scratch))).unwrap();
    let keep = root.join("keep.txt");
    fs::write(&keep, "kept").unwrap();
    tx.send(WatchSignal::Change(ChangeEvent::new(ChangeKind::Created, &keep))).unwrap();

    assert!(wait_for(|| store.snapshot().num_docs() == 1));
    watcher.stop();
    let seen: Vec<ChangeEvent> = sink.batches.lock().iter().flatten().cloned().collect();
    assert_eq!(
        seen,
        vec![
            ChangeEvent::new(ChangeKind::Deleted, &scratch),
            ChangeEvent::new(ChangeKind::Created, &keep),
        ]
    );
    assert_eq!(store.snapshot().num_docs(), 1);
}
