use seekr_core::{Config, IndexMode, Phase, Seekr, SeekrError, Startup};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

struct Fixture {
    docs: TempDir,
    data: TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self {
            docs: tempfile::tempdir().unwrap(),
            data: tempfile::tempdir().unwrap(),
        }
    }

    fn root(&self) -> PathBuf {
        fs::canonicalize(self.docs.path()).unwrap()
    }

    fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.root().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, contents).unwrap();
        path
    }

    fn config(&self) -> Config {
        Config {
            index_path: self.data.path().join("index"),
            auto_index_on_startup: false,
            search_timeout_ms: 0,
            ..Config::default()
        }
    }

    fn open(&self) -> Seekr {
        Seekr::open(self.config()).unwrap()
    }
}

fn filenames(seekr: &Seekr, query: &str) -> Vec<String> {
    seekr.search(query).results.into_iter().map(|r| r.filename).collect()
}

#[test]
fn ranks_the_better_match_first_with_a_snippet() {
    let fx = Fixture::new();
    fx.write("notes.txt", "quarterly report draft");
    fx.write("misc.txt", "a report about nothing in particular");
    let seekr = fx.open();
    let stats = seekr.index_now(vec![fx.root()], IndexMode::Full).unwrap();
    assert_eq!(stats.files_scanned, 2);
    assert_eq!(stats.failures, 0);

    let response = seekr.search("\"quarterly report\"");
    assert_eq!(response.results.len(), 1);
    let top = &response.results[0];
    assert_eq!(top.filename, "notes.txt");
    let snippet = top.snippet.as_ref().unwrap();
    assert!(snippet.text.contains("quarterly report"), "{}", snippet.text);
    assert!(!snippet.highlights.is_empty());

    let response = seekr.search("quarterly OR report");
    assert_eq!(response.results.len(), 2);
    assert_eq!(response.results[0].filename, "notes.txt");
    assert!(response.results[0].score > response.results[1].score);
}

#[test]
fn deleted_file_disappears_after_incremental_update() {
    let fx = Fixture::new();
    let doomed = fx.write("budget.txt", "numbers");
    fx.write("plan.txt", "numbers and more numbers");
    let seekr = fx.open();
    seekr.index_now(vec![fx.root()], IndexMode::Full).unwrap();
    assert_eq!(filenames(&seekr, "numbers").len(), 2);

    fs::remove_file(&doomed).unwrap();
    let stats = seekr.index_now(vec![doomed.clone()], IndexMode::Incremental).unwrap();
    assert_eq!(stats.files_removed, 1);
    assert_eq!(filenames(&seekr, "numbers"), vec!["plan.txt"]);
    assert!(seekr.file_info(&doomed).is_none());
}

#[test]
fn unchanged_tree_keeps_its_generation() {
    let fx = Fixture::new();
    fx.write("a.txt", "alpha");
    fx.write("nested/b.md", "beta");
    let seekr = fx.open();
    let first = seekr.index_now(vec![fx.root()], IndexMode::Full).unwrap();
    assert_eq!(first.files_extracted, 2);

    let second = seekr.index_now(vec![fx.root()], IndexMode::Full).unwrap();
    assert_eq!(second.files_extracted, 0);
    assert_eq!(second.files_unchanged, 2);
    assert_eq!(second.generation, first.generation);
    assert_eq!(seekr.index_stats().generation, first.generation);
}

#[test]
fn extension_filter_alone_lists_matching_files() {
    let fx = Fixture::new();
    fx.write("report.pdf", "%PDF-1.4");
    fx.write("report.txt", "report");
    fx.write("summary.docx", "summary");
    let seekr = fx.open();
    seekr.index_now(vec![fx.root()], IndexMode::Full).unwrap();

    assert_eq!(filenames(&seekr, "ext:pdf"), vec!["report.pdf"]);
    assert_eq!(filenames(&seekr, "report .txt"), vec!["report.txt"]);
}

#[test]
fn size_filters_select_large_files() {
    let fx = Fixture::new();
    let small = fs::File::create(fx.root().join("small.bin")).unwrap();
    small.set_len(1024 * 1024).unwrap();
    let big = fs::File::create(fx.root().join("big.bin")).unwrap();
    big.set_len(15 * 1024 * 1024).unwrap();
    drop((small, big));

    let seekr = fx.open();
    seekr.index_now(vec![fx.root()], IndexMode::Full).unwrap();
    assert_eq!(filenames(&seekr, "large files"), vec!["big.bin"]);
    assert_eq!(filenames(&seekr, ">10MB"), vec!["big.bin"]);
    assert_eq!(filenames(&seekr, "size < 2mb"), vec!["small.bin"]);
}

#[test]
fn fuzzy_matching_needs_a_distance() {
    let fx = Fixture::new();
    fx.write("design_document.txt", "layout notes");
    let seekr = Seekr::open(Config { enable_fuzzy: false, ..fx.config() }).unwrap();
    seekr.index_now(vec![fx.root()], IndexMode::Full).unwrap();

    assert!(filenames(&seekr, "documnet").is_empty());
    assert_eq!(filenames(&seekr, "documnet~2"), vec!["design_document.txt"]);
}

#[test]
fn configured_fuzzy_distance_applies_to_plain_words() {
    let fx = Fixture::new();
    fx.write("design_document.txt", "layout notes");
    let seekr = fx.open();
    seekr.index_now(vec![fx.root()], IndexMode::Full).unwrap();
    assert_eq!(filenames(&seekr, "documnet"), vec!["design_document.txt"]);
}

#[test]
fn wildcard_matches_whole_file_names() {
    let fx = Fixture::new();
    fx.write("report_final.pdf", "");
    fx.write("summary.pdf", "");
    fx.write("report_final.txt", "");
    let seekr = fx.open();
    seekr.index_now(vec![fx.root()], IndexMode::Full).unwrap();
    assert_eq!(filenames(&seekr, "report*.pdf"), vec!["report_final.pdf"]);
}

#[test]
fn excluded_directories_are_not_indexed() {
    let fx = Fixture::new();
    fx.write("src/main.rs", "fn main() {}");
    fx.write("node_modules/pkg/index.js", "main");
    fx.write(".hidden/secret.txt", "main");
    let seekr = fx.open();
    let stats = seekr.index_now(vec![fx.root()], IndexMode::Full).unwrap();
    assert_eq!(stats.files_scanned, 1);
    assert_eq!(filenames(&seekr, "main"), vec!["main.rs"]);
}

#[test]
fn index_survives_a_restart() {
    let fx = Fixture::new();
    fx.write("journal.md", "persistence matters");
    let generation = {
        let seekr = fx.open();
        seekr.index_now(vec![fx.root()], IndexMode::Full).unwrap().generation
    };

    let seekr = fx.open();
    assert_eq!(seekr.startup(), &Startup::Loaded { generation, documents: 1 });
    assert_eq!(filenames(&seekr, "persistence"), vec!["journal.md"]);
    let stats = seekr.index_stats();
    assert_eq!(stats.document_count, 1);
    assert!(stats.last_updated.is_some());
    assert_eq!(stats.roots, vec![fx.root().display().to_string()]);
}

fn corrupt_generations(index: &Path) {
    for entry in fs::read_dir(index).unwrap() {
        let path = entry.unwrap().path();
        if path.extension().is_some_and(|e| e == "bin") {
            fs::write(&path, b"definitely not an index").unwrap();
        }
    }
}

#[test]
fn corrupt_index_is_rebuilt_from_watch_paths() {
    let fx = Fixture::new();
    fx.write("ledger.csv", "debit,credit");
    let config = Config { watch_paths: vec![fx.root()], ..fx.config() };
    {
        let seekr = Seekr::open(config.clone()).unwrap();
        seekr.index_now(vec![fx.root()], IndexMode::Full).unwrap();
    }
    corrupt_generations(&config.index_path);

    let seekr = Seekr::open(config).unwrap();
    assert!(matches!(seekr.startup(), Startup::Rebuilding { .. }));
    assert!(seekr.wait_idle_timeout(Duration::from_secs(30)));
    assert_eq!(filenames(&seekr, "debit"), vec!["ledger.csv"]);
}

#[test]
fn clear_drops_every_document() {
    let fx = Fixture::new();
    fx.write("a.txt", "alpha");
    let seekr = fx.open();
    let before = seekr.index_now(vec![fx.root()], IndexMode::Full).unwrap().generation;
    let after = seekr.clear_index().unwrap();
    assert!(after > before);
    assert_eq!(seekr.index_stats().document_count, 0);
    assert!(filenames(&seekr, "alpha").is_empty());
}

#[test]
fn progress_stream_ends_with_the_pass() {
    let fx = Fixture::new();
    for i in 0..5 {
        fx.write(&format!("file{i}.txt"), "content");
    }
    let seekr = fx.open();
    let events = seekr.progress_events();
    seekr.start_index(vec![fx.root()]).unwrap();
    let phases: Vec<Phase> = events.map(|e| e.phase).collect();
    assert_eq!(phases.last(), Some(&Phase::Done));
    seekr.wait_idle();
    assert_eq!(seekr.index_stats().document_count, 5);
}

#[test]
fn empty_query_without_filters_returns_nothing() {
    let fx = Fixture::new();
    fx.write("a.txt", "alpha");
    let seekr = fx.open();
    seekr.index_now(vec![fx.root()], IndexMode::Full).unwrap();
    let response = seekr.search("   ");
    assert!(response.results.is_empty());
    assert_eq!(response.total_hits, 0);
}

#[test]
fn missing_root_is_reported_not_fatal() {
    let fx = Fixture::new();
    fx.write("a.txt", "alpha");
    let seekr = fx.open();
    let stats = seekr
        .index_now(vec![fx.root(), fx.root().join("does-not-exist")], IndexMode::Full)
        .unwrap();
    assert_eq!(stats.files_scanned, 1);
    assert_eq!(stats.failures, 1);
    assert_eq!(stats.failed_paths, vec![fx.root().join("does-not-exist").display().to_string()]);
    assert_eq!(filenames(&seekr, "alpha"), vec!["a.txt"]);
}

#[cfg(unix)]
#[test]
fn unreadable_file_is_counted_and_skipped() {
    use std::os::unix::fs::PermissionsExt;

    let fx = Fixture::new();
    fx.write("open.txt", "visible words");
    let locked = fx.write("locked.txt", "hidden words");
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
    if fs::read(&locked).is_ok() {
        // Permission bits do not apply to this user.
        return;
    }
    let seekr = fx.open();
    let stats = seekr.index_now(vec![fx.root()], IndexMode::Full).unwrap();
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o644)).unwrap();

    assert_eq!(stats.failures, 1);
    assert_eq!(stats.failed_paths, vec![locked.display().to_string()]);
    assert_eq!(filenames(&seekr, "visible"), vec!["open.txt"]);
    assert!(seekr.file_info(&locked).is_none());
    let status = seekr.index_stats();
    assert_eq!(status.document_count, 1);
    assert_eq!(status.failures, 1);
}

#[test]
fn field_searches_look_at_one_field() {
    let fx = Fixture::new();
    fx.write("budget.txt", "quarterly numbers");
    fx.write("notes.txt", "the budget is tight");
    fx.write("budget/plan.md", "spring plan");
    let seekr = Seekr::open(Config { enable_fuzzy: false, ..fx.config() }).unwrap();
    seekr.index_now(vec![fx.root()], IndexMode::Full).unwrap();

    let names = |response: seekr_core::SearchResponse| -> Vec<String> {
        response.results.into_iter().map(|r| r.filename).collect()
    };
    assert_eq!(names(seekr.search_filename("budget")), vec!["budget.txt"]);
    assert_eq!(names(seekr.search_content("budget")), vec!["notes.txt"]);
    assert_eq!(filenames(&seekr, "name:budget"), vec!["budget.txt"]);
    assert_eq!(filenames(&seekr, "content:budget"), vec!["notes.txt"]);
    assert_eq!(filenames(&seekr, "dirname:budget"), vec!["plan.md"]);
    assert_eq!(filenames(&seekr, "any:spring"), vec!["plan.md"]);
}

#[test]
fn shutdown_answers_everything_still_queued() {
    let fx = Fixture::new();
    for i in 0..20 {
        fx.write(&format!("file{i}.txt"), "content");
    }
    let seekr = Arc::new(fx.open());
    let senders: Vec<_> = (0..4)
        .map(|_| {
            let seekr = seekr.clone();
            let root = fx.root();
            thread::spawn(move || {
                while seekr.start_index(vec![root.clone()]).is_ok() {
                    thread::sleep(Duration::from_millis(1));
                }
            })
        })
        .collect();
    thread::sleep(Duration::from_millis(50));
    seekr.shutdown();
    for sender in senders {
        sender.join().unwrap();
    }

    assert!(seekr.wait_idle_timeout(Duration::from_secs(10)));
    assert_eq!(seekr.index_stats().pending_requests, 0);
    assert!(matches!(
        seekr.index_now(vec![fx.root()], IndexMode::Full),
        Err(SeekrError::WorkerStopped)
    ));
    assert!(matches!(seekr.clear_index(), Err(SeekrError::WorkerStopped)));
}
