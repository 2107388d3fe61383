//! Walks directories, fingerprints files and stages index changes.
//!
//! Every pass ends in exactly one commit on the [`IndexStore`]. Files whose
//! fingerprint matches the stored one are skipped without reading their text
//! again. Per-file failures are counted and the pass moves on; a failing
//! commit aborts the pass.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, UNIX_EPOCH};
use walkdir::WalkDir;
use xxhash_rust::xxh3::{xxh3_64, Xxh3};

use crate::cancel::CancellationToken;
use crate::config::Config;
use crate::error::{Result, SeekrError};
use crate::index::{Changeset, Document, Field, Generation, TermPositions, Upsert, NAME_POSITION};
use crate::progress::{Phase, ProgressEvent, ProgressHub};
use crate::store::IndexStore;
use crate::tokenizer;

/// Failed paths kept in [`IndexStats::failed_paths`]; the rest are only counted.
pub const MAX_REPORTED_FAILURES: usize = 20;

const PROGRESS_EVERY: usize = 64;
const SNIFF_BYTES: usize = 8 * 1024;
const HASH_BUFFER: usize = 64 * 1024;

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "rst", "csv", "tsv", "json", "yaml", "yml", "toml", "ini", "cfg", "conf",
    "log", "xml", "html", "htm", "css", "js", "jsx", "ts", "tsx", "py", "rs", "go", "java", "c", "h",
    "cpp", "hpp", "cc", "rb", "sh", "bash", "zsh", "sql", "php", "swift", "kt", "scala", "lua", "pl",
    "r", "tex",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexMode {
    /// Walk the given roots, index everything eligible and prune documents
    /// that were not seen.
    Full,
    /// Re-examine exactly the given paths.
    Incremental,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathChange {
    /// Created or modified. A path that no longer exists is removed instead.
    Upsert(PathBuf),
    Remove(PathBuf),
}

impl PathChange {
    pub fn path(&self) -> &Path {
        match self {
            PathChange::Upsert(p) | PathChange::Remove(p) => p,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub files_scanned: usize,
    /// Documents added, updated or removed.
    pub files_changed: usize,
    /// Files whose text was read and tokenized.
    pub files_extracted: usize,
    pub files_unchanged: usize,
    pub files_removed: usize,
    pub failures: usize,
    /// The first [`MAX_REPORTED_FAILURES`] paths that failed.
    pub failed_paths: Vec<String>,
    pub cancelled: bool,
    /// Generation current after the pass.
    pub generation: u64,
    pub elapsed_ms: u64,
}

pub struct Indexer {
    config: Arc<Config>,
    store: Arc<IndexStore>,
    progress: Option<Arc<ProgressHub>>,
}

enum Staged {
    Unchanged,
    Changed(Upsert),
    /// Not a regular file, or too large to index.
    Ineligible,
}

struct Pass<'a> {
    progress: Option<&'a ProgressHub>,
    started: Instant,
    stats: IndexStats,
    changes: Changeset,
    deleted: HashSet<String>,
}

impl<'a> Pass<'a> {
    fn new(progress: Option<&'a ProgressHub>) -> Self {
        Self {
            progress,
            started: Instant::now(),
            stats: IndexStats::default(),
            changes: Changeset::default(),
            deleted: HashSet::new(),
        }
    }

    fn event(&self, phase: Phase, current_path: Option<&Path>, percent: f32) -> ProgressEvent {
        ProgressEvent {
            phase,
            current_path: current_path.map(|p| p.display().to_string()),
            percent,
            files_scanned: self.stats.files_scanned,
            files_changed: self.changes.upserts.len() + self.changes.deletes.len(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }

    fn emit(&self, phase: Phase, current_path: Option<&Path>, percent: f32) {
        if let Some(hub) = self.progress {
            hub.emit(self.event(phase, current_path, percent));
        }
    }

    fn fail(&mut self, err: SeekrError) {
        tracing::warn!(error = %err, "skipping file");
        self.stats.failures += 1;
        if self.stats.failed_paths.len() < MAX_REPORTED_FAILURES {
            let path = match &err {
                SeekrError::FileAccess { path, .. } => path.display().to_string(),
                other => other.to_string(),
            };
            self.stats.failed_paths.push(path);
        }
    }

    fn delete(&mut self, key: String) {
        if self.deleted.insert(key.clone()) {
            self.changes.deletes.push(key);
        }
    }

    fn delete_under(&mut self, snapshot: &Generation, prefix: &Path) {
        let mut doomed: Vec<String> = snapshot
            .paths
            .keys()
            .filter(|p| Path::new(p.as_str()).starts_with(prefix))
            .cloned()
            .collect();
        doomed.sort();
        for key in doomed {
            self.delete(key);
        }
    }
}

impl Indexer {
    pub fn new(config: Arc<Config>, store: Arc<IndexStore>) -> Self {
        Self { config, store, progress: None }
    }

    pub fn with_progress(mut self, hub: Arc<ProgressHub>) -> Self {
        self.progress = Some(hub);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn index(&self, paths: &[PathBuf], mode: IndexMode, cancel: &CancellationToken) -> Result<IndexStats> {
        match mode {
            IndexMode::Full => self.finish(self.full_pass(paths, cancel)),
            IndexMode::Incremental => {
                let changes: Vec<PathChange> = paths.iter().cloned().map(PathChange::Upsert).collect();
                self.finish(self.incremental_pass(&changes, cancel))
            }
        }
    }

    /// Applies watcher-style changes as one incremental pass.
    pub fn apply_changes(&self, changes: &[PathChange], cancel: &CancellationToken) -> Result<IndexStats> {
        self.finish(self.incremental_pass(changes, cancel))
    }

    fn finish(&self, result: Result<IndexStats>) -> Result<IndexStats> {
        if let Some(hub) = &self.progress {
            let (phase, stats) = match &result {
                Ok(stats) if stats.cancelled => (Phase::Cancelled, stats.clone()),
                Ok(stats) => (Phase::Done, stats.clone()),
                Err(_) => (Phase::Failed, IndexStats::default()),
            };
            hub.finish(ProgressEvent {
                phase,
                current_path: None,
                percent: 100.0,
                files_scanned: stats.files_scanned,
                files_changed: stats.files_changed,
                elapsed_ms: stats.elapsed_ms,
            });
        }
        if let Err(e) = &result {
            tracing::error!(error = %e, "indexing pass failed");
        }
        result
    }

    fn full_pass(&self, roots: &[PathBuf], cancel: &CancellationToken) -> Result<IndexStats> {
        let mut pass = Pass::new(self.progress.as_deref());
        pass.emit(Phase::Scanning, None, 0.0);
        let snapshot = self.store.snapshot();

        let mut walk_roots = Vec::new();
        let mut prune_roots = Vec::new();
        for root in roots {
            match fs::canonicalize(root) {
                Ok(canonical) => {
                    prune_roots.push(canonical.clone());
                    walk_roots.push(canonical);
                }
                Err(e) => {
                    // A root that vanished still gets its documents pruned.
                    if e.kind() == io::ErrorKind::NotFound && root.is_absolute() {
                        prune_roots.push(root.clone());
                    }
                    pass.fail(SeekrError::file_access(root, e));
                }
            }
        }

        let mut files = Vec::new();
        for root in &walk_roots {
            if root.is_file() {
                if !self.config.excludes_extension(root) {
                    files.push(root.clone());
                }
            } else {
                self.collect_files(root, cancel, &mut pass, &mut files);
            }
        }

        let mut seen: HashSet<String> = HashSet::with_capacity(files.len());
        let total = files.len().max(1);
        for (i, path) in files.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            pass.stats.files_scanned += 1;
            let key = path_key(path);
            match self.stage_file(path, snapshot.fingerprint(&key), &mut pass.stats) {
                Ok(Staged::Unchanged) => {
                    seen.insert(key);
                }
                Ok(Staged::Changed(upsert)) => {
                    seen.insert(key);
                    pass.changes.upserts.push(upsert);
                    pass.emit(Phase::Indexing, Some(path), percent(i + 1, total));
                }
                // Left out of `seen`, so pruning removes any stale document.
                Ok(Staged::Ineligible) => {}
                Err(e) => {
                    seen.insert(key);
                    pass.fail(e);
                }
            }
            if (i + 1) % PROGRESS_EVERY == 0 {
                pass.emit(Phase::Indexing, Some(path), percent(i + 1, total));
            }
        }

        if cancel.is_cancelled() {
            pass.stats.cancelled = true;
            tracing::info!(staged = pass.changes.upserts.len(), "full pass cancelled, keeping staged files");
        } else {
            let mut orphans: Vec<&String> = snapshot
                .paths
                .keys()
                .filter(|p| !seen.contains(*p))
                .filter(|p| prune_roots.iter().any(|root| Path::new(p.as_str()).starts_with(root)))
                .collect();
            orphans.sort();
            for orphan in orphans {
                pass.delete(orphan.clone());
            }
        }
        pass.changes.roots = walk_roots.iter().map(|r| path_key(r)).collect();

        let stats = self.commit(pass)?;
        tracing::info!(
            scanned = stats.files_scanned,
            changed = stats.files_changed,
            removed = stats.files_removed,
            unchanged = stats.files_unchanged,
            failures = stats.failures,
            elapsed_ms = stats.elapsed_ms,
            generation = stats.generation,
            "full pass complete"
        );
        Ok(stats)
    }

    fn incremental_pass(&self, changes: &[PathChange], cancel: &CancellationToken) -> Result<IndexStats> {
        let mut pass = Pass::new(self.progress.as_deref());
        pass.emit(Phase::Scanning, None, 0.0);
        let snapshot = self.store.snapshot();
        let roots: Vec<PathBuf> = snapshot.roots.iter().map(PathBuf::from).collect();

        // Only the last change per path matters.
        let mut latest: HashMap<PathBuf, usize> = HashMap::new();
        let mut ordered: Vec<(PathBuf, bool)> = Vec::new();
        for change in changes {
            let path = resolve(change.path());
            let upsert = matches!(change, PathChange::Upsert(_));
            match latest.get(&path) {
                Some(&slot) => ordered[slot].1 = upsert,
                None => {
                    latest.insert(path.clone(), ordered.len());
                    ordered.push((path, upsert));
                }
            }
        }

        let total = ordered.len().max(1);
        for (i, (path, upsert)) in ordered.iter().enumerate() {
            if cancel.is_cancelled() {
                pass.stats.cancelled = true;
                break;
            }
            if !upsert {
                pass.delete_under(&snapshot, path);
                continue;
            }
            match fs::metadata(path) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => pass.delete_under(&snapshot, path),
                Err(e) => pass.fail(SeekrError::file_access(path, e)),
                Ok(meta) if meta.is_dir() => {
                    if self.config.excludes_under(&roots, path) {
                        pass.delete_under(&snapshot, path);
                    } else {
                        self.reindex_directory(path, &snapshot, cancel, &mut pass);
                    }
                }
                Ok(_) => {
                    let key = path_key(path);
                    if self.config.excludes_under(&roots, path) {
                        if snapshot.paths.contains_key(&key) {
                            pass.delete(key);
                        }
                        continue;
                    }
                    pass.stats.files_scanned += 1;
                    match self.stage_file(path, snapshot.fingerprint(&key), &mut pass.stats) {
                        Ok(Staged::Unchanged) => {}
                        Ok(Staged::Changed(upsert)) => pass.changes.upserts.push(upsert),
                        Ok(Staged::Ineligible) => {
                            if snapshot.paths.contains_key(&key) {
                                pass.delete(key);
                            }
                        }
                        Err(e) => pass.fail(e),
                    }
                }
            }
            pass.emit(Phase::Indexing, Some(path), percent(i + 1, total));
        }

        let stats = self.commit(pass)?;
        tracing::debug!(
            changes = changes.len(),
            changed = stats.files_changed,
            removed = stats.files_removed,
            failures = stats.failures,
            generation = stats.generation,
            "incremental pass complete"
        );
        Ok(stats)
    }

    /// A created or moved-in directory: index its files and drop documents
    /// under it that are gone.
    fn reindex_directory(&self, dir: &Path, snapshot: &Generation, cancel: &CancellationToken, pass: &mut Pass<'_>) {
        let mut files = Vec::new();
        self.collect_files(dir, cancel, pass, &mut files);
        let mut seen = HashSet::with_capacity(files.len());
        for path in &files {
            if cancel.is_cancelled() {
                return;
            }
            pass.stats.files_scanned += 1;
            let key = path_key(path);
            match self.stage_file(path, snapshot.fingerprint(&key), &mut pass.stats) {
                Ok(Staged::Unchanged) => {
                    seen.insert(key);
                }
                Ok(Staged::Changed(upsert)) => {
                    seen.insert(key);
                    pass.changes.upserts.push(upsert);
                }
                Ok(Staged::Ineligible) => {}
                Err(e) => {
                    seen.insert(key);
                    pass.fail(e);
                }
            }
        }
        let mut stale: Vec<String> = snapshot
            .paths
            .keys()
            .filter(|p| Path::new(p.as_str()).starts_with(dir) && !seen.contains(*p))
            .cloned()
            .collect();
        stale.sort();
        for key in stale {
            pass.delete(key);
        }
    }

    fn collect_files(&self, root: &Path, cancel: &CancellationToken, pass: &mut Pass<'_>, out: &mut Vec<PathBuf>) {
        let config = &self.config;
        let walker = WalkDir::new(root).follow_links(false).into_iter().filter_entry(|entry| {
            entry.depth() == 0
                || !config.excludes_entry_name(&entry.file_name().to_string_lossy(), entry.file_type().is_dir())
        });
        for entry in walker {
            if cancel.is_cancelled() {
                return;
            }
            match entry {
                Ok(entry) if entry.file_type().is_file() => {
                    if !config.excludes_extension(entry.path()) {
                        out.push(entry.into_path());
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    let path = e.path().map_or_else(|| root.to_path_buf(), Path::to_path_buf);
                    let source = e
                        .into_io_error()
                        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "filesystem loop"));
                    pass.fail(SeekrError::file_access(path, source));
                }
            }
        }
        if let Some(hub) = pass.progress {
            hub.emit(pass.event(Phase::Scanning, Some(root), 0.0));
        }
    }

    fn stage_file(&self, path: &Path, known: Option<u64>, stats: &mut IndexStats) -> Result<Staged> {
        let meta = fs::metadata(path).map_err(|e| SeekrError::file_access(path, e))?;
        if !meta.is_file() {
            return Ok(Staged::Ineligible);
        }
        let size = meta.len();
        if size > self.config.max_file_size_bytes() {
            tracing::debug!(path = %path.display(), size, "file over size limit");
            return Ok(Staged::Ineligible);
        }

        let small = size <= self.config.max_content_size_bytes();
        let (fingerprint, bytes) = if small {
            let bytes = fs::read(path).map_err(|e| SeekrError::file_access(path, e))?;
            (xxh3_64(&bytes), Some(bytes))
        } else {
            (hash_file(path).map_err(|e| SeekrError::file_access(path, e))?, None)
        };
        if known == Some(fingerprint) {
            stats.files_unchanged += 1;
            return Ok(Staged::Unchanged);
        }

        let text = bytes.filter(|b| looks_like_text(path, b)).map(decode_text);
        if text.is_some() {
            stats.files_extracted += 1;
        }
        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs() as i64);
        Ok(Staged::Changed(analyse(path, size, modified, fingerprint, text)))
    }

    fn commit(&self, mut pass: Pass<'_>) -> Result<IndexStats> {
        pass.stats.files_removed = pass.changes.deletes.len();
        pass.stats.files_changed = pass.changes.upserts.len() + pass.stats.files_removed;
        pass.emit(Phase::Committing, None, 100.0);
        let changes = std::mem::take(&mut pass.changes);
        pass.stats.generation = self.store.commit_changeset(changes)?;
        pass.stats.elapsed_ms = pass.started.elapsed().as_millis() as u64;
        Ok(pass.stats)
    }
}

fn percent(done: usize, total: usize) -> f32 {
    (done as f32 / total as f32 * 100.0).min(100.0)
}

pub(crate) fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Canonical form of `path`; for a path that no longer exists, its
/// canonicalized parent joined with the file name.
fn resolve(path: &Path) -> PathBuf {
    if let Ok(canonical) = fs::canonicalize(path) {
        return canonical;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => fs::canonicalize(parent)
            .map(|p| p.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

fn hash_file(path: &Path) -> io::Result<u64> {
    let mut file = File::open(path)?;
    let mut hasher = Xxh3::new();
    let mut buf = vec![0u8; HASH_BUFFER];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.digest())
}

/// Known text extensions, or a prefix without NUL bytes that decodes as UTF-8.
fn looks_like_text(path: &Path, bytes: &[u8]) -> bool {
    let known = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| TEXT_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
    if known {
        return true;
    }
    let prefix = &bytes[..bytes.len().min(SNIFF_BYTES)];
    if prefix.contains(&0) {
        return false;
    }
    match std::str::from_utf8(prefix) {
        Ok(_) => true,
        // Only a multi-byte character cut off by the prefix boundary.
        Err(e) => e.error_len().is_none(),
    }
}

fn decode_text(bytes: Vec<u8>) -> String {
    String::from_utf8(bytes).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}

/// Builds the document and its postings for all three fields.
pub(crate) fn analyse(path: &Path, size: u64, modified: i64, fingerprint: u64, text: Option<String>) -> Upsert {
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let directory = path
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    let mut postings = Vec::new();
    let full_name = tokenizer::normalize(&filename);
    field_postings(Field::Filename, &filename, Some(full_name), &mut postings);
    field_postings(Field::Directory, &directory, None, &mut postings);
    if let Some(text) = &text {
        field_postings(Field::Content, text, None, &mut postings);
    }

    Upsert {
        document: Document {
            path: path_key(path),
            filename,
            directory,
            size,
            modified,
            extension,
            fingerprint,
            text,
            terms: Vec::new(),
        },
        postings,
    }
}

fn field_postings(field: Field, source: &str, whole: Option<String>, out: &mut Vec<TermPositions>) {
    let mut by_term: BTreeMap<String, Vec<u32>> = BTreeMap::new();
    for (term, position) in tokenizer::tokenize(source) {
        let position = position.min((NAME_POSITION - 1) as usize) as u32;
        by_term.entry(term).or_default().push(position);
    }
    if let Some(whole) = whole.filter(|w| !w.is_empty()) {
        by_term.entry(whole).or_default().push(NAME_POSITION);
    }
    out.extend(
        by_term
            .into_iter()
            .map(|(term, positions)| TermPositions { field, term, positions }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_text() {
        assert!(looks_like_text(Path::new("a.unknown"), b"plain words"));
        assert!(!looks_like_text(Path::new("a.bin"), &[0x00, 0x01, 0x02]));
        assert!(looks_like_text(Path::new("a.txt"), &[0xff, 0xfe]));
        // cut in the middle of "é"
        assert!(looks_like_text(Path::new("a.dat"), &[b'a', 0xc3]));
    }

    #[test]
    fn analyse_covers_all_fields() {
        let upsert = analyse(
            Path::new("/home/u/Reports/report_final.PDF"),
            10,
            5,
            99,
            Some("quarterly numbers".into()),
        );
        assert_eq!(upsert.document.extension, "pdf");
        assert_eq!(upsert.document.directory, "/home/u/Reports");
        let has = |field: Field, term: &str| upsert.postings.iter().any(|tp| tp.field == field && tp.term == term);
        assert!(has(Field::Filename, "report"));
        assert!(has(Field::Filename, "report_final.pdf"));
        assert!(has(Field::Directory, "report"));
        assert!(has(Field::Content, &tokenizer::terms("quarterly")[0]));
    }

    #[test]
    fn whole_name_shares_postings_with_word_term() {
        let upsert = analyse(Path::new("/d/plan"), 1, 0, 1, None);
        let plan: Vec<&TermPositions> = upsert
            .postings
            .iter()
            .filter(|tp| tp.field == Field::Filename && tp.term == "plan")
            .collect();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].positions, vec![0, NAME_POSITION]);
    }
}
