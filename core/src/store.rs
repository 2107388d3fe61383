//! Single-writer, multi-reader index store.
//!
//! Readers take an `Arc<Generation>` snapshot and keep it for as long as they
//! like. A commit builds the next generation copy-on-write, makes it durable,
//! and only then swaps the pointer, so a snapshot is always one committed
//! generation and never a mix of two.

use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::index::{Changeset, Document, Generation, Upsert};
use crate::persist::{self, IndexPaths, MetaFile};

pub type Snapshot = Arc<Generation>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Nothing was ever committed at this location.
    Fresh,
    Loaded { generation: u64, documents: usize },
}

pub struct IndexStore {
    paths: Option<IndexPaths>,
    current: RwLock<Snapshot>,
    writer: Mutex<()>,
}

impl IndexStore {
    /// A store persisted under `root`. Nothing is read until [`IndexStore::load`].
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            paths: Some(IndexPaths::new(root)),
            current: RwLock::new(Arc::new(Generation::default())),
            writer: Mutex::new(()),
        }
    }

    /// A store that never touches the disk.
    pub fn in_memory() -> Self {
        Self {
            paths: None,
            current: RwLock::new(Arc::new(Generation::default())),
            writer: Mutex::new(()),
        }
    }

    /// Opens the store at `root` and loads the committed generation.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<(Self, LoadOutcome)> {
        let store = Self::new(root);
        let outcome = store.load()?;
        Ok((store, outcome))
    }

    pub fn load(&self) -> Result<LoadOutcome> {
        let Some(paths) = &self.paths else {
            return Ok(LoadOutcome::Fresh);
        };
        let _guard = self.writer.lock();
        match persist::load_generation(paths)? {
            None => Ok(LoadOutcome::Fresh),
            Some(generation) => {
                let outcome = LoadOutcome::Loaded {
                    generation: generation.id,
                    documents: generation.num_docs(),
                };
                tracing::info!(generation = generation.id, documents = generation.num_docs(), "index loaded");
                *self.current.write() = Arc::new(generation);
                Ok(outcome)
            }
        }
    }

    /// Writes the current generation again (e.g. after [`IndexStore::reset`]).
    pub fn persist(&self) -> Result<()> {
        let _guard = self.writer.lock();
        let snapshot = self.snapshot();
        self.write(&snapshot)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.current.read().clone()
    }

    pub fn lookup(&self, path: &str) -> Option<u64> {
        self.current.read().fingerprint(path)
    }

    pub fn document(&self, path: &str) -> Option<Arc<Document>> {
        self.current.read().document(path).cloned()
    }

    pub fn commit(&self, upserts: Vec<Upsert>, deletes: Vec<String>) -> Result<u64> {
        self.commit_changeset(Changeset { upserts, deletes, roots: Vec::new() })
    }

    /// Applies `changes` as one transaction and returns the id of the resulting
    /// generation. A changeset that changes nothing does not create a new one.
    pub fn commit_changeset(&self, changes: Changeset) -> Result<u64> {
        let _guard = self.writer.lock();
        let base = self.snapshot();
        if is_noop(&base, &changes) {
            return Ok(base.id);
        }
        let id = base.id + 1;
        let next = Arc::new(base.apply(&changes, id, now_unix()));
        self.write(&next)?;
        *self.current.write() = next.clone();
        tracing::debug!(
            generation = id,
            upserts = changes.upserts.len(),
            deletes = changes.deletes.len(),
            documents = next.num_docs(),
            "generation committed"
        );
        if let Some(paths) = &self.paths {
            // The previous generation stays on disk as a fallback.
            if let Err(e) = persist::prune_generations(paths, &[base.id, id]) {
                tracing::warn!(error = %e, "failed to prune old generations");
            }
        }
        Ok(id)
    }

    /// Drops every document, committing an empty generation.
    pub fn clear(&self) -> Result<u64> {
        let _guard = self.writer.lock();
        let base = self.snapshot();
        let next = Arc::new(Generation {
            id: base.id + 1,
            committed_at: now_unix(),
            ..Default::default()
        });
        self.write(&next)?;
        *self.current.write() = next.clone();
        if let Some(paths) = &self.paths {
            if let Err(e) = persist::prune_generations(paths, &[base.id, next.id]) {
                tracing::warn!(error = %e, "failed to prune old generations");
            }
        }
        tracing::info!(generation = next.id, "index cleared");
        Ok(next.id)
    }

    /// Deletes the on-disk index and starts over from an empty generation.
    /// Used after a corrupt load, before a full rebuild.
    pub fn reset(&self) -> Result<()> {
        let _guard = self.writer.lock();
        if let Some(paths) = &self.paths {
            persist::wipe(paths)?;
        }
        *self.current.write() = Arc::new(Generation::default());
        Ok(())
    }

    fn write(&self, generation: &Generation) -> Result<()> {
        let Some(paths) = &self.paths else {
            return Ok(());
        };
        persist::save_generation(paths, generation)?;
        let meta = MetaFile {
            num_docs: generation.num_docs() as u32,
            created_at: format_unix(generation.committed_at),
            version: persist::FORMAT_VERSION,
            generation: generation.id,
        };
        if let Err(e) = persist::save_meta(paths, &meta) {
            tracing::warn!(error = %e, "failed to write meta.json");
        }
        Ok(())
    }
}

fn is_noop(base: &Generation, changes: &Changeset) -> bool {
    changes.upserts.is_empty()
        && changes.deletes.iter().all(|p| !base.paths.contains_key(p))
        && changes.roots.iter().all(|r| base.roots.contains(r))
}

pub(crate) fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

pub(crate) fn format_unix(ts: i64) -> String {
    time::OffsetDateTime::from_unix_timestamp(ts)
        .ok()
        .and_then(|t| t.format(&time::format_description::well_known::Rfc3339).ok())
        .unwrap_or_default()
}

impl std::fmt::Debug for IndexStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexStore")
            .field("root", &self.paths.as_ref().map(|p| p.root.clone()))
            .field("generation", &self.current.read().id)
            .finish()
    }
}
