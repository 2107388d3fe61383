//! On-disk layout of the index directory.
//!
//! ```text
//! <root>/CURRENT                    id of the committed generation
//! <root>/gen-<id>.bin               header + bincode(Generation)
//! <root>/meta.json                  human-readable summary, informational only
//! ```
//!
//! A generation file starts with the magic `SKRG`, a format version, the xxh3
//! checksum of the payload and the payload length. Every file is written to a
//! temporary name, synced and renamed into place, and `CURRENT` is only
//! replaced after the generation it names is durable.

use crate::error::{Result, SeekrError};
use crate::index::Generation;
use serde::{Deserialize, Serialize};
use std::fs::{self, create_dir_all, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use xxhash_rust::xxh3::xxh3_64;

const MAGIC: &[u8; 4] = b"SKRG";
pub const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 8 + 8;

#[derive(Debug, Serialize, Deserialize)]
pub struct MetaFile {
    pub num_docs: u32,
    pub created_at: String,
    pub version: u32,
    pub generation: u64,
}

#[derive(Debug, Clone)]
pub struct IndexPaths {
    pub root: PathBuf,
}

impl IndexPaths {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }
    fn current(&self) -> PathBuf { self.root.join("CURRENT") }
    fn meta(&self) -> PathBuf { self.root.join("meta.json") }
    pub fn generation(&self, id: u64) -> PathBuf { self.root.join(format!("gen-{id:016}.bin")) }
}

/// Writes `bytes` to `path` through a synced temporary file and a rename.
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut f = File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        // Directory fsync makes the rename durable; not supported everywhere.
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn encode_generation(generation: &Generation) -> std::result::Result<Vec<u8>, bincode::Error> {
    let payload = bincode::serialize(generation)?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&xxh3_64(&payload).to_le_bytes());
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

pub fn decode_generation(path: &Path, bytes: &[u8]) -> Result<Generation> {
    if bytes.len() < HEADER_LEN {
        return Err(SeekrError::corruption(path, "truncated header"));
    }
    if &bytes[0..4] != MAGIC {
        return Err(SeekrError::corruption(path, "bad magic"));
    }
    let version = u32::from_le_bytes(bytes[4..8].try_into().expect("4-byte slice"));
    if version != FORMAT_VERSION {
        return Err(SeekrError::corruption(path, format!("unsupported format version {version}")));
    }
    let checksum = u64::from_le_bytes(bytes[8..16].try_into().expect("8-byte slice"));
    let len = u64::from_le_bytes(bytes[16..24].try_into().expect("8-byte slice")) as usize;
    let payload = &bytes[HEADER_LEN..];
    if payload.len() != len {
        return Err(SeekrError::corruption(
            path,
            format!("payload is {} bytes, header says {len}", payload.len()),
        ));
    }
    if xxh3_64(payload) != checksum {
        return Err(SeekrError::corruption(path, "checksum mismatch"));
    }
    bincode::deserialize(payload).map_err(|e| SeekrError::corruption(path, e.to_string()))
}

/// Writes a generation file and then points `CURRENT` at it.
pub fn save_generation(paths: &IndexPaths, generation: &Generation) -> Result<()> {
    let commit_err = |reason: String| SeekrError::CommitFailure { generation: generation.id, reason };
    create_dir_all(&paths.root).map_err(|e| commit_err(e.to_string()))?;
    let bytes = encode_generation(generation).map_err(|e| commit_err(e.to_string()))?;
    write_atomic(&paths.generation(generation.id), &bytes).map_err(|e| commit_err(e.to_string()))?;
    write_atomic(&paths.current(), format!("{}\n", generation.id).as_bytes())
        .map_err(|e| commit_err(e.to_string()))?;
    Ok(())
}

/// `Ok(None)` means no generation was ever committed here.
pub fn load_generation(paths: &IndexPaths) -> Result<Option<Generation>> {
    let current = paths.current();
    let pointer = match fs::read_to_string(&current) {
        Ok(s) => s,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(SeekrError::corruption(&current, e.to_string())),
    };
    let id: u64 = pointer
        .trim()
        .parse()
        .map_err(|_| SeekrError::corruption(&current, format!("unparsable pointer {pointer:?}")))?;
    let file = paths.generation(id);
    let mut buf = Vec::new();
    File::open(&file)
        .and_then(|mut f| f.read_to_end(&mut buf))
        .map_err(|e| SeekrError::corruption(&file, format!("current generation unreadable: {e}")))?;
    let generation = decode_generation(&file, &buf)?;
    if generation.id != id {
        return Err(SeekrError::corruption(
            &file,
            format!("file holds generation {}, pointer says {id}", generation.id),
        ));
    }
    Ok(Some(generation))
}

/// Deletes generation files other than `keep`.
pub fn prune_generations(paths: &IndexPaths, keep: &[u64]) -> Result<usize> {
    let mut removed = 0;
    let entries = match fs::read_dir(&paths.root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name();
        let Some(id) = name
            .to_str()
            .and_then(|n| n.strip_prefix("gen-"))
            .and_then(|n| n.strip_suffix(".bin"))
            .and_then(|n| n.parse::<u64>().ok())
        else {
            continue;
        };
        if !keep.contains(&id) {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Removes everything this module ever wrote under the root.
pub fn wipe(paths: &IndexPaths) -> Result<()> {
    prune_generations(paths, &[])?;
    for file in [paths.current(), paths.meta()] {
        match fs::remove_file(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

pub fn save_meta(paths: &IndexPaths, meta: &MetaFile) -> Result<()> {
    create_dir_all(&paths.root)?;
    let json = serde_json::to_string_pretty(meta)
        .map_err(|e| SeekrError::Io(std::io::Error::new(ErrorKind::InvalidData, e)))?;
    write_atomic(&paths.meta(), json.as_bytes())?;
    Ok(())
}

pub fn load_meta(paths: &IndexPaths) -> Result<MetaFile> {
    let mut f = File::open(paths.meta())?;
    let mut buf = String::new();
    f.read_to_string(&mut buf)?;
    serde_json::from_str(&buf).map_err(|e| SeekrError::corruption(paths.meta(), e.to_string()))
}
