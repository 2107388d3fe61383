//! Typed, validated configuration.
//!
//! Every field has a default, so a partial TOML file (or none at all) yields a
//! usable configuration. Values are range-checked at load time.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, SeekrError};
use crate::index::Field;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Directory holding the persisted index generations.
    pub index_path: PathBuf,
    /// Roots indexed on startup and watched for changes.
    pub watch_paths: Vec<PathBuf>,
    /// Directory names pruned from every walk.
    pub excluded_dirs: BTreeSet<String>,
    /// Extensions (with or without the leading dot) never indexed.
    pub excluded_extensions: BTreeSet<String>,
    pub max_file_size_mb: f64,
    /// Text is only extracted from files at or under this size.
    pub max_content_size_kb: u64,
    pub max_results: usize,
    pub enable_fuzzy: bool,
    pub fuzzy_distance: u8,
    /// Infer file categories (`images`, `video files`, ...) from free text.
    pub enable_entity_recognition: bool,
    pub auto_index_on_startup: bool,
    pub index_hidden_files: bool,
    pub snippet_size: usize,
    pub search_timeout_ms: u64,
    pub debounce_ms: u64,
    pub rescan_interval_secs: u64,
    pub field_boosts: FieldBoosts,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FieldBoosts {
    pub filename: f32,
    pub directory: f32,
    pub content: f32,
}

impl Default for FieldBoosts {
    fn default() -> Self {
        Self {
            filename: 3.0,
            directory: 1.5,
            content: 1.0,
        }
    }
}

impl FieldBoosts {
    pub fn get(&self, field: Field) -> f32 {
        match field {
            Field::Filename => self.filename,
            Field::Directory => self.directory,
            Field::Content => self.content,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let excluded_dirs = [
            ".git",
            ".svn",
            "node_modules",
            "__pycache__",
            ".venv",
            "venv",
            "build",
            "dist",
        ];
        let excluded_extensions = [".pyc", ".pyo", ".so", ".dylib", ".dll"];
        Self {
            index_path: PathBuf::from("data/index"),
            watch_paths: Vec::new(),
            excluded_dirs: excluded_dirs.iter().map(|s| s.to_string()).collect(),
            excluded_extensions: excluded_extensions.iter().map(|s| s.to_string()).collect(),
            max_file_size_mb: 100.0,
            max_content_size_kb: 1024,
            max_results: 100,
            enable_fuzzy: true,
            fuzzy_distance: 2,
            enable_entity_recognition: true,
            auto_index_on_startup: true,
            index_hidden_files: false,
            snippet_size: 200,
            search_timeout_ms: 500,
            debounce_ms: 250,
            rescan_interval_secs: 3600,
            field_boosts: FieldBoosts::default(),
        }
    }
}

impl Config {
    /// Loads a TOML config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(raw) => Self::from_toml_str(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(SeekrError::Io(e)),
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(raw).map_err(|e| SeekrError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.max_file_size_mb.is_finite() || self.max_file_size_mb <= 0.0 {
            return Err(SeekrError::Config(format!(
                "max_file_size_mb must be positive, got {}",
                self.max_file_size_mb
            )));
        }
        if self.max_results == 0 {
            return Err(SeekrError::Config("max_results must be at least 1".into()));
        }
        if self.fuzzy_distance > 3 {
            return Err(SeekrError::Config(format!(
                "fuzzy_distance must be between 0 and 3, got {}",
                self.fuzzy_distance
            )));
        }
        if self.snippet_size < 20 {
            return Err(SeekrError::Config(format!(
                "snippet_size must be at least 20, got {}",
                self.snippet_size
            )));
        }
        if self.rescan_interval_secs == 0 {
            return Err(SeekrError::Config(
                "rescan_interval_secs must be at least 1".into(),
            ));
        }
        for field in Field::ALL {
            let boost = self.field_boosts.get(field);
            if !boost.is_finite() || boost <= 0.0 {
                return Err(SeekrError::Config(format!(
                    "boost for {} must be positive, got {boost}",
                    field.as_str()
                )));
            }
        }
        Ok(())
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        (self.max_file_size_mb * BYTES_PER_MB) as u64
    }

    pub fn max_content_size_bytes(&self) -> u64 {
        self.max_content_size_kb.saturating_mul(1024)
    }

    pub fn excludes_dir_name(&self, name: &str) -> bool {
        self.excluded_dirs.contains(name)
    }

    pub fn excludes_extension(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        self.excluded_extensions
            .iter()
            .any(|x| x.trim_start_matches('.').eq_ignore_ascii_case(ext))
    }

    /// Applies to a single walk entry below a root.
    pub fn excludes_entry_name(&self, name: &str, is_dir: bool) -> bool {
        if is_dir && self.excludes_dir_name(name) {
            return true;
        }
        !self.index_hidden_files && name.starts_with('.') && name != "." && name != ".."
    }

    /// True when any directory of `rel` (a path relative to an indexed root) is
    /// excluded, the file name is hidden, or its extension is excluded.
    pub fn excludes_relative(&self, rel: &Path) -> bool {
        let mut components = rel.components().peekable();
        while let Some(component) = components.next() {
            let name = component.as_os_str().to_string_lossy();
            let is_dir = components.peek().is_some();
            if self.excludes_entry_name(&name, is_dir) {
                return true;
            }
        }
        self.excludes_extension(rel)
    }

    /// Resolves `path` against the first root containing it; paths outside
    /// every root are judged by their file name alone.
    pub fn excludes_under(&self, roots: &[PathBuf], path: &Path) -> bool {
        let rel = roots
            .iter()
            .find_map(|root| path.strip_prefix(root).ok())
            .filter(|rel| !rel.as_os_str().is_empty());
        match rel {
            Some(rel) => self.excludes_relative(rel),
            None => match path.file_name() {
                Some(name) => self.excludes_relative(Path::new(name)),
                None => false,
            },
        }
    }
}
