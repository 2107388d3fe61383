//! Local file search: an inverted index over file names, directories and
//! text content, a natural-language query parser, ranked search, and a
//! filesystem watcher that keeps the index current.

pub mod cancel;
pub mod config;
pub mod entities;
pub mod error;
pub mod index;
pub mod indexer;
pub mod lexicon;
pub mod parser;
pub mod persist;
pub mod progress;
pub mod query;
pub mod search;
pub mod service;
pub mod store;
pub mod tokenizer;
pub mod watcher;

pub use cancel::{CancelSource, CancellationToken};
pub use config::{Config, FieldBoosts};
pub use error::{Result, SeekrError};
pub use index::{Document, Field, Generation};
pub use indexer::{IndexMode, IndexStats, Indexer, PathChange};
pub use parser::QueryParser;
pub use progress::{Phase, ProgressEvent, ProgressStream};
pub use query::{Query, TermTarget};
pub use search::{SearchEngine, SearchOptions, SearchResponse, SearchResult, Snippet};
pub use service::{IndexStatus, Seekr, Startup};
pub use store::{IndexStore, LoadOutcome};
pub use watcher::{ChangeEvent, ChangeKind, FileWatcher, WatcherState};
