use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use seekr_core::{Config, IndexMode, IndexStats, SearchResponse, Seekr, TermTarget};
use tracing_subscriber::{fmt, EnvFilter};

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "seekr")]
#[command(about = "Index local files and search them in plain language", long_about = None)]
struct Cli {
    /// TOML configuration file; defaults apply when it does not exist
    #[arg(long, global = true, default_value = "seekr.toml")]
    config: PathBuf,
    /// Override the index directory from the config file
    #[arg(long, global = true)]
    index_path: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index the given paths (or the configured watch paths)
    Index {
        paths: Vec<PathBuf>,
        /// Only look at the given paths instead of walking and pruning them
        #[arg(long, default_value_t = false)]
        incremental: bool,
        /// Print progress while indexing
        #[arg(long, default_value_t = false)]
        progress: bool,
    },
    /// Run a query against the index
    Search {
        #[arg(required = true, num_args = 1..)]
        query: Vec<String>,
        #[arg(long)]
        limit: Option<usize>,
        /// Match free words against this field only
        #[arg(long, value_enum, default_value_t = SearchField::Any)]
        field: SearchField,
        /// Print the raw response as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Show index statistics
    Stats,
    /// Keep the index current until the process is stopped
    Watch { paths: Vec<PathBuf> },
    /// Remove every document from the index
    Clear,
    /// Print the effective configuration
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum SearchField {
    Any,
    Name,
    Content,
}

fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config).with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(index_path) = cli.index_path {
        config.index_path = index_path;
    }
    if let Commands::Config = cli.command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }
    // The CLI decides itself what to index.
    config.auto_index_on_startup = false;
    let seekr = Seekr::open(config)?;

    match cli.command {
        Commands::Index { paths, incremental, progress } => {
            let paths = paths_or_configured(&seekr, paths)?;
            let mode = if incremental { IndexMode::Incremental } else { IndexMode::Full };
            let reporter = progress.then(|| {
                let events = seekr.progress_events();
                thread::spawn(move || {
                    for event in events {
                        if event.phase.is_terminal() {
                            break;
                        }
                        eprintln!(
                            "[{:>5.1}%] {:?} {}",
                            event.percent,
                            event.phase,
                            event.current_path.unwrap_or_default()
                        );
                    }
                })
            });
            let stats = seekr.index_now(paths, mode)?;
            if let Some(reporter) = reporter {
                let _ = reporter.join();
            }
            print_stats(&stats);
        }
        Commands::Search { query, limit, field, json } => {
            let raw = query.join(" ");
            let limit = limit.unwrap_or(seekr.config().max_results);
            let response = match field {
                SearchField::Any => seekr.search_with_limit(&raw, limit),
                SearchField::Name => seekr.search_in(&raw, TermTarget::Filename, limit),
                SearchField::Content => seekr.search_in(&raw, TermTarget::Content, limit),
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                print_results(&seekr, &raw, &response);
            }
        }
        Commands::Stats => {
            println!("{}", serde_json::to_string_pretty(&seekr.index_stats())?);
        }
        Commands::Watch { paths } => {
            let paths = paths_or_configured(&seekr, paths)?;
            let stats = seekr.index_now(paths.clone(), IndexMode::Full)?;
            print_stats(&stats);
            seekr.watch_start(paths)?;
            println!("watching, press Ctrl-C to stop");
            loop {
                thread::sleep(Duration::from_secs(60));
                let status = seekr.index_stats();
                tracing::info!(
                    documents = status.document_count,
                    generation = status.generation,
                    watcher = ?status.watcher,
                    "index status"
                );
            }
        }
        Commands::Clear => {
            let generation = seekr.clear_index()?;
            println!("index cleared (generation {generation})");
        }
        Commands::Config => {}
    }
    Ok(())
}

fn paths_or_configured(seekr: &Seekr, paths: Vec<PathBuf>) -> Result<Vec<PathBuf>> {
    if !paths.is_empty() {
        return Ok(paths);
    }
    if seekr.config().watch_paths.is_empty() {
        bail!("no paths given and no watch_paths configured");
    }
    Ok(seekr.config().watch_paths.clone())
}

fn print_stats(stats: &IndexStats) {
    let outcome = if stats.cancelled { "cancelled" } else { "done" };
    println!(
        "{outcome}: {} scanned, {} extracted, {} unchanged, {} removed, {} failed in {} ms (generation {})",
        stats.files_scanned,
        stats.files_extracted,
        stats.files_unchanged,
        stats.files_removed,
        stats.failures,
        stats.elapsed_ms,
        stats.generation
    );
    for path in &stats.failed_paths {
        println!("  failed: {path}");
    }
}

fn print_results(seekr: &Seekr, raw: &str, response: &SearchResponse) {
    for note in &seekr.parse(raw).notes {
        eprintln!("note: {}: {}", note.token, note.reason);
    }
    for (rank, result) in response.results.iter().enumerate() {
        println!("{:>3}. {} ({:.3})", rank + 1, result.path, result.score);
        if let Some(snippet) = &result.snippet {
            println!("     {}", snippet.text.replace('\n', " "));
        }
    }
    let partial = if response.truncated { " (partial, timed out)" } else { "" };
    println!(
        "{} of {} hits in {} ms{partial}",
        response.results.len(),
        response.total_hits,
        response.took_ms
    );
}
