use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use colorful::Colorful;
use eyre::Result;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

mod book;
mod bundle;
mod compress;
mod config;
mod cover;
mod db;
mod decrypt;
mod engine;
mod epub;
mod parsing_utils;
mod request;
mod source;

use book::SourceKind;
use compress::ChapterCompressor;
use config::{Config, Paths};
use db::Database;
use engine::{Engine, IngestReport};

pub static MULTI_PROGRESS: LazyLock<MultiProgress> = LazyLock::new(MultiProgress::new);

pub fn get_progress_bar(len: u64, tick_seconds: u64) -> ProgressBar {
    let style = ProgressStyle::with_template(
        "{prefix:.bold} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    let bar = ProgressBar::new(len).with_style(style);
    if tick_seconds > 0 {
        bar.enable_steady_tick(Duration::from_secs(tick_seconds));
    }
    bar
}

/// Print an error without tearing the progress bars.
pub trait ErrorPrint {
    fn eprintln(&self, error: &eyre::Report);
}

impl ErrorPrint for ProgressBar {
    fn eprintln(&self, error: &eyre::Report) {
        self.suspend(|| eprintln!("{error}"));
    }
}

impl ErrorPrint for MultiProgress {
    fn eprintln(&self, error: &eyre::Report) {
        self.suspend(|| eprintln!("{error}"));
    }
}

#[derive(Parser)]
#[command(name = "bookvault", version, about = "Book ingestion and packaging pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest books from a plan file into bundles and the index
    Ingest(IngestArgs),
    /// Build (or serve from cache) the EPUB for one book
    Epub(EpubArgs),
    /// Reconcile every bundle on disk against the chapter index
    Sync(SyncArgs),
}

#[derive(Args)]
struct IngestArgs {
    /// Upstream to pull from
    #[arg(long, value_enum)]
    source: SourceKind,
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Plan file (default: <data_dir>/plans/books_plan_<source>.json)
    #[arg(long)]
    plan: Option<PathBuf>,
    /// Cap on in-flight HTTP requests for this source
    #[arg(long)]
    max_concurrent: Option<usize>,
    /// Minimum seconds between request starts
    #[arg(long)]
    request_delay: Option<f64>,
    /// Books ingested in parallel
    #[arg(long)]
    book_workers: Option<usize>,
    /// Chapters requested concurrently per batch (HTML sources)
    #[arg(long)]
    fetch_batch_size: Option<usize>,
    /// zstd level (1-22)
    #[arg(long)]
    compression_level: Option<i32>,
    /// Skip plan entries below this chapter count
    #[arg(long, default_value_t = 0)]
    min_chapters: u32,
    /// Re-download covers even when present
    #[arg(long)]
    force_cover: bool,
    /// Compute and report without writing files or rows
    #[arg(long)]
    dry_run: bool,
    /// Verify the HMAC on encrypted chapters
    #[arg(long)]
    verify_mac: bool,
    /// Bearer token for the API source (or $BOOKVAULT_API_TOKEN)
    #[arg(long)]
    api_token: Option<String>,
}

#[derive(Args)]
struct EpubArgs {
    #[arg(long)]
    book_id: i64,
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Args)]
struct SyncArgs {
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Ingest(args) => ingest(args),
        Command::Epub(args) => build_epub(&args),
        Command::Sync(args) => sync(&args),
    }
}

fn ingest(args: IngestArgs) -> Result<()> {
    let data_dir = args.data_dir.unwrap_or_else(Paths::default_data_dir);
    let mut config = Config::new(data_dir, args.source);

    if let Some(n) = args.max_concurrent {
        config.tuning.max_concurrent = n;
    }
    if let Some(secs) = args.request_delay {
        config.tuning.request_delay = Duration::from_secs_f64(secs);
    }
    if let Some(n) = args.book_workers {
        config.tuning.book_workers = n;
    }
    if let Some(n) = args.fetch_batch_size {
        config.tuning.fetch_batch_size = n;
    }
    if let Some(level) = args.compression_level {
        config.compression_level = level.clamp(1, 22);
    }
    config.min_chapters = args.min_chapters;
    config.force_cover = args.force_cover;
    config.dry_run = args.dry_run;
    config.verify_mac = args.verify_mac;
    if args.api_token.is_some() {
        config.api_token = args.api_token;
    }
    config.plan_override = args.plan;

    std::fs::create_dir_all(&config.paths.data_dir)?;
    if config.paths.dict_path_if_present().is_none() {
        tracing::warn!(
            "no dictionary at {}, compressing without one",
            config.paths.dict_path.display()
        );
    }

    let engine = Engine::new(config)?;
    let plan = engine.load_plan()?;
    if plan.is_empty() {
        println!("{}", "Plan is empty, nothing to do.".yellow());
        return Ok(());
    }

    let start = Instant::now();
    let report = engine.run(&plan)?;
    print_report(&report, start.elapsed());
    Ok(())
}

fn print_report(report: &IngestReport, elapsed: Duration) {
    println!();
    println!(
        "{} at {} ({} books in {:.0?})",
        "Ingestion complete".bold(),
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        report.books,
        elapsed
    );
    println!(
        "  new chapters : {}",
        report.new_chapters.to_string().green()
    );
    println!("  refreshed    : {}", report.refreshed);
    println!("  up to date   : {}", report.already_complete);
    if report.not_found > 0 {
        println!(
            "  removed      : {}",
            report.not_found.to_string().yellow()
        );
    }
    if report.chapter_errors > 0 {
        println!(
            "  chapter errs : {}",
            report.chapter_errors.to_string().yellow()
        );
    }
    if report.failed > 0 {
        println!("  failed books : {}", report.failed.to_string().red());
    }
}

fn build_epub(args: &EpubArgs) -> Result<()> {
    let data_dir = args.data_dir.clone().unwrap_or_else(Paths::default_data_dir);
    let paths = Paths::from_data_dir(data_dir);

    let db = Database::open(&paths.db_path)?;
    let compressor = ChapterCompressor::new(
        paths.dict_path_if_present(),
        compress::DEFAULT_COMPRESSION_LEVEL,
    )?;

    let out = epub::build_epub(
        args.book_id,
        &paths.bundle_path(args.book_id),
        &db,
        &paths.covers_dir,
        &paths.cache_dir,
        &compressor,
    )?;
    println!("{}", out.display());
    Ok(())
}

fn sync(args: &SyncArgs) -> Result<()> {
    let data_dir = args.data_dir.clone().unwrap_or_else(Paths::default_data_dir);
    let paths = Paths::from_data_dir(data_dir);

    let db = Database::open(&paths.db_path)?;
    let compressor = ChapterCompressor::new(
        paths.dict_path_if_present(),
        compress::DEFAULT_COMPRESSION_LEVEL,
    )?;

    let report = db.sweep_bundles(&paths.compressed_dir, &compressor)?;
    println!(
        "{} {} bundles scanned, {} rows filled, {} titles synthesized",
        "Sync complete:".bold(),
        report.bundles,
        report.inserted_rows.to_string().green(),
        report.repaired_titles
    );
    Ok(())
}
