//! Resumable ingestion engine: takes a plan, fans books out over a
//! bounded worker pool, and drives each one through
//! fetch → decrypt/parse → compress → atomic bundle rewrite → index
//! sync. Failures are accounted per book; one bad book never stops the
//! run.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use eyre::{Result, WrapErr};
use rayon::prelude::*;
use tracing::{error, info};

use crate::book::{meta_hash, BookMetadata, ChapterData, PlanEntry};
use crate::bundle::{read_bundle_indices, read_bundle_meta, read_bundle_raw, write_bundle, ChapterMeta};
use crate::compress::ChapterCompressor;
use crate::config::Config;
use crate::db::Database;
use crate::source::Source;
use crate::{get_progress_bar, ErrorPrint, MULTI_PROGRESS};

/// What happened to one plan entry.
#[derive(Debug)]
pub enum BookOutcome {
    /// New chapters stored (possibly zero, when only metadata moved).
    Refreshed { new_chapters: u32, errors: u32 },
    /// Bundle already holds every chapter the upstream reports.
    AlreadyComplete,
    /// Upstream 404 — tombstone for external cleanup.
    NotFound,
    Failed(String),
}

/// Aggregated terminal report for one run.
#[derive(Debug, Default, Clone, Copy)]
pub struct IngestReport {
    pub books: usize,
    pub new_chapters: u64,
    pub refreshed: usize,
    pub already_complete: usize,
    pub not_found: usize,
    pub failed: usize,
    pub chapter_errors: u64,
}

impl IngestReport {
    fn absorb(&mut self, outcome: &BookOutcome) {
        self.books += 1;
        match outcome {
            BookOutcome::Refreshed {
                new_chapters,
                errors,
            } => {
                self.refreshed += 1;
                self.new_chapters += u64::from(*new_chapters);
                self.chapter_errors += u64::from(*errors);
            }
            BookOutcome::AlreadyComplete => self.already_complete += 1,
            BookOutcome::NotFound => self.not_found += 1,
            BookOutcome::Failed(_) => self.failed += 1,
        }
    }
}

pub struct Engine {
    config: Config,
    source: Arc<dyn Source>,
    db: Database,
    compressor: ChapterCompressor,
}

impl Engine {
    pub fn new(config: Config) -> Result<Self> {
        let source = crate::source::create(&config)?;
        let db = Database::open(&config.paths.db_path)?;
        let compressor = ChapterCompressor::new(
            config.paths.dict_path_if_present(),
            config.compression_level,
        )?;
        Ok(Self {
            config,
            source,
            db,
            compressor,
        })
    }

    /// For tests and callers that already hold the pieces.
    pub fn with_parts(
        config: Config,
        source: Arc<dyn Source>,
        db: Database,
        compressor: ChapterCompressor,
    ) -> Self {
        Self {
            config,
            source,
            db,
            compressor,
        }
    }

    /// Load the plan file for the configured source, applying the
    /// `min_chapters` filter.
    pub fn load_plan(&self) -> Result<Vec<PlanEntry>> {
        let path = self
            .config
            .plan_override
            .clone()
            .unwrap_or_else(|| self.config.paths.plan_path(self.config.source));
        let text = std::fs::read_to_string(&path)
            .wrap_err_with(|| format!("cannot read plan {}", path.display()))?;
        let entries: Vec<PlanEntry> = serde_json::from_str(&text)
            .wrap_err_with(|| format!("invalid plan {}", path.display()))?;

        let min = self.config.min_chapters;
        Ok(entries
            .into_iter()
            .filter(|e| min == 0 || e.chapter_count.unwrap_or(u32::MAX) >= min)
            .collect())
    }

    /// Process a whole plan with `book_workers` parallel workers.
    pub fn run(&self, plan: &[PlanEntry]) -> Result<IngestReport> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.tuning.book_workers.max(1))
            .thread_name(|i| format!("book-worker-{i}"))
            .build()?;

        let bar = MULTI_PROGRESS.add(get_progress_bar(plan.len() as u64, 10));
        bar.set_prefix(self.config.source.to_string());

        let outcomes: Vec<BookOutcome> = pool.install(|| {
            plan.par_iter()
                .map(|entry| {
                    let outcome = self.process_book(entry);
                    if let BookOutcome::Failed(message) = &outcome {
                        bar.eprintln(&eyre::eyre!(
                            "book {}: {message}",
                            entry.id.unwrap_or_default()
                        ));
                    }
                    bar.inc(1);
                    outcome
                })
                .collect()
        });
        bar.finish_and_clear();

        let mut report = IngestReport::default();
        for outcome in &outcomes {
            report.absorb(outcome);
        }
        Ok(report)
    }

    /// The per-book pipeline, metadata first, chapters second, cover
    /// last.
    pub fn process_book(&self, entry: &PlanEntry) -> BookOutcome {
        let book_id = match entry.id {
            Some(id) => id,
            None => return BookOutcome::Failed("plan entry without id".to_string()),
        };

        // 1. metadata
        let meta = match self.source.fetch_book_metadata(entry) {
            Ok(Some(meta)) => meta,
            Ok(None) => return BookOutcome::NotFound,
            Err(e) => return BookOutcome::Failed(e.to_string()),
        };

        // 2. what do we already have?
        let bundle_path = self.config.paths.bundle_path(book_id);
        let existing = read_bundle_indices(&bundle_path);
        if meta.chapter_count > 0 && existing.len() as u32 >= meta.chapter_count {
            return BookOutcome::AlreadyComplete;
        }

        // 3. metadata refresh, short-circuited by the hash
        let hash = meta_hash(&meta);
        if !self.config.dry_run {
            match self.db.book_meta_hash(book_id) {
                Ok(stored) if stored.as_deref() == Some(hash.as_str()) => {}
                Ok(_) => {
                    if let Err(e) = self.db.upsert_book_metadata(
                        &meta,
                        meta.cover_url.as_deref(),
                        existing.len() as u32,
                        &hash,
                    ) {
                        return BookOutcome::Failed(format!("metadata upsert: {e}"));
                    }
                }
                Err(e) => return BookOutcome::Failed(format!("meta hash read: {e}")),
            }
        }

        if self.config.dry_run {
            let missing = missing_chapters(&meta, &existing).len() as u32;
            info!(book_id, missing, "dry run, skipping fetch");
            return BookOutcome::Refreshed {
                new_chapters: missing,
                errors: 0,
            };
        }

        // 4. stream new chapters into memory
        let stream =
            Arc::clone(&self.source).fetch_chapters(&meta, &existing, &bundle_path);
        let mut received: HashMap<u32, ChapterData> = HashMap::new();
        for chapter in stream.iter() {
            // duplicates within one stream collapse by index
            received.insert(chapter.index, chapter);
        }
        let errors = stream.error_count();
        if let Some(fatal) = stream.take_fatal() {
            error!(book_id, error = %fatal, "aborting book");
            return BookOutcome::Failed(fatal.to_string());
        }

        let new_count = received.len() as u32;
        if received.is_empty() {
            return BookOutcome::Refreshed {
                new_chapters: 0,
                errors,
            };
        }

        // 5.–6. merge with prior chapters byte-for-byte and rewrite
        match self.write_chapters(book_id, &bundle_path, received) {
            Ok(total_stored) => {
                // 8. cover, best-effort
                let cover = self.source.download_cover(
                    book_id,
                    &meta,
                    &self.config.paths.covers_dir,
                    self.config.force_cover,
                );
                if let Some(cover_url) = cover {
                    let _ = self.db.update_cover_url(book_id, &cover_url);
                }
                let _ = self.db.update_chapters_saved(book_id, total_stored);

                info!(book_id, new = new_count, errors, "book done");
                BookOutcome::Refreshed {
                    new_chapters: new_count,
                    errors,
                }
            }
            Err(e) => BookOutcome::Failed(format!("bundle write: {e}")),
        }
    }

    /// Compress the received chapters, merge them with what the bundle
    /// already holds, rewrite atomically, and index the new rows.
    fn write_chapters(
        &self,
        book_id: i64,
        bundle_path: &Path,
        received: HashMap<u32, ChapterData>,
    ) -> Result<u32> {
        // prior chapters are carried over without re-compression
        let mut bodies = read_bundle_raw(bundle_path);
        let mut meta = read_bundle_meta(bundle_path);

        let mut rows = Vec::with_capacity(received.len());
        for (index, chapter) in received {
            let (compressed, raw_len) = self.compressor.compress(&chapter.body)?;
            bodies.insert(index, (compressed, raw_len));
            meta.insert(
                index,
                ChapterMeta {
                    chapter_id: chapter.chapter_id,
                    word_count: chapter.word_count,
                    title: chapter.title.clone(),
                    slug: chapter.slug.clone(),
                },
            );
            rows.push((index, chapter.title, chapter.slug, chapter.word_count));
        }

        write_bundle(bundle_path, &bodies, &meta)?;

        rows.sort_unstable_by_key(|(index, ..)| *index);
        self.db.insert_chapters(book_id, &rows)?;
        Ok(bodies.len() as u32)
    }

}

/// Chapters the plan would fetch for a book, given what is stored —
/// what `--dry-run` reports.
pub fn missing_chapters(meta: &BookMetadata, existing: &HashSet<u32>) -> Vec<u32> {
    (1..=meta.chapter_count)
        .filter(|i| !existing.contains(i))
        .collect()
}
