//! Runtime configuration: on-disk layout and per-source tuning.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::book::SourceKind;
use crate::compress::DEFAULT_COMPRESSION_LEVEL;

/// Where everything lives on disk:
/// `<data_dir>/compressed/<book_id>.bundle`, `<data_dir>/covers/`,
/// `<data_dir>/epub-cache/`, `<data_dir>/global.dict`,
/// `<data_dir>/library.db`, `<data_dir>/plans/books_plan_<source>.json`.
#[derive(Debug, Clone)]
pub struct Paths {
    pub data_dir: PathBuf,
    pub compressed_dir: PathBuf,
    pub covers_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub db_path: PathBuf,
    pub dict_path: PathBuf,
}

impl Paths {
    pub fn from_data_dir(data_dir: PathBuf) -> Self {
        Self {
            compressed_dir: data_dir.join("compressed"),
            covers_dir: data_dir.join("covers"),
            cache_dir: data_dir.join("epub-cache"),
            db_path: data_dir.join("library.db"),
            dict_path: data_dir.join("global.dict"),
            data_dir,
        }
    }

    /// Default data dir under the platform data directory.
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bookvault")
    }

    pub fn bundle_path(&self, book_id: i64) -> PathBuf {
        self.compressed_dir.join(format!("{book_id}.bundle"))
    }

    pub fn cover_path(&self, book_id: i64) -> PathBuf {
        self.covers_dir.join(format!("{book_id}.jpg"))
    }

    pub fn plan_path(&self, source: SourceKind) -> PathBuf {
        self.data_dir
            .join("plans")
            .join(format!("books_plan_{source}.json"))
    }

    /// The dictionary is optional on disk; `None` means plain zstd.
    pub fn dict_path_if_present(&self) -> Option<&Path> {
        self.dict_path.exists().then_some(self.dict_path.as_path())
    }
}

/// Per-source client tuning. The HTTP cap and the book-worker cap
/// compose: `book_workers × max_concurrent` bounds nothing — the HTTP
/// pool is shared per source, so `max_concurrent` alone is the hard cap
/// on in-flight requests.
#[derive(Debug, Clone, Copy)]
pub struct SourceTuning {
    pub max_concurrent: usize,
    pub request_delay: Duration,
    pub book_workers: usize,
    pub fetch_batch_size: usize,
    pub read_timeout: Duration,
}

impl SourceTuning {
    pub fn defaults_for(source: SourceKind) -> Self {
        match source {
            SourceKind::Api => Self {
                max_concurrent: 180,
                request_delay: Duration::from_millis(15),
                book_workers: 20,
                fetch_batch_size: 0,
                read_timeout: Duration::from_secs(30),
            },
            SourceKind::Ttv => Self {
                max_concurrent: 20,
                request_delay: Duration::from_millis(300),
                book_workers: 5,
                fetch_batch_size: 10,
                read_timeout: Duration::from_secs(30),
            },
            SourceKind::Tf => Self {
                max_concurrent: 20,
                request_delay: Duration::from_millis(150),
                book_workers: 5,
                fetch_batch_size: 10,
                read_timeout: Duration::from_secs(30),
            },
        }
    }
}

/// Everything an ingestion run needs to know.
#[derive(Debug, Clone)]
pub struct Config {
    pub paths: Paths,
    pub source: SourceKind,
    pub tuning: SourceTuning,
    pub compression_level: i32,
    /// Plan entries below this chapter count are skipped.
    pub min_chapters: u32,
    pub force_cover: bool,
    pub dry_run: bool,
    pub verify_mac: bool,
    /// Bearer token for the API source; HTML sources are unauthenticated.
    pub api_token: Option<String>,
    /// Explicit plan file, overriding `<data_dir>/plans/books_plan_<source>.json`.
    pub plan_override: Option<PathBuf>,
}

impl Config {
    pub fn new(data_dir: PathBuf, source: SourceKind) -> Self {
        Self {
            paths: Paths::from_data_dir(data_dir),
            source,
            tuning: SourceTuning::defaults_for(source),
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            min_chapters: 0,
            force_cover: false,
            dry_run: false,
            verify_mac: false,
            api_token: std::env::var("BOOKVAULT_API_TOKEN").ok(),
            plan_override: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_follows_the_data_dir() {
        let paths = Paths::from_data_dir(PathBuf::from("/tmp/bv"));
        assert_eq!(paths.bundle_path(100358), Path::new("/tmp/bv/compressed/100358.bundle"));
        assert_eq!(paths.cover_path(7), Path::new("/tmp/bv/covers/7.jpg"));
        assert_eq!(
            paths.plan_path(SourceKind::Ttv),
            Path::new("/tmp/bv/plans/books_plan_ttv.json")
        );
        assert_eq!(paths.dict_path, Path::new("/tmp/bv/global.dict"));
    }

    #[test]
    fn per_source_defaults_differ() {
        let api = SourceTuning::defaults_for(SourceKind::Api);
        let tf = SourceTuning::defaults_for(SourceKind::Tf);
        assert_eq!(api.max_concurrent, 180);
        assert_eq!(tf.max_concurrent, 20);
        assert_eq!(tf.fetch_batch_size, 10);
    }
}
