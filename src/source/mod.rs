//! Uniform interface over the three upstream transports.
//!
//! A source knows how to fetch one book's metadata, stream its missing
//! chapters, and download its cover — everything downstream of here is
//! source-agnostic. Chapter streams are producer threads feeding a
//! bounded channel, so a slow consumer back-pressures the fetcher and
//! per-chapter failures stay inside the source (logged and counted, not
//! raised).

mod api;
mod tf;
mod ttv;

pub use api::ApiSource;
pub use tf::TfSource;
pub use ttv::TtvSource;

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use thiserror::Error;

use crate::book::{BookMetadata, ChapterData, PlanEntry, SourceKind};
use crate::config::Config;
use crate::request::FetchError;

/// Chapters buffered in the channel before the producer blocks.
const STREAM_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// The upstream answered with a different book than asked for —
    /// never overwrite local data with it.
    #[error("upstream returned wrong book: expected {expected}, got {got}")]
    WrongBook { expected: i64, got: i64 },
    /// A resume anchor resolved to a chapter with an unexpected index.
    #[error("resume anchor {chapter_id} returned index {got}, expected {expected}")]
    CorruptResume {
        chapter_id: u32,
        got: u32,
        expected: u32,
    },
    #[error("plan entry is missing `{0}`")]
    BadPlanEntry(&'static str),
}

pub trait Source: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Fetch normalized metadata for one plan entry. `Ok(None)` means the
    /// book is gone upstream (404); errors are everything else.
    fn fetch_book_metadata(&self, entry: &PlanEntry) -> Result<Option<BookMetadata>, SourceError>;

    /// Stream chapters that are not in `existing`. Per-chapter failures
    /// are counted on the stream; a fatal condition (corrupt resume)
    /// terminates it early and is surfaced via [`ChapterStream::fatal`].
    fn fetch_chapters(
        self: Arc<Self>,
        meta: &BookMetadata,
        existing: &HashSet<u32>,
        bundle_path: &Path,
    ) -> ChapterStream;

    /// Write `<covers_dir>/<book_id>.jpg`. Returns the public cover path
    /// on success; all failures are silent (`None`). An existing file
    /// short-circuits unless `force` is set.
    fn download_cover(
        &self,
        book_id: i64,
        meta: &BookMetadata,
        covers_dir: &Path,
        force: bool,
    ) -> Option<String>;
}

/// Build the source selected by the config.
pub fn create(config: &Config) -> eyre::Result<Arc<dyn Source>> {
    Ok(match config.source {
        SourceKind::Api => Arc::new(ApiSource::new(config)),
        SourceKind::Ttv => Arc::new(TtvSource::new(config)?),
        SourceKind::Tf => Arc::new(TfSource::new(config)?),
    })
}

/// Consumer end of a chapter stream plus its failure accounting.
pub struct ChapterStream {
    rx: Receiver<ChapterData>,
    errors: Arc<AtomicU32>,
    fatal: Arc<Mutex<Option<SourceError>>>,
}

impl ChapterStream {
    /// Iterate until the producer finishes or fails.
    pub fn iter(&self) -> impl Iterator<Item = ChapterData> + '_ {
        self.rx.iter()
    }

    /// Chapters the producer failed on and skipped.
    pub fn error_count(&self) -> u32 {
        self.errors.load(Ordering::Relaxed)
    }

    /// A condition that aborted the stream, if any.
    pub fn take_fatal(&self) -> Option<SourceError> {
        self.fatal.lock().ok().and_then(|mut f| f.take())
    }

    /// An immediately-finished stream carrying a fatal error.
    pub(crate) fn failed(error: SourceError) -> Self {
        let stream = Self::spawn(|_| {});
        if let Ok(mut fatal) = stream.fatal.lock() {
            *fatal = Some(error);
        }
        stream
    }

    /// Run `producer` on its own thread, handing it the sending side.
    pub(crate) fn spawn<F>(producer: F) -> Self
    where
        F: FnOnce(&StreamHandle) + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(STREAM_CAPACITY);
        let errors = Arc::new(AtomicU32::new(0));
        let fatal = Arc::new(Mutex::new(None));
        let handle = StreamHandle {
            tx,
            errors: Arc::clone(&errors),
            fatal: Arc::clone(&fatal),
        };
        thread::spawn(move || producer(&handle));
        Self { rx, errors, fatal }
    }
}

/// Producer-side handle: yield chapters, count skips, flag fatals.
pub(crate) struct StreamHandle {
    tx: SyncSender<ChapterData>,
    errors: Arc<AtomicU32>,
    fatal: Arc<Mutex<Option<SourceError>>>,
}

impl StreamHandle {
    /// Send one chapter. `false` means the consumer hung up and the
    /// producer should stop.
    pub fn yield_chapter(&self, chapter: ChapterData) -> bool {
        self.tx.send(chapter).is_ok()
    }

    pub fn count_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_fatal(&self, error: SourceError) {
        if let Ok(mut fatal) = self.fatal.lock() {
            *fatal = Some(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chapter(index: u32) -> ChapterData {
        ChapterData {
            index,
            title: format!("Chương {index}"),
            slug: format!("chuong-{index}"),
            body: "body".to_string(),
            word_count: 1,
            chapter_id: 0,
        }
    }

    #[test]
    fn stream_delivers_in_order_and_counts_errors() {
        let stream = ChapterStream::spawn(|handle| {
            for i in 1..=5 {
                if i == 3 {
                    handle.count_error();
                    continue;
                }
                assert!(handle.yield_chapter(chapter(i)));
            }
        });

        let got: Vec<u32> = stream.iter().map(|c| c.index).collect();
        assert_eq!(got, vec![1, 2, 4, 5]);
        assert_eq!(stream.error_count(), 1);
        assert!(stream.take_fatal().is_none());
    }

    #[test]
    fn failed_stream_is_empty_and_fatal() {
        let stream = ChapterStream::failed(SourceError::BadPlanEntry("slug"));
        assert_eq!(stream.iter().count(), 0);
        assert!(matches!(
            stream.take_fatal(),
            Some(SourceError::BadPlanEntry("slug"))
        ));
    }

    #[test]
    fn dropping_the_consumer_stops_the_producer() {
        let (done_tx, done_rx) = mpsc::channel();
        let stream = ChapterStream::spawn(move |handle| {
            let mut i = 0;
            loop {
                i += 1;
                if !handle.yield_chapter(chapter(i)) {
                    break;
                }
            }
            let _ = done_tx.send(i);
        });

        // consume a couple then hang up
        let mut iter = stream.iter();
        iter.next();
        iter.next();
        drop(iter);
        drop(stream);

        let sent = done_rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert!(sent >= 2);
    }
}
