//! Cover image download. Failures are silent by contract — a missing
//! cover never blocks ingestion.

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::request::HttpClient;

/// Responses smaller than this are error pages, not images.
const MIN_COVER_BYTES: usize = 100;

/// Try candidate URLs in order and write `<covers_dir>/<book_id>.jpg`
/// with the first plausible response. Returns the public cover path on
/// success. An existing file short-circuits unless `force` is set.
pub fn download_from_candidates<'a>(
    client: &HttpClient,
    book_id: i64,
    candidates: impl Iterator<Item = &'a str>,
    covers_dir: &Path,
    force: bool,
) -> Option<String> {
    let dest = covers_dir.join(format!("{book_id}.jpg"));
    let public = format!("/covers/{book_id}.jpg");

    if dest.exists() && !force {
        return Some(public);
    }

    for url in candidates {
        if url.is_empty() || url.contains("default-book") {
            continue;
        }
        let data = match client.get_bytes(url) {
            Ok(data) => data,
            Err(e) => {
                debug!(book_id, url, error = %e, "cover candidate failed");
                continue;
            }
        };
        if data.len() < MIN_COVER_BYTES {
            continue;
        }
        if fs::create_dir_all(covers_dir).is_err() {
            return None;
        }
        if fs::write(&dest, &data).is_err() {
            return None;
        }
        return Some(public);
    }
    None
}
