//! Encrypted mobile-API source.
//!
//! Chapters form a linked list: each `GET /api/chapters/<id>` carries
//! `next.id` / `previous.id` pointers. The walk planner picks the
//! cheapest traversal for what is already on disk:
//!
//! * **resume** — a v2 bundle recorded the last chapter's upstream ID;
//!   one GET re-anchors there and the walk continues forward. Costs
//!   `1 + missing` requests.
//! * **reverse** — no usable anchor; walk back from `latest_chapter`
//!   until a known index appears. Costs `missing + 1`.
//! * **forward** — nothing stored at all; walk from `first_chapter`.
//!
//! A resume anchor that resolves to the wrong index means the bundle and
//! the upstream disagree about what this book is — that aborts the book.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use super::{ChapterStream, Source, SourceError};
use crate::book::{
    self, author_from_creator, author_needs_fix, parse_author_id, slugify, AuthorMeta,
    BookMetadata, ChapterData, GenreMeta, PlanEntry, Poster, SourceKind, TagMeta,
};
use crate::bundle::read_bundle_meta;
use crate::config::Config;
use crate::decrypt::{body_after_title, count_words, decrypt_content};
use crate::request::{FetchError, HttpClient, HttpSettings};

const BASE_URL: &str = "https://android.lonoapp.net";
const BOOK_INCLUDES: &str = "author,creator,genres";

#[derive(Debug, Clone, Deserialize)]
pub struct ChapterLink {
    pub id: u32,
}

/// One chapter as the API returns it; `content` is still encrypted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiChapter {
    #[serde(default)]
    pub id: u32,
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub next: Option<ChapterLink>,
    #[serde(default)]
    pub previous: Option<ChapterLink>,
}

/// The chapter endpoint, separated from the HTTP client so the walk
/// planner and the walks themselves are testable offline.
trait ChapterEndpoint {
    fn get_chapter(&self, chapter_id: u32) -> Result<ApiChapter, FetchError>;
}

struct ApiClient {
    http: HttpClient,
}

impl ApiClient {
    fn new(config: &Config) -> Self {
        let mut settings = HttpSettings::new(BASE_URL, config.tuning.request_delay);
        settings.read_timeout = config.tuning.read_timeout;
        settings.headers = vec![
            ("x-app", "app.android".to_string()),
            ("user-agent", "Dart/3.5 (dart:io)".to_string()),
            ("content-type", "application/json".to_string()),
        ];
        if let Some(token) = &config.api_token {
            settings.headers.push(("authorization", format!("Bearer {token}")));
        }
        Self {
            http: HttpClient::new(settings),
        }
    }

    /// Unwrap the `{success, data}` envelope every endpoint uses.
    fn get_data(&self, url: &str, params: &[(&str, &str)]) -> Result<Value, FetchError> {
        let payload: Value = self.http.get_json(url, params)?;
        if !payload
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            return Err(FetchError::Body(format!("API error payload: {payload}")));
        }
        payload
            .get("data")
            .cloned()
            .ok_or_else(|| FetchError::Body("API payload without data".to_string()))
    }

    fn get_book(&self, book_id: i64) -> Result<Value, FetchError> {
        let data = self.get_data(
            &format!("/api/books/{book_id}"),
            &[("include", BOOK_INCLUDES)],
        )?;
        Ok(unwrap_book(data))
    }
}

impl ChapterEndpoint for ApiClient {
    fn get_chapter(&self, chapter_id: u32) -> Result<ApiChapter, FetchError> {
        let data = self.get_data(&format!("/api/chapters/{chapter_id}"), &[])?;
        serde_json::from_value(data).map_err(|e| FetchError::Body(e.to_string()))
    }
}

/// The book payload is sometimes nested as `{"book": {...}}`, sometimes a
/// one-element list of that.
fn unwrap_book(data: Value) -> Value {
    match data {
        Value::Object(ref map) if map.contains_key("book") => map["book"].clone(),
        Value::Array(mut items) if !items.is_empty() => {
            let first = items.swap_remove(0);
            match first {
                Value::Object(ref map) if map.contains_key("book") => map["book"].clone(),
                other => other,
            }
        }
        other => other,
    }
}

fn as_i64(v: &Value, key: &str) -> i64 {
    v.get(key).and_then(Value::as_i64).unwrap_or(0)
}

fn as_opt_string(v: &Value, key: &str) -> Option<String> {
    v.get(key)
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .filter(|s| !s.is_empty())
}

/// Normalize a raw API book payload into [`BookMetadata`].
///
/// Placeholder authors ("đang cập nhật", empty) are replaced by a
/// synthetic author derived from the uploader.
pub fn parse_book_full(raw: &Value) -> Option<BookMetadata> {
    let id = raw.get("id").and_then(Value::as_i64)?;
    let name = as_opt_string(raw, "name").unwrap_or_else(|| "?".to_string());

    let status_name = as_opt_string(raw, "status_name").or_else(|| as_opt_string(raw, "state"));
    let review_score = match raw.get("review_score") {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    };

    let mut author = raw.get("author").and_then(parse_author);
    if author_needs_fix(author.as_ref()) {
        if let Some(creator) = raw.get("creator") {
            let creator_id = creator
                .get("id")
                .map(|v| parse_author_id(v).unwrap_or(0))
                .unwrap_or(0);
            let creator_name = as_opt_string(creator, "name").unwrap_or_default();
            if let Some(synthetic) = author_from_creator(creator_id, &creator_name) {
                author = Some(synthetic);
            }
        }
    }

    let genres = raw
        .get("genres")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|g| {
                    Some(GenreMeta {
                        id: g.get("id").and_then(Value::as_i64),
                        name: as_opt_string(g, "name")?,
                        slug: as_opt_string(g, "slug"),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let tags = raw
        .get("tags")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|t| {
                    Some(TagMeta {
                        id: t.get("id").and_then(Value::as_i64)?,
                        name: as_opt_string(t, "name")?,
                        type_id: t.get("type_id").and_then(|v| match v {
                            Value::Number(n) => n.as_i64(),
                            Value::String(s) => s.parse().ok(),
                            _ => None,
                        }),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let chapter_count = raw
        .get("chapter_count")
        .or_else(|| raw.get("latest_index"))
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;

    let slug = as_opt_string(raw, "slug").unwrap_or_else(|| slugify(&name));

    Some(BookMetadata {
        id,
        slug,
        synopsis: as_opt_string(raw, "synopsis"),
        status: status_name.as_deref().map_or(1, book::map_status),
        status_name,
        view_count: as_i64(raw, "view_count"),
        comment_count: as_i64(raw, "comment_count"),
        bookmark_count: as_i64(raw, "bookmark_count"),
        vote_count: as_i64(raw, "vote_count"),
        review_score,
        review_count: as_i64(raw, "review_count"),
        chapter_count,
        word_count: as_i64(raw, "word_count"),
        cover_url: None,
        author,
        genres,
        tags,
        created_at: as_opt_string(raw, "created_at"),
        updated_at: as_opt_string(raw, "updated_at"),
        published_at: as_opt_string(raw, "published_at"),
        new_chap_at: as_opt_string(raw, "new_chap_at"),
        source: SourceKind::Api,
        first_chapter: raw
            .get("first_chapter")
            .and_then(Value::as_u64)
            .map(|v| v as u32),
        latest_chapter: raw
            .get("latest_chapter")
            .and_then(Value::as_u64)
            .map(|v| v as u32),
        poster: raw
            .get("poster")
            .map(parse_poster)
            .filter(|p| p.candidates().next().is_some()),
        upstream_slug: None,
        name,
    })
}

fn parse_author(raw: &Value) -> Option<AuthorMeta> {
    let id = raw.get("id").and_then(parse_author_id);
    Some(AuthorMeta {
        id,
        name: as_opt_string(raw, "name")?,
        local_name: as_opt_string(raw, "local_name"),
        avatar: as_opt_string(raw, "avatar"),
    })
}

fn parse_poster(raw: &Value) -> Poster {
    match raw {
        Value::Object(_) => Poster {
            default: as_opt_string(raw, "default"),
            size_600: as_opt_string(raw, "600"),
            size_300: as_opt_string(raw, "300"),
            size_150: as_opt_string(raw, "150"),
        },
        Value::String(s) => Poster {
            default: Some(s.clone()),
            ..Poster::default()
        },
        _ => Poster::default(),
    }
}

/// Where to start walking and in which direction.
#[derive(Debug, PartialEq, Eq)]
enum WalkPlan {
    Forward { start: u32 },
    Reverse { start: u32 },
    /// Nothing to fetch.
    Done,
}

/// Decide the walk strategy from what the bundle already holds.
fn plan_walk(
    endpoint: &dyn ChapterEndpoint,
    book_id: i64,
    first_chapter: Option<u32>,
    latest_chapter: Option<u32>,
    existing: &HashSet<u32>,
    bundle_path: &Path,
) -> Result<WalkPlan, SourceError> {
    let Some(&max_existing) = existing.iter().max() else {
        // no bundle at all — full forward walk
        return Ok(first_chapter.map_or(WalkPlan::Done, |start| WalkPlan::Forward { start }));
    };

    let anchor = read_bundle_meta(bundle_path)
        .get(&max_existing)
        .map(|m| m.chapter_id)
        .filter(|id| *id != 0);

    if let Some(anchor_id) = anchor {
        return plan_resume(
            endpoint,
            book_id,
            anchor_id,
            max_existing,
            first_chapter,
            latest_chapter,
        );
    }

    // v1 bundle or empty inline meta — reverse from the newest chapter
    if let Some(start) = latest_chapter {
        info!(book_id, start, "no stored chapter id, reverse walk");
        return Ok(WalkPlan::Reverse { start });
    }
    Ok(first_chapter.map_or(WalkPlan::Done, |start| WalkPlan::Forward { start }))
}

/// O(missing) resume from the stored last chapter id.
fn plan_resume(
    endpoint: &dyn ChapterEndpoint,
    book_id: i64,
    anchor_id: u32,
    max_existing: u32,
    first_chapter: Option<u32>,
    latest_chapter: Option<u32>,
) -> Result<WalkPlan, SourceError> {
    match endpoint.get_chapter(anchor_id) {
        Ok(chapter) => {
            if chapter.index != max_existing {
                return Err(SourceError::CorruptResume {
                    chapter_id: anchor_id,
                    got: chapter.index,
                    expected: max_existing,
                });
            }
            match chapter.next {
                Some(next) => {
                    info!(book_id, last_index = max_existing, from = next.id, "resume");
                    Ok(WalkPlan::Forward { start: next.id })
                }
                None => {
                    info!(book_id, "resume: already at last chapter");
                    Ok(WalkPlan::Done)
                }
            }
        }
        Err(e) if e.is_not_found() => {
            // anchor went stale upstream
            if let Some(start) = latest_chapter {
                info!(book_id, start, "stored chapter id 404, reverse walk");
                Ok(WalkPlan::Reverse { start })
            } else {
                Ok(first_chapter.map_or(WalkPlan::Done, |start| WalkPlan::Forward { start }))
            }
        }
        Err(e) => {
            warn!(book_id, error = %e, "resume probe failed, full forward walk");
            Ok(first_chapter.map_or(WalkPlan::Done, |start| WalkPlan::Forward { start }))
        }
    }
}

/// Follow `next.id` from `start`, emitting chapters whose index is new.
/// Ends on a null pointer, a 404, or a failed fetch.
fn walk_forward(
    endpoint: &dyn ChapterEndpoint,
    book_id: i64,
    start: u32,
    existing: &HashSet<u32>,
    emit: &mut dyn FnMut(ApiChapter) -> bool,
) {
    let mut next_id = Some(start);
    while let Some(chapter_id) = next_id {
        let chapter = match endpoint.get_chapter(chapter_id) {
            Ok(chapter) => chapter,
            Err(e) if e.is_not_found() => break,
            Err(e) => {
                warn!(book_id, chapter_id, error = %e, "chapter fetch failed, stopping walk");
                break;
            }
        };
        next_id = chapter.next.as_ref().map(|n| n.id);
        if existing.contains(&chapter.index) {
            continue;
        }
        if !emit(chapter) {
            break;
        }
    }
}

/// Follow `previous.id` from `start`; the first already-known index means
/// everything below is stored, so the walk stops there.
fn walk_reverse(
    endpoint: &dyn ChapterEndpoint,
    book_id: i64,
    start: u32,
    existing: &HashSet<u32>,
    emit: &mut dyn FnMut(ApiChapter) -> bool,
) {
    let mut prev_id = Some(start);
    while let Some(chapter_id) = prev_id {
        let chapter = match endpoint.get_chapter(chapter_id) {
            Ok(chapter) => chapter,
            Err(e) if e.is_not_found() => break,
            Err(e) => {
                warn!(book_id, chapter_id, error = %e, "chapter fetch failed, stopping walk");
                break;
            }
        };
        if existing.contains(&chapter.index) {
            break;
        }
        prev_id = chapter.previous.as_ref().map(|p| p.id);
        if !emit(chapter) {
            break;
        }
    }
}

/// Decrypt one fetched chapter into [`ChapterData`].
fn decrypt_chapter(chapter: &ApiChapter, verify_mac: bool) -> Option<ChapterData> {
    let encrypted = chapter.content.as_deref().unwrap_or("");
    if encrypted.is_empty() {
        warn!(index = chapter.index, "empty content");
        return None;
    }
    let plaintext = match decrypt_content(encrypted, verify_mac) {
        Ok(plaintext) => plaintext,
        Err(e) => {
            warn!(index = chapter.index, error = %e, "decrypt failed");
            return None;
        }
    };

    // The API's own `name` is the authoritative title, prefix included.
    let title = chapter
        .name
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map_or_else(|| format!("Chương {}", chapter.index), ToString::to_string);
    let slug = chapter
        .slug
        .clone()
        .unwrap_or_else(|| format!("chapter-{}", chapter.index));

    let body = body_after_title(&plaintext, &title);
    let word_count = count_words(&body);

    Some(ChapterData {
        index: chapter.index,
        title,
        slug,
        body,
        word_count,
        chapter_id: chapter.id,
    })
}

pub struct ApiSource {
    client: Arc<ApiClient>,
    verify_mac: bool,
}

impl ApiSource {
    pub fn new(config: &Config) -> Self {
        Self {
            client: Arc::new(ApiClient::new(config)),
            verify_mac: config.verify_mac,
        }
    }
}

impl Source for ApiSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Api
    }

    fn fetch_book_metadata(&self, entry: &PlanEntry) -> Result<Option<BookMetadata>, SourceError> {
        let book_id = entry.id.ok_or(SourceError::BadPlanEntry("id"))?;

        let raw = match self.client.get_book(book_id) {
            Ok(raw) => raw,
            Err(e) if e.is_not_found() => {
                info!(book_id, "not found on API");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let Some(meta) = parse_book_full(&raw) else {
            return Err(SourceError::Fetch(FetchError::Body(format!(
                "unparseable book payload for {book_id}"
            ))));
        };

        // Diacritics-insensitive search upstream sometimes answers with a
        // different book; storing it would corrupt the index.
        if meta.id != book_id {
            return Err(SourceError::WrongBook {
                expected: book_id,
                got: meta.id,
            });
        }

        Ok(Some(meta))
    }

    fn fetch_chapters(
        self: Arc<Self>,
        meta: &BookMetadata,
        existing: &HashSet<u32>,
        bundle_path: &Path,
    ) -> ChapterStream {
        let client = Arc::clone(&self.client);
        let verify_mac = self.verify_mac;
        let book_id = meta.id;
        let first_chapter = meta.first_chapter;
        let latest_chapter = meta.latest_chapter;
        let existing = existing.clone();
        let bundle_path = bundle_path.to_path_buf();

        ChapterStream::spawn(move |handle| {
            let plan = match plan_walk(
                client.as_ref(),
                book_id,
                first_chapter,
                latest_chapter,
                &existing,
                &bundle_path,
            ) {
                Ok(plan) => plan,
                Err(e) => {
                    handle.set_fatal(e);
                    return;
                }
            };

            let mut emit = |chapter: ApiChapter| match decrypt_chapter(&chapter, verify_mac) {
                Some(data) => handle.yield_chapter(data),
                None => {
                    handle.count_error();
                    true
                }
            };

            match plan {
                WalkPlan::Forward { start } => {
                    walk_forward(client.as_ref(), book_id, start, &existing, &mut emit);
                }
                WalkPlan::Reverse { start } => {
                    walk_reverse(client.as_ref(), book_id, start, &existing, &mut emit);
                }
                WalkPlan::Done => {}
            }
        })
    }

    fn download_cover(
        &self,
        book_id: i64,
        meta: &BookMetadata,
        covers_dir: &Path,
        force: bool,
    ) -> Option<String> {
        crate::cover::download_from_candidates(
            &self.client.http,
            book_id,
            meta.poster.iter().flat_map(Poster::candidates),
            covers_dir,
            force,
        )
    }
}
