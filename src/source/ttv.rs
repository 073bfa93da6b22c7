//! TTV source — server-rendered HTML, no authentication.
//!
//! Chapter URLs are deterministic (`/doc-truyen/<slug>/chuong-<n>`), so
//! the walk is plain sequential iteration fetched in concurrent batches.
//! Book IDs live in the 10M namespace, author IDs in the 20M namespace,
//! both assigned at plan-generation time.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use lazy_regex::regex;
use rayon::prelude::*;
use scraper::{ElementRef, Html};
use tracing::{info, warn};

use super::{ChapterStream, Source, SourceError};
use crate::book::{
    map_status, slugify, AuthorMeta, BookMetadata, ChapterData, GenreMeta, PlanEntry, SourceKind,
    TTV_AUTHOR_ID_OFFSET,
};
use crate::config::Config;
use crate::decrypt::count_words;
use crate::lazy_selectors;
use crate::parsing_utils::{collect_text, QuickSelect};
use crate::request::{HttpClient, HttpSettings};

const BASE_URL: &str = "https://truyen.tangthuvien.vn";

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

lazy_selectors! {
    LISTING_ITEM_SELECTOR: "div.rank-view-list li";
    LISTING_TITLE_SELECTOR: "div.book-mid-info h4 a";
    LISTING_AUTHOR_SELECTOR: "p.author a.name";
    LISTING_GENRE_SELECTOR: "p.author a[href*=\"the-loai\"]";
    LISTING_SPAN_SELECTOR: "p.author > span";
    LISTING_COUNT_SELECTOR: "p.author span span";
    LISTING_INTRO_SELECTOR: "p.intro";
    LISTING_UPDATE_SELECTOR: "p.update span";
    LISTING_COVER_SELECTOR: "div.book-img-box img";
    PAGINATION_SELECTOR: "div.pagination ul.pagination li a";

    DETAIL_TITLE_SELECTOR: "div.book-info h1";
    DETAIL_AUTHOR_SELECTOR: "div.book-info p.tag a[href*=\"tac-gia\"]";
    DETAIL_STATUS_SELECTOR: "div.book-info p.tag span.blue";
    DETAIL_GENRE_SELECTOR: "div.book-info p.tag a[href*=\"the-loai\"]";
    DETAIL_FULL_INTRO_SELECTOR: "div.book-info-detail div.book-intro p";
    DETAIL_SHORT_INTRO_SELECTOR: "div.book-info p.intro";
    DETAIL_FALLBACK_INTRO_SELECTOR: "div.book-intro p";
    DETAIL_VIEW_SELECTOR: "span[class*=\"ULtwOOTH-view\"]";
    DETAIL_LIKE_SELECTOR: "span[class*=\"ULtwOOTH-like\"]";
    DETAIL_NOMI_SELECTOR: "span[class*=\"ULtwOOTH-nomi\"]";
    DETAIL_RATE_SELECTOR: "cite#myrate";
    DETAIL_RATING_COUNT_SELECTOR: "span#myrating";
    DETAIL_CATALOG_TAB_SELECTOR: "a#j-bookCatalogPage";
    DETAIL_COVER_SELECTOR: "div.book-img img";
    DETAIL_OG_IMAGE_SELECTOR: "meta[property=\"og:image\"]";
    DETAIL_JSON_LD_SELECTOR: "script[type=\"application/ld+json\"]";

    CHAPTER_TITLE_SELECTOR: "h2";
    CHAPTER_BODY_SELECTOR: "div.box-chap";
    CHAPTER_NOISE_SELECTOR: "div.box-chap h5";
}

/// One book stub from a `/tong-hop` listing page.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingEntry {
    pub name: String,
    /// ASCII-clean slug for the database.
    pub slug: String,
    /// Original URL slug (may carry diacritics).
    pub upstream_slug: String,
    pub author_name: String,
    pub author_id: Option<i64>,
    pub genre: String,
    pub status_text: String,
    pub chapter_count: u32,
    pub synopsis: String,
    pub updated_at: String,
    pub cover_url: String,
}

fn parse_int(text: &str) -> i64 {
    let digits: String = text.chars().filter(char::is_ascii_digit).collect();
    digits.parse().unwrap_or(0)
}

/// `/doc-truyen/muc-than-ky` → `muc-than-ky`
fn extract_slug(url: &str) -> String {
    let path = url
        .split_once("/doc-truyen/")
        .map_or("", |(_, rest)| rest)
        .trim_end_matches('/');
    path.split('?').next().unwrap_or("").to_string()
}

/// Author IDs from `?author=<n>` URLs, shifted into the TTV namespace.
fn extract_author_id(url: &str) -> Option<i64> {
    let captures = regex!(r"author=(\d+)").captures(url)?;
    captures[1].parse::<i64>().ok().map(|id| id + TTV_AUTHOR_ID_OFFSET)
}

/// Parse a `/tong-hop` listing page into book stubs.
pub fn parse_listing_page(html: &str) -> Vec<ListingEntry> {
    let document = Html::parse_document(html);
    document
        .select(&LISTING_ITEM_SELECTOR)
        .filter_map(|li| parse_listing_item(&li))
        .collect()
}

/// Last page number from the pagination links.
pub fn parse_listing_total_pages(html: &str) -> u32 {
    let document = Html::parse_document(html);
    document
        .select(&PAGINATION_SELECTOR)
        .filter_map(|a| a.attr("href"))
        .filter_map(|href| regex!(r"page=(\d+)").captures(href))
        .filter_map(|c| c[1].parse().ok())
        .max()
        .unwrap_or(1)
}

fn parse_listing_item(li: &ElementRef) -> Option<ListingEntry> {
    let title_a = li.select(&LISTING_TITLE_SELECTOR).next()?;
    let upstream_slug = extract_slug(title_a.attr("href").unwrap_or(""));
    let name = collect_text(&title_a);

    let author_a = li.select(&LISTING_AUTHOR_SELECTOR).next();
    let author_name = author_a.as_ref().map(collect_text).unwrap_or_default();
    let author_id = author_a
        .and_then(|a| a.attr("href"))
        .and_then(extract_author_id);

    let genre = li
        .select(&LISTING_GENRE_SELECTOR)
        .next()
        .map(|a| collect_text(&a))
        .unwrap_or_default();

    let mut status_text = String::new();
    let mut chapter_count = 0u32;
    for span in li.select(&LISTING_SPAN_SELECTOR) {
        let text = collect_text(&span);
        if text.contains("chương") {
            chapter_count = parse_int(&text) as u32;
        } else if matches!(
            text.as_str(),
            "Đang ra" | "Đã hoàn thành" | "Hoàn thành" | "Tạm dừng"
        ) {
            status_text = text;
        }
    }
    if chapter_count == 0 {
        chapter_count = li
            .select(&LISTING_COUNT_SELECTOR)
            .map(|span| collect_text(&span))
            .find(|text| text.chars().all(|c| c.is_ascii_digit()) && !text.is_empty())
            .map(|text| parse_int(&text) as u32)
            .unwrap_or(0);
    }

    let synopsis = li
        .select(&LISTING_INTRO_SELECTOR)
        .next()
        .map(|p| collect_text(&p))
        .unwrap_or_default();
    let updated_at = li
        .select(&LISTING_UPDATE_SELECTOR)
        .next()
        .map(|s| collect_text(&s))
        .unwrap_or_default();
    let cover_url = li
        .select(&LISTING_COVER_SELECTOR)
        .next()
        .and_then(|img| img.attr("src"))
        .unwrap_or("")
        .to_string();

    let slug = {
        let ascii = slugify(&name);
        if ascii.is_empty() {
            upstream_slug.clone()
        } else {
            ascii
        }
    };

    Some(ListingEntry {
        name,
        slug,
        upstream_slug,
        author_name,
        author_id,
        genre,
        status_text,
        chapter_count,
        synopsis,
        updated_at,
        cover_url,
    })
}

/// Parse a book detail page into normalized metadata. The caller owns
/// the ID (plan-assigned); it is left at 0 here.
pub fn parse_book_detail(html: &str, upstream_slug: &str) -> BookMetadata {
    let document = Html::parse_document(html);

    let name = document
        .get_text_of(&DETAIL_TITLE_SELECTOR)
        .unwrap_or_else(|| upstream_slug.to_string());

    let author_a = document.select(&DETAIL_AUTHOR_SELECTOR).next();
    let author_name = author_a.as_ref().map(collect_text).unwrap_or_default();
    let author_id = author_a
        .and_then(|a| a.attr("href"))
        .and_then(extract_author_id);

    let status_name = document.get_text_of(&DETAIL_STATUS_SELECTOR);
    let status = status_name.as_deref().map_or(1, map_status);

    let genres = document
        .select(&DETAIL_GENRE_SELECTOR)
        .map(|a| {
            let href = a.attr("href").unwrap_or("");
            let genre_slug = href.trim_end_matches('/').rsplit('/').next().unwrap_or("");
            GenreMeta {
                id: None,
                name: collect_text(&a),
                slug: (!genre_slug.is_empty()).then(|| genre_slug.to_string()),
            }
        })
        .filter(|g| !g.name.is_empty())
        .collect();

    let synopsis = document
        .select(&DETAIL_FULL_INTRO_SELECTOR)
        .next()
        .or_else(|| document.select(&DETAIL_SHORT_INTRO_SELECTOR).next())
        .or_else(|| document.select(&DETAIL_FALLBACK_INTRO_SELECTOR).next())
        .map(|p| collect_text(&p));

    let view_count = document
        .get_text_of(&DETAIL_VIEW_SELECTOR)
        .map_or(0, |t| parse_int(&t));
    let bookmark_count = document
        .get_text_of(&DETAIL_LIKE_SELECTOR)
        .map_or(0, |t| parse_int(&t));
    let vote_count = document
        .get_text_of(&DETAIL_NOMI_SELECTOR)
        .map_or(0, |t| parse_int(&t));

    let review_score = document
        .get_text_of(&DETAIL_RATE_SELECTOR)
        .and_then(|t| t.trim().parse().ok())
        .unwrap_or(0.0);
    let review_count = document
        .get_text_of(&DETAIL_RATING_COUNT_SELECTOR)
        .map_or(0, |t| parse_int(&t));

    // The tab label "Danh sách chương (1825 chương)" is the detail page's
    // own count; a listing-page count, when the plan has one, wins.
    let chapter_count = document
        .get_text_of(&DETAIL_CATALOG_TAB_SELECTOR)
        .and_then(|t| {
            regex!(r"(\d+)\s*chương")
                .captures(&t)
                .and_then(|c| c[1].parse().ok())
        })
        .unwrap_or(0);

    let mut cover_url = document
        .get_attr_of(&DETAIL_COVER_SELECTOR, "src")
        .unwrap_or_default();
    if cover_url.is_empty() || cover_url.contains("default-book") {
        cover_url = document
            .get_attr_of(&DETAIL_OG_IMAGE_SELECTOR, "content")
            .unwrap_or_default();
    }

    let (published_at, modified_at) = document
        .select(&DETAIL_JSON_LD_SELECTOR)
        .next()
        .map(|script| {
            let text: String = script.text().collect();
            let ld: serde_json::Value = serde_json::from_str(&text).unwrap_or_default();
            let date = |key: &str| {
                ld.get(key)
                    .and_then(serde_json::Value::as_str)
                    .map(ToString::to_string)
            };
            (date("datePublished"), date("dateModified"))
        })
        .unwrap_or((None, None));

    let slug = {
        let ascii = slugify(&name);
        if ascii.is_empty() {
            upstream_slug.to_string()
        } else {
            ascii
        }
    };

    let mut meta = BookMetadata::empty(0, SourceKind::Ttv);
    meta.name = name;
    meta.slug = slug;
    meta.synopsis = synopsis;
    meta.status = status;
    meta.status_name = status_name;
    meta.view_count = view_count;
    meta.bookmark_count = bookmark_count;
    meta.vote_count = vote_count;
    meta.review_score = review_score;
    meta.review_count = review_count;
    meta.chapter_count = chapter_count;
    meta.cover_url = (!cover_url.is_empty()).then_some(cover_url);
    meta.author = (!author_name.is_empty()).then(|| AuthorMeta {
        id: author_id,
        name: author_name,
        local_name: None,
        avatar: None,
    });
    meta.genres = genres;
    meta.created_at = published_at.clone();
    meta.updated_at = modified_at;
    meta.published_at = published_at;
    meta.upstream_slug = Some(upstream_slug.to_string());
    meta
}

/// Parse a chapter page into `(title, body)`.
///
/// The `<h2>` heading is the canonical title; `div.box-chap` holds the
/// body. Inline `<h5>` headings duplicate the title and are removed
/// before text extraction, then a leading body line that repeats the
/// title is stripped.
pub fn parse_chapter(html: &str) -> Option<(String, String)> {
    let mut document = Html::parse_document(html);

    let title = document.get_text_of(&CHAPTER_TITLE_SELECTOR)?;

    let noise: Vec<_> = document
        .select(&CHAPTER_NOISE_SELECTOR)
        .map(|e| e.id())
        .collect();
    for id in noise {
        if let Some(mut node) = document.tree.get_mut(id) {
            node.detach();
        }
    }

    let mut paragraphs = Vec::new();
    for chap_box in document.select(&CHAPTER_BODY_SELECTOR) {
        let text = text_lines(&chap_box);
        if !text.is_empty() {
            paragraphs.push(text);
        }
    }
    if paragraphs.is_empty() {
        return None;
    }

    let body = paragraphs.join("\n\n");
    let body = strip_leading_title(&body, &title);
    if body.is_empty() {
        return None;
    }
    Some((title, body))
}

/// Descendant text joined with newlines, per-fragment trimmed, with
/// non-breaking spaces normalized. Paragraph structure survives as line
/// breaks.
fn text_lines(element: &ElementRef) -> String {
    element
        .text()
        .map(|t| t.replace('\u{a0}', " "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn normalize_colon(s: &str) -> String {
    regex!(r"\s*:\s*").replace_all(s.trim(), ": ").into_owned()
}

/// Strip a body-leading repetition of the chapter title.
///
/// Handles three shapes: the title as its own first line (exact or with
/// different colon spacing), and the title as a prefix of the first line
/// with real content after it.
pub fn strip_leading_title(body: &str, title: &str) -> String {
    let title_clean = title.trim();
    let title_norm = normalize_colon(title_clean);

    let mut lines: Vec<String> = body.split('\n').map(ToString::to_string).collect();
    let mut start = 0;
    while start < lines.len() && lines[start].trim().is_empty() {
        start += 1;
    }

    if start < lines.len() {
        let first_line = lines[start].trim().to_string();
        let first_norm = normalize_colon(&first_line);

        if first_line == title_clean || first_norm == title_norm {
            start += 1;
        } else if first_norm.starts_with(&title_norm) {
            let remainder = first_line
                .strip_prefix(title_clean)
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .or_else(|| {
                    // colon spacing differs between heading and body;
                    // match the title with flexible colon whitespace
                    let pattern = format!(
                        "^{}",
                        lazy_regex::regex::escape(&title_norm).replace(": ", r"\s*:\s*")
                    );
                    lazy_regex::Regex::new(&pattern).ok().and_then(|re| {
                        re.find(&first_line)
                            .map(|m| first_line[m.end()..].trim().to_string())
                            .filter(|r| !r.is_empty())
                    })
                });
            match remainder {
                Some(rest) => lines[start] = rest,
                None => start += 1,
            }
        }
    }

    lines[start..].join("\n").trim().to_string()
}

pub struct TtvSource {
    client: HttpClient,
    pool: rayon::ThreadPool,
    batch_size: usize,
}

impl TtvSource {
    pub fn new(config: &Config) -> eyre::Result<Self> {
        let mut settings = HttpSettings::new(BASE_URL, config.tuning.request_delay);
        settings.read_timeout = config.tuning.read_timeout;
        settings.headers = vec![
            ("user-agent", BROWSER_USER_AGENT.to_string()),
            (
                "accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string(),
            ),
            ("accept-language", "vi-VN,vi;q=0.9,en-US;q=0.8,en;q=0.7".to_string()),
        ];
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.tuning.max_concurrent.max(1))
            .thread_name(|i| format!("ttv-http-{i}"))
            .build()?;
        Ok(Self {
            client: HttpClient::new(settings),
            pool,
            batch_size: config.tuning.fetch_batch_size.max(1),
        })
    }

    fn fetch_single_chapter(&self, book_id: i64, slug: &str, index: u32) -> Option<ChapterData> {
        let url = format!("/doc-truyen/{slug}/chuong-{index}");
        let html = match self.client.get_text(&url) {
            Ok(html) => html,
            Err(e) => {
                warn!(book_id, index, error = %e, "chapter fetch failed");
                return None;
            }
        };
        let Some((title, body)) = parse_chapter(&html) else {
            warn!(book_id, index, "page has no chapter content");
            return None;
        };
        let word_count = count_words(&body);
        Some(ChapterData {
            index,
            title,
            slug: format!("chuong-{index}"),
            body,
            word_count,
            chapter_id: 0,
        })
    }
}

impl Source for TtvSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Ttv
    }

    fn fetch_book_metadata(&self, entry: &PlanEntry) -> Result<Option<BookMetadata>, SourceError> {
        let book_id = entry.id.ok_or(SourceError::BadPlanEntry("id"))?;
        let slug = entry
            .ttv_slug
            .as_deref()
            .or(entry.slug.as_deref())
            .ok_or(SourceError::BadPlanEntry("slug"))?;

        let html = match self.client.get_text(&format!("/doc-truyen/{slug}")) {
            Ok(html) => html,
            Err(e) if e.is_not_found() => {
                info!(slug, "404 on TTV");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let mut meta = parse_book_detail(&html, slug);
        meta.id = book_id;
        Ok(Some(meta))
    }

    fn fetch_chapters(
        self: Arc<Self>,
        meta: &BookMetadata,
        existing: &HashSet<u32>,
        _bundle_path: &Path,
    ) -> ChapterStream {
        let book_id = meta.id;
        let slug = meta
            .upstream_slug
            .clone()
            .unwrap_or_else(|| meta.slug.clone());
        let to_fetch: Vec<u32> = (1..=meta.chapter_count)
            .filter(|i| !existing.contains(i))
            .collect();

        ChapterStream::spawn(move |handle| {
            for batch in to_fetch.chunks(self.batch_size) {
                let results: Vec<Option<ChapterData>> = self.pool.install(|| {
                    batch
                        .par_iter()
                        .map(|&index| self.fetch_single_chapter(book_id, &slug, index))
                        .collect()
                });

                for result in results {
                    match result {
                        Some(chapter) => {
                            if !handle.yield_chapter(chapter) {
                                return;
                            }
                        }
                        None => handle.count_error(),
                    }
                }
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
            &self.client,
            book_id,
            meta.cover_url.as_deref().into_iter(),
            covers_dir,
            force,
        )
    }
}
