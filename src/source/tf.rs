//! TF source — server-rendered HTML, no authentication.
//!
//! Like TTV the chapter URLs are deterministic, but this upstream is the
//! most throttle-happy of the three: requests are jittered, batches back
//! off progressively when more than half of a batch fails, and a 200
//! whose page has no chapter container is treated as a soft throttle and
//! retried.
//!
//! Book IDs live in the 30M namespace; author IDs are derived from a
//! digest of the author name in the 40M namespace (the site exposes no
//! numeric author IDs).

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use lazy_regex::regex;
use md5::{Digest, Md5};
use rand::Rng;
use rayon::prelude::*;
use scraper::{ElementRef, Html};
use tracing::{info, warn};

use super::{ChapterStream, Source, SourceError};
use crate::book::{
    slugify, AuthorMeta, BookMetadata, ChapterData, GenreMeta, PlanEntry, SourceKind,
    TF_AUTHOR_ID_OFFSET,
};
use crate::config::Config;
use crate::decrypt::count_words;
use crate::lazy_selectors;
use crate::parsing_utils::{collect_text, QuickSelect};
use crate::request::{HttpClient, HttpSettings};

const BASE_URL: &str = "https://truyenfull.vision";

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Soft-throttle retries: a 200 without the chapter container.
const PARSE_RETRIES: u32 = 3;

/// Inter-batch backoff: grows by 5 s when over half a batch fails,
/// capped at 30 s, and decays by 2 s after a clean batch.
const BACKOFF_STEP: Duration = Duration::from_secs(5);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const BACKOFF_DECAY: Duration = Duration::from_secs(2);

/// Chapters listed per pagination page on the detail view.
const CHAPTERS_PER_PAGE: usize = 50;

lazy_selectors! {
    LISTING_ROW_SELECTOR: "div.list-truyen .row[itemscope]";
    LISTING_TITLE_SELECTOR: "h3.truyen-title a";
    LISTING_AUTHOR_SELECTOR: "span.author";
    LISTING_COUNT_SELECTOR: ".col-xs-2.text-info";
    LISTING_COVER_SELECTOR: ".lazyimg";
    PAGINATION_SELECTOR: "ul.pagination li a";

    DETAIL_TITLE_SELECTOR: "h1";
    DETAIL_AUTHOR_SELECTOR: ".info span[itemprop=\"author\"]";
    DETAIL_AUTHOR_FALLBACK_SELECTOR: "span[itemprop=\"author\"]";
    DETAIL_INFO_SELECTOR: ".info";
    DETAIL_INFO_FALLBACK_SELECTOR: ".col-info-desc";
    DETAIL_GENRE_SELECTOR: "a[itemprop=\"genre\"]";
    DETAIL_INFO_DIV_SELECTOR: ".info div";
    DETAIL_SYNOPSIS_SELECTOR: "div.desc-text";
    DETAIL_COVER_SELECTOR: ".book img, .books img, img[itemprop=\"image\"]";
    DETAIL_RATING_VALUE_SELECTOR: "span[itemprop=\"ratingValue\"]";
    DETAIL_RATING_COUNT_SELECTOR: "span[itemprop=\"ratingCount\"]";
    DETAIL_CHAPTER_LINK_SELECTOR: "ul.list-chapter li a";
    DETAIL_CHAPTER_PAGINATION_SELECTOR: "#list-chapter ul.pagination li a";

    CHAPTER_TITLE_SELECTOR: "h2";
    CHAPTER_BODY_SELECTOR: "#chapter-c";
    CHAPTER_BODY_FALLBACK_SELECTOR: ".chapter-c";
    CHAPTER_NOISE_SELECTOR: ".ads-holder, .ads-responsive, script, ins";
}

/// One book stub from a `/danh-sach/truyen-hot/trang-N/` listing page.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingEntry {
    pub name: String,
    pub slug: String,
    /// URL slug, e.g. `than-dao-dan-ton-6060282`.
    pub upstream_slug: String,
    pub author_name: String,
    /// Exact count from the listing's "Chương N" text — authoritative
    /// over the detail page's rounded-up estimate.
    pub chapter_count: u32,
    pub cover_url: String,
    /// Position on the hot listing, 1-based within the page.
    pub hot_rank: u32,
}

fn parse_int(text: &str) -> i64 {
    let digits: String = text.chars().filter(char::is_ascii_digit).collect();
    digits.parse().unwrap_or(0)
}

/// Deterministic author ID from the author name, shifted into the TF
/// namespace. (The site has no author IDs; a name digest keeps reruns
/// stable.)
pub fn author_id_from_name(name: &str) -> i64 {
    let digest = Md5::digest(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    TF_AUTHOR_ID_OFFSET + (u64::from_le_bytes(bytes) % 10_000_000) as i64
}

/// Parse a hot-books listing page into book stubs.
pub fn parse_listing_page(html: &str) -> Vec<ListingEntry> {
    let document = Html::parse_document(html);
    document
        .select(&LISTING_ROW_SELECTOR)
        .filter_map(|row| parse_listing_item(&row))
        .enumerate()
        .map(|(i, mut entry)| {
            entry.hot_rank = i as u32 + 1;
            entry
        })
        .collect()
}

/// Last page number from `trang-N` pagination links.
pub fn parse_listing_last_page(html: &str) -> u32 {
    let document = Html::parse_document(html);
    document
        .select(&PAGINATION_SELECTOR)
        .filter_map(|a| a.attr("href"))
        .filter_map(|href| regex!(r"trang-(\d+)").captures(href))
        .filter_map(|c| c[1].parse().ok())
        .max()
        .unwrap_or(1)
}

fn parse_listing_item(row: &ElementRef) -> Option<ListingEntry> {
    let title_a = row.select(&LISTING_TITLE_SELECTOR).next()?;
    let name = collect_text(&title_a);
    let href = title_a.attr("href").unwrap_or("");
    let upstream_slug = href.trim_end_matches('/').rsplit('/').next()?.to_string();
    if upstream_slug.is_empty() {
        return None;
    }

    let author_name = row
        .select(&LISTING_AUTHOR_SELECTOR)
        .next()
        .map(|s| collect_text(&s))
        .unwrap_or_default();

    let chapter_count = row
        .select(&LISTING_COUNT_SELECTOR)
        .next()
        .map(|e| parse_int(&collect_text(&e)) as u32)
        .unwrap_or(0);

    let cover_url = row
        .select(&LISTING_COVER_SELECTOR)
        .next()
        .and_then(|div| div.attr("data-image").or_else(|| div.attr("data-desk-image")))
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
        chapter_count,
        cover_url,
        hot_rank: 0,
    })
}

/// Parse a book detail page into normalized metadata (ID left at 0).
///
/// The chapter count here is an estimate from the chapter-list
/// pagination (`(pages − 1) × 50 + first-page links`) — the caller
/// prefers an exact listing-page count when the plan carries one.
pub fn parse_book_detail(html: &str, upstream_slug: &str) -> BookMetadata {
    let document = Html::parse_document(html);

    let name = document
        .get_text_of(&DETAIL_TITLE_SELECTOR)
        .unwrap_or_else(|| upstream_slug.to_string());

    let author_name = document
        .get_text_of(&DETAIL_AUTHOR_SELECTOR)
        .or_else(|| document.get_text_of(&DETAIL_AUTHOR_FALLBACK_SELECTOR))
        .unwrap_or_default();

    let info_section = document
        .select(&DETAIL_INFO_SELECTOR)
        .next()
        .or_else(|| document.select(&DETAIL_INFO_FALLBACK_SELECTOR).next());

    let mut genres: Vec<GenreMeta> = Vec::new();
    if let Some(info) = info_section {
        let mut seen: HashSet<String> = HashSet::new();
        for a in info.select(&DETAIL_GENRE_SELECTOR) {
            let genre_name = collect_text(&a);
            if !genre_name.is_empty() && seen.insert(genre_name.clone()) {
                genres.push(GenreMeta {
                    id: None,
                    slug: Some(slugify(&genre_name)),
                    name: genre_name,
                });
            }
        }
    }

    // Only "full" books are planned from this source, so completed is
    // the default until the status row says otherwise.
    let mut status = 2;
    let mut status_name = "Full".to_string();
    for div in document.select(&DETAIL_INFO_DIV_SELECTOR) {
        let text = collect_text(&div);
        if text.contains("Trạng thái") {
            if text.contains("Đang ra") {
                status = 1;
                status_name = "Đang ra".to_string();
            }
            break;
        }
    }

    let synopsis = document
        .select(&DETAIL_SYNOPSIS_SELECTOR)
        .next()
        .map(|e| text_lines(&e));

    let cover_url = document
        .get_attr_of(&DETAIL_COVER_SELECTOR, "src")
        .unwrap_or_default();

    let review_score = document
        .get_text_of(&DETAIL_RATING_VALUE_SELECTOR)
        .and_then(|t| t.trim().parse().ok())
        .unwrap_or(0.0);
    let review_count = document
        .get_text_of(&DETAIL_RATING_COUNT_SELECTOR)
        .map_or(0, |t| parse_int(&t));

    let first_page_links = document.select(&DETAIL_CHAPTER_LINK_SELECTOR).count();
    let last_chapter_page = document
        .select(&DETAIL_CHAPTER_PAGINATION_SELECTOR)
        .filter_map(|a| a.attr("href"))
        .filter_map(|href| regex!(r"trang-(\d+)").captures(href))
        .filter_map(|c| c[1].parse::<usize>().ok())
        .max()
        .unwrap_or(1);
    let chapter_count = if last_chapter_page > 1 {
        (last_chapter_page - 1) * CHAPTERS_PER_PAGE + first_page_links
    } else {
        first_page_links
    } as u32;

    let slug = {
        let ascii = slugify(&name);
        if ascii.is_empty() {
            upstream_slug.to_string()
        } else {
            ascii
        }
    };

    let mut meta = BookMetadata::empty(0, SourceKind::Tf);
    meta.name = name;
    meta.slug = slug;
    meta.synopsis = synopsis.filter(|s| !s.is_empty());
    meta.status = status;
    meta.status_name = Some(status_name);
    meta.review_score = review_score;
    meta.review_count = review_count;
    meta.chapter_count = chapter_count;
    meta.cover_url = (!cover_url.is_empty()).then_some(cover_url);
    meta.author = (!author_name.is_empty()).then(|| AuthorMeta {
        id: Some(author_id_from_name(&author_name)),
        name: author_name,
        local_name: None,
        avatar: None,
    });
    meta.genres = genres;
    meta.upstream_slug = Some(upstream_slug.to_string());
    meta
}

/// Parse a chapter page into `(title, body)`.
///
/// `<h2>` is the title; `#chapter-c` the body. Ad containers and inline
/// scripts are dropped before text extraction. No title dedup is needed
/// on this site — the body never repeats the heading.
pub fn parse_chapter(html: &str) -> Option<(String, String)> {
    let mut document = Html::parse_document(html);

    let title = document.get_text_of(&CHAPTER_TITLE_SELECTOR)?;

    let container = document
        .select(&CHAPTER_BODY_SELECTOR)
        .next()
        .or_else(|| document.select(&CHAPTER_BODY_FALLBACK_SELECTOR).next())?
        .id();

    let noise: Vec<_> = document
        .select(&CHAPTER_NOISE_SELECTOR)
        .map(|e| e.id())
        .collect();
    for id in noise {
        if let Some(mut node) = document.tree.get_mut(id) {
            node.detach();
        }
    }

    let container = ElementRef::wrap(document.tree.get(container)?)?;
    let body = text_lines(&container);
    if body.is_empty() {
        return None;
    }
    Some((title, body))
}

fn text_lines(element: &ElementRef) -> String {
    element
        .text()
        .map(|t| t.replace('\u{a0}', " "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct TfSource {
    client: HttpClient,
    pool: rayon::ThreadPool,
    batch_size: usize,
}

impl TfSource {
    pub fn new(config: &Config) -> eyre::Result<Self> {
        let mut settings = HttpSettings::new(BASE_URL, config.tuning.request_delay);
        settings.jittered = true;
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
            .thread_name(|i| format!("tf-http-{i}"))
            .build()?;
        Ok(Self {
            client: HttpClient::new(settings),
            pool,
            batch_size: config.tuning.fetch_batch_size.max(1),
        })
    }

    /// Fetch one chapter, retrying when a 200 page has no chapter
    /// container (ad interstitial / CAPTCHA / throttle page).
    fn fetch_single_chapter(&self, book_id: i64, slug: &str, index: u32) -> Option<ChapterData> {
        let url = format!("/{slug}/chuong-{index}/");

        for attempt in 0..PARSE_RETRIES {
            let html = match self.client.get_text(&url) {
                Ok(html) => html,
                Err(e) if e.is_not_found() => return None,
                Err(e) => {
                    warn!(book_id, index, error = %e, "chapter fetch failed");
                    return None;
                }
            };

            if let Some((title, body)) = parse_chapter(&html) {
                let word_count = count_words(&body);
                return Some(ChapterData {
                    index,
                    title,
                    slug: format!("chuong-{index}"),
                    body,
                    word_count,
                    chapter_id: 0,
                });
            }

            if attempt + 1 < PARSE_RETRIES {
                let wait = Duration::from_secs_f64(rand::rng().random_range(3.0..10.0));
                thread::sleep(wait);
            }
        }
        warn!(book_id, index, "no chapter content after soft-throttle retries");
        None
    }
}

impl Source for TfSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Tf
    }

    fn fetch_book_metadata(&self, entry: &PlanEntry) -> Result<Option<BookMetadata>, SourceError> {
        let book_id = entry.id.ok_or(SourceError::BadPlanEntry("id"))?;
        let slug = entry
            .tf_slug
            .as_deref()
            .or(entry.slug.as_deref())
            .ok_or(SourceError::BadPlanEntry("slug"))?;

        let html = match self.client.get_text(&format!("/{slug}/")) {
            Ok(html) => html,
            Err(e) if e.is_not_found() => {
                info!(slug, "404 on TF");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let mut meta = parse_book_detail(&html, slug);
        meta.id = book_id;

        // The listing page's "Chương N" is exact; the detail page rounds
        // up to a full pagination page.
        if let Some(plan_count) = entry.chapter_count.filter(|c| *c > 0) {
            meta.chapter_count = plan_count;
        }
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
            let mut batch_delay = Duration::ZERO;
            let total_batches = to_fetch.len().div_ceil(self.batch_size);

            for (batch_no, batch) in to_fetch.chunks(self.batch_size).enumerate() {
                if !batch_delay.is_zero() {
                    thread::sleep(batch_delay);
                }

                let results: Vec<Option<ChapterData>> = self.pool.install(|| {
                    batch
                        .par_iter()
                        .map(|&index| self.fetch_single_chapter(book_id, &slug, index))
                        .collect()
                });

                let failures = results.iter().filter(|r| r.is_none()).count();
                if failures > batch.len() / 2 {
                    batch_delay = (batch_delay + BACKOFF_STEP).min(BACKOFF_CAP);
                    info!(
                        book_id,
                        batch = batch_no + 1,
                        total_batches,
                        failures,
                        backoff = ?batch_delay,
                        "over half the batch failed, backing off"
                    );
                } else if failures == 0 && !batch_delay.is_zero() {
                    batch_delay = batch_delay.saturating_sub(BACKOFF_DECAY);
                }

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

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING_FIXTURE: &str = r#"
    <div class="list-truyen">
      <div class="row" itemscope>
        <div class="lazyimg" data-image="https://cdn.tf/covers/tddt.jpg"></div>
        <h3 class="truyen-title"><a href="https://truyenfull.vision/than-dao-dan-ton-6060282/">Thần Đạo Đan Tôn</a></h3>
        <span class="author">Cô Đơn Địa Phi</span>
        <div class="col-xs-2 text-info"><span>Chương</span><span>5357</span></div>
      </div>
      <div class="row" itemscope>
        <div class="lazyimg" data-desk-image="https://cdn.tf/covers/x.jpg"></div>
        <h3 class="truyen-title"><a href="https://truyenfull.vision/vu-than-chua-te-123/">Vũ Thần Chúa Tể</a></h3>
        <span class="author">Ám Ma Sư</span>
        <div class="col-xs-2 text-info">Chương2489</div>
      </div>
    </div>
    <ul class="pagination">
      <li><a href="/danh-sach/truyen-hot/trang-2/">2</a></li>
      <li><a href="/danh-sach/truyen-hot/trang-25/">25</a></li>
    </ul>
    "#;

    #[test]
    fn listing_page_parses_stubs_with_rank() {
        let entries = parse_listing_page(LISTING_FIXTURE);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "Thần Đạo Đan Tôn");
        assert_eq!(entries[0].upstream_slug, "than-dao-dan-ton-6060282");
        assert_eq!(entries[0].slug, "than-dao-dan-ton");
        assert_eq!(entries[0].chapter_count, 5357);
        assert_eq!(entries[0].cover_url, "https://cdn.tf/covers/tddt.jpg");
        assert_eq!(entries[0].hot_rank, 1);
        assert_eq!(entries[1].chapter_count, 2489);
        assert_eq!(entries[1].hot_rank, 2);
    }

    #[test]
    fn listing_last_page() {
        assert_eq!(parse_listing_last_page(LISTING_FIXTURE), 25);
    }

    const DETAIL_FIXTURE: &str = r#"
    <h1>Thần Đạo Đan Tôn</h1>
    <div class="col-info-desc">
      <div class="info">
        <div><span>Tác giả:</span><span itemprop="author">Cô Đơn Địa Phi</span></div>
        <div><span>Thể loại:</span>
          <a itemprop="genre" href="/the-loai/tien-hiep/">Tiên Hiệp</a>
          <a itemprop="genre" href="/the-loai/huyen-huyen/">Huyền Huyễn</a>
          <a itemprop="genre" href="/the-loai/tien-hiep/">Tiên Hiệp</a>
        </div>
        <div><span>Trạng thái:</span><span class="text-success">Full</span></div>
      </div>
    </div>
    <div class="desc-text">Luyện đan sư mạnh nhất.<br/>Trở về đô thị.</div>
    <span itemprop="ratingValue">4.5</span><span itemprop="ratingCount">1.234</span>
    <div class="book"><img src="https://cdn.tf/covers/tddt.jpg"/></div>
    <div id="list-chapter">
      <ul class="list-chapter"><li><a href="/x/chuong-1/">Chương 1</a></li><li><a href="/x/chuong-2/">Chương 2</a></li></ul>
      <ul class="pagination"><li><a href="/than-dao-dan-ton-6060282/trang-50/">50</a></li></ul>
    </div>
    "#;

    #[test]
    fn detail_page_parses_metadata() {
        let meta = parse_book_detail(DETAIL_FIXTURE, "than-dao-dan-ton-6060282");
        assert_eq!(meta.name, "Thần Đạo Đan Tôn");
        assert_eq!(meta.slug, "than-dao-dan-ton");
        assert_eq!(meta.status, 2);
        assert_eq!(meta.status_name.as_deref(), Some("Full"));
        assert!((meta.review_score - 4.5).abs() < 1e-9);
        assert_eq!(meta.review_count, 1234);
        // estimate: (50 - 1) * 50 + 2 links on the first page
        assert_eq!(meta.chapter_count, 2452);
        assert_eq!(meta.genres.len(), 2); // deduplicated
        let author = meta.author.unwrap();
        assert_eq!(author.name, "Cô Đơn Địa Phi");
        let id = author.id.unwrap();
        assert!(id >= TF_AUTHOR_ID_OFFSET && id < TF_AUTHOR_ID_OFFSET + 10_000_000);
        assert_eq!(
            meta.upstream_slug.as_deref(),
            Some("than-dao-dan-ton-6060282")
        );
    }

    #[test]
    fn author_ids_are_stable_and_namespaced() {
        let a = author_id_from_name("Cô Đơn Địa Phi");
        let b = author_id_from_name("Cô Đơn Địa Phi");
        let c = author_id_from_name("Ám Ma Sư");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a >= TF_AUTHOR_ID_OFFSET);
    }

    #[test]
    fn chapter_parses_and_drops_ads() {
        let html = r#"
        <h2>Chương 1: Sống lại</h2>
        <div id="chapter-c">
          Dòng một.
          <div class="ads-holder">QUẢNG CÁO</div>
          <br/>Dòng hai.
          <script>evil()</script>
        </div>
        "#;
        let (title, body) = parse_chapter(html).unwrap();
        assert_eq!(title, "Chương 1: Sống lại");
        assert_eq!(body, "Dòng một.\nDòng hai.");
    }

    #[test]
    fn chapter_fallback_container() {
        let html = r#"<h2>Chương 2</h2><div class="chapter-c">Nội dung.</div>"#;
        let (_, body) = parse_chapter(html).unwrap();
        assert_eq!(body, "Nội dung.");
    }

    #[test]
    fn throttle_page_parses_as_none() {
        assert!(parse_chapter("<h2>Đợi chút</h2><div>no container</div>").is_none());
        assert!(parse_chapter("<div id=\"chapter-c\">x</div>").is_none());
    }
}
