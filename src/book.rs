//! Domain records shared across the pipeline: plan entries, normalized
//! book metadata, chapter payloads, and the ID-namespace rules that keep
//! the three upstream sources from colliding in one database.

use clap::ValueEnum;
use derive_more::derive::Debug;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

/// Book IDs: API books own `[1, 1_000_000)`, TTV books start at 10M,
/// TF books at 30M.
pub const TTV_ID_OFFSET: i64 = 10_000_000;
pub const TF_ID_OFFSET: i64 = 30_000_000;

/// Author IDs: native API authors are < 1M, synthetic `999<creator_id>`
/// authors far above, TTV authors at 20M, TF authors at 40M.
pub const TTV_AUTHOR_ID_OFFSET: i64 = 20_000_000;
pub const TF_AUTHOR_ID_OFFSET: i64 = 40_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Api,
    Ttv,
    Tf,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Ttv => "ttv",
            Self::Tf => "tf",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a `books_plan_<source>.json` file. Unknown fields from
/// the plan generator are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlanEntry {
    pub id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub ttv_slug: Option<String>,
    #[serde(default)]
    pub tf_slug: Option<String>,
    #[serde(default)]
    pub chapter_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorMeta {
    pub id: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub local_name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenreMeta {
    #[serde(default)]
    pub id: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagMeta {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub type_id: Option<i64>,
}

/// Poster URLs by size, largest first in preference order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Poster {
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default, rename = "600")]
    pub size_600: Option<String>,
    #[serde(default, rename = "300")]
    pub size_300: Option<String>,
    #[serde(default, rename = "150")]
    pub size_150: Option<String>,
}

impl Poster {
    /// Candidate URLs in download-preference order.
    pub fn candidates(&self) -> impl Iterator<Item = &str> {
        [&self.default, &self.size_600, &self.size_300, &self.size_150]
            .into_iter()
            .filter_map(|u| u.as_deref())
    }
}

/// Normalized book metadata — the single shape every source produces and
/// the relational index consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookMetadata {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub synopsis: Option<String>,
    /// 1 = ongoing, 2 = completed, 3 = paused.
    pub status: i64,
    pub status_name: Option<String>,
    pub view_count: i64,
    pub comment_count: i64,
    pub bookmark_count: i64,
    pub vote_count: i64,
    pub review_score: f64,
    pub review_count: i64,
    /// Authoritative upstream chapter count.
    pub chapter_count: u32,
    pub word_count: i64,
    pub cover_url: Option<String>,
    pub author: Option<AuthorMeta>,
    pub genres: Vec<GenreMeta>,
    pub tags: Vec<TagMeta>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub published_at: Option<String>,
    pub new_chap_at: Option<String>,
    pub source: SourceKind,

    /// API walk anchors (linked-list traversal); absent for scrapers.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub first_chapter: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub latest_chapter: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub poster: Option<Poster>,

    /// Original upstream slug (may carry diacritics); `slug` above is the
    /// ASCII-clean one the database owns.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub upstream_slug: Option<String>,
}

impl BookMetadata {
    pub fn empty(id: i64, source: SourceKind) -> Self {
        Self {
            id,
            name: String::new(),
            slug: String::new(),
            synopsis: None,
            status: 1,
            status_name: None,
            view_count: 0,
            comment_count: 0,
            bookmark_count: 0,
            vote_count: 0,
            review_score: 0.0,
            review_count: 0,
            chapter_count: 0,
            word_count: 0,
            cover_url: None,
            author: None,
            genres: Vec::new(),
            tags: Vec::new(),
            created_at: None,
            updated_at: None,
            published_at: None,
            new_chap_at: None,
            source,
            first_chapter: None,
            latest_chapter: None,
            poster: None,
            upstream_slug: None,
        }
    }
}

/// A single fetched chapter, ready for compression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterData {
    /// 1-based position within the book.
    pub index: u32,
    pub title: String,
    pub slug: String,
    #[debug("{body:.60?}")]
    pub body: String,
    pub word_count: u32,
    /// Upstream identifier; 0 for sources without chapter IDs.
    pub chapter_id: u32,
}

/// MD5 over the deterministic JSON serialization of the metadata
/// (object keys sorted). Equality with the stored hash short-circuits
/// the book upsert.
pub fn meta_hash(meta: &BookMetadata) -> String {
    // serde_json's default map is a BTreeMap, so re-serializing through
    // Value sorts every object's keys.
    let value = serde_json::to_value(meta).unwrap_or(serde_json::Value::Null);
    let json = value.to_string();
    let digest = Md5::digest(json.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

const SLUG_FROM: &str =
    "àáảãạăắằẳẵặâấầẩẫậèéẻẽẹêếềểễệìíỉĩịòóỏõọôốồổỗộơớờởỡợùúủũụưứừửữựỳýỷỹỵđ";
const SLUG_TO: &str =
    "aaaaaaaaaaaaaaaaaeeeeeeeeeeeiiiiiooooooooooooooooouuuuuuuuuuuyyyyyd";

/// Vietnamese-aware ASCII slugification, matching the index owner's
/// convention: strip diacritics, keep `[a-z0-9]`, hyphenate runs of
/// whitespace and hyphens.
pub fn slugify(text: &str) -> String {
    let lowered = text.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut pending_hyphen = false;
    for c in lowered.chars() {
        let c = SLUG_FROM
            .chars()
            .position(|f| f == c)
            .and_then(|i| SLUG_TO.chars().nth(i))
            .unwrap_or(c);
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            out.push(c);
        } else if c.is_whitespace() || c == '-' {
            pending_hyphen = true;
        }
    }
    out
}

/// Author IDs arrive as integers or strings like `"c1000024"`.
pub fn parse_author_id(raw: &serde_json::Value) -> Option<i64> {
    match raw {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim_start_matches(['c', 'C']).parse().ok(),
        serde_json::Value::Null
        | serde_json::Value::Bool(_)
        | serde_json::Value::Array(_)
        | serde_json::Value::Object(_) => None,
    }
}

/// Placeholder names the API uses for books whose author is unset.
const PLACEHOLDER_AUTHOR_NAMES: &[&str] = &["đang cập nhật"];

pub fn author_needs_fix(author: Option<&AuthorMeta>) -> bool {
    match author {
        None => true,
        Some(a) => {
            let name = a.name.trim();
            name.is_empty() || PLACEHOLDER_AUTHOR_NAMES.contains(&name.to_lowercase().as_str())
        }
    }
}

/// Synthesize an author from the uploader (creator) when the real author
/// is a placeholder. The `999` prefix keeps the ID clear of real author
/// IDs. E.g. creator 1000043 → author 9991000043.
pub fn author_from_creator(creator_id: i64, creator_name: &str) -> Option<AuthorMeta> {
    if creator_id <= 0 {
        return None;
    }
    let id = format!("999{creator_id}").parse().ok()?;
    Some(AuthorMeta {
        id: Some(id),
        name: creator_name.to_string(),
        local_name: None,
        avatar: None,
    })
}

/// Map upstream status text to the numeric status code.
pub fn map_status(text: &str) -> i64 {
    let t = text.to_lowercase();
    if t.contains("hoàn thành") || t.contains("hoan thanh") || t.contains("full") {
        2
    } else if t.contains("tạm dừng") || t.contains("tam dung") {
        3
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_strips_vietnamese_diacritics() {
        assert_eq!(slugify("Mục Thần Ký"), "muc-than-ky");
        assert_eq!(slugify("Đế Bá"), "de-ba");
        assert_eq!(slugify("ửng đỏ"), "ung-do");
    }

    #[test]
    fn slugify_collapses_separators_and_symbols() {
        assert_eq!(slugify("  Thần   Đạo -- Đan Tôn!  "), "than-dao-dan-ton");
        assert_eq!(slugify("abc123"), "abc123");
        assert_eq!(slugify("!!!"), "");
    }

    #[test]
    fn parse_author_id_accepts_both_shapes() {
        assert_eq!(parse_author_id(&serde_json::json!(42)), Some(42));
        assert_eq!(
            parse_author_id(&serde_json::json!("c1000024")),
            Some(1000024)
        );
        assert_eq!(parse_author_id(&serde_json::json!("C77")), Some(77));
        assert_eq!(parse_author_id(&serde_json::json!("bogus")), None);
        assert_eq!(parse_author_id(&serde_json::Value::Null), None);
    }

    #[test]
    fn synthetic_author_gets_999_prefix() {
        let author = author_from_creator(1000043, "Uploader").unwrap();
        assert_eq!(author.id, Some(9991000043));
        assert_eq!(author.name, "Uploader");
        assert!(author_from_creator(0, "x").is_none());
    }

    #[test]
    fn placeholder_authors_need_fixing() {
        assert!(author_needs_fix(None));
        let placeholder = AuthorMeta {
            id: Some(1),
            name: "Đang Cập Nhật".to_string(),
            local_name: None,
            avatar: None,
        };
        assert!(author_needs_fix(Some(&placeholder)));
        let real = AuthorMeta {
            id: Some(1),
            name: "Trạch Trư".to_string(),
            local_name: None,
            avatar: None,
        };
        assert!(!author_needs_fix(Some(&real)));
    }

    #[test]
    fn status_mapping() {
        assert_eq!(map_status("Đang ra"), 1);
        assert_eq!(map_status("Đã hoàn thành"), 2);
        assert_eq!(map_status("Full"), 2);
        assert_eq!(map_status("Tạm dừng"), 3);
        assert_eq!(map_status(""), 1);
    }

    #[test]
    fn meta_hash_is_stable_and_sensitive() {
        let mut meta = BookMetadata::empty(100358, SourceKind::Api);
        meta.name = "Mục Thần Ký".to_string();
        meta.slug = slugify(&meta.name);

        let h1 = meta_hash(&meta);
        let h2 = meta_hash(&meta.clone());
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 32);

        meta.chapter_count = 2501;
        assert_ne!(meta_hash(&meta), h1);
    }

    #[test]
    fn plan_entry_tolerates_unknown_fields() {
        let entry: PlanEntry = serde_json::from_str(
            r#"{"id": 100358, "slug": "muc-than-ky", "hot_rank": 3, "extra": null}"#,
        )
        .unwrap();
        assert_eq!(entry.id, Some(100358));
        assert_eq!(entry.slug.as_deref(), Some("muc-than-ky"));
    }
}
