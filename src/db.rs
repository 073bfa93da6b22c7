//! SQLite index sync. The schema is owned by the consuming web
//! application; this module only writes the tables it is contracted to
//! (`books`, `authors`, `genres`, `tags`, the junctions, `chapters`) and
//! creates them when they are absent so a fresh data dir works.
//!
//! Book upserts use `ON CONFLICT(id) DO UPDATE` — `INSERT OR REPLACE`
//! would delete-and-reinsert the row and cascade away its chapters.
//! Chapter rows are `INSERT OR IGNORE`: the bundle owns chapter content,
//! the database merely indexes it.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use eyre::{eyre, Result, WrapErr};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};

use crate::book::{BookMetadata, GenreMeta};
use crate::bundle::{read_bundle_indices, read_bundle_meta, read_bundle_raw};
use crate::compress::ChapterCompressor;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS authors (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    local_name TEXT,
    avatar TEXT
);
CREATE TABLE IF NOT EXISTS genres (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    slug TEXT UNIQUE
);
CREATE TABLE IF NOT EXISTS tags (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    type_id INTEGER
);
CREATE TABLE IF NOT EXISTS books (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    slug TEXT UNIQUE,
    synopsis TEXT,
    status INTEGER NOT NULL DEFAULT 1,
    status_name TEXT,
    view_count INTEGER NOT NULL DEFAULT 0,
    comment_count INTEGER NOT NULL DEFAULT 0,
    bookmark_count INTEGER NOT NULL DEFAULT 0,
    vote_count INTEGER NOT NULL DEFAULT 0,
    review_score REAL NOT NULL DEFAULT 0,
    review_count INTEGER NOT NULL DEFAULT 0,
    chapter_count INTEGER NOT NULL DEFAULT 0,
    word_count INTEGER NOT NULL DEFAULT 0,
    cover_url TEXT,
    author_id INTEGER REFERENCES authors(id),
    created_at TEXT,
    updated_at TEXT,
    published_at TEXT,
    new_chap_at TEXT,
    chapters_saved INTEGER NOT NULL DEFAULT 0,
    meta_hash TEXT,
    source TEXT
);
CREATE TABLE IF NOT EXISTS chapters (
    book_id INTEGER NOT NULL REFERENCES books(id) ON DELETE CASCADE,
    index_num INTEGER NOT NULL,
    title TEXT,
    slug TEXT,
    word_count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (book_id, index_num)
);
CREATE TABLE IF NOT EXISTS book_genres (
    book_id INTEGER NOT NULL REFERENCES books(id) ON DELETE CASCADE,
    genre_id INTEGER NOT NULL REFERENCES genres(id),
    PRIMARY KEY (book_id, genre_id)
);
CREATE TABLE IF NOT EXISTS book_tags (
    book_id INTEGER NOT NULL REFERENCES books(id) ON DELETE CASCADE,
    tag_id INTEGER NOT NULL REFERENCES tags(id),
    PRIMARY KEY (book_id, tag_id)
);
";

/// Handle to the shared index database. Workers funnel their short
/// transactions through one connection.
pub struct Database {
    conn: Mutex<Connection>,
}

/// Book metadata joined for the EPUB builder.
#[derive(Debug, Clone, Default)]
pub struct EpubBookInfo {
    pub name: String,
    pub author_name: Option<String>,
    pub genres: Vec<String>,
}

/// What the sync sweep did.
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepReport {
    pub bundles: usize,
    pub inserted_rows: usize,
    pub repaired_titles: usize,
}

impl Database {
    /// Open with WAL journaling and foreign keys on, creating the
    /// contracted tables when absent.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .wrap_err_with(|| format!("cannot open database {}", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        let _: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| eyre!("database lock poisoned"))
    }

    /// Chapter indices the database already knows for a book.
    pub fn chapter_indices(&self, book_id: i64) -> Result<HashSet<u32>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare_cached("SELECT index_num FROM chapters WHERE book_id = ?1")?;
        let rows = stmt.query_map([book_id], |row| row.get::<_, u32>(0))?;
        Ok(rows.filter_map(std::result::Result::ok).collect())
    }

    pub fn chapter_row_count(&self, book_id: i64) -> Result<u32> {
        let conn = self.lock()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM chapters WHERE book_id = ?1",
            [book_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn book_exists(&self, book_id: i64) -> Result<bool> {
        let conn = self.lock()?;
        let row: Option<i64> = conn
            .query_row("SELECT id FROM books WHERE id = ?1", [book_id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(row.is_some())
    }

    pub fn book_meta_hash(&self, book_id: i64) -> Result<Option<String>> {
        let conn = self.lock()?;
        let hash = conn
            .query_row(
                "SELECT meta_hash FROM books WHERE id = ?1",
                [book_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hash.flatten())
    }

    /// Upsert the book row and its reference entities in one
    /// transaction. The incoming book wins slug conflicts: a different
    /// book holding the target slug is evicted with all its rows.
    pub fn upsert_book_metadata(
        &self,
        meta: &BookMetadata,
        cover_url: Option<&str>,
        chapters_saved: u32,
        meta_hash: &str,
    ) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let author_id = meta.author.as_ref().and_then(|a| a.id);
        if let Some(author) = meta.author.as_ref().filter(|a| a.id.is_some()) {
            tx.execute(
                "INSERT OR REPLACE INTO authors (id, name, local_name, avatar)
                 VALUES (?1, ?2, ?3, ?4)",
                params![author.id, author.name, author.local_name, author.avatar],
            )?;
        }

        let mut genre_ids = Vec::with_capacity(meta.genres.len());
        for genre in &meta.genres {
            genre_ids.push(resolve_genre_id(&tx, genre)?);
        }

        for tag in &meta.tags {
            tx.execute(
                "INSERT OR REPLACE INTO tags (id, name, type_id) VALUES (?1, ?2, ?3)",
                params![tag.id, tag.name, tag.type_id],
            )?;
        }

        // Slug uniqueness: evict whichever other book owns the slug.
        let conflict: Option<i64> = tx
            .query_row(
                "SELECT id FROM books WHERE slug = ?1 AND id != ?2",
                params![meta.slug, meta.id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(loser) = conflict {
            warn!(slug = %meta.slug, loser, winner = meta.id, "slug conflict, evicting");
            tx.execute("DELETE FROM chapters WHERE book_id = ?1", [loser])?;
            tx.execute("DELETE FROM book_genres WHERE book_id = ?1", [loser])?;
            tx.execute("DELETE FROM book_tags WHERE book_id = ?1", [loser])?;
            tx.execute("DELETE FROM books WHERE id = ?1", [loser])?;
        }

        tx.execute(
            "INSERT INTO books (
                id, name, slug, synopsis, status, status_name,
                view_count, comment_count, bookmark_count, vote_count,
                review_score, review_count, chapter_count, word_count,
                cover_url, author_id, created_at, updated_at,
                published_at, new_chap_at, chapters_saved, meta_hash, source
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                      ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)
            ON CONFLICT(id) DO UPDATE SET
                name=excluded.name, slug=excluded.slug, synopsis=excluded.synopsis,
                status=excluded.status, status_name=excluded.status_name,
                view_count=excluded.view_count, comment_count=excluded.comment_count,
                bookmark_count=excluded.bookmark_count, vote_count=excluded.vote_count,
                review_score=excluded.review_score, review_count=excluded.review_count,
                chapter_count=excluded.chapter_count, word_count=excluded.word_count,
                cover_url=excluded.cover_url, author_id=excluded.author_id,
                created_at=excluded.created_at, updated_at=excluded.updated_at,
                published_at=excluded.published_at, new_chap_at=excluded.new_chap_at,
                chapters_saved=excluded.chapters_saved, meta_hash=excluded.meta_hash,
                source=excluded.source",
            params![
                meta.id,
                meta.name,
                meta.slug,
                meta.synopsis,
                meta.status,
                meta.status_name,
                meta.view_count,
                meta.comment_count,
                meta.bookmark_count,
                meta.vote_count,
                meta.review_score,
                meta.review_count,
                meta.chapter_count,
                meta.word_count,
                cover_url,
                author_id,
                meta.created_at,
                meta.updated_at,
                meta.published_at,
                meta.new_chap_at,
                chapters_saved,
                meta_hash,
                meta.source.as_str(),
            ],
        )?;

        for genre_id in genre_ids {
            tx.execute(
                "INSERT OR IGNORE INTO book_genres (book_id, genre_id) VALUES (?1, ?2)",
                params![meta.id, genre_id],
            )?;
        }
        for tag in &meta.tags {
            tx.execute(
                "INSERT OR IGNORE INTO book_tags (book_id, tag_id) VALUES (?1, ?2)",
                params![meta.id, tag.id],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Index chapter rows. `INSERT OR IGNORE` keyed on
    /// `(book_id, index_num)` — re-ingestion never rewrites a row, the
    /// bundle stays authoritative for content.
    pub fn insert_chapters(
        &self,
        book_id: i64,
        chapters: &[(u32, String, String, u32)],
    ) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO chapters (book_id, index_num, title, slug, word_count)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (index, title, slug, word_count) in chapters {
                inserted += stmt.execute(params![book_id, index, title, slug, word_count])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn update_cover_url(&self, book_id: i64, cover_url: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE books SET cover_url = ?1 WHERE id = ?2",
            params![cover_url, book_id],
        )?;
        Ok(())
    }

    pub fn update_chapters_saved(&self, book_id: i64, count: u32) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE books SET chapters_saved = ?1 WHERE id = ?2",
            params![count, book_id],
        )?;
        Ok(())
    }

    /// Metadata the EPUB builder needs, or `None` when the book is not
    /// indexed (the builder falls back to minimal defaults).
    pub fn epub_book_info(&self, book_id: i64) -> Result<Option<EpubBookInfo>> {
        let conn = self.lock()?;
        let base = conn
            .query_row(
                "SELECT b.name, a.name FROM books b
                 LEFT JOIN authors a ON a.id = b.author_id
                 WHERE b.id = ?1",
                [book_id],
                |row| {
                    Ok(EpubBookInfo {
                        name: row.get(0)?,
                        author_name: row.get(1)?,
                        genres: Vec::new(),
                    })
                },
            )
            .optional()?;
        let Some(mut info) = base else {
            return Ok(None);
        };

        let mut stmt = conn.prepare_cached(
            "SELECT g.name FROM genres g
             INNER JOIN book_genres bg ON bg.genre_id = g.id
             WHERE bg.book_id = ?1 ORDER BY g.name",
        )?;
        let rows = stmt.query_map([book_id], |row| row.get::<_, String>(0))?;
        info.genres = rows.filter_map(std::result::Result::ok).collect();
        Ok(Some(info))
    }

    /// Reconcile every bundle on disk against the chapter rows: fill
    /// missing rows from v2 inline metadata (fast path) or from the
    /// decompressed body's first line (slow path), and give title-less
    /// rows the same treatment.
    pub fn sweep_bundles(
        &self,
        compressed_dir: &Path,
        compressor: &ChapterCompressor,
    ) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let entries = match std::fs::read_dir(compressed_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(report),
        };

        for entry in entries.filter_map(std::result::Result::ok) {
            let path = entry.path();
            let Some(book_id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<i64>().ok())
            else {
                continue;
            };
            if path.extension().and_then(|e| e.to_str()) != Some("bundle") {
                continue;
            }
            report.bundles += 1;

            // chapters carry a foreign key; a bundle whose book was never
            // indexed has nothing to reconcile against
            if !self.book_exists(book_id)? {
                continue;
            }

            let bundle_indices = read_bundle_indices(&path);
            if bundle_indices.is_empty() {
                continue;
            }
            let db_indices = self.chapter_indices(book_id)?;
            let missing: Vec<u32> = {
                let mut m: Vec<u32> =
                    bundle_indices.difference(&db_indices).copied().collect();
                m.sort_unstable();
                m
            };
            if missing.is_empty() {
                continue;
            }

            let inline_meta = read_bundle_meta(&path);
            let mut raw = None; // lazily loaded for the slow path
            let mut rows = Vec::with_capacity(missing.len());
            for index in missing {
                let meta = inline_meta.get(&index);
                let (title, slug, word_count) = match meta.filter(|m| !m.title.is_empty()) {
                    Some(m) => (m.title.clone(), m.slug.clone(), m.word_count),
                    None => {
                        let bodies =
                            raw.get_or_insert_with(|| read_bundle_raw(&path));
                        let Some((compressed, raw_len)) = bodies.get(&index) else {
                            continue;
                        };
                        let Ok(body) = compressor.decompress(compressed, *raw_len) else {
                            continue;
                        };
                        let title = body
                            .lines()
                            .map(str::trim)
                            .find(|l| !l.is_empty())
                            .unwrap_or("")
                            .to_string();
                        let title = if title.is_empty() {
                            format!("Chương {index}")
                        } else {
                            title
                        };
                        report.repaired_titles += 1;
                        (title, format!("chuong-{index}"), count_words_of(&body))
                    }
                };
                rows.push((index, title, slug, word_count));
            }

            let inserted = self.insert_chapters(book_id, &rows)?;
            report.inserted_rows += inserted;
            if inserted > 0 {
                info!(book_id, inserted, "sweep filled chapter rows");
                self.update_chapters_saved(book_id, bundle_indices.len() as u32)?;
            }
        }
        Ok(report)
    }
}

fn count_words_of(body: &str) -> u32 {
    body.split_whitespace().count() as u32
}

/// Resolve a genre to a row ID: explicit ID, then lookup by slug, then
/// `MAX(id)+1` (floor 100) for genres the index has never seen.
fn resolve_genre_id(tx: &rusqlite::Transaction, genre: &GenreMeta) -> Result<i64> {
    let slug = genre
        .slug
        .clone()
        .unwrap_or_else(|| crate::book::slugify(&genre.name));

    let id = match genre.id {
        Some(id) => id,
        None => {
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM genres WHERE slug = ?1 LIMIT 1",
                    [&slug],
                    |row| row.get(0),
                )
                .optional()?;
            match existing {
                Some(id) => id,
                None => tx.query_row(
                    "SELECT COALESCE(MAX(id), 100) + 1 FROM genres",
                    [],
                    |row| row.get(0),
                )?,
            }
        }
    };

    tx.execute(
        "INSERT OR IGNORE INTO genres (id, name, slug) VALUES (?1, ?2, ?3)",
        params![id, genre.name, slug],
    )?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::{meta_hash, slugify, AuthorMeta, BookMetadata, SourceKind, TagMeta};
    use crate::bundle::{write_bundle, ChapterMeta};
    use std::collections::HashMap;

    fn sample_meta(id: i64, name: &str) -> BookMetadata {
        let mut meta = BookMetadata::empty(id, SourceKind::Api);
        meta.name = name.to_string();
        meta.slug = slugify(name);
        meta.chapter_count = 3;
        meta.author = Some(AuthorMeta {
            id: Some(42),
            name: "Trạch Trư".to_string(),
            local_name: None,
            avatar: None,
        });
        meta.genres = vec![GenreMeta {
            id: None,
            name: "Huyền Huyễn".to_string(),
            slug: Some("huyen-huyen".to_string()),
        }];
        meta.tags = vec![TagMeta {
            id: 7,
            name: "hot".to_string(),
            type_id: Some(2),
        }];
        meta
    }

    #[test]
    fn upsert_creates_book_author_genre_tag_rows() {
        let db = Database::open_in_memory().unwrap();
        let meta = sample_meta(100, "Mục Thần Ký");
        let hash = meta_hash(&meta);
        db.upsert_book_metadata(&meta, Some("/covers/100.jpg"), 0, &hash)
            .unwrap();

        assert_eq!(db.book_meta_hash(100).unwrap().as_deref(), Some(&*hash));
        let info = db.epub_book_info(100).unwrap().unwrap();
        assert_eq!(info.name, "Mục Thần Ký");
        assert_eq!(info.author_name.as_deref(), Some("Trạch Trư"));
        assert_eq!(info.genres, vec!["Huyền Huyễn".to_string()]);
    }

    #[test]
    fn upsert_twice_keeps_single_row_and_chapters() {
        let db = Database::open_in_memory().unwrap();
        let mut meta = sample_meta(100, "Mục Thần Ký");
        let hash = meta_hash(&meta);
        db.upsert_book_metadata(&meta, None, 0, &hash).unwrap();
        db.insert_chapters(
            100,
            &[(1, "Chương 1".to_string(), "chuong-1".to_string(), 10)],
        )
        .unwrap();

        // an INSERT OR REPLACE here would cascade-delete this row
        meta.view_count = 999;
        let hash2 = meta_hash(&meta);
        db.upsert_book_metadata(&meta, None, 1, &hash2).unwrap();

        assert_eq!(db.chapter_row_count(100).unwrap(), 1);
        assert_eq!(db.book_meta_hash(100).unwrap().as_deref(), Some(&*hash2));
    }

    #[test]
    fn chapter_rows_are_insert_or_ignore() {
        let db = Database::open_in_memory().unwrap();
        let meta = sample_meta(100, "Sách");
        db.upsert_book_metadata(&meta, None, 0, "h").unwrap();

        let first = db
            .insert_chapters(100, &[(1, "Cũ".to_string(), "chuong-1".to_string(), 5)])
            .unwrap();
        let second = db
            .insert_chapters(100, &[(1, "Mới".to_string(), "chuong-1".to_string(), 9)])
            .unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 0);

        let indices = db.chapter_indices(100).unwrap();
        assert_eq!(indices, [1u32].into_iter().collect());
    }

    #[test]
    fn slug_conflict_evicts_the_previous_owner() {
        let db = Database::open_in_memory().unwrap();
        let old = sample_meta(1, "Trùng Tên");
        db.upsert_book_metadata(&old, None, 0, "h1").unwrap();
        db.insert_chapters(1, &[(1, "C1".to_string(), "chuong-1".to_string(), 5)])
            .unwrap();

        // different book, same slug — the incoming book wins
        let new = sample_meta(2, "Trùng Tên");
        db.upsert_book_metadata(&new, None, 0, "h2").unwrap();

        assert!(db.book_meta_hash(1).unwrap().is_none());
        assert_eq!(db.chapter_row_count(1).unwrap(), 0);
        assert_eq!(db.book_meta_hash(2).unwrap().as_deref(), Some("h2"));
    }

    #[test]
    fn unknown_genres_get_assigned_ids() {
        let db = Database::open_in_memory().unwrap();
        let mut meta = sample_meta(1, "Một");
        meta.genres = vec![
            GenreMeta {
                id: None,
                name: "Mới Toanh".to_string(),
                slug: None,
            },
            GenreMeta {
                id: None,
                name: "Cũng Mới".to_string(),
                slug: None,
            },
        ];
        db.upsert_book_metadata(&meta, None, 0, "h").unwrap();

        let conn = db.conn.lock().unwrap();
        let ids: Vec<i64> = conn
            .prepare("SELECT id FROM genres ORDER BY id")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .filter_map(Result::ok)
            .collect();
        assert_eq!(ids, vec![101, 102]);
    }

    #[test]
    fn deleting_a_book_cascades_to_chapters() {
        let db = Database::open_in_memory().unwrap();
        let meta = sample_meta(5, "Xóa");
        db.upsert_book_metadata(&meta, None, 0, "h").unwrap();
        db.insert_chapters(5, &[(1, "C".to_string(), "c".to_string(), 1)])
            .unwrap();

        db.conn
            .lock()
            .unwrap()
            .execute("DELETE FROM books WHERE id = 5", [])
            .unwrap();
        assert_eq!(db.chapter_row_count(5).unwrap(), 0);
    }

    #[test]
    fn sweep_fills_missing_rows_fast_and_slow_path() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap();
        let compressor = ChapterCompressor::new(None, 3).unwrap();

        let meta = sample_meta(100, "Quét");
        db.upsert_book_metadata(&meta, None, 0, "h").unwrap();

        // bundle with two chapters: one with inline meta, one without
        let (c1, r1) = compressor.compress("Nội dung một.").unwrap();
        let (c2, r2) = compressor
            .compress("Chương 2: Tiêu đề\n\nNội dung hai.")
            .unwrap();
        let mut bodies = HashMap::new();
        bodies.insert(1, (c1, r1));
        bodies.insert(2, (c2, r2));
        let mut inline = HashMap::new();
        inline.insert(
            1,
            ChapterMeta {
                chapter_id: 0,
                word_count: 3,
                title: "Chương 1: Một".to_string(),
                slug: "chuong-1".to_string(),
            },
        );
        write_bundle(&dir.path().join("100.bundle"), &bodies, &inline).unwrap();

        let report = db.sweep_bundles(dir.path(), &compressor).unwrap();
        assert_eq!(report.bundles, 1);
        assert_eq!(report.inserted_rows, 2);
        assert_eq!(report.repaired_titles, 1);

        let indices = db.chapter_indices(100).unwrap();
        assert_eq!(indices.len(), 2);

        let conn = db.conn.lock().unwrap();
        let title2: String = conn
            .query_row(
                "SELECT title FROM chapters WHERE book_id = 100 AND index_num = 2",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(title2, "Chương 2: Tiêu đề");
    }

    #[test]
    fn sweep_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap();
        let compressor = ChapterCompressor::new(None, 3).unwrap();

        let meta = sample_meta(7, "Lặp");
        db.upsert_book_metadata(&meta, None, 0, "h").unwrap();

        let (c, r) = compressor.compress("Tiêu đề\n\nNội dung.").unwrap();
        let mut bodies = HashMap::new();
        bodies.insert(1, (c, r));
        write_bundle(&dir.path().join("7.bundle"), &bodies, &HashMap::new()).unwrap();

        let first = db.sweep_bundles(dir.path(), &compressor).unwrap();
        let second = db.sweep_bundles(dir.path(), &compressor).unwrap();
        assert_eq!(first.inserted_rows, 1);
        assert_eq!(second.inserted_rows, 0);
    }
}
