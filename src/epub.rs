//! EPUB 3.0 builder: stream chapters out of a bundle, merge with the
//! relational metadata, and emit one artifact per `(book, chapter_count)`.
//!
//! Artifacts are cached as `<cache_dir>/<book_id>_<count>.epub`. A cached
//! file whose count is at least the bundle's current count is served
//! as-is; building a newer one deletes the stale siblings.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use eyre::{bail, Result};
use lazy_regex::regex;
use uuid::Uuid;
use xml::writer::XmlEvent;
use xml::{EmitterConfig, EventWriter};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::bundle::{read_bundle_meta, read_bundle_raw, ChapterMeta, RawChapter};
use crate::compress::ChapterCompressor;
use crate::db::{Database, EpubBookInfo};

const BOOK_CSS: &[u8] = include_bytes!("./assets/book.css");

fn write_elements(
    writer: &mut EventWriter<&mut (impl Write + Sized)>,
    elements: Vec<XmlEvent>,
) -> Result<()> {
    for element in elements {
        writer.write(element)?;
    }
    Ok(())
}

/// Read-only view over one bundle, decompressing chapter bodies on
/// demand in index order.
pub struct BundleReader<'a> {
    bodies: BTreeMap<u32, RawChapter>,
    meta: HashMap<u32, ChapterMeta>,
    compressor: &'a ChapterCompressor,
}

impl<'a> BundleReader<'a> {
    pub fn open(bundle_path: &Path, compressor: &'a ChapterCompressor) -> Self {
        Self {
            bodies: read_bundle_raw(bundle_path).into_iter().collect(),
            meta: read_bundle_meta(bundle_path),
            compressor,
        }
    }

    pub fn chapter_count(&self) -> usize {
        self.bodies.len()
    }

    /// Iterate `(index, title, body)` in ascending index order.
    ///
    /// The title comes from v2 inline metadata when present; otherwise
    /// the body's first non-blank line serves as the title and is
    /// stripped from the body (with any immediate repetitions).
    pub fn chapters(&self) -> impl Iterator<Item = (u32, String, String)> + '_ {
        self.bodies.iter().filter_map(|(&index, (compressed, raw_len))| {
            let body = self.compressor.decompress(compressed, *raw_len).ok()?;
            let inline_title = self
                .meta
                .get(&index)
                .map(|m| m.title.trim().to_string())
                .filter(|t| !t.is_empty());
            let (title, body) = match inline_title {
                Some(title) => (title, body),
                None => split_title_from_body(&body),
            };
            Some((index, title, body))
        })
    }
}

/// First non-blank line becomes the title; it and any duplicate lines
/// directly after it are dropped from the body.
fn split_title_from_body(text: &str) -> (String, String) {
    let mut lines = text.split('\n');
    let title = lines.next().map(str::trim).unwrap_or("").to_string();
    let mut rest: Vec<&str> = lines.collect();

    let mut start = 0;
    while start < rest.len() {
        let line = rest[start].trim();
        if line.is_empty() || line == title {
            start += 1;
        } else {
            break;
        }
    }
    rest.drain(..start);
    (title, rest.join("\n").trim().to_string())
}

/// Plain-text body to XHTML paragraphs: blank lines split paragraphs,
/// single newlines become `<br/>`.
fn body_to_html(body: &str) -> String {
    regex!(r"\n\s*\n")
        .split(body)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            let escaped = p
                .replace('&', "&amp;")
                .replace('<', "&lt;")
                .replace('>', "&gt;")
                .replace('\n', "<br/>");
            format!("<p>{escaped}</p>")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn escape_text(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// `<cache_dir>/<book_id>_<count>.epub` entries for one book, as
/// `(count, path)` pairs.
fn cache_entries(cache_dir: &Path, book_id: i64) -> Vec<(usize, PathBuf)> {
    let prefix = format!("{book_id}_");
    let Ok(entries) = std::fs::read_dir(cache_dir) else {
        return Vec::new();
    };
    entries
        .filter_map(std::result::Result::ok)
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("epub"))
        .filter_map(|p| {
            let stem = p.file_stem()?.to_str()?;
            let count = stem.strip_prefix(&prefix)?.parse().ok()?;
            Some((count, p))
        })
        .collect()
}

/// A cached artifact may be served when its chapter count is at least
/// the bundle's current count.
pub fn cached_epub(cache_dir: &Path, book_id: i64, current_count: usize) -> Option<PathBuf> {
    cache_entries(cache_dir, book_id)
        .into_iter()
        .filter(|(count, _)| *count >= current_count)
        .max_by_key(|(count, _)| *count)
        .map(|(_, path)| path)
}

fn purge_stale(cache_dir: &Path, book_id: i64, keep_count: usize) {
    for (count, path) in cache_entries(cache_dir, book_id) {
        if count != keep_count {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn validate_cover(cover_path: &Path) -> bool {
    let Ok(reader) = image::ImageReader::open(cover_path) else {
        return false;
    };
    reader
        .with_guessed_format()
        .map(|r| r.decode().is_ok())
        .unwrap_or(false)
}

/// Build (or serve from cache) the EPUB for one book.
pub fn build_epub(
    book_id: i64,
    bundle_path: &Path,
    db: &Database,
    covers_dir: &Path,
    cache_dir: &Path,
    compressor: &ChapterCompressor,
) -> Result<PathBuf> {
    if !bundle_path.exists() {
        bail!("bundle not found: {}", bundle_path.display());
    }

    let reader = BundleReader::open(bundle_path, compressor);
    let count = reader.chapter_count();
    if count == 0 {
        bail!("bundle has 0 chapters: {}", bundle_path.display());
    }

    if let Some(cached) = cached_epub(cache_dir, book_id, count) {
        return Ok(cached);
    }

    let info = db
        .epub_book_info(book_id)?
        .unwrap_or_else(|| EpubBookInfo {
            name: format!("Book {book_id}"),
            author_name: None,
            genres: Vec::new(),
        });

    let cover_path = covers_dir.join(format!("{book_id}.jpg"));
    let cover = validate_cover(&cover_path)
        .then(|| std::fs::read(&cover_path).ok())
        .flatten();

    // Assemble in a temp file, move into the cache only when complete.
    let temp_dir = tempfile::tempdir()?;
    let temp_path = temp_dir
        .path()
        .join(Uuid::new_v4().to_string())
        .with_extension("epub");
    write_epub_file(&temp_path, book_id, &info, &reader, cover.as_deref())?;

    std::fs::create_dir_all(cache_dir)?;
    let out_path = cache_dir.join(format!("{book_id}_{count}.epub"));
    std::fs::copy(&temp_path, &out_path)?;
    purge_stale(cache_dir, book_id, count);

    tracing::info!(book_id, count, path = %out_path.display(), "wrote EPUB");
    Ok(out_path)
}

fn write_epub_file(
    path: &Path,
    book_id: i64,
    info: &EpubBookInfo,
    reader: &BundleReader,
    cover: Option<&[u8]>,
) -> Result<()> {
    let file = File::create(path)?;
    let mut epub = ZipWriter::new(file);
    let stored = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    let deflated = SimpleFileOptions::default();

    // The mimetype entry must come first and uncompressed.
    epub.start_file("mimetype", stored)?;
    epub.write_all(b"application/epub+zip")?;

    epub.add_directory("META-INF", deflated)?;
    epub.start_file("META-INF/container.xml", deflated)?;
    container_xml(&mut epub)?;

    let chapters: Vec<(u32, String, String)> = reader.chapters().collect();
    if chapters.is_empty() {
        bail!("could not decompress any chapter");
    }

    epub.start_file("OEBPS/content.opf", deflated)?;
    content_opf(book_id, info, &chapters, cover.is_some(), &mut epub)?;

    epub.start_file("OEBPS/toc.ncx", deflated)?;
    toc_ncx(book_id, info, &chapters, &mut epub)?;

    epub.start_file("OEBPS/nav.xhtml", deflated)?;
    nav_xhtml(info, &chapters, cover.is_some(), &mut epub)?;

    epub.start_file("OEBPS/styles/stylesheet.css", deflated)?;
    epub.write_all(BOOK_CSS)?;

    if let Some(image) = cover {
        epub.start_file("OEBPS/images/cover.jpg", deflated)?;
        epub.write_all(image)?;
        epub.start_file("OEBPS/text/cover.xhtml", deflated)?;
        cover_xhtml(info, &mut epub)?;
    }

    for (index, title, body) in &chapters {
        epub.start_file(format!("OEBPS/text/chapter_{index:05}.xhtml"), deflated)?;
        chapter_xhtml(title, body, &mut epub)?;
    }

    epub.finish()?;
    Ok(())
}

fn container_xml(file: &mut impl Write) -> Result<()> {
    let mut xml = EmitterConfig::new()
        .perform_indent(true)
        .create_writer(file);
    write_elements(
        &mut xml,
        vec![
            XmlEvent::start_element("container")
                .attr("version", "1.0")
                .ns("", "urn:oasis:names:tc:opendocument:xmlns:container")
                .into(),
            XmlEvent::start_element("rootfiles").into(),
            XmlEvent::start_element("rootfile")
                .attr("full-path", "OEBPS/content.opf")
                .attr("media-type", "application/oebps-package+xml")
                .into(),
            XmlEvent::end_element().into(),
            XmlEvent::end_element().into(),
            XmlEvent::end_element().into(),
        ],
    )
}

#[allow(clippy::too_many_lines)]
fn content_opf(
    book_id: i64,
    info: &EpubBookInfo,
    chapters: &[(u32, String, String)],
    has_cover: bool,
    file: &mut impl Write,
) -> Result<()> {
    let mut xml = EmitterConfig::new()
        .perform_indent(true)
        .create_writer(file);
    let identifier = format!("bookvault-{book_id}");

    write_elements(
        &mut xml,
        vec![
            XmlEvent::start_element("package")
                .ns("", "http://www.idpf.org/2007/opf")
                .attr("version", "3.0")
                .attr("unique-identifier", "bookid")
                .into(),
            XmlEvent::start_element("metadata")
                .ns("dc", "http://purl.org/dc/elements/1.1/")
                .into(),
            XmlEvent::start_element("dc:identifier")
                .attr("id", "bookid")
                .into(),
            XmlEvent::characters(&identifier),
            XmlEvent::end_element().into(),
            XmlEvent::start_element("dc:title").into(),
            XmlEvent::characters(&info.name),
            XmlEvent::end_element().into(),
            XmlEvent::start_element("dc:language").into(),
            XmlEvent::characters("vi"),
            XmlEvent::end_element().into(),
        ],
    )?;

    if let Some(author) = &info.author_name {
        write_elements(
            &mut xml,
            vec![
                XmlEvent::start_element("dc:creator").into(),
                XmlEvent::characters(author),
                XmlEvent::end_element().into(),
            ],
        )?;
    }
    for genre in &info.genres {
        write_elements(
            &mut xml,
            vec![
                XmlEvent::start_element("dc:subject").into(),
                XmlEvent::characters(genre),
                XmlEvent::end_element().into(),
            ],
        )?;
    }
    if has_cover {
        write_elements(
            &mut xml,
            vec![
                XmlEvent::start_element("meta")
                    .attr("name", "cover")
                    .attr("content", "cover-image")
                    .into(),
                XmlEvent::end_element().into(),
            ],
        )?;
    }
    write_elements(&mut xml, vec![XmlEvent::end_element().into()])?; // metadata

    // manifest
    write_elements(
        &mut xml,
        vec![
            XmlEvent::start_element("manifest").into(),
            XmlEvent::start_element("item")
                .attr("id", "nav")
                .attr("href", "nav.xhtml")
                .attr("media-type", "application/xhtml+xml")
                .attr("properties", "nav")
                .into(),
            XmlEvent::end_element().into(),
            XmlEvent::start_element("item")
                .attr("id", "ncx")
                .attr("href", "toc.ncx")
                .attr("media-type", "application/x-dtbncx+xml")
                .into(),
            XmlEvent::end_element().into(),
            XmlEvent::start_element("item")
                .attr("id", "stylesheet")
                .attr("href", "styles/stylesheet.css")
                .attr("media-type", "text/css")
                .into(),
            XmlEvent::end_element().into(),
        ],
    )?;
    if has_cover {
        write_elements(
            &mut xml,
            vec![
                XmlEvent::start_element("item")
                    .attr("id", "cover-image")
                    .attr("href", "images/cover.jpg")
                    .attr("media-type", "image/jpeg")
                    .attr("properties", "cover-image")
                    .into(),
                XmlEvent::end_element().into(),
                XmlEvent::start_element("item")
                    .attr("id", "cover")
                    .attr("href", "text/cover.xhtml")
                    .attr("media-type", "application/xhtml+xml")
                    .into(),
                XmlEvent::end_element().into(),
            ],
        )?;
    }
    for (index, _, _) in chapters {
        write_elements(
            &mut xml,
            vec![
                XmlEvent::start_element("item")
                    .attr("id", &format!("chapter-{index}"))
                    .attr("href", &format!("text/chapter_{index:05}.xhtml"))
                    .attr("media-type", "application/xhtml+xml")
                    .into(),
                XmlEvent::end_element().into(),
            ],
        )?;
    }
    write_elements(&mut xml, vec![XmlEvent::end_element().into()])?; // manifest

    // spine, in reading order
    write_elements(
        &mut xml,
        vec![XmlEvent::start_element("spine").attr("toc", "ncx").into()],
    )?;
    if has_cover {
        write_elements(
            &mut xml,
            vec![
                XmlEvent::start_element("itemref").attr("idref", "cover").into(),
                XmlEvent::end_element().into(),
            ],
        )?;
    }
    write_elements(
        &mut xml,
        vec![
            XmlEvent::start_element("itemref").attr("idref", "nav").into(),
            XmlEvent::end_element().into(),
        ],
    )?;
    for (index, _, _) in chapters {
        write_elements(
            &mut xml,
            vec![
                XmlEvent::start_element("itemref")
                    .attr("idref", &format!("chapter-{index}"))
                    .into(),
                XmlEvent::end_element().into(),
            ],
        )?;
    }
    write_elements(
        &mut xml,
        vec![
            XmlEvent::end_element().into(), // spine
            XmlEvent::end_element().into(), // package
        ],
    )?;
    Ok(())
}

fn toc_ncx(
    book_id: i64,
    info: &EpubBookInfo,
    chapters: &[(u32, String, String)],
    file: &mut impl Write,
) -> Result<()> {
    let mut xml = EmitterConfig::new()
        .perform_indent(true)
        .create_writer(file);

    write_elements(
        &mut xml,
        vec![
            XmlEvent::start_element("ncx")
                .ns("", "http://www.daisy.org/z3986/2005/ncx/")
                .attr("version", "2005-1")
                .into(),
            XmlEvent::start_element("head").into(),
            XmlEvent::start_element("meta")
                .attr("name", "dtb:uid")
                .attr("content", &format!("bookvault-{book_id}"))
                .into(),
            XmlEvent::end_element().into(),
            XmlEvent::start_element("meta")
                .attr("name", "dtb:depth")
                .attr("content", "1")
                .into(),
            XmlEvent::end_element().into(),
            XmlEvent::end_element().into(), // head
            XmlEvent::start_element("docTitle").into(),
            XmlEvent::start_element("text").into(),
            XmlEvent::characters(&info.name),
            XmlEvent::end_element().into(),
            XmlEvent::end_element().into(),
            XmlEvent::start_element("navMap").into(),
        ],
    )?;

    for (order, (index, title, _)) in chapters.iter().enumerate() {
        write_elements(
            &mut xml,
            vec![
                XmlEvent::start_element("navPoint")
                    .attr("id", &format!("chapter-{index}"))
                    .attr("playOrder", &format!("{}", order + 1))
                    .into(),
                XmlEvent::start_element("navLabel").into(),
                XmlEvent::start_element("text").into(),
                XmlEvent::characters(title),
                XmlEvent::end_element().into(),
                XmlEvent::end_element().into(),
                XmlEvent::start_element("content")
                    .attr("src", &format!("text/chapter_{index:05}.xhtml"))
                    .into(),
                XmlEvent::end_element().into(),
                XmlEvent::end_element().into(),
            ],
        )?;
    }

    write_elements(
        &mut xml,
        vec![
            XmlEvent::end_element().into(), // navMap
            XmlEvent::end_element().into(), // ncx
        ],
    )?;
    Ok(())
}

fn nav_xhtml(
    info: &EpubBookInfo,
    chapters: &[(u32, String, String)],
    has_cover: bool,
    file: &mut impl Write,
) -> Result<()> {
    let mut config = EmitterConfig::new().perform_indent(true);
    config.perform_escaping = false;
    let mut xml = config.create_writer(file);

    write_elements(
        &mut xml,
        vec![
            XmlEvent::characters("\n<!DOCTYPE html>\n"),
            XmlEvent::start_element("html")
                .ns("", "http://www.w3.org/1999/xhtml")
                .ns("epub", "http://www.idpf.org/2007/ops")
                .into(),
            XmlEvent::start_element("head").into(),
            XmlEvent::start_element("title").into(),
            XmlEvent::characters(&escape_text(&info.name)),
            XmlEvent::end_element().into(),
            XmlEvent::end_element().into(), // head
            XmlEvent::start_element("body").into(),
            XmlEvent::start_element("nav")
                .attr("epub:type", "toc")
                .into(),
            XmlEvent::start_element("ol").into(),
        ],
    )?;

    if has_cover {
        write_elements(
            &mut xml,
            vec![
                XmlEvent::start_element("li").into(),
                XmlEvent::start_element("a")
                    .attr("href", "text/cover.xhtml")
                    .into(),
                XmlEvent::characters("Bìa"),
                XmlEvent::end_element().into(),
                XmlEvent::end_element().into(),
            ],
        )?;
    }
    for (index, title, _) in chapters {
        write_elements(
            &mut xml,
            vec![
                XmlEvent::start_element("li").into(),
                XmlEvent::start_element("a")
                    .attr("href", &format!("text/chapter_{index:05}.xhtml"))
                    .into(),
                XmlEvent::characters(&escape_text(title)),
                XmlEvent::end_element().into(),
                XmlEvent::end_element().into(),
            ],
        )?;
    }

    write_elements(
        &mut xml,
        vec![
            XmlEvent::end_element().into(), // ol
            XmlEvent::end_element().into(), // nav
            XmlEvent::end_element().into(), // body
            XmlEvent::end_element().into(), // html
        ],
    )?;
    Ok(())
}

fn cover_xhtml(info: &EpubBookInfo, file: &mut impl Write) -> Result<()> {
    let mut config = EmitterConfig::new().perform_indent(true);
    config.perform_escaping = false;
    let mut xml = config.create_writer(file);

    write_elements(
        &mut xml,
        vec![
            XmlEvent::characters("\n<!DOCTYPE html>\n"),
            XmlEvent::start_element("html")
                .ns("", "http://www.w3.org/1999/xhtml")
                .into(),
            XmlEvent::start_element("head").into(),
            XmlEvent::start_element("title").into(),
            XmlEvent::characters(&escape_text(&info.name)),
            XmlEvent::end_element().into(),
            XmlEvent::start_element("link")
                .attr("rel", "stylesheet")
                .attr("type", "text/css")
                .attr("href", "../styles/stylesheet.css")
                .into(),
            XmlEvent::end_element().into(),
            XmlEvent::end_element().into(), // head
            XmlEvent::start_element("body")
                .attr("class", "cover-page")
                .into(),
            XmlEvent::start_element("img")
                .attr("src", "../images/cover.jpg")
                .attr("alt", "Cover")
                .into(),
            XmlEvent::end_element().into(),
            XmlEvent::end_element().into(), // body
            XmlEvent::end_element().into(), // html
        ],
    )
}

fn chapter_xhtml(title: &str, body: &str, file: &mut impl Write) -> Result<()> {
    let mut config = EmitterConfig::new().perform_indent(true);
    config.perform_escaping = false;
    let mut xml = config.create_writer(file);

    write_elements(
        &mut xml,
        vec![
            XmlEvent::characters("\n<!DOCTYPE html>\n"),
            XmlEvent::start_element("html")
                .ns("", "http://www.w3.org/1999/xhtml")
                .attr("xml:lang", "vi")
                .into(),
            XmlEvent::start_element("head").into(),
            XmlEvent::start_element("title").into(),
            XmlEvent::characters(&escape_text(title)),
            XmlEvent::end_element().into(),
            XmlEvent::start_element("link")
                .attr("href", "../styles/stylesheet.css")
                .attr("rel", "stylesheet")
                .attr("type", "text/css")
                .into(),
            XmlEvent::end_element().into(),
            XmlEvent::end_element().into(), // head
            XmlEvent::start_element("body").into(),
            XmlEvent::start_element("h2").into(),
            XmlEvent::characters(&escape_text(title)),
            XmlEvent::end_element().into(),
            XmlEvent::characters(&body_to_html(body)),
            XmlEvent::end_element().into(), // body
            XmlEvent::end_element().into(), // html
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::{meta_hash, BookMetadata, SourceKind};
    use crate::bundle::write_bundle;
    use std::io::Read;

    #[test]
    fn body_to_html_escapes_and_splits_paragraphs() {
        let body = "Đoạn <một> & hai\ncùng đoạn\n\nĐoạn ba";
        let html = body_to_html(body);
        assert_eq!(
            html,
            "<p>Đoạn &lt;một&gt; &amp; hai<br/>cùng đoạn</p>\n<p>Đoạn ba</p>"
        );
    }

    #[test]
    fn split_title_drops_duplicates_and_blanks() {
        let text = "Chương 1: Mở đầu\n\nChương 1: Mở đầu\nThân bài.";
        let (title, body) = split_title_from_body(text);
        assert_eq!(title, "Chương 1: Mở đầu");
        assert_eq!(body, "Thân bài.");
    }

    #[test]
    fn cache_lookup_honors_count_threshold() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("100358_2500.epub"), b"x").unwrap();

        // current bundle still at 2500 → serve
        let hit = cached_epub(dir.path(), 100358, 2500).unwrap();
        assert!(hit.ends_with("100358_2500.epub"));

        // bundle grew → stale
        assert!(cached_epub(dir.path(), 100358, 2510).is_none());
        // other books don't interfere
        assert!(cached_epub(dir.path(), 999, 1).is_none());
    }

    #[test]
    fn purge_keeps_only_the_current_count() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("7_10.epub"), b"x").unwrap();
        std::fs::write(dir.path().join("7_12.epub"), b"x").unwrap();
        std::fs::write(dir.path().join("8_10.epub"), b"x").unwrap();

        purge_stale(dir.path(), 7, 12);
        assert!(!dir.path().join("7_10.epub").exists());
        assert!(dir.path().join("7_12.epub").exists());
        assert!(dir.path().join("8_10.epub").exists());
    }

    fn seeded_bundle(dir: &Path, compressor: &ChapterCompressor, chapters: &[(u32, &str)]) {
        let mut bodies = std::collections::HashMap::new();
        for (index, body) in chapters {
            let (compressed, raw_len) = compressor.compress(body).unwrap();
            bodies.insert(*index, (compressed, raw_len));
        }
        write_bundle(&dir.join("100.bundle"), &bodies, &std::collections::HashMap::new())
            .unwrap();
    }

    #[test]
    fn build_epub_produces_a_valid_container() {
        let dir = tempfile::tempdir().unwrap();
        let compressor = ChapterCompressor::new(None, 3).unwrap();
        let db = Database::open_in_memory().unwrap();

        let mut meta = BookMetadata::empty(100, SourceKind::Api);
        meta.name = "Sách Thử".to_string();
        meta.slug = "sach-thu".to_string();
        let hash = meta_hash(&meta);
        db.upsert_book_metadata(&meta, None, 0, &hash).unwrap();

        seeded_bundle(
            dir.path(),
            &compressor,
            &[
                (1, "Chương 1: Một\n\nNội dung một."),
                (2, "Chương 2: Hai\n\nNội dung hai."),
            ],
        );

        let cache_dir = dir.path().join("cache");
        let out = build_epub(
            100,
            &dir.path().join("100.bundle"),
            &db,
            &dir.path().join("covers"),
            &cache_dir,
            &compressor,
        )
        .unwrap();
        assert!(out.ends_with("100_2.epub"));

        let mut zip = zip::ZipArchive::new(File::open(&out).unwrap()).unwrap();
        let mut mimetype = String::new();
        zip.by_name("mimetype")
            .unwrap()
            .read_to_string(&mut mimetype)
            .unwrap();
        assert_eq!(mimetype, "application/epub+zip");
        assert!(zip.by_name("OEBPS/content.opf").is_ok());
        assert!(zip.by_name("OEBPS/nav.xhtml").is_ok());
        assert!(zip.by_name("OEBPS/text/chapter_00001.xhtml").is_ok());
        assert!(zip.by_name("OEBPS/text/chapter_00002.xhtml").is_ok());
    }

    #[test]
    fn growing_bundle_invalidates_cache() {
        let dir = tempfile::tempdir().unwrap();
        let compressor = ChapterCompressor::new(None, 3).unwrap();
        let db = Database::open_in_memory().unwrap();
        let cache_dir = dir.path().join("cache");
        let bundle = dir.path().join("100.bundle");

        seeded_bundle(dir.path(), &compressor, &[(1, "Chương 1\n\nA.")]);
        let first = build_epub(100, &bundle, &db, dir.path(), &cache_dir, &compressor).unwrap();
        assert!(first.ends_with("100_1.epub"));

        // serving again is a cache hit
        let again = build_epub(100, &bundle, &db, dir.path(), &cache_dir, &compressor).unwrap();
        assert_eq!(first, again);

        // bundle grows → rebuild, stale artifact removed
        seeded_bundle(
            dir.path(),
            &compressor,
            &[(1, "Chương 1\n\nA."), (2, "Chương 2\n\nB.")],
        );
        let rebuilt = build_epub(100, &bundle, &db, dir.path(), &cache_dir, &compressor).unwrap();
        assert!(rebuilt.ends_with("100_2.epub"));
        assert!(!first.exists());
    }

    #[test]
    fn missing_bundle_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let compressor = ChapterCompressor::new(None, 3).unwrap();
        let db = Database::open_in_memory().unwrap();
        let result = build_epub(
            1,
            &dir.path().join("1.bundle"),
            &db,
            dir.path(),
            dir.path(),
            &compressor,
        );
        assert!(result.is_err());
    }
}
