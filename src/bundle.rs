//! BLIB bundle codec — one `.bundle` file per book, v1 (bodies only) and
//! v2 (bodies + inline per-chapter metadata).
//!
//! v2 layout (little-endian):
//!
//! ```text
//! [4]  magic "BLIB"
//! [4]  u32 version (2)
//! [4]  u32 entry count N
//! [2]  u16 meta entry size (256)
//! [2]  u16 reserved (0)
//! [N*16] index entries, ascending chapter index:
//!        u32 index, u32 block offset, u32 compressed len, u32 raw len
//! per chapter block (at block offset):
//!        [256] fixed metadata, then [comp_len] zstd-compressed body
//! ```
//!
//! v1 has a 12-byte header (no meta size) and its offsets point directly
//! at the compressed bytes. Readers accept both; the writer always emits
//! v2. Readers are tolerant: a missing, truncated or foreign file reads
//! as empty and downstream decides what that means.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use tempfile::NamedTempFile;
use thiserror::Error;

pub const BUNDLE_MAGIC: &[u8; 4] = b"BLIB";
pub const BUNDLE_VERSION_1: u32 = 1;
pub const BUNDLE_VERSION_2: u32 = 2;

const HEADER_SIZE_V1: usize = 12;
const HEADER_SIZE_V2: usize = 16;
const ENTRY_SIZE: usize = 16;

pub const META_ENTRY_SIZE: usize = 256;
const META_TITLE_MAX: usize = 196;
const META_SLUG_MAX: usize = 48;
const META_TITLE_LEN_AT: usize = 8;
const META_TITLE_AT: usize = 9;
const META_SLUG_LEN_AT: usize = 205;
const META_SLUG_AT: usize = 206;

#[derive(Error, Debug)]
pub enum BundleError {
    #[error("bundle I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("could not persist bundle: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// Per-chapter metadata stored inline in v2 bundles.
///
/// An all-zero block decodes to the default value ("no title,
/// `word_count` 0, `chapter_id` 0"), which is also what the writer emits
/// for chapters it knows nothing about.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChapterMeta {
    /// Upstream chapter identifier; the resume anchor for linked-list
    /// sources. 0 for sources without chapter IDs.
    pub chapter_id: u32,
    pub word_count: u32,
    pub title: String,
    pub slug: String,
}

/// One compressed chapter body: `(zstd bytes, uncompressed length)`.
pub type RawChapter = (Vec<u8>, u32);

struct Header {
    count: u32,
    header_size: usize,
    meta_entry_size: usize,
}

fn parse_header(buf: &[u8]) -> Option<Header> {
    if buf.len() < HEADER_SIZE_V1 || &buf[..4] != BUNDLE_MAGIC {
        return None;
    }
    let version = u32_at(buf, 4)?;
    let count = u32_at(buf, 8)?;
    match version {
        BUNDLE_VERSION_1 => Some(Header {
            count,
            header_size: HEADER_SIZE_V1,
            meta_entry_size: 0,
        }),
        BUNDLE_VERSION_2 => {
            if buf.len() < HEADER_SIZE_V2 {
                return None;
            }
            Some(Header {
                count,
                header_size: HEADER_SIZE_V2,
                meta_entry_size: u16_at(buf, 12)? as usize,
            })
        }
        _ => None,
    }
}

fn u32_at(buf: &[u8], at: usize) -> Option<u32> {
    buf.get(at..at + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
}

fn u16_at(buf: &[u8], at: usize) -> Option<u16> {
    buf.get(at..at + 2)
        .and_then(|b| b.try_into().ok())
        .map(u16::from_le_bytes)
}

/// Truncate to at most `max` bytes without splitting a UTF-8 code point.
fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn encode_meta(meta: &ChapterMeta) -> [u8; META_ENTRY_SIZE] {
    let mut buf = [0u8; META_ENTRY_SIZE];
    buf[0..4].copy_from_slice(&meta.chapter_id.to_le_bytes());
    buf[4..8].copy_from_slice(&meta.word_count.to_le_bytes());

    let title = truncate_utf8(&meta.title, META_TITLE_MAX).as_bytes();
    buf[META_TITLE_LEN_AT] = title.len() as u8;
    buf[META_TITLE_AT..META_TITLE_AT + title.len()].copy_from_slice(title);

    let slug = truncate_utf8(&meta.slug, META_SLUG_MAX).as_bytes();
    buf[META_SLUG_LEN_AT] = slug.len() as u8;
    buf[META_SLUG_AT..META_SLUG_AT + slug.len()].copy_from_slice(slug);

    // bytes 254..256 stay zero (reserved)
    buf
}

fn decode_meta(buf: &[u8]) -> ChapterMeta {
    if buf.len() < META_ENTRY_SIZE {
        return ChapterMeta::default();
    }
    let chapter_id = u32_at(buf, 0).unwrap_or(0);
    let word_count = u32_at(buf, 4).unwrap_or(0);

    let title_len = (buf[META_TITLE_LEN_AT] as usize).min(META_TITLE_MAX);
    let title = String::from_utf8_lossy(&buf[META_TITLE_AT..META_TITLE_AT + title_len]).into_owned();

    let slug_len = (buf[META_SLUG_LEN_AT] as usize).min(META_SLUG_MAX);
    let slug = String::from_utf8_lossy(&buf[META_SLUG_AT..META_SLUG_AT + slug_len]).into_owned();

    ChapterMeta {
        chapter_id,
        word_count,
        title,
        slug,
    }
}

struct IndexEntry {
    index: u32,
    offset: u32,
    comp_len: u32,
    raw_len: u32,
}

/// Read header + index entries from an open bundle file.
///
/// Returns `None` for anything that is not a well-formed BLIB header,
/// including a short read of the index section.
fn read_index(file: &mut File) -> Option<(Header, Vec<IndexEntry>)> {
    let mut hdr = [0u8; HEADER_SIZE_V2];
    let got = read_up_to(file, &mut hdr).ok()?;
    let header = parse_header(&hdr[..got])?;

    if header.count == 0 {
        return Some((header, Vec::new()));
    }

    let idx_len = header.count as usize * ENTRY_SIZE;
    let mut idx_buf = vec![0u8; idx_len];
    file.seek(SeekFrom::Start(header.header_size as u64)).ok()?;
    file.read_exact(&mut idx_buf).ok()?;

    let mut entries = Vec::with_capacity(header.count as usize);
    for i in 0..header.count as usize {
        let base = i * ENTRY_SIZE;
        entries.push(IndexEntry {
            index: u32_at(&idx_buf, base)?,
            offset: u32_at(&idx_buf, base + 4)?,
            comp_len: u32_at(&idx_buf, base + 8)?,
            raw_len: u32_at(&idx_buf, base + 12)?,
        });
    }
    Some((header, entries))
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = file.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

/// Read only the index section — the set of chapter indices stored in the
/// bundle. Does not touch body data.
///
/// Accepts v1 and v2. A missing or corrupt file reads as the empty set.
pub fn read_bundle_indices(bundle_path: &Path) -> HashSet<u32> {
    let Ok(mut file) = File::open(bundle_path) else {
        return HashSet::new();
    };
    match read_index(&mut file) {
        Some((_, entries)) => entries.iter().map(|e| e.index).collect(),
        None => HashSet::new(),
    }
}

/// Read per-chapter inline metadata from a v2 bundle.
///
/// Empty for v1 bundles, missing files, and anything unparseable.
pub fn read_bundle_meta(bundle_path: &Path) -> HashMap<u32, ChapterMeta> {
    let Ok(mut file) = File::open(bundle_path) else {
        return HashMap::new();
    };
    let Some((header, entries)) = read_index(&mut file) else {
        return HashMap::new();
    };
    if header.meta_entry_size == 0 {
        return HashMap::new();
    }

    let mut result = HashMap::with_capacity(entries.len());
    let mut meta_buf = vec![0u8; header.meta_entry_size];
    for entry in entries {
        if file.seek(SeekFrom::Start(entry.offset as u64)).is_err() {
            continue;
        }
        if file.read_exact(&mut meta_buf).is_err() {
            continue;
        }
        result.insert(entry.index, decode_meta(&meta_buf));
    }
    result
}

/// Read every compressed chapter body from a bundle.
///
/// For v2 the metadata prefix is skipped — only the compressed bytes and
/// the recorded raw length come back. Used to carry prior chapters into a
/// rewrite byte-for-byte, without re-compressing.
pub fn read_bundle_raw(bundle_path: &Path) -> HashMap<u32, RawChapter> {
    let Ok(mut file) = File::open(bundle_path) else {
        return HashMap::new();
    };
    let Some((header, entries)) = read_index(&mut file) else {
        return HashMap::new();
    };

    let mut result = HashMap::with_capacity(entries.len());
    for entry in entries {
        let data_offset = entry.offset as u64 + header.meta_entry_size as u64;
        if file.seek(SeekFrom::Start(data_offset)).is_err() {
            continue;
        }
        let mut data = vec![0u8; entry.comp_len as usize];
        if file.read_exact(&mut data).is_err() {
            continue;
        }
        result.insert(entry.index, (data, entry.raw_len));
    }
    result
}

/// Write a complete BLIB v2 bundle atomically (tmp file + rename).
///
/// Index entries are emitted in ascending chapter-index order. Chapters
/// without a `meta` entry get a zero-filled metadata block. An empty
/// `bodies` map is a no-op: whatever is on disk stays untouched.
pub fn write_bundle(
    bundle_path: &Path,
    bodies: &HashMap<u32, RawChapter>,
    meta: &HashMap<u32, ChapterMeta>,
) -> Result<(), BundleError> {
    if bodies.is_empty() {
        return Ok(());
    }

    let sorted: BTreeMap<u32, &RawChapter> = bodies.iter().map(|(k, v)| (*k, v)).collect();
    let count = sorted.len() as u32;
    let data_start = HEADER_SIZE_V2 + sorted.len() * ENTRY_SIZE;

    let mut index_buf = Vec::with_capacity(sorted.len() * ENTRY_SIZE);
    let mut offset = data_start as u32;
    for (index, (compressed, raw_len)) in &sorted {
        index_buf.extend_from_slice(&index.to_le_bytes());
        index_buf.extend_from_slice(&offset.to_le_bytes());
        index_buf.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
        index_buf.extend_from_slice(&raw_len.to_le_bytes());
        offset += (META_ENTRY_SIZE + compressed.len()) as u32;
    }

    let dir = bundle_path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    // Tmp file in the same directory so the final rename stays on one
    // filesystem; dropped (and unlinked) automatically on any error path.
    let mut tmp = NamedTempFile::with_suffix_in(".tmp", dir)?;
    {
        let f = tmp.as_file_mut();
        f.write_all(BUNDLE_MAGIC)?;
        f.write_all(&BUNDLE_VERSION_2.to_le_bytes())?;
        f.write_all(&count.to_le_bytes())?;
        f.write_all(&(META_ENTRY_SIZE as u16).to_le_bytes())?;
        f.write_all(&0u16.to_le_bytes())?;
        f.write_all(&index_buf)?;
        for (index, (compressed, _)) in &sorted {
            let block = meta.get(index).map_or([0u8; META_ENTRY_SIZE], encode_meta);
            f.write_all(&block)?;
            f.write_all(compressed)?;
        }
        f.sync_all()?;
    }
    tmp.persist(bundle_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bodies() -> HashMap<u32, RawChapter> {
        let mut bodies = HashMap::new();
        bodies.insert(3, (vec![9, 9, 9, 9], 40));
        bodies.insert(1, (vec![1, 2, 3], 10));
        bodies.insert(2, (vec![4, 5], 20));
        bodies
    }

    fn sample_meta() -> HashMap<u32, ChapterMeta> {
        let mut meta = HashMap::new();
        meta.insert(
            1,
            ChapterMeta {
                chapter_id: 9000001,
                word_count: 123,
                title: "Chương 1: Khởi đầu".to_string(),
                slug: "chuong-1".to_string(),
            },
        );
        meta
    }

    #[test]
    fn round_trip_indices_match_bodies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("100.bundle");
        let bodies = sample_bodies();

        write_bundle(&path, &bodies, &sample_meta()).unwrap();

        let indices = read_bundle_indices(&path);
        assert_eq!(indices, bodies.keys().copied().collect());
    }

    #[test]
    fn round_trip_raw_preserves_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("100.bundle");
        let bodies = sample_bodies();

        write_bundle(&path, &bodies, &HashMap::new()).unwrap();

        let raw = read_bundle_raw(&path);
        assert_eq!(raw.len(), 3);
        assert_eq!(raw[&1], (vec![1, 2, 3], 10));
        assert_eq!(raw[&3], (vec![9, 9, 9, 9], 40));
    }

    #[test]
    fn round_trip_meta() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("100.bundle");

        write_bundle(&path, &sample_bodies(), &sample_meta()).unwrap();

        let meta = read_bundle_meta(&path);
        assert_eq!(meta[&1].chapter_id, 9000001);
        assert_eq!(meta[&1].title, "Chương 1: Khởi đầu");
        assert_eq!(meta[&1].slug, "chuong-1");
        // chapters without provided meta decode as the zero value
        assert_eq!(meta[&2], ChapterMeta::default());
        assert_eq!(meta[&3], ChapterMeta::default());
    }

    #[test]
    fn rewrite_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("100.bundle");

        write_bundle(&path, &sample_bodies(), &sample_meta()).unwrap();
        let first = std::fs::read(&path).unwrap();

        let raw = read_bundle_raw(&path);
        let meta = read_bundle_meta(&path);
        write_bundle(&path, &raw, &meta).unwrap();
        let second = std::fs::read(&path).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn index_entries_are_ascending_with_contiguous_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("100.bundle");
        write_bundle(&path, &sample_bodies(), &HashMap::new()).unwrap();

        let buf = std::fs::read(&path).unwrap();
        let count = u32_at(&buf, 8).unwrap() as usize;
        assert_eq!(count, 3);

        let mut expected_offset = (HEADER_SIZE_V2 + count * ENTRY_SIZE) as u32;
        let mut prev_index = 0;
        for i in 0..count {
            let base = HEADER_SIZE_V2 + i * ENTRY_SIZE;
            let index = u32_at(&buf, base).unwrap();
            let offset = u32_at(&buf, base + 4).unwrap();
            let comp_len = u32_at(&buf, base + 8).unwrap();
            assert!(index > prev_index);
            assert_eq!(offset, expected_offset);
            prev_index = index;
            expected_offset += META_ENTRY_SIZE as u32 + comp_len;
        }
        assert_eq!(expected_offset as usize, buf.len());
    }

    #[test]
    fn missing_file_reads_empty() {
        let path = Path::new("/nonexistent/999.bundle");
        assert!(read_bundle_indices(path).is_empty());
        assert!(read_bundle_meta(path).is_empty());
        assert!(read_bundle_raw(path).is_empty());
    }

    #[test]
    fn empty_and_garbage_files_read_empty() {
        let dir = tempfile::tempdir().unwrap();

        let empty = dir.path().join("empty.bundle");
        std::fs::write(&empty, b"").unwrap();
        assert!(read_bundle_indices(&empty).is_empty());

        let garbage = dir.path().join("garbage.bundle");
        std::fs::write(&garbage, b"definitely not a bundle file").unwrap();
        assert!(read_bundle_indices(&garbage).is_empty());
        assert!(read_bundle_raw(&garbage).is_empty());
    }

    #[test]
    fn zero_count_header_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zero.bundle");
        let mut buf = Vec::new();
        buf.extend_from_slice(BUNDLE_MAGIC);
        buf.extend_from_slice(&BUNDLE_VERSION_2.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&(META_ENTRY_SIZE as u16).to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        std::fs::write(&path, &buf).unwrap();

        assert!(read_bundle_indices(&path).is_empty());
        assert!(read_bundle_meta(&path).is_empty());
    }

    #[test]
    fn truncated_index_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("truncated.bundle");
        let mut buf = Vec::new();
        buf.extend_from_slice(BUNDLE_MAGIC);
        buf.extend_from_slice(&BUNDLE_VERSION_2.to_le_bytes());
        buf.extend_from_slice(&5u32.to_le_bytes()); // claims 5 entries
        buf.extend_from_slice(&(META_ENTRY_SIZE as u16).to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&[0u8; ENTRY_SIZE]); // only one present
        std::fs::write(&path, &buf).unwrap();

        assert!(read_bundle_indices(&path).is_empty());
    }

    /// Hand-rolled v1 bundle: 12-byte header, offsets point at the data.
    fn write_v1_fixture(path: &Path, chapters: &[(u32, &[u8], u32)]) {
        let mut buf = Vec::new();
        buf.extend_from_slice(BUNDLE_MAGIC);
        buf.extend_from_slice(&BUNDLE_VERSION_1.to_le_bytes());
        buf.extend_from_slice(&(chapters.len() as u32).to_le_bytes());
        let mut offset = (HEADER_SIZE_V1 + chapters.len() * ENTRY_SIZE) as u32;
        for (index, data, raw_len) in chapters {
            buf.extend_from_slice(&index.to_le_bytes());
            buf.extend_from_slice(&offset.to_le_bytes());
            buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
            buf.extend_from_slice(&raw_len.to_le_bytes());
            offset += data.len() as u32;
        }
        for (_, data, _) in chapters {
            buf.extend_from_slice(data);
        }
        std::fs::write(path, &buf).unwrap();
    }

    #[test]
    fn v1_bundle_reads_bodies_but_no_meta() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v1.bundle");
        write_v1_fixture(&path, &[(1, b"abc", 30), (2, b"defg", 44)]);

        assert_eq!(read_bundle_indices(&path).len(), 2);
        assert!(read_bundle_meta(&path).is_empty());

        let raw = read_bundle_raw(&path);
        assert_eq!(raw[&1], (b"abc".to_vec(), 30));
        assert_eq!(raw[&2], (b"defg".to_vec(), 44));
    }

    #[test]
    fn empty_bodies_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("100.bundle");
        write_bundle(&path, &sample_bodies(), &HashMap::new()).unwrap();
        let before = std::fs::read(&path).unwrap();

        write_bundle(&path, &HashMap::new(), &HashMap::new()).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn no_tmp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("100.bundle");
        write_bundle(&path, &sample_bodies(), &HashMap::new()).unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.path() != path)
            .collect();
        assert!(leftovers.is_empty(), "stray files: {leftovers:?}");
    }

    #[test]
    fn long_title_truncates_on_char_boundary() {
        // "a" then 99 two-byte chars: every boundary after the first byte
        // is odd, so the 196-byte cap would split a char — expect 195.
        let title: String = std::iter::once('a')
            .chain(std::iter::repeat('đ').take(99))
            .collect();
        let meta = ChapterMeta {
            title: title.clone(),
            ..ChapterMeta::default()
        };
        let decoded = decode_meta(&encode_meta(&meta));
        assert_eq!(decoded.title.len(), 195);
        assert!(title.starts_with(&decoded.title));

        // an exactly-aligned title keeps the full 196 bytes
        let aligned: String = std::iter::repeat('đ').take(98).collect();
        let decoded = decode_meta(&encode_meta(&ChapterMeta {
            title: aligned.clone(),
            ..ChapterMeta::default()
        }));
        assert_eq!(decoded.title, aligned);
    }

    #[test]
    fn long_slug_truncates() {
        let meta = ChapterMeta {
            slug: "x".repeat(100),
            ..ChapterMeta::default()
        };
        let decoded = decode_meta(&encode_meta(&meta));
        assert_eq!(decoded.slug.len(), META_SLUG_MAX);
    }

    #[test]
    fn all_zero_meta_block_decodes_as_default() {
        assert_eq!(decode_meta(&[0u8; META_ENTRY_SIZE]), ChapterMeta::default());
    }
}
