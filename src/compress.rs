//! zstd compression of chapter bodies against the global trained
//! dictionary (`global.dict`).
//!
//! The dictionary identity is not recorded in bundles — operators keep
//! the dictionary paired with the data it compressed. Running without a
//! dictionary is supported (plain zstd frames) for setups that never
//! trained one.

use std::fs;
use std::path::Path;

use eyre::{Result, WrapErr};

pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Process-wide chapter compressor. Immutable after load; shared by
/// reference across workers.
pub struct ChapterCompressor {
    dict: Option<Vec<u8>>,
    level: i32,
}

impl ChapterCompressor {
    /// Load the global dictionary. A provided path that cannot be read is
    /// a startup failure; `None` selects dictionary-less operation.
    pub fn new(dict_path: Option<&Path>, level: i32) -> Result<Self> {
        let dict = match dict_path {
            Some(path) => Some(
                fs::read(path)
                    .wrap_err_with(|| format!("cannot read dictionary {}", path.display()))?,
            ),
            None => None,
        };
        Ok(Self { dict, level })
    }

    /// Compress a chapter body. Returns `(compressed, uncompressed_len)`,
    /// the exact shape a bundle index entry records.
    pub fn compress(&self, body: &str) -> Result<(Vec<u8>, u32)> {
        let raw = body.as_bytes();
        let compressed = match &self.dict {
            Some(dict) => {
                zstd::bulk::Compressor::with_dictionary(self.level, dict)?.compress(raw)?
            }
            None => zstd::bulk::Compressor::new(self.level)?.compress(raw)?,
        };
        Ok((compressed, raw.len() as u32))
    }

    /// Decompress a chapter body back to text. `raw_len` is the recorded
    /// uncompressed length and bounds the output buffer.
    pub fn decompress(&self, compressed: &[u8], raw_len: u32) -> Result<String> {
        let capacity = raw_len as usize;
        let raw = match &self.dict {
            Some(dict) => {
                zstd::bulk::Decompressor::with_dictionary(dict)?.decompress(compressed, capacity)?
            }
            None => zstd::bulk::Decompressor::new()?.decompress(compressed, capacity)?,
        };
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_without_dictionary() {
        let compressor = ChapterCompressor::new(None, DEFAULT_COMPRESSION_LEVEL).unwrap();
        let body = "Chương 1: Khởi đầu\n\nĐây là nội dung chương đầu tiên.";
        let (compressed, raw_len) = compressor.compress(body).unwrap();
        assert_eq!(raw_len as usize, body.len());
        assert_eq!(compressor.decompress(&compressed, raw_len).unwrap(), body);
    }

    #[test]
    fn round_trip_with_dictionary() {
        let samples: Vec<Vec<u8>> = (0..128)
            .map(|i| format!("Chương {i}: một đoạn văn bản lặp đi lặp lại {i}").into_bytes())
            .collect();
        let dict = zstd::dict::from_samples(&samples, 1024).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let dict_path = dir.path().join("global.dict");
        std::fs::write(&dict_path, &dict).unwrap();

        let compressor = ChapterCompressor::new(Some(&dict_path), 3).unwrap();
        let body = "Chương 7: một đoạn văn bản lặp đi lặp lại 7";
        let (compressed, raw_len) = compressor.compress(body).unwrap();
        assert_eq!(compressor.decompress(&compressed, raw_len).unwrap(), body);
    }

    #[test]
    fn missing_dictionary_is_a_startup_error() {
        let err = ChapterCompressor::new(Some(Path::new("/nonexistent/global.dict")), 3);
        assert!(err.is_err());
    }

    #[test]
    fn empty_body_round_trips() {
        let compressor = ChapterCompressor::new(None, 3).unwrap();
        let (compressed, raw_len) = compressor.compress("").unwrap();
        assert_eq!(raw_len, 0);
        assert_eq!(compressor.decompress(&compressed, raw_len).unwrap(), "");
    }
}
