//! Payload compression for weight records.
//!
//! The weight file does not record which codec packed a record; callers pick
//! the codec when they [`compress`](crate::modelio::ModelDict::compress) or
//! [`decompress`](crate::modelio::ModelDict::decompress) a dictionary.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{Error, Result};

/// A byte-level compressor.
pub trait Codec {
    /// Short name used in error messages.
    fn id(&self) -> &'static str;

    /// Packs `raw` into a new buffer.
    ///
    /// # Errors
    ///
    /// [`Error::Codec`] if the encoder fails.
    fn compress(&self, raw: &[u8]) -> Result<Vec<u8>>;

    /// Unpacks `packed`, which must expand to exactly `raw_len` bytes.
    ///
    /// # Errors
    ///
    /// [`Error::Codec`] on corrupt input, [`Error::SizeMismatch`] if the
    /// output length differs from `raw_len`.
    fn decompress(&self, packed: &[u8], raw_len: usize) -> Result<Vec<u8>>;
}

/// zlib stream codec backed by `flate2`.
#[derive(Debug, Clone, Copy)]
pub struct Zlib {
    level: Compression,
}

impl Zlib {
    /// Codec with compression level `0..=9`.
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }

    fn fail(&self, err: std::io::Error) -> Error {
        Error::Codec {
            codec: self.id(),
            message: err.to_string(),
        }
    }
}

impl Default for Zlib {
    fn default() -> Self {
        Self {
            level: Compression::default(),
        }
    }
}

impl Codec for Zlib {
    fn id(&self) -> &'static str {
        "zlib"
    }

    fn compress(&self, raw: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), self.level);
        encoder.write_all(raw).map_err(|e| self.fail(e))?;
        encoder.finish().map_err(|e| self.fail(e))
    }

    fn decompress(&self, packed: &[u8], raw_len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.try_reserve_exact(raw_len)
            .map_err(|_| Error::AllocationFailure { bytes: raw_len })?;
        // Read one byte past the expected end so oversized streams are caught.
        ZlibDecoder::new(packed)
            .take(raw_len as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| self.fail(e))?;
        if out.len() != raw_len {
            return Err(Error::SizeMismatch {
                expected: raw_len,
                found: out.len(),
            });
        }
        Ok(out)
    }
}
