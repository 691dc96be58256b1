//! Loading and saving of network weights.
//!
//! # Weight File Format
//!
//! A weight file is a plain sequence of records, read until end of file.
//! There is no header and no record count. Integers are little-endian.
//!
//! ```text
//! ┌──────────────┬────────┬──────────┬─────────────┬──────────┬─────────────────┬─────────┐
//! │ name         │ type   │ rank: u8 │ dims        │ size     │ compressed_size │ payload │
//! │ NUL-ended    │ [u8;5] │ (<= 4)   │ [u32; rank] │ u64      │ u64 (0 = raw)   │ bytes   │
//! └──────────────┴────────┴──────────┴─────────────┴──────────┴─────────────────┴─────────┘
//! ```
//!
//! - `type` is one of `float`, `doubl`, `int32`, `int16`.
//! - Dimensions beyond `rank` are implicitly 1.
//! - `size` is the uncompressed payload size in bytes and must equal
//!   `element_size(type) * product(dims)`.
//! - The payload holds `compressed_size` bytes when that is non-zero,
//!   `size` bytes otherwise.
//!
//! # Zero-copy access
//!
//! Every payload is read into its own 8-byte aligned block. [`ModelDict::tensor`]
//! adopts that block as a borrowed tensor buffer, so the returned view and the
//! dictionary share memory and the block lives as long as either of them.
//! The block is read-only: writing through a loaded tensor moves that view
//! onto its own copy and leaves the record untouched.
//!
//! # Example
//!
//! ```rust
//! use tensor4::modelio::ModelDict;
//! use tensor4::tensors::Tensor;
//!
//! fn main() -> tensor4::Result<()> {
//!     let weight = Tensor::<f32>::new(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0])?;
//!
//!     let mut dict = ModelDict::new();
//!     dict.insert("fc.weight", &weight)?;
//!
//!     let mut bytes = Vec::new();
//!     dict.write_to(&mut bytes)?;
//!
//!     let loaded = ModelDict::read_from(bytes.as_slice())?;
//!     assert_eq!(loaded.tensor::<f32>("fc.weight", &[2, 2])?, weight);
//!     Ok(())
//! }
//! ```

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;

use briny::prelude::{TrustedData, Validate, ValidationError};
use tracing::{debug, info};

use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::tensors::{DType, Element, ExternalBuffer, Tensor};

/// Highest rank a record can declare.
pub const MAX_RANK: usize = 4;

/// An 8-byte aligned byte block holding one record payload.
pub struct Payload {
    words: Box<[u64]>,
    len: usize,
}

impl Payload {
    fn zeroed(len: usize) -> Result<Self> {
        let count = len.div_ceil(8);
        let mut words = Vec::new();
        words
            .try_reserve_exact(count)
            .map_err(|_| Error::AllocationFailure { bytes: len })?;
        words.resize(count, 0u64);
        Ok(Self {
            words: words.into_boxed_slice(),
            len,
        })
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut payload = Self::zeroed(bytes.len())?;
        payload.bytes_mut().copy_from_slice(bytes);
        Ok(payload)
    }

    /// Payload contents.
    pub fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.words[..])[..self.len]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.words[..])[..self.len]
    }
}

impl ExternalBuffer for Payload {
    fn as_ptr(&self) -> NonNull<u8> {
        NonNull::from(&*self.words).cast::<u8>()
    }

    fn byte_len(&self) -> usize {
        self.len
    }
}

/// One named weight.
#[derive(Clone)]
pub struct Record {
    dtype: DType,
    rank: u8,
    dims: [u32; MAX_RANK],
    size: u64,
    compressed_size: u64,
    payload: Arc<Payload>,
}

impl core::fmt::Debug for Record {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Record")
            .field("dtype", &self.dtype)
            .field("shape", &self.shape())
            .field("size", &self.size)
            .field("compressed_size", &self.compressed_size)
            .finish()
    }
}

impl Record {
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Declared shape, `rank` entries long.
    pub fn shape(&self) -> Vec<usize> {
        self.dims[..self.rank as usize]
            .iter()
            .map(|&d| d as usize)
            .collect()
    }

    /// Uncompressed payload size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn compressed_size(&self) -> u64 {
        self.compressed_size
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed_size != 0
    }

    /// Stored payload, compressed or not.
    pub fn bytes(&self) -> &[u8] {
        self.payload.bytes()
    }

    /// `None` when the declared dims overflow a byte count.
    fn expected_size(&self) -> Option<u64> {
        declared_size(self.dtype, &self.dims)
    }

    fn stored_len(&self) -> u64 {
        if self.is_compressed() {
            self.compressed_size
        } else {
            self.size
        }
    }
}

impl Validate for Record {
    fn validate(&self) -> core::result::Result<(), ValidationError> {
        if self.rank as usize > MAX_RANK || self.expected_size() != Some(self.size) {
            return Err(ValidationError);
        }
        if self.payload.len as u64 != self.stored_len() {
            return Err(ValidationError);
        }
        Ok(())
    }
}

fn declared_size(dtype: DType, dims: &[u32; MAX_RANK]) -> Option<u64> {
    dims.iter()
        .try_fold(dtype.size() as u64, |acc, &d| acc.checked_mul(u64::from(d)))
}

fn size_mismatch(expected: Option<u64>, found: u64) -> Error {
    let clamp = |n: u64| usize::try_from(n).unwrap_or(usize::MAX);
    Error::SizeMismatch {
        expected: expected.map_or(usize::MAX, clamp),
        found: clamp(found),
    }
}

/// Validates `record`, reporting a declared-vs-actual size mismatch.
fn trusted(record: Record) -> Result<Record> {
    let (expected, found) = (record.expected_size(), record.size);
    TrustedData::new(record)
        .map(TrustedData::into_inner)
        .map_err(|_| size_mismatch(expected, found))
}

/// Name-ordered collection of weight records.
#[derive(Debug, Clone, Default)]
pub struct ModelDict {
    records: BTreeMap<String, Record>,
}

impl ModelDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record names in ascending order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&Record> {
        self.records.get(name)
    }

    /// Reads a weight file.
    ///
    /// # Errors
    ///
    /// - [`Error::Open`] if the file cannot be opened.
    /// - [`Error::TruncatedFile`] if it ends inside a record.
    /// - [`Error::UnsupportedType`], [`Error::ShapeMismatch`] or
    ///   [`Error::SizeMismatch`] for a malformed record header.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| Error::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let dict = Self::read_from(BufReader::new(file))?;
        info!(path = %path.display(), records = dict.len(), "loaded weight file");
        Ok(dict)
    }

    /// Reads records from `reader` until a clean end of input.
    ///
    /// # Errors
    ///
    /// Same as [`load`](Self::load), minus [`Error::Open`].
    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let mut dict = Self::new();
        while let Some((name, record)) = read_record(&mut reader)? {
            debug!(name = %name, record = ?record, "read weight record");
            dict.records.insert(name, record);
        }
        Ok(dict)
    }

    /// Writes a weight file, replacing any existing file at `path`.
    ///
    /// # Errors
    ///
    /// [`Error::Open`] if the file cannot be created, [`Error::Io`] on write
    /// failure.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|source| Error::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let mut writer = BufWriter::new(file);
        self.write_to(&mut writer)?;
        writer.flush()?;
        info!(path = %path.display(), records = self.len(), "saved weight file");
        Ok(())
    }

    /// Serialises every record, in name order.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] on write failure.
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        for (name, record) in &self.records {
            writer.write_all(name.as_bytes())?;
            writer.write_all(&[0])?;
            let tag = record
                .dtype
                .tag()
                .ok_or_else(|| Error::UnsupportedType(format!("{:?}", record.dtype)))?;
            writer.write_all(tag)?;
            writer.write_all(&[record.rank])?;
            for dim in &record.dims[..record.rank as usize] {
                writer.write_all(&dim.to_le_bytes())?;
            }
            writer.write_all(&record.size.to_le_bytes())?;
            writer.write_all(&record.compressed_size.to_le_bytes())?;
            writer.write_all(record.bytes())?;
        }
        Ok(())
    }

    /// Adds or replaces `name` with a copy of `tensor`.
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedType`] if `T` has no file tag,
    /// [`Error::ShapeMismatch`] for ranks above [`MAX_RANK`] or dimensions
    /// beyond `u32`, or if `name` contains a NUL byte.
    pub fn insert<T: Element>(&mut self, name: &str, tensor: &Tensor<T>) -> Result<()> {
        if name.as_bytes().contains(&0) {
            return Err(Error::shape(format!("record name {name:?} contains NUL")));
        }
        if T::DTYPE.tag().is_none() {
            return Err(Error::UnsupportedType(format!("{:?}", T::DTYPE)));
        }
        let dims = padded_dims(tensor.shape())?;
        let bytes = tensor.as_bytes();
        let record = Record {
            dtype: T::DTYPE,
            rank: tensor.rank() as u8,
            dims,
            size: bytes.len() as u64,
            compressed_size: 0,
            payload: Arc::new(Payload::from_bytes(&bytes)?),
        };
        self.records.insert(name.to_owned(), trusted(record)?);
        Ok(())
    }

    /// Returns record `name` as a `[shape]` tensor of `T` that borrows the
    /// record payload without copying.
    ///
    /// # Errors
    ///
    /// - [`Error::MissingRecord`] if there is no such record.
    /// - [`Error::TypeMismatch`] if the record holds another element type.
    /// - [`Error::CompressedRecord`] if the payload still needs its codec.
    /// - [`Error::ShapeMismatch`] if `shape` differs from the declared shape
    ///   (trailing implicit 1s are ignored).
    pub fn tensor<T: Element>(&self, name: &str, shape: &[usize]) -> Result<Tensor<T>> {
        let record = self
            .records
            .get(name)
            .ok_or_else(|| Error::MissingRecord(name.to_owned()))?;
        if record.dtype != T::DTYPE {
            return Err(Error::TypeMismatch {
                expected: T::DTYPE,
                found: record.dtype,
            });
        }
        if record.is_compressed() {
            return Err(Error::CompressedRecord(name.to_owned()));
        }
        if padded_dims(shape)? != record.dims {
            return Err(Error::shape(format!(
                "record {name:?} has shape {:?}, requested {shape:?}",
                record.shape()
            )));
        }
        let owner: Arc<dyn ExternalBuffer> = record.payload.clone();
        Tensor::adopt(shape.to_vec(), owner)
    }

    /// Compresses every raw record with `codec`.
    ///
    /// # Errors
    ///
    /// [`Error::Codec`] if the codec fails.
    pub fn compress(mut self, codec: &impl Codec) -> Result<Self> {
        for (name, record) in &mut self.records {
            if record.is_compressed() {
                continue;
            }
            let packed = codec.compress(record.bytes())?;
            debug!(name = %name, raw = record.size, packed = packed.len(), codec = codec.id(), "compressed record");
            record.compressed_size = packed.len() as u64;
            record.payload = Arc::new(Payload::from_bytes(&packed)?);
        }
        Ok(self)
    }

    /// Expands every compressed record with `codec`.
    ///
    /// # Errors
    ///
    /// [`Error::Codec`] on corrupt data, [`Error::SizeMismatch`] if a record
    /// does not expand to its declared size.
    pub fn decompress(mut self, codec: &impl Codec) -> Result<Self> {
        for (name, record) in &mut self.records {
            if !record.is_compressed() {
                continue;
            }
            let raw = codec.decompress(record.bytes(), record.size as usize)?;
            debug!(name = %name, codec = codec.id(), "decompressed record");
            record.compressed_size = 0;
            record.payload = Arc::new(Payload::from_bytes(&raw)?);
        }
        Ok(self)
    }
}

fn padded_dims(shape: &[usize]) -> Result<[u32; MAX_RANK]> {
    if shape.len() > MAX_RANK {
        return Err(Error::shape(format!(
            "weight records hold at most {MAX_RANK} axes, got {shape:?}"
        )));
    }
    let mut dims = [1u32; MAX_RANK];
    for (dst, &d) in dims.iter_mut().zip(shape) {
        *dst = u32::try_from(d).map_err(|_| Error::shape(format!("dimension {d} exceeds u32")))?;
    }
    Ok(dims)
}

/// Maps end-of-input inside record `name` to [`Error::TruncatedFile`].
fn read_field<R: Read>(reader: &mut R, buf: &mut [u8], name: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::TruncatedFile(name.to_owned()),
        _ => Error::Io(e),
    })
}

fn read_name<R: Read>(reader: &mut R) -> Result<Option<String>> {
    let mut name = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) if name.is_empty() => return Ok(None),
            Ok(0) => {
                return Err(Error::TruncatedFile(
                    String::from_utf8_lossy(&name).into_owned(),
                ))
            }
            Ok(_) if byte[0] == 0 => break,
            Ok(_) => name.push(byte[0]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(Some(String::from_utf8_lossy(&name).into_owned()))
}

fn read_record<R: Read>(reader: &mut R) -> Result<Option<(String, Record)>> {
    let Some(name) = read_name(reader)? else {
        return Ok(None);
    };

    let mut tag = [0u8; 5];
    read_field(reader, &mut tag, &name)?;
    let dtype = DType::from_tag(&tag)
        .ok_or_else(|| Error::UnsupportedType(String::from_utf8_lossy(&tag).into_owned()))?;

    let mut rank = [0u8; 1];
    read_field(reader, &mut rank, &name)?;
    let rank = rank[0];
    if rank as usize > MAX_RANK {
        return Err(Error::shape(format!(
            "record {name:?} declares rank {rank}, at most {MAX_RANK} supported"
        )));
    }

    let mut dims = [1u32; MAX_RANK];
    let mut word = [0u8; 4];
    for dim in dims.iter_mut().take(rank as usize) {
        read_field(reader, &mut word, &name)?;
        *dim = u32::from_le_bytes(word);
    }

    let mut long = [0u8; 8];
    read_field(reader, &mut long, &name)?;
    let size = u64::from_le_bytes(long);
    read_field(reader, &mut long, &name)?;
    let compressed_size = u64::from_le_bytes(long);

    let expected = declared_size(dtype, &dims);
    if expected != Some(size) {
        return Err(size_mismatch(expected, size));
    }
    let stored = if compressed_size != 0 { compressed_size } else { size };
    let stored = usize::try_from(stored).map_err(|_| Error::AllocationFailure { bytes: usize::MAX })?;
    let mut payload = Payload::zeroed(stored)?;
    read_field(reader, payload.bytes_mut(), &name)?;

    let record = Record {
        dtype,
        rank,
        dims,
        size,
        compressed_size,
        payload: Arc::new(payload),
    };
    Ok(Some((name, trusted(record)?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Zlib;

    fn record_bytes(name: &str, tag: &[u8; 5], dims: &[u32], size: u64, payload: &[u8]) -> Vec<u8> {
        let mut out = name.as_bytes().to_vec();
        out.push(0);
        out.extend_from_slice(tag);
        out.push(dims.len() as u8);
        for d in dims {
            out.extend_from_slice(&d.to_le_bytes());
        }
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn reads_records_until_eof() {
        let mut file = record_bytes("a", b"int16", &[3], 6, &[1, 0, 2, 0, 3, 0]);
        file.extend(record_bytes("b", b"doubl", &[1], 8, &2.5f64.to_le_bytes()));
        let dict = ModelDict::read_from(file.as_slice()).unwrap();
        assert_eq!(dict.names().collect::<Vec<_>>(), ["a", "b"]);
        assert_eq!(dict.tensor::<i16>("a", &[3]).unwrap().data(), &[1, 2, 3]);
        assert_eq!(dict.tensor::<f64>("b", &[1]).unwrap().data(), &[2.5]);
    }

    #[test]
    fn empty_input_is_an_empty_dict() {
        assert!(ModelDict::read_from(&[][..]).unwrap().is_empty());
    }

    #[test]
    fn truncation_is_reported_with_the_record_name() {
        let file = record_bytes("conv", b"float", &[2], 8, &[0; 8]);
        for cut in [2, 7, 12, file.len() - 1] {
            let err = ModelDict::read_from(&file[..cut]).unwrap_err();
            assert!(matches!(err, Error::TruncatedFile(_)), "cut {cut}: {err}");
        }
        assert!(matches!(
            ModelDict::read_from(&file[..file.len() - 1]),
            Err(Error::TruncatedFile(name)) if name == "conv"
        ));
    }

    #[test]
    fn malformed_headers_are_rejected() {
        let bad_size = record_bytes("w", b"float", &[2], 4, &[0; 4]);
        assert!(matches!(
            ModelDict::read_from(bad_size.as_slice()),
            Err(Error::SizeMismatch { expected: 8, found: 4 })
        ));
        let overflow = record_bytes("w", b"float", &[u32::MAX; 4], 4, &[0; 4]);
        assert!(matches!(
            ModelDict::read_from(overflow.as_slice()),
            Err(Error::SizeMismatch { expected: usize::MAX, found: 4 })
        ));
        let bad_tag = record_bytes("w", b"half_", &[1], 2, &[0; 2]);
        assert!(matches!(
            ModelDict::read_from(bad_tag.as_slice()),
            Err(Error::UnsupportedType(_))
        ));
    }

    #[test]
    fn typed_access_checks_type_shape_and_presence() {
        let mut dict = ModelDict::new();
        dict.insert("w", &Tensor::<f32>::zeros(vec![2, 3]).unwrap()).unwrap();
        assert!(matches!(dict.tensor::<f32>("x", &[2, 3]), Err(Error::MissingRecord(_))));
        assert!(matches!(dict.tensor::<i32>("w", &[2, 3]), Err(Error::TypeMismatch { .. })));
        assert!(matches!(dict.tensor::<f32>("w", &[3, 2]), Err(Error::ShapeMismatch(_))));
        assert_eq!(dict.tensor::<f32>("w", &[2, 3, 1]).unwrap().shape(), &[2, 3, 1]);
        assert!(dict.insert("i64", &Tensor::<i64>::zeros(vec![1]).unwrap()).is_err());
        assert!(dict.insert("big", &Tensor::<f32>::zeros(vec![1; 5]).unwrap()).is_err());
    }

    #[test]
    fn loaded_tensors_borrow_the_payload() {
        let mut dict = ModelDict::new();
        dict.insert("w", &Tensor::<i32>::new(vec![2], vec![7, 8]).unwrap()).unwrap();
        let t = dict.tensor::<i32>("w", &[2]).unwrap();
        assert!(t.is_borrowed());
        assert_eq!(t.as_bytes().as_ptr(), dict.get("w").unwrap().bytes().as_ptr());
        drop(dict);
        assert_eq!(t.data(), &[7, 8]);
    }

    #[test]
    fn writing_a_loaded_tensor_leaves_the_record_intact() {
        let mut dict = ModelDict::new();
        dict.insert("w", &Tensor::<i32>::new(vec![2], vec![7, 8]).unwrap()).unwrap();
        let mut t = dict.tensor::<i32>("w", &[2]).unwrap();
        t.data_mut()[0] = 9;

        assert!(!t.is_borrowed());
        assert_eq!(t.data(), &[9, 8]);
        assert_eq!(dict.get("w").unwrap().bytes(), &[7, 0, 0, 0, 8, 0, 0, 0]);
        assert_eq!(dict.tensor::<i32>("w", &[2]).unwrap().data(), &[7, 8]);
    }

    #[test]
    fn compression_round_trips_through_the_file_format() {
        let weight = Tensor::<f32>::new(vec![64], vec![0.5; 64]).unwrap();
        let mut dict = ModelDict::new();
        dict.insert("w", &weight).unwrap();
        let packed = dict.compress(&Zlib::default()).unwrap();
        assert!(packed.get("w").unwrap().is_compressed());
        assert!(matches!(packed.tensor::<f32>("w", &[64]), Err(Error::CompressedRecord(_))));

        let mut bytes = Vec::new();
        packed.write_to(&mut bytes).unwrap();
        let reread = ModelDict::read_from(bytes.as_slice()).unwrap();
        let raw = reread.decompress(&Zlib::default()).unwrap();
        assert_eq!(raw.tensor::<f32>("w", &[64]).unwrap(), weight);
    }
}
