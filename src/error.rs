//! Crate-wide error type.
//!
//! Every precondition violation is fail-fast: a kernel checks shapes and axes
//! before it allocates its output, and the first violation aborts the call.

use std::io;
use std::path::PathBuf;

use crate::tensors::DType;

/// Errors surfaced by tensor construction, kernels and the weight loader.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("axis {axis} out of range for rank {rank}")]
    AxisOutOfRange { axis: isize, rank: usize },
    #[error("index {index} out of range for axis of size {size}")]
    IndexOutOfRange { index: i64, size: usize },
    #[error("type mismatch: expected {expected:?}, found {found:?}")]
    TypeMismatch { expected: DType, found: DType },
    #[error("size mismatch: expected {expected} elements/bytes, found {found}")]
    SizeMismatch { expected: usize, found: usize },
    #[error("failed to allocate {bytes} bytes")]
    AllocationFailure { bytes: usize },
    #[error("external buffer is not aligned to {align} bytes")]
    Misaligned { align: usize },
    #[error("no record named {0:?}")]
    MissingRecord(String),
    #[error("record {0:?} is compressed; decompress the dictionary first")]
    CompressedRecord(String),
    #[error("unsupported element type tag {0:?}")]
    UnsupportedType(String),
    #[error("cannot open {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("weight file truncated inside record {0:?}")]
    TruncatedFile(String),
    #[error("codec {codec}: {message}")]
    Codec { codec: &'static str, message: String },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Shorthand result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        Self::ShapeMismatch(msg.into())
    }
}

/// Resolves a possibly negative axis against `rank`.
pub(crate) fn normalize_axis(axis: isize, rank: usize) -> Result<usize> {
    let resolved = if axis < 0 { axis + rank as isize } else { axis };
    if resolved < 0 || resolved as usize >= rank {
        return Err(Error::AxisOutOfRange { axis, rank });
    }
    Ok(resolved as usize)
}
