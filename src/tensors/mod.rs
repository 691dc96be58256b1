//! Core tensor view type.
//!
//! # Views and buffers
//!
//! A [`Tensor`] is a typed, shaped window onto a reference-counted contiguous
//! buffer. It carries only three things: a handle to the buffer, the element
//! offset where the view begins and its shape (row-major, last axis fastest).
//! There are no strides. Every view is either the whole buffer or a
//! leading-axis-contiguous slice of it, so the element at multi-index
//! `(i0, .., iD-1)` lives at `offset + Σ ik · Π_{j>k} shape[j]`.
//!
//! - Fresh tensors ([`zeros`](Tensor::zeros), [`new`](Tensor::new),
//!   [`randn`](Tensor::randn)) own a new buffer exclusively.
//! - Derived views ([`sub`](Tensor::sub), [`contiguous`](Tensor::contiguous),
//!   [`expand`](Tensor::expand), [`unsqueeze`](Tensor::unsqueeze),
//!   [`reshape`](Tensor::reshape)) and `clone` share the parent's buffer and
//!   differ only in offset and shape.
//! - [`flatten`](Tensor::flatten), [`flip`](Tensor::flip) and
//!   [`argsort`](Tensor::argsort) materialise a new buffer.
//!
//! A buffer is released when its last view is dropped. Views hold no back
//! references, so there are no cycles.
//!
//! # Aliasing
//!
//! Writes through any view are visible through every other view of the same
//! buffer. [`data`](Tensor::data) and [`data_mut`](Tensor::data_mut) return
//! [`Ref`] and [`RefMut`] guards that borrow the whole buffer, not just the
//! view's region: any number of aliases may read at once, but a write
//! excludes every other access. A conflicting borrow panics, as with
//! `RefCell`, on any thread.
//!
//! Borrowed buffers are read-only. The first `data_mut` on a view of an
//! adopted buffer moves that view onto a private owned copy of its elements,
//! so the adopted memory is never written and other views of it are
//! unaffected.
//!
//! ## Example
//!
//! ```rust
//! use tensor4::tensors::Tensor;
//!
//! let t = Tensor::<f32>::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
//! let mut row = t.sub(1);
//! row.data_mut()[0] = 40.0;
//! assert_eq!(t.data()[3], 40.0);
//! ```

mod element;
mod print;
mod storage;

pub use self::element::{DType, Element, Float, Scalar};
pub use self::storage::{ExternalBuffer, Ref, RefMut};

use core::ptr::NonNull;
use std::sync::Arc;

use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use self::storage::{BorrowedBuffer, Storage};
use crate::error::{normalize_axis, Error, Result};
use crate::parallel;

/// Allocates `len` zeroed elements, reporting failure instead of aborting.
pub(crate) fn alloc_vec<T: Element>(len: usize) -> Result<Vec<T>> {
    let mut data = Vec::new();
    data.try_reserve_exact(len).map_err(|_| Error::AllocationFailure {
        bytes: len.saturating_mul(size_of::<T>()),
    })?;
    data.resize(len, T::zeroed());
    Ok(data)
}

/// Number of elements described by `shape`.
pub(crate) fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// An N-dimensional view onto a shared, contiguous buffer of `T`.
pub struct Tensor<T: Element> {
    storage: Storage<T>,
    offset: usize,
    shape: Vec<usize>,
}

/// Cloning a tensor creates another alias of the same buffer.
impl<T: Element> Clone for Tensor<T> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            offset: self.offset,
            shape: self.shape.clone(),
        }
    }
}

impl<T: Element> core::fmt::Debug for Tensor<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Tensor")
            .field("dtype", &T::DTYPE)
            .field("shape", &self.shape)
            .field("offset", &self.offset)
            .field("borrowed", &self.storage.is_borrowed())
            .finish()
    }
}

/// Two tensors are equal when shapes and elements match, wherever they live.
impl<T: Element> PartialEq for Tensor<T> {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape && *self.data() == *other.data()
    }
}

impl<T: Element> Tensor<T> {
    fn from_storage(storage: Storage<T>, offset: usize, shape: Vec<usize>) -> Self {
        Self {
            storage,
            offset,
            shape,
        }
    }

    /// Creates a tensor that takes ownership of `data` without copying it.
    ///
    /// # Errors
    ///
    /// [`Error::SizeMismatch`] if `data.len()` differs from the shape product.
    pub fn new(shape: impl Into<Vec<usize>>, data: Vec<T>) -> Result<Self> {
        let shape = shape.into();
        let expected = numel(&shape);
        if data.len() != expected {
            return Err(Error::SizeMismatch {
                expected,
                found: data.len(),
            });
        }
        Ok(Self::from_storage(Storage::owned(data), 0, shape))
    }

    /// Creates a tensor holding a copy of `data`.
    ///
    /// # Errors
    ///
    /// [`Error::SizeMismatch`] on a length mismatch, [`Error::AllocationFailure`]
    /// if the copy cannot be allocated.
    pub fn from_slice(shape: impl Into<Vec<usize>>, data: &[T]) -> Result<Self> {
        let shape = shape.into();
        let expected = numel(&shape);
        if data.len() != expected {
            return Err(Error::SizeMismatch {
                expected,
                found: data.len(),
            });
        }
        let mut owned = alloc_vec(expected)?;
        owned.copy_from_slice(data);
        Self::new(shape, owned)
    }

    /// Creates a zero-filled tensor with an exclusively owned buffer.
    ///
    /// # Errors
    ///
    /// [`Error::AllocationFailure`] if the buffer cannot be allocated.
    pub fn zeros(shape: impl Into<Vec<usize>>) -> Result<Self> {
        let shape = shape.into();
        let data = alloc_vec(numel(&shape))?;
        Ok(Self::from_storage(Storage::owned(data), 0, shape))
    }

    /// Creates a zero-filled tensor with the shape of `self`.
    ///
    /// # Errors
    ///
    /// [`Error::AllocationFailure`] if the buffer cannot be allocated.
    pub fn zeros_like(&self) -> Result<Self> {
        Self::zeros(self.shape.clone())
    }

    /// Creates a rank-0 tensor holding `value`.
    pub fn scalar(value: T) -> Self {
        Self::from_storage(Storage::owned(vec![value]), 0, Vec::new())
    }

    /// Wraps caller-owned memory as a tensor without copying.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `product(shape)` initialised, aligned elements that
    /// stay valid, and are neither written, freed nor moved, for as long as any
    /// view derived from the returned tensor is alive.
    pub unsafe fn from_raw_parts(shape: impl Into<Vec<usize>>, ptr: NonNull<T>) -> Self {
        let shape = shape.into();
        let len = numel(&shape);
        let buffer = BorrowedBuffer::new(ptr, len, None);
        Self::from_storage(Storage::Borrowed(Arc::new(buffer)), 0, shape)
    }

    /// Adopts an external byte block as a tensor without copying.
    ///
    /// The returned view, and every view derived from it, keeps `owner` alive.
    ///
    /// # Errors
    ///
    /// - [`Error::Misaligned`] if the block is not aligned for `T`.
    /// - [`Error::SizeMismatch`] if the block holds fewer bytes than the shape needs.
    pub fn adopt(shape: impl Into<Vec<usize>>, owner: Arc<dyn ExternalBuffer>) -> Result<Self> {
        let shape = shape.into();
        let len = numel(&shape);
        let ptr = owner.as_ptr();
        if ptr.as_ptr() as usize % align_of::<T>() != 0 {
            return Err(Error::Misaligned {
                align: align_of::<T>(),
            });
        }
        let needed = len * size_of::<T>();
        if owner.byte_len() < needed {
            return Err(Error::SizeMismatch {
                expected: needed,
                found: owner.byte_len(),
            });
        }
        let available = owner.byte_len() / size_of::<T>();
        let buffer = BorrowedBuffer::new(ptr.cast::<T>(), available, Some(owner));
        Ok(Self::from_storage(
            Storage::Borrowed(Arc::new(buffer)),
            0,
            shape,
        ))
    }

    /// Shape of the view.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of axes.
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements, the product of the shape.
    pub fn size(&self) -> usize {
        numel(&self.shape)
    }

    /// Element offset of this view inside its buffer.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Whether the buffer was adopted from external memory.
    pub fn is_borrowed(&self) -> bool {
        self.storage.is_borrowed()
    }

    /// Whether `self` and `other` are views of the same buffer.
    pub fn shares_buffer(&self, other: &Self) -> bool {
        self.storage.same_buffer(&other.storage)
    }

    /// Number of live views of this tensor's buffer.
    pub fn buffer_refs(&self) -> usize {
        self.storage.ref_count()
    }

    fn checked_region(&self) -> usize {
        let size = self.size();
        assert!(
            size == 0 || self.offset + size <= self.storage.len(),
            "view [{}, {}) exceeds buffer of {} elements",
            self.offset,
            self.offset + size,
            self.storage.len()
        );
        size
    }

    fn region_ptr(&self, size: usize) -> NonNull<T> {
        if size == 0 {
            return NonNull::dangling();
        }
        // SAFETY: `checked_region` put `offset + size` inside the buffer.
        unsafe { self.storage.ptr().add(self.offset) }
    }

    /// Elements of the view in row-major order.
    ///
    /// # Panics
    ///
    /// Panics if the view lies outside its buffer (an out-of-range `sub`), or
    /// if any alias of the buffer is currently borrowed mutably.
    pub fn data(&self) -> Ref<'_, T> {
        let size = self.checked_region();
        // SAFETY: the region is in bounds and initialised, and lives as long
        // as `self` holds the buffer.
        unsafe { Ref::new(self.region_ptr(size), size, self.storage.flag()) }
    }

    /// Mutable elements of the view in row-major order.
    ///
    /// A view of a borrowed buffer is first detached onto an owned copy.
    ///
    /// # Panics
    ///
    /// Panics if the view lies outside its buffer, or if any alias of the
    /// buffer is currently borrowed.
    pub fn data_mut(&mut self) -> RefMut<'_, T> {
        if self.storage.is_borrowed() {
            self.detach();
        }
        let size = self.checked_region();
        // SAFETY: as in `data`; owned buffers are writable.
        unsafe { RefMut::new(self.region_ptr(size), size, self.storage.flag()) }
    }

    fn detach(&mut self) {
        let copy = self.data().to_vec();
        tracing::debug!(len = copy.len(), "detaching view from borrowed buffer");
        self.storage = Storage::owned(copy);
        self.offset = 0;
    }

    /// Raw bytes of the view.
    pub fn as_bytes(&self) -> Ref<'_, u8> {
        Ref::map(self.data(), bytemuck::cast_slice::<T, u8>)
    }

    /// Copies the elements into a new `Vec`.
    pub fn to_vec(&self) -> Vec<T> {
        self.data().to_vec()
    }

    /// Sets every element to `value`.
    pub fn fill(&mut self, value: T) {
        self.data_mut().fill(value);
    }

    /// Copies the elements of `src` into `self`.
    ///
    /// Shapes may differ; only the element counts have to agree.
    ///
    /// # Errors
    ///
    /// [`Error::SizeMismatch`] if the element counts differ.
    pub fn assign(&mut self, src: &Tensor<T>) -> Result<()> {
        if src.size() != self.size() {
            return Err(Error::SizeMismatch {
                expected: self.size(),
                found: src.size(),
            });
        }
        if self.shares_buffer(src) || self.overlaps(src) {
            let staged = src.to_vec();
            self.data_mut().copy_from_slice(&staged);
        } else {
            let src = src.data();
            self.data_mut().copy_from_slice(&src);
        }
        Ok(())
    }

    fn overlaps(&self, other: &Tensor<T>) -> bool {
        let a = self.storage.ptr().as_ptr() as usize + self.offset * size_of::<T>();
        let b = other.storage.ptr().as_ptr() as usize + other.offset * size_of::<T>();
        let a_end = a + self.size() * size_of::<T>();
        let b_end = b + other.size() * size_of::<T>();
        a < b_end && b < a_end
    }

    /// Rank-1 alias over all elements of the view.
    pub fn contiguous(&self) -> Tensor<T> {
        Self::from_storage(self.storage.clone(), self.offset, vec![self.size()])
    }

    /// Alias of slice `n` along the leading axis; the result has one axis less.
    ///
    /// `n` is not validated here. An out-of-range index yields a view whose
    /// element access panics.
    ///
    /// # Panics
    ///
    /// Panics if the tensor has rank 0.
    pub fn sub(&self, n: usize) -> Tensor<T> {
        assert!(!self.shape.is_empty(), "sub() on a rank-0 tensor");
        let shape = self.shape[1..].to_vec();
        let offset = self.offset + n * numel(&shape);
        Self::from_storage(self.storage.clone(), offset, shape)
    }

    /// Alias of slice `(n1, n2)` along the two leading axes.
    ///
    /// # Panics
    ///
    /// Panics if the tensor has rank below 2.
    pub fn sub2(&self, n1: usize, n2: usize) -> Tensor<T> {
        assert!(self.shape.len() >= 2, "sub2() needs rank >= 2");
        let shape = self.shape[2..].to_vec();
        let inner = numel(&shape);
        let offset = self.offset + n1 * self.shape[1] * inner + n2 * inner;
        Self::from_storage(self.storage.clone(), offset, shape)
    }

    /// Alias with a leading axis of size 1 prepended.
    pub fn expand(&self) -> Tensor<T> {
        let mut shape = Vec::with_capacity(self.rank() + 1);
        shape.push(1);
        shape.extend_from_slice(&self.shape);
        Self::from_storage(self.storage.clone(), self.offset, shape)
    }

    /// Alias with a size-1 axis inserted at `dim`.
    ///
    /// # Errors
    ///
    /// [`Error::AxisOutOfRange`] if `dim > rank`.
    pub fn unsqueeze(&self, dim: usize) -> Result<Tensor<T>> {
        if dim > self.rank() {
            return Err(Error::AxisOutOfRange {
                axis: dim as isize,
                rank: self.rank(),
            });
        }
        let mut shape = self.shape.clone();
        shape.insert(dim, 1);
        Ok(Self::from_storage(self.storage.clone(), self.offset, shape))
    }

    /// Alias with a new shape over the same elements.
    ///
    /// At most one entry may be `-1`; it is resolved from the element count.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] on more than one wildcard, a negative size
    /// other than `-1`, or an element count that does not match.
    pub fn reshape(&self, shape: &[isize]) -> Result<Tensor<T>> {
        let mut wildcard = None;
        let mut known = 1usize;
        for (i, &dim) in shape.iter().enumerate() {
            match dim {
                -1 if wildcard.is_none() => wildcard = Some(i),
                -1 => return Err(Error::shape("reshape allows a single -1 axis")),
                d if d < 0 => return Err(Error::shape(format!("invalid reshape size {d}"))),
                d => known *= d as usize,
            }
        }

        let size = self.size();
        let mut resolved: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
        if let Some(i) = wildcard {
            if known == 0 || size % known != 0 {
                return Err(Error::shape(format!(
                    "cannot infer -1 axis: {size} elements over {known}"
                )));
            }
            resolved[i] = size / known;
        }
        if numel(&resolved) != size {
            return Err(Error::shape(format!(
                "reshape {:?} -> {:?} changes the element count",
                self.shape, resolved
            )));
        }
        Ok(Self::from_storage(self.storage.clone(), self.offset, resolved))
    }

    /// Copies the tensor into a 2-D tensor collapsing axes `[0, d)` into rows
    /// and `[d, rank)` into columns.
    ///
    /// # Errors
    ///
    /// [`Error::AxisOutOfRange`] if `d > rank`.
    pub fn flatten(&self, d: usize) -> Result<Tensor<T>> {
        if d > self.rank() {
            return Err(Error::AxisOutOfRange {
                axis: d as isize,
                rank: self.rank(),
            });
        }
        let rows = numel(&self.shape[..d]);
        let cols = numel(&self.shape[d..]);
        Tensor::from_slice(vec![rows, cols], &self.data())
    }

    /// Copy of the tensor with elements reversed along `axis`.
    ///
    /// Negative axes count from the end.
    ///
    /// # Errors
    ///
    /// [`Error::AxisOutOfRange`] for an invalid axis.
    #[tracing::instrument(skip_all, level = "debug")]
    pub fn flip(&self, axis: isize) -> Result<Tensor<T>> {
        let axis = normalize_axis(axis, self.rank())?;
        let count = self.shape[axis];
        let stride = numel(&self.shape[axis + 1..]);
        let src: &[T] = &self.data();
        let mut out = alloc_vec::<T>(src.len())?;

        parallel::for_each_chunk_mut(&mut out, count * stride, |block, dst| {
            let src = &src[block * count * stride..][..count * stride];
            for j in 0..count {
                let from = (count - 1 - j) * stride;
                dst[j * stride..(j + 1) * stride].copy_from_slice(&src[from..from + stride]);
            }
        });
        Tensor::new(self.shape.clone(), out)
    }

    /// For every 1-D slice along `axis`, the permutation of indices that sorts
    /// the slice ascending.
    ///
    /// The sort is unstable: equal elements may come out in any relative
    /// order. Incomparable values (NaN) compare as equal.
    ///
    /// # Errors
    ///
    /// [`Error::AxisOutOfRange`] for an invalid axis,
    /// [`Error::AllocationFailure`] if output or scratch cannot be allocated.
    #[tracing::instrument(skip_all, level = "debug")]
    pub fn argsort(&self, axis: isize) -> Result<Tensor<i64>> {
        let axis = normalize_axis(axis, self.rank())?;
        let count = self.shape[axis];
        let stride = numel(&self.shape[axis + 1..]);
        let src: &[T] = &self.data();
        let mut out = alloc_vec::<i64>(src.len())?;

        parallel::for_each_chunk_mut_with_scratch::<_, i64, _>(
            &mut out,
            count * stride,
            count,
            |block, dst, order| {
                let base = &src[block * count * stride..][..count * stride];
                for s in 0..stride {
                    for (j, o) in order.iter_mut().enumerate() {
                        *o = j as i64;
                    }
                    order.sort_unstable_by(|&a, &b| {
                        base[a as usize * stride + s]
                            .partial_cmp(&base[b as usize * stride + s])
                            .unwrap_or(core::cmp::Ordering::Equal)
                    });
                    for (j, &o) in order.iter().enumerate() {
                        dst[j * stride + s] = o;
                    }
                }
            },
        )?;
        Tensor::new(self.shape.clone(), out)
    }
}

impl<T: Float> Tensor<T> {
    /// Tensor of unit-normal samples from the thread-local generator.
    ///
    /// # Errors
    ///
    /// [`Error::AllocationFailure`] if the buffer cannot be allocated.
    pub fn randn(shape: impl Into<Vec<usize>>) -> Result<Self> {
        Self::randn_with(shape, &mut rand::rng())
    }

    /// Tensor of unit-normal samples drawn from `rng`.
    ///
    /// # Errors
    ///
    /// [`Error::AllocationFailure`] if the buffer cannot be allocated.
    pub fn randn_with<R: Rng + ?Sized>(shape: impl Into<Vec<usize>>, rng: &mut R) -> Result<Self> {
        let shape = shape.into();
        let mut data = alloc_vec::<T>(numel(&shape))?;
        for x in &mut data {
            let sample: f64 = StandardNormal.sample(rng);
            *x = T::from_f64(sample);
        }
        Self::new(shape, data)
    }
}
