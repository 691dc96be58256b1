//! Shared buffers behind tensor views.
//!
//! A buffer is either `Owned` (allocated by this crate, freed when the last
//! view referencing it is dropped) or `Borrowed` (memory supplied from
//! outside and adopted without a copy). Both are reference counted so that
//! every view derived from a buffer keeps it alive.
//!
//! Element access goes through [`Ref`] and [`RefMut`] guards. Each buffer
//! carries one atomic borrow flag shared by all of its views: any number of
//! readers, or a single writer. A conflicting borrow panics instead of
//! handing out aliasing slices. Borrowed buffers are never written; the view
//! layer copies them out before the first write.

use core::fmt;
use core::marker::PhantomData;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;

/// Externally owned bytes that can be adopted as a tensor buffer.
///
/// Implementors promise that the memory behind [`as_ptr`](Self::as_ptr)
/// stays valid, and does not move, for as long as the implementor is alive.
/// A borrowed buffer holds an `Arc` to its owner, which pins that lifetime.
/// The memory is only ever read through the adopted tensor.
pub trait ExternalBuffer: Send + Sync + 'static {
    /// Start of the block.
    fn as_ptr(&self) -> NonNull<u8>;

    /// Length of the block in bytes.
    fn byte_len(&self) -> usize;
}

/// Reader count (`> 0`) or the writer marker (`-1`).
#[derive(Default)]
pub(crate) struct BorrowFlag(AtomicIsize);

const WRITING: isize = -1;

impl BorrowFlag {
    fn acquire_shared(&self) {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            assert!(current != WRITING, "tensor buffer already mutably borrowed");
            match self.0.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(seen) => current = seen,
            }
        }
    }

    fn acquire_exclusive(&self) {
        let taken = self
            .0
            .compare_exchange(0, WRITING, Ordering::Acquire, Ordering::Relaxed);
        assert!(taken.is_ok(), "tensor buffer already borrowed");
    }

    fn release_shared(&self) {
        self.0.fetch_sub(1, Ordering::Release);
    }

    fn release_exclusive(&self) {
        self.0.store(0, Ordering::Release);
    }
}

/// Shared borrow of a view's elements.
///
/// Derefs to `&[T]`. While it lives, no alias of the same buffer can be
/// borrowed mutably.
pub struct Ref<'a, T> {
    data: NonNull<[T]>,
    flag: &'a BorrowFlag,
    _marker: PhantomData<&'a [T]>,
}

// SAFETY: a `Ref` behaves like `&[T]`.
unsafe impl<T: Sync> Send for Ref<'_, T> {}
unsafe impl<T: Sync> Sync for Ref<'_, T> {}

impl<'a, T> Ref<'a, T> {
    /// Takes a shared borrow of `len` elements at `ptr`.
    ///
    /// # Safety
    ///
    /// The elements must be initialised and live for `'a`, and every write to
    /// them must hold an exclusive borrow of `flag`.
    pub(crate) unsafe fn new(ptr: NonNull<T>, len: usize, flag: &'a BorrowFlag) -> Self {
        flag.acquire_shared();
        Self {
            data: NonNull::slice_from_raw_parts(ptr, len),
            flag,
            _marker: PhantomData,
        }
    }

    /// Narrows or reinterprets the borrowed slice, keeping the borrow.
    pub fn map<U, F>(orig: Self, f: F) -> Ref<'a, U>
    where
        F: FnOnce(&[T]) -> &[U],
    {
        let orig = ManuallyDrop::new(orig);
        // SAFETY: the shared borrow taken in `new` is still held.
        let mapped = NonNull::from(f(unsafe { orig.data.as_ref() }));
        Ref {
            data: mapped,
            flag: orig.flag,
            _marker: PhantomData,
        }
    }
}

impl<T> Deref for Ref<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: writers are excluded by the shared borrow.
        unsafe { self.data.as_ref() }
    }
}

impl<T> Drop for Ref<'_, T> {
    fn drop(&mut self) {
        self.flag.release_shared();
    }
}

impl<T: fmt::Debug> fmt::Debug for Ref<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: PartialEq<U>, U> PartialEq<Ref<'_, U>> for Ref<'_, T> {
    fn eq(&self, other: &Ref<'_, U>) -> bool {
        **self == **other
    }
}

impl<T, U: ?Sized> PartialEq<&U> for Ref<'_, T>
where
    [T]: PartialEq<U>,
{
    fn eq(&self, other: &&U) -> bool {
        **self == **other
    }
}

/// Exclusive borrow of a view's elements.
///
/// Derefs to `&mut [T]`. While it lives, no other borrow of the same buffer
/// can be taken through any alias.
pub struct RefMut<'a, T> {
    data: NonNull<[T]>,
    flag: &'a BorrowFlag,
    _marker: PhantomData<&'a mut [T]>,
}

// SAFETY: a `RefMut` behaves like `&mut [T]`.
unsafe impl<T: Send> Send for RefMut<'_, T> {}
unsafe impl<T: Sync> Sync for RefMut<'_, T> {}

impl<'a, T> RefMut<'a, T> {
    /// Takes an exclusive borrow of `len` elements at `ptr`.
    ///
    /// # Safety
    ///
    /// As for [`Ref::new`], and the memory must be writable.
    pub(crate) unsafe fn new(ptr: NonNull<T>, len: usize, flag: &'a BorrowFlag) -> Self {
        flag.acquire_exclusive();
        Self {
            data: NonNull::slice_from_raw_parts(ptr, len),
            flag,
            _marker: PhantomData,
        }
    }
}

impl<T> Deref for RefMut<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: the exclusive borrow excludes every other access.
        unsafe { self.data.as_ref() }
    }
}

impl<T> DerefMut for RefMut<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        // SAFETY: as in `deref`.
        unsafe { self.data.as_mut() }
    }
}

impl<T> Drop for RefMut<'_, T> {
    fn drop(&mut self) {
        self.flag.release_exclusive();
    }
}

impl<T: fmt::Debug> fmt::Debug for RefMut<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

pub(crate) struct OwnedBuffer<T> {
    ptr: NonNull<T>,
    len: usize,
    flag: BorrowFlag,
}

// SAFETY: element access is serialised by `flag`.
unsafe impl<T: Send + Sync> Send for OwnedBuffer<T> {}
unsafe impl<T: Send + Sync> Sync for OwnedBuffer<T> {}

impl<T> OwnedBuffer<T> {
    pub(crate) fn from_vec(data: Vec<T>) -> Self {
        let boxed = data.into_boxed_slice();
        let len = boxed.len();
        let ptr = NonNull::from(Box::leak(boxed)).cast::<T>();
        Self {
            ptr,
            len,
            flag: BorrowFlag::default(),
        }
    }
}

impl<T> Drop for OwnedBuffer<T> {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` came from `Box::leak` in `from_vec`.
        unsafe {
            drop(Box::from_raw(core::ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.len,
            )));
        }
    }
}

pub(crate) struct BorrowedBuffer<T> {
    ptr: NonNull<T>,
    len: usize,
    flag: BorrowFlag,
    // `None` for raw adoption, where the caller manages the lifetime.
    _keepalive: Option<Arc<dyn ExternalBuffer>>,
}

// SAFETY: read-only memory; the keep-alive is itself `Send + Sync`.
unsafe impl<T: Send + Sync> Send for BorrowedBuffer<T> {}
unsafe impl<T: Send + Sync> Sync for BorrowedBuffer<T> {}

impl<T> BorrowedBuffer<T> {
    pub(crate) fn new(ptr: NonNull<T>, len: usize, keepalive: Option<Arc<dyn ExternalBuffer>>) -> Self {
        Self {
            ptr,
            len,
            flag: BorrowFlag::default(),
            _keepalive: keepalive,
        }
    }
}

/// Ownership tag of a tensor buffer.
pub(crate) enum Storage<T> {
    Owned(Arc<OwnedBuffer<T>>),
    Borrowed(Arc<BorrowedBuffer<T>>),
}

impl<T> Clone for Storage<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Owned(b) => Self::Owned(Arc::clone(b)),
            Self::Borrowed(b) => Self::Borrowed(Arc::clone(b)),
        }
    }
}

impl<T> Storage<T> {
    pub(crate) fn owned(data: Vec<T>) -> Self {
        Self::Owned(Arc::new(OwnedBuffer::from_vec(data)))
    }

    pub(crate) fn ptr(&self) -> NonNull<T> {
        match self {
            Self::Owned(b) => b.ptr,
            Self::Borrowed(b) => b.ptr,
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Self::Owned(b) => b.len,
            Self::Borrowed(b) => b.len,
        }
    }

    pub(crate) fn flag(&self) -> &BorrowFlag {
        match self {
            Self::Owned(b) => &b.flag,
            Self::Borrowed(b) => &b.flag,
        }
    }

    pub(crate) fn is_borrowed(&self) -> bool {
        matches!(self, Self::Borrowed(_))
    }

    /// Number of views currently sharing this buffer.
    pub(crate) fn ref_count(&self) -> usize {
        match self {
            Self::Owned(b) => Arc::strong_count(b),
            Self::Borrowed(b) => Arc::strong_count(b),
        }
    }

    pub(crate) fn same_buffer(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Owned(a), Self::Owned(b)) => Arc::ptr_eq(a, b),
            (Self::Borrowed(a), Self::Borrowed(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}
