//! Data-parallel "for each independent iteration" primitives.
//!
//! # Execution model
//!
//! Every kernel in this crate expresses its work as a range of independent
//! iterations (rows, channels, output blocks). The primitives here map those
//! iterations onto the `rayon` pool or, in [`Backend::Sequential`] mode, run
//! them in order on the calling thread.
//!
//! - Iterations never share mutable state; each one writes a disjoint part
//!   of the output. That disjointness is what makes the loops lock-free.
//! - There is no ordering between iterations and no cancellation.
//! - Per-iteration scratch memory comes from a [`ScratchArena`]: one
//!   page-aligned block holding one page-rounded slot per execution unit,
//!   freed when the arena is dropped on every exit path.
//!
//! Because an iteration's arithmetic never depends on which thread runs it,
//! both modes produce bit-identical results.

use core::alloc::Layout;
use core::marker::PhantomData;
use core::ptr::NonNull;

use bytemuck::Zeroable;
use rayon::prelude::*;

use crate::backend::{get_backend, max_threads, Backend};
use crate::error::{Error, Result};

/// Page size used to align and round scratch slots.
pub const PAGE_SIZE: usize = 4096;

/// Runs `body(i)` for every `i` in `0..n`.
pub fn for_each<F>(n: usize, body: F)
where
    F: Fn(usize) + Send + Sync,
{
    match get_backend() {
        Backend::Parallel => (0..n).into_par_iter().for_each(body),
        Backend::Sequential => (0..n).for_each(body),
    }
}

/// Splits `out` into `chunk`-sized pieces and runs `body(index, piece)` on each.
///
/// The last piece is shorter when `out.len()` is not a multiple of `chunk`.
pub fn for_each_chunk_mut<T, F>(out: &mut [T], chunk: usize, body: F)
where
    T: Send,
    F: Fn(usize, &mut [T]) + Send + Sync,
{
    if out.is_empty() {
        return;
    }
    let chunk = chunk.max(1);
    match get_backend() {
        Backend::Parallel => out
            .par_chunks_mut(chunk)
            .enumerate()
            .for_each(|(i, piece)| body(i, piece)),
        Backend::Sequential => out
            .chunks_mut(chunk)
            .enumerate()
            .for_each(|(i, piece)| body(i, piece)),
    }
}

/// Like [`for_each_chunk_mut`], with `scratch_len` elements of per-thread
/// scratch handed to every iteration.
///
/// The scratch contents are unspecified on entry (zeroed on first use, then
/// whatever the previous iteration on that thread left behind).
///
/// # Errors
///
/// Returns [`Error::AllocationFailure`] if the arena cannot be allocated.
pub fn for_each_chunk_mut_with_scratch<T, S, F>(
    out: &mut [T],
    chunk: usize,
    scratch_len: usize,
    body: F,
) -> Result<()>
where
    T: Send,
    S: Zeroable + Send,
    F: Fn(usize, &mut [T], &mut [S]) + Send + Sync,
{
    let backend = get_backend();
    let arena = ScratchArena::<S>::new(max_threads(), scratch_len)?;
    for_each_chunk_mut(out, chunk, |i, piece| {
        // SAFETY: iterations never re-enter the pool while holding the slot, so
        // one execution unit runs at most one iteration at a time.
        let scratch = unsafe { arena.slot(execution_unit(backend)) };
        body(i, piece, scratch);
    });
    Ok(())
}

/// Index of the execution unit running the current iteration.
///
/// `backend` is resolved once by the caller: worker threads do not see the
/// calling thread's override.
pub(crate) fn execution_unit(backend: Backend) -> usize {
    match backend {
        Backend::Parallel => rayon::current_thread_index().unwrap_or(0),
        Backend::Sequential => 0,
    }
}

/// Page-aligned scratch memory with one slot per execution unit.
///
/// The whole arena is a single allocation of
/// `threads * round_up(per_thread_bytes, PAGE_SIZE)` bytes so that no two
/// slots share a cache line.
pub struct ScratchArena<S> {
    ptr: NonNull<u8>,
    layout: Layout,
    slot_bytes: usize,
    slot_len: usize,
    slots: usize,
    _marker: PhantomData<S>,
}

// SAFETY: slots are handed out to distinct execution units only.
unsafe impl<S: Send> Send for ScratchArena<S> {}
unsafe impl<S: Send> Sync for ScratchArena<S> {}

impl<S: Zeroable> ScratchArena<S> {
    /// Allocates `threads` zeroed slots of `per_thread` elements each.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailure`] if the allocation fails or the
    /// requested size overflows.
    pub fn new(threads: usize, per_thread: usize) -> Result<Self> {
        let slots = threads.max(1);
        let raw = per_thread
            .checked_mul(size_of::<S>())
            .ok_or(Error::AllocationFailure { bytes: usize::MAX })?;
        let slot_bytes = raw.div_ceil(PAGE_SIZE).max(1) * PAGE_SIZE;
        let total = slot_bytes
            .checked_mul(slots)
            .ok_or(Error::AllocationFailure { bytes: usize::MAX })?;
        let layout = Layout::from_size_align(total, PAGE_SIZE.max(align_of::<S>()))
            .map_err(|_| Error::AllocationFailure { bytes: total })?;

        // SAFETY: `layout` has a non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(Error::AllocationFailure { bytes: total })?;

        Ok(Self {
            ptr,
            layout,
            slot_bytes,
            slot_len: per_thread,
            slots,
            _marker: PhantomData,
        })
    }

    /// Number of slots in the arena.
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Bytes reserved per slot, a multiple of [`PAGE_SIZE`].
    pub fn slot_bytes(&self) -> usize {
        self.slot_bytes
    }

    /// Returns the slot owned by execution unit `id`.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that no other live reference to slot `id`
    /// exists while the returned slice is in use.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not a valid slot index.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slot(&self, id: usize) -> &mut [S] {
        assert!(id < self.slots, "execution unit {id} has no scratch slot");
        // SAFETY: slot `id` lies inside the allocation, is page-aligned, was
        // zero-initialised (valid for `S: Zeroable`) and exclusivity is the
        // caller's contract.
        unsafe {
            let base = self.ptr.as_ptr().add(id * self.slot_bytes).cast::<S>();
            core::slice::from_raw_parts_mut(base, self.slot_len)
        }
    }
}

impl<S> Drop for ScratchArena<S> {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this exact layout.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Hands out mutable sub-slices of one buffer to parallel iterations that
/// write provably disjoint, but non-contiguous, regions.
pub(crate) struct DisjointMut<'a, T> {
    ptr: *mut T,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

// SAFETY: access goes through `range_mut`, whose contract forbids overlap.
unsafe impl<T: Send> Send for DisjointMut<'_, T> {}
unsafe impl<T: Send> Sync for DisjointMut<'_, T> {}

impl<'a, T> DisjointMut<'a, T> {
    pub(crate) fn new(slice: &'a mut [T]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
            _marker: PhantomData,
        }
    }

    /// Returns `len` elements starting at `start`.
    ///
    /// # Safety
    ///
    /// Ranges obtained concurrently must not overlap.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn range_mut(&self, start: usize, len: usize) -> &mut [T] {
        assert!(start + len <= self.len, "disjoint range out of bounds");
        // SAFETY: in bounds; overlap is excluded by the caller.
        unsafe { core::slice::from_raw_parts_mut(self.ptr.add(start), len) }
    }
}
