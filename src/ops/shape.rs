//! Data movement kernels: concatenation, gather and zero padding.

use tracing::instrument;

use crate::error::{normalize_axis, Error, Result};
use crate::parallel;
use crate::tensors::{alloc_vec, numel, Element, Tensor};

/// Joins `a` and `b` along `axis`. All other axes must match.
///
/// The result is built block-wise: for every index of the axes before
/// `axis`, one contiguous run from `a` is followed by one from `b`.
///
/// # Errors
///
/// [`Error::AxisOutOfRange`] for an invalid axis, [`Error::ShapeMismatch`]
/// if the ranks or any non-concatenated axis differ.
#[instrument(skip_all, level = "debug")]
pub fn concat<T: Element>(a: &Tensor<T>, b: &Tensor<T>, axis: isize) -> Result<Tensor<T>> {
    let axis = normalize_axis(axis, a.rank())?;
    let compatible = a.rank() == b.rank()
        && a.shape()
            .iter()
            .zip(b.shape())
            .enumerate()
            .all(|(i, (x, y))| i == axis || x == y);
    if !compatible {
        return Err(Error::shape(format!(
            "cannot concatenate {:?} and {:?} along axis {axis}",
            a.shape(),
            b.shape()
        )));
    }

    let mut shape = a.shape().to_vec();
    shape[axis] += b.shape()[axis];
    let blocks = numel(&a.shape()[..axis]);
    let run_a = numel(&a.shape()[axis..]);
    let run_b = numel(&b.shape()[axis..]);
    let (src_a, src_b): (&[T], &[T]) = (&a.data(), &b.data());

    let mut out = alloc_vec::<T>(numel(&shape))?;
    if blocks > 0 && run_a + run_b > 0 {
        parallel::for_each_chunk_mut(&mut out, run_a + run_b, |i, dst| {
            dst[..run_a].copy_from_slice(&src_a[i * run_a..][..run_a]);
            dst[run_a..].copy_from_slice(&src_b[i * run_b..][..run_b]);
        });
    }
    Tensor::new(shape, out)
}

/// Looks up slices of `x` along `axis`.
///
/// The trailing axis of `indices` holds the lookups for one output block; its
/// leading axes become the leading axes of the result. The result shape is
/// `indices.shape[..r-1] ++ x.shape[..axis] ++ [indices.shape[r-1]] ++ x.shape[axis+1..]`,
/// of rank `rank(x) + rank(indices) - 1`. A rank-0 index removes `axis`.
///
/// # Errors
///
/// [`Error::AxisOutOfRange`] for an invalid axis, [`Error::IndexOutOfRange`]
/// if an index is negative or not below `x.shape[axis]`.
#[instrument(skip_all, level = "debug")]
pub fn gather<T: Element>(x: &Tensor<T>, indices: &Tensor<i64>, axis: isize) -> Result<Tensor<T>> {
    let axis = normalize_axis(axis, x.rank())?;
    let source_len = x.shape()[axis];
    let idx: &[i64] = &indices.data();
    if let Some(&bad) = idx.iter().find(|&&i| i < 0 || i as usize >= source_len) {
        return Err(Error::IndexOutOfRange {
            index: bad,
            size: source_len,
        });
    }

    let (lead, lookups) = match indices.shape().split_last() {
        Some((&last, lead)) => (lead, Some(last)),
        None => (&[][..], None),
    };
    let mut shape = lead.to_vec();
    shape.extend_from_slice(&x.shape()[..axis]);
    shape.extend(lookups);
    shape.extend_from_slice(&x.shape()[axis + 1..]);

    let per_block = lookups.unwrap_or(1);
    let outer = numel(&x.shape()[..axis]);
    let inner = numel(&x.shape()[axis + 1..]);
    let src: &[T] = &x.data();
    let mut out = alloc_vec::<T>(numel(&shape))?;

    // One iteration per (index row, outer block) pair.
    if inner > 0 && per_block > 0 {
        parallel::for_each_chunk_mut(&mut out, per_block * inner, |chunk, dst| {
            let (row, block) = (chunk / outer, chunk % outer);
            let row_idx = &idx[row * per_block..][..per_block];
            for (k, &index) in row_idx.iter().enumerate() {
                let from = (block * source_len + index as usize) * inner;
                dst[k * inner..][..inner].copy_from_slice(&src[from..][..inner]);
            }
        });
    }
    Tensor::new(shape, out)
}

/// Per-axis `(begin, end)` zero padding for a rank-4 tensor.
pub type Padding4 = [(usize, usize); 4];

/// Surrounds a `[N, C, H, W]` tensor with zeros, `pads[i].0` before and
/// `pads[i].1` after axis `i`.
///
/// # Errors
///
/// [`Error::ShapeMismatch`] if `input` is not rank 4.
#[instrument(skip_all, level = "debug")]
pub fn pad<T: Element>(input: &Tensor<T>, pads: &Padding4) -> Result<Tensor<T>> {
    let [n, c, h, w] = <[usize; 4]>::try_from(input.shape())
        .map_err(|_| Error::shape(format!("pad needs rank 4, got {:?}", input.shape())))?;
    let shape: Vec<usize> = [n, c, h, w]
        .iter()
        .zip(pads)
        .map(|(&d, &(begin, end))| begin + d + end)
        .collect();
    let (oc, oh, ow) = (shape[1], shape[2], shape[3]);
    let src: &[T] = &input.data();
    let mut out = alloc_vec::<T>(numel(&shape))?;

    // One iteration per output (n, c) plane; planes outside the input stay zero.
    parallel::for_each_chunk_mut(&mut out, oh * ow, |plane, dst| {
        let (on, occ) = (plane / oc, plane % oc);
        let (Some(ni), Some(ci)) = (on.checked_sub(pads[0].0), occ.checked_sub(pads[1].0)) else {
            return;
        };
        if ni >= n || ci >= c {
            return;
        }
        let src = &src[(ni * c + ci) * h * w..][..h * w];
        for (y, row) in src.chunks_exact(w.max(1)).enumerate().take(h) {
            let start = (y + pads[2].0) * ow + pads[3].0;
            dst[start..start + w].copy_from_slice(&row[..w]);
        }
    });
    Tensor::new(shape, out)
}
