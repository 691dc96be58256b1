//! Blocked matrix multiplication.
//!
//! Both entry points **accumulate**: `C[M,N] += A[M,K] · op(B)`. Pre-zero or
//! pre-fill `C` for a fresh product.
//!
//! - [`gemm_nn`]: `B` is `[K,N]` row-major. Each `K`-strip of the current `B`
//!   tile is packed into per-thread scratch so the inner product reads both
//!   operands contiguously.
//! - [`gemm_nt`]: `B` is stored transposed as `[N,K]`; rows are dotted with
//!   rows and no packing is needed.
//!
//! Work is split over `N`-blocks of [`BLOCK_SIZE`] columns. Every block owns a
//! disjoint set of output columns, so blocks run without synchronisation, and
//! the summation order of any output element is the same in both execution
//! modes. Accumulation happens in the element type itself; `f32` loses
//! precision for very large `K`.

use tracing::instrument;

use crate::backend::{get_backend, max_threads};
use crate::error::{Error, Result};
use crate::parallel::{self, DisjointMut, ScratchArena};
use crate::tensors::{Scalar, Tensor};

/// Tile edge used for the `M`, `N` and `K` loops.
pub const BLOCK_SIZE: usize = 128;

/// Checks that a row-major `rows × cols` operand with leading dimension `ld`
/// fits into `len` elements.
fn check_operand(name: &str, len: usize, rows: usize, cols: usize, ld: usize) -> Result<()> {
    if rows == 0 || cols == 0 {
        return Ok(());
    }
    if ld < cols {
        return Err(Error::shape(format!(
            "{name}: leading dimension {ld} is smaller than {cols} columns"
        )));
    }
    let needed = (rows - 1) * ld + cols;
    if len < needed {
        return Err(Error::SizeMismatch {
            expected: needed,
            found: len,
        });
    }
    Ok(())
}

#[inline]
fn dot<T: Scalar>(a: &[T], b: &[T]) -> T {
    let mut acc = T::ZERO;
    for (&x, &y) in a.iter().zip(b) {
        acc += x * y;
    }
    acc
}

/// `C += A · B` with `A: [m,k]`, `B: [k,n]`, `C: [m,n]`, all row-major with
/// the given leading dimensions.
///
/// # Errors
///
/// [`Error::ShapeMismatch`] or [`Error::SizeMismatch`] if an operand does not
/// cover its declared extent, [`Error::AllocationFailure`] if packing scratch
/// cannot be allocated.
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, level = "debug")]
pub fn gemm_nn<T: Scalar>(
    m: usize,
    n: usize,
    k: usize,
    a: &[T],
    lda: usize,
    b: &[T],
    ldb: usize,
    c: &mut [T],
    ldc: usize,
) -> Result<()> {
    check_operand("A", a.len(), m, k, lda)?;
    check_operand("B", b.len(), k, n, ldb)?;
    check_operand("C", c.len(), m, n, ldc)?;
    if m == 0 || n == 0 || k == 0 {
        return Ok(());
    }

    let backend = get_backend();
    let arena = ScratchArena::<T>::new(max_threads(), BLOCK_SIZE * BLOCK_SIZE)?;
    let c = DisjointMut::new(c);

    parallel::for_each(n.div_ceil(BLOCK_SIZE), |block| {
        let j0 = block * BLOCK_SIZE;
        let nb = BLOCK_SIZE.min(n - j0);
        // SAFETY: one execution unit runs one block at a time.
        let packed = unsafe { arena.slot(parallel::execution_unit(backend)) };

        for k0 in (0..k).step_by(BLOCK_SIZE) {
            let kb = BLOCK_SIZE.min(k - k0);
            for kk in 0..kb {
                let row = &b[(k0 + kk) * ldb + j0..][..nb];
                for (jj, &v) in row.iter().enumerate() {
                    packed[jj * kb + kk] = v;
                }
            }

            for i0 in (0..m).step_by(BLOCK_SIZE) {
                for i in i0..m.min(i0 + BLOCK_SIZE) {
                    let a_row = &a[i * lda + k0..][..kb];
                    // SAFETY: columns [j0, j0 + nb) belong to this block only.
                    let c_row = unsafe { c.range_mut(i * ldc + j0, nb) };
                    for (jj, out) in c_row.iter_mut().enumerate() {
                        *out += dot(a_row, &packed[jj * kb..][..kb]);
                    }
                }
            }
        }
    });
    Ok(())
}

/// `C += A · Bᵀ` with `A: [m,k]`, `B: [n,k]`, `C: [m,n]`.
///
/// # Errors
///
/// [`Error::ShapeMismatch`] or [`Error::SizeMismatch`] if an operand does not
/// cover its declared extent.
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, level = "debug")]
pub fn gemm_nt<T: Scalar>(
    m: usize,
    n: usize,
    k: usize,
    a: &[T],
    lda: usize,
    b: &[T],
    ldb: usize,
    c: &mut [T],
    ldc: usize,
) -> Result<()> {
    check_operand("A", a.len(), m, k, lda)?;
    check_operand("B", b.len(), n, k, ldb)?;
    check_operand("C", c.len(), m, n, ldc)?;
    if m == 0 || n == 0 || k == 0 {
        return Ok(());
    }

    let c = DisjointMut::new(c);
    parallel::for_each(n.div_ceil(BLOCK_SIZE), |block| {
        let j0 = block * BLOCK_SIZE;
        let nb = BLOCK_SIZE.min(n - j0);
        for k0 in (0..k).step_by(BLOCK_SIZE) {
            let kb = BLOCK_SIZE.min(k - k0);
            for i in 0..m {
                let a_row = &a[i * lda + k0..][..kb];
                // SAFETY: columns [j0, j0 + nb) belong to this block only.
                let c_row = unsafe { c.range_mut(i * ldc + j0, nb) };
                for (jj, out) in c_row.iter_mut().enumerate() {
                    *out += dot(a_row, &b[(j0 + jj) * ldb + k0..][..kb]);
                }
            }
        }
    });
    Ok(())
}

/// Fresh product of two 2-D tensors, `[m,k] · [k,n] -> [m,n]`.
///
/// # Errors
///
/// [`Error::ShapeMismatch`] if either operand is not 2-D or the inner sizes
/// differ.
pub fn matmul<T: Scalar>(a: &Tensor<T>, b: &Tensor<T>) -> Result<Tensor<T>> {
    let (&[m, k], &[k2, n]) = (a.shape(), b.shape()) else {
        return Err(Error::shape(format!(
            "matmul needs 2-D operands, got {:?} and {:?}",
            a.shape(),
            b.shape()
        )));
    };
    if k != k2 {
        return Err(Error::shape(format!(
            "matmul inner sizes differ: {:?} · {:?}",
            a.shape(),
            b.shape()
        )));
    }
    let mut out = Tensor::zeros(vec![m, n])?;
    gemm_nn(m, n, k, &a.data(), k, &b.data(), n, &mut out.data_mut(), n)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{with_backend, Backend};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn naive(m: usize, n: usize, k: usize, a: &[f64], b: &[f64]) -> Vec<f64> {
        let mut c = vec![0.0; m * n];
        for i in 0..m {
            for j in 0..n {
                for l in 0..k {
                    c[i * n + j] += a[i * k + l] * b[l * n + j];
                }
            }
        }
        c
    }

    fn random(rng: &mut StdRng, len: usize) -> Vec<f64> {
        (0..len).map(|_| rng.random_range(-1.0..1.0)).collect()
    }

    #[test]
    fn blocked_product_matches_naive() {
        let mut rng = StdRng::seed_from_u64(42);
        for &(m, n, k) in &[(1, 1, 1), (3, 5, 1), (17, 130, 9), (129, 7, 257), (64, 256, 128)] {
            let a = random(&mut rng, m * k);
            let b = random(&mut rng, k * n);
            let mut c = vec![0.0; m * n];
            gemm_nn(m, n, k, &a, k, &b, n, &mut c, n).unwrap();
            for (x, y) in c.iter().zip(naive(m, n, k, &a, &b)) {
                assert!((x - y).abs() < 1e-9, "({m},{n},{k}): {x} vs {y}");
            }
        }
    }

    #[test]
    fn nt_matches_nn_on_transposed_operand() {
        let mut rng = StdRng::seed_from_u64(3);
        let (m, n, k) = (9, 140, 33);
        let a = random(&mut rng, m * k);
        let b = random(&mut rng, k * n);
        let mut bt = vec![0.0; n * k];
        for l in 0..k {
            for j in 0..n {
                bt[j * k + l] = b[l * n + j];
            }
        }
        let mut c_nn = vec![0.0; m * n];
        let mut c_nt = vec![0.0; m * n];
        gemm_nn(m, n, k, &a, k, &b, n, &mut c_nn, n).unwrap();
        gemm_nt(m, n, k, &a, k, &bt, k, &mut c_nt, n).unwrap();
        assert_eq!(c_nn, c_nt);
    }

    #[test]
    fn product_accumulates_into_c() {
        let a = [1.0f32, 2.0];
        let b = [3.0f32, 4.0];
        let mut c = [10.0f32];
        gemm_nn(1, 1, 2, &a, 2, &b, 1, &mut c, 1).unwrap();
        assert_eq!(c, [21.0]);
    }

    #[test]
    fn leading_dimensions_select_submatrices() {
        // A is the left 2x2 of a 2x3 buffer; C is the right 2x2 of a 2x3 buffer.
        let a = [1.0f64, 2.0, 99.0, 3.0, 4.0, 99.0];
        let b = [1.0f64, 0.0, 0.0, 1.0];
        let mut c = [0.0f64; 6];
        gemm_nn(2, 2, 2, &a, 3, &b, 2, &mut c[1..], 3).unwrap();
        assert_eq!(c, [0.0, 1.0, 2.0, 0.0, 3.0, 4.0]);
    }

    #[test]
    fn short_operands_are_rejected() {
        let mut c = [0.0f32; 4];
        let err = gemm_nn(2, 2, 2, &[1.0; 3], 2, &[1.0; 4], 2, &mut c, 2).unwrap_err();
        assert!(matches!(err, Error::SizeMismatch { expected: 4, found: 3 }));
        assert!(gemm_nn(2, 2, 2, &[1.0; 4], 1, &[1.0; 4], 2, &mut c, 2).is_err());
    }

    #[test]
    fn modes_are_bit_identical() {
        let mut rng = StdRng::seed_from_u64(11);
        let (m, n, k) = (31, 300, 200);
        let a: Vec<f32> = (0..m * k).map(|_| rng.random_range(-1.0..1.0)).collect();
        let b: Vec<f32> = (0..k * n).map(|_| rng.random_range(-1.0..1.0)).collect();
        let run = |backend| {
            with_backend(backend, || {
                let mut c = vec![0.0f32; m * n];
                gemm_nn(m, n, k, &a, k, &b, n, &mut c, n).unwrap();
                c
            })
        };
        assert_eq!(run(Backend::Parallel), run(Backend::Sequential));
    }

    #[test]
    fn matmul_checks_inner_sizes() {
        let a = Tensor::<f64>::new(vec![2, 3], vec![1.0; 6]).unwrap();
        let b = Tensor::<f64>::new(vec![3, 1], vec![1.0, 2.0, 3.0]).unwrap();
        assert_eq!(matmul(&a, &b).unwrap().data(), &[6.0, 6.0]);
        assert!(matmul(&a, &a).is_err());
    }
}
