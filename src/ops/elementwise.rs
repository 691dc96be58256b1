//! Pointwise unary and binary kernels.
//!
//! Every unary kernel has a copy form (`relu`) returning a fresh tensor and an
//! in-place form (`relu_inplace`) writing through the given view, so other
//! aliases of the same buffer observe the update.
//!
//! Binary kernels take an equal-shape fast path or broadcast. Broadcasting
//! aligns shapes on the right, left-pads them with size-1 axes to rank 4 and
//! requires every axis pair to be equal or to contain a 1.
//!
//! ```rust
//! use tensor4::ops::elementwise::{add, relu};
//! use tensor4::tensors::Tensor;
//!
//! let x = Tensor::<f32>::new(vec![2, 2], vec![-1.0, 2.0, -3.0, 4.0]).unwrap();
//! let bias = Tensor::<f32>::new(vec![1, 2], vec![10.0, 20.0]).unwrap();
//! let y = add(&relu(&x).unwrap(), &bias).unwrap();
//! assert_eq!(y.data(), &[10.0, 22.0, 10.0, 24.0]);
//! ```

use tracing::instrument;

use crate::error::{Error, Result};
use crate::parallel;
use crate::tensors::{alloc_vec, numel, Element, Float, Scalar, Tensor};

/// Elements handed to one parallel iteration.
const CHUNK: usize = 1 << 14;

/// `dst[i] = f(src[i])`, unrolled by four.
#[inline]
fn map_slice<T: Copy>(dst: &mut [T], src: &[T], f: impl Fn(T) -> T) {
    let mut d = dst.chunks_exact_mut(4);
    let mut s = src.chunks_exact(4);
    for (d, s) in (&mut d).zip(&mut s) {
        d[0] = f(s[0]);
        d[1] = f(s[1]);
        d[2] = f(s[2]);
        d[3] = f(s[3]);
    }
    for (d, &s) in d.into_remainder().iter_mut().zip(s.remainder()) {
        *d = f(s);
    }
}

/// In-place counterpart of [`map_slice`].
#[inline]
fn map_slice_inplace<T: Copy>(data: &mut [T], f: impl Fn(T) -> T) {
    let mut it = data.chunks_exact_mut(4);
    for d in &mut it {
        d[0] = f(d[0]);
        d[1] = f(d[1]);
        d[2] = f(d[2]);
        d[3] = f(d[3]);
    }
    for d in it.into_remainder() {
        *d = f(*d);
    }
}

pub(crate) fn map<T, F>(input: &Tensor<T>, f: F) -> Result<Tensor<T>>
where
    T: Scalar,
    F: Fn(T) -> T + Send + Sync,
{
    let src: &[T] = &input.data();
    let mut out = alloc_vec::<T>(src.len())?;
    parallel::for_each_chunk_mut(&mut out, CHUNK, |i, dst| {
        map_slice(dst, &src[i * CHUNK..][..dst.len()], &f);
    });
    Tensor::new(input.shape().to_vec(), out)
}

pub(crate) fn map_inplace<T, F>(input: &mut Tensor<T>, f: F)
where
    T: Scalar,
    F: Fn(T) -> T + Send + Sync,
{
    parallel::for_each_chunk_mut(&mut input.data_mut(), CHUNK, |_, data| {
        map_slice_inplace(data, &f);
    });
}

macro_rules! unary_op {
    (
        $(#[$doc:meta])*
        $name:ident, $inplace:ident, $bound:ident, ($($arg:ident: $ty:ty),*), |$v:ident| $body:expr
    ) => {
        $(#[$doc])*
        ///
        /// # Errors
        ///
        /// [`Error::AllocationFailure`] if the output cannot be allocated.
        #[instrument(skip_all, level = "debug")]
        pub fn $name<T: $bound>(input: &Tensor<T>, $($arg: $ty),*) -> Result<Tensor<T>> {
            map(input, move |$v: T| $body)
        }

        $(#[$doc])*
        ///
        /// Writes through `input`.
        #[instrument(skip_all, level = "debug")]
        pub fn $inplace<T: $bound>(input: &mut Tensor<T>, $($arg: $ty),*) {
            map_inplace(input, move |$v: T| $body)
        }
    };
}

unary_op! {
    /// `max(x, 0)`.
    relu, relu_inplace, Scalar, (), |v| if v > T::ZERO { v } else { T::ZERO }
}

unary_op! {
    /// `x` for positive inputs, `alpha · x` otherwise.
    leaky_relu, leaky_relu_inplace, Scalar, (alpha: T), |v| if v < T::ZERO { alpha * v } else { v }
}

unary_op! {
    /// Hyperbolic tangent.
    tanh, tanh_inplace, Float, (), |v| v.tanh()
}

unary_op! {
    /// Natural exponential.
    exp, exp_inplace, Float, (), |v| v.exp()
}

unary_op! {
    /// `x^p`.
    pow, pow_inplace, Float, (p: T), |v| v.powf(p)
}

unary_op! {
    /// Negation.
    neg, neg_inplace, Scalar, (), |v| -v
}

unary_op! {
    /// Multiplication by a scalar.
    mul_scalar, mul_scalar_inplace, Scalar, (x: T), |v| v * x
}

unary_op! {
    /// Addition of a scalar.
    add_scalar, add_scalar_inplace, Scalar, (x: T), |v| v + x
}

unary_op! {
    /// Division by a scalar.
    div_scalar, div_scalar_inplace, Scalar, (x: T), |v| v / x
}

/// Inference-time dropout: an alias of `input`.
///
/// No elements are dropped and nothing is rescaled; `ratio` only matters in
/// training, which this crate does not run.
#[instrument(skip(input), level = "debug")]
pub fn dropout<T: Element>(input: &Tensor<T>, ratio: f32) -> Tensor<T> {
    input.clone()
}

/// Result shape of broadcasting `a` against `b`.
///
/// # Errors
///
/// [`Error::ShapeMismatch`] if an axis pair differs with neither side 1, or
/// if either shape has more than four axes.
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    if a.len() > 4 || b.len() > 4 {
        return Err(Error::shape(format!(
            "broadcasting supports up to 4 axes, got {a:?} and {b:?}"
        )));
    }
    let rank = a.len().max(b.len());
    let pad = |s: &[usize], i: usize| {
        let lead = rank - s.len();
        if i < lead { 1 } else { s[i - lead] }
    };
    (0..rank)
        .map(|i| match (pad(a, i), pad(b, i)) {
            (x, y) if x == y => Ok(x),
            (1, y) => Ok(y),
            (x, 1) => Ok(x),
            _ => Err(Error::shape(format!("cannot broadcast {a:?} with {b:?}"))),
        })
        .collect()
}

fn expand4(shape: &[usize]) -> [usize; 4] {
    let mut out = [1; 4];
    out[4 - shape.len()..].copy_from_slice(shape);
    out
}

fn binary<T, F>(a: &Tensor<T>, b: &Tensor<T>, op: F) -> Result<Tensor<T>>
where
    T: Scalar,
    F: Fn(T, T) -> T + Send + Sync,
{
    let (sa, sb): (&[T], &[T]) = (&a.data(), &b.data());

    if a.shape() == b.shape() {
        let mut out = alloc_vec::<T>(sa.len())?;
        parallel::for_each_chunk_mut(&mut out, CHUNK, |i, dst| {
            let base = i * CHUNK;
            let (xa, xb) = (&sa[base..][..dst.len()], &sb[base..][..dst.len()]);
            for ((d, &x), &y) in dst.iter_mut().zip(xa).zip(xb) {
                *d = op(x, y);
            }
        });
        return Tensor::new(a.shape().to_vec(), out);
    }

    let shape = broadcast_shape(a.shape(), b.shape())?;
    let s = expand4(&shape);
    let ea = expand4(a.shape());
    let eb = expand4(b.shape());
    let mut out = alloc_vec::<T>(numel(&shape))?;

    // One iteration per (n, c) plane of the result.
    parallel::for_each_chunk_mut(&mut out, s[2] * s[3], |nc, dst| {
        let (n, c) = (nc / s[1], nc % s[1]);
        let plane_a = ((n % ea[0]) * ea[1] + c % ea[1]) * ea[2] * ea[3];
        let plane_b = ((n % eb[0]) * eb[1] + c % eb[1]) * eb[2] * eb[3];
        for (h, row) in dst.chunks_exact_mut(s[3]).enumerate() {
            let ra = &sa[plane_a + (h % ea[2]) * ea[3]..][..ea[3]];
            let rb = &sb[plane_b + (h % eb[2]) * eb[3]..][..eb[3]];
            if ea[3] == 1 {
                let x = ra[0];
                for (d, &y) in row.iter_mut().zip(rb) {
                    *d = op(x, y);
                }
            } else if eb[3] == 1 {
                let y = rb[0];
                for (d, &x) in row.iter_mut().zip(ra) {
                    *d = op(x, y);
                }
            } else {
                for (w, d) in row.iter_mut().enumerate() {
                    *d = op(ra[w % ea[3]], rb[w % eb[3]]);
                }
            }
        }
    });
    Tensor::new(shape, out)
}

macro_rules! binary_op {
    ($(#[$doc:meta])* $name:ident, |$x:ident, $y:ident| $body:expr) => {
        $(#[$doc])*
        ///
        /// # Errors
        ///
        /// [`Error::ShapeMismatch`] if the shapes cannot be broadcast,
        /// [`Error::AllocationFailure`] if the output cannot be allocated.
        #[instrument(skip_all, level = "debug")]
        pub fn $name<T: Scalar>(a: &Tensor<T>, b: &Tensor<T>) -> Result<Tensor<T>> {
            binary(a, b, |$x: T, $y: T| $body)
        }
    };
}

binary_op! {
    /// Elementwise `a + b` with broadcasting.
    add, |x, y| x + y
}

binary_op! {
    /// Elementwise `a - b` with broadcasting.
    sub, |x, y| x - y
}

binary_op! {
    /// Elementwise `a · b` with broadcasting.
    mul, |x, y| x * y
}

binary_op! {
    /// Elementwise `a / b` with broadcasting.
    div, |x, y| x / y
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iota(shape: &[usize]) -> Tensor<f32> {
        Tensor::new(shape.to_vec(), (0..numel(shape)).map(|x| x as f32).collect()).unwrap()
    }

    #[test]
    fn unary_copy_leaves_source_alone() {
        let x = Tensor::<f32>::new(vec![5], vec![-2.0, -1.0, 0.0, 1.0, 2.0]).unwrap();
        let y = relu(&x).unwrap();
        assert_eq!(y.data(), &[0.0, 0.0, 0.0, 1.0, 2.0]);
        assert_eq!(x.data()[0], -2.0);
        assert_eq!(leaky_relu(&x, 0.5).unwrap().data(), &[-1.0, -0.5, 0.0, 1.0, 2.0]);
        assert_eq!(neg(&x).unwrap().data(), &[2.0, 1.0, -0.0, -1.0, -2.0]);
    }

    #[test]
    fn inplace_updates_every_alias() {
        let x = iota(&[2, 3]);
        let mut row = x.sub(1);
        mul_scalar_inplace(&mut row, 2.0);
        assert_eq!(x.data(), &[0.0, 1.0, 2.0, 6.0, 8.0, 10.0]);
        let mut all = x.clone();
        add_scalar_inplace(&mut all, 1.0);
        div_scalar_inplace(&mut all, 2.0);
        assert_eq!(x.data()[5], 5.5);
    }

    #[test]
    fn dropout_is_identity_at_inference() {
        let x = iota(&[2, 3]);
        let y = dropout(&x, 0.5);
        assert_eq!(y, x);
        assert!(y.shares_buffer(&x));
    }

    #[test]
    fn transcendental_ops() {
        let x = Tensor::<f64>::new(vec![3], vec![0.0, 1.0, 2.0]).unwrap();
        assert_eq!(exp(&x).unwrap().data()[0], 1.0);
        assert_eq!(pow(&x, 2.0).unwrap().data(), &[0.0, 1.0, 4.0]);
        assert_eq!(tanh(&x).unwrap().data()[0], 0.0);
    }

    #[test]
    fn unroll_tail_is_covered() {
        for len in [0, 1, 3, 4, 5, 9, CHUNK + 3] {
            let x = iota(&[len]);
            let y = add_scalar(&x, 1.0).unwrap();
            assert!(y.data().iter().enumerate().all(|(i, &v)| v == i as f32 + 1.0));
        }
    }

    #[test]
    fn broadcasts_trailing_vector() {
        let a = iota(&[2, 3, 4, 4]);
        let b = Tensor::<f32>::new(vec![2, 1, 1, 4], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0])
            .unwrap();
        let y = add(&a, &b).unwrap();
        assert_eq!(y.shape(), &[2, 3, 4, 4]);
        for n in 0..2 {
            for c in 0..3 {
                for h in 0..4 {
                    let row = &y.sub2(n, c).sub(h).to_vec()[..];
                    let base = (((n * 3 + c) * 4 + h) * 4) as f32;
                    let v = &b.sub(n).to_vec()[..];
                    let expected: Vec<f32> = (0..4).map(|w| base + w as f32 + v[w]).collect();
                    assert_eq!(row, &expected[..]);
                }
            }
        }
    }

    #[test]
    fn broadcasts_scalar_columns_both_ways() {
        let a = Tensor::<f64>::new(vec![2, 1], vec![10.0, 20.0]).unwrap();
        let b = Tensor::<f64>::new(vec![3], vec![1.0, 2.0, 3.0]).unwrap();
        let y = sub(&a, &b).unwrap();
        assert_eq!(y.shape(), &[2, 3]);
        assert_eq!(y.data(), &[9.0, 8.0, 7.0, 19.0, 18.0, 17.0]);
        let y = sub(&b, &a).unwrap();
        assert_eq!(y.data(), &[-9.0, -8.0, -7.0, -19.0, -18.0, -17.0]);
    }

    #[test]
    fn incompatible_shapes_are_rejected() {
        let a = iota(&[2, 3]);
        let b = iota(&[2, 2]);
        assert!(matches!(mul(&a, &b), Err(Error::ShapeMismatch(_))));
        assert!(broadcast_shape(&[1, 1, 1, 1, 2], &[2]).is_err());
        assert_eq!(broadcast_shape(&[4, 1, 3], &[5, 1]).unwrap(), vec![4, 5, 3]);
    }

    #[test]
    fn equal_shapes_take_the_fast_path() {
        let a = iota(&[3, 3]);
        let y = div(&mul(&a, &a).unwrap(), &add_scalar(&a, 1.0).unwrap()).unwrap();
        assert_eq!(y.data()[2], 4.0 / 3.0);
    }
}
