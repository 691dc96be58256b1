//! Spatial pooling over `[N, C, H, W]` tensors.
//!
//! Windows are described by [`Window2d`]. Taps that fall into the padding are
//! skipped, so border windows reduce over fewer elements.

use tracing::instrument;

use super::conv::Window2d;
use crate::error::{Error, Result};
use crate::parallel;
use crate::tensors::{Scalar, Tensor};

fn dims4<T: Scalar>(t: &Tensor<T>) -> Result<[usize; 4]> {
    <[usize; 4]>::try_from(t.shape())
        .map_err(|_| Error::shape(format!("pooling needs rank 4, got {:?}", t.shape())))
}

/// Applies `reduce` to the in-bounds taps of every window of every plane.
fn pool<T, F>(input: &Tensor<T>, win: &Window2d, reduce: F) -> Result<Tensor<T>>
where
    T: Scalar,
    F: Fn(&mut dyn Iterator<Item = T>) -> T + Send + Sync,
{
    let [n, c, h, w] = dims4(input)?;
    let (hout, wout) = win.conv_output(h, w)?;
    let mut out = Tensor::zeros(vec![n, c, hout, wout])?;
    let src: &[T] = &input.data();
    let [kh, kw] = win.kernel;

    parallel::for_each_chunk_mut(&mut out.data_mut(), hout * wout, |plane, dst| {
        let src = &src[plane * h * w..][..h * w];
        for i in 0..hout {
            for j in 0..wout {
                let top = (i * win.stride[0]) as isize - win.padding[0] as isize;
                let left = (j * win.stride[1]) as isize - win.padding[1] as isize;
                let mut taps = (0..kh)
                    .map(move |fh| top + (fh * win.dilation[0]) as isize)
                    .filter(|&y| (0..h as isize).contains(&y))
                    .flat_map(move |y| {
                        (0..kw)
                            .map(move |fw| left + (fw * win.dilation[1]) as isize)
                            .filter(move |&x| (0..w as isize).contains(&x))
                            .map(move |x| src[y as usize * w + x as usize])
                    });
                dst[i * wout + j] = reduce(&mut taps);
            }
        }
    });
    Ok(out)
}

/// Maximum over every window. A window that lies entirely in the padding
/// yields zero.
///
/// # Errors
///
/// [`Error::ShapeMismatch`] if `input` is not rank 4 or the window does not fit.
#[instrument(skip_all, level = "debug")]
pub fn max_pool2d<T: Scalar>(input: &Tensor<T>, win: &Window2d) -> Result<Tensor<T>> {
    pool(input, win, |taps| {
        taps.reduce(|a, b| if b > a { b } else { a })
            .unwrap_or(T::ZERO)
    })
}

/// Mean over the in-bounds taps of every window.
///
/// # Errors
///
/// [`Error::ShapeMismatch`] if `input` is not rank 4 or the window does not fit.
#[instrument(skip_all, level = "debug")]
pub fn avg_pool2d<T: Scalar>(input: &Tensor<T>, win: &Window2d) -> Result<Tensor<T>> {
    pool(input, win, |taps| {
        let (sum, count) = taps.fold((T::ZERO, 0usize), |(s, n), v| (s + v, n + 1));
        if count == 0 {
            T::ZERO
        } else {
            sum / T::from_f64(count as f64)
        }
    })
}

/// Mean of every `H × W` plane, producing `[N, C, 1, 1]`.
///
/// # Errors
///
/// [`Error::ShapeMismatch`] if `input` is not rank 4.
#[instrument(skip_all, level = "debug")]
pub fn global_avg_pool2d<T: Scalar>(input: &Tensor<T>) -> Result<Tensor<T>> {
    let [n, c, h, w] = dims4(input)?;
    let mut out = Tensor::zeros(vec![n, c, 1, 1])?;
    let src: &[T] = &input.data();
    let plane = h * w;
    if plane == 0 {
        return Ok(out);
    }
    let denom = T::from_f64(plane as f64);

    parallel::for_each_chunk_mut(&mut out.data_mut(), 1, |i, dst| {
        let mut sum = T::ZERO;
        for &v in &src[i * plane..][..plane] {
            sum += v;
        }
        dst[0] = sum / denom;
    });
    Ok(out)
}
