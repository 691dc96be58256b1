//! Convolution lowered to matrix multiplication.
//!
//! [`conv2d`] expands each input image into a column matrix with [`im2col`]
//! and multiplies the flattened kernel against it. [`conv_transpose2d`] runs
//! the adjoint: a GEMM produces columns from the input, then [`col2im`]
//! scatter-accumulates them into the output image.
//!
//! Column matrices have one row per `(channel, kernel_row, kernel_col)`
//! triple and one column per output pixel, i.e. shape
//! `[C * kh * kw, Hout * Wout]`.

use tracing::instrument;

use super::gemm::gemm_nn;
use crate::error::{Error, Result};
use crate::parallel;
use crate::tensors::{alloc_vec, Scalar, Tensor};

/// Spatial hyperparameters of a convolution or pooling window, as
/// `[height, width]` pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window2d {
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    pub dilation: [usize; 2],
}

impl Window2d {
    /// A `kh × kw` window with unit stride, no padding and no dilation.
    pub const fn new(kh: usize, kw: usize) -> Self {
        Self {
            kernel: [kh, kw],
            stride: [1, 1],
            padding: [0, 0],
            dilation: [1, 1],
        }
    }

    pub const fn stride(mut self, sh: usize, sw: usize) -> Self {
        self.stride = [sh, sw];
        self
    }

    pub const fn padding(mut self, ph: usize, pw: usize) -> Self {
        self.padding = [ph, pw];
        self
    }

    pub const fn dilation(mut self, dh: usize, dw: usize) -> Self {
        self.dilation = [dh, dw];
        self
    }

    /// Whether the window has no padding on either axis.
    ///
    /// Dilation does not matter here: without padding, every tap of an output
    /// position inside [`conv_output`](Self::conv_output) lies in the input.
    pub const fn is_unpadded(&self) -> bool {
        self.padding[0] == 0 && self.padding[1] == 0
    }

    fn validate(&self) -> Result<()> {
        let all = [self.kernel, self.stride, self.dilation];
        if all.iter().flatten().any(|&v| v == 0) {
            return Err(Error::shape(format!(
                "kernel, stride and dilation must be positive: {self:?}"
            )));
        }
        Ok(())
    }

    /// Output size of a convolution over an `h × w` input:
    /// `⌊(h + 2·pad − dilation·(k − 1) − 1) / stride⌋ + 1` per axis.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] if a hyperparameter is zero or the dilated
    /// kernel does not fit into the padded input.
    pub fn conv_output(&self, h: usize, w: usize) -> Result<(usize, usize)> {
        self.validate()?;
        let axis = |i: usize, len: usize| {
            let padded = len + 2 * self.padding[i];
            let span = self.dilation[i] * (self.kernel[i] - 1) + 1;
            if padded < span {
                return Err(Error::shape(format!(
                    "window span {span} exceeds padded input size {padded}"
                )));
            }
            Ok((padded - span) / self.stride[i] + 1)
        };
        Ok((axis(0, h)?, axis(1, w)?))
    }

    /// Output size of a transposed convolution over an `h × w` input:
    /// `(h − 1)·stride − 2·pad + dilation·(k − 1) + 1` per axis.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] if a hyperparameter is zero, the input is
    /// empty or the padding consumes the whole output.
    pub fn transpose_output(&self, h: usize, w: usize) -> Result<(usize, usize)> {
        self.validate()?;
        let axis = |i: usize, len: usize| {
            if len == 0 {
                return Err(Error::shape("transposed convolution over an empty input"));
            }
            let full = (len - 1) * self.stride[i] + self.dilation[i] * (self.kernel[i] - 1) + 1;
            let cut = 2 * self.padding[i];
            if full <= cut {
                return Err(Error::shape(format!(
                    "padding {} leaves no output from size {full}",
                    self.padding[i]
                )));
            }
            Ok(full - cut)
        };
        Ok((axis(0, h)?, axis(1, w)?))
    }

    /// Output columns `[start, end)` of kernel column `fw` whose input column
    /// falls inside `0..w`, clipped to `0..wout`.
    fn valid_columns(&self, fw: usize, w: usize, wout: usize) -> (usize, usize) {
        let (sw, pw, dw) = (
            self.stride[1] as isize,
            self.padding[1] as isize,
            self.dilation[1] as isize,
        );
        let first = pw - fw as isize * dw;
        let ceil_div = |a: isize| -(-a).div_euclid(sw);
        let start = ceil_div(first).clamp(0, wout as isize) as usize;
        let end = ceil_div(first + w as isize).clamp(0, wout as isize) as usize;
        (start, end.max(start))
    }

    /// Input row sampled by output row `y` and kernel row `fh`, if inside `0..h`.
    fn input_row(&self, y: usize, fh: usize, h: usize) -> Option<usize> {
        let iy = (y * self.stride[0] + fh * self.dilation[0]) as isize - self.padding[0] as isize;
        (0..h as isize).contains(&iy).then_some(iy as usize)
    }

    /// Input column sampled by output column `x` and kernel column `fw`.
    /// Only meaningful for `x` inside [`valid_columns`](Self::valid_columns).
    fn input_col(&self, x: usize, fw: usize) -> usize {
        x * self.stride[1] + fw * self.dilation[1] - self.padding[1]
    }
}

/// Expands a `[channels, h, w]` image into `[channels * kh * kw, hout * wout]`
/// columns. Positions that fall into the padding are written as zero.
///
/// Unpadded windows take a fast path without boundary tests, for any
/// dilation, as long as `hout × wout` does not exceed the convolution output
/// size. Everything else goes through the clipping path.
///
/// # Errors
///
/// [`Error::SizeMismatch`] if `image` or `columns` have the wrong length.
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, level = "debug")]
pub fn im2col<T: Scalar>(
    columns: &mut [T],
    image: &[T],
    channels: usize,
    h: usize,
    w: usize,
    win: &Window2d,
    hout: usize,
    wout: usize,
) -> Result<()> {
    let [kh, kw] = win.kernel;
    expect_len(image.len(), channels * h * w)?;
    expect_len(columns.len(), channels * kh * kw * hout * wout)?;
    let plane = h * w;
    let fast = win.is_unpadded()
        && win
            .conv_output(h, w)
            .is_ok_and(|(max_h, max_w)| hout <= max_h && wout <= max_w);

    parallel::for_each_chunk_mut(columns, hout * wout, |row, dst| {
        let channel = row / (kh * kw);
        let fh = (row / kw) % kh;
        let fw = row % kw;
        let src = &image[channel * plane..][..plane];

        if fast {
            for (y, dst_row) in dst.chunks_exact_mut(wout).enumerate() {
                let iy = y * win.stride[0] + fh * win.dilation[0];
                let src_row = &src[iy * w..][..w];
                for (x, out) in dst_row.iter_mut().enumerate() {
                    *out = src_row[win.input_col(x, fw)];
                }
            }
            return;
        }

        let (start, end) = win.valid_columns(fw, w, wout);
        for (y, dst_row) in dst.chunks_exact_mut(wout).enumerate() {
            match win.input_row(y, fh, h) {
                Some(iy) => {
                    let src_row = &src[iy * w..][..w];
                    dst_row[..start].fill(T::ZERO);
                    for x in start..end {
                        dst_row[x] = src_row[win.input_col(x, fw)];
                    }
                    dst_row[end..].fill(T::ZERO);
                }
                None => dst_row.fill(T::ZERO),
            }
        }
    });
    Ok(())
}

/// Scatter-accumulates `[channels * kh * kw, hout * wout]` columns into a
/// `[channels, h, w]` image. Overlapping windows add up; padding positions
/// are dropped.
///
/// Work is split over channels, so every image plane has exactly one writer.
///
/// # Errors
///
/// [`Error::SizeMismatch`] if `image` or `columns` have the wrong length.
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, level = "debug")]
pub fn col2im<T: Scalar>(
    image: &mut [T],
    columns: &[T],
    channels: usize,
    h: usize,
    w: usize,
    win: &Window2d,
    hout: usize,
    wout: usize,
) -> Result<()> {
    let [kh, kw] = win.kernel;
    expect_len(image.len(), channels * h * w)?;
    expect_len(columns.len(), channels * kh * kw * hout * wout)?;
    let cols = hout * wout;

    parallel::for_each_chunk_mut(image, h * w, |channel, dst| {
        for fh in 0..kh {
            for fw in 0..kw {
                let row = (channel * kh + fh) * kw + fw;
                let src = &columns[row * cols..][..cols];
                let (start, end) = win.valid_columns(fw, w, wout);
                for y in 0..hout {
                    let Some(iy) = win.input_row(y, fh, h) else {
                        continue;
                    };
                    for x in start..end {
                        dst[iy * w + win.input_col(x, fw)] += src[y * wout + x];
                    }
                }
            }
        }
    });
    Ok(())
}

fn expect_len(found: usize, expected: usize) -> Result<()> {
    if found != expected {
        return Err(Error::SizeMismatch { expected, found });
    }
    Ok(())
}

fn dims4<T: Scalar>(t: &Tensor<T>, what: &str) -> Result<[usize; 4]> {
    <[usize; 4]>::try_from(t.shape())
        .map_err(|_| Error::shape(format!("{what} must be rank 4, got {:?}", t.shape())))
}

/// Allocates `[n, k, hout, wout]`, each channel plane filled with its bias or zero.
fn init_output<T: Scalar>(
    shape: [usize; 4],
    bias: Option<&Tensor<T>>,
) -> Result<Tensor<T>> {
    let [_, k, hout, wout] = shape;
    let mut out = Tensor::zeros(shape.to_vec())?;
    if let Some(bias) = bias {
        if bias.shape() != [k] {
            return Err(Error::shape(format!(
                "bias of shape {:?} does not match {k} output channels",
                bias.shape()
            )));
        }
        let bias: &[T] = &bias.data();
        parallel::for_each_chunk_mut(&mut out.data_mut(), hout * wout, |plane, dst| {
            dst.fill(bias[plane % k]);
        });
    }
    Ok(out)
}

/// 2-D convolution of `input: [N, C, H, W]` with `kernel: [K, C, kh, kw]`,
/// producing `[N, K, Hout, Wout]`.
///
/// # Errors
///
/// [`Error::ShapeMismatch`] if ranks, channel counts, the kernel size in
/// `win` or the bias length disagree.
#[instrument(skip_all, level = "debug")]
pub fn conv2d<T: Scalar>(
    input: &Tensor<T>,
    kernel: &Tensor<T>,
    bias: Option<&Tensor<T>>,
    win: &Window2d,
) -> Result<Tensor<T>> {
    let [n, c, h, w] = dims4(input, "conv2d input")?;
    let [k, kc, kh, kw] = dims4(kernel, "conv2d kernel")?;
    if kc != c || [kh, kw] != win.kernel {
        return Err(Error::shape(format!(
            "kernel {:?} does not fit input {:?} with window {:?}",
            kernel.shape(),
            input.shape(),
            win.kernel
        )));
    }
    let (hout, wout) = win.conv_output(h, w)?;
    let mut out = init_output([n, k, hout, wout], bias)?;

    let rows = c * kh * kw;
    let cols = hout * wout;
    let mut columns = alloc_vec::<T>(rows * cols)?;
    let image: &[T] = &input.data();
    let weights: &[T] = &kernel.data();
    let mut dst_guard = out.data_mut();
    let dst: &mut [T] = &mut dst_guard;

    for b in 0..n {
        im2col(
            &mut columns,
            &image[b * c * h * w..][..c * h * w],
            c,
            h,
            w,
            win,
            hout,
            wout,
        )?;
        gemm_nn(
            k,
            cols,
            rows,
            weights,
            rows,
            &columns,
            cols,
            &mut dst[b * k * cols..][..k * cols],
            cols,
        )?;
    }
    drop(dst_guard);
    Ok(out)
}

/// Transposed 2-D convolution of `input: [N, Cin, H, W]` with
/// `kernel: [Cin, K, kh, kw]`, producing `[N, K, Hout, Wout]` with
/// `Hout = (H − 1)·stride − 2·pad + dilation·(kh − 1) + 1`.
///
/// # Errors
///
/// [`Error::ShapeMismatch`] if ranks, channel counts, the kernel size in
/// `win` or the bias length disagree.
#[instrument(skip_all, level = "debug")]
pub fn conv_transpose2d<T: Scalar>(
    input: &Tensor<T>,
    kernel: &Tensor<T>,
    bias: Option<&Tensor<T>>,
    win: &Window2d,
) -> Result<Tensor<T>> {
    let [n, cin, h, w] = dims4(input, "conv_transpose2d input")?;
    let [kcin, k, kh, kw] = dims4(kernel, "conv_transpose2d kernel")?;
    if kcin != cin || [kh, kw] != win.kernel {
        return Err(Error::shape(format!(
            "kernel {:?} does not fit input {:?} with window {:?}",
            kernel.shape(),
            input.shape(),
            win.kernel
        )));
    }
    let (hout, wout) = win.transpose_output(h, w)?;
    let mut out = init_output([n, k, hout, wout], bias)?;

    // Kernel as [Cin, K*kh*kw], transposed to [K*kh*kw, Cin].
    let rows = k * kh * kw;
    let weights: &[T] = &kernel.data();
    let mut transposed = alloc_vec::<T>(rows * cin)?;
    for (i, dst) in transposed.chunks_exact_mut(cin).enumerate() {
        for (j, v) in dst.iter_mut().enumerate() {
            *v = weights[j * rows + i];
        }
    }

    let cols = h * w;
    let mut columns = alloc_vec::<T>(rows * cols)?;
    let image: &[T] = &input.data();
    let plane = k * hout * wout;
    let mut dst_guard = out.data_mut();
    let dst: &mut [T] = &mut dst_guard;

    for b in 0..n {
        columns.fill(T::ZERO);
        gemm_nn(
            rows,
            cols,
            cin,
            &transposed,
            cin,
            &image[b * cin * cols..][..cin * cols],
            cols,
            &mut columns,
            cols,
        )?;
        col2im(
            &mut dst[b * plane..][..plane],
            &columns,
            k,
            hout,
            wout,
            win,
            h,
            w,
        )?;
    }
    drop(dst_guard);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_sizes_follow_closed_forms() {
        let cases = [
            (Window2d::new(3, 3), 8, 6, 6),
            (Window2d::new(3, 3).padding(1, 1), 8, 8, 8),
            (Window2d::new(3, 3).stride(2, 2).padding(1, 1), 8, 4, 4),
            (Window2d::new(3, 3).dilation(2, 2), 9, 5, 5),
            (Window2d::new(4, 4).stride(2, 2).padding(1, 1), 7, 3, 3),
            (Window2d::new(1, 1), 5, 5, 5),
        ];
        for (win, size, hout, wout) in cases {
            assert_eq!(win.conv_output(size, size).unwrap(), (hout, wout), "{win:?}");
        }
        assert!(Window2d::new(5, 5).conv_output(3, 3).is_err());
        assert!(Window2d::new(3, 3).stride(0, 1).conv_output(8, 8).is_err());
    }

    #[test]
    fn transpose_sizes_invert_conv_sizes() {
        let win = Window2d::new(4, 4).stride(2, 2).padding(1, 1);
        assert_eq!(win.transpose_output(4, 4).unwrap(), (8, 8));
        let win = Window2d::new(3, 3).stride(1, 1).padding(1, 1).dilation(1, 1);
        assert_eq!(win.transpose_output(5, 7).unwrap(), (5, 7));
        let win = Window2d::new(3, 3).dilation(2, 2);
        assert_eq!(win.transpose_output(5, 5).unwrap(), (9, 9));
        assert_eq!(win.conv_output(9, 9).unwrap(), (5, 5));
        let win = Window2d::new(3, 3).stride(2, 2).padding(1, 1).dilation(2, 2);
        assert_eq!(win.transpose_output(4, 6).unwrap(), (9, 13));
        assert_eq!(win.conv_output(9, 13).unwrap(), (4, 6));
        let win = Window2d::new(5, 1).stride(3, 1);
        assert_eq!(win.transpose_output(4, 7).unwrap(), (14, 7));
        assert_eq!(win.conv_output(14, 7).unwrap(), (4, 7));
        assert!(Window2d::new(1, 1).padding(1, 1).transpose_output(1, 1).is_err());
    }

    #[test]
    fn valid_columns_clip_padding() {
        let win = Window2d::new(3, 3).padding(1, 1);
        assert_eq!(win.valid_columns(0, 4, 4), (1, 4));
        assert_eq!(win.valid_columns(1, 4, 4), (0, 4));
        assert_eq!(win.valid_columns(2, 4, 4), (0, 3));
        let far = Window2d::new(1, 1).padding(0, 5);
        assert_eq!(far.valid_columns(0, 2, 12), (5, 7));
    }

    #[test]
    fn im2col_samples_dilated_taps_without_padding() {
        let image: Vec<f32> = (0..16).map(|x| x as f32).collect();
        let win = Window2d::new(2, 2).dilation(2, 2);
        assert!(win.is_unpadded());
        let (hout, wout) = win.conv_output(4, 4).unwrap();
        let mut columns = vec![-1.0; 4 * hout * wout];
        im2col(&mut columns, &image, 1, 4, 4, &win, hout, wout).unwrap();
        assert_eq!(
            columns,
            [
                0.0, 1.0, 4.0, 5.0, 2.0, 3.0, 6.0, 7.0, 8.0, 9.0, 12.0, 13.0, 10.0, 11.0, 14.0,
                15.0
            ]
        );
    }

    #[test]
    fn im2col_zero_fills_padding() {
        let image: Vec<f32> = (1..=4).map(|x| x as f32).collect();
        let win = Window2d::new(2, 2).padding(1, 1);
        let (hout, wout) = win.conv_output(2, 2).unwrap();
        assert_eq!((hout, wout), (3, 3));
        let mut cols = vec![f32::NAN; 4 * 9];
        im2col(&mut cols, &image, 1, 2, 2, &win, hout, wout).unwrap();
        // Kernel tap (0, 0) sees the image shifted down-right by one.
        assert_eq!(&cols[..9], &[0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 0.0, 3.0, 4.0]);
        // Kernel tap (1, 1) sees it shifted up-left.
        assert_eq!(&cols[27..], &[1.0, 2.0, 0.0, 3.0, 4.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn conv2d_with_bias_matches_direct_sum() {
        // 1 image, 1 channel, 3x3, one 2x2 kernel of ones, bias 10.
        let input = Tensor::<f64>::new(vec![1, 1, 3, 3], (0..9).map(f64::from).collect()).unwrap();
        let kernel = Tensor::<f64>::new(vec![1, 1, 2, 2], vec![1.0; 4]).unwrap();
        let bias = Tensor::<f64>::new(vec![1], vec![10.0]).unwrap();
        let out = conv2d(&input, &kernel, Some(&bias), &Window2d::new(2, 2)).unwrap();
        assert_eq!(out.shape(), &[1, 1, 2, 2]);
        assert_eq!(out.data(), &[18.0, 22.0, 30.0, 34.0]);
    }

    #[test]
    fn conv2d_handles_every_batch_image() {
        let input = Tensor::<f32>::new(vec![2, 1, 2, 2], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0])
            .unwrap();
        let kernel = Tensor::<f32>::new(vec![1, 1, 1, 1], vec![2.0]).unwrap();
        let out = conv2d(&input, &kernel, None, &Window2d::new(1, 1)).unwrap();
        assert_eq!(out.data(), &[2.0, 4.0, 6.0, 8.0, 10.0, 12.0, 14.0, 16.0]);
    }

    #[test]
    fn conv2d_rejects_mismatched_channels() {
        let input = Tensor::<f32>::zeros(vec![1, 2, 4, 4]).unwrap();
        let kernel = Tensor::<f32>::zeros(vec![1, 3, 3, 3]).unwrap();
        assert!(conv2d(&input, &kernel, None, &Window2d::new(3, 3)).is_err());
        let kernel = Tensor::<f32>::zeros(vec![1, 2, 3, 3]).unwrap();
        assert!(conv2d(&input, &kernel, None, &Window2d::new(2, 2)).is_err());
        let bias = Tensor::<f32>::zeros(vec![2]).unwrap();
        assert!(conv2d(&input, &kernel, Some(&bias), &Window2d::new(3, 3)).is_err());
    }

    #[test]
    fn conv_transpose_scatters_kernel_per_pixel() {
        // Stride 2, 2x2 kernel: every input pixel paints its own 2x2 block.
        let input = Tensor::<f64>::new(vec![1, 1, 2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let kernel = Tensor::<f64>::new(vec![1, 1, 2, 2], vec![1.0, 10.0, 100.0, 1000.0]).unwrap();
        let out = conv_transpose2d(&input, &kernel, None, &Window2d::new(2, 2).stride(2, 2)).unwrap();
        assert_eq!(out.shape(), &[1, 1, 4, 4]);
        assert_eq!(
            out.data(),
            &[
                1.0, 10.0, 2.0, 20.0, //
                100.0, 1000.0, 200.0, 2000.0, //
                3.0, 30.0, 4.0, 40.0, //
                300.0, 3000.0, 400.0, 4000.0,
            ]
        );
    }

    #[test]
    fn conv_transpose_overlaps_accumulate() {
        let input = Tensor::<f32>::new(vec![1, 1, 1, 2], vec![1.0, 1.0]).unwrap();
        let kernel = Tensor::<f32>::new(vec![1, 2, 1, 3], vec![1.0; 6]).unwrap();
        let bias = Tensor::<f32>::new(vec![2], vec![0.5, -0.5]).unwrap();
        let out = conv_transpose2d(&input, &kernel, Some(&bias), &Window2d::new(1, 3)).unwrap();
        assert_eq!(out.shape(), &[1, 2, 1, 4]);
        assert_eq!(out.data(), &[1.5, 2.5, 2.5, 1.5, 0.5, 1.5, 1.5, 0.5]);
    }
}
