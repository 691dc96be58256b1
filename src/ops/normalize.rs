//! Softmax and inference-time batch normalisation.

use tracing::instrument;

use super::elementwise::exp;
use crate::error::{normalize_axis, Error, Result};
use crate::parallel;
use crate::tensors::{numel, Float, Tensor};

/// Exponentiates every element, then divides each 1-D slice along `axis` by
/// its sum.
///
/// No maximum is subtracted before exponentiation: inputs of large magnitude
/// (around 88 for `f32`, 709 for `f64`) overflow to infinity and the affected
/// slice becomes NaN.
///
/// # Errors
///
/// [`Error::AxisOutOfRange`] for an invalid axis.
#[instrument(skip_all, level = "debug")]
pub fn softmax<T: Float>(input: &Tensor<T>, axis: isize) -> Result<Tensor<T>> {
    let axis = normalize_axis(axis, input.rank())?;
    let count = input.shape()[axis];
    let stride = numel(&input.shape()[axis + 1..]);
    let mut out = exp(input)?;

    parallel::for_each_chunk_mut(&mut out.data_mut(), count * stride, |_, block| {
        for s in 0..stride {
            let mut sum = T::ZERO;
            for j in 0..count {
                sum += block[j * stride + s];
            }
            for j in 0..count {
                block[j * stride + s] = block[j * stride + s] / sum;
            }
        }
    });
    Ok(out)
}

/// Running statistics and affine parameters of a batch-norm layer, one value
/// per channel.
#[derive(Debug, Clone)]
pub struct BatchNorm<T: Float> {
    pub weight: Tensor<T>,
    pub bias: Tensor<T>,
    pub running_mean: Tensor<T>,
    pub running_var: Tensor<T>,
    pub epsilon: T,
}

impl<T: Float> BatchNorm<T> {
    /// Fused per-channel `(scale, shift)` with `y = x · scale + shift`:
    /// `scale = weight / sqrt(var + eps)`, `shift = bias − mean · scale`.
    fn fused(&self, channels: usize) -> Result<Vec<(T, T)>> {
        for (name, t) in [
            ("weight", &self.weight),
            ("bias", &self.bias),
            ("running_mean", &self.running_mean),
            ("running_var", &self.running_var),
        ] {
            if t.shape() != [channels] {
                return Err(Error::shape(format!(
                    "batch-norm {name} has shape {:?}, expected [{channels}]",
                    t.shape()
                )));
            }
        }
        let (w, b) = (self.weight.data(), self.bias.data());
        let (mean, var) = (self.running_mean.data(), self.running_var.data());
        Ok((0..channels)
            .map(|c| {
                let scale = w[c] / (var[c] + self.epsilon).sqrt();
                (scale, b[c] - mean[c] * scale)
            })
            .collect())
    }
}

fn channel_dims<T: Float>(input: &Tensor<T>) -> Result<(usize, usize)> {
    if input.rank() < 2 {
        return Err(Error::shape(format!(
            "batch norm needs [N, C, ...], got {:?}",
            input.shape()
        )));
    }
    Ok((input.shape()[1], numel(&input.shape()[2..])))
}

/// Normalises `input: [N, C, ...]` per channel, returning a new tensor.
///
/// # Errors
///
/// [`Error::ShapeMismatch`] if `input` has rank below 2 or a parameter does
/// not hold exactly `C` values.
#[instrument(skip_all, level = "debug")]
pub fn batch_norm<T: Float>(input: &Tensor<T>, params: &BatchNorm<T>) -> Result<Tensor<T>> {
    let mut out = Tensor::from_slice(input.shape().to_vec(), &input.data())?;
    batch_norm_inplace(&mut out, params)?;
    Ok(out)
}

/// Normalises `input: [N, C, ...]` per channel, writing through the view.
///
/// # Errors
///
/// Same as [`batch_norm`].
#[instrument(skip_all, level = "debug")]
pub fn batch_norm_inplace<T: Float>(input: &mut Tensor<T>, params: &BatchNorm<T>) -> Result<()> {
    let (channels, inner) = channel_dims(input)?;
    let fused = params.fused(channels)?;
    if inner == 0 {
        return Ok(());
    }
    parallel::for_each_chunk_mut(&mut input.data_mut(), inner, |plane, data| {
        let (scale, shift) = fused[plane % channels];
        for v in data.iter_mut() {
            *v = *v * scale + shift;
        }
    });
    Ok(())
}
