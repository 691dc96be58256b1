//! Fully connected layer.

use tracing::instrument;

use super::gemm::gemm_nt;
use crate::error::{Error, Result};
use crate::parallel;
use crate::tensors::{Scalar, Tensor};

/// `out[N, O] = input[N, I] · weight[O, I]ᵀ + bias[O]`.
///
/// The weight is stored one output row per line, so the product runs on the
/// transposed GEMM path without repacking.
///
/// # Errors
///
/// [`Error::ShapeMismatch`] if the operands are not 2-D, the input widths
/// differ, or the bias length is not `O`.
#[instrument(skip_all, level = "debug")]
pub fn linear<T: Scalar>(
    input: &Tensor<T>,
    weight: &Tensor<T>,
    bias: Option<&Tensor<T>>,
) -> Result<Tensor<T>> {
    let (&[n, inputs], &[outputs, w_inputs]) = (input.shape(), weight.shape()) else {
        return Err(Error::shape(format!(
            "linear needs 2-D input and weight, got {:?} and {:?}",
            input.shape(),
            weight.shape()
        )));
    };
    if inputs != w_inputs {
        return Err(Error::shape(format!(
            "input width {inputs} does not match weight {:?}",
            weight.shape()
        )));
    }

    let mut out = Tensor::zeros(vec![n, outputs])?;
    if let Some(bias) = bias {
        if bias.shape() != [outputs] {
            return Err(Error::shape(format!(
                "bias of shape {:?} does not match {outputs} outputs",
                bias.shape()
            )));
        }
        let bias: &[T] = &bias.data();
        parallel::for_each_chunk_mut(&mut out.data_mut(), outputs, |_, row| {
            row.copy_from_slice(bias);
        });
    }

    gemm_nt(
        n,
        outputs,
        inputs,
        &input.data(),
        inputs,
        &weight.data(),
        inputs,
        &mut out.data_mut(),
        outputs,
    )?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_applies_weight_rows_and_bias() {
        let x = Tensor::<f32>::new(vec![2, 3], vec![1.0, 2.0, 3.0, 0.0, 1.0, 0.0]).unwrap();
        let w = Tensor::<f32>::new(vec![2, 3], vec![1.0, 1.0, 1.0, 0.0, 2.0, 0.0]).unwrap();
        let b = Tensor::<f32>::new(vec![2], vec![0.5, -1.0]).unwrap();
        let y = linear(&x, &w, Some(&b)).unwrap();
        assert_eq!(y.shape(), &[2, 2]);
        assert_eq!(y.data(), &[6.5, 3.0, 1.5, 1.0]);
    }

    #[test]
    fn linear_rejects_width_mismatch() {
        let x = Tensor::<f32>::zeros(vec![2, 3]).unwrap();
        let w = Tensor::<f32>::zeros(vec![2, 4]).unwrap();
        assert!(linear(&x, &w, None).is_err());
        let w = Tensor::<f32>::zeros(vec![2, 3]).unwrap();
        let b = Tensor::<f32>::zeros(vec![3]).unwrap();
        assert!(linear(&x, &w, Some(&b)).is_err());
    }
}
