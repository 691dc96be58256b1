//! # Kernels
//!
//! Every kernel takes input views and returns a freshly allocated output
//! view. Inputs are never mutated, except by the explicit `_inplace`
//! variants, which write through the view they are given.
//!
//! ## Submodules
//!
//! - [`gemm`]: blocked `C += A·B` / `C += A·Bᵀ` matrix multiplication
//! - [`conv`]: `im2col`/`col2im` lowering, convolution and transposed convolution
//! - [`pool`]: max, average and global average pooling
//! - [`linear`]: fully connected layer on the transposed GEMM path
//! - [`elementwise`]: unary maps and broadcasting binary ops
//! - [`normalize`]: softmax and batch normalisation
//! - [`shape`]: concatenation, gather and zero padding
//!
//! ## Execution
//!
//! Kernels split their work into independent iterations that write disjoint
//! parts of the output and run them through [`crate::parallel`]. Switching
//! [`crate::backend`] to sequential mode yields bit-identical results.
//!
//! Example:
//! ```rust
//! use tensor4::ops::conv::{conv2d, Window2d};
//! use tensor4::tensors::Tensor;
//!
//! let image = Tensor::<f32>::zeros(vec![1, 3, 8, 8]).unwrap();
//! let kernel = Tensor::<f32>::zeros(vec![4, 3, 3, 3]).unwrap();
//! let out = conv2d(&image, &kernel, None, &Window2d::new(3, 3).padding(1, 1)).unwrap();
//! assert_eq!(out.shape(), &[1, 4, 8, 8]);
//! ```

pub mod conv;
pub mod elementwise;
pub mod gemm;
pub mod linear;
pub mod normalize;
pub mod pool;
pub mod shape;
