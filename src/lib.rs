//! tensor4: CPU tensor views and inference kernels for convolutional networks.
//!
//! Designed for running the forward pass of a convolutional generator on the
//! CPU, with no external math library and a small, explicit core.
//!
//! # Features
//!
//! - Shared-buffer tensor views with zero-copy slicing and reshaping.
//! - Blocked GEMM, convolution and transposed convolution via im2col/col2im.
//! - Broadcasting elementwise ops, softmax, batch norm, pooling, concat, gather.
//! - Weight files loaded without copying payloads into tensors.
//!
//! # Modules
//!
//! - [`tensors`]: the [`Tensor`](tensors::Tensor) view type and its element types.
//! - [`ops`]: every numerical kernel.
//! - [`parallel`]: the data-parallel loop primitives kernels run on.
//! - [`backend`]: parallel vs. sequential execution switch.
//! - [`modelio`]: weight file reading and writing.
//! - [`codec`]: payload compression for weight files.
//! - [`error`]: the crate-wide [`Error`] type.
//!
//! # Example
//!
//! ```rust
//! use tensor4::ops::{conv::{conv2d, Window2d}, elementwise::leaky_relu};
//! use tensor4::tensors::Tensor;
//!
//! let image = Tensor::<f32>::randn(vec![1, 3, 16, 16]).unwrap();
//! let kernel = Tensor::<f32>::randn(vec![8, 3, 3, 3]).unwrap();
//! let features = conv2d(&image, &kernel, None, &Window2d::new(3, 3).padding(1, 1)).unwrap();
//! let activated = leaky_relu(&features, 0.2).unwrap();
//! assert_eq!(activated.shape(), &[1, 8, 16, 16]);
//! ```

pub mod backend;
pub mod codec;
pub mod error;
pub mod modelio;
pub mod ops;
pub mod parallel;
pub mod tensors;

pub use error::{Error, Result};
pub use tensors::Tensor;
