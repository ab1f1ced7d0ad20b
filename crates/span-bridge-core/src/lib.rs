//! Core primitives for span-bridge
//!
//! This crate provides the building blocks shared by the export and parity
//! tooling:
//! - Tensor and shape types
//! - CPU kernels (matmul, softmax, layer norm, activations)
//! - Binary tensor serialization (headerless little-endian payloads)
//! - Word-level tokenization with character offset maps

pub mod error;
pub mod ops;
pub mod serialize;
pub mod tensor;
pub mod tokenizer;

pub use error::{Error, Result};
pub use serialize::{read_tensor, write_tensor, Precision, TensorWriter};
pub use tensor::{Shape, Tensor};
pub use tokenizer::{Encoding, SpecialTokens, WordTokenizer};

/// Core version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
