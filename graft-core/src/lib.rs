//! # graft-core
//!
//! Value model and value codec shared by the master and remote sides of a
//! graft session.
//!
//! - [`value`]: the [`Value`] union, generic over how each peer represents
//!   remote objects and functions
//! - [`matrix`]: dense and sparse numeric arrays
//! - [`wire`]: the format-neutral [`Wire`] tree and [`Handle`]
//! - [`format`]: JSON and CBOR message formats
//! - [`codec`]: recursive [`Value`] to [`Wire`] conversion

pub mod codec;
pub mod error;
pub mod format;
pub mod matrix;
pub mod value;
pub mod wire;

pub use codec::{NoReferences, RefKey, References, ValueCodec};
pub use error::{CodecError, CodecResult};
pub use format::{MessageFormat, PayloadEncoding};
pub use matrix::{Complex, DType, Element, Matrix, SparseMatrix};
pub use value::Value;
pub use wire::{Handle, Wire};
