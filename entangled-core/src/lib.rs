//! # entangled-core — data representation for topic synchronization
//!
//! Pure, synchronous building blocks shared by the server and the client.
//!
//! ## Pipeline
//!
//! ```text
//! ┌───────────┐ flatten ┌────────────┐ compress ┌──────────────┐
//! │ Value     │ ──────► │ Canonical  │ ───────► │ compact text │ ──► wire
//! │ (JSON-ish)│ ◄────── │ (no arrays)│ ◄─────── │              │
//! └───────────┘unflatten└─────┬──────┘decompress└──────────────┘
//!                             │ diff / patch
//!                             ▼
//!                       ┌────────────┐ compress
//!                       │ Delta      │ ───────► compact text ──► wire
//!                       └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`value`] — dynamic values with an int/float distinction and `Undefined`
//! - [`canonical`] — array-free canonical form (flatten / unflatten)
//! - [`codec`] — compact single-character symbol encoding
//! - [`delta`] — structural diff / patch with positional short keys
//! - [`dto`] — lazily cached value / canonical / compact triple

pub mod canonical;
pub mod codec;
pub mod delta;
pub mod dto;
pub mod error;
mod lexical;
pub mod value;

// Re-exports for convenience
pub use canonical::{flatten, unflatten, ArrayKind, Canonical, Node, NodeKind, Scalar};
pub use delta::{CompressedDelta, Delta};
pub use dto::Dto;
pub use error::{CanonicalError, CodecError, DeltaError, DtoError};
pub use value::{Map, Number, Value};
