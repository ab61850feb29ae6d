//! Error types for the canonicalizer, the compact codec, the delta engine and
//! the DTO facade.
//!
//! Every failure on malformed input is reported through one of these enums;
//! nothing in this crate panics on bad data.

use thiserror::Error;

/// Errors raised while converting between [`Value`](crate::Value) and
/// canonical form.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CanonicalError {
    #[error("multidimensional arrays are not supported (nested array at index {index})")]
    MultidimensionalArray { index: usize },

    #[error(
        "entity array element {index} has no identifier ($id, _id, id, _key or key)"
    )]
    MissingIdentifier { index: usize },

    #[error("array mixes objects and primitives (element {index})")]
    MixedArray { index: usize },

    #[error("canonical root must be an object or an array of entities")]
    RootMustBeObjectOrArrayOfEntities,

    #[error("undefined has no canonical form")]
    UndefinedValue,

    #[error("non-finite number {0} has no canonical form")]
    NonFiniteNumber(f64),

    #[error("primitive array key {key:?} is not an index")]
    InvalidArrayIndex { key: String },

    #[error("array tag must be the integer 0 or 1")]
    InvalidArrayTag,

    #[error("arrays cannot appear inside canonical form")]
    ArrayNotAllowed,
}

/// Errors raised by the compact string codec.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    #[error("symbol index {index} is outside the single-character range")]
    IndexOverflow { index: usize },

    #[error("character {found:?} at position {position} is not a symbol reference")]
    InvalidSymbolChar { found: char, position: usize },

    #[error("compressed header is missing section {section}")]
    MissingSection { section: u8 },

    #[error("symbol table ends with a dangling escape")]
    DanglingEscape,

    #[error("unknown symbol index {index} at body position {position}")]
    UnknownSymbol { index: usize, position: usize },

    #[error("object key at body position {position} is not a string")]
    NonStringKey { position: usize },

    #[error("object opened without a key at body position {position}")]
    UnexpectedOpen { position: usize },

    #[error("object closed without a matching open at body position {position}")]
    UnexpectedClose { position: usize },

    #[error("value at body position {position} is outside of any object")]
    ValueOutsideObject { position: usize },

    #[error("key before body position {position} has no value")]
    DanglingKey { position: usize },

    #[error("compressed body ends inside an open object")]
    UnterminatedObject,

    #[error("compressed body is empty")]
    EmptyBody,

    #[error("unexpected data after the root object at body position {position}")]
    TrailingData { position: usize },

    #[error(transparent)]
    Canonical(#[from] CanonicalError),
}

/// Errors raised by the delta engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeltaError {
    #[error("cannot compress a delta without differences; check has_diff() first")]
    EmptyDeltaCompress,

    #[error("position {position} exceeds the short-key range")]
    TooManyKeys { position: usize },

    #[error("malformed delta: {0}")]
    Malformed(String),

    #[error("delta position {position} is out of range for a node with {len} keys")]
    PositionOutOfRange { position: usize, len: usize },

    #[error("delta recurses into {key:?}, which is not an object")]
    RecursionIntoLeaf { key: String },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Canonical(#[from] CanonicalError),
}

/// Errors raised by the [`Dto`](crate::Dto) facade.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DtoError {
    #[error("a DTO can only wrap an object or an array")]
    InvalidRootType,

    #[error("DTO decompression expects a string")]
    DecompressExpectsString,

    #[error(transparent)]
    Canonical(#[from] CanonicalError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Delta(#[from] DeltaError),
}
