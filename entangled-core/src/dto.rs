//! Versioned value object tying the canonicalizer, the codec and the delta
//! engine together.
//!
//! A [`Dto`] can start from any of its three representations (a plain value,
//! a canonical tree or a compact string). The other two are derived on first
//! request and cached.

use std::sync::OnceLock;

use crate::canonical::{self, Canonical, Node};
use crate::codec;
use crate::delta::Delta;
use crate::error::DtoError;
use crate::value::Value;

/// Returns the cell's value, computing it with `init` on first use.
///
/// A failed `init` leaves the cell empty, so the next call tries again.
pub(crate) fn memoize<T, E>(
    cell: &OnceLock<T>,
    init: impl FnOnce() -> Result<T, E>,
) -> Result<&T, E> {
    if let Some(value) = cell.get() {
        return Ok(value);
    }
    let value = init()?;
    Ok(cell.get_or_init(|| value))
}

#[derive(Debug, Clone)]
pub struct Dto {
    value: OnceLock<Value>,
    canonical: OnceLock<Node>,
    compressed: OnceLock<String>,
}

impl Dto {
    /// Wraps an object or array. `Undefined` members are removed up front.
    pub fn new(value: impl Into<Value>) -> Result<Self, DtoError> {
        let value = value.into();
        if !value.is_container() {
            return Err(DtoError::InvalidRootType);
        }
        Ok(Self {
            value: OnceLock::from(value.without_undefined()),
            canonical: OnceLock::new(),
            compressed: OnceLock::new(),
        })
    }

    pub fn from_canonical(node: Node) -> Self {
        Self {
            value: OnceLock::new(),
            canonical: OnceLock::from(node),
            compressed: OnceLock::new(),
        }
    }

    /// Wraps a compact string. It is only decoded when first needed.
    pub fn from_compressed(text: impl Into<String>) -> Self {
        Self {
            value: OnceLock::new(),
            canonical: OnceLock::new(),
            compressed: OnceLock::from(text.into()),
        }
    }

    /// Like [`Dto::from_compressed`], for input that arrives as a dynamic value.
    pub fn decompress_value(value: &Value) -> Result<Self, DtoError> {
        match value {
            Value::String(text) => Ok(Self::from_compressed(text.clone())),
            _ => Err(DtoError::DecompressExpectsString),
        }
    }

    pub fn value(&self) -> Result<&Value, DtoError> {
        memoize(&self.value, || Ok(canonical::unflatten_node(self.canonical()?)?))
    }

    pub fn canonical(&self) -> Result<&Node, DtoError> {
        memoize(&self.canonical, || {
            if let Some(value) = self.value.get() {
                return match canonical::flatten(value)? {
                    Canonical::Node(node) => Ok(node),
                    Canonical::Leaf(_) => Err(DtoError::InvalidRootType),
                };
            }
            match self.compressed.get() {
                Some(text) => Ok(codec::decompress(text)?),
                None => Err(DtoError::InvalidRootType),
            }
        })
    }

    pub fn compressed(&self) -> Result<&str, DtoError> {
        memoize(&self.compressed, || Ok(codec::compress(self.canonical()?)?)).map(String::as_str)
    }

    /// Delta that turns `self` into `other`.
    pub fn diff(&self, other: &Dto) -> Result<Delta, DtoError> {
        Ok(Delta::diff(self.canonical()?, other.canonical()?))
    }

    /// Structural equality of the canonical forms.
    pub fn same_as(&self, other: &Dto) -> Result<bool, DtoError> {
        Ok(self.canonical()? == other.canonical()?)
    }

    /// Returns a new DTO with `delta` applied; `self` is unchanged.
    pub fn patch(&self, delta: &Delta) -> Result<Dto, DtoError> {
        Ok(Dto::from_canonical(delta.patch(self.canonical()?)?))
    }

    pub fn patch_compressed(&self, compressed_delta: &str) -> Result<Dto, DtoError> {
        self.patch(&Delta::decompress(compressed_delta)?)
    }
}
