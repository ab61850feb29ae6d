//! Structural diff and patch over canonical trees.
//!
//! Both nodes' entry views are walked in sorted key order with two cursors.
//! Changes to keys that already exist in the old node are addressed by the
//! key's position in that sorted order, written as a single short-key
//! character when the delta is encoded:
//!
//! ```text
//! old keys (sorted):   "@"  "a"  "b"  "c"        new: {"a": 2, "c": {...}, "z": 1}
//! positions:            0    1    2    3
//!
//! delta: { a: {"z": 1},          additions, keyed by new name
//!          m: {"1": 2},          modifications, keyed by old position
//!          d: {"0": 1, "2": 1},  deletions
//!          r: {"3": {...}} }     recursions into changed child objects
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use crate::canonical::{Canonical, Entries, Node, NodeKind, Scalar};
use crate::codec;
use crate::dto::memoize;
use crate::error::DeltaError;

const ADDITIONS: &str = "a";
const MODIFICATIONS: &str = "m";
const DELETIONS: &str = "d";
const RECURSIONS: &str = "r";

const DELETION_MARKER: i64 = 1;

const SHORT_KEY_BASE: u32 = '0' as u32;
const SKIPPED_TAG: u32 = '@' as u32;
const SURROGATE_START: u32 = 0xD800;
const SURROGATE_LEN: u32 = 0x800;
const BMP_END: u32 = 0xFFFF;

/// Largest old-key position a short key can address (maps to `U+FFFF`).
pub const MAX_SHORT_KEY_POSITION: usize = 63_438;

/// Maps an old-key position to its short key.
///
/// Starts at `'0'`, skips `'@'` and the surrogate block, and stays within the
/// Basic Multilingual Plane.
pub fn position_to_key(position: usize) -> Result<char, DeltaError> {
    let overflow = || DeltaError::TooManyKeys { position };
    let mut code = u32::try_from(position)
        .ok()
        .and_then(|position| position.checked_add(SHORT_KEY_BASE))
        .ok_or_else(overflow)?;
    if code >= SKIPPED_TAG {
        code += 1;
    }
    if code >= SURROGATE_START {
        code = code.checked_add(SURROGATE_LEN).ok_or_else(overflow)?;
    }
    if code > BMP_END {
        return Err(overflow());
    }
    char::from_u32(code).ok_or_else(overflow)
}

/// Inverse of [`position_to_key`]. The key must be exactly one character.
pub fn key_to_position(key: &str) -> Option<usize> {
    let mut chars = key.chars();
    let c = chars.next()?;
    if chars.next().is_some() {
        return None;
    }
    let mut code = u32::from(c);
    if code < SHORT_KEY_BASE || code == SKIPPED_TAG || code > BMP_END {
        return None;
    }
    if code >= SURROGATE_START + SURROGATE_LEN {
        code -= SURROGATE_LEN;
    }
    if code > SKIPPED_TAG {
        code -= 1;
    }
    usize::try_from(code - SHORT_KEY_BASE).ok()
}

/// Difference between two canonical nodes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delta {
    additions: Entries,
    modifications: BTreeMap<usize, Canonical>,
    deletions: BTreeSet<usize>,
    recursions: BTreeMap<usize, Delta>,
}

impl Delta {
    /// Computes the delta that turns `old` into `new`.
    pub fn diff(old: &Node, new: &Node) -> Delta {
        let old_keys = old.view_keys();
        let new_keys = new.view_keys();
        let mut delta = Delta::default();
        let (mut ai, mut bi) = (0, 0);

        loop {
            match (old_keys.get(ai), new_keys.get(bi)) {
                (Some(a), Some(b)) if a == b => {
                    if let (Some(before), Some(after)) = (old.view_get(a), new.view_get(b)) {
                        match (before.as_ref(), after.as_ref()) {
                            (Canonical::Node(x), Canonical::Node(y)) => {
                                let nested = Delta::diff(x, y);
                                if nested.has_diff() {
                                    delta.recursions.insert(ai, nested);
                                }
                            }
                            (x, y) if x != y => {
                                delta.modifications.insert(ai, y.clone());
                            }
                            _ => {}
                        }
                    }
                    ai += 1;
                    bi += 1;
                }
                (Some(a), Some(b)) if a > b => {
                    delta.add_from(new, b);
                    bi += 1;
                }
                (None, Some(b)) => {
                    delta.add_from(new, b);
                    bi += 1;
                }
                (Some(_), _) => {
                    delta.deletions.insert(ai);
                    ai += 1;
                }
                (None, None) => break,
            }
        }
        delta
    }

    fn add_from(&mut self, node: &Node, key: &str) {
        if let Some(value) = node.view_get(key) {
            self.additions.insert(key.to_owned(), value.into_owned());
        }
    }

    /// `true` if applying this delta changes anything.
    pub fn has_diff(&self) -> bool {
        !self.additions.is_empty()
            || !self.modifications.is_empty()
            || !self.deletions.is_empty()
            || !self.recursions.is_empty()
    }

    pub fn additions(&self) -> &Entries {
        &self.additions
    }

    pub fn modifications(&self) -> &BTreeMap<usize, Canonical> {
        &self.modifications
    }

    pub fn deletions(&self) -> &BTreeSet<usize> {
        &self.deletions
    }

    pub fn recursions(&self) -> &BTreeMap<usize, Delta> {
        &self.recursions
    }

    /// Applies the delta to a copy of `old`. `old` itself is left untouched.
    pub fn patch(&self, old: &Node) -> Result<Node, DeltaError> {
        patch_owned(old.clone(), self)
    }

    /// The delta as a canonical object with members `a`, `m`, `d` and `r`.
    pub fn to_canonical(&self) -> Result<Node, DeltaError> {
        let mut view = Entries::new();
        if !self.additions.is_empty() {
            let additions = Node::from_view(self.additions.clone())?;
            view.insert(ADDITIONS.to_owned(), Canonical::Node(additions));
        }
        if !self.modifications.is_empty() {
            let mut entries = Entries::with_capacity(self.modifications.len());
            for (position, value) in &self.modifications {
                entries.insert(position_to_key(*position)?.to_string(), value.clone());
            }
            view.insert(MODIFICATIONS.to_owned(), Canonical::Node(Node::from_view(entries)?));
        }
        if !self.deletions.is_empty() {
            let mut entries = Entries::with_capacity(self.deletions.len());
            for position in &self.deletions {
                entries.insert(
                    position_to_key(*position)?.to_string(),
                    Canonical::Leaf(Scalar::Int(DELETION_MARKER)),
                );
            }
            view.insert(DELETIONS.to_owned(), Canonical::Node(Node::from_view(entries)?));
        }
        if !self.recursions.is_empty() {
            let mut entries = Entries::with_capacity(self.recursions.len());
            for (position, nested) in &self.recursions {
                entries.insert(
                    position_to_key(*position)?.to_string(),
                    Canonical::Node(nested.to_canonical()?),
                );
            }
            view.insert(RECURSIONS.to_owned(), Canonical::Node(Node::from_view(entries)?));
        }
        Ok(Node::from_view(view)?)
    }

    /// Reads a delta back from its canonical object.
    pub fn from_canonical(node: &Node) -> Result<Delta, DeltaError> {
        if node.kind() != NodeKind::Object {
            return Err(DeltaError::Malformed("delta root must be an object".into()));
        }
        let mut delta = Delta::default();
        for (member, value) in node.entries() {
            let container = value
                .as_node()
                .ok_or_else(|| DeltaError::Malformed(format!("member {member:?} is not an object")))?;
            match member.as_str() {
                ADDITIONS => delta.additions = container.clone().into_view(),
                MODIFICATIONS => {
                    for (key, value) in container.entries() {
                        delta.modifications.insert(short_position(key)?, value.clone());
                    }
                }
                DELETIONS => {
                    for key in container.entries().keys() {
                        delta.deletions.insert(short_position(key)?);
                    }
                }
                RECURSIONS => {
                    for (key, value) in container.entries() {
                        let nested = value.as_node().ok_or_else(|| {
                            DeltaError::Malformed(format!("recursion {key:?} is not an object"))
                        })?;
                        delta
                            .recursions
                            .insert(short_position(key)?, Delta::from_canonical(nested)?);
                    }
                }
                other => return Err(DeltaError::Malformed(format!("unknown member {other:?}"))),
            }
        }
        Ok(delta)
    }

    /// Encodes the delta with the compact codec.
    ///
    /// Fails with [`DeltaError::EmptyDeltaCompress`] when there is nothing to encode.
    pub fn compress(&self) -> Result<String, DeltaError> {
        if !self.has_diff() {
            return Err(DeltaError::EmptyDeltaCompress);
        }
        Ok(codec::compress(&self.to_canonical()?)?)
    }

    pub fn decompress(text: &str) -> Result<Delta, DeltaError> {
        Delta::from_canonical(&codec::decompress(text)?)
    }
}

fn short_position(key: &str) -> Result<usize, DeltaError> {
    key_to_position(key).ok_or_else(|| DeltaError::Malformed(format!("invalid short key {key:?}")))
}

fn patch_owned(node: Node, delta: &Delta) -> Result<Node, DeltaError> {
    if !delta.has_diff() {
        return Ok(node);
    }
    let keys: Vec<String> = node.view_keys().into_iter().map(str::to_owned).collect();
    let key_at = |position: usize| {
        keys.get(position).ok_or(DeltaError::PositionOutOfRange {
            position,
            len: keys.len(),
        })
    };
    let mut view = node.into_view();

    for (key, value) in &delta.additions {
        view.insert(key.clone(), value.clone());
    }
    for (position, value) in &delta.modifications {
        view.insert(key_at(*position)?.clone(), value.clone());
    }
    for (position, nested) in &delta.recursions {
        let key = key_at(*position)?;
        match view.get_mut(key) {
            Some(Canonical::Node(child)) => {
                let owned = std::mem::replace(child, Node::object());
                *child = patch_owned(owned, nested)?;
            }
            _ => return Err(DeltaError::RecursionIntoLeaf { key: key.clone() }),
        }
    }
    for position in &delta.deletions {
        view.shift_remove(key_at(*position)?);
    }

    Ok(Node::from_view(view)?)
}

/// A delta together with its compact form, each computed on first use.
#[derive(Debug, Clone)]
pub struct CompressedDelta {
    delta: OnceLock<Delta>,
    compressed: OnceLock<String>,
}

impl CompressedDelta {
    pub fn from_delta(delta: Delta) -> Self {
        Self {
            delta: OnceLock::from(delta),
            compressed: OnceLock::new(),
        }
    }

    pub fn from_compressed(text: impl Into<String>) -> Self {
        Self {
            delta: OnceLock::new(),
            compressed: OnceLock::from(text.into()),
        }
    }

    pub fn delta(&self) -> Result<&Delta, DeltaError> {
        memoize(&self.delta, || match self.compressed.get() {
            Some(text) => Delta::decompress(text),
            None => Ok(Delta::default()),
        })
    }

    pub fn compressed(&self) -> Result<&str, DeltaError> {
        memoize(&self.compressed, || self.delta()?.compress()).map(String::as_str)
    }

    pub fn has_diff(&self) -> Result<bool, DeltaError> {
        Ok(self.delta()?.has_diff())
    }
}
