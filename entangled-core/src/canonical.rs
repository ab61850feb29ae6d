//! Canonical (array-free) form of a [`Value`].
//!
//! Arrays become keyed nodes that remember they were arrays:
//!
//! ```text
//! {"a": [{"id": 1, "x": 1}, {"id": 2}]}  →  {"a": {"@": 1, "1": {"id": 1, "x": 1}, "2": {"id": 2}}}
//! {"tags": ["x", "y"]}                   →  {"tags": {"@": 0, "0": "x", "1": "y"}}
//! ```
//!
//! The `@` tag lives in [`NodeKind`], never in the entry map. Source keys that
//! start with `@` are escaped with a second `@`, so a bare `@` in the entry
//! view always means "this node was an array".

use std::borrow::Cow;

use indexmap::IndexMap;

use crate::error::CanonicalError;
use crate::lexical;
use crate::value::{Map, Number, Value};

/// Reserved key carrying the array tag in the entry view.
pub const ARRAY_TAG: &str = "@";

const ESCAPE_PREFIX: char = '@';

/// Identifier fields of entity-array elements, in priority order.
pub const IDENTIFIER_FIELDS: [&str; 5] = ["$id", "_id", "id", "_key", "key"];

pub type Entries = IndexMap<String, Canonical>;

#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl Scalar {
    pub fn is_string(&self) -> bool {
        matches!(self, Scalar::String(_))
    }

    pub fn to_value(&self) -> Value {
        match self {
            Scalar::Null => Value::Null,
            Scalar::Bool(value) => Value::Bool(*value),
            Scalar::Int(value) => Value::Number(Number::Int(*value)),
            Scalar::Float(value) => Value::Number(Number::Float(*value)),
            Scalar::String(text) => Value::String(text.clone()),
        }
    }

    fn from_number(number: Number) -> Result<Self, CanonicalError> {
        match number {
            Number::Int(value) => Ok(Scalar::Int(value)),
            Number::Float(value) if value.is_finite() => Ok(Scalar::Float(value)),
            Number::Float(value) => Err(CanonicalError::NonFiniteNumber(value)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArrayKind {
    /// Primitives keyed by index. Tag `0`.
    Primitive,
    /// Objects keyed by identifier. Tag `1`.
    Entity,
}

impl ArrayKind {
    pub fn tag(self) -> i64 {
        match self {
            ArrayKind::Primitive => 0,
            ArrayKind::Entity => 1,
        }
    }

    pub fn from_tag(tag: i64) -> Option<Self> {
        match tag {
            0 => Some(ArrayKind::Primitive),
            1 => Some(ArrayKind::Entity),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Object,
    Array(ArrayKind),
}

/// A keyed node of the canonical tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    kind: NodeKind,
    entries: Entries,
}

impl Node {
    pub fn object() -> Self {
        Self {
            kind: NodeKind::Object,
            entries: Entries::new(),
        }
    }

    pub fn array(kind: ArrayKind) -> Self {
        Self {
            kind: NodeKind::Array(kind),
            entries: Entries::new(),
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn array_kind(&self) -> Option<ArrayKind> {
        match self.kind {
            NodeKind::Array(kind) => Some(kind),
            NodeKind::Object => None,
        }
    }

    pub fn entries(&self) -> &Entries {
        &self.entries
    }

    pub fn get(&self, key: &str) -> Option<&Canonical> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys of the entry view (entries plus the tag key), sorted.
    ///
    /// Positions in this list are what delta short keys refer to.
    pub(crate) fn view_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        if self.array_kind().is_some() {
            keys.push(ARRAY_TAG);
        }
        keys.sort_unstable();
        keys
    }

    pub(crate) fn view_get(&self, key: &str) -> Option<Cow<'_, Canonical>> {
        if key == ARRAY_TAG {
            return self
                .array_kind()
                .map(|kind| Cow::Owned(Canonical::Leaf(Scalar::Int(kind.tag()))));
        }
        self.entries.get(key).map(Cow::Borrowed)
    }

    /// Entry view with the tag written out as an ordinary `@` entry.
    pub(crate) fn into_view(self) -> Entries {
        match self.kind {
            NodeKind::Object => self.entries,
            NodeKind::Array(kind) => {
                let mut view = Entries::with_capacity(self.entries.len() + 1);
                view.insert(ARRAY_TAG.to_owned(), Canonical::Leaf(Scalar::Int(kind.tag())));
                view.extend(self.entries);
                view
            }
        }
    }

    /// Rebuilds a node from an entry view, absorbing the `@` entry into the kind.
    pub(crate) fn from_view(mut view: Entries) -> Result<Self, CanonicalError> {
        let kind = match view.shift_remove(ARRAY_TAG) {
            None => NodeKind::Object,
            Some(Canonical::Leaf(Scalar::Int(tag))) => {
                NodeKind::Array(ArrayKind::from_tag(tag).ok_or(CanonicalError::InvalidArrayTag)?)
            }
            Some(_) => return Err(CanonicalError::InvalidArrayTag),
        };
        Ok(Self {
            kind,
            entries: view,
        })
    }

    /// Renders the node as a plain value, tag included.
    ///
    /// This is the JSON picture of canonical form, e.g. `{"@": 1, "7": {...}}`.
    pub fn to_value(&self) -> Value {
        let mut map = Map::with_capacity(self.entries.len() + 1);
        if let Some(kind) = self.array_kind() {
            map.insert(ARRAY_TAG.to_owned(), Value::Number(Number::Int(kind.tag())));
        }
        for (key, value) in &self.entries {
            map.insert(key.clone(), value.to_value());
        }
        Value::Object(map)
    }

    /// Reads a node back from its plain-value picture (see [`Node::to_value`]).
    pub fn from_value(value: &Value) -> Result<Self, CanonicalError> {
        match Canonical::from_value(value)? {
            Canonical::Node(node) => Ok(node),
            Canonical::Leaf(_) => Err(CanonicalError::RootMustBeObjectOrArrayOfEntities),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Canonical {
    Leaf(Scalar),
    Node(Node),
}

impl Canonical {
    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Canonical::Node(node) => Some(node),
            Canonical::Leaf(_) => None,
        }
    }

    pub fn into_node(self) -> Option<Node> {
        match self {
            Canonical::Node(node) => Some(node),
            Canonical::Leaf(_) => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Canonical::Leaf(scalar) => scalar.to_value(),
            Canonical::Node(node) => node.to_value(),
        }
    }

    /// Reads an already-canonical plain value. Arrays are not allowed anywhere.
    pub fn from_value(value: &Value) -> Result<Self, CanonicalError> {
        match value {
            Value::Undefined => Err(CanonicalError::UndefinedValue),
            Value::Null => Ok(Canonical::Leaf(Scalar::Null)),
            Value::Bool(value) => Ok(Canonical::Leaf(Scalar::Bool(*value))),
            Value::Number(number) => Ok(Canonical::Leaf(Scalar::from_number(*number)?)),
            Value::String(text) => Ok(Canonical::Leaf(Scalar::String(text.clone()))),
            Value::Array(_) => Err(CanonicalError::ArrayNotAllowed),
            Value::Object(map) => {
                let mut view = Entries::with_capacity(map.len());
                for (key, value) in map {
                    if !value.is_undefined() {
                        view.insert(key.clone(), Canonical::from_value(value)?);
                    }
                }
                Ok(Canonical::Node(Node::from_view(view)?))
            }
        }
    }
}

impl From<Node> for Canonical {
    fn from(node: Node) -> Self {
        Canonical::Node(node)
    }
}

impl From<Scalar> for Canonical {
    fn from(scalar: Scalar) -> Self {
        Canonical::Leaf(scalar)
    }
}

/// Converts a value into canonical form.
///
/// `Undefined` members and elements are dropped. A bare `Undefined` has no
/// canonical form.
pub fn flatten(value: &Value) -> Result<Canonical, CanonicalError> {
    flatten_member(value)?.ok_or(CanonicalError::UndefinedValue)
}

fn flatten_member(value: &Value) -> Result<Option<Canonical>, CanonicalError> {
    let flat = match value {
        Value::Undefined => return Ok(None),
        Value::Null => Canonical::Leaf(Scalar::Null),
        Value::Bool(value) => Canonical::Leaf(Scalar::Bool(*value)),
        Value::Number(number) => Canonical::Leaf(Scalar::from_number(*number)?),
        Value::String(text) => Canonical::Leaf(Scalar::String(text.clone())),
        Value::Array(items) => Canonical::Node(flatten_array(items)?),
        Value::Object(map) => Canonical::Node(flatten_object(map)?),
    };
    Ok(Some(flat))
}

fn flatten_object(map: &Map) -> Result<Node, CanonicalError> {
    let mut node = Node::object();
    for (key, value) in map {
        if let Some(flat) = flatten_member(value)? {
            node.entries.insert(escape_key(key), flat);
        }
    }
    Ok(node)
}

fn flatten_array(items: &[Value]) -> Result<Node, CanonicalError> {
    let mut kind = None;
    let mut entries = Entries::with_capacity(items.len());

    for (index, item) in items.iter().enumerate() {
        match item {
            Value::Undefined => {}
            Value::Array(_) => return Err(CanonicalError::MultidimensionalArray { index }),
            Value::Object(entity) => {
                if kind == Some(ArrayKind::Primitive) {
                    return Err(CanonicalError::MixedArray { index });
                }
                kind = Some(ArrayKind::Entity);
                let id = identifier_of(entity).ok_or(CanonicalError::MissingIdentifier { index })?;
                entries.insert(escape_key(&id), Canonical::Node(flatten_object(entity)?));
            }
            primitive => {
                if kind == Some(ArrayKind::Entity) {
                    return Err(CanonicalError::MixedArray { index });
                }
                kind = Some(ArrayKind::Primitive);
                // Keys count kept elements, so skipped ones leave no gap.
                if let Some(flat) = flatten_member(primitive)? {
                    entries.insert(entries.len().to_string(), flat);
                }
            }
        }
    }

    Ok(Node {
        kind: NodeKind::Array(kind.unwrap_or(ArrayKind::Primitive)),
        entries,
    })
}

/// First usable identifier of an entity, stringified.
pub fn identifier_of(entity: &Map) -> Option<String> {
    IDENTIFIER_FIELDS
        .iter()
        .find_map(|field| match entity.get(*field)? {
            Value::String(id) if !id.is_empty() => Some(id.clone()),
            Value::Number(Number::Int(id)) => Some(id.to_string()),
            Value::Number(Number::Float(id)) if id.is_finite() => Some(lexical::format_float(*id)),
            _ => None,
        })
}

fn escape_key(key: &str) -> String {
    if key.starts_with(ESCAPE_PREFIX) {
        let mut escaped = String::with_capacity(key.len() + 1);
        escaped.push(ESCAPE_PREFIX);
        escaped.push_str(key);
        escaped
    } else {
        key.to_owned()
    }
}

fn unescape_key(key: &str) -> &str {
    key.strip_prefix(ESCAPE_PREFIX).unwrap_or(key)
}

/// Converts canonical form back into a value.
pub fn unflatten(canonical: &Canonical) -> Result<Value, CanonicalError> {
    match canonical {
        Canonical::Node(node) => unflatten_node(node),
        Canonical::Leaf(_) => Err(CanonicalError::RootMustBeObjectOrArrayOfEntities),
    }
}

pub fn unflatten_node(node: &Node) -> Result<Value, CanonicalError> {
    match node.kind {
        NodeKind::Object => {
            let mut map = Map::with_capacity(node.entries.len());
            for (key, value) in &node.entries {
                map.insert(unescape_key(key).to_owned(), unflatten_member(value)?);
            }
            Ok(Value::Object(map))
        }
        NodeKind::Array(ArrayKind::Entity) => Ok(Value::Array(
            node.entries
                .values()
                .map(unflatten_member)
                .collect::<Result<_, _>>()?,
        )),
        NodeKind::Array(ArrayKind::Primitive) => {
            let mut indexed = Vec::with_capacity(node.entries.len());
            for (key, value) in &node.entries {
                let index = key
                    .parse::<usize>()
                    .map_err(|_| CanonicalError::InvalidArrayIndex { key: key.clone() })?;
                indexed.push((index, unflatten_member(value)?));
            }
            indexed.sort_by_key(|(index, _)| *index);
            Ok(Value::Array(indexed.into_iter().map(|(_, value)| value).collect()))
        }
    }
}

fn unflatten_member(canonical: &Canonical) -> Result<Value, CanonicalError> {
    match canonical {
        Canonical::Leaf(scalar) => Ok(scalar.to_value()),
        Canonical::Node(node) => unflatten_node(node),
    }
}
