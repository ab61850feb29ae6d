//! Compact string codec for canonical trees.
//!
//! ```text
//! ┌──────────────────┬────┬─────────────────────────┬────┬────────────────────┐
//! │ forced positions │ || │ dynamic symbols         │ || │ body               │
//! │ c|c|c            │    │ sym|sym|sym  (\| \\)    │    │ one char per token │
//! └──────────────────┴────┴─────────────────────────┴────┴────────────────────┘
//! ```
//!
//! Every token of the body is a single character naming an index into the
//! symbol table: the fixed default table followed by the dynamic symbols of
//! the header. Two reserved entries open and close an object; inside an
//! object, keys and values alternate. A node that was an array writes its tag
//! as an ordinary `@` entry first.
//!
//! Dynamic symbols are plain text, so numbers, booleans and `null` are
//! re-typed on decode. Genuine strings that would be re-typed that way have
//! their body position listed in the first header section.

use std::collections::{HashMap, HashSet};

use crate::canonical::{Canonical, Entries, Node, Scalar, ARRAY_TAG};
use crate::error::CodecError;
use crate::lexical::{self, Token};

const SEPARATOR: char = '|';
const ESCAPE: char = '\\';
const SECTION_END: &str = "||";

const CHAR_BASE: u32 = 35;
const SKIPPED_BACKSLASH: u32 = 92;
const SKIPPED_PIPE: u32 = 124;
const SURROGATE_START: u32 = 0xD800;
const SURROGATE_LEN: u32 = 0x800;

/// Largest index [`index_to_char`] can represent (maps to `U+10FFFF`).
pub const MAX_SYMBOL_INDEX: usize = 1_112_026;

const OPEN_INDEX: usize = 0;
const CLOSE_INDEX: usize = 1;

#[derive(Debug, Clone, PartialEq)]
enum Symbol {
    Open,
    Close,
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ScalarKey {
    Int(i64),
    Float(u64),
    Bool(bool),
    Null,
}

fn default_symbols() -> Vec<Symbol> {
    let mut table = vec![Symbol::Open, Symbol::Close];
    for text in ["", " ", "{", "}", "|", ":", ARRAY_TAG, "a", "m", "d", "r"] {
        table.push(Symbol::Str(text.to_owned()));
    }
    table.extend((0..10).map(|digit: i64| Symbol::Str(digit.to_string())));
    table.extend((0..10).map(Symbol::Int));
    for text in ["$id", "_id", "id", "key", "_key"] {
        table.push(Symbol::Str(text.to_owned()));
    }
    table.extend([Symbol::Bool(true), Symbol::Bool(false), Symbol::Null]);
    for text in ["true", "false", "null"] {
        table.push(Symbol::Str(text.to_owned()));
    }
    table
}

/// Maps a symbol index to its body character.
///
/// Code points start at 35 and skip `\`, `|` and the surrogate block.
pub fn index_to_char(index: usize) -> Result<char, CodecError> {
    let overflow = || CodecError::IndexOverflow { index };
    let mut code = u32::try_from(index)
        .ok()
        .and_then(|index| index.checked_add(CHAR_BASE))
        .ok_or_else(overflow)?;
    if code >= SKIPPED_BACKSLASH {
        code += 1;
    }
    if code >= SKIPPED_PIPE {
        code += 1;
    }
    if code >= SURROGATE_START {
        code = code.checked_add(SURROGATE_LEN).ok_or_else(overflow)?;
    }
    char::from_u32(code).ok_or_else(overflow)
}

/// Inverse of [`index_to_char`]; `None` for characters outside the mapping.
pub fn char_to_index(c: char) -> Option<usize> {
    let mut code = u32::from(c);
    if code < CHAR_BASE || code == SKIPPED_BACKSLASH || code == SKIPPED_PIPE {
        return None;
    }
    if code >= SURROGATE_START + SURROGATE_LEN {
        code -= SURROGATE_LEN;
    }
    if code > SKIPPED_PIPE {
        code -= 1;
    }
    if code > SKIPPED_BACKSLASH {
        code -= 1;
    }
    usize::try_from(code - CHAR_BASE).ok()
}

/// Encodes a canonical tree.
pub fn compress(node: &Node) -> Result<String, CodecError> {
    let mut encoder = Encoder::new();
    encoder.node(node)?;
    encoder.finish()
}

/// Decodes a compact string produced by [`compress`].
pub fn decompress(text: &str) -> Result<Node, CodecError> {
    let mut chars = text.chars().peekable();
    let forced = read_forced(&mut chars)?;
    let mut table = default_symbols();
    read_symbols(&mut chars, &mut table)?;
    decode_body(chars, &table, &forced)
}

struct Encoder {
    strings: HashMap<String, usize>,
    scalars: HashMap<ScalarKey, usize>,
    next_index: usize,
    dynamic: Vec<String>,
    forced: Vec<usize>,
    body: String,
    body_len: usize,
}

impl Encoder {
    fn new() -> Self {
        let defaults = default_symbols();
        let mut strings = HashMap::new();
        let mut scalars = HashMap::new();
        let next_index = defaults.len();
        for (index, symbol) in defaults.into_iter().enumerate() {
            match symbol {
                Symbol::Open | Symbol::Close => {}
                Symbol::Str(text) => {
                    strings.insert(text, index);
                }
                Symbol::Int(value) => {
                    scalars.insert(ScalarKey::Int(value), index);
                }
                Symbol::Float(value) => {
                    scalars.insert(ScalarKey::Float(value.to_bits()), index);
                }
                Symbol::Bool(value) => {
                    scalars.insert(ScalarKey::Bool(value), index);
                }
                Symbol::Null => {
                    scalars.insert(ScalarKey::Null, index);
                }
            }
        }
        Self {
            strings,
            scalars,
            next_index,
            dynamic: Vec::new(),
            forced: Vec::new(),
            body: String::new(),
            body_len: 0,
        }
    }

    fn emit(&mut self, index: usize) -> Result<(), CodecError> {
        self.body.push(index_to_char(index)?);
        self.body_len += 1;
        Ok(())
    }

    fn string_index(&mut self, text: &str) -> usize {
        if let Some(&index) = self.strings.get(text) {
            return index;
        }
        let index = self.allocate(text.to_owned());
        self.strings.insert(text.to_owned(), index);
        index
    }

    fn scalar_index(&mut self, key: ScalarKey, text: impl FnOnce() -> String) -> usize {
        if let Some(&index) = self.scalars.get(&key) {
            return index;
        }
        let index = self.allocate(text());
        self.scalars.insert(key, index);
        index
    }

    fn allocate(&mut self, text: String) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        self.dynamic.push(text);
        index
    }

    fn node(&mut self, node: &Node) -> Result<(), CodecError> {
        self.emit(OPEN_INDEX)?;
        if let Some(kind) = node.array_kind() {
            let key = self.string_index(ARRAY_TAG);
            self.emit(key)?;
            self.leaf(&Scalar::Int(kind.tag()))?;
        }
        for (key, value) in node.entries() {
            let key = self.string_index(key);
            self.emit(key)?;
            match value {
                Canonical::Leaf(scalar) => self.leaf(scalar)?,
                Canonical::Node(child) => self.node(child)?,
            }
        }
        self.emit(CLOSE_INDEX)
    }

    fn leaf(&mut self, scalar: &Scalar) -> Result<(), CodecError> {
        let index = match scalar {
            Scalar::String(text) => {
                if lexical::classify(text).is_some() {
                    self.forced.push(self.body_len);
                }
                self.string_index(text)
            }
            Scalar::Int(value) => self.scalar_index(ScalarKey::Int(*value), || value.to_string()),
            Scalar::Float(value) => self.scalar_index(ScalarKey::Float(value.to_bits()), || {
                lexical::format_float(*value)
            }),
            Scalar::Bool(value) => self.scalar_index(ScalarKey::Bool(*value), || value.to_string()),
            Scalar::Null => self.scalar_index(ScalarKey::Null, || "null".to_owned()),
        };
        self.emit(index)
    }

    fn finish(self) -> Result<String, CodecError> {
        let mut out = String::with_capacity(self.body.len() + self.dynamic.len() * 4 + 4);
        for (i, position) in self.forced.iter().enumerate() {
            if i > 0 {
                out.push(SEPARATOR);
            }
            out.push(index_to_char(*position)?);
        }
        out.push_str(SECTION_END);
        for (i, symbol) in self.dynamic.iter().enumerate() {
            if i > 0 {
                out.push(SEPARATOR);
            }
            for c in symbol.chars() {
                if c == SEPARATOR || c == ESCAPE {
                    out.push(ESCAPE);
                }
                out.push(c);
            }
        }
        out.push_str(SECTION_END);
        out.push_str(&self.body);
        Ok(out)
    }
}

type Chars<'a> = std::iter::Peekable<std::str::Chars<'a>>;

fn read_forced(chars: &mut Chars<'_>) -> Result<HashSet<usize>, CodecError> {
    let mut forced = HashSet::new();
    let mut position = 0;
    loop {
        match chars.next() {
            None => return Err(CodecError::MissingSection { section: 1 }),
            Some(SEPARATOR) => {
                if chars.peek() == Some(&SEPARATOR) {
                    chars.next();
                    return Ok(forced);
                }
            }
            Some(c) => {
                let index = char_to_index(c)
                    .ok_or(CodecError::InvalidSymbolChar { found: c, position })?;
                forced.insert(index);
            }
        }
        position += 1;
    }
}

fn read_symbols(chars: &mut Chars<'_>, table: &mut Vec<Symbol>) -> Result<(), CodecError> {
    let mut current = String::new();
    loop {
        match chars.next() {
            None => return Err(CodecError::MissingSection { section: 2 }),
            Some(ESCAPE) => current.push(chars.next().ok_or(CodecError::DanglingEscape)?),
            Some(SEPARATOR) => {
                let end = chars.peek() == Some(&SEPARATOR);
                if end {
                    chars.next();
                }
                if !end || !current.is_empty() {
                    table.push(Symbol::Str(std::mem::take(&mut current)));
                }
                if end {
                    return Ok(());
                }
            }
            Some(c) => current.push(c),
        }
    }
}

struct Frame {
    /// Key under which this object hangs in its parent (`None` for the root).
    key: Option<String>,
    entries: Entries,
    pending_key: Option<String>,
}

impl Frame {
    fn new(key: Option<String>) -> Self {
        Self {
            key,
            entries: Entries::new(),
            pending_key: None,
        }
    }
}

fn decode_body(
    body: impl Iterator<Item = char>,
    table: &[Symbol],
    forced: &HashSet<usize>,
) -> Result<Node, CodecError> {
    let mut stack: Vec<Frame> = Vec::new();
    let mut root = None;

    for (position, c) in body.enumerate() {
        if root.is_some() {
            return Err(CodecError::TrailingData { position });
        }
        let index = char_to_index(c).ok_or(CodecError::InvalidSymbolChar { found: c, position })?;
        let symbol = table
            .get(index)
            .ok_or(CodecError::UnknownSymbol { index, position })?;

        match symbol {
            Symbol::Open => {
                let key = match stack.last_mut() {
                    None => None,
                    Some(parent) => Some(
                        parent
                            .pending_key
                            .take()
                            .ok_or(CodecError::UnexpectedOpen { position })?,
                    ),
                };
                stack.push(Frame::new(key));
            }
            Symbol::Close => {
                let frame = stack.pop().ok_or(CodecError::UnexpectedClose { position })?;
                if frame.pending_key.is_some() {
                    return Err(CodecError::DanglingKey { position });
                }
                let node = Node::from_view(frame.entries)?;
                match stack.last_mut() {
                    Some(parent) => {
                        let key = frame.key.ok_or(CodecError::UnexpectedClose { position })?;
                        parent.entries.insert(key, Canonical::Node(node));
                    }
                    None => root = Some(node),
                }
            }
            token => {
                let frame = stack
                    .last_mut()
                    .ok_or(CodecError::ValueOutsideObject { position })?;
                match frame.pending_key.take() {
                    None => match token {
                        Symbol::Str(text) => frame.pending_key = Some(text.clone()),
                        _ => return Err(CodecError::NonStringKey { position }),
                    },
                    Some(key) => {
                        if let Some(scalar) = resolve_value(token, forced.contains(&position)) {
                            frame.entries.insert(key, Canonical::Leaf(scalar));
                        }
                    }
                }
            }
        }
    }

    if !stack.is_empty() {
        return Err(CodecError::UnterminatedObject);
    }
    root.ok_or(CodecError::EmptyBody)
}

/// Value of a token in value position; `None` drops the pair (undefined).
fn resolve_value(symbol: &Symbol, forced: bool) -> Option<Scalar> {
    match symbol {
        Symbol::Str(text) if forced => Some(Scalar::String(text.clone())),
        Symbol::Str(text) => match lexical::classify(text) {
            Some(Token::Scalar(scalar)) => Some(scalar),
            Some(Token::Undefined) => None,
            None => Some(Scalar::String(text.clone())),
        },
        Symbol::Int(value) => Some(Scalar::Int(*value)),
        Symbol::Float(value) => Some(Scalar::Float(*value)),
        Symbol::Bool(value) => Some(Scalar::Bool(*value)),
        Symbol::Null => Some(Scalar::Null),
        Symbol::Open | Symbol::Close => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::{flatten, ArrayKind};
    use crate::value::Value;
    use serde_json::json;

    fn node(value: serde_json::Value) -> Node {
        Node::from_value(&Value::from(value)).unwrap()
    }

    fn round_trip(node: &Node) -> Node {
        let text = compress(node).unwrap();
        decompress(&text).unwrap()
    }

    #[test]
    fn test_char_mapping_skips_reserved() {
        assert_eq!(index_to_char(0).unwrap(), '#');
        assert_eq!(index_to_char(56).unwrap(), '[');
        assert_eq!(index_to_char(57).unwrap(), ']');
        assert_eq!(index_to_char(87).unwrap(), '{');
        assert_eq!(index_to_char(88).unwrap(), '}');
        assert_eq!(char_to_index('\\'), None);
        assert_eq!(char_to_index('|'), None);
        assert_eq!(char_to_index('"'), None);
        assert_eq!(char_to_index('!'), None);
    }

    #[test]
    fn test_char_mapping_is_bijective_around_boundaries() {
        let boundaries = [0, 56, 57, 58, 87, 88, 89, 0xD7D0, 0xD7DA, 0xD7DB, 0xD7DC, MAX_SYMBOL_INDEX];
        for index in boundaries {
            for probe in index.saturating_sub(2)..=index {
                let c = index_to_char(probe).unwrap();
                assert_eq!(char_to_index(c), Some(probe), "index {probe}");
            }
        }
        assert_eq!(index_to_char(MAX_SYMBOL_INDEX).unwrap(), char::MAX);
        assert_eq!(
            index_to_char(MAX_SYMBOL_INDEX + 1),
            Err(CodecError::IndexOverflow { index: MAX_SYMBOL_INDEX + 1 })
        );
    }

    #[test]
    fn test_empty_object_uses_no_dynamic_symbols() {
        let text = compress(&Node::object()).unwrap();
        assert_eq!(text, "||||#$");
        assert_eq!(decompress(&text).unwrap(), Node::object());
    }

    #[test]
    fn test_default_symbols_only() {
        let value = node(json!({"id": 1, "a": true, "m": null, "d": "3"}));
        let text = compress(&value).unwrap();
        let (_, rest) = text.split_once("||").unwrap();
        assert!(rest.starts_with("||"), "no dynamic symbols expected: {text}");
        assert_eq!(decompress(&text).unwrap(), value);
    }

    #[test]
    fn test_types_survive() {
        let value = node(json!({
            "int": 42, "float": 42.0, "neg": -0.5, "big": 1e21,
            "t": true, "f": false, "n": null,
            "s_int": "42", "s_float": "42.0", "s_true": "true", "s_null": "null",
            "s_undef": "undefined", "s_exp": "1e5", "plain": "hello"
        }));
        assert_eq!(round_trip(&value), value);
    }

    #[test]
    fn test_shared_symbols_are_reused() {
        let value = node(json!({"first": "shared", "second": "shared", "shared": "first"}));
        let text = compress(&value).unwrap();
        assert_eq!(text.matches("shared").count(), 1);
        assert_eq!(text.matches("first").count(), 1);
        assert_eq!(round_trip(&value), value);
    }

    #[test]
    fn test_escaping() {
        let value = node(json!({"a|b": "c\\d", "||": "|", "\\": "x||y", "": " "}));
        assert_eq!(round_trip(&value), value);
    }

    #[test]
    fn test_punctuation_does_not_alias_control_markers() {
        let value = node(json!({"{": "}", "}": {"{": "{"}}));
        assert_eq!(round_trip(&value), value);
    }

    #[test]
    fn test_tag_character_and_arrays() {
        let value = flatten(&Value::from(json!({
            "@": "@",
            "list": [{"id": "@"}, {"id": "x"}],
            "nums": [1, "1", 1.5],
            "empty": []
        })))
        .unwrap();
        let value = value.as_node().unwrap();
        let back = round_trip(value);
        assert_eq!(&back, value);
        let list = back.get("list").unwrap().as_node().unwrap();
        assert_eq!(list.array_kind(), Some(ArrayKind::Entity));
    }

    #[test]
    fn test_undefined_token_drops_pair() {
        // {"a": <dynamic "undefined">, "b": 1}, no forced positions
        let text = format!(
            "||undefined||{}{}{}{}{}{}",
            index_to_char(OPEN_INDEX).unwrap(),
            index_to_char(9).unwrap(),
            index_to_char(default_symbols().len()).unwrap(),
            index_to_char(10).unwrap(),
            index_to_char(24).unwrap(),
            index_to_char(CLOSE_INDEX).unwrap(),
        );
        let decoded = decompress(&text).unwrap();
        assert_eq!(decoded, node(json!({"m": 1})));
    }

    #[test]
    fn test_malformed_input() {
        assert_eq!(decompress(""), Err(CodecError::MissingSection { section: 1 }));
        assert_eq!(decompress("||"), Err(CodecError::MissingSection { section: 2 }));
        assert_eq!(decompress("||||"), Err(CodecError::EmptyBody));
        assert_eq!(decompress("||a\\"), Err(CodecError::DanglingEscape));
        assert_eq!(decompress("||||#"), Err(CodecError::UnterminatedObject));
        assert_eq!(decompress("||||$"), Err(CodecError::UnexpectedClose { position: 0 }));
        assert_eq!(decompress("||||#$#"), Err(CodecError::TrailingData { position: 2 }));
        assert_eq!(decompress("||||#\u{10FFFF}"), Err(CodecError::UnknownSymbol {
            index: MAX_SYMBOL_INDEX,
            position: 1
        }));
        assert!(matches!(decompress("||||#!"), Err(CodecError::InvalidSymbolChar { .. })));
        // integer symbol in key position
        let int_key = format!("||||#{}{}$", index_to_char(23).unwrap(), index_to_char(23).unwrap());
        assert_eq!(decompress(&int_key), Err(CodecError::NonStringKey { position: 1 }));
        // key without value
        let dangling = format!("||||#{}$", index_to_char(9).unwrap());
        assert_eq!(decompress(&dangling), Err(CodecError::DanglingKey { position: 2 }));
        // open without key
        assert_eq!(decompress("||||##$$"), Err(CodecError::UnexpectedOpen { position: 1 }));
    }

    #[test]
    fn test_invalid_tag_is_rejected() {
        // {"@": "x"}
        let text = format!("||||#{}{}$", index_to_char(8).unwrap(), index_to_char(9).unwrap());
        assert_eq!(
            decompress(&text),
            Err(CodecError::Canonical(crate::error::CanonicalError::InvalidArrayTag))
        );
    }
}
