//! Typed key/value defines supplied at start-up.
//!
//! Defines arrive from two places: repeatable `-D KEY=VALUE` flags and an
//! optional literal mapping piped over stdin (`--stdin-defines`). The stdin
//! mapping merges first, flag pairs override. Values are parsed by a small
//! literal grammar: integers, floats, case-insensitive booleans and null,
//! quoted strings, and nested lists/tuples/sets/mappings. There is no
//! expression evaluator behind it; anything outside the grammar is rejected,
//! and a `-D` value that fails to parse falls back to a plain string.
//!
//! The same grammar serves as the wire format for sub-builds: exports are
//! serialized with [`Value`]'s `Display` impl and reparsed by the child, so
//! round-tripping preserves structural equality.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// A literal value held in the defines map.
///
/// Equality is structural. `Set` and `Map` compare order-insensitively,
/// `List` and `Tuple` preserve element order.
#[derive(Debug, Clone)]
pub enum Value {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    None,
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Set(Vec<Value>),
    Map(Vec<(Value, Value)>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::None, Value::None) => true,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Set(a), Value::Set(b)) => {
                a.len() == b.len() && a.iter().all(|x| b.contains(x))
            }
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.iter().any(|(bk, bv)| k == bk && v == bv))
            }
            _ => false,
        }
    }
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => Option::None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => Option::None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => Option::None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => Option::None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(v) | Value::Tuple(v) => Some(v),
            _ => Option::None,
        }
    }

    pub fn as_map(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Map(m) => Some(m),
            _ => Option::None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

fn escape_into(out: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            c => out.push(c),
        }
    }
}

fn write_seq(f: &mut fmt::Formatter<'_>, items: &[Value], open: char, close: char) -> fmt::Result {
    write!(f, "{open}")?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{item}")?;
    }
    write!(f, "{close}")
}

impl fmt::Display for Value {
    /// Serializes the value back into the literal grammar. Reparsing the
    /// result yields a structurally equal value, with one known blind spot:
    /// an empty set prints as `{}`, which reparses as an empty mapping.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => {
                let mut escaped = String::with_capacity(s.len() + 2);
                escape_into(&mut escaped, s);
                write!(f, "\"{escaped}\"")
            }
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => {
                let repr = format!("{x}");
                // Keep the float marker so the round-trip stays a float.
                if repr.contains(['.', 'e', 'E', 'n', 'i']) {
                    write!(f, "{repr}")
                } else {
                    write!(f, "{repr}.0")
                }
            }
            Value::Bool(true) => write!(f, "true"),
            Value::Bool(false) => write!(f, "false"),
            Value::None => write!(f, "null"),
            Value::List(items) => write_seq(f, items, '[', ']'),
            Value::Tuple(items) => {
                if items.len() == 1 {
                    write!(f, "({},)", items[0])
                } else {
                    write_seq(f, items, '(', ')')
                }
            }
            Value::Set(items) => {
                if items.is_empty() {
                    write!(f, "{{}}")
                } else {
                    write_seq(f, items, '{', '}')
                }
            }
            Value::Map(pairs) => {
                write!(f, "{{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[derive(Debug, Error)]
#[error("invalid literal at offset {offset}: {message}")]
pub struct LiteralError {
    pub offset: usize,
    pub message: String,
}

/// Parses a single literal from `src`, requiring the whole input to be
/// consumed (aside from surrounding whitespace).
pub fn parse_literal(src: &str) -> Result<Value, LiteralError> {
    let mut p = Parser {
        chars: src.chars().collect(),
        pos: 0,
    };
    p.skip_ws();
    let value = p.value()?;
    p.skip_ws();
    if p.pos != p.chars.len() {
        return Err(p.err("trailing characters after literal"));
    }
    Ok(value)
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn err(&self, message: impl Into<String>) -> LiteralError {
        LiteralError {
            offset: self.pos,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, want: char) -> Result<(), LiteralError> {
        match self.bump() {
            Some(c) if c == want => Ok(()),
            Some(c) => Err(self.err(format!("expected '{want}', found '{c}'"))),
            None => Err(self.err(format!("expected '{want}', found end of input"))),
        }
    }

    fn value(&mut self) -> Result<Value, LiteralError> {
        match self.peek() {
            Some('[') => self.seq('[', ']').map(Value::List),
            Some('(') => self.seq('(', ')').map(Value::Tuple),
            Some('{') => self.braced(),
            Some('"') | Some('\'') => self.string().map(Value::Str),
            Some(_) => self.bare(),
            None => Err(self.err("expected a value, found end of input")),
        }
    }

    fn seq(&mut self, open: char, close: char) -> Result<Vec<Value>, LiteralError> {
        self.expect(open)?;
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(close) {
                self.pos += 1;
                return Ok(items);
            }
            items.push(self.value()?);
            self.skip_ws();
            match self.peek() {
                Some(',') => {
                    self.pos += 1;
                }
                Some(c) if c == close => {}
                _ => return Err(self.err(format!("expected ',' or '{close}' in sequence"))),
            }
        }
    }

    /// A brace literal is a mapping when the first element is followed by a
    /// colon, a set otherwise. Bare `{}` is the empty mapping.
    fn braced(&mut self) -> Result<Value, LiteralError> {
        self.expect('{')?;
        self.skip_ws();
        if self.peek() == Some('}') {
            self.pos += 1;
            return Ok(Value::Map(Vec::new()));
        }

        let first = self.value()?;
        self.skip_ws();
        match self.peek() {
            Some(':') => {
                self.pos += 1;
                self.skip_ws();
                let mut pairs = vec![(first, self.value()?)];
                loop {
                    self.skip_ws();
                    match self.peek() {
                        Some('}') => {
                            self.pos += 1;
                            return Ok(Value::Map(pairs));
                        }
                        Some(',') => {
                            self.pos += 1;
                            self.skip_ws();
                            if self.peek() == Some('}') {
                                self.pos += 1;
                                return Ok(Value::Map(pairs));
                            }
                            let key = self.value()?;
                            self.skip_ws();
                            self.expect(':')?;
                            self.skip_ws();
                            pairs.push((key, self.value()?));
                        }
                        _ => return Err(self.err("expected ',' or '}' in mapping")),
                    }
                }
            }
            _ => {
                let mut items = vec![first];
                loop {
                    self.skip_ws();
                    match self.peek() {
                        Some('}') => {
                            self.pos += 1;
                            return Ok(Value::Set(items));
                        }
                        Some(',') => {
                            self.pos += 1;
                            self.skip_ws();
                            if self.peek() == Some('}') {
                                self.pos += 1;
                                return Ok(Value::Set(items));
                            }
                            items.push(self.value()?);
                        }
                        _ => return Err(self.err("expected ',' or '}' in set")),
                    }
                }
            }
        }
    }

    fn string(&mut self) -> Result<String, LiteralError> {
        let quote = self.bump().unwrap();
        let mut out = String::new();
        loop {
            match self.bump() {
                Some(c) if c == quote => return Ok(out),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some('0') => out.push('\0'),
                    Some(c @ ('\\' | '\'' | '"')) => out.push(c),
                    Some(c) => return Err(self.err(format!("unknown escape '\\{c}'"))),
                    None => return Err(self.err("unterminated string")),
                },
                Some(c) => out.push(c),
                None => return Err(self.err("unterminated string")),
            }
        }
    }

    fn bare(&mut self) -> Result<Value, LiteralError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_whitespace() || matches!(c, ',' | ':' | ']' | ')' | '}') {
                break;
            }
            self.pos += 1;
        }
        let token: String = self.chars[start..self.pos].iter().collect();
        if token.is_empty() {
            return Err(self.err("expected a value"));
        }

        if token.eq_ignore_ascii_case("true") {
            return Ok(Value::Bool(true));
        }
        if token.eq_ignore_ascii_case("false") {
            return Ok(Value::Bool(false));
        }
        if token.eq_ignore_ascii_case("null") || token.eq_ignore_ascii_case("none") {
            return Ok(Value::None);
        }

        let numeric = token
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E'));
        if numeric {
            if let Ok(i) = token.parse::<i64>() {
                return Ok(Value::Int(i));
            }
            if let Ok(f) = token.parse::<f64>() {
                return Ok(Value::Float(f));
            }
        }

        Err(LiteralError {
            offset: start,
            message: format!("unrecognized token '{token}'"),
        })
    }
}

/// Splits a `-D KEY[=VALUE]` argument into its key and parsed value.
///
/// A missing `=` means boolean true. A value that is not a recognizable
/// literal is kept as the raw string, so `-D CC=gcc` works unquoted.
pub(crate) fn parse_define(arg: &str) -> (String, Value) {
    match arg.split_once('=') {
        Option::None => (arg.trim().to_string(), Value::Bool(true)),
        Some((key, raw)) => {
            let value = parse_literal(raw).unwrap_or_else(|_| Value::Str(raw.trim().to_string()));
            (key.trim().to_string(), value)
        }
    }
}

/// The process-wide defines map, frozen once initialization completes.
#[derive(Debug, Default, Clone)]
pub struct Defines {
    map: BTreeMap<String, Value>,
}

impl Defines {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(&mut self, key: impl Into<String>, value: Value) {
        self.map.insert(key.into(), value);
    }

    /// Merges a parsed stdin mapping. Existing entries win, because flag
    /// pairs are applied after the stdin mapping and must override it.
    pub(crate) fn merge_under(&mut self, pairs: Vec<(Value, Value)>) -> Result<(), String> {
        for (key, value) in pairs {
            let Value::Str(key) = key else {
                return Err(format!("define keys must be strings, got {key}"));
            };
            self.map.entry(key).or_insert(value);
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.map.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Serializes the whole map as one literal mapping.
    pub(crate) fn serialize(&self) -> String {
        serialize_exports(&self.map)
    }
}

/// Serializes an export map as a single literal mapping, the exact bytes a
/// sub-build reads back from its stdin.
pub(crate) fn serialize_exports(exports: &BTreeMap<String, Value>) -> String {
    let pairs = exports
        .iter()
        .map(|(k, v)| (Value::Str(k.clone()), v.clone()))
        .collect();
    Value::Map(pairs).to_string()
}
