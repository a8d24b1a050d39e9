//! Dotted JSON paths with an optional `@type` hint on the last segment.

use serde_json::{Map, Value};
use std::fmt;

/// One step into a document. `Each` addresses every element of an array
/// (written `#` or as a `[]` suffix).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Segment {
    Key(String),
    Each,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypeHint {
    String,
    Number,
    Integer,
    Bool,
}

impl TypeHint {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "string" | "str" => Some(TypeHint::String),
            "number" | "float" => Some(TypeHint::Number),
            "int" | "integer" => Some(TypeHint::Integer),
            "bool" | "boolean" => Some(TypeHint::Bool),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TypeHint::String => "string",
            TypeHint::Number => "number",
            TypeHint::Integer => "int",
            TypeHint::Bool => "bool",
        }
    }

    /// Coerce a value toward this type. Values that do not convert are kept as-is;
    /// arrays are coerced element-wise.
    pub fn coerce(&self, value: Value) -> Value {
        match value {
            Value::Array(items) => Value::Array(items.into_iter().map(|v| self.coerce(v)).collect()),
            Value::Null => Value::Null,
            v => match self {
                TypeHint::String => match v {
                    Value::Number(n) => Value::String(n.to_string()),
                    Value::Bool(b) => Value::String(b.to_string()),
                    other => other,
                },
                TypeHint::Number => match v {
                    Value::String(ref s) => parse_number(s).unwrap_or(v),
                    other => other,
                },
                TypeHint::Integer => match v {
                    Value::String(ref s) => s
                        .trim()
                        .parse::<i64>()
                        .map(|n| Value::Number(n.into()))
                        .unwrap_or(v),
                    Value::Number(ref n) if !n.is_i64() && !n.is_u64() => match n.as_f64() {
                        Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                            Value::Number((f as i64).into())
                        }
                        _ => v,
                    },
                    other => other,
                },
                TypeHint::Bool => match v {
                    Value::String(ref s) => match s.trim().to_lowercase().as_str() {
                        "true" | "1" => Value::Bool(true),
                        "false" | "0" | "" => Value::Bool(false),
                        _ => v,
                    },
                    Value::Number(ref n) => match n.as_i64() {
                        Some(0) => Value::Bool(false),
                        Some(1) => Value::Bool(true),
                        _ => v,
                    },
                    other => other,
                },
            },
        }
    }
}

fn parse_number(s: &str) -> Option<Value> {
    let s = s.trim();
    if let Ok(i) = s.parse::<i64>() {
        return Some(Value::Number(i.into()));
    }
    s.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Path {
    raw: String,
    segments: Vec<Segment>,
    hint: Option<TypeHint>,
}

impl Path {
    /// Parse `a.b[].c@number`. An empty string is the document root.
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        let (raw, hint) = split_hint(s)?;
        if !raw.is_empty() && raw.split('.').any(|p| p.trim().is_empty()) {
            return Err(format!("empty segment in path '{}'", raw));
        }
        Ok(Path::from_parts(raw, hint))
    }

    fn from_parts(raw: &str, hint: Option<TypeHint>) -> Self {
        let mut segments = Vec::new();
        for part in raw.split('.').map(str::trim).filter(|p| !p.is_empty()) {
            if part == "#" || part == "[]" {
                segments.push(Segment::Each);
            } else if let Some(key) = part.strip_suffix("[]") {
                segments.push(Segment::Key(key.to_string()));
                segments.push(Segment::Each);
            } else {
                segments.push(Segment::Key(part.to_string()));
            }
        }
        Path {
            raw: raw.to_string(),
            segments,
            hint,
        }
    }

    pub fn root() -> Self {
        Path::from_parts("", None)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn hint(&self) -> Option<TypeHint> {
        self.hint
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// True when the path equals `namespace` or lies below it.
    pub fn is_under(&self, namespace: &str) -> bool {
        let ns = namespace.trim_end_matches('.');
        if ns.is_empty() {
            return true;
        }
        self.raw == ns
            || (self.raw.len() > ns.len()
                && self.raw.starts_with(ns)
                && self.raw.as_bytes()[ns.len()] == b'.')
    }

    /// Apply a textual rewrite to the path, keeping the type hint.
    pub fn rewrite<F: Fn(&str) -> String>(&self, f: F) -> Self {
        Path::from_parts(&f(&self.raw), self.hint)
    }

    pub fn strip_prefix(&self, namespace: &str) -> Self {
        self.rewrite(|raw| strip_namespace(raw, namespace))
    }

    pub fn with_prefix(&self, namespace: &str) -> Self {
        self.rewrite(|raw| join_namespace(namespace, raw))
    }

    /// Read the value at this path. Missing keys yield `None`; under an `Each`
    /// segment missing elements read as `null` so indexes stay aligned.
    pub fn get(&self, doc: &Value) -> Option<Value> {
        lookup(doc, &self.segments)
    }

    /// Write `value` at this path, creating intermediate objects and arrays.
    pub fn set(&self, doc: &mut Value, value: Value) {
        assign(doc, &self.segments, value)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.hint {
            Some(h) => write!(f, "{}@{}", self.raw, h.as_str()),
            None => f.write_str(&self.raw),
        }
    }
}

fn split_hint(s: &str) -> Result<(&str, Option<TypeHint>), String> {
    let last_dot = s.rfind('.').map(|i| i + 1).unwrap_or(0);
    match s[last_dot..].find('@') {
        Some(at) => {
            let at = last_dot + at;
            let hint = &s[at + 1..];
            let parsed = TypeHint::parse(hint).ok_or_else(|| format!("unknown type hint '{}'", hint))?;
            Ok((&s[..at], Some(parsed)))
        }
        None => Ok((s, None)),
    }
}

pub(crate) fn strip_namespace(raw: &str, namespace: &str) -> String {
    let ns = namespace.trim_end_matches('.');
    if raw == ns {
        return String::new();
    }
    match raw.strip_prefix(ns).and_then(|r| r.strip_prefix('.')) {
        Some(rest) => rest.to_string(),
        None => raw.to_string(),
    }
}

pub(crate) fn join_namespace(namespace: &str, raw: &str) -> String {
    let ns = namespace.trim_end_matches('.');
    match (ns.is_empty(), raw.is_empty()) {
        (true, _) => raw.to_string(),
        (false, true) => ns.to_string(),
        (false, false) => format!("{}.{}", ns, raw),
    }
}

fn lookup(doc: &Value, segments: &[Segment]) -> Option<Value> {
    match segments.split_first() {
        None => Some(doc.clone()),
        Some((Segment::Key(k), rest)) => doc.as_object()?.get(k).and_then(|v| lookup(v, rest)),
        Some((Segment::Each, rest)) => {
            let items = doc.as_array()?;
            Some(Value::Array(
                items
                    .iter()
                    .map(|v| lookup(v, rest).unwrap_or(Value::Null))
                    .collect(),
            ))
        }
    }
}

fn assign(doc: &mut Value, segments: &[Segment], value: Value) {
    match segments.split_first() {
        None => *doc = value,
        Some((Segment::Key(k), rest)) => {
            if !doc.is_object() {
                *doc = Value::Object(Map::new());
            }
            if let Value::Object(map) = doc {
                let slot = map.entry(k.clone()).or_insert(Value::Null);
                assign(slot, rest, value);
            }
        }
        Some((Segment::Each, rest)) => {
            let items = match value {
                Value::Array(items) => items,
                other => vec![other],
            };
            if !doc.is_array() {
                *doc = Value::Array(Vec::new());
            }
            if let Value::Array(slots) = doc {
                if slots.len() < items.len() {
                    slots.resize(items.len(), Value::Null);
                }
                for (slot, item) in slots.iter_mut().zip(items) {
                    assign(slot, rest, item);
                }
            }
        }
    }
}
