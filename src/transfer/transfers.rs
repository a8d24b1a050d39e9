//! Directional path-to-path copy rules and their collections.

use super::path::{Path, TypeHint};
use crate::error::ConfigError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;

/// Namespace segment separating request-side paths.
pub const INPUT_SEGMENT: &str = "input";
/// Namespace segment separating response-side paths.
pub const OUTPUT_SEGMENT: &str = "output";

/// Copy the value found at `src` to `dst`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Transfer {
    pub src: Path,
    pub dst: Path,
}

impl Transfer {
    pub fn new(src: Path, dst: Path) -> Self {
        Transfer { src, dst }
    }

    /// Parse one `src:dst` line. Type hints go on the last segment of each side.
    pub fn parse_line(line: &str) -> Result<Self, ConfigError> {
        let malformed = |reason: &str| ConfigError::MalformedTransfer {
            line: line.to_string(),
            reason: reason.to_string(),
        };
        let mut parts = line.split(':');
        let (src, dst) = match (parts.next(), parts.next(), parts.next()) {
            (Some(s), Some(d), None) => (s.trim(), d.trim()),
            _ => return Err(malformed("expected exactly one ':' between src and dst")),
        };
        if src.is_empty() || dst.is_empty() {
            return Err(malformed("src and dst must not be empty"));
        }
        let src = Path::parse(src).map_err(|e| malformed(&e))?;
        let dst = Path::parse(dst).map_err(|e| malformed(&e))?;
        if let (Some(a), Some(b)) = (src.hint(), dst.hint()) {
            if a != b {
                return Err(malformed("src and dst type hints disagree"));
            }
        }
        Ok(Transfer { src, dst })
    }

    pub fn reverse(&self) -> Transfer {
        Transfer {
            src: self.dst.clone(),
            dst: self.src.clone(),
        }
    }

    fn hint(&self) -> Option<TypeHint> {
        self.dst.hint().or(self.src.hint())
    }

    fn touches(&self, namespace: &str) -> bool {
        self.src.is_under(namespace) || self.dst.is_under(namespace)
    }
}

impl fmt::Display for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.src, self.dst)
    }
}

/// Ordered collection of transfers. Lookups ignore order; rendering and
/// application follow it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Transfers(Vec<Transfer>);

impl Transfers {
    pub fn new() -> Self {
        Transfers(Vec::new())
    }

    /// Parse a transfer line block: one `src:dst` per line, blank lines and
    /// `//` comments skipped. Later lines replace earlier ones with the same dst.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut out = Transfers::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with("//") {
                continue;
            }
            out.add_replace([Transfer::parse_line(line)?]);
        }
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Transfer> {
        self.0.iter()
    }

    /// Append, replacing any existing transfer that writes the same dst (the
    /// replaced entry keeps its position).
    pub fn add_replace<I: IntoIterator<Item = Transfer>>(&mut self, transfers: I) {
        for t in transfers {
            match self.0.iter_mut().find(|e| e.dst.as_str() == t.dst.as_str()) {
                Some(existing) => *existing = t,
                None => self.0.push(t),
            }
        }
    }

    /// Transfers with either side equal to `namespace` or below it.
    pub fn get_by_namespace(&self, namespace: &str) -> Transfers {
        Transfers(self.0.iter().filter(|t| t.touches(namespace)).cloned().collect())
    }

    /// Partition into the transfers under `name.input` and under `name.output`.
    pub fn split_in_out(&self, name: &str) -> (Transfers, Transfers) {
        (
            self.get_by_namespace(&super::input_namespace(name)),
            self.get_by_namespace(&super::output_namespace(name)),
        )
    }

    pub fn reverse(&self) -> Transfers {
        Transfers(self.0.iter().map(Transfer::reverse).collect())
    }

    pub fn modify_src_path<F: Fn(&str) -> String>(&self, f: F) -> Transfers {
        Transfers(
            self.0
                .iter()
                .map(|t| Transfer::new(t.src.rewrite(&f), t.dst.clone()))
                .collect(),
        )
    }

    pub fn modify_dst_path<F: Fn(&str) -> String>(&self, f: F) -> Transfers {
        Transfers(
            self.0
                .iter()
                .map(|t| Transfer::new(t.src.clone(), t.dst.rewrite(&f)))
                .collect(),
        )
    }

    /// Build a new document holding, at each dst, the value read from src.
    /// An empty collection returns the input unchanged; a missing src leaves
    /// its dst absent.
    pub fn apply(&self, doc: &Value) -> Value {
        if self.0.is_empty() {
            return doc.clone();
        }
        let mut out = Value::Object(Map::new());
        for t in &self.0 {
            let Some(value) = t.src.get(doc) else {
                continue;
            };
            let value = match t.hint() {
                Some(hint) => hint.coerce(value),
                None => value,
            };
            t.dst.set(&mut out, value);
        }
        out
    }

    /// Render as a multipath query `{dst:src,...}` in collection order.
    pub fn query_string(&self) -> String {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|t| {
                if t.dst.is_root() {
                    t.src.as_str().to_string()
                } else {
                    format!("\"{}\":{}", t.dst.as_str(), t.src.as_str())
                }
            })
            .collect();
        format!("{{{}}}", parts.join(","))
    }

    /// Render back to the line format accepted by [`Transfers::parse`].
    pub fn to_lines(&self) -> String {
        self.0.iter().map(|t| t.to_string()).collect::<Vec<_>>().join("\n")
    }
}

impl FromIterator<Transfer> for Transfers {
    fn from_iter<I: IntoIterator<Item = Transfer>>(iter: I) -> Self {
        let mut out = Transfers::new();
        out.add_replace(iter);
        out
    }
}

impl<'a> IntoIterator for &'a Transfers {
    type Item = &'a Transfer;
    type IntoIter = std::slice::Iter<'a, Transfer>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl Serialize for Transfers {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_lines())
    }
}

impl<'de> Deserialize<'de> for Transfers {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Transfers::parse(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Transfers {
        Transfers::parse(
            "// request side
            listItems.input.pageIndex@int:pageIndex
            listItems.input.pageSize:pageSize

            listItems.output.items[].id:items[].id
            listItems.output.total:total",
        )
        .unwrap()
    }

    #[test]
    fn parse_rejects_malformed_lines() {
        assert!(matches!(
            Transfers::parse("a.b"),
            Err(ConfigError::MalformedTransfer { .. })
        ));
        assert!(Transfers::parse("a:b:c").is_err());
        assert!(Transfers::parse(":b").is_err());
        assert!(Transfers::parse("a@int:b@string").is_err());
    }

    #[test]
    fn split_in_out_partitions_by_sentinel() {
        let (input, output) = sample().split_in_out("listItems");
        assert_eq!(input.len(), 2);
        assert_eq!(output.len(), 2);
        assert!(input.iter().all(|t| t.src.is_under("listItems.input")));
    }

    #[test]
    fn get_by_namespace_includes_bare_entry() {
        let ts = Transfers::parse("list:result\nlist.output.id:id\nlistAll.x:y").unwrap();
        let sub = ts.get_by_namespace("list");
        assert_eq!(sub.len(), 2);
    }

    #[test]
    fn apply_moves_values_and_tolerates_missing_src() {
        let (input, _) = sample().split_in_out("listItems");
        let doc = json!({"listItems": {"input": {"pageIndex": "2"}}});
        assert_eq!(input.apply(&doc), json!({"pageIndex": 2}));
    }

    #[test]
    fn empty_collection_copies_input() {
        let doc = json!({"a": 1});
        assert_eq!(Transfers::new().apply(&doc), doc);
    }

    #[test]
    fn double_reverse_is_identity() {
        let ts = sample();
        let doc = json!({
            "listItems": {
                "input": {"pageIndex": 1, "pageSize": 20},
                "output": {"items": [{"id": 4}], "total": 1}
            }
        });
        assert_eq!(ts.reverse().reverse(), ts);
        assert_eq!(ts.reverse().reverse().apply(&doc), ts.apply(&doc));
    }

    #[test]
    fn add_replace_is_last_write_wins_on_dst() {
        let mut ts = Transfers::parse("a:x\nb:y").unwrap();
        ts.add_replace(Transfers::parse("c:x").unwrap().iter().cloned());
        assert_eq!(ts.to_lines(), "c:x\nb:y");
    }

    #[test]
    fn modify_paths_strip_and_add_namespaces() {
        let ts = Transfers::parse("list.input.id:id").unwrap();
        let stripped = ts.modify_src_path(|p| crate::transfer::path::strip_namespace(p, "list.input"));
        assert_eq!(stripped.to_lines(), "id:id");
        let added = ts.modify_dst_path(|p| format!("dict.{}", p));
        assert_eq!(added.to_lines(), "list.input.id:dict.id");
    }

    #[test]
    fn query_string_is_deterministic() {
        let ts = sample();
        let first = ts.query_string();
        assert_eq!(first, sample().query_string());
        assert!(first.starts_with("{\"pageIndex\":listItems.input.pageIndex,"));
    }
}
