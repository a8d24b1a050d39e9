//! Line schema: one field rule per line, `key=value` pairs separated by commas.
//!
//! ```text
//! version=http://json-schema.org/draft-07/schema,id=input,direction=in
//! fullname=pageIndex,format=number,required,default=1,minimum=0
//! fullname=items[].status,enum=on|off
//! ```

mod validation;

use crate::error::{AppError, ConfigError};
use crate::transfer::{Path, Segment, Transfer, Transfers, TypeHint};
use regex::Regex;
use serde_json::{Map, Value};

pub use validation::RuleViolation;

/// Optional first line of a schema.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchemaHeader {
    pub version: Option<String>,
    pub id: Option<String>,
    pub direction: Option<String>,
}

#[derive(Clone, Debug)]
pub struct FieldRule {
    pub fullname: Path,
    pub required: bool,
    pub format: Option<String>,
    pub default: Option<Value>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub pattern: Option<Regex>,
    pub allowed: Option<Vec<Value>>,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    /// Dictionary path the field maps to (`dst=` on requests, `src=` on responses).
    pub link: Option<Path>,
}

impl FieldRule {
    fn new(fullname: Path) -> Self {
        FieldRule {
            fullname,
            required: false,
            format: None,
            default: None,
            min_length: None,
            max_length: None,
            pattern: None,
            allowed: None,
            minimum: None,
            maximum: None,
            link: None,
        }
    }

    /// Scalar type the format names, if any.
    pub fn type_hint(&self) -> Option<TypeHint> {
        self.format.as_deref().and_then(TypeHint::parse)
    }

    fn each_depth(&self) -> usize {
        self.fullname
            .segments()
            .iter()
            .filter(|s| matches!(s, Segment::Each))
            .count()
    }

    /// Leaf values addressed by the fullname, flattened across `[]` segments.
    /// `None` when a plain path is absent.
    fn leaves(&self, doc: &Value) -> Option<Vec<Value>> {
        let found = self.fullname.get(doc);
        let depth = self.each_depth();
        if depth == 0 {
            return found.map(|v| vec![v]);
        }
        let mut level = vec![found.unwrap_or(Value::Array(Vec::new()))];
        for _ in 0..depth {
            level = level
                .into_iter()
                .flat_map(|v| match v {
                    Value::Array(items) => items,
                    other => vec![other],
                })
                .collect();
        }
        Some(level)
    }
}

#[derive(Clone, Debug, Default)]
pub struct LineSchema {
    header: Option<SchemaHeader>,
    fields: Vec<FieldRule>,
}

impl LineSchema {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut schema = LineSchema::default();
        for (idx, line) in text.lines().map(str::trim).filter(|l| !l.is_empty()).enumerate() {
            let malformed = |reason: String| ConfigError::MalformedSchema {
                line: line.to_string(),
                reason,
            };
            let (head, pattern) = split_pattern(line);
            let mut pairs: Vec<(&str, Option<&str>)> = head
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|p| match p.split_once('=') {
                    Some((k, v)) => (k.trim(), Some(v.trim())),
                    None => (p, None),
                })
                .collect();
            if let Some(p) = pattern {
                pairs.push(("pattern", Some(p)));
            }
            let fullname = pairs.iter().find(|(k, _)| *k == "fullname").and_then(|(_, v)| *v);
            let Some(fullname) = fullname else {
                if idx == 0 {
                    schema.header = Some(parse_header(&pairs));
                    continue;
                }
                return Err(malformed("missing fullname".into()));
            };
            let path = Path::parse(fullname).map_err(malformed)?;
            let mut rule = FieldRule::new(path);
            for (key, value) in &pairs {
                let value = value.unwrap_or("");
                match *key {
                    "required" => rule.required = value.is_empty() || value == "true",
                    "format" | "type" => rule.format = Some(value.to_lowercase()),
                    "default" => rule.default = Some(Value::String(value.to_string())),
                    "minLength" => rule.min_length = Some(parse_num(key, value).map_err(malformed)?),
                    "maxLength" => rule.max_length = Some(parse_num(key, value).map_err(malformed)?),
                    "minimum" => rule.minimum = Some(parse_num(key, value).map_err(malformed)?),
                    "maximum" => rule.maximum = Some(parse_num(key, value).map_err(malformed)?),
                    "pattern" => {
                        let re = Regex::new(value).map_err(|e| malformed(format!("pattern: {}", e)))?;
                        rule.pattern = Some(re);
                    }
                    "dst" | "src" => rule.link = Some(Path::parse(value).map_err(malformed)?),
                    "enum" => {
                        rule.allowed = Some(value.split('|').map(|s| Value::String(s.trim().to_string())).collect())
                    }
                    _ => {}
                }
            }
            if let (Some(hint), Some(default)) = (rule.type_hint(), rule.default.take()) {
                rule.default = Some(hint.coerce(default));
            }
            if let (Some(hint), Some(allowed)) = (rule.type_hint(), rule.allowed.take()) {
                rule.allowed = Some(allowed.into_iter().map(|v| hint.coerce(v)).collect());
            }
            schema.fields.push(rule);
        }
        Ok(schema)
    }

    pub fn header(&self) -> Option<&SchemaHeader> {
        self.header.as_ref()
    }

    pub fn fields(&self) -> &[FieldRule] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Check every rule. Required plain fields must be present and non-null;
    /// under `[]` each element's leaf must be non-null.
    pub fn validate(&self, doc: &Value) -> Result<(), AppError> {
        for rule in &self.fields {
            let name = rule.fullname.as_str();
            match rule.leaves(doc) {
                None if rule.required => return Err(AppError::Validation(format!("{} is required", name))),
                None => {}
                Some(values) => {
                    for v in &values {
                        if rule.required && v.is_null() {
                            return Err(AppError::Validation(format!("{} is required", name)));
                        }
                        validation::check(rule, v).map_err(|e| AppError::Validation(e.message(name)))?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Transfers `namespace.fullname:link` for every field with a link.
    pub fn transfers(&self, namespace: &str) -> Transfers {
        self.fields
            .iter()
            .filter_map(|rule| {
                let link = rule.link.clone()?;
                Some(Transfer::new(rule.fullname.with_prefix(namespace), link))
            })
            .collect()
    }

    /// Fill absent or null fields that carry a default.
    pub fn merge_defaults(&self, doc: Value) -> Value {
        if self.fields.is_empty() {
            return doc;
        }
        let mut doc = match doc {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        for rule in &self.fields {
            let Some(default) = &rule.default else {
                continue;
            };
            match rule.fullname.get(&doc) {
                None | Some(Value::Null) if rule.each_depth() == 0 => rule.fullname.set(&mut doc, default.clone()),
                Some(Value::Array(items)) if rule.each_depth() == 1 => {
                    let filled = items
                        .into_iter()
                        .map(|v| if v.is_null() { default.clone() } else { v })
                        .collect();
                    rule.fullname.set(&mut doc, Value::Array(filled));
                }
                _ => {}
            }
        }
        doc
    }

    /// Coerce fields to the scalar type their format names.
    pub fn format_types(&self, mut doc: Value) -> Value {
        for rule in &self.fields {
            let Some(hint) = rule.type_hint() else {
                continue;
            };
            if let Some(v) = rule.fullname.get(&doc) {
                if !v.is_null() {
                    rule.fullname.set(&mut doc, hint.coerce(v));
                }
            }
        }
        doc
    }
}

fn parse_header(pairs: &[(&str, Option<&str>)]) -> SchemaHeader {
    let get = |key: &str| {
        pairs
            .iter()
            .find(|(k, _)| *k == key)
            .and_then(|(_, v)| v.map(str::to_string))
    };
    SchemaHeader {
        version: get("version"),
        id: get("id"),
        direction: get("direction"),
    }
}

/// `pattern=` takes the rest of the line, so regexes may contain commas.
fn split_pattern(line: &str) -> (&str, Option<&str>) {
    let mut offset: usize = 0;
    for part in line.split(',') {
        let key = part.trim_start();
        if let Some(rest) = key.strip_prefix("pattern") {
            if let Some(value) = rest.trim_start().strip_prefix('=') {
                let head = &line[..offset.saturating_sub(1)];
                let start = offset + part.len() - value.len();
                return (head, Some(line[start..].trim()));
            }
        }
        offset += part.len() + 1;
    }
    (line, None)
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String> {
    value
        .parse::<T>()
        .map_err(|_| format!("{} expects a number, got '{}'", key, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const INPUT: &str = "version=http://json-schema.org/draft-07/schema,id=input,direction=in
        fullname=pageIndex,dst=pageIndex,format=number,required,default=0
        fullname=pageSize,format=int,default=20,maximum=100
        fullname=status,enum=on|off
        fullname=email,format=email";

    #[test]
    fn parses_header_and_rules() {
        let schema = LineSchema::parse(INPUT).unwrap();
        assert_eq!(schema.header().and_then(|h| h.id.as_deref()), Some("input"));
        assert_eq!(schema.fields().len(), 4);
        assert_eq!(schema.fields()[1].default, Some(json!(20)));
        assert!(LineSchema::parse("a=1\nformat=int").is_err());
        assert!(LineSchema::parse("fullname=a,maxLength=ten").is_err());
    }

    #[test]
    fn pattern_keeps_commas() {
        let schema = LineSchema::parse("fullname=code,required,pattern=^[a-z]{1,3}$").unwrap();
        assert_eq!(schema.fields()[0].pattern.as_ref().map(|r| r.as_str()), Some("^[a-z]{1,3}$"));
        assert!(schema.fields()[0].required);
        assert!(schema.validate(&json!({"code": "ab"})).is_ok());
        assert!(schema.validate(&json!({"code": "abcd"})).is_err());
        let other_order = LineSchema::parse("fullname=a\nfullname=b , pattern = ^x{2,}$").unwrap();
        assert_eq!(other_order.fields()[1].pattern.as_ref().map(|r| r.as_str()), Some("^x{2,}$"));
    }

    #[test]
    fn validate_checks_required_and_rules() {
        let schema = LineSchema::parse(INPUT).unwrap();
        assert!(schema.validate(&json!({"pageIndex": "0", "status": "on"})).is_ok());
        let missing = schema.validate(&json!({})).unwrap_err();
        assert_eq!(missing.to_string(), "validation: pageIndex is required");
        assert!(schema.validate(&json!({"pageIndex": "x"})).is_err());
        assert!(schema.validate(&json!({"pageIndex": 1, "pageSize": 500})).is_err());
        assert!(schema.validate(&json!({"pageIndex": 1, "status": "maybe"})).is_err());
        assert!(schema.validate(&json!({"pageIndex": 1, "email": "nope"})).is_err());
    }

    #[test]
    fn defaults_then_formats() {
        let schema = LineSchema::parse(INPUT).unwrap();
        let doc = schema.merge_defaults(json!({"pageIndex": "3"}));
        assert_eq!(doc, json!({"pageIndex": "3", "pageSize": 20}));
        assert_eq!(schema.format_types(doc), json!({"pageIndex": 3, "pageSize": 20}));
    }

    #[test]
    fn array_fields_apply_per_element() {
        let schema = LineSchema::parse("fullname=items[].id,format=int,required\nfullname=items[].tag,default=none").unwrap();
        let doc = json!({"items": [{"id": "1"}, {"id": "2", "tag": "x"}]});
        assert!(schema.validate(&doc).is_ok());
        let doc = schema.format_types(schema.merge_defaults(doc));
        assert_eq!(doc, json!({"items": [{"id": 1, "tag": "none"}, {"id": 2, "tag": "x"}]}));
        assert!(schema.validate(&json!({"items": [{"id": null}]})).is_err());
        assert!(schema.validate(&json!({})).is_ok());
    }

    #[test]
    fn linked_fields_become_namespaced_transfers() {
        let schema = LineSchema::parse(
            "fullname=items[].title,src=PaginateOut.#.title\nfullname=pageInfo.total,src=PaginateTotalOut\nfullname=note",
        )
        .unwrap();
        let ts = schema.transfers("listItems.output");
        assert_eq!(
            ts.to_lines(),
            "listItems.output.items[].title:PaginateOut.#.title\nlistItems.output.pageInfo.total:PaginateTotalOut"
        );
    }
}
