//! Rendered-text cleanup and named parameter binding.

use super::volume::Volume;
use crate::error::StatementError;
use serde::Serialize;
use serde_json::Value;

/// A statement ready for a provider: positional SQL, its ordered parameters
/// and the same statement with parameters inlined for logs and lookups.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CompiledStatement {
    pub template: String,
    pub sql: String,
    pub params: Vec<Value>,
    pub explained: String,
}

impl CompiledStatement {
    /// First keyword, lowercased (`select`, `insert`, ...).
    pub fn operation(&self) -> String {
        self.sql
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_lowercase()
    }
}

/// Normalize line endings, drop blank lines, trim each line's tail and the
/// whole text.
pub fn post_process(text: &str) -> String {
    text.replace("\r\n", "\n")
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Replace `:Name` placeholders with `$n`, reading values from the volume.
/// `::` casts and single-quoted literals are left alone. Array values expand
/// to one placeholder per element.
pub fn bind_named(template: &str, text: &str, volume: &Volume) -> Result<CompiledStatement, StatementError> {
    if text.trim().is_empty() {
        return Err(StatementError::Empty {
            template: template.to_string(),
        });
    }
    let chars: Vec<char> = text.chars().collect();
    let mut sql = String::with_capacity(text.len());
    let mut explained = String::with_capacity(text.len());
    let mut params = Vec::new();
    let mut in_quote = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\'' {
            in_quote = !in_quote;
        }
        if in_quote || c != ':' {
            sql.push(c);
            explained.push(c);
            i += 1;
            continue;
        }
        if chars.get(i + 1) == Some(&':') {
            sql.push_str("::");
            explained.push_str("::");
            i += 2;
            continue;
        }
        let start = i + 1;
        if !chars.get(start).is_some_and(|ch| ch.is_ascii_alphabetic() || *ch == '_') {
            sql.push(c);
            explained.push(c);
            i += 1;
            continue;
        }
        let mut end = start;
        while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_' || chars[end] == '.') {
            end += 1;
        }
        while end > start && chars[end - 1] == '.' {
            end -= 1;
        }
        let name: String = chars[start..end].iter().collect();
        let value = lookup(volume, &name).ok_or_else(|| StatementError::MissingParameter {
            template: template.to_string(),
            name: name.clone(),
        })?;
        match value {
            Value::Array(items) if items.is_empty() => {
                sql.push_str("NULL");
                explained.push_str("NULL");
            }
            Value::Array(items) => {
                let mut placeholders = Vec::with_capacity(items.len());
                let mut literals = Vec::with_capacity(items.len());
                for item in items {
                    params.push(item.clone());
                    placeholders.push(format!("${}", params.len()));
                    literals.push(literal(item));
                }
                sql.push_str(&placeholders.join(", "));
                explained.push_str(&literals.join(", "));
            }
            other => {
                params.push(other.clone());
                sql.push_str(&format!("${}", params.len()));
                explained.push_str(&literal(other));
            }
        }
        i = end;
    }
    Ok(CompiledStatement {
        template: template.to_string(),
        sql,
        params,
        explained,
    })
}

fn lookup<'a>(volume: &'a Volume, name: &str) -> Option<&'a Value> {
    let mut parts = name.split('.');
    let mut cur = volume.get(parts.next()?)?;
    for p in parts {
        cur = cur.get(p)?;
    }
    Some(cur)
}

fn literal(v: &Value) -> String {
    match v {
        Value::Null => "NULL".into(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}
