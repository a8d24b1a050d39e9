//! Change capture for data-modifying statements.

use crate::torm::CompiledStatement;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::sync::OnceLock;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub template: String,
    /// `insert`, `update` or `delete`.
    pub operation: String,
    pub table: Option<String>,
    /// Explained statement text.
    pub statement: String,
    pub rows: Option<u64>,
}

impl ChangeEvent {
    /// Event for an executed statement, or `None` when it does not modify data.
    pub fn capture(statement: &CompiledStatement, result: Option<&Value>) -> Option<Self> {
        let operation = statement.operation();
        if !matches!(operation.as_str(), "insert" | "update" | "delete") {
            return None;
        }
        let rows = result.and_then(|r| match r {
            Value::Array(items) => Some(items.len() as u64),
            other => other.get("rowsAffected").and_then(Value::as_u64),
        });
        Some(ChangeEvent {
            template: statement.template.clone(),
            table: table_of(&statement.sql),
            operation,
            statement: statement.explained.clone(),
            rows,
        })
    }
}

fn table_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)^\s*(?:insert\s+into|update|delete\s+from)\s+([A-Za-z0-9_."]+)"#).expect("static regex")
    })
}

/// Target table of an INSERT, UPDATE or DELETE.
pub fn table_of(sql: &str) -> Option<String> {
    table_re()
        .captures(sql)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().replace('"', ""))
}

pub trait ChangeSink: Send + Sync {
    fn emit(&self, event: &ChangeEvent);
}

/// Emits change events as structured log records.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingChangeSink;

impl ChangeSink for TracingChangeSink {
    fn emit(&self, event: &ChangeEvent) {
        tracing::info!(
            template = %event.template,
            operation = %event.operation,
            table = ?event.table,
            rows = ?event.rows,
            statement = %event.statement,
            "change captured"
        );
    }
}
