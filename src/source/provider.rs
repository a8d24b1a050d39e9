//! Provider contracts and the in-memory statement provider.

use crate::error::AppError;
use crate::torm::CompiledStatement;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Concrete backing-resource handle behind a source.
pub trait ResourceProvider: Send + Sync {
    fn type_name(&self) -> &'static str;

    fn database_name(&self) -> Option<String> {
        None
    }

    /// Handle for running rendered statements; `None` when the provider does
    /// not execute statements.
    fn statement_executor(&self) -> Option<&dyn StatementExecutor> {
        None
    }
}

#[async_trait]
pub trait StatementExecutor: Send + Sync {
    /// Run a statement. Queries return an array of row objects; other
    /// statements return `{"rowsAffected": n}`.
    async fn exec_or_query(&self, statement: &CompiledStatement) -> Result<Value, AppError>;
}

/// Statements kept in a `MemoryProvider`'s log; older entries are dropped.
pub const EXECUTED_LOG_LIMIT: usize = 256;

/// Answers statements from a fixed map keyed by explained SQL.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    results: HashMap<String, Value>,
    executed: Mutex<VecDeque<String>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Config is a JSON object mapping explained SQL to its result.
    pub fn from_config(config: &str) -> Result<Self, AppError> {
        if config.trim().is_empty() {
            return Ok(Self::new());
        }
        let map: HashMap<String, Value> = serde_json::from_str(config)
            .map_err(|e| AppError::Resource(format!("memory source config: {}", e)))?;
        let mut provider = Self::new();
        for (sql, result) in map {
            provider = provider.with_result(&sql, result);
        }
        Ok(provider)
    }

    pub fn with_result(mut self, sql: &str, result: Value) -> Self {
        self.results.insert(normalize_key(sql), result);
        self
    }

    /// Explained SQL of the most recent statements, oldest first.
    pub fn executed(&self) -> Vec<String> {
        self.executed
            .lock()
            .map(|g| g.iter().cloned().collect())
            .unwrap_or_default()
    }
}

fn normalize_key(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl ResourceProvider for MemoryProvider {
    fn type_name(&self) -> &'static str {
        "memory_db"
    }

    fn database_name(&self) -> Option<String> {
        Some("memory".into())
    }

    fn statement_executor(&self) -> Option<&dyn StatementExecutor> {
        Some(self)
    }
}

#[async_trait]
impl StatementExecutor for MemoryProvider {
    async fn exec_or_query(&self, statement: &CompiledStatement) -> Result<Value, AppError> {
        let key = normalize_key(&statement.explained);
        if let Ok(mut log) = self.executed.lock() {
            if log.len() == EXECUTED_LOG_LIMIT {
                log.pop_front();
            }
            log.push_back(statement.explained.clone());
        }
        self.results
            .get(&key)
            .cloned()
            .ok_or_else(|| AppError::Resource(format!("memory provider has no result for: {}", key)))
    }
}
