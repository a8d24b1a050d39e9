//! PostgreSQL statement provider over a lazily connected sqlx pool.

use super::provider::{ResourceProvider, StatementExecutor};
use crate::error::AppError;
use crate::torm::CompiledStatement;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sqlx::encode::{Encode, IsNull};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow, PgTypeInfo, Postgres};
use sqlx::Database;

const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// `SQL` source config: a bare DSN or `{"dsn": "...", "maxConnections": 5}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SqlSourceConfig {
    dsn: String,
    #[serde(default)]
    max_connections: Option<u32>,
}

impl SqlSourceConfig {
    fn parse(config: &str) -> Result<Self, AppError> {
        let trimmed = config.trim();
        if trimmed.starts_with('{') {
            serde_json::from_str(trimmed).map_err(|e| AppError::Resource(format!("sql source config: {}", e)))
        } else {
            Ok(SqlSourceConfig {
                dsn: trimmed.to_string(),
                max_connections: None,
            })
        }
    }
}

pub struct PgProvider {
    pool: PgPool,
    database: Option<String>,
}

impl PgProvider {
    /// Build the pool without connecting; the first statement opens a connection.
    pub fn connect_lazy(config: &str) -> Result<Self, AppError> {
        let cfg = SqlSourceConfig::parse(config)?;
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS))
            .connect_lazy(&cfg.dsn)
            .map_err(|e| AppError::Resource(format!("sql source: {}", e)))?;
        Ok(PgProvider {
            pool,
            database: database_name_from_dsn(&cfg.dsn),
        })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        PgProvider { pool, database: None }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn database_name_from_dsn(dsn: &str) -> Option<String> {
    let path_start = dsn.rfind('/')? + 1;
    let name = dsn.get(path_start..)?.split('?').next()?.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Whether the statement produces rows (and should be fetched rather than executed).
pub(crate) fn returns_rows(sql: &str) -> bool {
    let head = sql.trim_start().split_whitespace().next().unwrap_or("").to_lowercase();
    matches!(head.as_str(), "select" | "with" | "values" | "show" | "table" | "explain")
        || sql.to_lowercase().contains(" returning ")
}

impl ResourceProvider for PgProvider {
    fn type_name(&self) -> &'static str {
        "postgres"
    }

    fn database_name(&self) -> Option<String> {
        self.database.clone()
    }

    fn statement_executor(&self) -> Option<&dyn StatementExecutor> {
        Some(self)
    }
}

#[async_trait]
impl StatementExecutor for PgProvider {
    async fn exec_or_query(&self, statement: &CompiledStatement) -> Result<Value, AppError> {
        tracing::debug!(sql = %statement.sql, params = ?statement.params, "query");
        let mut query = sqlx::query(&statement.sql);
        for p in &statement.params {
            query = query.bind(PgBindValue::from_json(p)?);
        }
        if returns_rows(&statement.sql) {
            let rows = query.fetch_all(&self.pool).await?;
            Ok(Value::Array(rows.iter().map(row_to_json).collect()))
        } else {
            let done = query.execute(&self.pool).await?;
            Ok(serde_json::json!({ "rowsAffected": done.rows_affected() }))
        }
    }
}

/// A statement parameter in a form sqlx can bind.
#[derive(Clone, Debug)]
enum PgBindValue {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    Text(String),
    Json(Value),
}

impl PgBindValue {
    fn from_json(v: &Value) -> Result<Self, AppError> {
        Ok(match v {
            Value::Null => PgBindValue::Null,
            Value::Bool(b) => PgBindValue::Bool(*b),
            Value::Number(n) => match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => PgBindValue::I64(i),
                (None, Some(f)) => PgBindValue::F64(f),
                (None, None) => return Err(AppError::BadRequest(format!("number {} cannot be bound", n))),
            },
            Value::String(s) => PgBindValue::Text(s.clone()),
            Value::Array(_) | Value::Object(_) => PgBindValue::Json(v.clone()),
        })
    }
}

impl<'q> Encode<'q, Postgres> for PgBindValue {
    fn encode_by_ref(
        &self,
        buf: &mut <Postgres as Database>::ArgumentBuffer<'q>,
    ) -> Result<IsNull, Box<dyn std::error::Error + Send + Sync>> {
        Ok(match self {
            PgBindValue::Null => <Option<i32> as Encode<Postgres>>::encode_by_ref(&None, buf)?,
            PgBindValue::Bool(b) => <bool as Encode<Postgres>>::encode_by_ref(b, buf)?,
            PgBindValue::I64(n) => <i64 as Encode<Postgres>>::encode_by_ref(n, buf)?,
            PgBindValue::F64(n) => <f64 as Encode<Postgres>>::encode_by_ref(n, buf)?,
            PgBindValue::Text(s) => {
                let s_ref: &str = s.as_str();
                <&str as Encode<Postgres>>::encode_by_ref(&s_ref, buf)?
            }
            PgBindValue::Json(v) => <serde_json::Value as Encode<Postgres>>::encode_by_ref(v, buf)?,
        })
    }

    fn produces(&self) -> Option<PgTypeInfo> {
        match self {
            PgBindValue::Null => None,
            PgBindValue::Bool(_) => Some(<bool as sqlx::Type<Postgres>>::type_info()),
            PgBindValue::I64(_) => Some(<i64 as sqlx::Type<Postgres>>::type_info()),
            PgBindValue::F64(_) => Some(<f64 as sqlx::Type<Postgres>>::type_info()),
            PgBindValue::Text(_) => Some(<String as sqlx::Type<Postgres>>::type_info()),
            PgBindValue::Json(_) => Some(<serde_json::Value as sqlx::Type<Postgres>>::type_info()),
        }
    }
}

impl sqlx::Type<Postgres> for PgBindValue {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("TEXT")
    }
}

fn row_to_json(row: &PgRow) -> Value {
    use sqlx::Column;
    use sqlx::Row;
    let mut map = serde_json::Map::new();
    for col in row.columns() {
        let name = col.name();
        map.insert(name.to_string(), cell_to_value(row, name));
    }
    Value::Object(map)
}

fn cell_to_value(row: &PgRow, name: &str) -> Value {
    use sqlx::Row;
    if let Ok(Some(n)) = row.try_get::<Option<i16>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<i32>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<i64>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<f64>, _>(name) {
        if let Some(n) = serde_json::Number::from_f64(n) {
            return Value::Number(n);
        }
    }
    if let Ok(Some(b)) = row.try_get::<Option<bool>, _>(name) {
        return Value::Bool(b);
    }
    if let Ok(Some(u)) = row.try_get::<Option<uuid::Uuid>, _>(name) {
        return Value::String(u.to_string());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(name) {
        return Value::String(d.to_rfc3339());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::NaiveDateTime>, _>(name) {
        return Value::String(d.format("%Y-%m-%d %H:%M:%S").to_string());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::NaiveDate>, _>(name) {
        return Value::String(d.format("%Y-%m-%d").to_string());
    }
    if let Ok(Some(s)) = row.try_get::<Option<String>, _>(name) {
        return Value::String(s);
    }
    if let Ok(Some(j)) = row.try_get::<Option<Value>, _>(name) {
        return j;
    }
    Value::Null
}
