//! _sys_* table DDL and setting persistence. All _sys_* tables live in a schema named from `APIFLOW_SCHEMA` env (default `apiflow`).

use crate::config::runtime::DEFAULT_SCHEMA;
use crate::error::AppError;
use sqlx::ConnectOptions;
use sqlx::PgPool;
use std::collections::HashMap;
use std::str::FromStr;

/// Schema name for _sys_* tables. From env `APIFLOW_SCHEMA`, default `apiflow`. Must be a valid PostgreSQL identifier.
pub fn sys_schema() -> String {
    std::env::var("APIFLOW_SCHEMA")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SCHEMA.into())
}

/// Returns schema-qualified table name for _sys_* tables (e.g. "apiflow._sys_apis").
pub fn qualified_sys_table(table: &str) -> String {
    format!("{}.{}", sys_schema(), table)
}

/// Setting tables, one row per record keyed by its stable id.
pub const SETTING_TABLES: &[&str] = &["_sys_apis", "_sys_sources", "_sys_templates"];

/// Create the schema if missing, then each setting table and its history table.
pub async fn ensure_sys_tables(pool: &PgPool) -> Result<(), AppError> {
    let schema = sys_schema();
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
        .execute(pool)
        .await?;

    for table in SETTING_TABLES {
        let q_table = qualified_sys_table(table);
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id TEXT PRIMARY KEY,
                payload JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                version BIGINT NOT NULL DEFAULT 1
            )
            "#,
            q_table
        );
        sqlx::query(&ddl).execute(pool).await?;

        let history_table = qualified_sys_table(&format!("{}_history", table));
        let history_ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id TEXT NOT NULL,
                payload JSONB NOT NULL,
                version BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (id, version)
            )
            "#,
            history_table
        );
        sqlx::query(&history_ddl).execute(pool).await?;
    }
    tracing::info!(schema = %schema, "setting tables ready");
    Ok(())
}

/// Storage id of a record: `apiId`, `sourceId` or `templateId` by table.
pub fn record_id(table: &str, rec: &serde_json::Value) -> Result<String, AppError> {
    let key = match table {
        "_sys_apis" => "apiId",
        "_sys_sources" => "sourceId",
        "_sys_templates" => "templateId",
        other => return Err(AppError::BadRequest(format!("unknown setting table '{}'", other))),
    };
    rec.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::BadRequest(format!("each {} record must have a '{}' field", table, key)))
}

/// True when the incoming records equal the stored payloads id for id.
fn payloads_unchanged(
    table: &str,
    current: &HashMap<String, serde_json::Value>,
    records: &[serde_json::Value],
) -> Result<bool, AppError> {
    if current.len() != records.len() {
        return Ok(false);
    }
    for rec in records {
        let id = record_id(table, rec)?;
        match current.get(&id) {
            None => return Ok(false),
            Some(existing) if existing != rec => return Ok(false),
            Some(_) => {}
        }
    }
    Ok(true)
}

/// Replace all rows of a setting table: copy current rows to history, delete,
/// insert with the next version. Identical payloads write nothing.
/// Returns (count inserted, version).
pub async fn replace_records(
    pool: &PgPool,
    table: &str,
    records: &[serde_json::Value],
) -> Result<(u64, i64), AppError> {
    let q_table = qualified_sys_table(table);
    let mut tx = pool.begin().await?;
    let current_version: (Option<i64>,) = sqlx::query_as(&format!("SELECT MAX(version) FROM {}", q_table))
        .fetch_one(&mut *tx)
        .await?;
    let current_version = current_version.0.unwrap_or(0);

    let rows: Vec<(String, serde_json::Value)> = sqlx::query_as(&format!("SELECT id, payload FROM {}", q_table))
        .fetch_all(&mut *tx)
        .await?;
    let current: HashMap<String, serde_json::Value> = rows.into_iter().collect();
    if payloads_unchanged(table, &current, records)? {
        return Ok((0, current_version));
    }

    let history_table = qualified_sys_table(&format!("{}_history", table));
    let new_version = current_version + 1;
    sqlx::query(&format!(
        "INSERT INTO {} (id, payload, version, created_at) SELECT id, payload, version, updated_at FROM {}",
        history_table, q_table
    ))
    .execute(&mut *tx)
    .await?;
    sqlx::query(&format!("DELETE FROM {}", q_table)).execute(&mut *tx).await?;

    let mut count = 0u64;
    for rec in records {
        let id = record_id(table, rec)?;
        sqlx::query(&format!(
            "INSERT INTO {} (id, payload, updated_at, version) VALUES ($1, $2, NOW(), $3)",
            q_table
        ))
        .bind(&id)
        .bind(rec)
        .bind(new_version)
        .execute(&mut *tx)
        .await?;
        count += 1;
    }
    tx.commit().await?;
    tracing::info!(table, count, version = new_version, "setting records replaced");
    Ok((count, new_version))
}

/// Ensure the database in `database_url` exists; create it if not. Connects to the
/// default `postgres` database to run CREATE DATABASE. Call before creating the main pool.
pub async fn ensure_database_exists(database_url: &str) -> Result<(), AppError> {
    let (admin_url, db_name) = parse_db_name_from_url(database_url)?;
    if db_name.is_empty() || db_name == "postgres" {
        return Ok(());
    }
    let opts = sqlx::postgres::PgConnectOptions::from_str(&admin_url)
        .map_err(|e| AppError::BadRequest(format!("invalid DATABASE_URL: {}", e)))?;
    let mut conn: sqlx::PgConnection = opts.connect().await?;
    let exists: (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
        .bind(&db_name)
        .fetch_one(&mut conn)
        .await?;
    if !exists.0 {
        sqlx::query(&format!("CREATE DATABASE {}", quote_ident(&db_name)))
            .execute(&mut conn)
            .await?;
    }
    Ok(())
}

fn parse_db_name_from_url(url: &str) -> Result<(String, String), AppError> {
    let path_start = url.rfind('/').ok_or_else(|| AppError::BadRequest("DATABASE_URL: no path".into()))? + 1;
    let path_and_query = url.get(path_start..).unwrap_or("");
    let db_name = path_and_query.split('?').next().unwrap_or("").trim();
    let base = url.get(..path_start).unwrap_or(url);
    Ok((format!("{}postgres", base), db_name.to_string()))
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_ids_follow_table_kind() {
        assert_eq!(record_id("_sys_apis", &json!({"apiId": "listItems"})).unwrap(), "listItems");
        assert_eq!(record_id("_sys_templates", &json!({"templateId": "list"})).unwrap(), "list");
        assert!(record_id("_sys_sources", &json!({"id": "db"})).is_err());
        assert!(record_id("_sys_other", &json!({})).is_err());
    }

    #[test]
    fn unchanged_detection_compares_by_id() {
        let rec = json!({"sourceId": "db", "sourceType": "SQL"});
        let current: HashMap<String, serde_json::Value> = [("db".to_string(), rec.clone())].into_iter().collect();
        assert!(payloads_unchanged("_sys_sources", &current, &[rec]).unwrap());
        let changed = json!({"sourceId": "db", "sourceType": "SQL_MEMORY"});
        assert!(!payloads_unchanged("_sys_sources", &current, &[changed]).unwrap());
    }

    #[test]
    fn admin_url_targets_postgres_database() {
        let (admin, db) = parse_db_name_from_url("postgres://u:p@host:5432/items?sslmode=disable").unwrap();
        assert_eq!(admin, "postgres://u:p@host:5432/postgres");
        assert_eq!(db, "items");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
