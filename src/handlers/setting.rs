//! Setting ingestion handlers: POST/GET for each setting table.

use crate::error::AppError;
use crate::response::success_many;
use crate::state::AppState;
use crate::store::{qualified_sys_table, replace_records};
use axum::extract::State;
use axum::Json;
use serde_json::Value;
use sqlx::PgPool;

/// Replace every record of one setting table and, when anything changed,
/// recompile the container from the stored setting.
pub(crate) async fn replace_setting(
    state: &AppState,
    table: &str,
    body: Vec<Value>,
) -> Result<(Vec<Value>, i64), AppError> {
    let (count, version) = replace_records(state.pool()?, table, &body).await?;
    if count > 0 {
        state.reload().await?;
    }
    Ok((body, version))
}

async fn get_setting(pool: &PgPool, table: &str) -> Result<Vec<Value>, AppError> {
    let q_table = qualified_sys_table(table);
    let rows = sqlx::query_scalar::<_, Value>(&format!("SELECT payload FROM {} ORDER BY id", q_table))
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

macro_rules! setting_handler {
    ($method:ident, $table:expr) => {
        pub async fn $method(
            State(state): State<AppState>,
            Json(body): Json<Vec<Value>>,
        ) -> Result<impl axum::response::IntoResponse, AppError> {
            let (out, version) = replace_setting(&state, $table, body).await?;
            Ok(success_many(out, Some(version)))
        }
    };
}

macro_rules! get_setting_handler {
    ($method:ident, $table:expr) => {
        pub async fn $method(State(state): State<AppState>) -> Result<impl axum::response::IntoResponse, AppError> {
            let out = get_setting(state.pool()?, $table).await?;
            Ok(success_many(out, None))
        }
    };
}

setting_handler!(post_apis, "_sys_apis");
setting_handler!(post_sources, "_sys_sources");
setting_handler!(post_templates, "_sys_templates");

get_setting_handler!(get_apis, "_sys_apis");
get_setting_handler!(get_sources, "_sys_sources");
get_setting_handler!(get_templates, "_sys_templates");
