//! Load a Setting from JSON, from record rows, or from the _sys_* tables in DB.

use crate::config::types::*;
use crate::error::ConfigError;
use crate::store::qualified_sys_table;
use crate::transfer::Transfers;
use sqlx::PgPool;

pub fn from_json(text: &str) -> Result<Setting, ConfigError> {
    serde_json::from_str(text).map_err(|e| ConfigError::Load(e.to_string()))
}

/// Build a Setting from stored rows. Sources whose `env` is set and differs
/// from `env` are skipped.
pub fn from_records(
    apis: &[ApiRecord],
    sources: &[SourceRecord],
    templates: &[TemplateRecord],
    env: Option<&str>,
) -> Result<Setting, ConfigError> {
    let mut setting = Setting::default();
    for rec in sources {
        if let Some(env) = env {
            if !rec.env.is_empty() && !rec.env.eq_ignore_ascii_case(env) {
                continue;
            }
        }
        setting.sources.push(SourceDef {
            identifier: rec.source_id.clone(),
            source_type: rec.source_type.parse()?,
            config: rec.config.clone(),
            ddl: rec.ddl.clone(),
            env: rec.env.clone(),
        });
    }
    for rec in templates {
        setting.torms.push(TormDef {
            name: rec.template_id.clone(),
            source: rec.source_id.clone(),
            template: rec.tpl.clone(),
            transfers: Transfers::parse(&rec.transfer_line)?,
            flow: split_flow(&[rec.flow.clone()]),
            description: rec.title.clone(),
        });
    }
    for rec in apis {
        let dependents: Vec<Dependent> = if rec.dependents.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&rec.dependents)
                .map_err(|e| ConfigError::Load(format!("api '{}' dependents: {}", rec.api_id, e)))?
        };
        setting.apis.push(ApiDef {
            name: rec.api_id.clone(),
            route: rec.route.trim().to_string(),
            method: rec.method.trim().to_string(),
            request_schema: rec.input_schema.trim().to_string(),
            response_schema: rec.output_schema.trim().to_string(),
            transfers: Transfers::parse(&rec.path_transfers)?,
            flow: split_flow(&[rec.flow.clone()]),
            dependents,
            script: rec.script.clone(),
            description: rec.title.clone(),
        });
    }
    Ok(setting)
}

/// Load a Setting from the _sys_apis, _sys_sources and _sys_templates tables.
/// Tables must already exist (ensure_sys_tables).
pub async fn load_from_pool(pool: &PgPool, env: Option<&str>) -> Result<Setting, ConfigError> {
    let apis = load_config_table::<ApiRecord>(pool, &qualified_sys_table("_sys_apis")).await?;
    let sources = load_config_table::<SourceRecord>(pool, &qualified_sys_table("_sys_sources")).await?;
    let templates = load_config_table::<TemplateRecord>(pool, &qualified_sys_table("_sys_templates")).await?;
    tracing::info!(
        apis = apis.len(),
        sources = sources.len(),
        templates = templates.len(),
        "setting loaded from database"
    );
    from_records(&apis, &sources, &templates, env)
}

async fn load_config_table<T>(pool: &PgPool, table: &str) -> Result<Vec<T>, ConfigError>
where
    T: for<'de> serde::Deserialize<'de>,
{
    let sql = format!("SELECT payload FROM {} ORDER BY id", table);
    tracing::debug!(sql = %sql, "query");
    let rows = sqlx::query_scalar::<_, serde_json::Value>(&sql)
        .fetch_all(pool)
        .await
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let value: T = serde_json::from_value(row).map_err(|e| ConfigError::Load(e.to_string()))?;
        out.push(value);
    }
    Ok(out)
}
