//! Example consumer: serves a setting through apiflow-sdk.
//!
//! Run from repo root: `cargo run -p example-consumer`
//!
//! With `DATABASE_URL` set the setting is read from the `_sys_*` tables and
//! can be replaced through `POST /_setting/{apis,sources,templates}`.
//! Otherwise `APIFLOW_SETTING_FILE` names a JSON setting, falling back to a
//! small in-memory demo.

use apiflow_sdk::{
    app, ensure_database_exists, ensure_sys_tables, from_json, init_tracing, load_from_pool, validate, AppState,
    Container, RuntimeConfig, Setting,
};
use tokio::net::TcpListener;

const DEMO_SETTING: &str = r#"{
  "sources": [{
    "identifier": "demo",
    "type": "SQL_MEMORY",
    "config": "{\"select * from items where status = 1\": [{\"id\": 1, \"title\": \"first\"}]}"
  }],
  "torms": [{
    "name": "listItems",
    "source": "demo",
    "template": "select * from items where status = :Status"
  }],
  "apis": [{
    "name": "items",
    "route": "/items",
    "method": "GET",
    "requestSchema": "fullname=status,format=int,default=1,dst=Status"
  }]
}"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let runtime = RuntimeConfig::from_env();
    init_tracing();

    let pool = match std::env::var("DATABASE_URL") {
        Ok(database_url) => {
            ensure_database_exists(&database_url).await?;
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(5)
                .connect(&database_url)
                .await?;
            ensure_sys_tables(&pool).await?;
            Some(pool)
        }
        Err(_) => None,
    };

    let setting: Setting = match (&pool, std::env::var("APIFLOW_SETTING_FILE")) {
        (Some(pool), _) => load_from_pool(pool, runtime.env.as_deref()).await?,
        (None, Ok(path)) => from_json(&std::fs::read_to_string(path)?)?,
        (None, Err(_)) => from_json(DEMO_SETTING)?,
    };
    validate(&setting)?;

    let container = Container::with_runtime(runtime);
    container.register_setting(setting)?;
    container.compile()?;

    let mut state = AppState::new(container);
    if let Some(pool) = pool {
        state = state.with_pool(pool);
    }

    let listener = TcpListener::bind("127.0.0.1:3000").await?;
    let port = listener.local_addr()?.port();
    tracing::info!("example consumer listening on http://127.0.0.1:{}", port);
    axum::serve(listener, app(state)).await?;
    Ok(())
}
