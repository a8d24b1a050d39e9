//! Apiflow SDK: compiles declarative API settings into request pipelines over
//! templated SQL sources.

pub mod config;
pub mod container;
pub mod error;
pub mod flow;
pub mod handlers;
pub mod response;
pub mod routes;
pub mod schema;
pub mod source;
pub mod state;
pub mod store;
pub mod torm;
pub mod transfer;

pub use config::{from_json, from_records, load_from_pool, validate, ApiDef, RuntimeConfig, Setting, SourceDef, TormDef};
pub use container::{CompiledApi, Container, ErrorHandler};
pub use error::{AppError, BindingError, CompileError, ConfigError, StatementError, TemplateError};
pub use flow::{BusinessLogic, ChangeEvent, ChangeSink, ExecutionContext, ScriptEngine, StageKind};
pub use routes::{app, common_routes, common_routes_with_ready, dispatch_routes, setting_routes};
pub use source::{MemoryProvider, PgProvider, Source, SourcePool, SourceType};
pub use state::{AppState, ContainerBuilder};
pub use store::{ensure_database_exists, ensure_sys_tables, replace_records};
pub use torm::{CompiledStatement, StatementCompiler, TextTemplateEngine};
pub use transfer::{Path, Transfer, Transfers};

/// Install a fmt subscriber filtered by `RUST_LOG`, defaulting to
/// `apiflow_sdk=info`. Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("apiflow_sdk=info")),
        )
        .try_init();
}
