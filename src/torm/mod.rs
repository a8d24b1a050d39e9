//! Torm: named statement templates rendered against request data, bound to
//! positional parameters and run on the source their name is bound to.

mod statement;
pub mod template;
mod volume;

pub use statement::{bind_named, post_process, CompiledStatement};
pub use template::{TextTemplateEngine, TextTemplates};
pub use volume::{normalize, normalize_value, volume_from_value, volume_to_value, Volume};

use crate::error::{AppError, CompileError, TemplateError};
use crate::source::SourcePool;
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Parses template text into a set of named templates.
pub trait TemplateEngine: Send + Sync {
    fn parse(&self, source: &str) -> Result<Arc<dyn TemplateSet>, TemplateError>;
}

pub trait TemplateSet: Send + Sync {
    /// Names of every template defined in the set, sorted.
    fn defined_names(&self) -> Vec<String>;

    fn execute(&self, name: &str, data: &Value) -> Result<String, TemplateError>;
}

fn define_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"\{\{-?\s*define\s+""#).expect("static regex"))
}

/// Body text as parsed: a body with no define blocks becomes a single
/// template named after its torm.
pub fn wrap_body(name: &str, body: &str) -> String {
    if define_re().is_match(body) {
        body.to_string()
    } else {
        format!("{{{{define \"{}\"}}}}{}{{{{end}}}}", name, body)
    }
}

/// One torm body to bind, as registered.
#[derive(Clone, Copy, Debug)]
pub struct TormBody<'a> {
    pub name: &'a str,
    pub source: &'a str,
    pub body: &'a str,
}

/// Parse every body, bind each defined name to its torm's source, then parse
/// the bodies of each source together so templates can call one another.
/// Returns template name to the set that defines it.
pub fn build_template_sets(
    engine: &dyn TemplateEngine,
    pool: &mut SourcePool,
    bodies: &[TormBody<'_>],
) -> Result<HashMap<String, Arc<dyn TemplateSet>>, CompileError> {
    let mut by_source: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for b in bodies {
        let text = wrap_body(b.name, b.body);
        let own = engine.parse(&text)?;
        for name in own.defined_names() {
            pool.add_template_relation(&name, b.source)?;
        }
        by_source.entry(b.source).or_default().push(text);
    }
    let mut sets = HashMap::new();
    for (source, texts) in by_source {
        let set = engine.parse(&texts.join("\n"))?;
        let names = set.defined_names();
        tracing::debug!(source, templates = ?names, "templates bound");
        for name in names {
            sets.insert(name, set.clone());
        }
    }
    Ok(sets)
}

/// Renders, binds and runs named statements.
pub struct StatementCompiler {
    sets: HashMap<String, Arc<dyn TemplateSet>>,
    pool: Arc<SourcePool>,
    timeout: Option<Duration>,
}

impl StatementCompiler {
    pub fn new(sets: HashMap<String, Arc<dyn TemplateSet>>, pool: Arc<SourcePool>) -> Self {
        StatementCompiler {
            sets,
            pool,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn has_template(&self, name: &str) -> bool {
        self.sets.contains_key(name)
    }

    pub fn pool(&self) -> &SourcePool {
        &self.pool
    }

    /// Render a template against a normalized copy of the volume, post-processed.
    pub fn render(&self, template: &str, volume: &Volume) -> Result<String, AppError> {
        let set = self
            .sets
            .get(template)
            .ok_or_else(|| AppError::NotFound(format!("template '{}'", template)))?;
        let mut volume = volume.clone();
        normalize(&mut volume);
        let data = volume_to_value(&volume);
        match set.execute(template, &data) {
            Ok(text) => Ok(post_process(&text)),
            Err(e) => {
                tracing::warn!(template, volume = %data, error = %e, "template render failed");
                Err(e.into())
            }
        }
    }

    pub fn compile(&self, template: &str, input: &Value) -> Result<CompiledStatement, AppError> {
        let mut volume = volume_from_value(input)?;
        normalize(&mut volume);
        let text = self.render(template, &volume)?;
        let stmt = bind_named(template, &text, &volume)?;
        tracing::debug!(
            template,
            sql = %stmt.sql,
            params = ?stmt.params,
            explained = %stmt.explained,
            "statement"
        );
        Ok(stmt)
    }

    /// Compile and run against the bound source. Only SQL sources execute
    /// statements.
    pub async fn execute(&self, template: &str, input: &Value) -> Result<(CompiledStatement, Value), AppError> {
        let stmt = self.compile(template, input)?;
        let source = self.pool.get_source_by_template(template)?;
        if !source.source_type.is_sql() {
            return Err(AppError::Resource(format!(
                "template '{}': source '{}' is {}, not a SQL source",
                template, source.identifier, source.source_type
            )));
        }
        let provider = source.provider()?;
        let executor = provider.statement_executor().ok_or_else(|| {
            AppError::Resource(format!(
                "template '{}': provider {} does not execute statements",
                template,
                provider.type_name()
            ))
        })?;
        let result = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, executor.exec_or_query(&stmt))
                .await
                .map_err(|_| AppError::Timeout(format!("template '{}' after {:?}", template, limit)))??,
            None => executor.exec_or_query(&stmt).await?,
        };
        Ok((stmt, result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BindingError;
    use crate::source::{MemoryProvider, Source, SourceType};
    use serde_json::json;

    fn pool_with(provider: MemoryProvider) -> SourcePool {
        let mut pool = SourcePool::new();
        pool.register_source(Source::new("db", SourceType::SqlMemory, "").with_provider(Arc::new(provider)));
        pool.register_source(Source::new("cache", SourceType::Redis, ""));
        pool
    }

    #[test]
    fn plain_body_is_wrapped_under_its_name() {
        assert_eq!(wrap_body("get", "select 1"), r#"{{define "get"}}select 1{{end}}"#);
        let defined = r#"{{ define "a" }}x{{end}}"#;
        assert_eq!(wrap_body("get", defined), defined);
    }

    #[tokio::test]
    async fn compiles_and_executes_against_bound_source() {
        let provider = MemoryProvider::new().with_result("select * from items where status = 1", json!([{"id": 9}]));
        let mut pool = pool_with(provider);
        let bodies = [TormBody {
            name: "listItems",
            source: "db",
            body: "select * from items\n{{if eq .Status 1}}where status = :Status{{end}}\n",
        }];
        let sets = build_template_sets(&TextTemplateEngine, &mut pool, &bodies).unwrap();
        let compiler = StatementCompiler::new(sets, Arc::new(pool)).with_timeout(Duration::from_secs(1));

        let first = compiler.compile("listItems", &json!({"Status": 1.0})).unwrap();
        let second = compiler.compile("listItems", &json!({"Status": 1})).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.sql, "select * from items\nwhere status = $1");

        let (_, rows) = compiler.execute("listItems", &json!({"Status": 1})).await.unwrap();
        assert_eq!(rows, json!([{"id": 9}]));
    }

    #[test]
    fn duplicate_template_across_sources_is_a_binding_error() {
        let mut pool = pool_with(MemoryProvider::new());
        pool.register_source(Source::new("db2", SourceType::SqlMemory, ""));
        let bodies = [
            TormBody {
                name: "list",
                source: "db",
                body: "select 1",
            },
            TormBody {
                name: "list",
                source: "db2",
                body: "select 2",
            },
        ];
        let err = build_template_sets(&TextTemplateEngine, &mut pool, &bodies).err().unwrap();
        assert!(matches!(
            err,
            CompileError::Binding(BindingError::DuplicateTemplate { .. })
        ));
    }

    #[tokio::test]
    async fn non_sql_source_is_rejected() {
        let mut pool = pool_with(MemoryProvider::new());
        let bodies = [TormBody {
            name: "warm",
            source: "cache",
            body: "select 1",
        }];
        let sets = build_template_sets(&TextTemplateEngine, &mut pool, &bodies).unwrap();
        let compiler = StatementCompiler::new(sets, Arc::new(pool));
        let err = compiler.execute("warm", &json!({})).await.err().unwrap();
        assert!(matches!(err, AppError::Resource(_)));
    }

    #[test]
    fn missing_parameter_surfaces_as_statement_error() {
        let mut pool = pool_with(MemoryProvider::new());
        let bodies = [TormBody {
            name: "get",
            source: "db",
            body: "select * from items where id = :Id",
        }];
        let sets = build_template_sets(&TextTemplateEngine, &mut pool, &bodies).unwrap();
        let compiler = StatementCompiler::new(sets, Arc::new(pool));
        let err = compiler.compile("get", &json!({})).err().unwrap();
        assert!(matches!(err, AppError::Statement(_)));
    }
}
