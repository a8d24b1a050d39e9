//! Execution context handed to business logic, and the logic implementations.

use super::stage::{Pipeline, StageContext, StageKind};
use crate::config::{ApiDef, ProjectDef, TormDef};
use crate::error::{AppError, ConfigError};
use crate::transfer::Transfers;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};

/// A compiled Torm: its definition and resolved pipeline.
#[derive(Debug)]
pub struct CompiledTorm {
    pub def: TormDef,
    pub pipeline: Pipeline,
}

pub type TormRegistry = HashMap<String, Arc<CompiledTorm>>;

/// Signature script functions must expose to serve as business logic.
pub const LOGIC_SIGNATURE: &str = "func(ctx, input) (output, error)";

/// Signature of functions listed in the project's function transfers.
pub const TRANSFER_SIGNATURE: &str = "func(input) (output, error)";

pub type ScriptFn = Arc<dyn Fn(&ExecutionContext, Value) -> Result<Value, AppError> + Send + Sync>;

/// A scripting runtime for one project language.
pub trait ScriptEngine: Send + Sync {
    fn language(&self) -> &str;

    /// Load source code into the engine.
    fn write_code(&self, source: &str) -> Result<(), AppError>;

    /// Look up a loaded function with the given signature.
    fn get_callable(&self, name: &str, signature: &str) -> Result<ScriptFn, AppError>;

    fn run(&self, script: &str) -> Result<String, AppError>;
}

/// Project state shared by every Api of a container.
#[derive(Clone, Default)]
pub struct Project {
    pub def: ProjectDef,
    pub engine: Option<Arc<dyn ScriptEngine>>,
}

impl std::fmt::Debug for Project {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Project")
            .field("name", &self.def.name)
            .field("language", &self.def.language)
            .field("engine", &self.engine.as_ref().map(|e| e.language().to_string()))
            .finish()
    }
}

/// Ordered `owner.stage` entries of the stages entered during one dispatch.
#[derive(Clone, Debug, Default)]
pub struct RunTrace(Arc<Mutex<Vec<String>>>);

impl RunTrace {
    pub fn record(&self, owner: &str, stage: StageKind) {
        if let Ok(mut entries) = self.0.lock() {
            entries.push(format!("{}.{}", owner, stage.name()));
        }
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

/// Everything business logic may touch: the Api, its Torms and the project.
/// Cheap to clone; passed by value.
#[derive(Clone)]
pub struct ExecutionContext {
    api: Arc<ApiDef>,
    torms: Arc<TormRegistry>,
    project: Arc<Project>,
    trace: RunTrace,
}

impl ExecutionContext {
    pub fn new(api: Arc<ApiDef>, torms: Arc<TormRegistry>, project: Arc<Project>) -> Self {
        ExecutionContext {
            api,
            torms,
            project,
            trace: RunTrace::default(),
        }
    }

    pub fn api(&self) -> &ApiDef {
        &self.api
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn trace(&self) -> &RunTrace {
        &self.trace
    }

    /// Torm dependents of the Api, in declaration order.
    pub fn torms(&self) -> Vec<&str> {
        self.api
            .torm_dependents()
            .filter(|n| self.torms.contains_key(*n))
            .collect()
    }

    /// Run a compiled Torm's pipeline with `input` as its dictionary document.
    pub async fn run_torm(&self, name: &str, input: Value) -> Result<Value, AppError> {
        let torm = self
            .torms
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("torm '{}'", name)))?;
        let mut cx = StageContext::new(self.clone(), name);
        torm.pipeline.run(&mut cx, input).await
    }

    fn engine(&self) -> Result<&Arc<dyn ScriptEngine>, AppError> {
        self.project.engine.as_ref().ok_or_else(|| {
            AppError::Config(ConfigError::MissingReference {
                kind: "script engine for language",
                id: self.project.def.language.clone(),
            })
        })
    }

    /// Call project function `func` on `input` and reshape its output with
    /// the transfers declared for it (function output path on the left,
    /// dictionary path on the right).
    pub fn run_transfer_by_func(&self, func: &str, input: &Value) -> Result<Value, AppError> {
        let transfers = self
            .project
            .def
            .func_transfers
            .get(func)
            .ok_or_else(|| AppError::NotFound(format!("transfer function '{}'", func)))?;
        let callable = self.engine()?.get_callable(func, TRANSFER_SIGNATURE)?;
        let produced = callable(self, input.clone())?;
        tracing::debug!(function = %func, "transfer function ran");
        Ok(transfers.apply(&produced))
    }

    /// Run a script snippet in the project's engine.
    pub fn run_script(&self, script: &str) -> Result<String, AppError> {
        self.engine()?.run(script)
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("api", &self.api.name)
            .field("torms", &self.torms())
            .finish()
    }
}

/// Request-specific behavior of an Api.
#[async_trait]
pub trait BusinessLogic: Send + Sync {
    async fn call(&self, cx: ExecutionContext, input: Value) -> Result<Value, AppError>;
}

#[async_trait]
impl<F, Fut> BusinessLogic for F
where
    F: Fn(ExecutionContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, AppError>> + Send + 'static,
{
    async fn call(&self, cx: ExecutionContext, input: Value) -> Result<Value, AppError> {
        (self)(cx, input).await
    }
}

/// Runs one Torm with the request dictionary.
pub struct RunTorm {
    pub name: String,
}

#[async_trait]
impl BusinessLogic for RunTorm {
    async fn call(&self, cx: ExecutionContext, input: Value) -> Result<Value, AppError> {
        cx.run_torm(&self.name, input).await
    }
}

/// Returns its input.
pub struct EchoInput;

#[async_trait]
impl BusinessLogic for EchoInput {
    async fn call(&self, _cx: ExecutionContext, input: Value) -> Result<Value, AppError> {
        Ok(input)
    }
}

/// A script function resolved through the project's engine.
pub struct ScriptLogic {
    pub name: String,
    pub callable: ScriptFn,
}

#[async_trait]
impl BusinessLogic for ScriptLogic {
    async fn call(&self, cx: ExecutionContext, input: Value) -> Result<Value, AppError> {
        tracing::debug!(function = %self.name, "script logic");
        (self.callable)(&cx, input)
    }
}

/// Pick the function producing each required output path. Exactly one
/// candidate is chosen; none or several is a config error.
pub fn select_transfer_funcs(
    required: &[String],
    funcs: &BTreeMap<String, Transfers>,
) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut chosen = BTreeMap::new();
    for path in required {
        let candidates: Vec<&String> = funcs
            .iter()
            .filter(|(_, ts)| ts.iter().any(|t| t.dst.as_str() == path.as_str()))
            .map(|(name, _)| name)
            .collect();
        match candidates.as_slice() {
            [only] => {
                chosen.insert(path.clone(), (*only).clone());
            }
            [] => {
                return Err(ConfigError::MissingReference {
                    kind: "transfer function for",
                    id: path.clone(),
                })
            }
            several => {
                return Err(ConfigError::Validation(format!(
                    "'{}' is produced by several functions: {}",
                    path,
                    several.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
                )))
            }
        }
    }
    Ok(chosen)
}

/// Run `total_torm`, then `list_torm` unless the total is zero, and merge the
/// list document into the total document. A zero total yields `null`.
pub async fn paginate(cx: &ExecutionContext, total_torm: &str, list_torm: &str, input: Value) -> Result<Value, AppError> {
    let total = cx.run_torm(total_torm, input.clone()).await?;
    if count_of(&total) == Some(0) {
        return Ok(Value::Null);
    }
    let list = cx.run_torm(list_torm, input).await?;
    let mut merged = total;
    merge_patch(&mut merged, &list);
    Ok(merged)
}

/// First integer found in a document: the number itself, the first row of an
/// array, or the first numeric field of an object.
pub fn count_of(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        Value::Array(items) => items.first().and_then(count_of),
        Value::Object(map) => map.values().find_map(count_of),
        _ => None,
    }
}

/// JSON merge patch: objects merge recursively, `null` removes a key, other
/// values replace.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        for (k, v) in patch_map {
            if v.is_null() {
                target_map.remove(k);
            } else {
                merge_patch(target_map.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
    }
}
