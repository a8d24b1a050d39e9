//! Container: registers Apis, Torms and Sources, compiles them once into
//! pipelines keyed by (route, method), and dispatches requests.

use crate::config::{route_key, ApiDef, Dependent, ProjectDef, RuntimeConfig, Setting, SourceDef, TormDef};
use crate::error::{AppError, CompileError, ConfigError, TemplateError};
use crate::flow::{
    or_identity, resolve_flow, ApiParts, BusinessLogic, ChangeSink, CompiledTorm, EchoInput, ExecutionContext,
    Pipeline, Project, RunTorm, RunTrace, ScriptEngine, ScriptLogic, StageContext, StageKind, TormParts,
    TormRegistry, TracingChangeSink, API_STAGES, LOGIC_SIGNATURE, TORM_STAGES,
};
use crate::schema::LineSchema;
use crate::source::{Source, SourcePool};
use crate::torm::{build_template_sets, StatementCompiler, TemplateEngine, TextTemplateEngine, TormBody};
use crate::transfer::{input_namespace, output_namespace};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

/// Turns a pipeline error into a substitute response document.
pub type ErrorHandler = Arc<dyn Fn(&AppError) -> Value + Send + Sync>;

/// One compiled Api, shared by every method it is registered under.
pub struct CompiledApi {
    pub def: Arc<ApiDef>,
    pub pipeline: Pipeline,
    error_handler: Option<ErrorHandler>,
}

impl std::fmt::Debug for CompiledApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledApi")
            .field("name", &self.def.name)
            .field("pipeline", &self.pipeline)
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}

struct Compiled {
    routes: HashMap<String, Arc<CompiledApi>>,
    torms: Arc<TormRegistry>,
    project: Arc<Project>,
    compiler: Arc<StatementCompiler>,
}

/// Mutable registration state; frozen by the first compile.
struct Registry {
    apis: Vec<ApiDef>,
    torms: Vec<TormDef>,
    pool: SourcePool,
    handlers: HashMap<String, Arc<dyn BusinessLogic>>,
    error_handlers: HashMap<String, ErrorHandler>,
    engines: HashMap<String, Arc<dyn ScriptEngine>>,
    sink: Arc<dyn ChangeSink>,
    template_engine: Arc<dyn TemplateEngine>,
    project: ProjectDef,
    compiled: bool,
}

impl Default for Registry {
    fn default() -> Self {
        Registry {
            apis: Vec::new(),
            torms: Vec::new(),
            pool: SourcePool::new(),
            handlers: HashMap::new(),
            error_handlers: HashMap::new(),
            engines: HashMap::new(),
            sink: Arc::new(TracingChangeSink),
            template_engine: Arc::new(TextTemplateEngine),
            project: ProjectDef::default(),
            compiled: false,
        }
    }
}

/// Snapshot of the registry taken when compilation starts.
struct Frozen {
    apis: Vec<ApiDef>,
    torms: Vec<TormDef>,
    pool: SourcePool,
    handlers: HashMap<String, Arc<dyn BusinessLogic>>,
    error_handlers: HashMap<String, ErrorHandler>,
    engines: HashMap<String, Arc<dyn ScriptEngine>>,
    sink: Arc<dyn ChangeSink>,
    template_engine: Arc<dyn TemplateEngine>,
    project: ProjectDef,
}

pub struct Container {
    runtime: RuntimeConfig,
    registry: Mutex<Registry>,
    compiled: OnceLock<Result<Compiled, CompileError>>,
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

impl Container {
    pub fn new() -> Self {
        Self::with_runtime(RuntimeConfig::default())
    }

    pub fn with_runtime(runtime: RuntimeConfig) -> Self {
        Container {
            runtime,
            registry: Mutex::new(Registry::default()),
            compiled: OnceLock::new(),
        }
    }

    pub fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    /// Registration lock; fails once compilation has started.
    fn open_registry(&self) -> Result<MutexGuard<'_, Registry>, ConfigError> {
        let reg = self
            .registry
            .lock()
            .map_err(|_| ConfigError::Validation("registry lock poisoned".into()))?;
        if reg.compiled {
            return Err(ConfigError::AlreadyCompiled);
        }
        Ok(reg)
    }

    /// Register every source, torm and api of a setting, sources first.
    /// An Api without dependents depends on every torm of the setting.
    pub fn register_setting(&self, setting: Setting) -> Result<(), ConfigError> {
        for source in setting.sources {
            self.register_source_def(source)?;
        }
        let torm_names: Vec<String> = setting.torms.iter().map(|t| t.name.clone()).collect();
        for torm in setting.torms {
            self.register_torm(torm)?;
        }
        for mut api in setting.apis {
            if api.dependents.is_empty() {
                api.dependents = torm_names.iter().map(|n| Dependent::torm(n)).collect();
            }
            self.register_api(api)?;
        }
        self.set_project(setting.project)
    }

    /// Merge into the Api with the same name or (route, method), or append.
    /// A nameless Api is named after its method and route.
    pub fn register_api(&self, mut api: ApiDef) -> Result<(), ConfigError> {
        crate::config::check_api(&api)?;
        if api.name.trim().is_empty() {
            api.name = derived_name(&api);
        }
        let mut reg = self.open_registry()?;
        match reg.apis.iter_mut().find(|a| a.is_same(&api)) {
            Some(existing) => existing.merge(api)?,
            None => {
                tracing::debug!(api = %api.name, route = %api.route, method = %api.method, "api registered");
                reg.apis.push(api);
            }
        }
        Ok(())
    }

    pub fn register_torm(&self, torm: TormDef) -> Result<(), ConfigError> {
        if torm.name.trim().is_empty() {
            return Err(ConfigError::Validation("torm name must not be empty".into()));
        }
        let mut reg = self.open_registry()?;
        if reg.torms.iter().any(|t| t.name == torm.name) {
            return Err(ConfigError::Duplicate {
                kind: "torm",
                name: torm.name,
            });
        }
        reg.torms.push(torm);
        Ok(())
    }

    /// Insert or replace a source.
    pub fn register_source(&self, source: Source) -> Result<(), ConfigError> {
        let mut reg = self.open_registry()?;
        tracing::debug!(source = %source.identifier, source_type = %source.source_type, "source registered");
        reg.pool.register_source(source);
        Ok(())
    }

    pub fn register_source_def(&self, def: SourceDef) -> Result<(), ConfigError> {
        self.register_source(Source::new(&def.identifier, def.source_type, &def.config).with_ddl(&def.ddl))
    }

    /// Business logic for one route and method; takes precedence over scripts
    /// and dependent torms.
    pub fn register_api_handler<L>(&self, route: &str, method: &str, logic: L) -> Result<(), ConfigError>
    where
        L: BusinessLogic + 'static,
    {
        let mut reg = self.open_registry()?;
        reg.handlers.insert(route_key(route, method), Arc::new(logic));
        Ok(())
    }

    pub fn register_error_handler<F>(&self, route: &str, method: &str, handler: F) -> Result<(), ConfigError>
    where
        F: Fn(&AppError) -> Value + Send + Sync + 'static,
    {
        let mut reg = self.open_registry()?;
        reg.error_handlers.insert(route_key(route, method), Arc::new(handler));
        Ok(())
    }

    /// Engine for the project language it reports.
    pub fn register_script_engine(&self, engine: Arc<dyn ScriptEngine>) -> Result<(), ConfigError> {
        let mut reg = self.open_registry()?;
        reg.engines.insert(engine.language().to_lowercase(), engine);
        Ok(())
    }

    pub fn set_change_sink(&self, sink: Arc<dyn ChangeSink>) -> Result<(), ConfigError> {
        self.open_registry()?.sink = sink;
        Ok(())
    }

    pub fn set_template_engine(&self, engine: Arc<dyn TemplateEngine>) -> Result<(), ConfigError> {
        self.open_registry()?.template_engine = engine;
        Ok(())
    }

    /// Replace the project definition; an empty incoming definition keeps the
    /// current one.
    pub fn set_project(&self, project: ProjectDef) -> Result<(), ConfigError> {
        let mut reg = self.open_registry()?;
        if project != ProjectDef::default() {
            reg.project = project;
        }
        Ok(())
    }

    fn freeze(&self) -> Result<Frozen, CompileError> {
        let mut reg = self
            .registry
            .lock()
            .map_err(|_| ConfigError::Validation("registry lock poisoned".into()))?;
        reg.compiled = true;
        Ok(Frozen {
            apis: std::mem::take(&mut reg.apis),
            torms: std::mem::take(&mut reg.torms),
            pool: std::mem::take(&mut reg.pool),
            handlers: std::mem::take(&mut reg.handlers),
            error_handlers: std::mem::take(&mut reg.error_handlers),
            engines: std::mem::take(&mut reg.engines),
            sink: reg.sink.clone(),
            template_engine: reg.template_engine.clone(),
            project: std::mem::take(&mut reg.project),
        })
    }

    /// Compile every registered Api and Torm. Runs once; concurrent callers
    /// wait for the first and all observe its result, errors included.
    pub fn compile(&self) -> Result<(), CompileError> {
        self.compiled_state().map(|_| ())
    }

    fn compiled_state(&self) -> Result<&Compiled, CompileError> {
        self.compiled
            .get_or_init(|| {
                let result = self.freeze().and_then(|frozen| build(frozen, &self.runtime));
                match &result {
                    Ok(c) => tracing::info!(routes = c.routes.len(), torms = c.torms.len(), "container compiled"),
                    Err(e) => tracing::error!(error = %e, "container compile failed"),
                }
                result
            })
            .as_ref()
            .map_err(Clone::clone)
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.get().is_some()
    }

    /// Compiled Api for a route and method, compared case-insensitively.
    pub fn get_compiled_for(&self, route: &str, method: &str) -> Result<Arc<CompiledApi>, AppError> {
        let compiled = self.compiled_state()?;
        compiled
            .routes
            .get(&route_key(route, method))
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("route:{},method:{}", route, method)))
    }

    pub fn statement_compiler(&self) -> Result<Arc<StatementCompiler>, AppError> {
        Ok(self.compiled_state()?.compiler.clone())
    }

    /// Run the pipeline for a route and method. Returns the response document
    /// and the stages entered. A registered error handler turns a pipeline
    /// error into its substitute document.
    pub async fn run(&self, route: &str, method: &str, input: Value) -> Result<(Value, RunTrace), AppError> {
        let compiled = self.compiled_state()?;
        let api = self.get_compiled_for(route, method)?;
        let exec = ExecutionContext::new(api.def.clone(), compiled.torms.clone(), compiled.project.clone());
        let mut cx = StageContext::new(exec, &api.def.name);
        let result = api.pipeline.run(&mut cx, input).await;
        let trace = cx.exec.trace().clone();
        match (result, &api.error_handler) {
            (Ok(out), _) => Ok((out, trace)),
            (Err(e), Some(handler)) => {
                tracing::warn!(api = %api.def.name, error = %e, "pipeline error handled");
                Ok(((**handler)(&e), trace))
            }
            (Err(e), None) => Err(e),
        }
    }

    /// Request-time entry point: JSON payload in, JSON response out. An empty
    /// payload is an empty object.
    pub async fn dispatch(&self, route: &str, method: &str, payload: &[u8]) -> Result<Vec<u8>, AppError> {
        let input = if payload.iter().all(u8::is_ascii_whitespace) {
            Value::Object(Default::default())
        } else {
            serde_json::from_slice(payload)?
        };
        let (out, _) = self.run(route, method, input).await?;
        Ok(serde_json::to_vec(&out)?)
    }
}

/// `get /items/{id}` becomes `get__items__id_`.
fn derived_name(api: &ApiDef) -> String {
    format!("{}_{}", api.method, api.route)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

fn build(frozen: Frozen, runtime: &RuntimeConfig) -> Result<Compiled, CompileError> {
    let Frozen {
        apis,
        torms,
        mut pool,
        handlers,
        error_handlers,
        engines,
        sink,
        template_engine,
        project,
    } = frozen;

    let mut seen = HashSet::new();
    for t in &torms {
        if !seen.insert(t.name.as_str()) {
            return Err(ConfigError::Duplicate {
                kind: "torm",
                name: t.name.clone(),
            }
            .into());
        }
    }

    let bodies: Vec<TormBody<'_>> = torms
        .iter()
        .map(|t| TormBody {
            name: &t.name,
            source: &t.source,
            body: &t.template,
        })
        .collect();
    let sets = build_template_sets(template_engine.as_ref(), &mut pool, &bodies)?;
    let compiler = Arc::new(StatementCompiler::new(sets, Arc::new(pool)).with_timeout(runtime.request_timeout));
    // A Torm runs the template named after it.
    if let Some(undefined) = torms.iter().find(|t| !compiler.has_template(&t.name)) {
        return Err(TemplateError::NotDefined(undefined.name.clone()).into());
    }

    let mut registry = TormRegistry::new();
    for def in torms {
        let (input, output) = def.transfers.split_in_out(&def.name);
        let parts = TormParts {
            name: def.name.clone(),
            input: or_identity(input, &input_namespace(&def.name))?,
            output: or_identity(output, &output_namespace(&def.name))?,
            compiler: compiler.clone(),
            sink: sink.clone(),
        };
        let flow = resolve_flow(&def.name, &def.flow, &StageKind::TORM_DEFAULT)?;
        let pipeline = Pipeline::compose(&def.name, &flow, TORM_STAGES, &parts)?;
        tracing::debug!(torm = %def.name, flow = ?pipeline.flow(), "torm compiled");
        registry.insert(def.name.clone(), Arc::new(CompiledTorm { def, pipeline }));
    }

    let engine = if project.language.trim().is_empty() {
        None
    } else {
        engines.get(&project.language.to_lowercase()).cloned()
    };
    if let Some(engine) = &engine {
        if !project.script.trim().is_empty() {
            engine
                .write_code(&project.script)
                .map_err(|e| CompileError::Script(e.to_string()))?;
        }
    }
    let project = Project { def: project, engine };

    let mut routes = HashMap::new();
    for def in apis {
        let name = def.name.clone();
        let logic = select_logic(&def, &handlers, &project, &registry)?;
        let request = LineSchema::parse(&def.request_schema)?;
        let response = LineSchema::parse(&def.response_schema)?;
        let (in_ns, out_ns) = (input_namespace(&name), output_namespace(&name));
        let (explicit_in, explicit_out) = def.transfers.split_in_out(&name);
        let mut input = request.transfers(&in_ns);
        input.add_replace(explicit_in.iter().cloned());
        let mut output = response.transfers(&out_ns);
        output.add_replace(explicit_out.iter().cloned());
        let parts = ApiParts {
            name: name.clone(),
            request: Arc::new(request),
            response: Arc::new(response),
            input: or_identity(input, &in_ns)?,
            output: or_identity(output, &out_ns)?,
            logic,
        };
        let flow = resolve_flow(&name, &def.flow, &StageKind::API_DEFAULT)?;
        let pipeline = Pipeline::compose(&name, &flow, API_STAGES, &parts)?;
        let keys = def.route_keys();
        let error_handler = keys.iter().find_map(|k| error_handlers.get(k).cloned());
        tracing::debug!(api = %name, routes = ?keys, flow = ?pipeline.flow(), "api compiled");
        let compiled = Arc::new(CompiledApi {
            def: Arc::new(def),
            pipeline,
            error_handler,
        });
        for key in keys {
            routes.insert(key, compiled.clone());
        }
    }

    Ok(Compiled {
        routes,
        torms: Arc::new(registry),
        project: Arc::new(project),
        compiler,
    })
}

/// Registered handler, then script function, then first dependent torm,
/// then echo.
fn select_logic(
    def: &ApiDef,
    handlers: &HashMap<String, Arc<dyn BusinessLogic>>,
    project: &Project,
    torms: &TormRegistry,
) -> Result<Arc<dyn BusinessLogic>, CompileError> {
    if let Some(handler) = def.route_keys().iter().find_map(|k| handlers.get(k)) {
        return Ok(handler.clone());
    }
    if !def.script.trim().is_empty() {
        let engine = project.engine.as_ref().ok_or_else(|| ConfigError::MissingReference {
            kind: "script engine for language",
            id: project.def.language.clone(),
        })?;
        let callable = engine
            .get_callable(&def.script, LOGIC_SIGNATURE)
            .map_err(|e| CompileError::Script(e.to_string()))?;
        return Ok(Arc::new(ScriptLogic {
            name: def.script.clone(),
            callable,
        }));
    }
    for dep in def.torm_dependents() {
        if !torms.contains_key(dep) {
            return Err(ConfigError::MissingReference {
                kind: "torm",
                id: dep.to_string(),
            }
            .into());
        }
    }
    Ok(match def.torm_dependents().next() {
        Some(first) => Arc::new(RunTorm { name: first.to_string() }),
        None => Arc::new(EchoInput),
    })
}
