use apiflow_sdk::config::{ApiDef, Dependent, ProjectDef, RuntimeConfig, TormDef};
use apiflow_sdk::error::{AppError, BindingError, CompileError};
use apiflow_sdk::flow::{
    paginate, ChangeEvent, ChangeSink, ExecutionContext, ScriptEngine, ScriptFn, LOGIC_SIGNATURE, TRANSFER_SIGNATURE,
};
use apiflow_sdk::source::{MemoryProvider, ResourceProvider, Source, SourceType, StatementExecutor};
use apiflow_sdk::torm::{CompiledStatement, TemplateEngine, TemplateSet, TextTemplateEngine};
use apiflow_sdk::transfer::Transfers;
use apiflow_sdk::{Container, TemplateError};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn memory_source(id: &str, provider: Arc<MemoryProvider>) -> Source {
    let provider: Arc<dyn ResourceProvider> = provider;
    Source::new(id, SourceType::SqlMemory, "").with_provider(provider)
}

fn api(name: &str, route: &str, method: &str, torms: &[&str]) -> ApiDef {
    let mut api = ApiDef::new(name, route, method);
    api.dependents = torms.iter().map(|t| Dependent::torm(t)).collect();
    api
}

#[tokio::test]
async fn get_items_runs_stages_in_order_and_reshapes_output() {
    let provider = Arc::new(
        MemoryProvider::new().with_result("select * from items", json!([{"id": 1, "title": "a"}, {"id": 2, "title": "b"}])),
    );
    let c = Container::new();
    c.register_source(memory_source("db", provider.clone())).unwrap();
    let mut list = TormDef::new("list", "db", "select * from items");
    list.transfers = Transfers::parse("list.output:rows").unwrap();
    c.register_torm(list).unwrap();
    let mut items = api("listItems", "/items", "GET", &["list"]);
    items.response_schema = "fullname=items[].name,src=rows[].title".into();
    c.register_api(items).unwrap();

    let (out, trace) = c.run("/items", "GET", json!({})).await.unwrap();
    assert_eq!(out, json!({"items": [{"name": "a"}, {"name": "b"}]}));
    assert_eq!(
        trace.entries(),
        vec![
            "listItems.validate",
            "listItems.merge_defaults",
            "listItems.format_types",
            "listItems.namespace",
            "listItems.transfer",
            "listItems.business_logic",
            "list.transfer",
            "list.execute",
        ]
    );
    assert_eq!(provider.executed(), vec!["select * from items"]);
}

#[tokio::test]
async fn integral_floats_take_integer_branches() {
    let provider = Arc::new(MemoryProvider::new().with_result("select * from items where status = 1", json!([{"id": 3}])));
    let c = Container::new();
    c.register_source(memory_source("db", provider)).unwrap();
    c.register_torm(TormDef::new(
        "list",
        "db",
        "select * from items {{if eq .Status 1}}where status = :Status{{else}}where 1 = 0{{end}}",
    ))
    .unwrap();
    c.register_api(api("listItems", "/items", "GET", &["list"])).unwrap();

    let out = c.dispatch("/items", "GET", br#"{"Status": 1.0}"#).await.unwrap();
    assert_eq!(serde_json::from_slice::<Value>(&out).unwrap(), json!([{"id": 3}]));
}

#[tokio::test]
async fn request_fields_map_to_dictionary_names() {
    let provider = Arc::new(MemoryProvider::new().with_result("select * from items where status = 1 limit 20", json!([])));
    let c = Container::new();
    c.register_source(memory_source("db", provider)).unwrap();
    c.register_torm(TormDef::new("list", "db", "select * from items where status = :Status limit :Size"))
        .unwrap();
    let mut items = api("listItems", "/items", "GET", &["list"]);
    items.request_schema = "fullname=status,format=int,required,dst=Status\nfullname=pageSize,format=int,default=20,dst=Size".into();
    c.register_api(items).unwrap();

    let (out, _) = c.run("/items", "get", json!({"status": "1"})).await.unwrap();
    assert_eq!(out, json!([]));
    let err = c.run("/items", "get", json!({})).await.unwrap_err();
    assert!(matches!(err.root(), AppError::Validation(_)));
}

#[tokio::test]
async fn error_handler_substitutes_a_response() {
    let c = Container::new();
    let mut guarded = ApiDef::new("guarded", "/guarded", "POST");
    guarded.request_schema = "fullname=id,required".into();
    c.register_api(guarded).unwrap();
    let mut open = ApiDef::new("open", "/open", "POST");
    open.request_schema = "fullname=id,required".into();
    c.register_api(open).unwrap();
    c.register_error_handler("/guarded", "POST", |e: &AppError| json!({"ok": false, "reason": e.root().to_string()}))
        .unwrap();

    let (out, _) = c.run("/guarded", "POST", json!({})).await.unwrap();
    assert_eq!(out, json!({"ok": false, "reason": "validation: id is required"}));

    let err = c.run("/open", "POST", json!({})).await.unwrap_err();
    assert_eq!(err.to_string(), "validate (open): validation: id is required");
}

#[tokio::test]
async fn unknown_route_dispatch_is_not_found() {
    let c = Container::new();
    c.register_api(ApiDef::new("a", "/a", "GET")).unwrap();
    let err = c.dispatch("/b", "GET", b"").await.unwrap_err();
    assert!(err.is_not_found());
    let err = c.dispatch("/a", "DELETE", b"").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn empty_flow_api_echoes_its_payload() {
    let c = Container::new();
    c.register_api(ApiDef::new("echo", "/echo", "POST")).unwrap();
    let out = c.dispatch("/echo", "POST", br#"{"a": [1, 2]}"#).await.unwrap();
    assert_eq!(serde_json::from_slice::<Value>(&out).unwrap(), json!({"a": [1, 2]}));
}

#[tokio::test]
async fn pagination_merges_total_and_list() {
    let provider = Arc::new(
        MemoryProvider::new()
            .with_result("select count(*) as count from items where kind = 'a'", json!({"count": 2}))
            .with_result("select count(*) as count from items where kind = 'z'", json!({"count": 0}))
            .with_result("select * from items where kind = 'a'", json!([{"id": 1}, {"id": 2}])),
    );
    let c = Container::new();
    c.register_source(memory_source("db", provider.clone())).unwrap();
    let mut total = TormDef::new("total", "db", "select count(*) as count from items where kind = :Kind");
    total.transfers = Transfers::parse("total.output.count:total").unwrap();
    let mut list = TormDef::new("list", "db", "select * from items where kind = :Kind");
    list.transfers = Transfers::parse("list.output:items").unwrap();
    c.register_torm(total).unwrap();
    c.register_torm(list).unwrap();
    c.register_api(api("page", "/items/page", "GET", &["total", "list"])).unwrap();
    c.register_api_handler("/items/page", "GET", |cx: ExecutionContext, input: Value| async move {
        paginate(&cx, "total", "list", input).await
    })
    .unwrap();

    let (out, trace) = c.run("/items/page", "GET", json!({"Kind": "a"})).await.unwrap();
    assert_eq!(out, json!({"total": 2, "items": [{"id": 1}, {"id": 2}]}));
    assert!(trace.entries().contains(&"list.execute".to_string()));

    let (out, trace) = c.run("/items/page", "GET", json!({"Kind": "z"})).await.unwrap();
    assert_eq!(out, Value::Null);
    assert!(!trace.entries().contains(&"list.execute".to_string()));
    assert_eq!(provider.executed().len(), 3);
}

#[derive(Default)]
struct CollectSink(Mutex<Vec<ChangeEvent>>);

impl ChangeSink for CollectSink {
    fn emit(&self, event: &ChangeEvent) {
        self.0.lock().unwrap().push(event.clone());
    }
}

#[tokio::test]
async fn change_capture_reports_modifying_statements() {
    let provider = Arc::new(
        MemoryProvider::new().with_result("insert into items (title) values ('x')", json!({"rowsAffected": 1})),
    );
    let sink = Arc::new(CollectSink::default());
    let c = Container::new();
    c.set_change_sink(sink.clone()).unwrap();
    c.register_source(memory_source("db", provider)).unwrap();
    let mut insert = TormDef::new("insertItem", "db", "insert into items (title) values (:Title)");
    insert.flow = vec!["transfer".into(), "execute".into(), "change_capture".into()];
    c.register_torm(insert).unwrap();
    c.register_api(api("createItem", "/items", "POST", &["insertItem"])).unwrap();

    let (out, trace) = c.run("/items", "POST", json!({"Title": "x"})).await.unwrap();
    assert_eq!(out, json!({"rowsAffected": 1}));
    assert!(trace.entries().ends_with(&[
        "insertItem.transfer".to_string(),
        "insertItem.execute".to_string(),
        "insertItem.change_capture".to_string()
    ]));
    let events = sink.0.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].operation, "insert");
    assert_eq!(events[0].table.as_deref(), Some("items"));
    assert_eq!(events[0].rows, Some(1));
    assert_eq!(events[0].statement, "insert into items (title) values ('x')");
}

struct CountingEngine {
    parses: AtomicUsize,
}

impl TemplateEngine for CountingEngine {
    fn parse(&self, source: &str) -> Result<Arc<dyn TemplateSet>, TemplateError> {
        self.parses.fetch_add(1, Ordering::SeqCst);
        TextTemplateEngine.parse(source)
    }
}

#[test]
fn concurrent_compile_runs_once() {
    let engine = Arc::new(CountingEngine {
        parses: AtomicUsize::new(0),
    });
    let c = Container::new();
    c.set_template_engine(engine.clone()).unwrap();
    c.register_source(memory_source("db", Arc::new(MemoryProvider::new()))).unwrap();
    c.register_torm(TormDef::new("list", "db", "select 1")).unwrap();
    c.register_api(api("listItems", "/items", "GET", &["list"])).unwrap();

    let results: Vec<Result<(), CompileError>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8).map(|_| s.spawn(|| c.compile())).collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert!(results.iter().all(Result::is_ok));
    // one parse for the torm body, one for its source's combined set
    assert_eq!(engine.parses.load(Ordering::SeqCst), 2);
}

#[test]
fn concurrent_callers_share_the_compile_error() {
    let c = Container::new();
    c.register_torm(TormDef::new("list", "nowhere", "select 1")).unwrap();
    let results: Vec<Result<(), CompileError>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..4).map(|_| s.spawn(|| c.compile())).collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    let expected = CompileError::Binding(BindingError::UnregisteredSource {
        template: "list".into(),
        source_id: "nowhere".into(),
    });
    assert!(results.iter().all(|r| r.as_ref().err() == Some(&expected)));
}

#[test]
fn duplicate_template_names_fail_compile_and_keep_first_binding() {
    let c = Container::new();
    c.register_source(memory_source("db", Arc::new(MemoryProvider::new()))).unwrap();
    c.register_source(memory_source("db2", Arc::new(MemoryProvider::new()))).unwrap();
    c.register_torm(TormDef::new("a", "db", r#"{{define "list"}}select 1{{end}}"#)).unwrap();
    c.register_torm(TormDef::new("b", "db2", r#"{{define "list"}}select 2{{end}}"#)).unwrap();
    let err = c.compile().unwrap_err();
    assert_eq!(
        err,
        CompileError::Binding(BindingError::DuplicateTemplate {
            template: "list".into(),
            source_id: "db".into(),
        })
    );
}

#[test]
fn torm_body_must_define_its_own_name() {
    let c = Container::new();
    c.register_source(memory_source("db", Arc::new(MemoryProvider::new()))).unwrap();
    c.register_torm(TormDef::new("list", "db", r#"{{define "other"}}select 1{{end}}"#)).unwrap();
    c.register_api(api("listItems", "/items", "GET", &["list"])).unwrap();
    assert_eq!(
        c.compile().unwrap_err(),
        CompileError::Template(TemplateError::NotDefined("list".into()))
    );
    assert!(c.get_compiled_for("/items", "GET").is_err());
}

struct Doubler {
    loaded: Mutex<Vec<String>>,
}

impl ScriptEngine for Doubler {
    fn language(&self) -> &str {
        "calc"
    }

    fn write_code(&self, source: &str) -> Result<(), AppError> {
        self.loaded.lock().unwrap().push(source.to_string());
        Ok(())
    }

    fn get_callable(&self, name: &str, signature: &str) -> Result<ScriptFn, AppError> {
        match (name, signature) {
            ("double", LOGIC_SIGNATURE) => Ok(Arc::new(|_cx: &ExecutionContext, input: Value| -> Result<Value, AppError> {
                let n = input.get("n").and_then(Value::as_i64).unwrap_or(0);
                Ok(json!({"n": n * 2}))
            })),
            ("rename", LOGIC_SIGNATURE) => Ok(Arc::new(|cx: &ExecutionContext, input: Value| -> Result<Value, AppError> {
                cx.run_transfer_by_func("fmtName", &input)
            })),
            ("fmtName", TRANSFER_SIGNATURE) => Ok(Arc::new(|_cx: &ExecutionContext, input: Value| -> Result<Value, AppError> {
                let upper = |k: &str| input.get(k).and_then(Value::as_str).unwrap_or("").to_uppercase();
                Ok(json!({"first": upper("first"), "last": upper("last")}))
            })),
            (other, _) => Err(AppError::NotFound(format!("function '{}'", other))),
        }
    }

    fn run(&self, script: &str) -> Result<String, AppError> {
        Ok(format!("ran {}", script))
    }
}

fn script_container() -> (Container, Arc<Doubler>) {
    let engine = Arc::new(Doubler {
        loaded: Mutex::new(Vec::new()),
    });
    let c = Container::new();
    c.register_script_engine(engine.clone()).unwrap();
    let mut project = ProjectDef {
        name: "demo".into(),
        language: "calc".into(),
        script: "fn double(n) { n * 2 }".into(),
        ..Default::default()
    };
    project
        .func_transfers
        .insert("fmtName".into(), Transfers::parse("first:name.first\nlast:name.last").unwrap());
    c.set_project(project).unwrap();
    (c, engine)
}

#[tokio::test]
async fn script_functions_serve_as_business_logic() {
    let (c, engine) = script_container();
    let mut double = ApiDef::new("double", "/double", "POST");
    double.request_schema = "fullname=n,format=int".into();
    double.script = "double".into();
    c.register_api(double).unwrap();
    let mut rename = ApiDef::new("rename", "/rename", "POST");
    rename.script = "rename".into();
    c.register_api(rename).unwrap();

    let (out, _) = c.run("/double", "POST", json!({"n": "21"})).await.unwrap();
    assert_eq!(out, json!({"n": 42}));
    let (out, _) = c.run("/rename", "POST", json!({"first": "Ada", "last": "L"})).await.unwrap();
    assert_eq!(out, json!({"name": {"first": "ADA", "last": "L"}}));
    assert_eq!(*engine.loaded.lock().unwrap(), vec!["fn double(n) { n * 2 }".to_string()]);
}

#[tokio::test]
async fn transfer_functions_need_an_engine_and_a_declaration() {
    let c = Container::new();
    let mut project = ProjectDef {
        name: "demo".into(),
        language: "calc".into(),
        ..Default::default()
    };
    project
        .func_transfers
        .insert("fmtName".into(), Transfers::parse("first:name.first").unwrap());
    c.set_project(project).unwrap();
    c.register_api(ApiDef::new("rename", "/rename", "POST")).unwrap();
    c.register_api_handler("/rename", "POST", |cx: ExecutionContext, input: Value| async move {
        let without_engine = cx.run_transfer_by_func("fmtName", &input).unwrap_err();
        assert!(matches!(without_engine, AppError::Config(_)));
        assert!(cx.run_script("1 + 1").is_err());
        cx.run_transfer_by_func("undeclared", &input)
    })
    .unwrap();
    let err = c.run("/rename", "POST", json!({"first": "Ada"})).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn scripts_run_in_the_project_engine() {
    let (c, _) = script_container();
    c.register_api(ApiDef::new("eval", "/eval", "POST")).unwrap();
    c.register_api_handler("/eval", "POST", |cx: ExecutionContext, _input: Value| async move {
        let out = cx.run_script("double(2)")?;
        Ok::<Value, AppError>(json!({"out": out}))
    })
    .unwrap();
    let (out, _) = c.run("/eval", "POST", json!({})).await.unwrap();
    assert_eq!(out, json!({"out": "ran double(2)"}));
}

#[test]
fn missing_script_function_fails_compile() {
    let (c, _) = script_container();
    let mut api = ApiDef::new("x", "/x", "GET");
    api.script = "nope".into();
    c.register_api(api).unwrap();
    assert!(matches!(c.compile().unwrap_err(), CompileError::Script(_)));
}

struct Slow;

impl ResourceProvider for Slow {
    fn type_name(&self) -> &'static str {
        "slow"
    }

    fn statement_executor(&self) -> Option<&dyn StatementExecutor> {
        Some(self)
    }
}

#[async_trait]
impl StatementExecutor for Slow {
    async fn exec_or_query(&self, _statement: &CompiledStatement) -> Result<Value, AppError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(Value::Null)
    }
}

#[tokio::test]
async fn slow_statements_time_out() {
    let runtime = RuntimeConfig {
        request_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let c = Container::with_runtime(runtime);
    c.register_source(Source::new("db", SourceType::Sql, "").with_provider(Arc::new(Slow)))
        .unwrap();
    c.register_torm(TormDef::new("list", "db", "select pg_sleep(5)")).unwrap();
    c.register_api(api("listItems", "/items", "GET", &["list"])).unwrap();

    let err = c.run("/items", "GET", json!({})).await.unwrap_err();
    assert!(matches!(err.root(), AppError::Timeout(_)));
    assert!(err.to_string().starts_with("business_logic (listItems): execute (list): timeout"));
}

#[tokio::test]
async fn non_sql_sources_are_resource_errors() {
    let c = Container::new();
    c.register_source(Source::new("cache", SourceType::Redis, "")).unwrap();
    c.register_torm(TormDef::new("get", "cache", "GET key")).unwrap();
    c.register_api(api("getKey", "/key", "GET", &["get"])).unwrap();
    let err = c.run("/key", "GET", json!({})).await.unwrap_err();
    assert!(matches!(err.root(), AppError::Resource(_)));
}
