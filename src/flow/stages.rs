//! Concrete stages and the per-owner constructor tables.

use super::change::{ChangeEvent, ChangeSink};
use super::context::BusinessLogic;
use super::stage::{Stage, StageContext, StageCtor, StageKind};
use crate::error::{AppError, ConfigError};
use crate::schema::LineSchema;
use crate::torm::StatementCompiler;
use crate::transfer::{input_namespace, output_namespace, Path, Transfer, Transfers};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Everything an Api's stages are built from.
pub struct ApiParts {
    pub name: String,
    pub request: Arc<LineSchema>,
    pub response: Arc<LineSchema>,
    /// Namespaced path on the left, dictionary path on the right.
    pub input: Transfers,
    pub output: Transfers,
    pub logic: Arc<dyn BusinessLogic>,
}

/// Everything a Torm's stages are built from.
pub struct TormParts {
    pub name: String,
    pub input: Transfers,
    pub output: Transfers,
    pub compiler: Arc<StatementCompiler>,
    pub sink: Arc<dyn ChangeSink>,
}

/// `namespace:` (root) when `transfers` is empty, so the whole document
/// moves across unchanged.
pub fn or_identity(transfers: Transfers, namespace: &str) -> Result<Transfers, ConfigError> {
    if !transfers.is_empty() {
        return Ok(transfers);
    }
    let ns = Path::parse(namespace).map_err(|reason| ConfigError::MalformedTransfer {
        line: format!("{}:", namespace),
        reason,
    })?;
    Ok([Transfer::new(ns, Path::root())].into_iter().collect())
}

fn namespace_path(namespace: &str) -> Path {
    Path::parse(namespace).unwrap_or_else(|_| Path::root())
}

fn wrap(path: &Path, doc: Value) -> Value {
    let mut out = Value::Object(Map::new());
    path.set(&mut out, doc);
    out
}

struct ValidateStage {
    request: Arc<LineSchema>,
}

#[async_trait]
impl Stage for ValidateStage {
    fn kind(&self) -> StageKind {
        StageKind::Validate
    }

    async fn before(&self, _cx: &mut StageContext, doc: Value) -> Result<Value, AppError> {
        self.request.validate(&doc)?;
        Ok(doc)
    }
}

struct MergeDefaultsStage {
    request: Arc<LineSchema>,
    response: Arc<LineSchema>,
}

#[async_trait]
impl Stage for MergeDefaultsStage {
    fn kind(&self) -> StageKind {
        StageKind::MergeDefaults
    }

    async fn before(&self, _cx: &mut StageContext, doc: Value) -> Result<Value, AppError> {
        Ok(self.request.merge_defaults(doc))
    }

    async fn after(&self, _cx: &mut StageContext, doc: Value) -> Result<Value, AppError> {
        Ok(self.response.merge_defaults(doc))
    }
}

struct FormatTypesStage {
    request: Arc<LineSchema>,
    response: Arc<LineSchema>,
}

#[async_trait]
impl Stage for FormatTypesStage {
    fn kind(&self) -> StageKind {
        StageKind::FormatTypes
    }

    async fn before(&self, _cx: &mut StageContext, doc: Value) -> Result<Value, AppError> {
        Ok(self.request.format_types(doc))
    }

    async fn after(&self, _cx: &mut StageContext, doc: Value) -> Result<Value, AppError> {
        Ok(self.response.format_types(doc))
    }
}

/// Moves the caller document under `name.input` on the way in and lifts
/// `name.output` back out on the way out.
struct NamespaceStage {
    input: Path,
    output: Path,
}

#[async_trait]
impl Stage for NamespaceStage {
    fn kind(&self) -> StageKind {
        StageKind::Namespace
    }

    async fn before(&self, _cx: &mut StageContext, doc: Value) -> Result<Value, AppError> {
        Ok(wrap(&self.input, doc))
    }

    async fn after(&self, _cx: &mut StageContext, doc: Value) -> Result<Value, AppError> {
        Ok(self.output.get(&doc).unwrap_or(doc))
    }
}

struct ApiTransferStage {
    input: Transfers,
    output_reversed: Transfers,
}

#[async_trait]
impl Stage for ApiTransferStage {
    fn kind(&self) -> StageKind {
        StageKind::Transfer
    }

    async fn before(&self, _cx: &mut StageContext, doc: Value) -> Result<Value, AppError> {
        Ok(self.input.apply(&doc))
    }

    async fn after(&self, _cx: &mut StageContext, doc: Value) -> Result<Value, AppError> {
        Ok(self.output_reversed.apply(&doc))
    }
}

struct BusinessLogicStage {
    logic: Arc<dyn BusinessLogic>,
}

#[async_trait]
impl Stage for BusinessLogicStage {
    fn kind(&self) -> StageKind {
        StageKind::BusinessLogic
    }

    async fn before(&self, cx: &mut StageContext, doc: Value) -> Result<Value, AppError> {
        self.logic.call(cx.exec.clone(), doc).await
    }
}

/// Torm side of the transfer: dictionary to `name.input` volume before,
/// statement result under `name.output` to dictionary after.
struct TormTransferStage {
    input_reversed: Transfers,
    output: Transfers,
    input_ns: Path,
    output_ns: Path,
}

#[async_trait]
impl Stage for TormTransferStage {
    fn kind(&self) -> StageKind {
        StageKind::Transfer
    }

    async fn before(&self, _cx: &mut StageContext, doc: Value) -> Result<Value, AppError> {
        let namespaced = self.input_reversed.apply(&doc);
        Ok(self
            .input_ns
            .get(&namespaced)
            .unwrap_or_else(|| Value::Object(Map::new())))
    }

    async fn after(&self, _cx: &mut StageContext, doc: Value) -> Result<Value, AppError> {
        Ok(self.output.apply(&wrap(&self.output_ns, doc)))
    }
}

struct ExecuteStage {
    template: String,
    compiler: Arc<StatementCompiler>,
}

#[async_trait]
impl Stage for ExecuteStage {
    fn kind(&self) -> StageKind {
        StageKind::Execute
    }

    async fn before(&self, cx: &mut StageContext, doc: Value) -> Result<Value, AppError> {
        let (statement, result) = self.compiler.execute(&self.template, &doc).await?;
        cx.statement = Some(statement);
        cx.result = Some(result.clone());
        Ok(result)
    }
}

struct ChangeCaptureStage {
    sink: Arc<dyn ChangeSink>,
}

#[async_trait]
impl Stage for ChangeCaptureStage {
    fn kind(&self) -> StageKind {
        StageKind::ChangeCapture
    }

    async fn after(&self, cx: &mut StageContext, doc: Value) -> Result<Value, AppError> {
        if let Some(event) = cx
            .statement
            .as_ref()
            .and_then(|s| ChangeEvent::capture(s, cx.result.as_ref()))
        {
            self.sink.emit(&event);
        }
        Ok(doc)
    }
}

fn validate(p: &ApiParts) -> Arc<dyn Stage> {
    Arc::new(ValidateStage {
        request: p.request.clone(),
    })
}

fn merge_defaults(p: &ApiParts) -> Arc<dyn Stage> {
    Arc::new(MergeDefaultsStage {
        request: p.request.clone(),
        response: p.response.clone(),
    })
}

fn format_types(p: &ApiParts) -> Arc<dyn Stage> {
    Arc::new(FormatTypesStage {
        request: p.request.clone(),
        response: p.response.clone(),
    })
}

fn namespace(p: &ApiParts) -> Arc<dyn Stage> {
    Arc::new(NamespaceStage {
        input: namespace_path(&input_namespace(&p.name)),
        output: namespace_path(&output_namespace(&p.name)),
    })
}

fn api_transfer(p: &ApiParts) -> Arc<dyn Stage> {
    Arc::new(ApiTransferStage {
        input: p.input.clone(),
        output_reversed: p.output.reverse(),
    })
}

fn business_logic(p: &ApiParts) -> Arc<dyn Stage> {
    Arc::new(BusinessLogicStage { logic: p.logic.clone() })
}

fn torm_transfer(p: &TormParts) -> Arc<dyn Stage> {
    Arc::new(TormTransferStage {
        input_reversed: p.input.reverse(),
        output: p.output.clone(),
        input_ns: namespace_path(&input_namespace(&p.name)),
        output_ns: namespace_path(&output_namespace(&p.name)),
    })
}

fn execute(p: &TormParts) -> Arc<dyn Stage> {
    Arc::new(ExecuteStage {
        template: p.name.clone(),
        compiler: p.compiler.clone(),
    })
}

fn change_capture(p: &TormParts) -> Arc<dyn Stage> {
    Arc::new(ChangeCaptureStage { sink: p.sink.clone() })
}

/// Stages an Api flow may name.
pub const API_STAGES: &[(StageKind, StageCtor<ApiParts>)] = &[
    (StageKind::Validate, validate),
    (StageKind::MergeDefaults, merge_defaults),
    (StageKind::FormatTypes, format_types),
    (StageKind::Namespace, namespace),
    (StageKind::Transfer, api_transfer),
    (StageKind::BusinessLogic, business_logic),
];

/// Stages a Torm flow may name.
pub const TORM_STAGES: &[(StageKind, StageCtor<TormParts>)] = &[
    (StageKind::Transfer, torm_transfer),
    (StageKind::Execute, execute),
    (StageKind::ChangeCapture, change_capture),
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiDef, ProjectDef};
    use crate::flow::context::{EchoInput, ExecutionContext, Project, TormRegistry};
    use crate::flow::stage::Pipeline;
    use crate::error::CompileError;
    use serde_json::json;

    fn exec() -> ExecutionContext {
        ExecutionContext::new(
            Arc::new(ApiDef::new("listItems", "/items", "GET")),
            Arc::new(TormRegistry::new()),
            Arc::new(Project {
                def: ProjectDef::default(),
                engine: None,
            }),
        )
    }

    fn api_parts(input: &str, output: &str, logic: Arc<dyn BusinessLogic>) -> ApiParts {
        ApiParts {
            name: "listItems".into(),
            request: Arc::new(LineSchema::parse("fullname=pageSize,format=int,default=20").unwrap()),
            response: Arc::new(LineSchema::default()),
            input: or_identity(Transfers::parse(input).unwrap(), "listItems.input").unwrap(),
            output: or_identity(Transfers::parse(output).unwrap(), "listItems.output").unwrap(),
            logic,
        }
    }

    #[tokio::test]
    async fn api_pipeline_round_trips_through_namespaces() {
        let parts = api_parts("", "", Arc::new(EchoInput));
        let pipeline = Pipeline::compose("listItems", &StageKind::API_DEFAULT, API_STAGES, &parts).unwrap();
        let mut cx = StageContext::new(exec(), "listItems");
        let out = pipeline.run(&mut cx, json!({"pageSize": "5"})).await.unwrap();
        assert_eq!(out, json!({"pageSize": 5}));
        assert_eq!(
            cx.exec.trace().entries(),
            vec![
                "listItems.validate",
                "listItems.merge_defaults",
                "listItems.format_types",
                "listItems.namespace",
                "listItems.transfer",
                "listItems.business_logic"
            ]
        );
    }

    #[tokio::test]
    async fn api_transfers_rename_fields_both_ways() {
        let logic = |_cx: ExecutionContext, input: Value| async move {
            assert_eq!(input, json!({"size": 20}));
            Ok::<_, AppError>(json!({"rows": [1, 2]}))
        };
        let parts = api_parts(
            "listItems.input.pageSize:size",
            "listItems.output.items:rows",
            Arc::new(logic),
        );
        let pipeline = Pipeline::compose("listItems", &StageKind::API_DEFAULT, API_STAGES, &parts).unwrap();
        let mut cx = StageContext::new(exec(), "listItems");
        let out = pipeline.run(&mut cx, json!({})).await.unwrap();
        assert_eq!(out, json!({"items": [1, 2]}));
    }

    #[tokio::test]
    async fn api_flow_cannot_name_torm_stages() {
        let parts = api_parts("", "", Arc::new(EchoInput));
        let err = Pipeline::compose("listItems", &[StageKind::Execute], API_STAGES, &parts).unwrap_err();
        assert!(matches!(err, CompileError::UnknownStage { ref stage, .. } if stage == "execute"));
    }

    #[tokio::test]
    async fn stage_errors_carry_stage_and_owner() {
        let mut parts = api_parts("", "", Arc::new(EchoInput));
        parts.request = Arc::new(LineSchema::parse("fullname=pageIndex,required").unwrap());
        let pipeline = Pipeline::compose("listItems", &StageKind::API_DEFAULT, API_STAGES, &parts).unwrap();
        let mut cx = StageContext::new(exec(), "listItems");
        let err = pipeline.run(&mut cx, json!({})).await.unwrap_err();
        assert!(matches!(err, AppError::Stage { stage: "validate", .. }));
        assert!(matches!(err.root(), AppError::Validation(_)));
        assert_eq!(cx.exec.trace().entries(), vec!["listItems.validate"]);
    }
}
