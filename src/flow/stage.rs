//! Stage contract, flow resolution and the pipeline runner.

use super::context::ExecutionContext;
use crate::error::{AppError, CompileError};
use crate::torm::CompiledStatement;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageKind {
    Validate,
    MergeDefaults,
    FormatTypes,
    Namespace,
    Transfer,
    BusinessLogic,
    ChangeCapture,
    Execute,
}

impl StageKind {
    pub const ALL: [StageKind; 8] = [
        StageKind::Validate,
        StageKind::MergeDefaults,
        StageKind::FormatTypes,
        StageKind::Namespace,
        StageKind::Transfer,
        StageKind::BusinessLogic,
        StageKind::ChangeCapture,
        StageKind::Execute,
    ];

    pub const API_DEFAULT: [StageKind; 6] = [
        StageKind::Validate,
        StageKind::MergeDefaults,
        StageKind::FormatTypes,
        StageKind::Namespace,
        StageKind::Transfer,
        StageKind::BusinessLogic,
    ];

    pub const TORM_DEFAULT: [StageKind; 2] = [StageKind::Transfer, StageKind::Execute];

    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Validate => "validate",
            StageKind::MergeDefaults => "merge_defaults",
            StageKind::FormatTypes => "format_types",
            StageKind::Namespace => "namespace",
            StageKind::Transfer => "transfer",
            StageKind::BusinessLogic => "business_logic",
            StageKind::ChangeCapture => "change_capture",
            StageKind::Execute => "execute",
        }
    }
}

impl FromStr for StageKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        StageKind::ALL
            .into_iter()
            .find(|k| k.name().eq_ignore_ascii_case(s))
            .ok_or(())
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-run state shared by the stages of one pipeline run.
pub struct StageContext {
    pub exec: ExecutionContext,
    pub owner: String,
    /// Statement run by the execute stage, if any.
    pub statement: Option<CompiledStatement>,
    /// Raw result of that statement.
    pub result: Option<Value>,
}

impl StageContext {
    pub fn new(exec: ExecutionContext, owner: &str) -> Self {
        StageContext {
            exec,
            owner: owner.to_string(),
            statement: None,
            result: None,
        }
    }
}

/// One processing step. `before` runs on the way in, `after` on the way out.
#[async_trait]
pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    async fn before(&self, _cx: &mut StageContext, doc: Value) -> Result<Value, AppError> {
        Ok(doc)
    }

    async fn after(&self, _cx: &mut StageContext, doc: Value) -> Result<Value, AppError> {
        Ok(doc)
    }
}

pub type StageCtor<P> = fn(&P) -> Arc<dyn Stage>;

/// Resolve flow names to stage kinds. Blank entries are dropped; an empty
/// flow is replaced by `default`.
pub fn resolve_flow(owner: &str, names: &[String], default: &[StageKind]) -> Result<Vec<StageKind>, CompileError> {
    let names = crate::config::split_flow(names);
    if names.is_empty() {
        return Ok(default.to_vec());
    }
    names
        .iter()
        .map(|n| {
            n.parse::<StageKind>().map_err(|_| CompileError::UnknownStage {
                owner: owner.to_string(),
                stage: n.clone(),
            })
        })
        .collect()
}

/// Ordered stages of one Api or Torm.
pub struct Pipeline {
    owner: String,
    stages: Vec<Arc<dyn Stage>>,
}

impl Pipeline {
    /// Build the stages for `flow` from the owner's constructor table. A kind
    /// the table lacks is an unknown stage for this owner.
    pub fn compose<P>(owner: &str, flow: &[StageKind], table: &[(StageKind, StageCtor<P>)], parts: &P) -> Result<Self, CompileError> {
        let mut stages = Vec::with_capacity(flow.len());
        for kind in flow {
            let ctor = table
                .iter()
                .find(|(k, _)| k == kind)
                .map(|(_, c)| *c)
                .ok_or_else(|| CompileError::UnknownStage {
                    owner: owner.to_string(),
                    stage: kind.name().to_string(),
                })?;
            stages.push(ctor(parts));
        }
        Ok(Pipeline {
            owner: owner.to_string(),
            stages,
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn flow(&self) -> Vec<StageKind> {
        self.stages.iter().map(|s| s.kind()).collect()
    }

    /// Run `before` of every stage in order, then `after` in reverse order.
    /// The first error aborts the run, wrapped with the stage and owner.
    pub async fn run(&self, cx: &mut StageContext, doc: Value) -> Result<Value, AppError> {
        let mut doc = doc;
        for stage in &self.stages {
            let kind = stage.kind();
            cx.exec.trace().record(&self.owner, kind);
            tracing::trace!(owner = %self.owner, stage = kind.name(), "before");
            doc = stage
                .before(cx, doc)
                .await
                .map_err(|e| e.in_stage(kind.name(), &self.owner))?;
        }
        for stage in self.stages.iter().rev() {
            let kind = stage.kind();
            tracing::trace!(owner = %self.owner, stage = kind.name(), "after");
            doc = stage
                .after(cx, doc)
                .await
                .map_err(|e| e.in_stage(kind.name(), &self.owner))?;
        }
        Ok(doc)
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("owner", &self.owner)
            .field("flow", &self.flow())
            .finish()
    }
}
