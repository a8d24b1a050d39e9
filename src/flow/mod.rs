//! Flow composition: stage kinds, pipelines, execution context and the
//! concrete stages Apis and Torms are built from.

pub mod change;
pub mod context;
pub mod stage;
pub mod stages;

pub use change::{table_of, ChangeEvent, ChangeSink, TracingChangeSink};
pub use context::{
    count_of, merge_patch, paginate, select_transfer_funcs, BusinessLogic, CompiledTorm, EchoInput, ExecutionContext,
    Project, RunTorm, RunTrace, ScriptEngine, ScriptFn, ScriptLogic, TormRegistry, LOGIC_SIGNATURE,
    TRANSFER_SIGNATURE,
};
pub use stage::{resolve_flow, Pipeline, Stage, StageContext, StageCtor, StageKind};
pub use stages::{or_identity, ApiParts, TormParts, API_STAGES, TORM_STAGES};
