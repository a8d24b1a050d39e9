//! Typed errors and HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("missing reference: {kind} '{id}'")]
    MissingReference { kind: &'static str, id: String },
    #[error("duplicate {kind}: {name}")]
    Duplicate { kind: &'static str, name: String },
    #[error("api '{api}': {field} must not be empty")]
    EmptyField { api: String, field: &'static str },
    #[error("malformed transfer line '{line}': {reason}")]
    MalformedTransfer { line: String, reason: String },
    #[error("malformed schema line '{line}': {reason}")]
    MalformedSchema { line: String, reason: String },
    #[error("cannot merge api '{left}' with api '{right}': names and routes differ")]
    ApiMismatch { left: String, right: String },
    #[error("container already compiled")]
    AlreadyCompiled,
    #[error("config load: {0}")]
    Load(String),
    #[error("validation: {0}")]
    Validation(String),
}

/// Failures while binding template names to sources.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BindingError {
    #[error("template '{template}' is already bound to source '{source_id}'")]
    DuplicateTemplate { template: String, source_id: String },
    #[error("register source '{source_id}' before binding template '{template}'")]
    UnregisteredSource { template: String, source_id: String },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    #[error("template parse: {0}")]
    Parse(String),
    #[error("template '{name}': {message}")]
    Execute { name: String, message: String },
    #[error("template not defined: {0}")]
    NotDefined(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StatementError {
    #[error("template '{template}': could not find named parameter '{name}'")]
    MissingParameter { template: String, name: String },
    #[error("template '{template}': rendered an empty statement")]
    Empty { template: String },
}

/// Everything `Container::compile` can fail with. Cloneable so that the held
/// result is handed to every caller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Binding(#[from] BindingError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("{owner}: unknown stage name '{stage}'")]
    UnknownStage { owner: String, stage: String },
    #[error("script engine: {0}")]
    Script(String),
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Binding(#[from] BindingError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Statement(#[from] StatementError),
    #[error("compile: {0}")]
    Compile(#[from] CompileError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("resource: {0}")]
    Resource(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("{stage} ({owner}): {source}")]
    Stage {
        stage: &'static str,
        owner: String,
        #[source]
        source: Box<AppError>,
    },
}

impl AppError {
    /// Wrap with the stage name and the owning api or torm.
    pub fn in_stage(self, stage: &'static str, owner: &str) -> Self {
        AppError::Stage {
            stage,
            owner: owner.to_string(),
            source: Box::new(self),
        }
    }

    /// Innermost error below any stage wrappers.
    pub fn root(&self) -> &AppError {
        let mut cur = self;
        while let AppError::Stage { source, .. } = cur {
            cur = source;
        }
        cur
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), AppError::NotFound(_))
    }
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match self.root() {
            AppError::Config(_) | AppError::Binding(_) | AppError::Compile(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "config_error")
            }
            AppError::Template(_) | AppError::Statement(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "template_error")
            }
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "validation_error"),
            AppError::Resource(_) => (StatusCode::BAD_GATEWAY, "resource_error"),
            AppError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            AppError::Db(e) => {
                if let sqlx::Error::RowNotFound = e {
                    (StatusCode::NOT_FOUND, "not_found")
                } else {
                    (StatusCode::INTERNAL_SERVER_ERROR, "database_error")
                }
            }
            AppError::Json(_) | AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            AppError::Stage { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        let body = ErrorBody {
            error: ErrorDetail {
                code: code.to_string(),
                message: self.to_string(),
                details: None,
            },
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_unwraps_stage_chain() {
        let err = AppError::NotFound("route:/x,method:get".into())
            .in_stage("execute", "list")
            .in_stage("business_logic", "listItems");
        assert!(err.is_not_found());
        let msg = err.to_string();
        assert!(msg.starts_with("business_logic (listItems): execute (list): not found"));
    }

    #[test]
    fn stage_wrapped_validation_maps_to_422() {
        let err = AppError::Validation("pageSize is required".into()).in_stage("validate", "listItems");
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
