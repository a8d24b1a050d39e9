//! Source pool: named backing resources and the template-name bindings that
//! route a template to the source it executes against.

use super::postgres::PgProvider;
use super::provider::{MemoryProvider, ResourceProvider};
use crate::error::{AppError, BindingError, ConfigError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceType {
    Sql,
    SqlMemory,
    Curl,
    Bin,
    Redis,
    Rabbitmq,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Sql => "SQL",
            SourceType::SqlMemory => "SQL_MEMORY",
            SourceType::Curl => "CURL",
            SourceType::Bin => "BIN",
            SourceType::Redis => "REDIS",
            SourceType::Rabbitmq => "RABBITMQ",
        }
    }

    /// Sources whose templates render to SQL statements.
    pub fn is_sql(&self) -> bool {
        matches!(self, SourceType::Sql | SourceType::SqlMemory)
    }
}

impl FromStr for SourceType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "SQL" => Ok(SourceType::Sql),
            "SQL_MEMORY" => Ok(SourceType::SqlMemory),
            "CURL" => Ok(SourceType::Curl),
            "BIN" => Ok(SourceType::Bin),
            "REDIS" => Ok(SourceType::Redis),
            "RABBITMQ" => Ok(SourceType::Rabbitmq),
            other => Err(ConfigError::Validation(format!("unknown source type '{}'", other))),
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named backing resource. The provider is built on first use unless one
/// was supplied up front.
pub struct Source {
    pub identifier: String,
    pub source_type: SourceType,
    pub config: String,
    pub ddl: Option<String>,
    provider: OnceLock<Arc<dyn ResourceProvider>>,
}

impl Source {
    pub fn new(identifier: &str, source_type: SourceType, config: &str) -> Self {
        Source {
            identifier: identifier.to_string(),
            source_type,
            config: config.to_string(),
            ddl: None,
            provider: OnceLock::new(),
        }
    }

    pub fn with_ddl(mut self, ddl: &str) -> Self {
        if !ddl.trim().is_empty() {
            self.ddl = Some(ddl.to_string());
        }
        self
    }

    pub fn with_provider(self, provider: Arc<dyn ResourceProvider>) -> Self {
        let _ = self.provider.set(provider);
        self
    }

    /// Provider handle, constructing it from `config` on first call.
    pub fn provider(&self) -> Result<Arc<dyn ResourceProvider>, AppError> {
        if let Some(p) = self.provider.get() {
            return Ok(p.clone());
        }
        let built: Arc<dyn ResourceProvider> = match self.source_type {
            SourceType::Sql => Arc::new(PgProvider::connect_lazy(&self.config)?),
            SourceType::SqlMemory => Arc::new(MemoryProvider::from_config(&self.config)?),
            other => {
                return Err(AppError::Resource(format!(
                    "source '{}': no provider for source type {}",
                    self.identifier, other
                )))
            }
        };
        tracing::debug!(source = %self.identifier, provider = built.type_name(), "provider built");
        Ok(self.provider.get_or_init(|| built).clone())
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("identifier", &self.identifier)
            .field("source_type", &self.source_type)
            .field("has_provider", &self.provider.get().is_some())
            .finish()
    }
}

/// Maps a template name to the identifier of the source it runs against.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifierRelation {
    pub template_name: String,
    pub source_identifier: String,
}

/// Template-name bindings; each template name is bound at most once.
#[derive(Clone, Debug, Default)]
pub struct IdentifierRelations {
    relations: Vec<IdentifierRelation>,
    by_template: HashMap<String, usize>,
}

impl IdentifierRelations {
    pub fn add(&mut self, template_name: &str, source_identifier: &str) -> Result<(), BindingError> {
        if let Some(&i) = self.by_template.get(template_name) {
            return Err(BindingError::DuplicateTemplate {
                template: template_name.to_string(),
                source_id: self.relations[i].source_identifier.clone(),
            });
        }
        self.by_template.insert(template_name.to_string(), self.relations.len());
        self.relations.push(IdentifierRelation {
            template_name: template_name.to_string(),
            source_identifier: source_identifier.to_string(),
        });
        Ok(())
    }

    pub fn source_for(&self, template_name: &str) -> Option<&str> {
        self.by_template
            .get(template_name)
            .map(|&i| self.relations[i].source_identifier.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &IdentifierRelation> {
        self.relations.iter()
    }
}

/// Registry of sources and template bindings. Mutation needs `&mut self`; the
/// container mutates it under its registration lock and shares it read-only
/// once compiled.
#[derive(Debug, Default)]
pub struct SourcePool {
    sources: HashMap<String, Arc<Source>>,
    relations: IdentifierRelations,
}

impl SourcePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the source with the same identifier.
    pub fn register_source(&mut self, source: Source) -> Arc<Source> {
        let source = Arc::new(source);
        self.sources.insert(source.identifier.clone(), source.clone());
        source
    }

    /// Bind a template name to a source. The source must already be registered
    /// and the template name must not be bound yet.
    pub fn add_template_relation(&mut self, template_name: &str, source_identifier: &str) -> Result<(), BindingError> {
        let template_name = template_name.trim();
        if !self.sources.contains_key(source_identifier) {
            return Err(BindingError::UnregisteredSource {
                template: template_name.to_string(),
                source_id: source_identifier.to_string(),
            });
        }
        self.relations.add(template_name, source_identifier)
    }

    pub fn get_source(&self, source_identifier: &str) -> Result<&Arc<Source>, AppError> {
        self.sources
            .get(source_identifier)
            .ok_or_else(|| AppError::NotFound(format!("source '{}'", source_identifier)))
    }

    pub fn get_source_by_template(&self, template_name: &str) -> Result<&Arc<Source>, AppError> {
        let source_id = self
            .relations
            .source_for(template_name)
            .ok_or_else(|| AppError::NotFound(format!("no source bound to template '{}'", template_name)))?;
        self.get_source(source_id)
    }

    /// Template name to source identifier to provider.
    pub fn get_provider_by_template(&self, template_name: &str) -> Result<Arc<dyn ResourceProvider>, AppError> {
        self.get_source_by_template(template_name)?.provider()
    }

    pub fn relations(&self) -> &IdentifierRelations {
        &self.relations
    }

    pub fn sources(&self) -> impl Iterator<Item = &Arc<Source>> {
        self.sources.values()
    }
}
