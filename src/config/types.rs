//! Setting documents: Apis, Torms, Sources and the project they belong to.

use crate::error::ConfigError;
use crate::source::SourceType;
use crate::transfer::Transfers;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

pub const DEPENDENT_TORM: &str = "torm";

/// Something an Api depends on; `kind` is `torm` for templates it may run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependent {
    pub fullname: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

impl Dependent {
    pub fn torm(name: &str) -> Self {
        Dependent {
            fullname: name.to_string(),
            kind: DEPENDENT_TORM.to_string(),
        }
    }

    pub fn is_torm(&self) -> bool {
        self.kind.contains(DEPENDENT_TORM)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiDef {
    #[serde(alias = "apiName", alias = "apiId")]
    pub name: String,
    pub route: String,
    /// One method or several separated by commas (`post,get`).
    pub method: String,
    #[serde(default, alias = "inputSchema", alias = "requestLineschema")]
    pub request_schema: String,
    #[serde(default, alias = "outputSchema", alias = "responseLineschema")]
    pub response_schema: String,
    #[serde(default, alias = "pathTransfers")]
    pub transfers: Transfers,
    #[serde(default, deserialize_with = "flow_entries")]
    pub flow: Vec<String>,
    #[serde(default)]
    pub dependents: Vec<Dependent>,
    /// Script function implementing the business logic.
    #[serde(default)]
    pub script: String,
    #[serde(default, alias = "title")]
    pub description: String,
}

impl ApiDef {
    pub fn new(name: &str, route: &str, method: &str) -> Self {
        ApiDef {
            name: name.to_string(),
            route: route.to_string(),
            method: method.to_string(),
            ..Default::default()
        }
    }

    pub fn methods(&self) -> Vec<String> {
        self.method
            .split(',')
            .map(|m| m.trim().to_lowercase())
            .filter(|m| !m.is_empty())
            .collect()
    }

    /// Lookup keys, one per method.
    pub fn route_keys(&self) -> Vec<String> {
        self.methods().iter().map(|m| route_key(&self.route, m)).collect()
    }

    /// Same logical Api: same name, or a shared (route, method) key.
    pub fn is_same(&self, other: &ApiDef) -> bool {
        if !self.name.is_empty() && self.name == other.name {
            return true;
        }
        let theirs = other.route_keys();
        self.route_keys().iter().any(|k| theirs.contains(k))
    }

    /// Fill fields still empty on `self` from `other`; methods and dependents
    /// are unioned.
    pub fn merge(&mut self, other: ApiDef) -> Result<(), ConfigError> {
        if !self.is_same(&other) {
            return Err(ConfigError::ApiMismatch {
                left: self.display_name(),
                right: other.display_name(),
            });
        }
        let their_methods = other.methods();
        fill(&mut self.name, other.name);
        fill(&mut self.route, other.route);
        fill(&mut self.method, other.method);
        let mut methods = self.methods();
        for m in their_methods {
            if !methods.contains(&m) {
                methods.push(m);
            }
        }
        self.method = methods.join(",");
        fill(&mut self.request_schema, other.request_schema);
        fill(&mut self.response_schema, other.response_schema);
        fill(&mut self.script, other.script);
        fill(&mut self.description, other.description);
        if self.transfers.is_empty() {
            self.transfers = other.transfers;
        }
        if self.flow.is_empty() {
            self.flow = other.flow;
        }
        for dep in other.dependents {
            if !self.dependents.contains(&dep) {
                self.dependents.push(dep);
            }
        }
        Ok(())
    }

    pub fn torm_dependents(&self) -> impl Iterator<Item = &str> {
        self.dependents.iter().filter(|d| d.is_torm()).map(|d| d.fullname.as_str())
    }

    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("{} {}", self.method, self.route)
        } else {
            self.name.clone()
        }
    }
}

fn fill(slot: &mut String, value: String) {
    if slot.trim().is_empty() {
        *slot = value;
    }
}

/// Case-insensitive composite key of route and method.
pub fn route_key(route: &str, method: &str) -> String {
    format!("{}_{}", route.trim().to_lowercase(), method.trim().to_lowercase())
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TormDef {
    #[serde(alias = "templateId")]
    pub name: String,
    #[serde(alias = "sourceId")]
    pub source: String,
    #[serde(alias = "tpl", alias = "templateBody")]
    pub template: String,
    #[serde(default, alias = "transferLine")]
    pub transfers: Transfers,
    #[serde(default, deserialize_with = "flow_entries")]
    pub flow: Vec<String>,
    #[serde(default, alias = "title")]
    pub description: String,
}

impl TormDef {
    pub fn new(name: &str, source: &str, template: &str) -> Self {
        TormDef {
            name: name.to_string(),
            source: source.to_string(),
            template: template.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDef {
    #[serde(alias = "sourceId")]
    pub identifier: String,
    #[serde(rename = "type", alias = "sourceType")]
    pub source_type: SourceType,
    #[serde(default)]
    pub config: String,
    #[serde(default)]
    pub ddl: String,
    /// Deployment environment the source belongs to; empty matches any.
    #[serde(default)]
    pub env: String,
}

/// Project-wide scripting state shared by every Api.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub language: String,
    /// Script source loaded into the engine at compile time.
    #[serde(default)]
    pub script: String,
    /// Script function name to the transfers it produces.
    #[serde(default)]
    pub func_transfers: BTreeMap<String, Transfers>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Setting {
    #[serde(default)]
    pub apis: Vec<ApiDef>,
    #[serde(default)]
    pub torms: Vec<TormDef>,
    #[serde(default)]
    pub sources: Vec<SourceDef>,
    #[serde(default)]
    pub project: ProjectDef,
}

/// Flow given as `"a,b"` or `["a", "b,c"]`; entries are split on commas and
/// blanks dropped.
fn flow_entries<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        One(String),
        Many(Vec<String>),
    }
    let raw = Option::<Raw>::deserialize(deserializer)?;
    let entries = match raw {
        None => Vec::new(),
        Some(Raw::One(s)) => vec![s],
        Some(Raw::Many(v)) => v,
    };
    Ok(split_flow(&entries))
}

pub fn split_flow(entries: &[String]) -> Vec<String> {
    entries
        .iter()
        .flat_map(|e| e.split(','))
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(str::to_string)
        .collect()
}

/// `_sys_apis` row payload.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRecord {
    pub api_id: String,
    #[serde(default)]
    pub title: String,
    pub method: String,
    pub route: String,
    #[serde(default)]
    pub script: String,
    /// JSON array of dependents, stored as text.
    #[serde(default)]
    pub dependents: String,
    #[serde(default)]
    pub input_schema: String,
    #[serde(default)]
    pub output_schema: String,
    #[serde(default)]
    pub path_transfers: String,
    #[serde(default)]
    pub flow: String,
}

/// `_sys_sources` row payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRecord {
    pub source_id: String,
    #[serde(default)]
    pub env: String,
    pub source_type: String,
    #[serde(default)]
    pub config: String,
    #[serde(default)]
    pub ddl: String,
}

/// `_sys_templates` row payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateRecord {
    pub template_id: String,
    #[serde(default)]
    pub title: String,
    pub source_id: String,
    pub tpl: String,
    #[serde(default)]
    pub transfer_line: String,
    #[serde(default)]
    pub flow: String,
}
