//! Setting validation: required fields, unique names and references.

use crate::config::Setting;
use crate::error::ConfigError;
use std::collections::HashSet;

pub fn validate(setting: &Setting) -> Result<(), ConfigError> {
    let mut source_ids = HashSet::new();
    for s in &setting.sources {
        if s.identifier.trim().is_empty() {
            return Err(ConfigError::Validation("source identifier must not be empty".into()));
        }
        source_ids.insert(s.identifier.as_str());
    }

    let mut torm_names = HashSet::new();
    for t in &setting.torms {
        if t.name.trim().is_empty() {
            return Err(ConfigError::Validation("torm name must not be empty".into()));
        }
        if !torm_names.insert(t.name.as_str()) {
            return Err(ConfigError::Duplicate {
                kind: "torm",
                name: t.name.clone(),
            });
        }
        if !source_ids.contains(t.source.as_str()) {
            return Err(ConfigError::MissingReference {
                kind: "source",
                id: t.source.clone(),
            });
        }
    }

    for api in &setting.apis {
        check_api(api)?;
        for dep in api.torm_dependents() {
            if !torm_names.contains(dep) {
                return Err(ConfigError::MissingReference {
                    kind: "torm",
                    id: dep.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Route and method must be present.
pub fn check_api(api: &crate::config::ApiDef) -> Result<(), ConfigError> {
    if api.route.trim().is_empty() {
        return Err(ConfigError::EmptyField {
            api: api.display_name(),
            field: "route",
        });
    }
    if api.methods().is_empty() {
        return Err(ConfigError::EmptyField {
            api: api.display_name(),
            field: "method",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiDef, Dependent, SourceDef, TormDef};
    use crate::source::SourceType;

    fn setting() -> Setting {
        Setting {
            sources: vec![SourceDef {
                identifier: "db".into(),
                source_type: SourceType::SqlMemory,
                config: String::new(),
                ddl: String::new(),
                env: String::new(),
            }],
            torms: vec![TormDef::new("list", "db", "select 1")],
            apis: vec![ApiDef::new("listItems", "/items", "GET")],
            ..Default::default()
        }
    }

    #[test]
    fn accepts_consistent_setting() {
        assert_eq!(validate(&setting()), Ok(()));
    }

    #[test]
    fn rejects_empty_route_and_method() {
        let mut s = setting();
        s.apis[0].method = " , ".into();
        assert!(matches!(validate(&s), Err(ConfigError::EmptyField { field: "method", .. })));
        s.apis[0].route = String::new();
        assert!(matches!(validate(&s), Err(ConfigError::EmptyField { field: "route", .. })));
    }

    #[test]
    fn rejects_duplicates_and_dangling_references() {
        let mut s = setting();
        s.torms.push(TormDef::new("list", "db", "select 2"));
        assert!(matches!(validate(&s), Err(ConfigError::Duplicate { .. })));

        let mut s = setting();
        s.torms[0].source = "other".into();
        assert!(matches!(validate(&s), Err(ConfigError::MissingReference { kind: "source", .. })));

        let mut s = setting();
        s.apis[0].dependents.push(Dependent::torm("missing"));
        assert!(matches!(validate(&s), Err(ConfigError::MissingReference { kind: "torm", .. })));
    }
}
