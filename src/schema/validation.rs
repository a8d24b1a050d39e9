//! Per-value rule checks.

use super::FieldRule;
use serde_json::Value;

/// A broken rule, rendered against the field's name.
#[derive(Clone, Debug, PartialEq)]
pub enum RuleViolation {
    Format(String),
    TooLong(usize),
    TooShort(usize),
    Pattern,
    NotAllowed(Vec<Value>),
    BelowMinimum(f64),
    AboveMaximum(f64),
}

impl RuleViolation {
    pub fn message(&self, field: &str) -> String {
        match self {
            RuleViolation::Format(f) => format!("{} must be a valid {}", field, f),
            RuleViolation::TooLong(max) => format!("{} must be at most {} characters", field, max),
            RuleViolation::TooShort(min) => format!("{} must be at least {} characters", field, min),
            RuleViolation::Pattern => format!("{} does not match required pattern", field),
            RuleViolation::NotAllowed(allowed) => format!(
                "{} must be one of: {:?}",
                field,
                allowed.iter().take(5).collect::<Vec<_>>()
            ),
            RuleViolation::BelowMinimum(min) => format!("{} must be at least {}", field, min),
            RuleViolation::AboveMaximum(max) => format!("{} must be at most {}", field, max),
        }
    }
}

/// Check one non-required aspect of a value. Null passes; presence is the
/// caller's concern.
pub(super) fn check(rule: &FieldRule, v: &Value) -> Result<(), RuleViolation> {
    if v.is_null() {
        return Ok(());
    }
    if let Some(format) = &rule.format {
        check_format(v, format)?;
    }
    if let Some(s) = v.as_str() {
        let len = s.chars().count();
        if let Some(max) = rule.max_length {
            if len > max {
                return Err(RuleViolation::TooLong(max));
            }
        }
        if let Some(min) = rule.min_length {
            if len < min {
                return Err(RuleViolation::TooShort(min));
            }
        }
        if let Some(re) = &rule.pattern {
            if !re.is_match(s) {
                return Err(RuleViolation::Pattern);
            }
        }
    }
    if let Some(allowed) = &rule.allowed {
        let typed = rule.type_hint().map(|h| h.coerce(v.clone())).unwrap_or_else(|| v.clone());
        if !allowed.iter().any(|a| value_eq(&typed, a)) {
            return Err(RuleViolation::NotAllowed(allowed.clone()));
        }
    }
    if rule.minimum.is_some() || rule.maximum.is_some() {
        if let Some(n) = as_number(v) {
            if let Some(min) = rule.minimum {
                if n < min {
                    return Err(RuleViolation::BelowMinimum(min));
                }
            }
            if let Some(max) = rule.maximum {
                if n > max {
                    return Err(RuleViolation::AboveMaximum(max));
                }
            }
        }
    }
    Ok(())
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(s), Value::String(t)) => s == t,
        (Value::Number(n), Value::Number(m)) => n.as_f64() == m.as_f64(),
        _ => a == b,
    }
}

/// Scalar formats accept their string spellings since checks run before
/// values are coerced.
fn check_format(v: &Value, format: &str) -> Result<(), RuleViolation> {
    let ok = match format {
        "email" => v.as_str().map_or(true, |s| s.contains('@') && s.len() >= 3),
        "uuid" => v.as_str().map_or(true, |s| uuid::Uuid::parse_str(s).is_ok()),
        "number" | "float" => v.is_number() || v.as_str().is_some_and(|s| s.trim().parse::<f64>().is_ok()),
        "int" | "integer" => {
            v.is_i64() || v.is_u64() || v.as_str().is_some_and(|s| s.trim().parse::<i64>().is_ok())
        }
        "bool" | "boolean" => {
            v.is_boolean()
                || v.as_str()
                    .is_some_and(|s| matches!(s.trim().to_lowercase().as_str(), "true" | "false" | "1" | "0"))
        }
        "string" | "str" => v.is_string() || v.is_number() || v.is_boolean(),
        _ => true,
    };
    if ok {
        Ok(())
    } else {
        Err(RuleViolation::Format(format.to_string()))
    }
}
