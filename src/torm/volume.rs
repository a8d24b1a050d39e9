//! Template input volumes.

use crate::error::AppError;
use serde_json::{Number, Value};
use std::collections::BTreeMap;

/// Key-ordered data handed to a template.
pub type Volume = BTreeMap<String, Value>;

/// Build a volume from a decoded request document. `null` is an empty volume;
/// any other non-object is rejected.
pub fn volume_from_value(doc: &Value) -> Result<Volume, AppError> {
    match doc {
        Value::Object(map) => Ok(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        Value::Null => Ok(Volume::new()),
        other => Err(AppError::BadRequest(format!(
            "template input must be an object, got {}",
            kind_of(other)
        ))),
    }
}

/// Collapse integral floats to integers, depth first. JSON decoding cannot
/// tell `1` from `1.0` once both are floats, and typed template comparisons
/// need the integer.
pub fn normalize(volume: &mut Volume) {
    for v in volume.values_mut() {
        normalize_value(v);
    }
}

pub fn normalize_value(v: &mut Value) {
    match v {
        Value::Number(n) if !n.is_i64() && !n.is_u64() => {
            if let Some(f) = n.as_f64() {
                if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
                    *n = Number::from(f as i64);
                }
            }
        }
        Value::Object(map) => map.values_mut().for_each(normalize_value),
        Value::Array(items) => items.iter_mut().for_each(normalize_value),
        _ => {}
    }
}

pub fn volume_to_value(volume: &Volume) -> Value {
    Value::Object(volume.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
