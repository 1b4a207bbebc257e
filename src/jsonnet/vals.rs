//! Value interchange between the evaluator and JSON
//!
//! Native functions and the builder move data across the engine boundary as
//! JSON so nothing depends on evaluator value internals.

use jrsonnet_evaluator::manifest::JsonFormat;
use jrsonnet_evaluator::val::{ArrValue, StrValue};
use jrsonnet_evaluator::{ObjValueBuilder, Val};

use crate::{Error, Result};

/// Convert a JSON value into an evaluator value
pub fn json_to_val(value: &serde_json::Value) -> Val {
    match value {
        serde_json::Value::Null => Val::Null,
        serde_json::Value::Bool(b) => Val::Bool(*b),
        serde_json::Value::Number(n) => Val::Num(n.as_f64().unwrap_or_default()),
        serde_json::Value::String(s) => str_val(s),
        serde_json::Value::Array(items) => {
            Val::Arr(ArrValue::eager(items.iter().map(json_to_val).collect()))
        }
        serde_json::Value::Object(map) => {
            let mut builder = ObjValueBuilder::new();
            for (key, value) in map {
                builder.field(key.as_str()).value(json_to_val(value));
            }
            Val::Obj(builder.build())
        }
    }
}

/// Convert an evaluator value into a JSON value by manifesting it
pub fn val_to_json(value: &Val) -> Result<serde_json::Value> {
    let manifested = value
        .manifest(JsonFormat::default())
        .map_err(|e| Error::build(format!("failed to manifest value: {e}")))?;
    serde_json::from_str(&manifested)
        .map_err(|e| Error::build(format!("manifested value is not valid json: {e}")))
}

/// Build a string value
pub fn str_val(s: &str) -> Val {
    Val::Str(StrValue::Flat(s.into()))
}
