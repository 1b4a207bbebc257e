//! Post-evaluation object walk
//!
//! A Jsonnet evaluation can produce a single object, arbitrarily nested
//! collections of objects, or nothing. The walk flattens that tree into the
//! Kubernetes objects it contains: any mapping carrying both `kind` and
//! `apiVersion` is taken as-is, containers are recursed into, and anything
//! else is an error labeled with its path into the tree.

use serde_json::Value;

use crate::{Error, Result};

/// Flatten the evaluated Jsonnet output into the list of Kubernetes
/// objects it contains.
pub fn json_walk(value: &Value) -> Result<Vec<Value>> {
    let mut objects = Vec::new();
    walk("<top>", value, &mut objects)?;
    Ok(objects)
}

fn walk(label: &str, value: &Value, out: &mut Vec<Value>) -> Result<()> {
    match value {
        Value::Null => Ok(()),
        Value::Object(map) => {
            if map.get("kind").is_some_and(|v| !v.is_null())
                && map.get("apiVersion").is_some_and(|v| !v.is_null())
            {
                out.push(value.clone());
                return Ok(());
            }
            for (key, child) in map {
                walk(&format!("{label}.{key}"), child, out)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                walk(&format!("{label}[{i}]"), child, out)?;
            }
            Ok(())
        }
        other => Err(Error::build(format!(
            "looking for kubernetes object at {label}, but instead found {}",
            type_name(other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
