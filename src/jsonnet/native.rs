//! Native extension functions registered into every VM
//!
//! These mirror the kubecfg native function set: JSON/YAML parsing and
//! manifesting, regular expression helpers, and helm chart templating. They
//! are reachable from Jsonnet through `std.native(...)` and wrapped by the
//! embedded `kubecfg.libsonnet`.

use jrsonnet_evaluator::error::{ErrorKind, Result as JrResult};
use jrsonnet_evaluator::function::builtin;
use jrsonnet_evaluator::Val;
use jrsonnet_stdlib::ContextInitializer;
use serde::Deserialize;
use serde::Serialize;

use super::helm;
use super::vals::{json_to_val, str_val, val_to_json};

/// Register the native function set on the given context
pub fn register(ctx: &ContextInitializer) {
    ctx.add_native("parseJson", parse_json::INST);
    ctx.add_native("parseYaml", parse_yaml::INST);
    ctx.add_native("manifestJson", manifest_json::INST);
    ctx.add_native("manifestYaml", manifest_yaml::INST);
    ctx.add_native("escapeStringRegex", escape_string_regex::INST);
    ctx.add_native("regexMatch", regex_match::INST);
    ctx.add_native("regexSubst", regex_subst::INST);
    ctx.add_native("helmTemplate", helm_template::INST);
}

fn runtime_error(message: impl std::fmt::Display) -> jrsonnet_evaluator::Error {
    ErrorKind::RuntimeError(message.to_string().into()).into()
}

#[builtin]
fn parse_json(json: String) -> JrResult<Val> {
    let value: serde_json::Value = serde_json::from_str(&json).map_err(runtime_error)?;
    Ok(json_to_val(&value))
}

#[builtin]
fn parse_yaml(yaml: String) -> JrResult<Val> {
    let docs = parse_yaml_stream(&yaml).map_err(runtime_error)?;
    Ok(json_to_val(&serde_json::Value::Array(docs)))
}

#[builtin]
fn manifest_json(json: Val, indent: f64) -> JrResult<Val> {
    let value = val_to_json(&json).map_err(runtime_error)?;
    let rendered = to_json_indented(&value, indent as usize).map_err(runtime_error)?;
    Ok(str_val(&rendered))
}

#[builtin]
fn manifest_yaml(json: Val) -> JrResult<Val> {
    let value = val_to_json(&json).map_err(runtime_error)?;
    let rendered = serde_yaml::to_string(&value).map_err(runtime_error)?;
    Ok(str_val(&rendered))
}

#[builtin]
fn escape_string_regex(str: String) -> JrResult<Val> {
    Ok(str_val(&regex::escape(&str)))
}

#[builtin]
fn regex_match(regex: String, string: String) -> JrResult<Val> {
    let re = regex::Regex::new(&regex).map_err(runtime_error)?;
    Ok(Val::Bool(re.is_match(&string)))
}

#[builtin]
fn regex_subst(regex: String, src: String, repl: String) -> JrResult<Val> {
    let re = regex::Regex::new(&regex).map_err(runtime_error)?;
    Ok(str_val(&re.replace_all(&src, repl.as_str())))
}

#[builtin]
fn helm_template(name: String, chart: String, opts: Val) -> JrResult<Val> {
    let opts = val_to_json(&opts).map_err(runtime_error)?;
    let rendered = helm::helm_template(&name, &chart, &opts).map_err(runtime_error)?;
    Ok(json_to_val(&rendered))
}

/// Parse a multi-document YAML stream into JSON values
pub fn parse_yaml_stream(yaml: &str) -> crate::Result<Vec<serde_json::Value>> {
    let mut docs = Vec::new();
    for document in serde_yaml::Deserializer::from_str(yaml) {
        let value = serde_json::Value::deserialize(document)
            .map_err(|e| crate::Error::build(format!("invalid yaml document: {e}")))?;
        if !value.is_null() {
            docs.push(value);
        }
    }
    Ok(docs)
}

/// Render JSON with the given indent width and a trailing newline
pub fn to_json_indented(value: &serde_json::Value, indent: usize) -> crate::Result<String> {
    let indent_str = " ".repeat(indent);
    let formatter = serde_json::ser::PrettyFormatter::with_indent(indent_str.as_bytes());
    let mut out = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    value
        .serialize(&mut serializer)
        .map_err(|e| crate::Error::build(format!("failed to serialize json: {e}")))?;
    out.push(b'\n');
    String::from_utf8(out).map_err(|e| crate::Error::build(e.to_string()))
}
