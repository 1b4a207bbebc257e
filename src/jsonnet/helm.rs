//! Helm chart templating for the `helmTemplate` native function
//!
//! Charts are rendered by executing the `helm template` binary; the
//! rendered documents are keyed into an object by the `nameFormat`
//! template. Rendering runs inside the (already blocking) Jsonnet
//! evaluation, so the command is executed synchronously.

use std::io::Write;
use std::process::Command;

use serde::Deserialize;
use serde_json::Value;

use super::name_format::render_name_format;
use super::native::parse_yaml_stream;
use super::DEFAULT_NAME_FORMAT;
use crate::{Error, Result};

/// Options accepted by `helmTemplate(name, chart, opts)`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HelmTemplateOpts {
    /// Values merged over the chart defaults (equivalent of `--set`)
    pub values: Option<Value>,
    /// Values files passed in order (equivalent of `--values`)
    pub values_files: Vec<String>,
    /// Namespace scope for the release
    pub namespace: Option<String>,
    /// The file calling helmTemplate; reserved for relative chart lookup
    pub called_from: Option<String>,
    /// Template used to key the resulting map
    pub name_format: Option<String>,
}

/// Render the chart and key the resulting objects by the name format.
pub fn helm_template(name: &str, chart: &str, opts: &Value) -> Result<Value> {
    let opts: HelmTemplateOpts = serde_json::from_value(opts.clone())
        .map_err(|e| Error::build(format!("helmTemplate: invalid opts: {e}")))?;

    let rendered = render_chart(name, chart, &opts)?;
    objects_to_output(&opts, &rendered)
}

fn render_chart(name: &str, chart: &str, opts: &HelmTemplateOpts) -> Result<String> {
    let mut cmd = Command::new("helm");
    cmd.arg("template").arg(name).arg(chart);

    if let Some(namespace) = &opts.namespace {
        cmd.arg("--namespace").arg(namespace);
    }
    for file in &opts.values_files {
        cmd.arg("--values").arg(file);
    }

    // Inline values are passed as one more values file, merged last
    let mut inline_values = None;
    if let Some(values) = &opts.values {
        let yaml = serde_yaml::to_string(values)
            .map_err(|e| Error::build(format!("helmTemplate: invalid values: {e}")))?;
        let mut file = tempfile::NamedTempFile::new()
            .map_err(|e| Error::build(format!("helmTemplate: {e}")))?;
        file.write_all(yaml.as_bytes())
            .map_err(|e| Error::build(format!("helmTemplate: {e}")))?;
        cmd.arg("--values").arg(file.path());
        inline_values = Some(file);
    }

    let output = cmd
        .output()
        .map_err(|e| Error::build(format!("helmTemplate: failed to execute helm: {e}")))?;
    drop(inline_values);

    if !output.status.success() {
        return Err(Error::build(format!(
            "helmTemplate: helm template failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    String::from_utf8(output.stdout).map_err(|e| Error::build(format!("helmTemplate: {e}")))
}

/// Key the rendered documents by the (default or supplied) name format.
pub fn objects_to_output(opts: &HelmTemplateOpts, rendered: &str) -> Result<Value> {
    let name_format = opts.name_format.as_deref().unwrap_or(DEFAULT_NAME_FORMAT);

    let mut out = serde_json::Map::new();
    for doc in parse_yaml_stream(rendered)? {
        if !doc.is_object() {
            continue;
        }
        let key = render_name_format(name_format, &doc)?;
        out.insert(key, doc);
    }
    Ok(Value::Object(out))
}
