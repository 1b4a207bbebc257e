//! Jsonnet builder
//!
//! Configures a VM for one Konfiguration (native functions, variables,
//! importer search URLs), synthesizes the top-level expression for the
//! entry point, evaluates it, and walks the result into a canonical
//! [`BuildOutput`]. Evaluation is synchronous; callers run it under
//! `spawn_blocking`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use jrsonnet_evaluator::manifest::JsonFormat;
use jrsonnet_evaluator::trace::PathResolver;
use jrsonnet_evaluator::State;
use jrsonnet_parser::IStr;
use jrsonnet_stdlib::ContextInitializer;
use kube::discovery::Scope;
use kube::Discovery;
use serde_json::Value;
use url::Url;

use super::cache::HttpCache;
use super::importer::UniversalImporter;
use super::native;
use super::output::BuildOutput;
use super::walk::json_walk;
use crate::crd::{Konfiguration, Variables};
use crate::source::secure_join;
use crate::{Error, Result};

/// Defaults the namespace of namespaced objects using API discovery.
///
/// The dry-run path runs without one when no cluster mapping is available,
/// in which case defaulting is skipped entirely.
#[derive(Clone)]
pub struct NamespaceDefaulter {
    discovery: Arc<Discovery>,
    namespace: String,
}

impl NamespaceDefaulter {
    /// Create a defaulter writing the given namespace
    pub fn new(discovery: Arc<Discovery>, namespace: impl Into<String>) -> Self {
        Self {
            discovery,
            namespace: namespace.into(),
        }
    }

    fn apply(&self, obj: &mut Value) -> Result<()> {
        let api_version = obj
            .get("apiVersion")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let kind = obj.get("kind").and_then(Value::as_str).unwrap_or_default();
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", api_version),
        };
        let gvk = kube::api::GroupVersionKind {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        };

        let (_, capabilities) = self
            .discovery
            .resolve_gvk(&gvk)
            .ok_or_else(|| Error::build(format!("no REST mapping for {api_version}/{kind}")))?;

        if capabilities.scope == Scope::Namespaced {
            let missing = obj
                .pointer("/metadata/namespace")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .is_empty();
            if missing {
                if let Some(metadata) = obj.get_mut("metadata").and_then(Value::as_object_mut) {
                    metadata.insert("namespace".to_string(), Value::String(self.namespace.clone()));
                }
            }
        }
        Ok(())
    }
}

/// Renders jsonnet for one Konfiguration into Kubernetes manifests
pub struct Builder {
    konfig: Konfiguration,
    cache_dir: PathBuf,
    search_urls: Vec<Url>,
}

impl Builder {
    /// Construct a builder for the Konfiguration.
    ///
    /// `workdir` is the source root the Konfiguration's `jsonnetPaths` are
    /// resolved against; assets fetched over HTTP are cached under
    /// `cache_dir`.
    pub fn new(konfig: &Konfiguration, workdir: &Path, cache_dir: &Path) -> Result<Self> {
        // The embedded scheme always resolves first
        let mut search_urls =
            vec![Url::parse("internal:///").map_err(|e| Error::build(e.to_string()))?];

        for path in &konfig.spec.jsonnet_paths {
            let joined = secure_join(workdir, path)?;
            let abs = std::path::absolute(&joined)
                .map_err(|e| Error::build(format!("invalid jsonnet path {path:?}: {e}")))?;
            let url = Url::from_directory_path(&abs).map_err(|()| {
                Error::build(format!("invalid jsonnet path {path:?}: not absolute"))
            })?;
            search_urls.push(url);
        }

        for raw in &konfig.spec.jsonnet_urls {
            let mut url = Url::parse(raw)
                .map_err(|e| Error::build(format!("invalid jsonnet URL {raw:?}: {e}")))?;
            if !url.path().ends_with('/') {
                // trailing slash is important for reference resolution
                url.set_path(&format!("{}/", url.path()));
            }
            search_urls.push(url);
        }

        Ok(Self {
            konfig: konfig.clone(),
            cache_dir: cache_dir.to_path_buf(),
            search_urls,
        })
    }

    /// Evaluate the jsonnet at the given path into a canonical build output.
    ///
    /// The `defaulter` fills in the Konfiguration's namespace on namespaced
    /// objects that carry none; passing `None` skips defaulting.
    pub fn build(&self, defaulter: Option<&NamespaceDefaulter>, path: &str) -> Result<BuildOutput> {
        let state = State::default();
        let ctx = ContextInitializer::new(state.clone(), PathResolver::new_cwd_fallback());
        native::register(&ctx);
        if let Some(vars) = &self.konfig.spec.variables {
            inject_ext_vars(&ctx, vars)?;
        }
        state.set_context_initializer(ctx);
        state.set_import_resolver(UniversalImporter::new(
            self.search_urls.clone(),
            HttpCache::new(&self.cache_dir)?,
        ));

        let expr = self.top_level_expression(path)?;
        let evaluated = state
            .evaluate_snippet("<konfiguration>", expr)
            .and_then(|val| val.manifest(JsonFormat::default()))
            .map_err(|e| Error::build(e.to_string().trim().to_string()))?;

        let root: Value = serde_json::from_str(&evaluated)
            .map_err(|e| Error::build(format!("evaluation produced invalid json: {e}")))?;

        let mut objects = Vec::new();
        for obj in json_walk(&root)? {
            if is_list(&obj) {
                let items = obj
                    .get("items")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                for mut item in items {
                    if let Some(d) = defaulter {
                        d.apply(&mut item)?;
                    }
                    objects.push(item);
                }
                continue;
            }
            let mut obj = obj;
            if let Some(d) = defaulter {
                d.apply(&mut obj)?;
            }
            objects.push(obj);
        }

        Ok(BuildOutput::new(objects))
    }

    /// Synthesize the top-level expression for the entry path.
    ///
    /// The form depends on the entry's extension; the user's `inject`
    /// snippet is appended, and when top level arguments are configured the
    /// whole expression is wrapped in a call that applies them.
    fn top_level_expression(&self, path: &str) -> Result<String> {
        let url = entry_url(path)?;
        // Double single quotes so the path survives the quoted literal
        let quoted = url.replace('\'', "''");

        let ext = url.rsplit('/').next().and_then(|f| f.rsplit_once('.')).map(|(_, e)| e);
        let mut expr = match ext {
            Some("json") => format!(
                r#"(import "internal:///kubecfg.libsonnet").parseJson(importstr @'{quoted}')"#
            ),
            Some("yaml") => format!(
                r#"(import "internal:///kubecfg.libsonnet").parseYaml(importstr @'{quoted}')"#
            ),
            // Assume jsonnet - we are, after all, a jsonnet-controller
            _ => format!("(import @'{quoted}')"),
        };

        expr.push_str(&self.konfig.inject_snippet());

        if let Some(args) = self
            .konfig
            .spec
            .variables
            .as_ref()
            .and_then(tla_call_arguments)
        {
            expr = format!(
                "local target = ({expr}\n);\nif std.isFunction(target) then target({args}) else target"
            );
        }

        Ok(expr)
    }
}

fn is_list(obj: &Value) -> bool {
    obj.get("kind")
        .and_then(Value::as_str)
        .is_some_and(|k| k.ends_with("List"))
        && obj.get("items").is_some()
}

/// Turn the entry path into an absolute URL string
fn entry_url(path: &str) -> Result<String> {
    if path.starts_with("http://") || path.starts_with("https://") || path.starts_with("file://") {
        return Ok(path.to_string());
    }
    let abs = std::path::absolute(Path::new(path))
        .map_err(|e| Error::build(format!("invalid path {path:?}: {e}")))?;
    Url::from_file_path(&abs)
        .map(String::from)
        .map_err(|()| Error::build(format!("invalid path {path:?}")))
}

fn inject_ext_vars(ctx: &ContextInitializer, vars: &Variables) -> Result<()> {
    for (name, value) in &vars.ext_str {
        ctx.add_ext_str(IStr::from(name.as_str()), IStr::from(value.as_str()));
    }
    for (name, code) in &vars.ext_code {
        ctx.add_ext_code(name.as_str(), IStr::from(code.as_str()))
            .map_err(|e| Error::build(format!("invalid extCode {name:?}: {e}")))?;
    }
    if let Some(raw) = &vars.ext_vars {
        for (name, value) in raw_object_entries(raw, "extVars")? {
            ctx.add_ext_code(name.as_str(), IStr::from(value.as_str()))
                .map_err(|e| Error::build(format!("invalid extVars entry {name:?}: {e}")))?;
        }
    }
    Ok(())
}

/// The named arguments applying the configured top level arguments, or
/// `None` when no TLAs are configured. String values are embedded as JSON
/// string literals, which are valid jsonnet.
fn tla_call_arguments(vars: &Variables) -> Option<String> {
    let mut args = Vec::new();
    for (name, value) in &vars.tla_str {
        let literal = serde_json::to_string(value).unwrap_or_default();
        args.push(format!("{name}={literal}"));
    }
    for (name, code) in &vars.tla_code {
        args.push(format!("{name}={code}"));
    }
    if let Some(raw) = &vars.tla_vars {
        for (name, code) in raw_object_entries(raw, "tlaVars").ok()? {
            args.push(format!("{name}={code}"));
        }
    }
    if args.is_empty() {
        None
    } else {
        Some(args.join(", "))
    }
}

/// Decode a raw JSON blob into (key, code) pairs, JSON-encoding each value
fn raw_object_entries(raw: &Value, field: &str) -> Result<Vec<(String, String)>> {
    let map = raw
        .as_object()
        .ok_or_else(|| Error::build(format!("{field} must be a JSON object")))?;
    let mut entries = Vec::with_capacity(map.len());
    for (name, value) in map {
        let code = serde_json::to_string(value)
            .map_err(|e| Error::build(format!("invalid {field} entry {name:?}: {e}")))?;
        entries.push((name.clone(), code));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::KonfigurationSpec;
    use kube::core::ObjectMeta;
    use std::fs;
    use tempfile::tempdir;

    fn konfig_with(f: impl FnOnce(&mut KonfigurationSpec)) -> Konfiguration {
        let mut spec: KonfigurationSpec = serde_yaml::from_str(
            r#"
interval: 5m
path: main.jsonnet
prune: false
"#,
        )
        .unwrap();
        f(&mut spec);
        let mut k = Konfiguration::new("web", spec);
        k.metadata = ObjectMeta {
            name: Some("web".to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        };
        k
    }

    fn builder(konfig: &Konfiguration, workdir: &Path) -> Builder {
        Builder::new(konfig, workdir, &workdir.join(".cache")).unwrap()
    }

    // =========================================================================
    // Top-level expression synthesis
    // =========================================================================

    #[test]
    fn test_expression_for_jsonnet_entry() {
        let dir = tempdir().unwrap();
        let konfig = konfig_with(|_| {});
        let b = builder(&konfig, dir.path());
        let expr = b.top_level_expression("file:///src/main.jsonnet").unwrap();
        assert_eq!(expr, "(import @'file:///src/main.jsonnet')");
    }

    #[test]
    fn test_expression_for_yaml_entry() {
        let dir = tempdir().unwrap();
        let konfig = konfig_with(|_| {});
        let b = builder(&konfig, dir.path());
        let expr = b.top_level_expression("https://example.com/objects.yaml").unwrap();
        assert_eq!(
            expr,
            r#"(import "internal:///kubecfg.libsonnet").parseYaml(importstr @'https://example.com/objects.yaml')"#
        );
    }

    #[test]
    fn test_expression_for_json_entry() {
        let dir = tempdir().unwrap();
        let konfig = konfig_with(|_| {});
        let b = builder(&konfig, dir.path());
        let expr = b.top_level_expression("file:///src/objects.json").unwrap();
        assert!(expr.contains("parseJson"), "{expr}");
    }

    /// Story: single quotes in the path are doubled inside the literal
    #[test]
    fn story_single_quotes_are_doubled() {
        let dir = tempdir().unwrap();
        let konfig = konfig_with(|_| {});
        let b = builder(&konfig, dir.path());
        let expr = b.top_level_expression("file:///src/it's.jsonnet").unwrap();
        assert!(expr.contains("it''s"), "{expr}");
    }

    #[test]
    fn test_inject_snippet_appended() {
        let dir = tempdir().unwrap();
        let konfig = konfig_with(|spec| {
            spec.inject = Some("+ { injected: true }".to_string());
        });
        let b = builder(&konfig, dir.path());
        let expr = b.top_level_expression("file:///src/main.jsonnet").unwrap();
        assert_eq!(expr, "(import @'file:///src/main.jsonnet')\n+ { injected: true }");
    }

    /// Story: configured TLAs wrap the expression in an applying call
    #[test]
    fn story_tla_arguments_wrap_expression() {
        let dir = tempdir().unwrap();
        let konfig = konfig_with(|spec| {
            let mut vars = Variables::default();
            vars.tla_str.insert("region".to_string(), "us-west-2".to_string());
            vars.tla_code.insert("replicas".to_string(), "2".to_string());
            spec.variables = Some(vars);
        });
        let b = builder(&konfig, dir.path());
        let expr = b.top_level_expression("file:///src/main.jsonnet").unwrap();
        assert!(expr.contains("std.isFunction(target)"), "{expr}");
        assert!(expr.contains(r#"region="us-west-2""#), "{expr}");
        assert!(expr.contains("replicas=2"), "{expr}");
    }

    #[test]
    fn test_search_urls_include_paths_and_urls() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("vendor")).unwrap();
        let konfig = konfig_with(|spec| {
            spec.jsonnet_paths = vec!["vendor".to_string()];
            spec.jsonnet_urls = vec!["https://example.com/lib".to_string()];
        });
        let b = builder(&konfig, dir.path());
        let urls: Vec<String> = b.search_urls.iter().map(Url::to_string).collect();
        assert_eq!(urls[0], "internal:///");
        assert!(urls[1].starts_with("file://") && urls[1].ends_with("/vendor/"), "{urls:?}");
        assert_eq!(urls[2], "https://example.com/lib/");
    }

    // =========================================================================
    // End-to-end evaluation
    // =========================================================================

    #[test]
    fn test_evaluates_plain_jsonnet() {
        let dir = tempdir().unwrap();
        let entry = dir.path().join("main.jsonnet");
        fs::write(
            &entry,
            r#"{ ns: { apiVersion: 'v1', kind: 'Namespace', metadata: { name: 'app' } } }"#,
        )
        .unwrap();

        let konfig = konfig_with(|_| {});
        let b = builder(&konfig, dir.path());
        let output = b.build(None, &entry.to_string_lossy()).unwrap();
        let objects = output.sorted_objects();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0]["kind"], "Namespace");
    }

    #[test]
    fn test_evaluates_with_ext_and_tla_variables() {
        let dir = tempdir().unwrap();
        let entry = dir.path().join("main.jsonnet");
        fs::write(
            &entry,
            r#"function(replicas) {
  apiVersion: 'v1',
  kind: 'ConfigMap',
  metadata: { name: std.extVar('name') },
  data: { replicas: std.toString(replicas) },
}"#,
        )
        .unwrap();

        let konfig = konfig_with(|spec| {
            let mut vars = Variables::default();
            vars.ext_str.insert("name".to_string(), "from-ext".to_string());
            vars.tla_code.insert("replicas".to_string(), "3".to_string());
            spec.variables = Some(vars);
        });
        let b = builder(&konfig, dir.path());
        let output = b.build(None, &entry.to_string_lossy()).unwrap();
        let objects = output.sorted_objects();
        assert_eq!(objects[0]["metadata"]["name"], "from-ext");
        assert_eq!(objects[0]["data"]["replicas"], "3");
    }

    #[test]
    fn test_evaluates_yaml_entry_through_embedded_lib() {
        let dir = tempdir().unwrap();
        let entry = dir.path().join("objects.yaml");
        fs::write(
            &entry,
            "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: app\n",
        )
        .unwrap();

        let konfig = konfig_with(|_| {});
        let b = builder(&konfig, dir.path());
        let output = b.build(None, &entry.to_string_lossy()).unwrap();
        let objects = output.sorted_objects();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0]["kind"], "Namespace");
    }

    #[test]
    fn test_relative_imports_resolve_against_entry() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("lib.libsonnet"), "{ name: 'imported' }").unwrap();
        let entry = dir.path().join("main.jsonnet");
        fs::write(
            &entry,
            r#"local lib = import 'lib.libsonnet';
{ apiVersion: 'v1', kind: 'Namespace', metadata: { name: lib.name } }"#,
        )
        .unwrap();

        let konfig = konfig_with(|_| {});
        let b = builder(&konfig, dir.path());
        let output = b.build(None, &entry.to_string_lossy()).unwrap();
        assert_eq!(output.sorted_objects()[0]["metadata"]["name"], "imported");
    }

    #[test]
    fn test_evaluation_error_is_surfaced_trimmed() {
        let dir = tempdir().unwrap();
        let entry = dir.path().join("main.jsonnet");
        fs::write(&entry, "{ oops ").unwrap();

        let konfig = konfig_with(|_| {});
        let b = builder(&konfig, dir.path());
        let err = b.build(None, &entry.to_string_lossy()).unwrap_err();
        let msg = err.to_string();
        assert!(!msg.trim().is_empty());
        assert_eq!(msg.trim(), msg.trim_end());
    }

    /// Determinism: repeated builds of the same tree agree byte-for-byte
    #[test]
    fn test_build_is_deterministic() {
        let dir = tempdir().unwrap();
        let entry = dir.path().join("main.jsonnet");
        fs::write(
            &entry,
            r#"{
  a: { apiVersion: 'v1', kind: 'Namespace', metadata: { name: 'one' } },
  b: { apiVersion: 'v1', kind: 'ConfigMap', metadata: { name: 'two', namespace: 'one' }, data: { z: '1', a: '2' } },
}"#,
        )
        .unwrap();

        let konfig = konfig_with(|_| {});
        let path = entry.to_string_lossy();
        let first = builder(&konfig, dir.path()).build(None, &path).unwrap();
        let second = builder(&konfig, dir.path()).build(None, &path).unwrap();
        assert_eq!(first.yaml_stream().unwrap(), second.yaml_stream().unwrap());
        assert_eq!(first.sha1_sum().unwrap(), second.sha1_sum().unwrap());
    }
}
