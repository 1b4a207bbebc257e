//! Canonical build output
//!
//! Holds the objects a build produced and lazily derives the three canonical
//! artifacts consumers need: the sorted object slice, the `---`-delimited
//! YAML stream, and the SHA-1 checksum of that stream. All three are cached
//! on first request, so later mutation of the cluster cannot change what a
//! reconciliation observed.

use std::cmp::Ordering;

use once_cell::sync::OnceCell;
use serde_json::Value;
use sha1::{Digest, Sha1};

use crate::{Error, Result};

/// Kinds that sort before everything else in the canonical ordering
const FIRST_KINDS: [&str; 2] = ["Namespace", "CustomResourceDefinition"];

/// The output of a build operation
#[derive(Debug, Default)]
pub struct BuildOutput {
    objects: Vec<Value>,
    yaml_stream: OnceCell<String>,
    checksum: OnceCell<String>,
}

impl BuildOutput {
    /// Create a build output over the given objects
    pub fn new(mut objects: Vec<Value>) -> Self {
        objects.sort_by(compare_objects);
        Self {
            objects,
            yaml_stream: OnceCell::new(),
            checksum: OnceCell::new(),
        }
    }

    /// The canonically sorted objects of this build.
    ///
    /// Namespaces and CustomResourceDefinitions sort first (each
    /// alphabetically by name); everything else sorts by
    /// `namespace/name`.
    pub fn sorted_objects(&self) -> &[Value] {
        &self.objects
    }

    /// The `---`-delimited YAML stream of the sorted objects. Cached on
    /// first call.
    pub fn yaml_stream(&self) -> Result<&str> {
        self.yaml_stream
            .get_or_try_init(|| to_yaml_stream(&self.objects))
            .map(String::as_str)
    }

    /// The SHA-1 checksum of the YAML stream. Cached on first call.
    pub fn sha1_sum(&self) -> Result<&str> {
        self.checksum
            .get_or_try_init(|| {
                let stream = self.yaml_stream()?;
                Ok(hex_sha1(stream.as_bytes()))
            })
            .map(String::as_str)
    }
}

/// SHA-1 of the given bytes as lowercase hex
pub fn hex_sha1(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn to_yaml_stream(objects: &[Value]) -> Result<String> {
    let mut stream = String::from("---\n");
    for (i, obj) in objects.iter().enumerate() {
        let doc = serde_yaml::to_string(obj)
            .map_err(|e| Error::build(format!("failed to marshal object to yaml: {e}")))?;
        stream.push_str(&doc);
        if i == objects.len() - 1 {
            break;
        }
        stream.push_str("\n---\n");
    }
    Ok(stream)
}

fn kind(obj: &Value) -> &str {
    obj.get("kind").and_then(Value::as_str).unwrap_or_default()
}

fn name(obj: &Value) -> &str {
    obj.pointer("/metadata/name")
        .and_then(Value::as_str)
        .unwrap_or_default()
}

fn namespaced_name(obj: &Value) -> String {
    let namespace = obj
        .pointer("/metadata/namespace")
        .and_then(Value::as_str)
        .unwrap_or_default();
    format!("{namespace}/{}", name(obj))
}

/// The canonical, total ordering over build objects. Independent of any
/// mapping iteration order, which is what makes the stream checksum
/// deterministic.
pub fn compare_objects(a: &Value, b: &Value) -> Ordering {
    for first in FIRST_KINDS {
        match (kind(a) == first, kind(b) == first) {
            (true, true) => return name(a).cmp(name(b)),
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            (false, false) => {}
        }
    }
    namespaced_name(a).cmp(&namespaced_name(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> Value {
        let mut metadata = serde_json::Map::new();
        metadata.insert("name".to_string(), json!(name));
        if let Some(ns) = namespace {
            metadata.insert("namespace".to_string(), json!(ns));
        }
        json!({"apiVersion": api_version, "kind": kind, "metadata": metadata})
    }

    /// Story: namespaces and CRDs sort ahead of the workloads that need them
    ///
    /// Apply order follows sort order, so the objects other objects depend
    /// on (their namespace, their CRD) must come first in the stream.
    #[test]
    fn story_namespaces_and_crds_apply_first() {
        let output = BuildOutput::new(vec![
            obj("apps/v1", "Deployment", Some("app"), "web"),
            obj("apiextensions.k8s.io/v1", "CustomResourceDefinition", None, "widgets.example.com"),
            obj("v1", "ConfigMap", Some("app"), "config"),
            obj("v1", "Namespace", None, "app"),
        ]);

        let kinds: Vec<&str> = output.sorted_objects().iter().map(kind).collect();
        assert_eq!(
            kinds,
            vec!["Namespace", "CustomResourceDefinition", "ConfigMap", "Deployment"]
        );
    }

    /// Story: the checksum is a pure function of the sorted stream
    ///
    /// Two builds of the same objects, regardless of input order, produce
    /// byte-identical streams and identical checksums.
    #[test]
    fn story_checksum_is_order_independent() {
        let a = BuildOutput::new(vec![
            obj("v1", "Namespace", None, "app"),
            obj("apps/v1", "Deployment", Some("app"), "web"),
        ]);
        let b = BuildOutput::new(vec![
            obj("apps/v1", "Deployment", Some("app"), "web"),
            obj("v1", "Namespace", None, "app"),
        ]);

        assert_eq!(a.yaml_stream().unwrap(), b.yaml_stream().unwrap());
        assert_eq!(a.sha1_sum().unwrap(), b.sha1_sum().unwrap());
    }

    /// Story: repeated requests return the cached artifacts
    #[test]
    fn story_artifacts_are_cached() {
        let output = BuildOutput::new(vec![obj("v1", "Namespace", None, "app")]);
        let first = output.sha1_sum().unwrap().to_string();
        let second = output.sha1_sum().unwrap().to_string();
        assert_eq!(first, second);
    }

    /// Sort totality: for distinct objects exactly one direction holds
    #[test]
    fn test_sort_totality() {
        let objects = vec![
            obj("v1", "Namespace", None, "a"),
            obj("v1", "Namespace", None, "b"),
            obj("apiextensions.k8s.io/v1", "CustomResourceDefinition", None, "x"),
            obj("v1", "ConfigMap", Some("a"), "c"),
            obj("v1", "Secret", Some("a"), "d"),
            obj("apps/v1", "Deployment", Some("b"), "c"),
        ];
        for (i, a) in objects.iter().enumerate() {
            for (j, b) in objects.iter().enumerate() {
                let ab = compare_objects(a, b);
                let ba = compare_objects(b, a);
                if i == j {
                    assert_eq!(ab, Ordering::Equal);
                } else {
                    assert_ne!(ab, Ordering::Equal, "{i} vs {j}");
                    assert_eq!(ab, ba.reverse());
                }
            }
        }
    }

    #[test]
    fn test_stream_format() {
        let output = BuildOutput::new(vec![
            obj("v1", "Namespace", None, "app"),
            obj("apps/v1", "Deployment", Some("app"), "web"),
        ]);
        let stream = output.yaml_stream().unwrap();
        assert!(stream.starts_with("---\n"));
        assert!(stream.contains("\n---\n"));
        assert!(!stream.ends_with("---\n") || stream.matches("---\n").count() == 2);
        // no trailing separator
        assert!(!stream.trim_end().ends_with("---"));
    }

    #[test]
    fn test_stream_of_single_object_has_no_inner_separator() {
        let output = BuildOutput::new(vec![obj("v1", "Namespace", None, "app")]);
        let stream = output.yaml_stream().unwrap();
        assert!(stream.starts_with("---\n"));
        assert_eq!(stream.matches("---").count(), 1);
    }

    #[test]
    fn test_yaml_keys_are_sorted() {
        // serde_json maps are ordered by key, so the emitted yaml is too
        let output = BuildOutput::new(vec![json!({
            "kind": "ConfigMap",
            "apiVersion": "v1",
            "metadata": {"name": "c"},
            "data": {"z": "1", "a": "2"},
        })]);
        let stream = output.yaml_stream().unwrap();
        let a_pos = stream.find("a: '2'").or_else(|| stream.find("a: \"2\"")).unwrap_or_else(|| stream.find("a:").unwrap());
        let z_pos = stream.find("z:").unwrap();
        assert!(a_pos < z_pos);
        let api_pos = stream.find("apiVersion:").unwrap();
        let kind_pos = stream.find("kind:").unwrap();
        assert!(api_pos < kind_pos);
    }

    #[test]
    fn test_hex_sha1_known_vector() {
        // sha1("abc") is a published test vector
        assert_eq!(hex_sha1(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }
}
