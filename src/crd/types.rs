//! Shared spec types referenced by the Konfiguration CRD

use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A reference to a named object in the same namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocalObjectReference {
    /// Name of the referenced object
    pub name: String,
}

/// Where to fetch the contents of a kubeconfig for remote reconciliation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubeConfigRef {
    /// A secret in the Konfiguration's namespace containing a `value` key
    /// with the kubeconfig file as the value. It is recommended that the
    /// kubeconfig is self-contained and regularly refreshed if it carries
    /// expiring credentials.
    pub secret_ref: LocalObjectReference,
}

/// The kinds of source objects a Konfiguration can reference
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// A fluxcd GitRepository
    GitRepository,
    /// A fluxcd Bucket
    Bucket,
}

impl SourceKind {
    /// The API version the source kinds are served under
    pub fn api_version(&self) -> &'static str {
        "source.toolkit.fluxcd.io/v1beta1"
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::GitRepository => write!(f, "GitRepository"),
            SourceKind::Bucket => write!(f, "Bucket"),
        }
    }
}

/// Reference to a source object holding the Jsonnet to evaluate
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CrossNamespaceSourceReference {
    /// Kind of the referenced source object
    pub kind: SourceKind,
    /// Name of the referenced source object
    pub name: String,
    /// Namespace of the referenced source object, defaults to the namespace
    /// of the Konfiguration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl fmt::Display for CrossNamespaceSourceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Reference to another Konfiguration that must be ready before this one
/// can be reconciled
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DependencyReference {
    /// Name of the referenced Konfiguration
    pub name: String,
    /// Namespace of the referenced Konfiguration, defaults to the namespace
    /// of the dependent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// A resource to include in the health assessment
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NamespacedObjectKindReference {
    /// API version of the referenced object. Defaults to `apps/v1` for
    /// backwards compatibility.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// Kind of the referenced object
    pub kind: String,
    /// Name of the referenced object
    pub name: String,
    /// Namespace of the referenced object
    pub namespace: String,
}

/// Values for external variables and top-level arguments used when
/// evaluating the Jsonnet.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Variables {
    /// Values of external variables with string values
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ext_str: BTreeMap<String, String>,
    /// Values of external variables with values supplied as Jsonnet code
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ext_code: BTreeMap<String, String>,
    /// Values of top level arguments with string values
    #[serde(default, rename = "tlaStr", skip_serializing_if = "BTreeMap::is_empty")]
    pub tla_str: BTreeMap<String, String>,
    /// Values of top level arguments with values supplied as Jsonnet code
    #[serde(default, rename = "tlaCode", skip_serializing_if = "BTreeMap::is_empty")]
    pub tla_code: BTreeMap<String, String>,
    /// A raw JSON object whose top-level keys are injected as external
    /// code variables
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "extVars"
    )]
    #[schemars(schema_with = "preserve_unknown_object")]
    pub ext_vars: Option<serde_json::Value>,
    /// A raw JSON object whose top-level keys are injected as top level
    /// code arguments
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "tlaVars"
    )]
    #[schemars(schema_with = "preserve_unknown_object")]
    pub tla_vars: Option<serde_json::Value>,
}

impl Variables {
    /// Returns true when no variables of any flavor are configured
    pub fn is_empty(&self) -> bool {
        self.ext_str.is_empty()
            && self.ext_code.is_empty()
            && self.tla_str.is_empty()
            && self.tla_code.is_empty()
            && self.ext_vars.is_none()
            && self.tla_vars.is_none()
    }
}

/// Schema for raw JSON blobs: an object with arbitrary fields
fn preserve_unknown_object(_gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    serde_json::from_value(serde_json::json!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true,
    }))
    .expect("static schema is valid")
}
