//! Build snapshots
//!
//! A snapshot is the fingerprint of a successful build: the checksum of the
//! canonical YAML stream plus a per-namespace index of the kinds it
//! contained. The kind index is what pruning walks to find orphan
//! candidates without listing every resource type in the cluster.

use std::collections::BTreeMap;

use kube::api::GroupVersionKind;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Metadata of the Kubernetes objects generated for a source revision
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// The SHA-1 checksum of the canonical manifest stream
    pub checksum: String,
    /// Kubernetes kinds grouped by namespace. The empty-namespace entry
    /// holds cluster-scoped kinds.
    pub entries: Vec<SnapshotEntry>,
}

/// The kinds that occurred in one namespace of a build
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    /// The namespace of this entry; empty for cluster-scoped objects
    #[serde(default)]
    pub namespace: String,
    /// Mapping from `group/version,Kind` composite keys to the kind name
    pub kinds: BTreeMap<String, String>,
}

impl Snapshot {
    /// Build a snapshot from a checksum and the sorted objects of a build.
    ///
    /// Objects are expected as unstructured JSON values carrying at least
    /// `apiVersion` and `kind`; anything else in the build output is a bug
    /// upstream in the object walk.
    pub fn new<'a>(
        checksum: impl Into<String>,
        objects: impl IntoIterator<Item = &'a serde_json::Value>,
    ) -> Self {
        let mut snapshot = Self {
            checksum: checksum.into(),
            entries: Vec::new(),
        };
        for obj in objects {
            snapshot.add_entry(obj);
        }
        snapshot
    }

    fn add_entry(&mut self, obj: &serde_json::Value) {
        let namespace = obj
            .pointer("/metadata/namespace")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let kind = obj
            .get("kind")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let api_version = obj
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let key = gvk_key(api_version, &kind);

        match self.entries.iter_mut().find(|e| e.namespace == namespace) {
            Some(entry) => {
                entry.kinds.insert(key, kind);
            }
            None => self.entries.push(SnapshotEntry {
                namespace,
                kinds: BTreeMap::from([(key, kind)]),
            }),
        }
    }

    /// The cluster-scoped kinds in this snapshot
    pub fn non_namespaced_kinds(&self) -> Vec<GroupVersionKind> {
        self.entries
            .iter()
            .filter(|e| e.namespace.is_empty())
            .flat_map(|e| e.kinds.iter().filter_map(|(key, kind)| parse_gvk_key(key, kind)))
            .collect()
    }

    /// The namespaced kinds in this snapshot, grouped by namespace
    pub fn namespaced_kinds(&self) -> BTreeMap<String, Vec<GroupVersionKind>> {
        self.entries
            .iter()
            .filter(|e| !e.namespace.is_empty())
            .map(|e| {
                let kinds = e
                    .kinds
                    .iter()
                    .filter_map(|(key, kind)| parse_gvk_key(key, kind))
                    .collect();
                (e.namespace.clone(), kinds)
            })
            .collect()
    }
}

/// The composite key a kind is indexed under: `group/version,Kind`
pub fn gvk_key(api_version: &str, kind: &str) -> String {
    match api_version.split_once('/') {
        Some((group, version)) => format!("{group}/{version},{kind}"),
        // Core group objects have a bare version
        None => format!("/{api_version},{kind}"),
    }
}

fn parse_gvk_key(key: &str, kind: &str) -> Option<GroupVersionKind> {
    let (group_version, _) = key.split_once(',')?;
    let (group, version) = group_version.split_once('/')?;
    Some(GroupVersionKind {
        group: group.to_string(),
        version: version.to_string(),
        kind: kind.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hello_build() -> Vec<serde_json::Value> {
        vec![
            json!({
                "apiVersion": "v1",
                "kind": "Namespace",
                "metadata": {"name": "app"},
            }),
            json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": {"name": "web", "namespace": "app"},
            }),
        ]
    }

    /// Story: a build of a Namespace and a Deployment indexes into two
    /// entries, the cluster-scoped one keyed by the empty namespace
    #[test]
    fn story_snapshot_indexes_kinds_by_namespace() {
        let objects = hello_build();
        let snapshot = Snapshot::new("abc123", objects.iter());

        assert_eq!(snapshot.checksum, "abc123");
        assert_eq!(snapshot.entries.len(), 2);

        let cluster = &snapshot.entries[0];
        assert_eq!(cluster.namespace, "");
        assert_eq!(
            cluster.kinds.get("/v1,Namespace").map(String::as_str),
            Some("Namespace")
        );

        let app = &snapshot.entries[1];
        assert_eq!(app.namespace, "app");
        assert_eq!(
            app.kinds.get("apps/v1,Deployment").map(String::as_str),
            Some("Deployment")
        );
    }

    /// Story: pruning walks the index back into GroupVersionKinds
    #[test]
    fn story_kind_index_round_trips_to_gvks() {
        let objects = hello_build();
        let snapshot = Snapshot::new("abc123", objects.iter());

        let non_namespaced = snapshot.non_namespaced_kinds();
        assert_eq!(non_namespaced.len(), 1);
        assert_eq!(non_namespaced[0].group, "");
        assert_eq!(non_namespaced[0].version, "v1");
        assert_eq!(non_namespaced[0].kind, "Namespace");

        let namespaced = snapshot.namespaced_kinds();
        assert_eq!(namespaced.len(), 1);
        let app_kinds = &namespaced["app"];
        assert_eq!(app_kinds.len(), 1);
        assert_eq!(app_kinds[0].group, "apps");
        assert_eq!(app_kinds[0].version, "v1");
        assert_eq!(app_kinds[0].kind, "Deployment");
    }

    /// Story: an entry's namespace is empty exactly when its kinds are
    /// cluster-scoped, so the two accessors partition the index
    #[test]
    fn story_accessors_partition_the_index() {
        let objects = vec![
            json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "a"}}),
            json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c", "namespace": "a"}}),
            json!({"apiVersion": "rbac.authorization.k8s.io/v1", "kind": "ClusterRole", "metadata": {"name": "r"}}),
        ];
        let snapshot = Snapshot::new("x", objects.iter());

        let cluster: Vec<String> = snapshot
            .non_namespaced_kinds()
            .into_iter()
            .map(|gvk| gvk.kind)
            .collect();
        assert!(cluster.contains(&"Namespace".to_string()));
        assert!(cluster.contains(&"ClusterRole".to_string()));

        let namespaced = snapshot.namespaced_kinds();
        assert_eq!(namespaced["a"][0].kind, "ConfigMap");
    }

    #[test]
    fn test_gvk_key_core_group() {
        assert_eq!(gvk_key("v1", "Namespace"), "/v1,Namespace");
    }

    #[test]
    fn test_gvk_key_with_group() {
        assert_eq!(gvk_key("apps/v1", "Deployment"), "apps/v1,Deployment");
    }

    #[test]
    fn test_same_kind_in_two_namespaces() {
        let objects = vec![
            json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a", "namespace": "one"}}),
            json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "b", "namespace": "two"}}),
        ];
        let snapshot = Snapshot::new("x", objects.iter());
        assert_eq!(snapshot.entries.len(), 2);
        assert_eq!(snapshot.namespaced_kinds().len(), 2);
    }
}
