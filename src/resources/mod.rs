//! Resource manager
//!
//! Applies built manifests with server-side apply and garbage-collects
//! objects that fell out of the build. Every applied object is stamped with
//! the owner labels and a per-object checksum annotation; pruning lists by
//! the owner labels and deletes objects whose snapshot checksum no longer
//! matches. The manager holds no state across calls, and every operation is
//! bounded by the owning Konfiguration's timeout.

use std::fmt;
use std::sync::Arc;

use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::discovery::Scope;
use kube::{Client, Discovery};
use serde_json::Value;
use tracing::{debug, info};

use crate::crd::{Konfiguration, Snapshot};
use crate::jsonnet::parse_yaml_stream;
use crate::{
    Error, Result, KONFIGURATION_CHECKSUM_LABEL, KONFIGURATION_NAME_LABEL,
    KONFIGURATION_NAMESPACE_LABEL, LAST_APPLIED_CHECKSUM_ANNOTATION, PRUNING_DISABLED_VALUE,
    RESOURCE_SKIP_PRUNING, SERVER_SIDE_APPLY_OWNER,
};

mod diff;

pub use diff::drifted;

/// What happened to one object during apply or prune
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// The object did not exist and was created
    Created,
    /// The object existed and was patched
    Configured,
    /// The object matched the desired state
    UpToDate,
    /// The object was orphaned and deleted
    Deleted,
    /// The object was orphaned; deletion is pending its finalizers
    MarkedForDeletion,
    /// The operation on this object failed
    Failed(String),
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::Created => write!(f, "created"),
            Change::Configured => write!(f, "configured"),
            Change::UpToDate => write!(f, "up to date"),
            Change::Deleted => write!(f, "deleted"),
            Change::MarkedForDeletion => write!(f, "marked for deletion"),
            Change::Failed(msg) => write!(f, "failed: {msg}"),
        }
    }
}

/// The per-object record of an apply or prune pass
#[derive(Debug, Default)]
pub struct ChangeSet {
    entries: Vec<(String, Change)>,
}

impl ChangeSet {
    /// Record what happened to an object
    pub fn push(&mut self, id: impl Into<String>, change: Change) {
        self.entries.push((id.into(), change));
    }

    /// The recorded entries in order
    pub fn entries(&self) -> &[(String, Change)] {
        &self.entries
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any entry mutated cluster state
    pub fn has_mutations(&self) -> bool {
        self.entries.iter().any(|(_, c)| {
            matches!(
                c,
                Change::Created | Change::Configured | Change::Deleted | Change::MarkedForDeletion
            )
        })
    }
}

impl fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (id, change) in &self.entries {
            writeln!(f, "{id} {change}")?;
        }
        Ok(())
    }
}

/// Applies and prunes the objects of one Konfiguration
pub struct ResourceManager {
    client: Client,
    discovery: Arc<Discovery>,
    parent: Konfiguration,
}

impl ResourceManager {
    /// Create a manager operating with the given (possibly impersonated)
    /// client on behalf of the given Konfiguration
    pub fn new(client: Client, discovery: Arc<Discovery>, parent: &Konfiguration) -> Self {
        Self {
            client,
            discovery,
            parent: parent.clone(),
        }
    }

    /// Reconcile a raw `---`-delimited manifest stream against the API
    /// server. The snapshot must match the manifest.
    pub async fn reconcile_raw(&self, snapshot: &Snapshot, manifest: &str) -> Result<ChangeSet> {
        let mut objects = Vec::new();
        for doc in parse_yaml_stream(manifest)? {
            expand_lists(doc, &mut objects);
        }
        self.reconcile_objects(snapshot, &objects).await
    }

    /// Apply every object in the sorted input, in order.
    pub async fn reconcile_objects(
        &self,
        snapshot: &Snapshot,
        objects: &[Value],
    ) -> Result<ChangeSet> {
        let deadline = self.parent.timeout();
        tokio::time::timeout(deadline, self.reconcile_inner(snapshot, objects))
            .await
            .map_err(|_| {
                Error::reconciliation(format!("apply timed out after {deadline:?}"))
            })?
    }

    async fn reconcile_inner(&self, snapshot: &Snapshot, objects: &[Value]) -> Result<ChangeSet> {
        let mut changeset = ChangeSet::default();
        for obj in objects {
            let (id, change) = self.reconcile_object(obj, &snapshot.checksum).await?;
            changeset.push(id, change);
        }
        Ok(changeset)
    }

    async fn reconcile_object(&self, obj: &Value, full_checksum: &str) -> Result<(String, Change)> {
        // Work on a copy so dry-run and real apply see identical input
        let mut desired = obj.clone();

        // The GC labels participate in the object checksum so a checksum
        // change in the snapshot forces a patch that refreshes them
        set_labels(&mut desired, &self.gc_labels(full_checksum));
        let checksum = object_checksum(&desired)?;
        set_annotation(&mut desired, LAST_APPLIED_CHECKSUM_ANNOTATION, &checksum);

        let id = object_id(&desired);
        let (api, name) = self.api_for(&desired)?;

        let Some(found) = api.get_opt(&name).await? else {
            info!("Creating {id}");
            self.server_side_apply(&api, &name, &desired, &id).await?;
            return Ok((id, Change::Created));
        };

        let found_checksum = found
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(LAST_APPLIED_CHECKSUM_ANNOTATION));

        match found_checksum {
            None => {
                info!("Existing {id} has no last-applied-checksum annotation, updating");
                self.server_side_apply(&api, &name, &desired, &id).await?;
                Ok((id, Change::Configured))
            }
            Some(existing) if existing != &checksum => {
                info!(old = %existing, new = %checksum, "{id} definition has a new checksum, updating");
                self.server_side_apply(&api, &name, &desired, &id).await?;
                Ok((id, Change::Configured))
            }
            Some(_) => {
                // Same definition as last apply; look for drift out-of-band
                let live = live_value(&found);
                if drifted(&desired, &live) {
                    info!("{id} definition has drifted, updating");
                    self.server_side_apply(&api, &name, &desired, &id).await?;
                    Ok((id, Change::Configured))
                } else {
                    debug!("{id} is up to date");
                    Ok((id, Change::UpToDate))
                }
            }
        }
    }

    /// Server-side apply with force-conflicts, preceded by a dry-run when
    /// validation is enabled. An Invalid response citing an immutable field
    /// is retried as delete+recreate when `force` is set.
    async fn server_side_apply(
        &self,
        api: &Api<DynamicObject>,
        name: &str,
        desired: &Value,
        id: &str,
    ) -> Result<()> {
        if self.parent.should_validate() {
            let mut params = PatchParams::apply(SERVER_SIDE_APPLY_OWNER).force();
            params.dry_run = true;
            api.patch(name, &params, &Patch::Apply(desired))
                .await
                .map_err(|e| Error::validation(id, e.to_string()))?;
        }

        let params = PatchParams::apply(SERVER_SIDE_APPLY_OWNER).force();
        match api.patch(name, &params, &Patch::Apply(desired)).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae))
                if ae.code == 422
                    && self.parent.force_create()
                    && ae.message.contains("immutable") =>
            {
                info!("{id} has immutable field changes, recreating");
                api.delete(name, &DeleteParams::default()).await?;
                api.patch(name, &params, &Patch::Apply(desired)).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Garbage-collect resources present in `last_snapshot` but absent from
    /// `new_snapshot`. A `None` new snapshot marks every candidate
    /// orphaned, which is the delete path. Failures are recorded but do not
    /// stop the pass; the returned flag reports overall success.
    pub async fn prune(
        &self,
        last_snapshot: Option<&Snapshot>,
        new_snapshot: Option<&Snapshot>,
    ) -> (ChangeSet, bool) {
        let mut changeset = ChangeSet::default();
        let Some(last) = last_snapshot else {
            return (changeset, true);
        };
        let checksum = new_snapshot.map(|s| s.checksum.clone()).unwrap_or_default();

        let deadline = self.parent.timeout();
        match tokio::time::timeout(deadline, self.prune_inner(last, &checksum, &mut changeset))
            .await
        {
            Ok(success) => (changeset, success),
            Err(_) => {
                changeset.push(
                    self.parent.namespaced_name(),
                    Change::Failed(format!("prune timed out after {deadline:?}")),
                );
                (changeset, false)
            }
        }
    }

    async fn prune_inner(
        &self,
        last: &Snapshot,
        checksum: &str,
        changeset: &mut ChangeSet,
    ) -> bool {
        let mut success = true;

        // Namespaced objects go first, cluster-scoped after
        for (namespace, gvks) in last.namespaced_kinds() {
            for gvk in gvks {
                info!("Checking for orphaned {}s in {namespace} namespace", gvk.kind);
                if !self
                    .prune_kind(&gvk, Some(&namespace), checksum, changeset)
                    .await
                {
                    success = false;
                }
            }
        }
        for gvk in last.non_namespaced_kinds() {
            info!("Checking for orphaned {}s", gvk.kind);
            if !self.prune_kind(&gvk, None, checksum, changeset).await {
                success = false;
            }
        }

        success
    }

    async fn prune_kind(
        &self,
        gvk: &kube::api::GroupVersionKind,
        namespace: Option<&str>,
        checksum: &str,
        changeset: &mut ChangeSet,
    ) -> bool {
        let Some((ar, _)) = self.discovery.resolve_gvk(gvk) else {
            changeset.push(
                gvk.kind.clone(),
                Change::Failed(format!("no API resource for {}/{}", gvk.group, gvk.version)),
            );
            return false;
        };

        let api: Api<DynamicObject> = match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        };

        let params = ListParams::default().labels(&self.selector());
        let list = match api.list(&params).await {
            Ok(list) => list,
            Err(e) => {
                changeset.push(
                    gvk.kind.clone(),
                    Change::Failed(format!("failed to list objects for {} kind: {e}", gvk.kind)),
                );
                return false;
            }
        };

        let mut success = true;
        for item in list.items {
            let id = format!(
                "{}/{}/{}",
                gvk.kind,
                item.metadata.namespace.as_deref().unwrap_or_default(),
                item.metadata.name.as_deref().unwrap_or_default()
            );

            if skip_pruning(&item) {
                info!("GC is disabled for '{id}'");
                continue;
            }

            let parent_deleting = self.parent.metadata.deletion_timestamp.is_some();
            if !is_orphaned(&item, checksum, parent_deleting) {
                continue;
            }
            if item.metadata.deletion_timestamp.is_some() {
                continue;
            }

            info!("Deleting orphaned object {id}");
            let name = item.metadata.name.clone().unwrap_or_default();
            match api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => {
                    let has_finalizers = item
                        .metadata
                        .finalizers
                        .as_ref()
                        .is_some_and(|f| !f.is_empty());
                    changeset.push(
                        id,
                        if has_finalizers {
                            Change::MarkedForDeletion
                        } else {
                            Change::Deleted
                        },
                    );
                }
                Err(e) => {
                    changeset.push(id, Change::Failed(format!("delete failed: {e}")));
                    success = false;
                }
            }
        }
        success
    }

    fn api_for(&self, obj: &Value) -> Result<(Api<DynamicObject>, String)> {
        let api_version = obj
            .get("apiVersion")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let kind = obj.get("kind").and_then(Value::as_str).unwrap_or_default();
        let name = obj
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::reconciliation(format!("{kind} object has no name")))?
            .to_string();
        let namespace = obj
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", api_version),
        };
        let gvk = kube::api::GroupVersionKind {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        };
        let (ar, caps): (ApiResource, _) = self
            .discovery
            .resolve_gvk(&gvk)
            .ok_or_else(|| Error::reconciliation(format!("unknown resource type {api_version}/{kind}")))?;

        let api = if caps.scope == Scope::Namespaced && !namespace.is_empty() {
            Api::namespaced_with(self.client.clone(), namespace, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        };
        Ok((api, name))
    }

    fn selector(&self) -> String {
        format!(
            "{}={},{}={}",
            KONFIGURATION_NAME_LABEL,
            self.parent.metadata.name.as_deref().unwrap_or_default(),
            KONFIGURATION_NAMESPACE_LABEL,
            self.parent.metadata.namespace.as_deref().unwrap_or_default(),
        )
    }

    fn gc_labels(&self, checksum: &str) -> Vec<(String, String)> {
        vec![
            (
                KONFIGURATION_NAME_LABEL.to_string(),
                self.parent.metadata.name.clone().unwrap_or_default(),
            ),
            (
                KONFIGURATION_NAMESPACE_LABEL.to_string(),
                self.parent.metadata.namespace.clone().unwrap_or_default(),
            ),
            (KONFIGURATION_CHECKSUM_LABEL.to_string(), checksum.to_string()),
        ]
    }
}

/// Expand list objects in place, preserving order
fn expand_lists(obj: Value, out: &mut Vec<Value>) {
    let is_list = obj
        .get("kind")
        .and_then(Value::as_str)
        .is_some_and(|k| k.ends_with("List"))
        && obj.get("items").is_some();
    if is_list {
        if let Some(items) = obj.get("items").and_then(Value::as_array) {
            out.extend(items.iter().cloned());
        }
        return;
    }
    out.push(obj);
}

/// `Kind/namespace/name` identifier used in change sets and logs
pub fn object_id(obj: &Value) -> String {
    format!(
        "{}/{}/{}",
        obj.get("kind").and_then(Value::as_str).unwrap_or_default(),
        obj.pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .unwrap_or_default(),
        obj.pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or_default(),
    )
}

/// SHA-1 of the object's JSON encoding. Labels are set before this is
/// computed; the checksum annotation is written after.
pub fn object_checksum(obj: &Value) -> Result<String> {
    let encoded = serde_json::to_vec(obj)
        .map_err(|e| Error::reconciliation(format!("failed to encode object: {e}")))?;
    Ok(crate::jsonnet::hex_sha1(&encoded))
}

fn set_labels(obj: &mut Value, labels: &[(String, String)]) {
    if let Some(map) = metadata_map(obj, "labels") {
        for (key, value) in labels {
            map.insert(key.clone(), Value::String(value.clone()));
        }
    }
}

fn set_annotation(obj: &mut Value, key: &str, value: &str) {
    if let Some(map) = metadata_map(obj, "annotations") {
        map.insert(key.to_string(), Value::String(value.to_string()));
    }
}

/// The named map under `metadata`, created if absent
fn metadata_map<'a>(
    obj: &'a mut Value,
    key: &str,
) -> Option<&'a mut serde_json::Map<String, Value>> {
    obj.as_object_mut()
        .map(|root| {
            root.entry("metadata".to_string())
                .or_insert_with(|| Value::Object(Default::default()))
        })
        .and_then(Value::as_object_mut)
        .map(|metadata| {
            metadata
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Default::default()))
        })
        .and_then(Value::as_object_mut)
}

fn live_value(found: &DynamicObject) -> Value {
    let mut live = found.data.clone();
    if let Some(map) = live.as_object_mut() {
        let metadata = serde_json::to_value(&found.metadata).unwrap_or(Value::Null);
        map.insert("metadata".to_string(), metadata);
        if let Some(types) = &found.types {
            map.insert("apiVersion".to_string(), Value::String(types.api_version.clone()));
            map.insert("kind".to_string(), Value::String(types.kind.clone()));
        }
    }
    live
}

fn skip_pruning(item: &DynamicObject) -> bool {
    let in_labels = item
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(RESOURCE_SKIP_PRUNING))
        .is_some_and(|v| v == PRUNING_DISABLED_VALUE);
    let in_annotations = item
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(RESOURCE_SKIP_PRUNING))
        .is_some_and(|v| v == PRUNING_DISABLED_VALUE);
    in_labels || in_annotations
}

/// An object is orphaned when its parent is being deleted, when it carries
/// no labels at all, or when its checksum label no longer matches the
/// current snapshot
fn is_orphaned(item: &DynamicObject, new_checksum: &str, parent_deleting: bool) -> bool {
    if parent_deleting {
        return true;
    }
    let Some(labels) = item.metadata.labels.as_ref() else {
        return true;
    };
    match labels.get(KONFIGURATION_CHECKSUM_LABEL) {
        Some(checksum) => checksum != new_checksum,
        None => true,
    }
}
