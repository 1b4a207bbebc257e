//! Health assessment of declared resources
//!
//! After a successful apply, a Konfiguration's `healthChecks` entries are
//! polled until every referenced object reports a current status or the
//! Konfiguration's timeout (plus a second of grace) elapses. The timeout
//! error enumerates the identifiers that never became current.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, ApiResource, DynamicObject};
use kube::discovery::Scope;
use kube::{Client, Discovery};
use serde_json::Value;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::{Konfiguration, NamespacedObjectKindReference};
use crate::{Error, Result};

/// Default apiVersion for health check references, for backwards
/// compatibility with specs that predate the field
const DEFAULT_HEALTH_CHECK_API_VERSION: &str = "apps/v1";

/// Wait between poll rounds
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Identifier of one object under health assessment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectId {
    /// API version of the object
    pub api_version: String,
    /// Kind of the object
    pub kind: String,
    /// Namespace of the object
    pub namespace: String,
    /// Name of the object
    pub name: String,
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}/{}'", self.kind, self.namespace, self.name)
    }
}

impl From<&NamespacedObjectKindReference> for ObjectId {
    fn from(reference: &NamespacedObjectKindReference) -> Self {
        Self {
            api_version: reference
                .api_version
                .clone()
                .unwrap_or_else(|| DEFAULT_HEALTH_CHECK_API_VERSION.to_string()),
            kind: reference.kind.clone(),
            namespace: reference.namespace.clone(),
            name: reference.name.clone(),
        }
    }
}

/// Fetches the live state of objects under assessment
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusReader: Send + Sync {
    /// Fetch the object, or `None` when it does not exist
    async fn fetch(&self, id: &ObjectId) -> Result<Option<DynamicObject>>;
}

/// Status reader backed by the (possibly impersonated) cluster client
pub struct ClusterStatusReader {
    client: Client,
    discovery: Arc<Discovery>,
}

impl ClusterStatusReader {
    /// Create a reader using the given client and its discovery data
    pub fn new(client: Client, discovery: Arc<Discovery>) -> Self {
        Self { client, discovery }
    }
}

#[async_trait]
impl StatusReader for ClusterStatusReader {
    async fn fetch(&self, id: &ObjectId) -> Result<Option<DynamicObject>> {
        let (group, version) = match id.api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", id.api_version.as_str()),
        };
        let gvk = kube::api::GroupVersionKind {
            group: group.to_string(),
            version: version.to_string(),
            kind: id.kind.clone(),
        };
        let (ar, caps): (ApiResource, _) = self
            .discovery
            .resolve_gvk(&gvk)
            .ok_or_else(|| Error::health_check(format!("unknown resource type {}", id.api_version)))?;

        let api: Api<DynamicObject> = if caps.scope == Scope::Namespaced {
            Api::namespaced_with(self.client.clone(), &id.namespace, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        };
        Ok(api.get_opt(&id.name).await?)
    }
}

/// Polls a Konfiguration's declared health checks
pub struct HealthCheck {
    ids: Vec<ObjectId>,
    timeout: Duration,
    reader: Box<dyn StatusReader>,
}

impl HealthCheck {
    /// Create an assessment for the Konfiguration's declared checks
    pub fn new(konfig: &Konfiguration, reader: Box<dyn StatusReader>) -> Self {
        Self {
            ids: konfig.spec.health_checks.iter().map(ObjectId::from).collect(),
            timeout: konfig.timeout() + Duration::from_secs(1),
            reader,
        }
    }

    /// Poll until every declared object is current or the timeout elapses.
    pub async fn assess(&self, poll_interval: Duration) -> Result<()> {
        if self.ids.is_empty() {
            return Ok(());
        }

        let poll_all = async {
            loop {
                let mut pending = Vec::new();
                for id in &self.ids {
                    match self.reader.fetch(id).await? {
                        Some(obj) if is_current(&obj) => {
                            debug!(object = %id, "Health check target is current");
                        }
                        _ => pending.push(id.clone()),
                    }
                }
                if pending.is_empty() {
                    return Ok(());
                }
                tokio::time::sleep(poll_interval).await;
            }
        };

        match tokio::time::timeout(self.timeout, poll_all).await {
            Ok(result) => result,
            Err(_) => {
                let mut pending = Vec::new();
                for id in &self.ids {
                    let current = matches!(self.reader.fetch(id).await, Ok(Some(obj)) if is_current(&obj));
                    if !current {
                        pending.push(id.to_string());
                    }
                }
                Err(Error::health_check(format!(
                    "health check timed out for [{}]",
                    pending.join(", ")
                )))
            }
        }
    }
}

/// A compact current-status aggregation over the common workload kinds.
///
/// An object is current when its controller has observed the latest
/// generation and its kind-specific readiness signal holds. Kinds without
/// a known signal fall back to a `Ready` condition if one is present, and
/// count as current otherwise.
pub fn is_current(obj: &DynamicObject) -> bool {
    let data = &obj.data;

    // A stale controller view is never current
    if let (Some(observed), Some(generation)) = (
        data.pointer("/status/observedGeneration").and_then(Value::as_i64),
        obj.metadata.generation,
    ) {
        if observed < generation {
            return false;
        }
    }

    let kind = obj
        .types
        .as_ref()
        .map(|t| t.kind.as_str())
        .unwrap_or_default();

    match kind {
        "Deployment" => {
            condition_true(data, "Available") && replicas_ready(data, "readyReplicas")
        }
        "StatefulSet" => replicas_ready(data, "readyReplicas"),
        "DaemonSet" => {
            let desired = data
                .pointer("/status/desiredNumberScheduled")
                .and_then(Value::as_i64);
            let ready = data.pointer("/status/numberReady").and_then(Value::as_i64);
            match (desired, ready) {
                (Some(desired), Some(ready)) => ready >= desired,
                _ => false,
            }
        }
        "ReplicaSet" => replicas_ready(data, "readyReplicas"),
        "Job" => condition_true(data, "Complete"),
        "Pod" => matches!(
            data.pointer("/status/phase").and_then(Value::as_str),
            Some("Running") | Some("Succeeded")
        ),
        _ => match data.pointer("/status/conditions") {
            Some(_) => condition_true(data, "Ready"),
            // No conditions reported at all: existence is the best signal
            None => true,
        },
    }
}

fn condition_true(data: &Value, type_: &str) -> bool {
    data.pointer("/status/conditions")
        .and_then(Value::as_array)
        .is_some_and(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(Value::as_str) == Some(type_)
                    && c.get("status").and_then(Value::as_str) == Some("True")
            })
        })
}

fn replicas_ready(data: &Value, ready_field: &str) -> bool {
    let desired = data.pointer("/spec/replicas").and_then(Value::as_i64).unwrap_or(1);
    let ready = data
        .pointer(&format!("/status/{ready_field}"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    ready >= desired
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::KonfigurationSpec;
    use kube::core::{ObjectMeta, TypeMeta};
    use serde_json::json;

    fn dynamic(kind: &str, data: Value) -> DynamicObject {
        DynamicObject {
            types: Some(TypeMeta {
                api_version: "apps/v1".to_string(),
                kind: kind.to_string(),
            }),
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("app".to_string()),
                ..Default::default()
            },
            data,
        }
    }

    fn konfig_with_check() -> Konfiguration {
        let spec: KonfigurationSpec = serde_yaml::from_str(
            r#"
interval: 1s
path: http://fixtures/hello.jsonnet
prune: false
healthChecks:
  - kind: Deployment
    name: web
    namespace: app
"#,
        )
        .unwrap();
        Konfiguration::new("web", spec)
    }

    // =========================================================================
    // Current-status rules
    // =========================================================================

    #[test]
    fn test_deployment_current_when_available_and_ready() {
        let obj = dynamic(
            "Deployment",
            json!({
                "spec": {"replicas": 2},
                "status": {
                    "readyReplicas": 2,
                    "conditions": [{"type": "Available", "status": "True"}],
                },
            }),
        );
        assert!(is_current(&obj));
    }

    #[test]
    fn test_deployment_not_current_while_rolling_out() {
        let obj = dynamic(
            "Deployment",
            json!({
                "spec": {"replicas": 2},
                "status": {
                    "readyReplicas": 1,
                    "conditions": [{"type": "Available", "status": "True"}],
                },
            }),
        );
        assert!(!is_current(&obj));
    }

    #[test]
    fn test_stale_observed_generation_is_not_current() {
        let mut obj = dynamic(
            "Deployment",
            json!({
                "spec": {"replicas": 1},
                "status": {
                    "observedGeneration": 1,
                    "readyReplicas": 1,
                    "conditions": [{"type": "Available", "status": "True"}],
                },
            }),
        );
        obj.metadata.generation = Some(2);
        assert!(!is_current(&obj));
    }

    #[test]
    fn test_unknown_kind_uses_ready_condition() {
        let ready = dynamic(
            "Widget",
            json!({"status": {"conditions": [{"type": "Ready", "status": "True"}]}}),
        );
        assert!(is_current(&ready));

        let not_ready = dynamic(
            "Widget",
            json!({"status": {"conditions": [{"type": "Ready", "status": "False"}]}}),
        );
        assert!(!is_current(&not_ready));
    }

    #[test]
    fn test_unknown_kind_without_conditions_is_current() {
        let obj = dynamic("ConfigMap", json!({"data": {}}));
        assert!(is_current(&obj));
    }

    // =========================================================================
    // Polling stories
    // =========================================================================

    /// Story: a health check against a missing Deployment times out and the
    /// error enumerates the identifier
    #[tokio::test]
    async fn story_missing_target_times_out_with_identifier() {
        let mut reader = MockStatusReader::new();
        reader.expect_fetch().returning(|_| Ok(None));

        let check = HealthCheck {
            ids: vec![ObjectId {
                api_version: "apps/v1".to_string(),
                kind: "Deployment".to_string(),
                namespace: "app".to_string(),
                name: "web".to_string(),
            }],
            timeout: Duration::from_millis(50),
            reader: Box::new(reader),
        };

        let err = check.assess(Duration::from_millis(10)).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("timed out"), "{msg}");
        assert!(msg.contains("Deployment 'app/web'"), "{msg}");
    }

    /// Story: the assessment returns as soon as every target is current
    #[tokio::test]
    async fn story_assessment_completes_when_all_current() {
        let mut reader = MockStatusReader::new();
        reader.expect_fetch().returning(|_| {
            Ok(Some(dynamic(
                "Deployment",
                json!({
                    "spec": {"replicas": 1},
                    "status": {
                        "readyReplicas": 1,
                        "conditions": [{"type": "Available", "status": "True"}],
                    },
                }),
            )))
        });

        let check = HealthCheck::new(&konfig_with_check(), Box::new(reader));
        check.assess(Duration::from_millis(10)).await.unwrap();
    }

    #[test]
    fn test_object_id_defaults_api_version() {
        let reference = NamespacedObjectKindReference {
            api_version: None,
            kind: "Deployment".to_string(),
            name: "web".to_string(),
            namespace: "app".to_string(),
        };
        let id = ObjectId::from(&reference);
        assert_eq!(id.api_version, "apps/v1");
        assert_eq!(id.to_string(), "Deployment 'app/web'");
    }
}
