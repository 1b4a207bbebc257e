//! Konfiguration Custom Resource Definition
//!
//! A Konfiguration names a Jsonnet entry point (a path inside a referenced
//! source artifact, or a remote HTTP(S) URL), the variables to evaluate it
//! with, and how the resulting objects should be applied, pruned, and
//! health-checked.

use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{
    CrossNamespaceSourceReference, DependencyReference, KubeConfigRef,
    NamespacedObjectKindReference, Snapshot, Variables, HEALTHY_CONDITION,
    MAX_CONDITION_MESSAGE_LENGTH, READY_CONDITION,
};
use crate::error::reasons;

/// Fallback when an interval fails to parse. The CRD schema constrains the
/// format, so this only guards hand-crafted objects applied with validation
/// disabled.
const FALLBACK_INTERVAL: Duration = Duration::from_secs(60);

/// KonfigurationSpec defines the desired state of a Konfiguration
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "jsonnet.io",
    version = "v1beta1",
    kind = "Konfiguration",
    plural = "konfigurations",
    shortname = "konfig",
    shortname = "konfigs",
    shortname = "konf",
    shortname = "konfs",
    status = "KonfigurationStatus",
    namespaced,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].message"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#,
    printcolumn = r#"{"name":"CurrentRevision","type":"string","jsonPath":".status.lastAppliedRevision","priority":1}"#,
    printcolumn = r#"{"name":"Checksum","type":"string","jsonPath":".status.snapshot.checksum","priority":1}"#,
    printcolumn = r#"{"name":"LastAttemptedRevision","type":"string","jsonPath":".status.lastAttemptedRevision","priority":1}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KonfigurationSpec {
    /// References to Konfiguration resources that must be ready before this
    /// Konfiguration can be reconciled
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<DependencyReference>,

    /// The interval at which to reconcile the Konfiguration, e.g. `5m`
    pub interval: String,

    /// The interval at which to retry a previously failed reconciliation.
    /// When not specified, the controller falls back to `interval`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_interval: Option<String>,

    /// The kubeconfig for reconciling the Konfiguration on a remote
    /// cluster. Defaults to the in-cluster configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_config: Option<KubeConfigRef>,

    /// Path to the jsonnet, json, or yaml to evaluate. When a `sourceRef`
    /// is configured the path is taken relative to the root of the source
    /// archive; a trailing slash denotes a directory and `main.jsonnet` is
    /// appended. Without a `sourceRef` the path must be a full HTTP(S) URL.
    pub path: String,

    /// Additional search paths for the jsonnet importer, relative to the
    /// root of the sourceRef
    #[serde(default, rename = "jsonnetPaths", skip_serializing_if = "Vec::is_empty")]
    pub jsonnet_paths: Vec<String>,

    /// Additional HTTP(S) URLs for the jsonnet importer
    #[serde(default, rename = "jsonnetURLs", skip_serializing_if = "Vec::is_empty")]
    pub jsonnet_urls: Vec<String>,

    /// Variables to use when evaluating the jsonnet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Variables>,

    /// A jsonnet snippet appended to the end of the evaluated expression
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inject: Option<String>,

    /// The name of the Kubernetes service account to impersonate when
    /// reconciling this Konfiguration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// Reference of the source where the jsonnet file(s) are
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<CrossNamespaceSourceReference>,

    /// Prune enables garbage collection
    pub prune: bool,

    /// A list of resources to be included in the health assessment
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub health_checks: Vec<NamespacedObjectKindReference>,

    /// Tells the controller to suspend subsequent reconciliations. Does not
    /// apply to already started executions. Defaults to false.
    #[serde(default)]
    pub suspend: bool,

    /// Timeout for build, validation, apply, and health checking
    /// operations. Defaults to `interval`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    /// Validate input against the server schema. This implies a server-side
    /// dry-run before patch/create operations. Defaults to true.
    #[serde(default = "default_true")]
    pub validate: bool,

    /// Instructs the controller to recreate resources when patching fails
    /// due to an immutable field change. Defaults to false.
    #[serde(default)]
    pub force: bool,
}

fn default_true() -> bool {
    true
}

/// KonfigurationStatus defines the observed state of a Konfiguration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KonfigurationStatus {
    /// The last reconciled generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Conditions representing the Konfiguration state. `Ready` is the
    /// canonical condition; `Healthy` is present when health checks are
    /// configured.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// The last successfully applied revision. For HTTP(S) paths it is the
    /// URL itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_revision: Option<String>,

    /// The revision of the last reconciliation attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempted_revision: Option<String>,

    /// The last successfully applied snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Snapshot>,
}

impl Konfiguration {
    /// The `namespace/name` identifier of this Konfiguration
    pub fn namespaced_name(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or_default(),
            self.metadata.name.as_deref().unwrap_or_default()
        )
    }

    /// The interval at which to reconcile
    pub fn interval(&self) -> Duration {
        parse_duration(&self.spec.interval).unwrap_or(FALLBACK_INTERVAL)
    }

    /// The interval at which to retry a previously failed reconciliation
    pub fn retry_interval(&self) -> Duration {
        self.spec
            .retry_interval
            .as_deref()
            .and_then(parse_duration)
            .unwrap_or_else(|| self.interval())
    }

    /// The timeout for build, validation, apply and health checking
    pub fn timeout(&self) -> Duration {
        self.spec
            .timeout
            .as_deref()
            .and_then(parse_duration)
            .unwrap_or_else(|| self.interval())
    }

    /// The path to evaluate, with directory paths resolved to `main.jsonnet`
    pub fn path(&self) -> String {
        if self.spec.path.ends_with('/') {
            format!("{}main.jsonnet", self.spec.path)
        } else {
            self.spec.path.clone()
        }
    }

    /// The jsonnet snippet to append to the evaluated expression, prefixed
    /// with a newline, or an empty string
    pub fn inject_snippet(&self) -> String {
        match self.spec.inject.as_deref() {
            Some(inject) if !inject.is_empty() => format!("\n{inject}"),
            _ => String::new(),
        }
    }

    /// The source reference with its namespace defaulted to this
    /// Konfiguration's namespace
    pub fn source_ref(&self) -> Option<CrossNamespaceSourceReference> {
        self.spec.source_ref.as_ref().map(|r| {
            let mut r = r.clone();
            if r.namespace.is_none() {
                r.namespace = self.metadata.namespace.clone();
            }
            r
        })
    }

    /// The name of the kubeconfig secret, if remote reconciliation is
    /// configured
    pub fn kube_config_secret_name(&self) -> Option<&str> {
        self.spec
            .kube_config
            .as_ref()
            .map(|kc| kc.secret_ref.name.as_str())
    }

    /// Whether garbage collection is enabled
    pub fn gc_enabled(&self) -> bool {
        self.spec.prune
    }

    /// Whether a dry-run should precede each apply
    pub fn should_validate(&self) -> bool {
        self.spec.validate
    }

    /// Whether the controller may delete and recreate on immutable field
    /// errors
    pub fn force_create(&self) -> bool {
        self.spec.force
    }

    /// Whether reconciliation is suspended
    pub fn is_suspended(&self) -> bool {
        self.spec.suspend
    }

    /// The current Ready condition, if any
    pub fn ready_condition(&self) -> Option<&Condition> {
        self.status
            .as_ref()?
            .conditions
            .iter()
            .find(|c| c.type_ == READY_CONDITION)
    }

    /// Whether this Konfiguration's status reflects its current spec and
    /// reports Ready=True. Used for dependency gating.
    pub fn is_ready(&self) -> bool {
        let Some(status) = self.status.as_ref() else {
            return false;
        };
        if status.conditions.is_empty() {
            return false;
        }
        if status.observed_generation != self.metadata.generation {
            return false;
        }
        self.ready_condition().map(|c| c.status == "True").unwrap_or(false)
    }

    /// Reset the Ready condition to Unknown with reason Progressing
    pub fn set_progressing(&mut self) {
        let generation = self.metadata.generation;
        let status = self.status.get_or_insert_with(Default::default);
        set_condition(
            &mut status.conditions,
            READY_CONDITION,
            "Unknown",
            reasons::PROGRESSING,
            "reconciliation in progress",
            generation,
        );
    }

    /// Set the Ready condition, observed generation and, when non-empty,
    /// the last attempted revision
    pub fn set_readiness(&mut self, condition_status: &str, revision: &str, reason: &str, message: &str) {
        let generation = self.metadata.generation;
        let status = self.status.get_or_insert_with(Default::default);
        set_condition(
            &mut status.conditions,
            READY_CONDITION,
            condition_status,
            reason,
            &trim_message(message, MAX_CONDITION_MESSAGE_LENGTH),
            generation,
        );
        status.observed_generation = generation;
        if !revision.is_empty() {
            status.last_attempted_revision = Some(revision.to_string());
        }
    }

    /// Register a failed reconciliation attempt
    pub fn set_not_ready(&mut self, revision: &str, reason: &str, message: &str) {
        self.set_readiness("False", revision, reason, message);
    }

    /// Register a failed reconciliation attempt that still produced a
    /// snapshot
    pub fn set_not_ready_snapshot(&mut self, snapshot: Snapshot, revision: &str, reason: &str, message: &str) {
        self.set_readiness("False", revision, reason, message);
        let status = self.status.get_or_insert_with(Default::default);
        status.snapshot = Some(snapshot);
    }

    /// Register a successful apply of the given revision
    pub fn set_ready(&mut self, snapshot: Snapshot, revision: &str, reason: &str, message: &str) {
        self.set_readiness("True", revision, reason, message);
        let status = self.status.get_or_insert_with(Default::default);
        status.snapshot = Some(snapshot);
        status.last_applied_revision = Some(revision.to_string());
    }

    /// Set or remove the Healthy condition. The condition is only kept
    /// while health checks are configured.
    pub fn set_healthiness(&mut self, condition_status: &str, reason: &str, message: &str) {
        let generation = self.metadata.generation;
        let has_checks = !self.spec.health_checks.is_empty();
        let status = self.status.get_or_insert_with(Default::default);
        if has_checks {
            set_condition(
                &mut status.conditions,
                HEALTHY_CONDITION,
                condition_status,
                reason,
                &trim_message(message, MAX_CONDITION_MESSAGE_LENGTH),
                generation,
            );
        } else {
            status.conditions.retain(|c| c.type_ != HEALTHY_CONDITION);
        }
    }
}

/// Replace a condition of the given type, updating the transition time only
/// when the status actually changed
fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) {
    let now = Time(chrono::Utc::now());
    let transition_time = match conditions.iter().find(|c| c.type_ == type_) {
        Some(existing) if existing.status == status => existing.last_transition_time.clone(),
        _ => now,
    };
    conditions.retain(|c| c.type_ != type_);
    conditions.push(Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: transition_time,
        observed_generation,
    });
}

fn parse_duration(s: &str) -> Option<Duration> {
    humantime::parse_duration(s).ok()
}

fn trim_message(message: &str, limit: usize) -> String {
    match message.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}...", &message[..idx]),
        None => message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::SourceKind;
    use kube::core::ObjectMeta;

    fn sample_konfig(spec: KonfigurationSpec) -> Konfiguration {
        let mut k = Konfiguration::new("web", spec);
        k.metadata = ObjectMeta {
            name: Some("web".to_string()),
            namespace: Some("default".to_string()),
            generation: Some(2),
            ..Default::default()
        };
        k
    }

    fn sample_spec() -> KonfigurationSpec {
        serde_yaml::from_str(
            r#"
interval: 5m
path: http://fixtures/hello.jsonnet
prune: true
"#,
        )
        .unwrap()
    }

    // =========================================================================
    // Interval and timeout defaulting stories
    // =========================================================================

    /// Story: retryInterval and timeout default to the reconcile interval
    ///
    /// Operators commonly only set `interval`; the other two cadences fall
    /// back to it so a bare spec is fully usable.
    #[test]
    fn story_intervals_default_to_reconcile_interval() {
        let konfig = sample_konfig(sample_spec());
        assert_eq!(konfig.interval(), Duration::from_secs(300));
        assert_eq!(konfig.retry_interval(), Duration::from_secs(300));
        assert_eq!(konfig.timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_explicit_retry_interval_and_timeout() {
        let mut spec = sample_spec();
        spec.retry_interval = Some("30s".to_string());
        spec.timeout = Some("2m".to_string());
        let konfig = sample_konfig(spec);
        assert_eq!(konfig.retry_interval(), Duration::from_secs(30));
        assert_eq!(konfig.timeout(), Duration::from_secs(120));
    }

    // =========================================================================
    // Path resolution stories
    // =========================================================================

    /// Story: a directory path resolves to its main.jsonnet
    #[test]
    fn story_directory_path_appends_main_jsonnet() {
        let mut spec = sample_spec();
        spec.path = "environments/prod/".to_string();
        let konfig = sample_konfig(spec);
        assert_eq!(konfig.path(), "environments/prod/main.jsonnet");
    }

    #[test]
    fn test_file_path_unchanged() {
        let konfig = sample_konfig(sample_spec());
        assert_eq!(konfig.path(), "http://fixtures/hello.jsonnet");
    }

    #[test]
    fn test_inject_snippet_prefixed_with_newline() {
        let mut spec = sample_spec();
        spec.inject = Some("+ { extra: true }".to_string());
        let konfig = sample_konfig(spec);
        assert_eq!(konfig.inject_snippet(), "\n+ { extra: true }");

        let konfig = sample_konfig(sample_spec());
        assert_eq!(konfig.inject_snippet(), "");
    }

    #[test]
    fn test_source_ref_namespace_defaults_to_konfiguration() {
        let mut spec = sample_spec();
        spec.source_ref = Some(CrossNamespaceSourceReference {
            kind: SourceKind::GitRepository,
            name: "infra".to_string(),
            namespace: None,
        });
        let konfig = sample_konfig(spec);
        let source_ref = konfig.source_ref().unwrap();
        assert_eq!(source_ref.namespace.as_deref(), Some("default"));
    }

    // =========================================================================
    // Readiness stories
    // =========================================================================

    /// Story: the controller marks a cycle in progress before doing work
    ///
    /// Consumers watching the Ready condition see Unknown/Progressing while
    /// the controller prepares, builds and applies.
    #[test]
    fn story_progressing_resets_ready_to_unknown() {
        let mut konfig = sample_konfig(sample_spec());
        konfig.set_progressing();
        let ready = konfig.ready_condition().unwrap();
        assert_eq!(ready.status, "Unknown");
        assert_eq!(ready.reason, "Progressing");
    }

    /// Story: a successful apply records revision, snapshot and readiness
    #[test]
    fn story_set_ready_records_revision_and_snapshot() {
        let mut konfig = sample_konfig(sample_spec());
        let snapshot = Snapshot::new("abc", std::iter::empty());
        konfig.set_ready(
            snapshot,
            "http://fixtures/hello.jsonnet",
            "ReconciliationSucceeded",
            "Applied revision: http://fixtures/hello.jsonnet",
        );

        let status = konfig.status.as_ref().unwrap();
        assert_eq!(status.observed_generation, Some(2));
        assert_eq!(
            status.last_applied_revision.as_deref(),
            Some("http://fixtures/hello.jsonnet")
        );
        assert_eq!(
            status.last_attempted_revision.as_deref(),
            Some("http://fixtures/hello.jsonnet")
        );
        assert!(status.snapshot.is_some());
        assert!(konfig.is_ready());
    }

    /// Story: a failed attempt moves lastAttemptedRevision but not
    /// lastAppliedRevision
    #[test]
    fn story_failure_only_moves_attempted_revision() {
        let mut konfig = sample_konfig(sample_spec());
        let snapshot = Snapshot::new("abc", std::iter::empty());
        konfig.set_ready(snapshot, "rev-1", "ReconciliationSucceeded", "ok");
        konfig.set_not_ready("rev-2", "BuildFailed", "unexpected token");

        let status = konfig.status.as_ref().unwrap();
        assert_eq!(status.last_applied_revision.as_deref(), Some("rev-1"));
        assert_eq!(status.last_attempted_revision.as_deref(), Some("rev-2"));
        assert!(!konfig.is_ready());
    }

    /// Story: dependency gating requires the observed generation to match
    #[test]
    fn story_stale_observed_generation_is_not_ready() {
        let mut konfig = sample_konfig(sample_spec());
        let snapshot = Snapshot::new("abc", std::iter::empty());
        konfig.set_ready(snapshot, "rev-1", "ReconciliationSucceeded", "ok");
        assert!(konfig.is_ready());

        // The spec was edited but the controller has not caught up yet
        konfig.metadata.generation = Some(3);
        assert!(!konfig.is_ready());
    }

    /// Story: the Healthy condition only exists while health checks are
    /// configured
    #[test]
    fn story_healthy_condition_removed_without_checks() {
        let mut spec = sample_spec();
        spec.health_checks = vec![NamespacedObjectKindReference {
            api_version: None,
            kind: "Deployment".to_string(),
            name: "web".to_string(),
            namespace: "app".to_string(),
        }];
        let mut konfig = sample_konfig(spec);
        konfig.set_healthiness("True", "HealthCheckSucceeded", "all current");
        assert!(konfig
            .status
            .as_ref()
            .unwrap()
            .conditions
            .iter()
            .any(|c| c.type_ == HEALTHY_CONDITION));

        konfig.spec.health_checks.clear();
        konfig.set_healthiness("True", "HealthCheckSucceeded", "all current");
        assert!(!konfig
            .status
            .as_ref()
            .unwrap()
            .conditions
            .iter()
            .any(|c| c.type_ == HEALTHY_CONDITION));
    }

    #[test]
    fn test_condition_transition_time_kept_when_status_unchanged() {
        let mut konfig = sample_konfig(sample_spec());
        konfig.set_not_ready("rev", "BuildFailed", "first");
        let first = konfig.ready_condition().unwrap().last_transition_time.clone();
        konfig.set_not_ready("rev", "BuildFailed", "second");
        let second = konfig.ready_condition().unwrap().last_transition_time.clone();
        assert_eq!(first, second);
    }

    #[test]
    fn test_trim_message() {
        assert_eq!(trim_message("short", 10), "short");
        let long = "x".repeat(30);
        let trimmed = trim_message(&long, 10);
        assert_eq!(trimmed, format!("{}...", "x".repeat(10)));
    }

    #[test]
    fn test_validate_defaults_true() {
        let konfig = sample_konfig(sample_spec());
        assert!(konfig.should_validate());
        assert!(!konfig.force_create());
        assert!(!konfig.is_suspended());
        assert!(konfig.gc_enabled());
    }
}
