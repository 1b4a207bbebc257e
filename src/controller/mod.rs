//! Konfiguration controller wiring
//!
//! Builds the reconcile loop: a predicate-filtered watch on Konfigurations
//! (spec generation changes and reconcile-request annotation bumps) plus
//! dynamic watches on GitRepository and Bucket objects that fan out to the
//! Konfigurations referencing them through the in-process source index.

mod konfiguration;
mod leader;

pub use konfiguration::{error_policy, reconcile};
pub use leader::{LeaderElector, LeaderGuard, LEADER_LEASE_NAME};

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::StreamExt;
use kube::api::{Api, DynamicObject};
use kube::runtime::controller::{Config as ControllerConfig, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use tracing::{debug, error, info};

use crate::crd::{Konfiguration, SourceKind};
use crate::events::{EventPublisher, ExternalEventSink};
use crate::source::source_api_resource;
use crate::{Result, RECONCILE_REQUESTED_ANNOTATION};

/// Tunables surfaced as process flags
#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    /// Maximum number of times to retry fetching a source artifact
    pub http_retry_max: usize,
    /// Number of reconciliations allowed to run at a time
    pub max_concurrent_reconciles: usize,
    /// The interval at which failing dependencies are reevaluated
    pub dependency_requeue_interval: Duration,
    /// The directory jsonnet HTTP assets are cached under
    pub jsonnet_cache_dir: PathBuf,
    /// The per-request deadline of the dry-run endpoint
    pub dry_run_timeout: Duration,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            http_retry_max: crate::DEFAULT_HTTP_RETRY_MAX,
            max_concurrent_reconciles: crate::DEFAULT_MAX_CONCURRENT_RECONCILES,
            dependency_requeue_interval: Duration::from_secs(30),
            jsonnet_cache_dir: PathBuf::from("/cache"),
            dry_run_timeout: Duration::from_secs(10),
        }
    }
}

/// A source object key in the source index
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceKey {
    /// Kind of the source object
    pub kind: SourceKind,
    /// Namespace of the source object
    pub namespace: String,
    /// Name of the source object
    pub name: String,
}

/// Maps source objects to the Konfigurations referencing them, along with
/// the revision each one last attempted.
///
/// Maintained by the reconciler (each reconciliation registers its current
/// sourceRef and last attempted revision) and read by the watch mappers to
/// fan a source revision change out to the dependents that have not
/// attempted it yet.
#[derive(Default, Clone)]
pub struct SourceIndex {
    inner: Arc<RwLock<HashMap<SourceKey, HashMap<(String, String), Option<String>>>>>,
}

impl SourceIndex {
    /// Register the Konfiguration's current source reference and last
    /// attempted revision, dropping any previous registration
    pub fn register(&self, konfig: &Konfiguration) {
        let key = (
            konfig.metadata.namespace.clone().unwrap_or_default(),
            konfig.metadata.name.clone().unwrap_or_default(),
        );
        let source = konfig.source_ref().map(|r| SourceKey {
            kind: r.kind,
            namespace: r.namespace.unwrap_or_default(),
            name: r.name,
        });
        let revision = konfig
            .status
            .as_ref()
            .and_then(|s| s.last_attempted_revision.clone());

        let mut inner = self.inner.write().expect("source index poisoned");
        for dependents in inner.values_mut() {
            dependents.remove(&key);
        }
        if let Some(source) = source {
            inner.entry(source).or_default().insert(key, revision);
        }
    }

    /// The Konfigurations referencing the given source whose last attempted
    /// revision differs from the given one. A `None` revision matches
    /// every dependent.
    pub fn dependents_behind(
        &self,
        source: &SourceKey,
        revision: Option<&str>,
    ) -> Vec<(String, String)> {
        self.inner
            .read()
            .expect("source index poisoned")
            .get(source)
            .map(|deps| {
                deps.iter()
                    .filter(|(_, attempted)| match revision {
                        Some(revision) => attempted.as_deref() != Some(revision),
                        None => true,
                    })
                    .map(|(key, _)| key.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Shared state passed to every reconciliation
pub struct Context {
    /// The controller's own client
    pub client: Client,
    /// Event publisher for normal Kubernetes events
    pub events: Arc<dyn EventPublisher>,
    /// Optional external events receiver
    pub external_events: Option<Arc<ExternalEventSink>>,
    /// The source index backing revision-change fan-out
    pub source_index: SourceIndex,
    /// Reconcile tuning
    pub opts: ReconcilerOptions,
}

/// The watch trigger: reconcile when the spec generation moves or when a
/// user bumps the reconcile-request annotation.
fn trigger_hash(konfig: &Konfiguration) -> Option<u64> {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    konfig.metadata.generation.hash(&mut hasher);
    konfig
        .annotations()
        .get(RECONCILE_REQUESTED_ANNOTATION)
        .hash(&mut hasher);
    // Deletion must always pass the filter so finalizers run
    konfig.metadata.deletion_timestamp.is_some().hash(&mut hasher);
    Some(hasher.finish())
}

fn source_mapper(
    index: SourceIndex,
    kind: SourceKind,
) -> impl Fn(DynamicObject) -> Vec<ObjectRef<Konfiguration>> {
    move |source: DynamicObject| {
        let key = SourceKey {
            kind,
            namespace: source.metadata.namespace.clone().unwrap_or_default(),
            name: source.metadata.name.clone().unwrap_or_default(),
        };
        let revision = source
            .data
            .pointer("/status/artifact/revision")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let dependents = index.dependents_behind(&key, revision.as_deref());
        if !dependents.is_empty() {
            debug!(
                source = %format!("{kind}/{}/{}", key.namespace, key.name),
                revision = revision.as_deref().unwrap_or_default(),
                count = dependents.len(),
                "Source revision changed, triggering dependents"
            );
        }
        dependents
            .into_iter()
            .map(|(namespace, name)| ObjectRef::new(&name).within(&namespace))
            .collect()
    }
}

/// Run the Konfiguration controller until shutdown.
pub async fn run(ctx: Arc<Context>, watch_namespace: Option<String>) -> Result<()> {
    let client = ctx.client.clone();
    let api: Api<Konfiguration> = match &watch_namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    };

    let (reader, writer) = reflector::store();
    let triggers = watcher(api, WatcherConfig::default())
        .default_backoff()
        .reflect(writer)
        .applied_objects()
        .predicate_filter(trigger_hash);

    let git_resource = source_api_resource(SourceKind::GitRepository);
    let bucket_resource = source_api_resource(SourceKind::Bucket);
    let git_api: Api<DynamicObject> = Api::all_with(client.clone(), &git_resource);
    let bucket_api: Api<DynamicObject> = Api::all_with(client.clone(), &bucket_resource);

    info!(
        concurrency = ctx.opts.max_concurrent_reconciles,
        "Starting Konfiguration controller"
    );

    Controller::for_stream(triggers, reader)
        .with_config(
            ControllerConfig::default().concurrency(ctx.opts.max_concurrent_reconciles as u16),
        )
        .watches_with(
            git_api,
            git_resource,
            WatcherConfig::default(),
            source_mapper(ctx.source_index.clone(), SourceKind::GitRepository),
        )
        .watches_with(
            bucket_api,
            bucket_resource,
            WatcherConfig::default(),
            source_mapper(ctx.source_index.clone(), SourceKind::Bucket),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(konfiguration = %obj, ?action, "Reconciliation completed");
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation error");
                }
            }
        })
        .await;

    info!("Konfiguration controller shutting down");
    Ok(())
}
