//! Konfiguration reconciliation
//!
//! One reconciliation drives a Konfiguration from observation to
//! applied-and-healthy: gate on suspension and deletion, resolve
//! dependencies, prepare the source, build the Jsonnet, apply and prune
//! through the resource manager, run health checks, and patch status. Every
//! classified failure records its condition reason and requeues after the
//! retry interval.

use std::sync::Arc;

use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use super::Context;
use crate::crd::{Konfiguration, Snapshot};
use crate::error::reasons;
use crate::events::{actions, ExternalEvent};
use crate::health::{ClusterStatusReader, HealthCheck, DEFAULT_POLL_INTERVAL};
use crate::impersonation::{discovery, Impersonation};
use crate::jsonnet::{Builder, NamespaceDefaulter};
use crate::metrics;
use crate::resources::ResourceManager;
use crate::source::SourcePreparer;
use crate::{Error, Result, KONFIGURATION_FINALIZER};

/// Reconcile one Konfiguration.
pub async fn reconcile(konfig: Arc<Konfiguration>, ctx: Arc<Context>) -> Result<Action> {
    let mut konfig = (*konfig).clone();
    let name = konfig.namespaced_name();
    info!(konfiguration = %name, "Reconciling konfiguration");

    metrics::record_suspension(&konfig);

    // The finalizer must be in place before anything is applied, so the
    // delete path can prune what previous cycles created
    if konfig.metadata.deletion_timestamp.is_none() && !has_finalizer(&konfig) {
        add_finalizer(&ctx, &mut konfig).await?;
    }

    if konfig.metadata.deletion_timestamp.is_some() {
        return finalize(&ctx, &mut konfig).await;
    }

    if konfig.is_suspended() {
        debug!(konfiguration = %name, "Konfiguration is suspended, skipping");
        return Ok(Action::requeue(konfig.interval()));
    }

    // Keep the source index current so revision changes find us
    ctx.source_index.register(&konfig);

    konfig.set_progressing();
    patch_status(&ctx, &konfig).await?;

    // Prepare the source
    let preparer = SourcePreparer::new(ctx.client.clone(), ctx.opts.http_retry_max);
    let prepared = match preparer.prepare(&konfig).await {
        Ok(prepared) => prepared,
        Err(e) => {
            warn!(konfiguration = %name, error = %e, "Failed to prepare source");
            return fail(&ctx, &mut konfig, "", &e).await;
        }
    };
    let revision = prepared.revision.clone();

    // Gate on dependencies before doing any build work
    if let Err(e) = check_dependencies(&ctx, &konfig).await {
        info!(konfiguration = %name, error = %e, "Dependencies are not ready");
        konfig.set_not_ready(&revision, e.reason(), &e.to_string());
        patch_status(&ctx, &konfig).await?;
        metrics::record_readiness(&konfig);
        emit(&ctx, &konfig, EventType::Normal, &e.to_string(), &revision).await;
        return Ok(Action::requeue(ctx.opts.dependency_requeue_interval));
    }

    // Select the client this Konfiguration reconciles with
    let mut impersonation = Impersonation::new(&konfig, ctx.client.clone());
    let impersonated = match impersonation.client().await {
        Ok(client) => client,
        Err(e) => return fail(&ctx, &mut konfig, &revision, &e).await,
    };
    let discovery = match discovery(&impersonated).await {
        Ok(discovery) => Arc::new(discovery),
        Err(e) => return fail(&ctx, &mut konfig, &revision, &e).await,
    };

    // Build
    let output = {
        let builder = match Builder::new(&konfig, prepared.workdir(), &ctx.opts.jsonnet_cache_dir) {
            Ok(builder) => builder,
            Err(e) => return fail(&ctx, &mut konfig, &revision, &e).await,
        };
        let defaulter = NamespaceDefaulter::new(
            discovery.clone(),
            konfig.metadata.namespace.clone().unwrap_or_default(),
        );
        let path = prepared.path.clone();
        let build = tokio::task::spawn_blocking(move || builder.build(Some(&defaulter), &path));
        match tokio::time::timeout(konfig.timeout(), build).await {
            Err(_) => {
                let e = Error::build(format!("build timed out after {:?}", konfig.timeout()));
                return fail(&ctx, &mut konfig, &revision, &e).await;
            }
            Ok(Err(join_error)) => {
                let e = Error::build(format!("build task failed: {join_error}"));
                return fail(&ctx, &mut konfig, &revision, &e).await;
            }
            Ok(Ok(Err(e))) => {
                warn!(konfiguration = %name, error = %e, "Build failed");
                return fail(&ctx, &mut konfig, &revision, &e).await;
            }
            Ok(Ok(Ok(output))) => output,
        }
    };

    let checksum = match output.sha1_sum() {
        Ok(checksum) => checksum.to_string(),
        Err(e) => return fail(&ctx, &mut konfig, &revision, &e).await,
    };
    let snapshot = Snapshot::new(checksum.clone(), output.sorted_objects());
    let last_snapshot = konfig.status.as_ref().and_then(|s| s.snapshot.clone());

    // Apply
    let manager = ResourceManager::new(impersonated.clone(), discovery.clone(), &konfig);
    let changeset = match manager.reconcile_objects(&snapshot, output.sorted_objects()).await {
        Ok(changeset) => changeset,
        Err(e) => {
            warn!(konfiguration = %name, error = %e, "Apply failed");
            return fail(&ctx, &mut konfig, &revision, &e).await;
        }
    };
    if changeset.has_mutations() {
        info!(konfiguration = %name, "Applied objects:\n{changeset}");
    }

    // Garbage-collect what the new build no longer produces
    if konfig.gc_enabled() {
        let (prune_set, success) = manager.prune(last_snapshot.as_ref(), Some(&snapshot)).await;
        if !prune_set.is_empty() {
            info!(konfiguration = %name, "Pruned objects:\n{prune_set}");
        }
        if !success {
            let e = Error::prune(prune_set.to_string());
            konfig.set_not_ready_snapshot(snapshot, &revision, e.reason(), &e.to_string());
            patch_status(&ctx, &konfig).await?;
            metrics::record_readiness(&konfig);
            emit(&ctx, &konfig, EventType::Warning, &e.to_string(), &revision).await;
            return Ok(Action::requeue(konfig.retry_interval()));
        }
    }

    // Health checks run only when declared; otherwise the condition is
    // removed from status
    if konfig.spec.health_checks.is_empty() {
        konfig.set_healthiness("True", reasons::RECONCILIATION_SUCCEEDED, "no health checks");
    } else {
        let reader = ClusterStatusReader::new(impersonated, discovery.clone());
        let check = HealthCheck::new(&konfig, Box::new(reader));
        match check.assess(DEFAULT_POLL_INTERVAL).await {
            Ok(()) => {
                konfig.set_healthiness(
                    "True",
                    reasons::RECONCILIATION_SUCCEEDED,
                    "all health checks passed",
                );
            }
            Err(e) => {
                warn!(konfiguration = %name, error = %e, "Health check failed");
                konfig.set_healthiness("False", e.reason(), &e.to_string());
                konfig.set_not_ready_snapshot(snapshot, &revision, e.reason(), &e.to_string());
                patch_status(&ctx, &konfig).await?;
                metrics::record_readiness(&konfig);
                emit(&ctx, &konfig, EventType::Warning, &e.to_string(), &revision).await;
                return Ok(Action::requeue(konfig.retry_interval()));
            }
        }
    }

    // Success
    let checksum_changed = last_snapshot.map(|s| s.checksum) != Some(checksum.clone());
    let message = format!("Applied revision: {revision}");
    konfig.set_ready(snapshot, &revision, reasons::RECONCILIATION_SUCCEEDED, &message);
    patch_status(&ctx, &konfig).await?;
    metrics::record_readiness(&konfig);

    if checksum_changed {
        emit(&ctx, &konfig, EventType::Normal, &message, &revision).await;
    }

    Ok(Action::requeue(konfig.interval()))
}

/// The requeue policy for unhandled errors
pub fn error_policy(konfig: Arc<Konfiguration>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(
        konfiguration = %konfig.namespaced_name(),
        error = %error,
        "Reconciliation returned an error, requeueing"
    );
    Action::requeue(konfig.retry_interval())
}

/// Record a classified failure: status condition, metrics, warning event,
/// requeue after the retry interval.
async fn fail(
    ctx: &Context,
    konfig: &mut Konfiguration,
    revision: &str,
    error: &Error,
) -> Result<Action> {
    konfig.set_not_ready(revision, error.reason(), &error.to_string());
    patch_status(ctx, konfig).await?;
    metrics::record_readiness(konfig);
    emit(ctx, konfig, EventType::Warning, &error.to_string(), revision).await;
    Ok(Action::requeue(konfig.retry_interval()))
}

/// The delete path: prune everything in the last snapshot (when pruning is
/// enabled and the Konfiguration is not suspended), then release the
/// finalizer.
async fn finalize(ctx: &Context, konfig: &mut Konfiguration) -> Result<Action> {
    let name = konfig.namespaced_name();
    info!(konfiguration = %name, "Finalizing konfiguration");

    let last_snapshot = konfig.status.as_ref().and_then(|s| s.snapshot.clone());

    if konfig.gc_enabled() && !konfig.is_suspended() && last_snapshot.is_some() {
        // Rebuild the impersonated client; owned objects may live on a
        // remote cluster
        let mut impersonation = Impersonation::new(konfig, ctx.client.clone());
        let client = impersonation.client().await?;
        let discovery = Arc::new(discovery(&client).await?);
        let manager = ResourceManager::new(client, discovery, konfig);

        // A nil new snapshot orphans everything the last snapshot tracked
        let (changeset, success) = manager.prune(last_snapshot.as_ref(), None).await;
        if !changeset.is_empty() {
            info!(konfiguration = %name, "Pruned objects:\n{changeset}");
        }
        if !success {
            let e = Error::prune(changeset.to_string());
            emit(ctx, konfig, EventType::Warning, &e.to_string(), "").await;
            return Err(e);
        }
    }

    remove_finalizer(ctx, konfig).await?;
    metrics::record_readiness(konfig);
    Ok(Action::await_change())
}

async fn check_dependencies(ctx: &Context, konfig: &Konfiguration) -> Result<()> {
    for dep in &konfig.spec.depends_on {
        let namespace = dep
            .namespace
            .clone()
            .or_else(|| konfig.metadata.namespace.clone())
            .unwrap_or_default();
        let dep_name = format!("{namespace}/{}", dep.name);
        debug!("Checking dependency '{dep_name}'");

        let api: Api<Konfiguration> = Api::namespaced(ctx.client.clone(), &namespace);
        // A missing dependency is not-ready, not fatal
        let Some(dependency) = api.get_opt(&dep.name).await? else {
            return Err(Error::dependency_not_ready_because(&dep_name, "not found"));
        };
        if !dependency.is_ready() {
            return Err(Error::dependency_not_ready(&dep_name));
        }
    }
    Ok(())
}

fn has_finalizer(konfig: &Konfiguration) -> bool {
    konfig
        .finalizers()
        .iter()
        .any(|f| f == KONFIGURATION_FINALIZER)
}

async fn add_finalizer(ctx: &Context, konfig: &mut Konfiguration) -> Result<()> {
    let mut finalizers = konfig.finalizers().to_vec();
    finalizers.push(KONFIGURATION_FINALIZER.to_string());
    patch_finalizers(ctx, konfig, finalizers).await
}

async fn remove_finalizer(ctx: &Context, konfig: &mut Konfiguration) -> Result<()> {
    let finalizers: Vec<String> = konfig
        .finalizers()
        .iter()
        .filter(|f| *f != KONFIGURATION_FINALIZER)
        .cloned()
        .collect();
    patch_finalizers(ctx, konfig, finalizers).await
}

async fn patch_finalizers(
    ctx: &Context,
    konfig: &mut Konfiguration,
    finalizers: Vec<String>,
) -> Result<()> {
    let api = konfig_api(ctx, konfig);
    let name = konfig.name_any();
    let patch = serde_json::json!({"metadata": {"finalizers": finalizers}});
    let patched = api
        .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    konfig.metadata.finalizers = patched.metadata.finalizers;
    Ok(())
}

/// Patch the status subresource with the Konfiguration's current status
async fn patch_status(ctx: &Context, konfig: &Konfiguration) -> Result<()> {
    let api = konfig_api(ctx, konfig);
    let name = konfig.name_any();
    let patch = serde_json::json!({"status": konfig.status});
    api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

fn konfig_api(ctx: &Context, konfig: &Konfiguration) -> Api<Konfiguration> {
    match konfig.metadata.namespace.as_deref() {
        Some(namespace) => Api::namespaced(ctx.client.clone(), namespace),
        None => Api::default_namespaced(ctx.client.clone()),
    }
}

/// Emit a normal event locally and, when configured, forward a structured
/// event to the external receiver. The external reason is taken from the
/// current Ready condition.
async fn emit(
    ctx: &Context,
    konfig: &Konfiguration,
    type_: EventType,
    message: &str,
    revision: &str,
) {
    let reason = konfig
        .ready_condition()
        .map(|c| c.reason.clone())
        .unwrap_or_else(|| reasons::PROGRESSING.to_string());

    let object_ref = konfig.object_ref(&());
    ctx.events
        .publish(
            &object_ref,
            type_.clone(),
            &reason,
            actions::RECONCILE,
            Some(message.to_string()),
        )
        .await;

    if let Some(sink) = &ctx.external_events {
        let mut metadata = std::collections::BTreeMap::new();
        if !revision.is_empty() {
            metadata.insert("revision".to_string(), revision.to_string());
        }
        let severity = match type_ {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        };
        sink.post(ExternalEvent {
            involved_object: object_ref,
            severity: severity.to_string(),
            reason,
            message: message.to_string(),
            reporting_controller: crate::events::CONTROLLER_NAME.to_string(),
            metadata,
        })
        .await;
    }
}
