//! Kubernetes Event recording for the Konfiguration controller.
//!
//! Normal events always go to the cluster's event recorder so they are
//! visible via `kubectl describe`. When an external events receiver is
//! configured (`--events-addr`), a structured event carrying the revision
//! and the current Ready reason is forwarded there as well.
//!
//! Events are fire-and-forget: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use serde::Serialize;
use tracing::warn;

/// The controller name reported on events
pub const CONTROLLER_NAME: &str = "jsonnet-controller";

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as the controller
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: CONTROLLER_NAME.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
        // intentionally empty
    }
}

/// The payload posted to an external events receiver
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalEvent {
    /// The object the event concerns
    pub involved_object: ObjectReference,
    /// `Normal` or `Warning`
    pub severity: String,
    /// Machine-readable reason, taken from the current Ready condition
    pub reason: String,
    /// Human-readable message
    pub message: String,
    /// Reporting controller name
    pub reporting_controller: String,
    /// Extra metadata; always carries the revision when one is known
    pub metadata: BTreeMap<String, String>,
}

/// Forwards structured events to an external receiver over HTTP
pub struct ExternalEventSink {
    address: String,
    client: reqwest::Client,
}

impl ExternalEventSink {
    /// Create a sink posting to the given address
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Post the event; failures are logged, never returned.
    pub async fn post(&self, event: ExternalEvent) {
        let result = self.client.post(&self.address).json(&event).send().await;
        match result {
            Ok(response) if !response.status().is_success() => {
                warn!(address = %self.address, status = %response.status(), "External event receiver rejected event");
            }
            Err(e) => {
                warn!(address = %self.address, error = %e, "Failed to forward event");
            }
            Ok(_) => {}
        }
    }
}

/// Well-known event action strings.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Deleting owned resources ahead of finalizer release
    pub const DELETE: &str = "Delete";
}
