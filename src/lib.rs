//! jsonnet-controller - Kubernetes controller for Jsonnet-defined cluster state
//!
//! The controller continuously reconciles cluster state against desired state
//! declared as Jsonnet. A Konfiguration resource points at a Jsonnet entry
//! point (a path inside a fetched source artifact, or a remote HTTP(S) URL)
//! and a set of evaluation variables; each reconciliation evaluates the
//! Jsonnet, applies the resulting objects server-side, garbage-collects
//! objects that are no longer produced, and tracks the health of a declared
//! subset.
//!
//! # Modules
//!
//! - [`crd`] - The Konfiguration Custom Resource Definition, status helpers,
//!   and build snapshots
//! - [`controller`] - Reconciliation logic and trigger wiring
//! - [`jsonnet`] - The Jsonnet build pipeline (importer, cache, native
//!   functions, canonical output)
//! - [`resources`] - Server-side apply with drift detection and
//!   checksum-scoped garbage collection
//! - [`health`] - Status polling for declared health checks
//! - [`source`] - Source artifact fetching and extraction
//! - [`impersonation`] - Per-Konfiguration API client selection
//! - [`server`] - The TLS dry-run endpoint
//! - [`events`] - Kubernetes event publishing
//! - [`metrics`] - Readiness and suspension gauges
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod health;
pub mod impersonation;
pub mod jsonnet;
pub mod metrics;
pub mod resources;
pub mod server;
pub mod source;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Labels, annotations and identifiers written to managed objects
// =============================================================================
// These constants tie applied objects back to the owning Konfiguration and
// drive garbage collection. Changing them orphans previously applied objects.

/// The field owner used for server-side apply
pub const SERVER_SIDE_APPLY_OWNER: &str = "jsonnet-controller";

/// Label holding the name of the owning Konfiguration
pub const KONFIGURATION_NAME_LABEL: &str = "jsonnet.io/konfiguration-name";

/// Label holding the namespace of the owning Konfiguration
pub const KONFIGURATION_NAMESPACE_LABEL: &str = "jsonnet.io/konfiguration-namespace";

/// Label holding the checksum of the snapshot an object was applied from
pub const KONFIGURATION_CHECKSUM_LABEL: &str = "jsonnet.io/konfiguration-checksum";

/// Annotation holding the checksum of an object's last applied configuration
pub const LAST_APPLIED_CHECKSUM_ANNOTATION: &str = "jsonnet.io/last-applied-checksum";

/// Label or annotation a user can set on an object to exclude it from pruning
pub const RESOURCE_SKIP_PRUNING: &str = "jsonnet.io/prune";

/// The value of [`RESOURCE_SKIP_PRUNING`] that excludes an object from pruning
pub const PRUNING_DISABLED_VALUE: &str = "disabled";

/// The finalizer placed on Konfiguration resources
pub const KONFIGURATION_FINALIZER: &str = "finalizers.jsonnet.io";

/// Annotation a user can bump to request an out-of-band reconciliation
pub const RECONCILE_REQUESTED_ANNOTATION: &str = "jsonnet.io/reconcile-requested-at";

// =============================================================================
// Default configuration
// =============================================================================

/// Default port for the dry-run HTTPS endpoint
pub const DEFAULT_WEB_PORT: u16 = 9443;

/// Default cap on concurrently reconciling Konfigurations
pub const DEFAULT_MAX_CONCURRENT_RECONCILES: usize = 3;

/// Default number of retries when fetching a source artifact
pub const DEFAULT_HTTP_RETRY_MAX: usize = 5;

/// Environment variable overriding the host of source artifact URLs
pub const SOURCE_CONTROLLER_LOCALHOST_ENV: &str = "SOURCE_CONTROLLER_LOCALHOST";
