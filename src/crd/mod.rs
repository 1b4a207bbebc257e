//! Custom Resource Definitions for the jsonnet-controller
//!
//! The only resource this controller owns is the [`Konfiguration`]. The
//! referenced source kinds (GitRepository, Bucket) belong to an external
//! source controller and are only read here.

mod konfiguration;
mod snapshot;
mod types;

pub use konfiguration::{Konfiguration, KonfigurationSpec, KonfigurationStatus};
pub use snapshot::{gvk_key, Snapshot, SnapshotEntry};
pub use types::{
    CrossNamespaceSourceReference, DependencyReference, KubeConfigRef, LocalObjectReference,
    NamespacedObjectKindReference, SourceKind, Variables,
};

/// The canonical Ready condition type
pub const READY_CONDITION: &str = "Ready";

/// The condition type recording the last health assessment result
pub const HEALTHY_CONDITION: &str = "Healthy";

/// Terminal condition messages are truncated to this many characters
pub const MAX_CONDITION_MESSAGE_LENGTH: usize = 20_000;
