//! The Jsonnet build pipeline
//!
//! Turns a Konfiguration and an entry point (a filesystem path inside a
//! prepared source, or a remote URL) into a deterministic, sorted stream of
//! Kubernetes objects:
//!
//! 1. [`builder`] configures the VM: native functions, variables, and the
//!    universal importer, then synthesizes and evaluates the top-level
//!    expression.
//! 2. [`walk`] flattens the evaluated tree into the objects it contains.
//! 3. [`output`] sorts the objects canonically and produces the YAML stream
//!    and its SHA-1 checksum.
//!
//! Imports resolve through [`importer`] over `file://`, `http(s)://` and
//! the embedded `internal:///` scheme, with remote assets cached on disk by
//! [`cache`].

mod builder;
mod cache;
mod helm;
mod importer;
mod name_format;
mod native;
mod output;
mod vals;
mod walk;

pub use builder::{Builder, NamespaceDefaulter};
pub use cache::HttpCache;
pub use importer::UniversalImporter;
pub use name_format::render_name_format;
pub use native::parse_yaml_stream;
pub use output::{hex_sha1, BuildOutput};
pub use walk::json_walk;

/// The default helm object key template, compatible with Tanka
pub const DEFAULT_NAME_FORMAT: &str = r#"{{ print .kind "_" .metadata.name | snakecase }}"#;
