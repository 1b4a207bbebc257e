//! End-to-end build pipeline tests
//!
//! Exercise the public build surface the way a reconciliation does: write a
//! source tree to disk, evaluate it, and check the canonical output and the
//! snapshot derived from it. No cluster access is required; namespace
//! defaulting is skipped exactly as it is on the CLI show path.

use std::fs;
use std::path::Path;

use jsonnet_controller::crd::{Konfiguration, KonfigurationSpec, Snapshot};
use jsonnet_controller::jsonnet::Builder;

fn konfig(path: &str) -> Konfiguration {
    let spec: KonfigurationSpec = serde_yaml::from_str(&format!(
        "interval: 5m\npath: {path}\nprune: true\n"
    ))
    .unwrap();
    let mut k = Konfiguration::new("web", spec);
    k.metadata.namespace = Some("default".to_string());
    k
}

fn write_hello(dir: &Path) -> String {
    let entry = dir.join("hello.jsonnet");
    fs::write(
        &entry,
        r#"{
  namespace: { apiVersion: 'v1', kind: 'Namespace', metadata: { name: 'app' } },
  deployment: {
    apiVersion: 'apps/v1',
    kind: 'Deployment',
    metadata: { name: 'web', namespace: 'app' },
    spec: { replicas: 2 },
  },
}"#,
    )
    .unwrap();
    entry.to_string_lossy().into_owned()
}

/// The hello build applies the Namespace before the Deployment and indexes
/// them into cluster-scoped and namespaced snapshot entries.
#[test]
fn hello_build_produces_canonical_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let entry = write_hello(dir.path());

    let konfig = konfig(&entry);
    let builder = Builder::new(&konfig, dir.path(), &dir.path().join(".cache")).unwrap();
    let output = builder.build(None, &entry).unwrap();

    let objects = output.sorted_objects();
    assert_eq!(objects.len(), 2);
    assert_eq!(objects[0]["kind"], "Namespace");
    assert_eq!(objects[1]["kind"], "Deployment");

    let snapshot = Snapshot::new(output.sha1_sum().unwrap(), objects.iter());
    assert_eq!(snapshot.entries.len(), 2);
    assert_eq!(snapshot.entries[0].namespace, "");
    assert_eq!(
        snapshot.entries[0].kinds.get("/v1,Namespace").map(String::as_str),
        Some("Namespace")
    );
    assert_eq!(snapshot.entries[1].namespace, "app");
    assert_eq!(
        snapshot.entries[1]
            .kinds
            .get("apps/v1,Deployment")
            .map(String::as_str),
        Some("Deployment")
    );
}

/// Two builds of the same tree agree on stream and checksum; editing the
/// tree moves both.
#[test]
fn checksum_tracks_source_content() {
    let dir = tempfile::tempdir().unwrap();
    let entry = write_hello(dir.path());
    let konfig = konfig(&entry);

    let first = Builder::new(&konfig, dir.path(), &dir.path().join(".cache"))
        .unwrap()
        .build(None, &entry)
        .unwrap();
    let second = Builder::new(&konfig, dir.path(), &dir.path().join(".cache"))
        .unwrap()
        .build(None, &entry)
        .unwrap();
    assert_eq!(first.sha1_sum().unwrap(), second.sha1_sum().unwrap());
    assert_eq!(first.yaml_stream().unwrap(), second.yaml_stream().unwrap());

    fs::write(
        dir.path().join("hello.jsonnet"),
        r#"{ namespace: { apiVersion: 'v1', kind: 'Namespace', metadata: { name: 'app' } } }"#,
    )
    .unwrap();
    let edited = Builder::new(&konfig, dir.path(), &dir.path().join(".cache"))
        .unwrap()
        .build(None, &entry)
        .unwrap();
    assert_ne!(first.sha1_sum().unwrap(), edited.sha1_sum().unwrap());
}

/// The inject snippet composes with the evaluated entry point.
#[test]
fn inject_snippet_extends_the_build() {
    let dir = tempfile::tempdir().unwrap();
    let entry = dir.path().join("main.jsonnet");
    fs::write(
        &entry,
        r#"{ cm: { apiVersion: 'v1', kind: 'ConfigMap', metadata: { name: 'base' }, data: {} } }"#,
    )
    .unwrap();

    let mut konfig = konfig(&entry.to_string_lossy());
    konfig.spec.inject = Some(
        "+ { extra: { apiVersion: 'v1', kind: 'ConfigMap', metadata: { name: 'extra' }, data: {} } }"
            .to_string(),
    );

    let builder = Builder::new(&konfig, dir.path(), &dir.path().join(".cache")).unwrap();
    let output = builder.build(None, &entry.to_string_lossy()).unwrap();
    let names: Vec<&str> = output
        .sorted_objects()
        .iter()
        .filter_map(|o| o.pointer("/metadata/name").and_then(|v| v.as_str()))
        .collect();
    assert_eq!(names, vec!["base", "extra"]);
}

/// A non-object leaf in the evaluated tree fails the walk with its path.
#[test]
fn scalar_output_fails_the_build() {
    let dir = tempfile::tempdir().unwrap();
    let entry = dir.path().join("main.jsonnet");
    fs::write(&entry, r#"{ broken: 42 }"#).unwrap();

    let konfig = konfig(&entry.to_string_lossy());
    let builder = Builder::new(&konfig, dir.path(), &dir.path().join(".cache")).unwrap();
    let err = builder
        .build(None, &entry.to_string_lossy())
        .unwrap_err()
        .to_string();
    assert!(err.contains("broken"), "{err}");
}
