//! Source preparation
//!
//! Resolves where a Konfiguration's Jsonnet actually lives. Without a
//! `sourceRef` the spec path is used as-is (an HTTP(S) URL) and doubles as
//! the revision. With one, the referenced source object's artifact is
//! downloaded with retries, unpacked into a per-reconciliation temp
//! directory, and the spec path is joined inside it without ever escaping
//! the tree.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use kube::api::{Api, ApiResource, DynamicObject};
use kube::Client;
use tempfile::TempDir;
use tracing::{debug, info, warn};
use url::Url;

use crate::crd::{CrossNamespaceSourceReference, Konfiguration, SourceKind};
use crate::{Error, Result, SOURCE_CONTROLLER_LOCALHOST_ENV};

/// Minimum and maximum backoff between artifact fetch retries
const RETRY_WAIT_MIN: Duration = Duration::from_secs(5);
const RETRY_WAIT_MAX: Duration = Duration::from_secs(30);

/// A prepared source: the resolved entry path, the revision it represents,
/// and the working directory backing them. Dropping the value removes the
/// working directory.
pub struct PreparedSource {
    /// The revision being reconciled: the artifact revision, or the path
    /// URL when no source is configured
    pub revision: String,
    /// The resolved entry path to hand to the builder
    pub path: String,
    workdir: TempDir,
}

impl PreparedSource {
    /// The directory jsonnet search paths are resolved against
    pub fn workdir(&self) -> &Path {
        self.workdir.path()
    }
}

/// Fetches and unpacks source artifacts
#[derive(Clone)]
pub struct SourcePreparer {
    client: Client,
    http: reqwest::Client,
    http_retry_max: usize,
}

impl SourcePreparer {
    /// Create a preparer reading source objects with the given client
    pub fn new(client: Client, http_retry_max: usize) -> Self {
        Self {
            client,
            http: reqwest::Client::new(),
            http_retry_max,
        }
    }

    /// Prepare the source for the given Konfiguration.
    pub async fn prepare(&self, konfig: &Konfiguration) -> Result<PreparedSource> {
        let name = konfig.metadata.name.as_deref().unwrap_or("konfiguration");
        let nn = konfig.namespaced_name();
        let workdir = tempfile::Builder::new()
            .prefix(name)
            .tempdir()
            .map_err(|e| Error::storage(&nn, format!("could not allocate a temp directory: {e}")))?;

        let Some(source_ref) = konfig.source_ref() else {
            return Ok(PreparedSource {
                revision: konfig.path(),
                path: konfig.path(),
                workdir,
            });
        };

        let artifact = self.fetch_artifact(&nn, &source_ref).await?;
        debug!(source = %source_ref, revision = %artifact.revision, "Resolved source artifact");

        self.download_and_extract(&nn, &artifact, workdir.path())
            .await?;

        let joined = secure_join(workdir.path(), &konfig.path())
            .map_err(|e| Error::artifact(&nn, e.to_string()))?;

        Ok(PreparedSource {
            revision: artifact.revision,
            path: joined.to_string_lossy().into_owned(),
            workdir,
        })
    }

    async fn fetch_artifact(
        &self,
        nn: &str,
        source_ref: &CrossNamespaceSourceReference,
    ) -> Result<Artifact> {
        let ar = source_api_resource(source_ref.kind);
        let namespace = source_ref.namespace.as_deref().unwrap_or_default();
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);

        let source = api
            .get_opt(&source_ref.name)
            .await?
            .ok_or_else(|| Error::artifact(nn, format!("Source '{source_ref}' not found")))?;

        let artifact = source.data.pointer("/status/artifact").cloned().ok_or_else(|| {
            Error::artifact(nn, "source is not ready, artifact not found".to_string())
        })?;

        let url = artifact
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::artifact(nn, "artifact has no url".to_string()))?
            .to_string();
        let revision = artifact
            .get("revision")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        Ok(Artifact { url, revision })
    }

    async fn download_and_extract(&self, nn: &str, artifact: &Artifact, dst: &Path) -> Result<()> {
        let mut url = artifact.url.clone();
        if let Ok(host) = std::env::var(SOURCE_CONTROLLER_LOCALHOST_ENV) {
            url = rewrite_host(&url, &host).map_err(|e| Error::artifact(nn, e.to_string()))?;
        }

        let bytes = self.fetch_with_retries(nn, &url).await?;

        info!(url = %url, bytes = bytes.len(), "Unpacking source artifact");
        let dst = dst.to_path_buf();
        let nn_owned = nn.to_string();
        tokio::task::spawn_blocking(move || untar(&bytes, &dst))
            .await
            .map_err(|e| Error::storage(&nn_owned, format!("untar task failed: {e}")))?
            .map_err(|e| Error::artifact(&nn_owned, format!("failed to untar artifact: {e}")))
    }

    async fn fetch_with_retries(&self, nn: &str, url: &str) -> Result<Vec<u8>> {
        let mut wait = RETRY_WAIT_MIN;
        let mut last_error = String::new();

        for attempt in 0..=self.http_retry_max {
            if attempt > 0 {
                tokio::time::sleep(wait).await;
                wait = std::cmp::min(wait * 2, RETRY_WAIT_MAX);
            }

            match self.http.get(url).send().await {
                Ok(response) if response.status().is_success() => {
                    return response
                        .bytes()
                        .await
                        .map(|b| b.to_vec())
                        .map_err(|e| Error::artifact(nn, format!("failed to read artifact: {e}")));
                }
                Ok(response) => {
                    last_error = format!(
                        "failed to download artifact from {url}, status: {}",
                        response.status()
                    );
                }
                Err(e) => {
                    last_error = format!("failed to download artifact, error: {e}");
                }
            }
            warn!(url, attempt, error = %last_error, "Artifact fetch failed");
        }

        Err(Error::artifact(nn, last_error))
    }
}

struct Artifact {
    url: String,
    revision: String,
}

/// The dynamic API resource for a source kind
pub fn source_api_resource(kind: SourceKind) -> ApiResource {
    let (kind_str, plural) = match kind {
        SourceKind::GitRepository => ("GitRepository", "gitrepositories"),
        SourceKind::Bucket => ("Bucket", "buckets"),
    };
    ApiResource {
        group: "source.toolkit.fluxcd.io".to_string(),
        version: "v1beta1".to_string(),
        kind: kind_str.to_string(),
        api_version: kind.api_version().to_string(),
        plural: plural.to_string(),
    }
}

fn rewrite_host(url: &str, host: &str) -> Result<String> {
    let mut parsed =
        Url::parse(url).map_err(|e| Error::internal(format!("invalid artifact url {url:?}: {e}")))?;
    let (hostname, port) = match host.split_once(':') {
        Some((h, p)) => (
            h,
            Some(p.parse::<u16>().map_err(|e| {
                Error::internal(format!("invalid host override {host:?}: {e}"))
            })?),
        ),
        None => (host, None),
    };
    parsed
        .set_host(Some(hostname))
        .map_err(|e| Error::internal(format!("invalid host override {host:?}: {e}")))?;
    parsed
        .set_port(port)
        .map_err(|()| Error::internal(format!("invalid host override {host:?}")))?;
    Ok(parsed.into())
}

fn untar(bytes: &[u8], dst: &Path) -> std::io::Result<()> {
    let decoder = flate2::read::GzDecoder::new(bytes);
    let mut archive = tar::Archive::new(decoder);
    archive.unpack(dst)
}

/// Join a user-supplied path below a root such that the result can never
/// escape the root's tree: absolute prefixes are stripped and `..`
/// components cannot climb above the root.
pub fn secure_join(root: &Path, user_path: &str) -> Result<PathBuf> {
    let mut sanitized = PathBuf::new();
    for component in Path::new(user_path).components() {
        match component {
            Component::Normal(part) => sanitized.push(part),
            Component::ParentDir => {
                sanitized.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    Ok(root.join(sanitized))
}
