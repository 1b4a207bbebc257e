//! Content fetching for the universal importer
//!
//! Serves three URL schemes: `file://` reads the filesystem, `internal:///`
//! serves the embedded helper library, and `http(s)://` fetches through an
//! on-disk cache at `<cacheDir>/<host>/<path>`. The cache has no eviction;
//! writes are idempotent so concurrent writers of the same URL are safe.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::{Error, Result};

/// The embedded helper library, importable as `internal:///kubecfg.libsonnet`
const KUBECFG_LIBSONNET: &str = include_str!("../../lib/kubecfg.libsonnet");

/// The canonical internal URL of the embedded helper library
const KUBECFG_INTERNAL_URL: &str = "internal:///lib/kubecfg.libsonnet";

/// The outcome of a fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetch {
    /// The URL resolved to content
    Contents(Vec<u8>),
    /// The URL does not exist; candidate enumeration may continue
    NotFound,
}

/// Fetches import contents, caching remote assets on disk
pub struct HttpCache {
    cache_dir: PathBuf,
    client: reqwest::blocking::Client,
}

impl HttpCache {
    /// Create a cache writing remote assets below the given directory
    pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| Error::internal_with_context("importer", e.to_string()))?;
        Ok(Self {
            cache_dir: cache_dir.into(),
            client,
        })
    }

    /// Fetch the contents of the given URL.
    pub fn get(&self, url: &str) -> Result<Fetch> {
        if let Some(rest) = url.strip_prefix("internal://") {
            return Ok(internal_contents(rest));
        }
        if let Some(path) = url.strip_prefix("file://") {
            return read_local(Path::new(path));
        }
        if is_http(url) {
            return self.get_remote(url);
        }
        // No scheme: a plain filesystem path
        read_local(Path::new(url))
    }

    fn get_remote(&self, url: &str) -> Result<Fetch> {
        let local = self.local_path(url);
        if let Ok(bytes) = fs::read(&local) {
            debug!(url, cache = %local.display(), "Import served from cache");
            return Ok(Fetch::Contents(bytes));
        }

        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| Error::build(format!("error fetching {url}: {e}")))?;
        let status = response.status();
        debug!(url, status = %status, "GET import");

        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(Fetch::NotFound);
        }
        if !status.is_success() {
            return Err(Error::build(format!("error reading content: {url}: {status}")));
        }

        let bytes = response
            .bytes()
            .map_err(|e| Error::build(format!("error reading {url}: {e}")))?
            .to_vec();

        if let Err(e) = self.write_to_cache(&local, &bytes) {
            warn!(url, error = %e, "Error writing import to the local cache");
        }

        Ok(Fetch::Contents(bytes))
    }

    fn local_path(&self, url: &str) -> PathBuf {
        let trimmed = url
            .trim_start_matches("https://")
            .trim_start_matches("http://");
        self.cache_dir.join(trimmed)
    }

    fn write_to_cache(&self, local: &Path, contents: &[u8]) -> Result<()> {
        let dir = local
            .parent()
            .ok_or_else(|| Error::internal_with_context("importer", "cache path has no parent"))?;
        fs::create_dir_all(dir)
            .map_err(|e| Error::internal_with_context("importer", e.to_string()))?;
        fs::write(local, contents).map_err(|e| Error::internal_with_context("importer", e.to_string()))
    }
}

fn is_http(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Serve an `internal://` path from the embedded filesystem.
///
/// Contents are rooted at `/lib`; the synthetic short path
/// `kubecfg.libsonnet` maps onto `internal:///lib/kubecfg.libsonnet`.
fn internal_contents(rest: &str) -> Fetch {
    let name = rest.trim_start_matches('/').trim_start_matches("lib/");
    let normalized = if name.ends_with("kubecfg.libsonnet") {
        KUBECFG_INTERNAL_URL.to_string()
    } else {
        format!("internal:///lib/{name}")
    };
    if normalized == KUBECFG_INTERNAL_URL {
        Fetch::Contents(KUBECFG_LIBSONNET.as_bytes().to_vec())
    } else {
        Fetch::NotFound
    }
}

fn read_local(path: &Path) -> Result<Fetch> {
    match fs::read(path) {
        Ok(bytes) => Ok(Fetch::Contents(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Fetch::NotFound),
        Err(e) => Err(Error::build(format!(
            "error reading {}: {e}",
            path.display()
        ))),
    }
}
