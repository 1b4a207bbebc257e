//! Universal importer
//!
//! Resolves Jsonnet `import`/`importstr` statements over `file://`,
//! `http(s)://` and the embedded `internal:///` scheme. A relative import
//! is resolved against the importing file first, then against each
//! configured base search URL in order; the first existing URL wins, and
//! the tried candidates are reported on failure. Resolved URLs are carried
//! as virtual source paths through the evaluator.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;

use jrsonnet_evaluator::error::{ErrorKind, Result as JrResult};
use jrsonnet_evaluator::ImportResolver;
use jrsonnet_parser::{SourcePath, SourceVirtual};
use url::Url;

use super::cache::{Fetch, HttpCache};
use crate::{Error, Result};

/// Importer over the three URL schemes with an in-process content cache
#[derive(jrsonnet_gcmodule::Trace)]
pub struct UniversalImporter {
    #[trace(skip)]
    base_search_urls: Vec<Url>,
    #[trace(skip)]
    http_cache: HttpCache,
    // per-build content cache keyed by resolved URL; avoids duplicate
    // fetches within a single evaluation
    #[trace(skip)]
    contents: RefCell<HashMap<String, Vec<u8>>>,
}

impl UniversalImporter {
    /// Create an importer over the given base search URLs.
    pub fn new(base_search_urls: Vec<Url>, http_cache: HttpCache) -> Self {
        Self {
            base_search_urls,
            http_cache,
            contents: RefCell::new(HashMap::new()),
        }
    }

    /// Resolve an import to the URL it was found at, fetching its contents
    /// into the in-process cache.
    pub fn import(&self, imported_from: Option<&str>, imported_path: &str) -> Result<String> {
        let candidates = self.candidate_urls(imported_from, imported_path)?;

        let mut tried = Vec::new();
        for candidate in candidates {
            let found_at = candidate.to_string();
            if self.contents.borrow().contains_key(&found_at) {
                return Ok(found_at);
            }
            tried.push(found_at.clone());
            match self.http_cache.get(&found_at)? {
                Fetch::Contents(bytes) => {
                    self.contents.borrow_mut().insert(found_at.clone(), bytes);
                    return Ok(found_at);
                }
                Fetch::NotFound => continue,
            }
        }

        Err(Error::build(format!(
            "couldn't open import {imported_path:?}, no match locally or in library search paths. Tried: {}",
            tried.join(";")
        )))
    }

    /// The candidate URLs for an import, in resolution order.
    pub fn candidate_urls(
        &self,
        imported_from: Option<&str>,
        imported_path: &str,
    ) -> Result<Vec<Url>> {
        // An absolute import resolves only to itself
        if let Ok(absolute) = Url::parse(imported_path) {
            return Ok(vec![absolute]);
        }

        let mut candidates = Vec::with_capacity(self.base_search_urls.len() + 1);
        if let Some(from) = imported_from {
            if let Ok(from_url) = Url::parse(from) {
                let joined = from_url.join(imported_path).map_err(|e| {
                    Error::build(format!("import path {imported_path:?} is not valid: {e}"))
                })?;
                candidates.push(joined);
            }
        }
        for base in &self.base_search_urls {
            let joined = base.join(imported_path).map_err(|e| {
                Error::build(format!("import path {imported_path:?} is not valid: {e}"))
            })?;
            candidates.push(joined);
        }
        Ok(candidates)
    }

    fn cached_or_fetch(&self, url: &str) -> Result<Vec<u8>> {
        if let Some(bytes) = self.contents.borrow().get(url) {
            return Ok(bytes.clone());
        }
        match self.http_cache.get(url)? {
            Fetch::Contents(bytes) => {
                self.contents.borrow_mut().insert(url.to_string(), bytes.clone());
                Ok(bytes)
            }
            Fetch::NotFound => Err(Error::build(format!("couldn't open import {url:?}"))),
        }
    }
}

fn virtual_path(url: &str) -> SourcePath {
    SourcePath::new(SourceVirtual(url.into()))
}

fn source_url(path: &SourcePath) -> Option<String> {
    path.downcast_ref::<SourceVirtual>().map(|v| v.0.to_string())
}

fn import_error(err: Error) -> jrsonnet_evaluator::Error {
    ErrorKind::RuntimeError(err.to_string().into()).into()
}

impl ImportResolver for UniversalImporter {
    fn resolve_from(&self, from: &SourcePath, path: &str) -> JrResult<SourcePath> {
        let from_url = source_url(from);
        let found_at = self
            .import(from_url.as_deref(), path)
            .map_err(import_error)?;
        Ok(virtual_path(&found_at))
    }

    fn resolve(&self, path: &Path) -> JrResult<SourcePath> {
        let found_at = self
            .import(None, &path.to_string_lossy())
            .map_err(import_error)?;
        Ok(virtual_path(&found_at))
    }

    fn load_file_contents(&self, resolved: &SourcePath) -> JrResult<Vec<u8>> {
        let url = source_url(resolved).ok_or_else(|| {
            import_error(Error::build("resolved import is not a URL".to_string()))
        })?;
        self.cached_or_fetch(&url).map_err(import_error)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn importer(bases: Vec<Url>) -> (tempfile::TempDir, UniversalImporter) {
        let dir = tempdir().unwrap();
        let cache = HttpCache::new(dir.path().join("cache")).unwrap();
        (dir, UniversalImporter::new(bases, cache))
    }

    /// Story: candidates are the importing file's sibling first, then each
    /// search URL in order
    ///
    /// This ordering is what makes vendored libraries override remote ones
    /// and the embedded stdlib reachable as a fallback.
    #[test]
    fn story_candidate_order_is_from_then_bases() {
        let bases = vec![
            Url::parse("internal:///").unwrap(),
            Url::parse("file:///vendor/").unwrap(),
            Url::parse("https://example.com/lib/").unwrap(),
        ];
        let (_dir, importer) = importer(bases);

        let candidates = importer
            .candidate_urls(Some("file:///src/envs/prod/main.jsonnet"), "util.libsonnet")
            .unwrap();
        let strings: Vec<String> = candidates.iter().map(Url::to_string).collect();
        assert_eq!(
            strings,
            vec![
                "file:///src/envs/prod/util.libsonnet",
                "internal:///util.libsonnet",
                "file:///vendor/util.libsonnet",
                "https://example.com/lib/util.libsonnet",
            ]
        );
    }

    #[test]
    fn test_absolute_import_short_circuits() {
        let (_dir, importer) = importer(vec![Url::parse("file:///vendor/").unwrap()]);
        let candidates = importer
            .candidate_urls(Some("file:///src/main.jsonnet"), "https://example.com/x.libsonnet")
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].as_str(), "https://example.com/x.libsonnet");
    }

    /// Story: the first existing candidate wins
    #[test]
    fn story_first_existing_candidate_wins() {
        let dir = tempdir().unwrap();
        let vendor = dir.path().join("vendor");
        fs::create_dir_all(&vendor).unwrap();
        fs::write(vendor.join("util.libsonnet"), "{ vendored: true }").unwrap();

        let bases = vec![
            Url::parse(&format!("file://{}/", vendor.display())).unwrap(),
            Url::parse("internal:///").unwrap(),
        ];
        let cache = HttpCache::new(dir.path().join("cache")).unwrap();
        let importer = UniversalImporter::new(bases, cache);

        let found = importer.import(None, "util.libsonnet").unwrap();
        assert!(found.ends_with("vendor/util.libsonnet"), "{found}");
    }

    /// Story: an unresolvable import reports every URL that was tried
    #[test]
    fn story_failure_lists_tried_urls() {
        let (_dir, importer) = importer(vec![Url::parse("internal:///").unwrap()]);
        let err = importer.import(None, "missing.libsonnet").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("missing.libsonnet"), "{msg}");
        assert!(msg.contains("internal:///missing.libsonnet"), "{msg}");
    }

    #[test]
    fn test_embedded_stdlib_resolves_through_importer() {
        let (_dir, importer) = importer(vec![Url::parse("internal:///").unwrap()]);
        let found = importer.import(None, "kubecfg.libsonnet").unwrap();
        assert_eq!(found, "internal:///kubecfg.libsonnet");
        let contents = importer.cached_or_fetch(&found).unwrap();
        assert!(String::from_utf8(contents).unwrap().contains("helmTemplate"));
    }

    #[test]
    fn test_repeat_import_served_from_memory() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.libsonnet");
        fs::write(&file, "{}").unwrap();
        let cache = HttpCache::new(dir.path().join("cache")).unwrap();
        let importer = UniversalImporter::new(vec![], cache);

        let url = format!("file://{}", file.display());
        let first = importer.import(None, &url).unwrap();
        // Deleting the file does not break the second import
        fs::remove_file(&file).unwrap();
        let second = importer.import(None, &url).unwrap();
        assert_eq!(first, second);
    }
}
