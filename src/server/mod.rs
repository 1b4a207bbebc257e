//! HTTP surfaces: the TLS dry-run endpoint, health probes, and metrics
//!
//! The dry-run endpoint accepts a Konfiguration manifest, prepares its
//! source, impersonates its client, builds, and returns the canonical YAML
//! stream without applying anything. It always serves TLS; a self-signed
//! certificate is generated when no certificate directory is supplied.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use kube::Client;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tracing::{error, info};

use crate::crd::Konfiguration;
use crate::impersonation::{discovery, Impersonation};
use crate::jsonnet::{Builder, NamespaceDefaulter};
use crate::source::SourcePreparer;
use crate::{Error, Result};

/// State shared by dry-run requests
pub struct DryRunState {
    /// The controller's own client
    pub client: Client,
    /// Directory jsonnet HTTP assets are cached under
    pub cache_dir: PathBuf,
    /// Maximum artifact fetch retries
    pub http_retry_max: usize,
    /// Per-request deadline
    pub timeout: Duration,
}

/// The router serving `/dry-run` and its `/build` alias
pub fn dry_run_router(state: Arc<DryRunState>) -> Router {
    Router::new()
        .route("/dry-run", any(dry_run))
        .route("/build", any(dry_run))
        .with_state(state)
}

/// The plaintext router serving liveness and readiness probes
pub fn probe_router() -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
}

/// The router rendering Prometheus metrics
pub fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    )
}

async fn dry_run(State(state): State<Arc<DryRunState>>, body: String) -> Response {
    let konfig: Konfiguration = match serde_yaml::from_str(&body) {
        Ok(konfig) => konfig,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
    };

    info!(
        konfiguration = %konfig.namespaced_name(),
        "Dry run request"
    );

    match tokio::time::timeout(state.timeout, build_stream(&state, &konfig)).await {
        Err(_) => error_response(
            StatusCode::REQUEST_TIMEOUT,
            &format!("deadline exceeded after {:?}", state.timeout),
        ),
        Ok(Err(e)) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        Ok(Ok(stream)) => (StatusCode::OK, format!("{stream}\n")).into_response(),
    }
}

async fn build_stream(state: &DryRunState, konfig: &Konfiguration) -> Result<String> {
    // Source artifacts may lag the Konfiguration; keep retrying artifact
    // failures until the request deadline cancels us
    let preparer = SourcePreparer::new(state.client.clone(), state.http_retry_max);
    let prepared = loop {
        match preparer.prepare(konfig).await {
            Ok(prepared) => break prepared,
            Err(e @ Error::Artifact { .. }) => {
                info!(error = %e, "Dry run source not ready, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(e) => return Err(e),
        }
    };

    let mut impersonation = Impersonation::new(konfig, state.client.clone());
    let client = impersonation.client().await?;
    let discovery = Arc::new(discovery(&client).await?);

    let builder = Builder::new(konfig, prepared.workdir(), &state.cache_dir)?;
    let defaulter = NamespaceDefaulter::new(
        discovery,
        konfig.metadata.namespace.clone().unwrap_or_default(),
    );
    let path = prepared.path.clone();
    let output = tokio::task::spawn_blocking(move || builder.build(Some(&defaulter), &path))
        .await
        .map_err(|e| Error::internal_with_context("server", format!("build task failed: {e}")))??;

    Ok(output.yaml_stream()?.to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    error!(status = %status, "Konfiguration dry-run error: {message}");
    (status, Json(json!({"error": message}))).into_response()
}

/// Serve the given router over TLS on the given address.
pub async fn serve_tls(addr: SocketAddr, router: Router, tls: RustlsConfig) -> Result<()> {
    info!(addr = %addr, "Starting HTTPS server");
    axum_server::bind_rustls(addr, tls)
        .serve(router.into_make_service())
        .await
        .map_err(|e| Error::internal_with_context("server", e.to_string()))
}

/// Serve the given router over plain HTTP on the given address.
pub async fn serve_plain(addr: SocketAddr, router: Router) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::internal_with_context("server", e.to_string()))?;
    axum::serve(listener, router.into_make_service())
        .await
        .map_err(|e| Error::internal_with_context("server", e.to_string()))
}

/// Load the TLS configuration from `tls.crt`/`tls.key` in the given
/// directory, or generate a self-signed certificate when no directory is
/// supplied.
pub async fn tls_config(cert_dir: Option<&Path>) -> Result<RustlsConfig> {
    let (cert_pem, key_pem) = match cert_dir {
        Some(dir) => {
            let cert = std::fs::read(dir.join("tls.crt"))
                .map_err(|e| Error::internal_with_context("server", format!("reading tls.crt: {e}")))?;
            let key = std::fs::read(dir.join("tls.key"))
                .map_err(|e| Error::internal_with_context("server", format!("reading tls.key: {e}")))?;
            (cert, key)
        }
        None => {
            info!("Generating a self-signed certificate for the web server");
            let (cert, key) = self_signed_cert()?;
            (cert.into_bytes(), key.into_bytes())
        }
    };

    RustlsConfig::from_pem(cert_pem, key_pem)
        .await
        .map_err(|e| Error::internal_with_context("server", e.to_string()))
}

/// Generate a self-signed certificate for localhost serving
fn self_signed_cert() -> Result<(String, String)> {
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

    let key_pair = KeyPair::generate()
        .map_err(|e| Error::internal_with_context("server", format!("key generation: {e}")))?;

    let mut params = CertificateParams::new(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "jsonnet-controller".to_string(),
    ])
    .map_err(|e| Error::internal_with_context("server", e.to_string()))?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "jsonnet-controller");
    params.distinguished_name = dn;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| Error::internal_with_context("server", format!("cert generation: {e}")))?;

    Ok((cert.pem(), key_pair.serialize_pem()))
}
