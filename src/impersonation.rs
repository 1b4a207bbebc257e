//! Per-Konfiguration client selection
//!
//! A Konfiguration can be reconciled with the controller's own client, with
//! a service account's token, or against a remote cluster through a
//! kubeconfig held in a secret. Fetched credentials are cached on the
//! impersonation instance for the duration of one reconciliation; they are
//! never shared across workers.

use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use kube::api::Api;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, Discovery};
use secrecy::SecretString;
use tracing::debug;

use crate::crd::Konfiguration;
use crate::{Error, Result};

/// Selects and builds the API client used for one Konfiguration's
/// reconciliation
pub struct Impersonation {
    client: Client,
    konfig: Konfiguration,

    // cached assets
    kubeconfig_contents: Option<Vec<u8>>,
    service_account_token: Option<String>,
}

impl Impersonation {
    /// Create an impersonation for the given Konfiguration using the
    /// controller's own client for lookups
    pub fn new(konfig: &Konfiguration, client: Client) -> Self {
        Self {
            client,
            konfig: konfig.clone(),
            kubeconfig_contents: None,
            service_account_token: None,
        }
    }

    /// Produce the client to reconcile this Konfiguration with.
    ///
    /// A `kubeConfig.secretRef` takes precedence over
    /// `serviceAccountName`; with neither set the controller's own client
    /// is returned.
    pub async fn client(&mut self) -> Result<Client> {
        if self.konfig.kube_config_secret_name().is_some() {
            return self.client_for_kubeconfig().await;
        }
        if self.konfig.spec.service_account_name.is_some() {
            return self.client_for_service_account().await;
        }
        Ok(self.client.clone())
    }

    async fn client_for_kubeconfig(&mut self) -> Result<Client> {
        let contents = self.kubeconfig().await?;
        let kubeconfig = Kubeconfig::from_yaml(&String::from_utf8_lossy(&contents))
            .map_err(|e| Error::internal(format!("failed to parse kubeconfig: {e}")))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::internal(format!("failed to load kubeconfig: {e}")))?;
        Client::try_from(config)
            .map_err(|e| Error::internal(format!("failed to create client: {e}")))
    }

    async fn client_for_service_account(&mut self) -> Result<Client> {
        let token = self.service_account_token().await?;
        let mut config = Config::incluster()
            .map_err(|e| Error::internal(format!("failed to load in-cluster config: {e}")))?;
        config.auth_info.token = Some(SecretString::from(token));
        // Clear the token file, as it overrides the token
        config.auth_info.token_file = None;
        Client::try_from(config)
            .map_err(|e| Error::internal(format!("failed to create client: {e}")))
    }

    async fn kubeconfig(&mut self) -> Result<Vec<u8>> {
        if let Some(contents) = &self.kubeconfig_contents {
            return Ok(contents.clone());
        }

        let namespace = self.konfig.metadata.namespace.clone().unwrap_or_default();
        let name = self
            .konfig
            .kube_config_secret_name()
            .ok_or_else(|| Error::internal("no kubeconfig secret configured"))?
            .to_string();

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        let secret = secrets.get(&name).await.map_err(|e| {
            Error::internal(format!(
                "unable to read KubeConfig secret '{namespace}/{name}' error: {e}"
            ))
        })?;

        let contents = secret
            .data
            .as_ref()
            .and_then(|d| d.get("value"))
            .map(|v| v.0.clone())
            .ok_or_else(|| {
                Error::internal(format!(
                    "KubeConfig secret '{namespace}/{name}' doesn't contain a 'value' key"
                ))
            })?;

        self.kubeconfig_contents = Some(contents.clone());
        Ok(contents)
    }

    async fn service_account_token(&mut self) -> Result<String> {
        if let Some(token) = &self.service_account_token {
            return Ok(token.clone());
        }

        let namespace = self.konfig.metadata.namespace.clone().unwrap_or_default();
        let sa_name = self
            .konfig
            .spec
            .service_account_name
            .clone()
            .ok_or_else(|| Error::internal("no service account configured"))?;

        let service_accounts: Api<ServiceAccount> =
            Api::namespaced(self.client.clone(), &namespace);
        let service_account = service_accounts.get(&sa_name).await?;

        let secret_name = token_secret_name(&sa_name, &service_account);
        debug!(namespace, secret = %secret_name, "Reading service account token");

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        let secret = secrets.get(&secret_name).await?;

        let token = secret
            .data
            .as_ref()
            .and_then(|d| d.get("token"))
            .map(|v| String::from_utf8_lossy(&v.0).into_owned())
            .ok_or_else(|| {
                Error::internal(format!(
                    "the service account secret '{namespace}/{secret_name}' does not contain a token"
                ))
            })?;

        // Reuse for the life of this impersonation to avoid repeat lookups
        self.service_account_token = Some(token.clone());
        Ok(token)
    }
}

/// The name of the secret holding the service account's token: the first
/// listed secret named with the `<serviceaccount>-token` prefix, falling
/// back to the service account name itself.
fn token_secret_name(sa_name: &str, service_account: &ServiceAccount) -> String {
    let prefix = format!("{sa_name}-token");
    service_account
        .secrets
        .iter()
        .flatten()
        .filter_map(|s| s.name.as_deref())
        .find(|name| name.starts_with(&prefix))
        .unwrap_or(sa_name)
        .to_string()
}

/// Run API discovery for the given client.
///
/// Discovery backs namespace defaulting and prune listing; it is run once
/// per reconciliation against the impersonated client.
pub async fn discovery(client: &Client) -> Result<Discovery> {
    Discovery::new(client.clone())
        .run()
        .await
        .map_err(|e| Error::internal(format!("failed to run API discovery: {e}")))
}
