//! Authenticated clients for arbitrary Kubernetes runtimes
//!
//! A runtime's persisted connection info comes in two shapes: a client
//! certificate and key (mutual TLS) or a bearer token with an optional
//! expiration. [`RuntimeClientFactory`] turns either into a `kube::Config`,
//! refreshing bearer tokens that are about to expire through the provider
//! that issued them, and pairs the resulting client with a freshly
//! discovered [`RestMapper`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use keel_common::{
    ControlPlaneApi, Error, KubernetesRuntimeDefinition, KubernetesRuntimeInstance, ProviderKind,
    Result, RuntimeConnectionInfo, RuntimeCredential, IN_CLUSTER_API_ENDPOINT,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde_json::json;
use tracing::{debug, info};

use crate::mapper::{DiscoveryMapper, RestMapper};
use crate::reconciler::{Reconcile, ResourceReconciler};

/// Default connection timeout for runtime clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for runtime clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Bearer tokens expiring sooner than this are refreshed before use
pub const TOKEN_REFRESH_WINDOW_SECS: i64 = 180;

/// Provider-specific credential refresh
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConnectionRefresher: Send + Sync {
    /// Obtain fresh connection info for the runtime described by `definition`
    async fn refresh_connection(
        &self,
        definition: &KubernetesRuntimeDefinition,
    ) -> Result<RuntimeConnectionInfo>;
}

/// A client plus the mapper discovered for it
///
/// Discovery reflects the API server at the time of the call; acquire one per
/// saga step rather than holding it across long idle periods.
#[derive(Clone)]
pub struct RuntimeClient {
    client: Client,
    mapper: Arc<dyn RestMapper>,
}

impl RuntimeClient {
    pub fn new(client: Client, mapper: Arc<dyn RestMapper>) -> Self {
        Self { client, mapper }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn mapper(&self) -> Arc<dyn RestMapper> {
        self.mapper.clone()
    }

    /// A reconciler bound to this client and mapper
    pub fn reconciler(&self) -> ResourceReconciler {
        ResourceReconciler::new(self.client.clone(), self.mapper.clone())
    }
}

/// Something that can produce a reconciler for a runtime
///
/// The sagas depend on this rather than on [`RuntimeClientFactory`] directly.
#[async_trait]
pub trait RuntimeConnector: Send + Sync {
    /// Build a reconciler for `runtime`, refreshing its token through `api`
    /// when needed
    async fn connect(
        &self,
        runtime: &mut KubernetesRuntimeInstance,
        api: Option<&dyn ControlPlaneApi>,
    ) -> Result<Arc<dyn Reconcile>>;

    /// Unconditionally refresh the runtime's credentials and persist them
    async fn refresh(
        &self,
        runtime: &mut KubernetesRuntimeInstance,
        api: &dyn ControlPlaneApi,
    ) -> Result<()>;
}

/// Builds clients from runtime records
#[derive(Clone, Default)]
pub struct RuntimeClientFactory {
    control_plane_component: bool,
    refreshers: HashMap<ProviderKind, Arc<dyn ConnectionRefresher>>,
}

impl RuntimeClientFactory {
    /// Factory for callers running outside the control plane (the CLI)
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory for control-plane components running inside the host runtime
    pub fn for_control_plane_component() -> Self {
        Self {
            control_plane_component: true,
            ..Self::default()
        }
    }

    /// Register the token refresh implementation for a provider
    pub fn with_refresher(
        mut self,
        provider: ProviderKind,
        refresher: Arc<dyn ConnectionRefresher>,
    ) -> Self {
        self.refreshers.insert(provider, refresher);
        self
    }

    /// Client and mapper for `runtime`
    pub async fn get_client(
        &self,
        runtime: &mut KubernetesRuntimeInstance,
        api: Option<&dyn ControlPlaneApi>,
    ) -> Result<RuntimeClient> {
        let config = self.rest_config(runtime, api).await?;
        let client = Client::try_from(config)
            .map_err(|e| Error::from_kube(format!("client for runtime {}", runtime.name), e))?;
        let mapper = DiscoveryMapper::discover(&client).await?;
        Ok(RuntimeClient::new(client, Arc::new(mapper)))
    }

    /// REST config for `runtime`
    ///
    /// Refreshes a bearer token that expires within the refresh window first,
    /// provided a control-plane API is available to look up the provider and
    /// persist the new token.
    pub async fn rest_config(
        &self,
        runtime: &mut KubernetesRuntimeInstance,
        api: Option<&dyn ControlPlaneApi>,
    ) -> Result<Config> {
        let window = chrono::Duration::seconds(TOKEN_REFRESH_WINDOW_SECS);
        if runtime.connection.token_expires_within(Utc::now(), window) {
            match api {
                Some(api) => self.refresh_runtime(runtime, api).await?,
                None => debug!(
                    runtime = %runtime.name,
                    "token close to expiry but no control-plane API to refresh through"
                ),
            }
        }

        let endpoint = if runtime.is_control_plane_host && self.control_plane_component {
            IN_CLUSTER_API_ENDPOINT.to_string()
        } else {
            runtime.connection.api_endpoint.clone()
        };
        build_config(runtime, &endpoint).await
    }

    /// Refresh `runtime`'s credentials through its provider and persist them
    pub async fn refresh_runtime(
        &self,
        runtime: &mut KubernetesRuntimeInstance,
        api: &dyn ControlPlaneApi,
    ) -> Result<()> {
        let definition_id = runtime.runtime_definition_id.ok_or_else(|| {
            Error::config(
                &runtime.name,
                "runtime has no definition to refresh credentials from",
            )
        })?;
        let definition = api.get_runtime_definition(definition_id).await?;
        let provider = definition.infra_provider;
        let refresher = self
            .refreshers
            .get(&provider)
            .ok_or_else(|| Error::unsupported_provider(provider.to_string()))?;

        let refreshed = refresher
            .refresh_connection(&definition)
            .await
            .map_err(|e| match e {
                Error::AuthRefresh { .. } => e,
                other => Error::auth_refresh(provider.to_string(), other.to_string()),
            })?;

        let api_endpoint = if refreshed.api_endpoint.is_empty() {
            std::mem::take(&mut runtime.connection.api_endpoint)
        } else {
            refreshed.api_endpoint.clone()
        };
        runtime.connection = RuntimeConnectionInfo {
            api_endpoint,
            ..refreshed
        };

        api.update_runtime_instance(runtime).await?;
        info!(
            runtime = %runtime.name,
            provider = %provider,
            expires = ?runtime.connection.token_expiration,
            "refreshed runtime credentials"
        );
        Ok(())
    }
}

#[async_trait]
impl RuntimeConnector for RuntimeClientFactory {
    async fn connect(
        &self,
        runtime: &mut KubernetesRuntimeInstance,
        api: Option<&dyn ControlPlaneApi>,
    ) -> Result<Arc<dyn Reconcile>> {
        let client = self.get_client(runtime, api).await?;
        Ok(Arc::new(client.reconciler()))
    }

    async fn refresh(
        &self,
        runtime: &mut KubernetesRuntimeInstance,
        api: &dyn ControlPlaneApi,
    ) -> Result<()> {
        self.refresh_runtime(runtime, api).await
    }
}

/// Translate a runtime's connection info into a kube `Config`
async fn build_config(runtime: &KubernetesRuntimeInstance, endpoint: &str) -> Result<Config> {
    if endpoint.trim().is_empty() {
        return Err(Error::config(&runtime.name, "runtime has no API endpoint"));
    }

    let user = match runtime.connection.credential() {
        Some(RuntimeCredential::ClientCertificate { certificate, key }) => json!({
            "client-certificate-data": STANDARD.encode(certificate),
            "client-key-data": STANDARD.encode(key),
        }),
        Some(RuntimeCredential::BearerToken(token)) => json!({ "token": token }),
        None => {
            return Err(Error::config(
                &runtime.name,
                "runtime has neither a client certificate and key nor a bearer token",
            ))
        }
    };

    let mut cluster = json!({ "server": endpoint });
    let ca = runtime.connection.ca_certificate.trim();
    if !ca.is_empty() {
        cluster["certificate-authority-data"] = json!(STANDARD.encode(ca));
    }

    let name = &runtime.name;
    let kubeconfig: Kubeconfig = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{ "name": name, "cluster": cluster }],
        "users": [{ "name": name, "user": user }],
        "contexts": [{ "name": name, "context": { "cluster": name, "user": name } }],
        "current-context": name,
    }))
    .map_err(|e| Error::config(name, format!("invalid connection info: {}", e)))?;

    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::config(name, format!("failed to build client config: {}", e)))?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Ok(config)
}
