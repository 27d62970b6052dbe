//! Control-plane API contract and its HTTP client
//!
//! The sagas and the client factory only ever see [`ControlPlaneApi`]; every
//! call is a remote procedure that can fail and is surfaced as
//! [`Error::ApiRegistration`] rather than treated as local state.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace};

use crate::error::Error;
use crate::types::{
    CloudAccount, CloudRuntimeDefinition, CloudRuntimeInstance, ControlPlaneInstanceConfig,
    Credential, KubernetesRuntimeDefinition, KubernetesRuntimeInstance,
};
use crate::Result;

const RUNTIME_DEFINITIONS: &str = "kubernetes-runtime-definitions";
const RUNTIME_INSTANCES: &str = "kubernetes-runtime-instances";
const CLOUD_ACCOUNTS: &str = "cloud-accounts";
const CLOUD_RUNTIME_DEFINITIONS: &str = "cloud-runtime-definitions";
const CLOUD_RUNTIME_INSTANCES: &str = "cloud-runtime-instances";
const WORKLOAD_INSTANCES: &str = "workload-instances";

/// Typed calls against a running control plane
#[async_trait]
pub trait ControlPlaneApi: Send + Sync {
    /// Succeeds once the API server reports ready
    async fn health(&self) -> Result<()>;

    /// Fetch a runtime definition by id
    async fn get_runtime_definition(&self, id: u64) -> Result<KubernetesRuntimeDefinition>;

    /// Register a runtime definition, returning it with its assigned id
    async fn create_runtime_definition(
        &self,
        definition: &KubernetesRuntimeDefinition,
    ) -> Result<KubernetesRuntimeDefinition>;

    /// Register a runtime instance, returning it with its assigned id
    async fn create_runtime_instance(
        &self,
        runtime: &KubernetesRuntimeInstance,
    ) -> Result<KubernetesRuntimeInstance>;

    /// Persist changes (such as a refreshed token) to a runtime instance
    async fn update_runtime_instance(
        &self,
        runtime: &KubernetesRuntimeInstance,
    ) -> Result<KubernetesRuntimeInstance>;

    /// All registered runtime instances
    async fn list_runtime_instances(&self) -> Result<Vec<KubernetesRuntimeInstance>>;

    async fn create_cloud_account(&self, account: &CloudAccount) -> Result<CloudAccount>;

    async fn create_cloud_runtime_definition(
        &self,
        definition: &CloudRuntimeDefinition,
    ) -> Result<CloudRuntimeDefinition>;

    async fn create_cloud_runtime_instance(
        &self,
        instance: &CloudRuntimeInstance,
    ) -> Result<CloudRuntimeInstance>;

    /// Number of workload instances deployed through this control plane
    async fn count_workload_instances(&self) -> Result<usize>;
}

/// [`ControlPlaneApi`] over HTTP(S), with mutual TLS when auth is enabled
#[derive(Clone, Debug)]
pub struct HttpControlPlaneApi {
    base_url: String,
    http: reqwest::Client,
}

impl HttpControlPlaneApi {
    /// Build a client for `address`, authenticating with `credential` if given
    ///
    /// Addresses without a scheme get `https://` when a credential is present
    /// and `http://` otherwise.
    pub fn new(address: &str, credential: Option<&Credential>) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30));

        if let Some(cred) = credential {
            let ca = reqwest::Certificate::from_pem(cred.ca_cert.as_bytes())
                .map_err(|e| Error::api("client", format!("invalid CA certificate: {}", e)))?;
            let identity_pem = format!("{}\n{}", cred.client_cert.trim_end(), cred.client_key);
            let identity = reqwest::Identity::from_pem(identity_pem.as_bytes())
                .map_err(|e| Error::api("client", format!("invalid client identity: {}", e)))?;
            builder = builder
                .use_rustls_tls()
                .add_root_certificate(ca)
                .identity(identity);
        }

        let http = builder
            .build()
            .map_err(|e| Error::api("client", format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url(address, credential.is_some()),
            http,
        })
    }

    /// Build a client from a persisted instance record
    pub fn from_config(config: &ControlPlaneInstanceConfig) -> Result<Self> {
        let credential = if config.auth_enabled {
            Some(config.credential().ok_or_else(|| {
                Error::validation_for_field(
                    &config.name,
                    "credentials",
                    "auth is enabled but no client credential is stored",
                )
            })?)
        } else {
            None
        };
        Self::new(&config.api_server_address, credential)
    }

    /// The base URL requests are sent to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v0/{}", self.base_url, path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http.request(method, self.url(path))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder, resource: &str) -> Result<T> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::api(resource, format!("request failed: {}", e)))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::api(resource, format!("failed to read response: {}", e)))?;
        trace!(resource, %status, body = %body, "control plane response");

        if !status.is_success() {
            return Err(status_error(resource, status, &body));
        }
        serde_json::from_str(&body)
            .map_err(|e| Error::api(resource, format!("unexpected response body: {}", e)))
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        resource: &str,
        body: &B,
    ) -> Result<T> {
        debug!(resource, "registering with control plane");
        self.send(self.request(Method::POST, resource).json(body), resource)
            .await
    }
}

fn base_url(address: &str, tls: bool) -> String {
    let address = address.trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else if tls {
        format!("https://{}", address)
    } else {
        format!("http://{}", address)
    }
}

fn status_error(resource: &str, status: StatusCode, body: &str) -> Error {
    let detail = body.trim();
    if detail.is_empty() {
        Error::api(resource, format!("status {}", status))
    } else {
        Error::api(resource, format!("status {}: {}", status, detail))
    }
}

#[async_trait]
impl ControlPlaneApi for HttpControlPlaneApi {
    async fn health(&self) -> Result<()> {
        let response = self
            .http
            .get(format!("{}/readyz", self.base_url))
            .send()
            .await
            .map_err(|e| Error::api("readyz", format!("request failed: {}", e)))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(status_error("readyz", status, ""))
        }
    }

    async fn get_runtime_definition(&self, id: u64) -> Result<KubernetesRuntimeDefinition> {
        let path = format!("{}/{}", RUNTIME_DEFINITIONS, id);
        self.send(self.request(Method::GET, &path), RUNTIME_DEFINITIONS)
            .await
    }

    async fn create_runtime_definition(
        &self,
        definition: &KubernetesRuntimeDefinition,
    ) -> Result<KubernetesRuntimeDefinition> {
        self.post(RUNTIME_DEFINITIONS, definition).await
    }

    async fn create_runtime_instance(
        &self,
        runtime: &KubernetesRuntimeInstance,
    ) -> Result<KubernetesRuntimeInstance> {
        self.post(RUNTIME_INSTANCES, runtime).await
    }

    async fn update_runtime_instance(
        &self,
        runtime: &KubernetesRuntimeInstance,
    ) -> Result<KubernetesRuntimeInstance> {
        let id = runtime.id.ok_or_else(|| {
            Error::api(
                RUNTIME_INSTANCES,
                format!("runtime instance {} has no id", runtime.name),
            )
        })?;
        let path = format!("{}/{}", RUNTIME_INSTANCES, id);
        self.send(
            self.request(Method::PATCH, &path).json(runtime),
            RUNTIME_INSTANCES,
        )
        .await
    }

    async fn list_runtime_instances(&self) -> Result<Vec<KubernetesRuntimeInstance>> {
        self.send(
            self.request(Method::GET, RUNTIME_INSTANCES),
            RUNTIME_INSTANCES,
        )
        .await
    }

    async fn create_cloud_account(&self, account: &CloudAccount) -> Result<CloudAccount> {
        self.post(CLOUD_ACCOUNTS, account).await
    }

    async fn create_cloud_runtime_definition(
        &self,
        definition: &CloudRuntimeDefinition,
    ) -> Result<CloudRuntimeDefinition> {
        self.post(CLOUD_RUNTIME_DEFINITIONS, definition).await
    }

    async fn create_cloud_runtime_instance(
        &self,
        instance: &CloudRuntimeInstance,
    ) -> Result<CloudRuntimeInstance> {
        self.post(CLOUD_RUNTIME_INSTANCES, instance).await
    }

    async fn count_workload_instances(&self) -> Result<usize> {
        let instances: Vec<serde_json::Value> = self
            .send(
                self.request(Method::GET, WORKLOAD_INSTANCES),
                WORKLOAD_INSTANCES,
            )
            .await?;
        Ok(instances.len())
    }
}
