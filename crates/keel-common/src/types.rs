//! Data model shared by the client factory, the reconciler and the sagas
//!
//! Records that travel over the control-plane API serialize as camelCase JSON;
//! the persisted [`ControlPlaneInstanceConfig`] uses the same shape so a record
//! can be shown to the operator verbatim.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Cluster-internal address of the Kubernetes API, used when a control-plane
/// component talks to the runtime it is hosted on.
pub const IN_CLUSTER_API_ENDPOINT: &str = "https://kubernetes.default.svc";

/// Name of the compute space every new control plane registers first.
pub const DEFAULT_RUNTIME_NAME: &str = "default";

// =============================================================================
// Providers
// =============================================================================

/// Infrastructure providers a runtime can be provisioned on
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Local kind cluster
    #[default]
    Kind,
    /// Amazon Elastic Kubernetes Service
    Eks,
}

impl ProviderKind {
    /// Every supported provider, in the order shown to operators
    pub const ALL: [ProviderKind; 2] = [ProviderKind::Kind, ProviderKind::Eks];

    /// Identifier used on the command line and in persisted records
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Kind => "kind",
            ProviderKind::Eks => "eks",
        }
    }

    /// Cloud providers need an account id, auth and an inventory file
    pub fn is_cloud(&self) -> bool {
        matches!(self, ProviderKind::Eks)
    }

    /// The provider used when none is requested
    pub fn is_default(&self) -> bool {
        matches!(self, ProviderKind::Kind)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "kind" => Ok(ProviderKind::Kind),
            "eks" => Ok(ProviderKind::Eks),
            other => Err(Error::unsupported_provider(other)),
        }
    }
}

// =============================================================================
// Runtime connection
// =============================================================================

/// Endpoint and credentials for one Kubernetes API
///
/// Exactly one credential shape is expected: a client certificate and key, or
/// a bearer token. When both are present the certificate wins.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConnectionInfo {
    pub api_endpoint: String,
    /// PEM-encoded CA bundle for the API server
    pub ca_certificate: String,
    /// PEM-encoded client certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    /// PEM-encoded client private key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_expiration: Option<DateTime<Utc>>,
}

/// The credential a client should authenticate with
#[derive(Clone, Debug, PartialEq)]
pub enum RuntimeCredential<'a> {
    ClientCertificate { certificate: &'a str, key: &'a str },
    BearerToken(&'a str),
}

impl RuntimeConnectionInfo {
    /// Resolve which credential to use, certificate/key first
    pub fn credential(&self) -> Option<RuntimeCredential<'_>> {
        if let (Some(certificate), Some(key)) = (non_empty(&self.certificate), non_empty(&self.key))
        {
            return Some(RuntimeCredential::ClientCertificate { certificate, key });
        }
        non_empty(&self.bearer_token).map(RuntimeCredential::BearerToken)
    }

    /// Whether the bearer token expires before `now + window`
    ///
    /// Tokens without an expiration never need refreshing, and neither do
    /// connections that authenticate with a client certificate.
    pub fn token_expires_within(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match (self.credential(), self.token_expiration) {
            (Some(RuntimeCredential::BearerToken(_)), Some(expiry)) => expiry - now < window,
            _ => false,
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

// =============================================================================
// Runtime records
// =============================================================================

/// A Kubernetes runtime the orchestrator can act against
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesRuntimeInstance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub name: String,
    #[serde(default)]
    pub is_control_plane_host: bool,
    #[serde(default)]
    pub default_runtime: bool,
    #[serde(default)]
    pub reconciled: bool,
    #[serde(flatten)]
    pub connection: RuntimeConnectionInfo,
    /// Definition this instance was created from; used to find its provider
    #[serde(
        default,
        rename = "kubernetesRuntimeDefinitionID",
        skip_serializing_if = "Option::is_none"
    )]
    pub runtime_definition_id: Option<u64>,
}

/// How a runtime was (or will be) created
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesRuntimeDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub name: String,
    pub infra_provider: ProviderKind,
    /// Provider-specific settings (cluster name, region, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config: Option<ProviderSettings>,
}

/// Provider-specific settings shared by config records and API definitions
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_count: Option<u32>,
}

// =============================================================================
// Control-plane instance config
// =============================================================================

/// Client credential for talking to a control-plane API
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub name: String,
    pub ca_cert: String,
    pub client_cert: String,
    pub client_key: String,
}

/// The durable record of one control-plane instance, keyed by `name`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneInstanceConfig {
    pub name: String,
    pub provider: ProviderKind,
    /// Where the control-plane API is reachable from this machine
    pub api_server_address: String,
    pub auth_enabled: bool,
    #[serde(default)]
    pub credentials: Vec<Credential>,
    #[serde(default)]
    pub provider_config: ProviderSettings,
}

impl ControlPlaneInstanceConfig {
    /// The credential used by this operator, if auth is enabled
    pub fn credential(&self) -> Option<&Credential> {
        self.credentials.first()
    }
}

// =============================================================================
// Workload resources
// =============================================================================

/// One Kubernetes object belonging to a workload instance
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadResourceInstance {
    /// A single Kubernetes object encoded as JSON
    pub json_definition: String,
    #[serde(rename = "workloadInstanceID")]
    pub workload_instance_id: u64,
    #[serde(default)]
    pub reconciled: bool,
}

// =============================================================================
// Cloud registrations
// =============================================================================

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudAccount {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub name: String,
    pub provider: ProviderKind,
    pub account_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudRuntimeDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub name: String,
    #[serde(rename = "cloudAccountID")]
    pub cloud_account_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudRuntimeInstance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub name: String,
    #[serde(rename = "cloudRuntimeDefinitionID")]
    pub cloud_runtime_definition_id: u64,
    #[serde(rename = "kubernetesRuntimeInstanceID")]
    pub kubernetes_runtime_instance_id: u64,
}
