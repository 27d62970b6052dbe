//! Infrastructure provider abstraction
//!
//! Each provider knows how to create and delete the Kubernetes runtime a
//! control plane is installed onto. The sagas only talk to the
//! [`InfraProvisioner`] trait and look providers up in a [`ProviderRegistry`]
//! keyed by [`ProviderKind`], so adding a provider needs no saga changes.
//!
//! # Supported Providers
//!
//! - [`KindProvider`] - local kind cluster
//! - [`EksProvider`] - Amazon EKS via eksctl and the AWS CLI

mod eks;
mod kind;
mod process;

pub use eks::EksProvider;
pub use kind::KindProvider;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use keel_common::{
    Error, KubernetesRuntimeDefinition, ProviderKind, ProviderSettings, Result,
    RuntimeConnectionInfo,
};

use crate::events::ProvisionEvents;

/// What to provision, and where
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InfraSpec {
    /// Control-plane instance the runtime is for
    pub instance: String,
    pub settings: ProviderSettings,
}

impl InfraSpec {
    pub fn new(instance: impl Into<String>, settings: ProviderSettings) -> Self {
        Self {
            instance: instance.into(),
            settings,
        }
    }

    /// Rebuild a spec from a registered runtime definition
    pub fn from_definition(definition: &KubernetesRuntimeDefinition) -> Self {
        Self::new(
            definition.name.clone(),
            definition.provider_config.clone().unwrap_or_default(),
        )
    }

    /// Name of the underlying cluster, `keel-<instance>` unless configured
    pub fn cluster_name(&self) -> String {
        self.settings
            .cluster_name
            .clone()
            .unwrap_or_else(|| format!("keel-{}", self.instance))
    }

    /// Number of nodes to create, at least one
    pub fn node_count(&self) -> u32 {
        self.settings.node_count.unwrap_or(1).max(1)
    }

    /// The region, required by cloud providers
    pub fn region(&self, provider: ProviderKind) -> Result<&str> {
        self.settings
            .region
            .as_deref()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| {
                Error::validation_for_field(
                    &self.instance,
                    "aws-region",
                    format!("{} requires a region", provider),
                )
            })
    }
}

/// Creates and deletes a runtime's underlying infrastructure
///
/// Implementations must be safe to call `delete` on after a partial `create`:
/// the inventory passed in is whatever was last persisted, which may describe
/// only some of the resources (or be `None` if nothing was recorded).
#[async_trait]
pub trait InfraProvisioner: Send + Sync {
    /// Identifier this provider is registered under
    fn kind(&self) -> ProviderKind;

    /// Create the runtime and return how to connect to it
    ///
    /// Progress lines and inventory snapshots are reported through `events`
    /// as resources come up.
    async fn create(&self, spec: &InfraSpec, events: ProvisionEvents)
        -> Result<RuntimeConnectionInfo>;

    /// Tear down everything described by `inventory` (or by `spec` if none)
    async fn delete(&self, spec: &InfraSpec, inventory: Option<Value>) -> Result<()>;

    /// Fresh connection info for token-authenticated runtimes
    async fn refresh_connection(&self, _spec: &InfraSpec) -> Result<RuntimeConnectionInfo> {
        Err(Error::unsupported_provider(format!(
            "{} (token refresh)",
            self.kind()
        )))
    }

    /// Whether the control-plane API is exposed through a provider load
    /// balancer that must be released before deletion
    fn exposes_public_endpoint(&self) -> bool {
        false
    }

    /// Address the control-plane API is reachable on from this machine, when
    /// known up front
    fn api_server_address(&self, _spec: &InfraSpec) -> Option<String> {
        None
    }
}

/// Providers available to the sagas
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn InfraProvisioner>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own kind, replacing any previous one
    pub fn register(&mut self, provider: Arc<dyn InfraProvisioner>) -> &mut Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    /// Look up the provider for `kind`
    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn InfraProvisioner>> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::unsupported_provider(kind.to_string()))
    }

    pub fn contains(&self, kind: ProviderKind) -> bool {
        self.providers.contains_key(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_name_defaults_to_instance() {
        let spec = InfraSpec::new("prod", ProviderSettings::default());
        assert_eq!(spec.cluster_name(), "keel-prod");

        let spec = InfraSpec::new(
            "prod",
            ProviderSettings {
                cluster_name: Some("shared".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(spec.cluster_name(), "shared");
    }

    #[test]
    fn region_is_required_for_cloud() {
        let spec = InfraSpec::new("prod", ProviderSettings::default());
        assert!(matches!(
            spec.region(ProviderKind::Eks),
            Err(Error::Validation { .. })
        ));
    }

    #[test]
    fn node_count_is_at_least_one() {
        let spec = InfraSpec::new(
            "dev",
            ProviderSettings {
                node_count: Some(0),
                ..Default::default()
            },
        );
        assert_eq!(spec.node_count(), 1);
    }

    #[test]
    fn spec_from_definition_keeps_provider_settings() {
        let definition = KubernetesRuntimeDefinition {
            id: Some(1),
            name: "prod".to_string(),
            infra_provider: ProviderKind::Eks,
            provider_config: Some(ProviderSettings {
                cluster_name: Some("keel-prod".to_string()),
                region: Some("eu-west-1".to_string()),
                ..Default::default()
            }),
        };
        let spec = InfraSpec::from_definition(&definition);
        assert_eq!(spec.region(ProviderKind::Eks).ok(), Some("eu-west-1"));
        assert_eq!(spec.cluster_name(), "keel-prod");
    }

    #[test]
    fn registry_rejects_unregistered_provider() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(KindProvider::new()));
        assert!(registry.contains(ProviderKind::Kind));
        assert!(registry.get(ProviderKind::Kind).is_ok());
        assert!(matches!(
            registry.get(ProviderKind::Eks),
            Err(Error::UnsupportedProvider { .. })
        ));
    }
}
