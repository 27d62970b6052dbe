//! Kind to REST resource mapping backed by API discovery
//!
//! Objects handled by the reconciler are only known by their
//! GroupVersionKind. Before any request the kind is resolved to its plural
//! resource and scope through a [`RestMapper`]. The discovery-backed mapper is
//! built fresh for every client, so newly installed CRDs are always visible.

use std::time::Duration;

use keel_common::retry::{retry_while, RetryConfig};
use keel_common::{Error, Result};
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use kube::discovery::{Discovery, Scope};
use kube::Client;
use tracing::debug;

/// A concrete REST resource and whether it lives in a namespace
#[derive(Clone, Debug)]
pub struct RestMapping {
    pub resource: ApiResource,
    pub scope: Scope,
}

impl RestMapping {
    pub fn is_namespaced(&self) -> bool {
        matches!(self.scope, Scope::Namespaced)
    }
}

/// Resolves a GroupVersionKind to its REST mapping
#[cfg_attr(test, mockall::automock)]
pub trait RestMapper: Send + Sync {
    fn rest_mapping(&self, gvk: &GroupVersionKind) -> Result<RestMapping>;
}

/// [`RestMapper`] over the result of one discovery pass
pub struct DiscoveryMapper {
    discovery: Discovery,
}

impl DiscoveryMapper {
    /// Run discovery against `client` and wrap the result
    ///
    /// Discovery is retried a few times because aggregated API endpoints can
    /// be briefly unavailable right after installation. Credential rejections
    /// are returned immediately so the caller can refresh.
    pub async fn discover(client: &Client) -> Result<Self> {
        let config = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            ..RetryConfig::default()
        };
        let discovery = retry_while(
            &config,
            "api-discovery",
            || {
                let client = client.clone();
                async move {
                    Discovery::new(client)
                        .run()
                        .await
                        .map_err(|e| Error::from_kube("api-discovery", e))
                }
            },
            |e: &Error| !e.is_auth_failure(),
        )
        .await?;
        debug!(groups = discovery.groups().count(), "API discovery complete");
        Ok(Self { discovery })
    }
}

impl RestMapper for DiscoveryMapper {
    fn rest_mapping(&self, gvk: &GroupVersionKind) -> Result<RestMapping> {
        let (resource, caps) = self.discovery.resolve_gvk(gvk).ok_or_else(|| {
            Error::kube_client(
                "rest-mapping",
                format!("no resource found for {}", display_gvk(gvk)),
            )
        })?;
        Ok(RestMapping {
            resource,
            scope: caps.scope,
        })
    }
}

/// Split an apiVersion into (group, version); the core group is ""
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Extract the GroupVersionKind from a decoded JSON object
pub fn gvk_from_value(value: &serde_json::Value) -> Result<GroupVersionKind> {
    let api_version = value
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::serialization("object has no apiVersion"))?;
    let kind = value
        .get("kind")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::serialization("object has no kind"))?;
    let (group, version) = parse_api_version(api_version);
    Ok(GroupVersionKind::gvk(&group, &version, kind))
}

/// Extract the GroupVersionKind from a dynamic object's type metadata
pub fn gvk_of(obj: &DynamicObject) -> Result<GroupVersionKind> {
    let types = obj.types.as_ref().ok_or_else(|| {
        Error::serialization(format!(
            "object {} has no apiVersion/kind",
            obj.metadata.name.as_deref().unwrap_or("<unnamed>")
        ))
    })?;
    let (group, version) = parse_api_version(&types.api_version);
    Ok(GroupVersionKind::gvk(&group, &version, &types.kind))
}

pub(crate) fn display_gvk(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Fixed mapping for the handful of kinds tests use
    pub struct StaticMapper;

    impl RestMapper for StaticMapper {
        fn rest_mapping(&self, gvk: &GroupVersionKind) -> Result<RestMapping> {
            let (plural, scope) = match gvk.kind.as_str() {
                "Namespace" => ("namespaces", Scope::Cluster),
                "ClusterRole" => ("clusterroles", Scope::Cluster),
                "CustomResourceDefinition" => ("customresourcedefinitions", Scope::Cluster),
                "Deployment" => ("deployments", Scope::Namespaced),
                "Service" => ("services", Scope::Namespaced),
                "ConfigMap" => ("configmaps", Scope::Namespaced),
                _ => {
                    return Err(Error::kube_client(
                        "rest-mapping",
                        format!("no resource found for {}", display_gvk(gvk)),
                    ))
                }
            };
            Ok(RestMapping {
                resource: ApiResource::from_gvk_with_plural(gvk, plural),
                scope,
            })
        }
    }
}
