//! Installs and removes control-plane components on a runtime

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use kube::api::{DynamicObject, GroupVersionKind};
use serde_json::{json, Value};
use tracing::{debug, info};

use keel_common::retry::{retry_with_backoff, RetryConfig};
use keel_common::{
    Error, Result, API_SERVER_SERVICE, CONTROL_PLANE_NAMESPACE, MANAGED_BY_LABEL, MANAGED_BY_VALUE,
};
use keel_kube::Reconcile;

use crate::manifests::{Component, ManifestSource};
use crate::pki::CertificatePair;

/// Secret holding the API server's serving certificate
pub const API_SERVER_TLS_SECRET: &str = "keel-api-server-tls";

fn service_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("", "v1", "Service")
}

fn with_context(context: String, err: Error) -> Error {
    match err {
        Error::Kube { source } => Error::from_kube(context, source),
        other => other,
    }
}

/// Services that route traffic from outside the runtime
fn is_external_service(obj: &DynamicObject) -> bool {
    let is_service = obj.types.as_ref().is_some_and(|t| t.kind == "Service");
    let service_type = obj
        .data
        .pointer("/spec/type")
        .and_then(Value::as_str)
        .unwrap_or("ClusterIP");
    is_service && matches!(service_type, "LoadBalancer" | "NodePort")
}

/// First ingress hostname or IP of a LoadBalancer Service
pub(crate) fn load_balancer_address(service: &DynamicObject) -> Option<String> {
    let ingress = service.data.pointer("/status/loadBalancer/ingress/0")?;
    ingress
        .get("hostname")
        .or_else(|| ingress.get("ip"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Applies component manifests through a reconciler
#[derive(Clone)]
pub struct ControlPlaneInstaller {
    reconciler: Arc<dyn Reconcile>,
    manifests: Arc<dyn ManifestSource>,
}

impl ControlPlaneInstaller {
    pub fn new(reconciler: Arc<dyn Reconcile>, manifests: Arc<dyn ManifestSource>) -> Self {
        Self {
            reconciler,
            manifests,
        }
    }

    /// Create or update every object of `component`; the first failure aborts
    pub async fn install(&self, component: Component) -> Result<()> {
        let objects = self.manifests.objects(component)?;
        info!(component = %component, objects = objects.len(), "installing component");
        for obj in &objects {
            self.reconciler
                .create_or_update(obj)
                .await
                .map_err(|e| with_context(format!("install {}", component), e))?;
            debug!(
                component = %component,
                kind = obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or(""),
                name = obj.metadata.name.as_deref().unwrap_or(""),
                "applied"
            );
        }
        Ok(())
    }

    /// Delete the API server's externally routed Services
    ///
    /// Releases any provider load balancer in front of the control plane.
    /// Services that are already gone count as deleted.
    pub async fn uninstall_services(&self) -> Result<()> {
        let objects = self.manifests.objects(Component::ApiServer)?;
        for service in objects.iter().filter(|o| is_external_service(o)) {
            info!(
                name = service.metadata.name.as_deref().unwrap_or(""),
                "removing control-plane service"
            );
            self.reconciler
                .delete(service)
                .await
                .map_err(|e| with_context("uninstall services".to_string(), e))?;
        }
        Ok(())
    }

    /// Store the API server's serving certificate
    pub async fn install_tls_assets(&self, pair: &CertificatePair) -> Result<()> {
        let secret: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {
                "name": API_SERVER_TLS_SECRET,
                "namespace": CONTROL_PLANE_NAMESPACE,
                "labels": { MANAGED_BY_LABEL: MANAGED_BY_VALUE },
            },
            "type": "kubernetes.io/tls",
            "data": {
                "tls.crt": STANDARD.encode(&pair.cert_pem),
                "tls.key": STANDARD.encode(&pair.key_pem),
                "ca.crt": STANDARD.encode(&pair.ca_pem),
            },
        }))
        .map_err(|e| Error::serialization_for_kind("Secret", e.to_string()))?;

        self.reconciler
            .create_or_update(&secret)
            .await
            .map_err(|e| with_context("install tls assets".to_string(), e))?;
        info!(secret = API_SERVER_TLS_SECRET, "installed API server certificate");
        Ok(())
    }

    /// Wait for the API server Service's load balancer to get an address
    pub async fn public_endpoint(&self, retry: &RetryConfig) -> Result<String> {
        let gvk = service_gvk();
        let gvk = &gvk;
        let reconciler = &self.reconciler;
        retry_with_backoff(retry, "api-server load balancer", || async move {
            let service = reconciler
                .get(gvk, CONTROL_PLANE_NAMESPACE, API_SERVER_SERVICE)
                .await?;
            load_balancer_address(&service).ok_or_else(|| {
                Error::kube_client(
                    "api-server load balancer",
                    "no ingress address assigned yet",
                )
            })
        })
        .await
    }
}
