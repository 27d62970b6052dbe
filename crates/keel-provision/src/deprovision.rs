//! Deprovisioning saga
//!
//! Tears an instance down in the reverse order it was built: externally
//! routed services first (so a provider load balancer is released), then the
//! infrastructure, then the local inventory and config record.

use std::sync::Arc;

use tracing::{info, warn};

use keel_common::{ControlPlaneApi, ControlPlaneInstanceConfig, Error, Result};
use keel_kube::Reconcile;

use crate::installer::ControlPlaneInstaller;
use crate::provider::{InfraProvisioner, InfraSpec};
use crate::saga::SagaContext;

/// Deletes control-plane instances
pub struct DeprovisioningSaga {
    context: SagaContext,
}

impl DeprovisioningSaga {
    pub fn new(context: SagaContext) -> Self {
        Self { context }
    }

    /// Delete instance `name` and everything it runs on
    pub async fn run(&self, name: &str) -> Result<()> {
        let config = self
            .context
            .store
            .get(name)?
            .ok_or_else(|| Error::not_found("control plane instance", name))?;
        let provider = self.context.providers.get(config.provider)?;
        let spec = InfraSpec::new(name, config.provider_config.clone());
        info!(instance = %name, provider = %config.provider, "deleting control plane");

        if provider.exposes_public_endpoint() {
            self.release_public_endpoint(&config).await?;
        }

        let inventory_file = self.context.inventory_file(name);
        let inventory = if provider.kind().is_cloud() {
            inventory_file.read()?
        } else {
            None
        };
        delete_infrastructure(provider.as_ref(), &spec, inventory).await?;

        if let Err(e) = inventory_file.remove() {
            warn!(
                instance = %name,
                path = %inventory_file.path().display(),
                error = %e,
                "failed to remove resource inventory"
            );
        }
        // Also clears the current instance if it pointed here
        self.context.store.delete(name)?;
        info!(instance = %name, "control plane deleted");
        Ok(())
    }

    /// Refuse if workloads remain, then remove the control plane's external
    /// services
    async fn release_public_endpoint(&self, config: &ControlPlaneInstanceConfig) -> Result<()> {
        let api = self.context.api_connector.connect(config)?;

        let workloads = api.count_workload_instances().await?;
        if workloads > 0 {
            return Err(Error::WorkloadsPresent {
                instance: config.name.clone(),
                count: workloads,
            });
        }

        let reconciler = self.connect_host_runtime(api.as_ref(), &config.name).await?;
        ControlPlaneInstaller::new(reconciler, self.context.manifests.clone())
            .uninstall_services()
            .await
    }

    /// Reconciler for the runtime hosting the control plane, refreshing its
    /// credentials once if they are rejected
    async fn connect_host_runtime(
        &self,
        api: &dyn ControlPlaneApi,
        instance: &str,
    ) -> Result<Arc<dyn Reconcile>> {
        let mut runtime = api
            .list_runtime_instances()
            .await?
            .into_iter()
            .find(|r| r.is_control_plane_host)
            .ok_or_else(|| Error::not_found("control plane host runtime", instance))?;

        match self.context.connector.connect(&mut runtime, Some(api)).await {
            Ok(reconciler) => Ok(reconciler),
            Err(e) if e.is_auth_failure() => {
                warn!(instance = %instance, runtime = %runtime.name, error = %e, "runtime credentials rejected, refreshing");
                self.context.connector.refresh(&mut runtime, api).await?;
                self.context.connector.connect(&mut runtime, Some(api)).await
            }
            Err(e) => Err(e),
        }
    }
}

async fn delete_infrastructure(
    provider: &dyn InfraProvisioner,
    spec: &InfraSpec,
    inventory: Option<serde_json::Value>,
) -> Result<()> {
    info!(instance = %spec.instance, cluster = %spec.cluster_name(), "deleting infrastructure");
    provider.delete(spec, inventory).await
}
