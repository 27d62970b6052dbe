//! Provisioning saga
//!
//! Brings up a new control-plane instance in thirteen ordered steps. Steps 1
//! and 2 only read config and validate input. From step 3 on, any failure
//! (including an interrupt observed at a step boundary) runs one
//! compensating routine that removes the control plane's external services,
//! deletes the infrastructure described by the last persisted inventory and,
//! once the config record has been written, removes that record again.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use keel_common::retry::retry_with_backoff;
use keel_common::{
    CloudAccount, CloudRuntimeDefinition, CloudRuntimeInstance, ControlPlaneApi,
    ControlPlaneInstanceConfig, Credential, Error, KubernetesRuntimeDefinition,
    KubernetesRuntimeInstance, ProviderKind, ProviderSettings, Result, RuntimeConnectionInfo,
    API_SERVER_PORT, API_SERVER_SERVICE, CONTROL_PLANE_NAMESPACE, DEFAULT_RUNTIME_NAME,
};
use keel_kube::Reconcile;

use crate::events::EventListeners;
use crate::installer::ControlPlaneInstaller;
use crate::inventory::InventoryFile;
use crate::manifests::Component;
use crate::pki::{CertificateAuthority, CertificateGenerator, CertificateRequest};
use crate::provider::{InfraProvisioner, InfraSpec, ProviderRegistry};
use crate::saga::SagaContext;

/// Step titles, in order
pub const STEPS: [&str; 13] = [
    "Loading instance config",
    "Validating flags",
    "Creating infrastructure",
    "Connecting to the runtime",
    "Installing dependencies",
    "Generating certificates",
    "Saving instance config",
    "Connecting to the control-plane API",
    "Installing the API server",
    "Waiting for the API server",
    "Reconnecting to the runtime",
    "Installing control-plane components",
    "Registering the runtime",
];

/// What to provision
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProvisionRequest {
    pub name: String,
    pub provider: ProviderKind,
    pub auth_enabled: bool,
    /// Replace an existing instance record of the same name
    pub force_overwrite: bool,
    pub settings: ProviderSettings,
}

fn is_dns_label(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 48
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

impl ProvisionRequest {
    /// Check flag combinations against the registered providers
    pub fn validate(&self, providers: &ProviderRegistry) -> Result<()> {
        if !is_dns_label(&self.name) {
            return Err(Error::validation_for_field(
                &self.name,
                "name",
                "instance name must be lowercase letters, digits and '-'",
            ));
        }
        if !providers.contains(self.provider) {
            return Err(Error::unsupported_provider(self.provider.to_string()));
        }
        if !self.provider.is_default() && !self.auth_enabled {
            return Err(Error::validation_for_field(
                &self.name,
                "auth-enabled",
                format!("the {} provider requires auth to be enabled", self.provider),
            ));
        }
        if self.provider.is_cloud() {
            let missing = |value: &Option<String>| value.as_deref().map_or(true, str::is_empty);
            if missing(&self.settings.account_id) {
                return Err(Error::validation_for_field(
                    &self.name,
                    "aws-account-id",
                    format!("the {} provider requires a cloud account id", self.provider),
                ));
            }
            if missing(&self.settings.region) {
                return Err(Error::validation_for_field(
                    &self.name,
                    "aws-region",
                    format!("the {} provider requires a region", self.provider),
                ));
            }
        }
        Ok(())
    }
}

/// How far a run got; drives the rollback
struct SagaRun<'a> {
    request: &'a ProvisionRequest,
    provider: Arc<dyn InfraProvisioner>,
    spec: InfraSpec,
    inventory: InventoryFile,
    reconciler: Option<Arc<dyn Reconcile>>,
    /// The config record has been written and must be removed on rollback
    remove_config: bool,
}

/// Provisions control-plane instances
pub struct ProvisioningSaga {
    context: SagaContext,
    certificates: Arc<dyn CertificateGenerator>,
    cancel: CancellationToken,
}

impl ProvisioningSaga {
    pub fn new(
        context: SagaContext,
        certificates: Arc<dyn CertificateGenerator>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            context,
            certificates,
            cancel,
        }
    }

    /// Log the step banner, or stop if an interrupt has been requested
    fn begin(&self, step: usize, instance: &str) -> Result<()> {
        let title = STEPS[step - 1];
        if self.cancel.is_cancelled() {
            return Err(Error::interrupted(title));
        }
        info!(instance = %instance, "[Step {}/{}] {}", step, STEPS.len(), title);
        Ok(())
    }

    /// Provision `request`, returning the persisted instance record
    pub async fn run(&self, request: &ProvisionRequest) -> Result<ControlPlaneInstanceConfig> {
        let name = request.name.as_str();

        self.begin(1, name)?;
        if self.context.store.get(name)?.is_some() {
            if !request.force_overwrite {
                return Err(Error::AlreadyExists {
                    instance: name.to_string(),
                });
            }
            warn!(instance = %name, "replacing existing instance config");
        }

        self.begin(2, name)?;
        request.validate(&self.context.providers)?;
        let provider = self.context.providers.get(request.provider)?;

        let mut run = SagaRun {
            request,
            provider,
            spec: InfraSpec::new(name, request.settings.clone()),
            inventory: self.context.inventory_file(name),
            reconciler: None,
            remove_config: false,
        };
        match self.provision(&mut run).await {
            Ok(config) => {
                if let Err(e) = self.context.store.set_current(Some(name.to_string())) {
                    warn!(instance = %name, error = %e, "failed to mark instance as current");
                }
                info!(
                    instance = %name,
                    provider = %request.provider,
                    address = %config.api_server_address,
                    "control plane ready"
                );
                Ok(config)
            }
            Err(cause) => Err(self.rollback(cause, &run).await),
        }
    }

    async fn provision(&self, run: &mut SagaRun<'_>) -> Result<ControlPlaneInstanceConfig> {
        let request = run.request;
        let name = request.name.as_str();

        self.begin(3, name)?;
        let connection = self.create_infrastructure(run).await?;

        self.begin(4, name)?;
        let mut runtime = KubernetesRuntimeInstance {
            name: DEFAULT_RUNTIME_NAME.to_string(),
            is_control_plane_host: true,
            default_runtime: true,
            connection,
            ..Default::default()
        };
        let reconciler = self.context.connector.connect(&mut runtime, None).await?;
        run.reconciler = Some(reconciler.clone());
        let installer = ControlPlaneInstaller::new(reconciler, self.context.manifests.clone());

        self.begin(5, name)?;
        installer.install(Component::Dependencies).await?;

        self.begin(6, name)?;
        let authority = if request.auth_enabled {
            Some(self.generate_credentials(name)?)
        } else {
            info!(instance = %name, "auth disabled, no certificates needed");
            None
        };

        self.begin(7, name)?;
        let settings = ProviderSettings {
            cluster_name: Some(run.spec.cluster_name()),
            ..request.settings.clone()
        };
        let record = ControlPlaneInstanceConfig {
            name: name.to_string(),
            provider: request.provider,
            api_server_address: run.provider.api_server_address(&run.spec).unwrap_or_default(),
            auth_enabled: request.auth_enabled,
            credentials: authority.iter().map(|(_, c)| c.clone()).collect(),
            provider_config: settings.clone(),
        };
        self.context.store.upsert(&record)?;
        run.remove_config = true;
        let mut config = self
            .context
            .store
            .get(name)?
            .ok_or_else(|| Error::not_found("control plane instance", name))?;

        self.begin(8, name)?;
        let mut api = if config.api_server_address.is_empty() {
            debug!(instance = %name, "API address known once the load balancer is up");
            None
        } else {
            Some(self.context.api_connector.connect(&config)?)
        };

        self.begin(9, name)?;
        installer.install(Component::ApiServer).await?;
        if run.provider.exposes_public_endpoint() {
            let host = installer
                .public_endpoint(&self.context.options.endpoint_retry)
                .await?;
            config.api_server_address = format!("{}:{}", host, API_SERVER_PORT);
            self.context.store.upsert(&config)?;
            api = Some(self.context.api_connector.connect(&config)?);
        }
        if let Some((ca, _)) = &authority {
            let sans = server_sans(address_host(&config.api_server_address));
            let serving = self
                .certificates
                .generate_certificate(ca, &CertificateRequest::server(API_SERVER_SERVICE, sans))?;
            installer.install_tls_assets(&serving).await?;
        }
        let api =
            api.ok_or_else(|| Error::api("readyz", "control-plane API address is unknown"))?;

        self.begin(10, name)?;
        let client = api.as_ref();
        retry_with_backoff(
            &self.context.options.health_retry,
            "control-plane API health",
            move || client.health(),
        )
        .await
        .map_err(|e| {
            Error::api(
                "readyz",
                format!("control-plane API never became healthy: {}", e),
            )
        })?;

        self.begin(11, name)?;
        if runtime.connection.bearer_token.is_some() {
            runtime.connection = run.provider.refresh_connection(&run.spec).await?;
        }
        let reconciler = self.context.connector.connect(&mut runtime, None).await?;
        run.reconciler = Some(reconciler.clone());
        let installer = ControlPlaneInstaller::new(reconciler, self.context.manifests.clone());

        self.begin(12, name)?;
        for component in Component::POST_API {
            installer.install(component).await?;
        }

        self.begin(13, name)?;
        register_runtime(api.as_ref(), request, &settings, runtime).await?;

        Ok(config)
    }

    /// Run the provider while relaying its events, giving up on interrupt
    async fn create_infrastructure(&self, run: &SagaRun<'_>) -> Result<RuntimeConnectionInfo> {
        let (events, listeners) = EventListeners::spawn(&run.spec.instance, run.inventory.clone());
        let created = tokio::select! {
            result = run.provider.create(&run.spec, events) => result,
            _ = self.cancel.cancelled() => Err(Error::interrupted(STEPS[2])),
        };
        listeners.shutdown().await;
        created
    }

    fn generate_credentials(&self, instance: &str) -> Result<(CertificateAuthority, Credential)> {
        let ca = self
            .certificates
            .generate_ca(&format!("keel-{}-ca", instance))?;
        let client = self.certificates.generate_certificate(
            &ca,
            &CertificateRequest::client(format!("keel-{}-admin", instance)),
        )?;
        let credential = Credential {
            name: "admin".to_string(),
            ca_cert: client.ca_pem,
            client_cert: client.cert_pem,
            client_key: client.key_pem,
        };
        Ok((ca, credential))
    }

    /// Undo whatever `run` created; returns `cause`, combined with any
    /// cleanup failures
    async fn rollback(&self, cause: Error, run: &SagaRun<'_>) -> Error {
        let name = run.request.name.as_str();
        warn!(instance = %name, error = %cause, "provisioning failed, rolling back");
        let mut failures = Vec::new();

        if let Some(reconciler) = &run.reconciler {
            let installer =
                ControlPlaneInstaller::new(reconciler.clone(), self.context.manifests.clone());
            if let Err(e) = installer.uninstall_services().await {
                failures.push(format!("removing control-plane services: {}", e));
            }
        }

        if matches!(cause, Error::Interrupted { .. }) {
            tokio::time::sleep(self.context.options.settle_delay).await;
        }
        let inventory = if run.provider.kind().is_cloud() {
            run.inventory.read()
        } else {
            Ok(None)
        };
        match inventory {
            Ok(inventory) => match run.provider.delete(&run.spec, inventory).await {
                Ok(()) => {
                    if let Err(e) = run.inventory.remove() {
                        warn!(instance = %name, error = %e, "failed to remove resource inventory");
                    }
                }
                Err(e) => failures.push(format!("deleting infrastructure: {}", e)),
            },
            Err(e) => failures.push(format!(
                "reading resource inventory {}: {}",
                run.inventory.path().display(),
                e
            )),
        }

        if run.remove_config {
            if let Err(e) = self.context.store.delete(name) {
                failures.push(format!("removing instance config: {}", e));
            }
        }

        if failures.is_empty() {
            info!(instance = %name, "rollback complete");
        } else {
            for failure in &failures {
                warn!(instance = %name, failure = %failure, "rollback step failed");
            }
            warn!(
                instance = %name,
                provider = %run.request.provider,
                "resources may be left behind and need manual cleanup"
            );
        }
        cause.with_rollback_failures(failures)
    }
}

fn address_host(address: &str) -> &str {
    address
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(address)
}

/// Names the API server certificate is valid for
fn server_sans(public_host: &str) -> Vec<String> {
    let mut sans = vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        API_SERVER_SERVICE.to_string(),
        format!("{}.{}", API_SERVER_SERVICE, CONTROL_PLANE_NAMESPACE),
        format!("{}.{}.svc", API_SERVER_SERVICE, CONTROL_PLANE_NAMESPACE),
    ];
    if !public_host.is_empty() && !sans.iter().any(|s| s == public_host) {
        sans.insert(0, public_host.to_string());
    }
    sans
}

fn require_id(id: Option<u64>, resource: &str) -> Result<u64> {
    id.ok_or_else(|| Error::api(resource, "response carried no id"))
}

/// Register the host runtime (and for cloud providers, the account behind
/// it) with the control-plane API
async fn register_runtime(
    api: &dyn ControlPlaneApi,
    request: &ProvisionRequest,
    settings: &ProviderSettings,
    mut runtime: KubernetesRuntimeInstance,
) -> Result<()> {
    let definition = api
        .create_runtime_definition(&KubernetesRuntimeDefinition {
            id: None,
            name: DEFAULT_RUNTIME_NAME.to_string(),
            infra_provider: request.provider,
            provider_config: Some(settings.clone()),
        })
        .await?;
    runtime.runtime_definition_id = Some(require_id(
        definition.id,
        "kubernetes-runtime-definitions",
    )?);
    runtime.reconciled = true;
    let runtime = api.create_runtime_instance(&runtime).await?;
    let runtime_id = require_id(runtime.id, "kubernetes-runtime-instances")?;
    info!(instance = %request.name, runtime = %runtime.name, id = runtime_id, "registered runtime");

    if !request.provider.is_cloud() {
        return Ok(());
    }
    let account = api
        .create_cloud_account(&CloudAccount {
            id: None,
            name: request.name.clone(),
            provider: request.provider,
            account_id: settings.account_id.clone().unwrap_or_default(),
        })
        .await?;
    let cloud_definition = api
        .create_cloud_runtime_definition(&CloudRuntimeDefinition {
            id: None,
            name: DEFAULT_RUNTIME_NAME.to_string(),
            cloud_account_id: require_id(account.id, "cloud-accounts")?,
            region: settings.region.clone(),
        })
        .await?;
    api.create_cloud_runtime_instance(&CloudRuntimeInstance {
        id: None,
        name: DEFAULT_RUNTIME_NAME.to_string(),
        cloud_runtime_definition_id: require_id(cloud_definition.id, "cloud-runtime-definitions")?,
        kubernetes_runtime_instance_id: runtime_id,
    })
    .await?;
    info!(instance = %request.name, account = %account.account_id, "registered cloud account");
    Ok(())
}
