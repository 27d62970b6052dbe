//! Collaborators shared by the provisioning and deprovisioning sagas

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use keel_common::retry::RetryConfig;
use keel_common::{ControlPlaneApi, ControlPlaneInstanceConfig, HttpControlPlaneApi, Result};
use keel_kube::RuntimeConnector;

use crate::inventory::InventoryFile;
use crate::manifests::ManifestSource;
use crate::provider::ProviderRegistry;
use crate::store::ConfigStore;

/// Delay before reading the inventory after an interrupt
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Opens a client to an instance's control-plane API
pub trait ApiConnector: Send + Sync {
    fn connect(&self, config: &ControlPlaneInstanceConfig) -> Result<Arc<dyn ControlPlaneApi>>;
}

/// [`ApiConnector`] producing [`HttpControlPlaneApi`] clients
#[derive(Clone, Copy, Debug, Default)]
pub struct HttpApiConnector;

impl ApiConnector for HttpApiConnector {
    fn connect(&self, config: &ControlPlaneInstanceConfig) -> Result<Arc<dyn ControlPlaneApi>> {
        Ok(Arc::new(HttpControlPlaneApi::from_config(config)?))
    }
}

/// Timing knobs for the sagas
#[derive(Clone, Debug)]
pub struct SagaOptions {
    /// Wait before reading the inventory after an interrupt, so an in-flight
    /// inventory write can land
    pub settle_delay: Duration,
    /// Polling of the control-plane API health endpoint
    pub health_retry: RetryConfig,
    /// Polling of the API server's load balancer address
    pub endpoint_retry: RetryConfig,
}

impl Default for SagaOptions {
    fn default() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
            health_retry: RetryConfig::fixed(60, Duration::from_secs(5)),
            endpoint_retry: RetryConfig::fixed(120, Duration::from_secs(5)),
        }
    }
}

/// Everything a saga talks to
#[derive(Clone)]
pub struct SagaContext {
    pub store: Arc<dyn ConfigStore>,
    pub providers: ProviderRegistry,
    pub connector: Arc<dyn RuntimeConnector>,
    pub api_connector: Arc<dyn ApiConnector>,
    pub manifests: Arc<dyn ManifestSource>,
    /// Directory holding inventory files
    pub keel_dir: PathBuf,
    pub options: SagaOptions,
}

impl SagaContext {
    pub fn inventory_file(&self, instance: &str) -> InventoryFile {
        InventoryFile::for_instance(&self.keel_dir, instance)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory collaborators for saga tests

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use kube::api::{DynamicObject, GroupVersionKind};
    use serde_json::{json, Value};
    use tokio_util::sync::CancellationToken;

    use keel_common::{
        CloudAccount, CloudRuntimeDefinition, CloudRuntimeInstance, Error,
        KubernetesRuntimeDefinition, KubernetesRuntimeInstance, ProviderKind,
        RuntimeConnectionInfo, API_SERVER_PORT,
    };
    use keel_kube::Reconcile;

    use super::*;
    use crate::events::ProvisionEvents;
    use crate::manifests::Component;
    use crate::provider::{InfraProvisioner, InfraSpec};
    use crate::store::FileConfigStore;

    pub(crate) fn object(value: Value) -> DynamicObject {
        serde_json::from_value(value).expect("valid object")
    }

    fn label(obj: &DynamicObject) -> String {
        format!(
            "{}/{}",
            obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or(""),
            obj.metadata.name.as_deref().unwrap_or("")
        )
    }

    /// Ordered record of what the fakes were asked to do
    #[derive(Clone, Default)]
    pub(crate) struct EventLog(Arc<Mutex<Vec<String>>>);

    impl EventLog {
        pub(crate) fn push(&self, entry: impl Into<String>) {
            self.0.lock().expect("log").push(entry.into());
        }

        pub(crate) fn entries(&self) -> Vec<String> {
            self.0.lock().expect("log").clone()
        }

        pub(crate) fn contains(&self, entry: &str) -> bool {
            self.entries().iter().any(|e| e == entry)
        }

        pub(crate) fn position(&self, entry: &str) -> Option<usize> {
            self.entries().iter().position(|e| e == entry)
        }
    }

    /// One Service + Deployment for the API server, one Deployment per
    /// other component
    #[derive(Default)]
    pub(crate) struct StaticManifests;

    impl ManifestSource for StaticManifests {
        fn objects(&self, component: Component) -> Result<Vec<DynamicObject>> {
            let deployment = |name: String| {
                object(json!({
                    "apiVersion": "apps/v1",
                    "kind": "Deployment",
                    "metadata": {"name": name, "namespace": "keel-system"},
                }))
            };
            Ok(match component {
                Component::ApiServer => vec![
                    object(json!({
                        "apiVersion": "v1",
                        "kind": "Service",
                        "metadata": {"name": "keel-api-server", "namespace": "keel-system"},
                        "spec": {"type": "LoadBalancer"},
                    })),
                    deployment("keel-api-server".to_string()),
                ],
                other => vec![deployment(format!("keel-{}", other))],
            })
        }
    }

    #[derive(Default)]
    struct LoadBalancer {
        misses: usize,
        address: Option<String>,
    }

    /// Records applies/deletes; serves the API server Service on `get`
    pub(crate) struct FakeReconciler {
        log: EventLog,
        applied: Mutex<Vec<DynamicObject>>,
        load_balancer: Mutex<LoadBalancer>,
        failing: Mutex<Option<String>>,
    }

    impl FakeReconciler {
        pub(crate) fn new(log: EventLog) -> Self {
            Self {
                log,
                applied: Mutex::new(Vec::new()),
                load_balancer: Mutex::new(LoadBalancer::default()),
                failing: Mutex::new(None),
            }
        }

        /// The Service gets `address` after `misses` lookups without one
        pub(crate) fn set_load_balancer_after(&self, misses: usize, address: &str) {
            *self.load_balancer.lock().expect("lb") = LoadBalancer {
                misses,
                address: Some(address.to_string()),
            };
        }

        /// Applying `Kind/name` fails
        pub(crate) fn fail_on(&self, label: &str) {
            *self.failing.lock().expect("failing") = Some(label.to_string());
        }

        pub(crate) fn applied(&self) -> Vec<DynamicObject> {
            self.applied.lock().expect("applied").clone()
        }
    }

    #[async_trait]
    impl Reconcile for FakeReconciler {
        async fn get(
            &self,
            gvk: &GroupVersionKind,
            namespace: &str,
            name: &str,
        ) -> Result<DynamicObject> {
            let mut lb = self.load_balancer.lock().expect("lb");
            let ingress = if lb.misses > 0 {
                lb.misses -= 1;
                json!([])
            } else {
                match &lb.address {
                    Some(address) => json!([{"hostname": address}]),
                    None => json!([]),
                }
            };
            Ok(object(json!({
                "apiVersion": "v1",
                "kind": gvk.kind,
                "metadata": {"name": name, "namespace": namespace},
                "status": {"loadBalancer": {"ingress": ingress}},
            })))
        }

        async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
            self.create_or_update(obj).await
        }

        async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject> {
            self.create_or_update(obj).await
        }

        async fn create_or_update(&self, obj: &DynamicObject) -> Result<DynamicObject> {
            let label = label(obj);
            if self.failing.lock().expect("failing").as_deref() == Some(label.as_str()) {
                return Err(Error::kube_client("apply", format!("{} rejected", label)));
            }
            self.log.push(format!("apply {}", label));
            self.applied.lock().expect("applied").push(obj.clone());
            Ok(obj.clone())
        }

        async fn delete(&self, obj: &DynamicObject) -> Result<()> {
            self.log.push(format!("delete {}", label(obj)));
            Ok(())
        }
    }

    /// Connects to a shared [`FakeReconciler`]; the first `auth_failures`
    /// connects are rejected as unauthorized
    pub(crate) struct FakeConnector {
        log: EventLog,
        reconciler: Arc<FakeReconciler>,
        auth_failures: AtomicUsize,
    }

    impl FakeConnector {
        pub(crate) fn new(log: EventLog, reconciler: Arc<FakeReconciler>) -> Self {
            Self {
                log,
                reconciler,
                auth_failures: AtomicUsize::new(0),
            }
        }

        pub(crate) fn reject_first(self, count: usize) -> Self {
            self.auth_failures.store(count, Ordering::SeqCst);
            self
        }
    }

    #[async_trait]
    impl RuntimeConnector for FakeConnector {
        async fn connect(
            &self,
            runtime: &mut KubernetesRuntimeInstance,
            _api: Option<&dyn ControlPlaneApi>,
        ) -> Result<Arc<dyn Reconcile>> {
            self.log.push(format!("connect {}", runtime.name));
            let remaining = self.auth_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.auth_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(Error::KubeClient {
                    context: "discovery".to_string(),
                    message: "Unauthorized".to_string(),
                    auth_failure: true,
                });
            }
            Ok(self.reconciler.clone())
        }

        async fn refresh(
            &self,
            runtime: &mut KubernetesRuntimeInstance,
            api: &dyn ControlPlaneApi,
        ) -> Result<()> {
            self.log.push(format!("refresh {}", runtime.name));
            runtime.connection.bearer_token = Some("fresh-token".to_string());
            api.update_runtime_instance(runtime).await?;
            Ok(())
        }
    }

    /// How [`FakeProvider::create`] behaves
    #[derive(Clone)]
    pub(crate) enum CreateBehavior {
        Succeed,
        /// Record the inventory, then fail
        FailAfter(Value),
        /// Record the inventory, cancel the token, then never finish
        InterruptAfter(Value, CancellationToken),
    }

    pub(crate) fn certificate_connection() -> RuntimeConnectionInfo {
        RuntimeConnectionInfo {
            api_endpoint: "https://127.0.0.1:40123".to_string(),
            ca_certificate: "CA".to_string(),
            certificate: Some("CERT".to_string()),
            key: Some("KEY".to_string()),
            ..Default::default()
        }
    }

    pub(crate) fn token_connection(token: &str) -> RuntimeConnectionInfo {
        RuntimeConnectionInfo {
            api_endpoint: "https://abc.gr7.us-east-1.eks.amazonaws.com".to_string(),
            ca_certificate: "CA".to_string(),
            bearer_token: Some(token.to_string()),
            token_expiration: Some(chrono::Utc::now() + chrono::Duration::minutes(14)),
            ..Default::default()
        }
    }

    pub(crate) struct FakeProvider {
        kind: ProviderKind,
        log: EventLog,
        create: CreateBehavior,
        fail_delete: bool,
        pub(crate) deletes: Mutex<Vec<Option<Value>>>,
    }

    impl FakeProvider {
        pub(crate) fn new(kind: ProviderKind, log: EventLog) -> Self {
            Self {
                kind,
                log,
                create: CreateBehavior::Succeed,
                fail_delete: false,
                deletes: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn on_create(mut self, behavior: CreateBehavior) -> Self {
            self.create = behavior;
            self
        }

        pub(crate) fn failing_delete(mut self) -> Self {
            self.fail_delete = true;
            self
        }

        pub(crate) fn deletes(&self) -> Vec<Option<Value>> {
            self.deletes.lock().expect("deletes").clone()
        }

        fn connection(&self) -> RuntimeConnectionInfo {
            if self.kind.is_cloud() {
                token_connection("bootstrap-token")
            } else {
                certificate_connection()
            }
        }
    }

    #[async_trait]
    impl InfraProvisioner for FakeProvider {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        async fn create(
            &self,
            spec: &InfraSpec,
            events: ProvisionEvents,
        ) -> Result<RuntimeConnectionInfo> {
            self.log.push(format!("create infra {}", spec.cluster_name()));
            events.progress("creating cluster").await;
            match &self.create {
                CreateBehavior::Succeed => Ok(self.connection()),
                CreateBehavior::FailAfter(inventory) => {
                    events.record_inventory(inventory.clone()).await;
                    Err(Error::infra(&spec.instance, self.kind.as_str(), "quota exceeded"))
                }
                CreateBehavior::InterruptAfter(inventory, token) => {
                    events.record_inventory(inventory.clone()).await;
                    token.cancel();
                    std::future::pending::<Result<RuntimeConnectionInfo>>().await
                }
            }
        }

        async fn delete(&self, spec: &InfraSpec, inventory: Option<Value>) -> Result<()> {
            self.log.push(format!("delete infra {}", spec.cluster_name()));
            self.deletes.lock().expect("deletes").push(inventory);
            if self.fail_delete {
                return Err(Error::infra(&spec.instance, self.kind.as_str(), "stack stuck"));
            }
            Ok(())
        }

        async fn refresh_connection(&self, _spec: &InfraSpec) -> Result<RuntimeConnectionInfo> {
            self.log.push("refresh infra connection");
            Ok(token_connection("post-install-token"))
        }

        fn exposes_public_endpoint(&self) -> bool {
            self.kind.is_cloud()
        }

        fn api_server_address(&self, _spec: &InfraSpec) -> Option<String> {
            (!self.kind.is_cloud()).then(|| format!("localhost:{}", API_SERVER_PORT))
        }
    }

    /// In-memory control-plane API
    pub(crate) struct FakeApi {
        log: EventLog,
        healthy: bool,
        workloads: usize,
        next_id: AtomicU64,
        definitions: Mutex<HashMap<u64, KubernetesRuntimeDefinition>>,
        pub(crate) runtimes: Mutex<Vec<KubernetesRuntimeInstance>>,
    }

    impl FakeApi {
        pub(crate) fn new(log: EventLog) -> Self {
            Self {
                log,
                healthy: true,
                workloads: 0,
                next_id: AtomicU64::new(1),
                definitions: Mutex::new(HashMap::new()),
                runtimes: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn unhealthy(mut self) -> Self {
            self.healthy = false;
            self
        }

        pub(crate) fn with_workloads(mut self, count: usize) -> Self {
            self.workloads = count;
            self
        }

        pub(crate) fn with_host_runtime(self, runtime: KubernetesRuntimeInstance) -> Self {
            self.runtimes.lock().expect("runtimes").push(runtime);
            self
        }

        fn id(&self) -> u64 {
            self.next_id.fetch_add(1, Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ControlPlaneApi for FakeApi {
        async fn health(&self) -> Result<()> {
            if self.healthy {
                Ok(())
            } else {
                Err(Error::api("readyz", "503 Service Unavailable"))
            }
        }

        async fn get_runtime_definition(&self, id: u64) -> Result<KubernetesRuntimeDefinition> {
            self.definitions
                .lock()
                .expect("definitions")
                .get(&id)
                .cloned()
                .ok_or_else(|| Error::not_found("kubernetes runtime definition", id.to_string()))
        }

        async fn create_runtime_definition(
            &self,
            definition: &KubernetesRuntimeDefinition,
        ) -> Result<KubernetesRuntimeDefinition> {
            self.log.push(format!("register runtime definition {}", definition.name));
            let created = KubernetesRuntimeDefinition {
                id: Some(self.id()),
                ..definition.clone()
            };
            if let Some(id) = created.id {
                self.definitions
                    .lock()
                    .expect("definitions")
                    .insert(id, created.clone());
            }
            Ok(created)
        }

        async fn create_runtime_instance(
            &self,
            runtime: &KubernetesRuntimeInstance,
        ) -> Result<KubernetesRuntimeInstance> {
            self.log.push(format!("register runtime instance {}", runtime.name));
            let created = KubernetesRuntimeInstance {
                id: Some(self.id()),
                ..runtime.clone()
            };
            self.runtimes.lock().expect("runtimes").push(created.clone());
            Ok(created)
        }

        async fn update_runtime_instance(
            &self,
            runtime: &KubernetesRuntimeInstance,
        ) -> Result<KubernetesRuntimeInstance> {
            self.log.push(format!("update runtime instance {}", runtime.name));
            Ok(runtime.clone())
        }

        async fn list_runtime_instances(&self) -> Result<Vec<KubernetesRuntimeInstance>> {
            Ok(self.runtimes.lock().expect("runtimes").clone())
        }

        async fn create_cloud_account(&self, account: &CloudAccount) -> Result<CloudAccount> {
            self.log.push(format!("register cloud account {}", account.account_id));
            Ok(CloudAccount {
                id: Some(self.id()),
                ..account.clone()
            })
        }

        async fn create_cloud_runtime_definition(
            &self,
            definition: &CloudRuntimeDefinition,
        ) -> Result<CloudRuntimeDefinition> {
            self.log
                .push(format!("register cloud runtime definition {}", definition.name));
            Ok(CloudRuntimeDefinition {
                id: Some(self.id()),
                ..definition.clone()
            })
        }

        async fn create_cloud_runtime_instance(
            &self,
            instance: &CloudRuntimeInstance,
        ) -> Result<CloudRuntimeInstance> {
            self.log
                .push(format!("register cloud runtime instance {}", instance.name));
            Ok(CloudRuntimeInstance {
                id: Some(self.id()),
                ..instance.clone()
            })
        }

        async fn count_workload_instances(&self) -> Result<usize> {
            Ok(self.workloads)
        }
    }

    /// Hands out the same [`FakeApi`] for every config
    pub(crate) struct FakeApiConnector {
        log: EventLog,
        api: Arc<FakeApi>,
    }

    impl FakeApiConnector {
        pub(crate) fn new(log: EventLog, api: Arc<FakeApi>) -> Self {
            Self { log, api }
        }
    }

    impl ApiConnector for FakeApiConnector {
        fn connect(&self, config: &ControlPlaneInstanceConfig) -> Result<Arc<dyn ControlPlaneApi>> {
            self.log.push(format!("api client {}", config.api_server_address));
            Ok(self.api.clone())
        }
    }

    /// A wired-up context over fakes and a temp keel directory
    pub(crate) struct Harness {
        _dir: tempfile::TempDir,
        pub(crate) log: EventLog,
        pub(crate) store: Arc<FileConfigStore>,
        pub(crate) reconciler: Arc<FakeReconciler>,
        pub(crate) provider: Arc<FakeProvider>,
        pub(crate) api: Arc<FakeApi>,
        pub(crate) context: SagaContext,
    }

    pub(crate) struct HarnessBuilder {
        kind: ProviderKind,
        create: CreateBehavior,
        fail_delete: bool,
        healthy: bool,
        workloads: usize,
        host_runtime: Option<KubernetesRuntimeInstance>,
        auth_failures: usize,
        store: Option<Arc<dyn ConfigStore>>,
    }

    impl HarnessBuilder {
        pub(crate) fn new(kind: ProviderKind) -> Self {
            Self {
                kind,
                create: CreateBehavior::Succeed,
                fail_delete: false,
                healthy: true,
                workloads: 0,
                host_runtime: None,
                auth_failures: 0,
                store: None,
            }
        }

        pub(crate) fn on_create(mut self, behavior: CreateBehavior) -> Self {
            self.create = behavior;
            self
        }

        pub(crate) fn failing_delete(mut self) -> Self {
            self.fail_delete = true;
            self
        }

        pub(crate) fn unhealthy_api(mut self) -> Self {
            self.healthy = false;
            self
        }

        pub(crate) fn workloads(mut self, count: usize) -> Self {
            self.workloads = count;
            self
        }

        pub(crate) fn host_runtime(mut self, runtime: KubernetesRuntimeInstance) -> Self {
            self.host_runtime = Some(runtime);
            self
        }

        pub(crate) fn reject_first_connects(mut self, count: usize) -> Self {
            self.auth_failures = count;
            self
        }

        pub(crate) fn store(mut self, store: Arc<dyn ConfigStore>) -> Self {
            self.store = Some(store);
            self
        }

        pub(crate) fn build(self) -> Harness {
            let dir = tempfile::tempdir().expect("tempdir");
            let log = EventLog::default();
            let file_store = Arc::new(FileConfigStore::in_dir(dir.path()));
            let reconciler = Arc::new(FakeReconciler::new(log.clone()));
            if self.kind.is_cloud() {
                reconciler.set_load_balancer_after(0, "abc.elb.amazonaws.com");
            }

            let mut provider = FakeProvider::new(self.kind, log.clone()).on_create(self.create);
            if self.fail_delete {
                provider = provider.failing_delete();
            }
            let provider = Arc::new(provider);
            let mut providers = ProviderRegistry::new();
            providers.register(provider.clone());

            let mut api = FakeApi::new(log.clone()).with_workloads(self.workloads);
            if !self.healthy {
                api = api.unhealthy();
            }
            if let Some(runtime) = self.host_runtime {
                api = api.with_host_runtime(runtime);
            }
            let api = Arc::new(api);

            let context = SagaContext {
                store: self
                    .store
                    .unwrap_or_else(|| file_store.clone() as Arc<dyn ConfigStore>),
                providers,
                connector: Arc::new(
                    FakeConnector::new(log.clone(), reconciler.clone())
                        .reject_first(self.auth_failures),
                ),
                api_connector: Arc::new(FakeApiConnector::new(log.clone(), api.clone())),
                manifests: Arc::new(StaticManifests),
                keel_dir: dir.path().to_path_buf(),
                options: SagaOptions {
                    settle_delay: Duration::ZERO,
                    health_retry: RetryConfig::fixed(3, Duration::from_millis(1)),
                    endpoint_retry: RetryConfig::fixed(3, Duration::from_millis(1)),
                },
            };

            Harness {
                _dir: dir,
                log,
                store: file_store,
                reconciler,
                provider,
                api,
                context,
            }
        }
    }
}
