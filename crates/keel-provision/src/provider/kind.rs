//! Local kind clusters

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;
use tracing::info;

use keel_common::{
    Error, ProviderKind, Result, RuntimeConnectionInfo, API_SERVER_PORT,
};

use super::process::{run_capture, StreamingCommand};
use super::{InfraProvisioner, InfraSpec};
use crate::events::ProvisionEvents;

/// NodePort the control-plane API Service is published on in kind clusters
pub const KIND_API_NODE_PORT: u16 = 30080;

/// Runs kind on the local Docker daemon
#[derive(Clone, Debug, Default)]
pub struct KindProvider;

impl KindProvider {
    pub fn new() -> Self {
        Self
    }
}

/// Cluster config: one control-plane node publishing the API NodePort on the
/// host, plus `node_count - 1` workers
fn cluster_config(node_count: u32) -> String {
    let mut config = format!(
        r#"kind: Cluster
apiVersion: kind.x-k8s.io/v1alpha4
nodes:
- role: control-plane
  extraPortMappings:
  - containerPort: {node_port}
    hostPort: {host_port}
    protocol: TCP
"#,
        node_port = KIND_API_NODE_PORT,
        host_port = API_SERVER_PORT,
    );
    for _ in 1..node_count {
        config.push_str("- role: worker\n");
    }
    config
}

fn decode_data(value: Option<&Value>, field: &str) -> Result<String> {
    let encoded = value
        .and_then(Value::as_str)
        .ok_or_else(|| Error::serialization(format!("kind kubeconfig has no {}", field)))?;
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::serialization(format!("kind kubeconfig {}: {}", field, e)))?;
    String::from_utf8(bytes)
        .map_err(|e| Error::serialization(format!("kind kubeconfig {}: {}", field, e)))
}

/// Pull endpoint, CA and client cert/key out of `kind get kubeconfig` output
pub(crate) fn connection_from_kubeconfig(yaml: &str) -> Result<RuntimeConnectionInfo> {
    let doc: Value = serde_yaml::from_str(yaml)
        .map_err(|e| Error::serialization(format!("invalid kind kubeconfig: {}", e)))?;

    let cluster = doc.pointer("/clusters/0/cluster");
    let user = doc.pointer("/users/0/user");
    let api_endpoint = cluster
        .and_then(|c| c.get("server"))
        .and_then(Value::as_str)
        .ok_or_else(|| Error::serialization("kind kubeconfig has no server"))?
        .to_string();

    Ok(RuntimeConnectionInfo {
        api_endpoint,
        ca_certificate: decode_data(
            cluster.and_then(|c| c.get("certificate-authority-data")),
            "certificate-authority-data",
        )?,
        certificate: Some(decode_data(
            user.and_then(|u| u.get("client-certificate-data")),
            "client-certificate-data",
        )?),
        key: Some(decode_data(
            user.and_then(|u| u.get("client-key-data")),
            "client-key-data",
        )?),
        bearer_token: None,
        token_expiration: None,
    })
}

#[async_trait]
impl InfraProvisioner for KindProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Kind
    }

    async fn create(
        &self,
        spec: &InfraSpec,
        events: ProvisionEvents,
    ) -> Result<RuntimeConnectionInfo> {
        let name = spec.cluster_name();
        info!(cluster = %name, nodes = spec.node_count(), "creating kind cluster");

        let config = cluster_config(spec.node_count());
        let mut cmd = StreamingCommand::spawn(
            "kind",
            &["create", "cluster", "--name", &name, "--config", "-"],
            Some(&config),
        )
        .await?;
        while let Some(line) = cmd.next_line().await? {
            events.progress(line).await;
        }
        cmd.finish()
            .await
            .map_err(|e| Error::infra(&spec.instance, "kind", e.to_string()))?;

        let kubeconfig = run_capture("kind", &["get", "kubeconfig", "--name", &name])
            .await
            .map_err(|e| Error::infra(&spec.instance, "kind", e.to_string()))?;
        connection_from_kubeconfig(&kubeconfig)
    }

    async fn delete(&self, spec: &InfraSpec, _inventory: Option<Value>) -> Result<()> {
        let name = spec.cluster_name();
        info!(cluster = %name, "deleting kind cluster");
        // kind treats a missing cluster as already deleted
        run_capture("kind", &["delete", "cluster", "--name", &name])
            .await
            .map(|_| ())
            .map_err(|e| Error::infra(&spec.instance, "kind", e.to_string()))
    }

    fn api_server_address(&self, _spec: &InfraSpec) -> Option<String> {
        Some(format!("localhost:{}", API_SERVER_PORT))
    }
}
