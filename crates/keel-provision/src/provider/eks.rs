//! Amazon EKS clusters, driven through eksctl and the AWS CLI
//!
//! eksctl deploys one CloudFormation stack per piece of infrastructure. Each
//! stack name is recorded in the inventory as soon as eksctl mentions it, so
//! an interrupted run can still be cleaned up. Runtime access uses short-lived
//! bearer tokens from `aws eks get-token`, which is why this provider is also
//! the client factory's token refresher.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use keel_common::{Error, KubernetesRuntimeDefinition, ProviderKind, Result, RuntimeConnectionInfo};
use keel_kube::ConnectionRefresher;

use super::process::{run_capture, StreamingCommand};
use super::{InfraProvisioner, InfraSpec};
use crate::events::ProvisionEvents;

/// Resources eksctl created for one cluster
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EksInventory {
    pub cluster_name: String,
    pub region: String,
    #[serde(default)]
    pub stacks: Vec<String>,
}

impl EksInventory {
    fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|e| Error::serialization(e.to_string()))
    }

    /// Record a stack; returns false if it was already known
    fn add_stack(&mut self, stack: String) -> bool {
        if self.stacks.contains(&stack) {
            false
        } else {
            self.stacks.push(stack);
            true
        }
    }
}

/// Provisions EKS clusters in one AWS account
#[derive(Clone, Debug)]
pub struct EksProvider {
    eksctl: String,
    aws: String,
}

impl Default for EksProvider {
    fn default() -> Self {
        Self::with_binaries("eksctl", "aws")
    }
}

impl EksProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the given eksctl and AWS CLI executables instead of the ones on PATH
    pub fn with_binaries(eksctl: impl Into<String>, aws: impl Into<String>) -> Self {
        Self {
            eksctl: eksctl.into(),
            aws: aws.into(),
        }
    }

    async fn connection(&self, spec: &InfraSpec) -> Result<RuntimeConnectionInfo> {
        let name = spec.cluster_name();
        let region = spec.region(ProviderKind::Eks)?;

        let described = run_capture(
            &self.aws,
            &[
                "eks", "describe-cluster", "--name", &name, "--region", region, "--output", "json",
            ],
        )
        .await?;
        let (api_endpoint, ca_certificate) = parse_describe_cluster(&described)?;

        let credential = run_capture(
            &self.aws,
            &[
                "eks",
                "get-token",
                "--cluster-name",
                &name,
                "--region",
                region,
                "--output",
                "json",
            ],
        )
        .await
        .map_err(|e| Error::auth_refresh("eks", e.to_string()))?;
        let (token, expiration) = parse_exec_credential(&credential)?;

        Ok(RuntimeConnectionInfo {
            api_endpoint,
            ca_certificate,
            certificate: None,
            key: None,
            bearer_token: Some(token),
            token_expiration: expiration,
        })
    }
}

/// Extract a stack name from an eksctl log line
pub(crate) fn stack_name(line: &str) -> Option<String> {
    let start = line.find("stack \"")? + "stack \"".len();
    let rest = &line[start..];
    let name = &rest[..rest.find('"')?];
    name.starts_with("eksctl-").then(|| name.to_string())
}

/// Endpoint and PEM CA from `aws eks describe-cluster` output
pub(crate) fn parse_describe_cluster(json: &str) -> Result<(String, String)> {
    let doc: Value = serde_json::from_str(json)
        .map_err(|e| Error::serialization(format!("invalid describe-cluster output: {}", e)))?;
    let endpoint = doc
        .pointer("/cluster/endpoint")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::serialization("describe-cluster output has no endpoint"))?;
    let ca_data = doc
        .pointer("/cluster/certificateAuthority/data")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::serialization("describe-cluster output has no CA data"))?;
    let ca = STANDARD
        .decode(ca_data)
        .map_err(|e| Error::serialization(format!("invalid cluster CA: {}", e)))
        .and_then(|bytes| {
            String::from_utf8(bytes)
                .map_err(|e| Error::serialization(format!("invalid cluster CA: {}", e)))
        })?;
    Ok((endpoint.to_string(), ca))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecCredentialStatus {
    token: String,
    expiration_timestamp: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct ExecCredential {
    status: ExecCredentialStatus,
}

/// Bearer token and expiry from `aws eks get-token` output
pub(crate) fn parse_exec_credential(json: &str) -> Result<(String, Option<DateTime<Utc>>)> {
    let credential: ExecCredential = serde_json::from_str(json)
        .map_err(|e| Error::auth_refresh("eks", format!("invalid get-token output: {}", e)))?;
    if credential.status.token.is_empty() {
        return Err(Error::auth_refresh("eks", "get-token returned an empty token"));
    }
    Ok((
        credential.status.token,
        credential.status.expiration_timestamp,
    ))
}

fn is_missing_cluster(err: &Error) -> bool {
    let msg = err.to_string();
    msg.contains("ResourceNotFoundException") || msg.contains("No cluster found")
}

impl EksProvider {
    /// Delete recorded CloudFormation stacks, newest first, waiting for each
    ///
    /// Used when eksctl no longer knows the cluster, e.g. creation was
    /// interrupted before the control plane existed. Every stack is attempted;
    /// the error names the ones whose deletion could not be confirmed.
    async fn delete_stacks(&self, spec: &InfraSpec, inventory: &EksInventory) -> Result<()> {
        let mut remaining = Vec::new();
        for stack in inventory.stacks.iter().rev() {
            match self.delete_stack(stack, &inventory.region).await {
                Ok(()) => info!(stack = %stack, "deleted CloudFormation stack"),
                Err(e) => {
                    warn!(stack = %stack, error = %e, "failed to delete CloudFormation stack");
                    remaining.push(stack.as_str());
                }
            }
        }
        if remaining.is_empty() {
            Ok(())
        } else {
            Err(Error::infra(
                &spec.instance,
                "eks",
                format!(
                    "could not confirm deletion of CloudFormation stacks: {}",
                    remaining.join(", ")
                ),
            ))
        }
    }

    async fn delete_stack(&self, stack: &str, region: &str) -> Result<()> {
        run_capture(
            &self.aws,
            &[
                "cloudformation",
                "delete-stack",
                "--stack-name",
                stack,
                "--region",
                region,
            ],
        )
        .await?;
        run_capture(
            &self.aws,
            &[
                "cloudformation",
                "wait",
                "stack-delete-complete",
                "--stack-name",
                stack,
                "--region",
                region,
            ],
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl InfraProvisioner for EksProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Eks
    }

    async fn create(
        &self,
        spec: &InfraSpec,
        events: ProvisionEvents,
    ) -> Result<RuntimeConnectionInfo> {
        let name = spec.cluster_name();
        let region = spec.region(ProviderKind::Eks)?.to_string();
        let nodes = spec.node_count().to_string();

        let mut inventory = EksInventory {
            cluster_name: name.clone(),
            region: region.clone(),
            stacks: Vec::new(),
        };
        events.record_inventory(inventory.to_value()?).await;

        info!(cluster = %name, region = %region, nodes = %nodes, "creating EKS cluster");
        let mut cmd = StreamingCommand::spawn(
            &self.eksctl,
            &[
                "create", "cluster", "--name", &name, "--region", &region, "--nodes", &nodes,
                "--managed",
            ],
            None,
        )
        .await?;
        while let Some(line) = cmd.next_line().await? {
            if let Some(stack) = stack_name(&line) {
                if inventory.add_stack(stack) {
                    events.record_inventory(inventory.to_value()?).await;
                }
            }
            events.progress(line).await;
        }
        cmd.finish()
            .await
            .map_err(|e| Error::infra(&spec.instance, "eks", e.to_string()))?;

        self.connection(spec)
            .await
            .map_err(|e| match e {
                Error::AuthRefresh { .. } => e,
                other => Error::infra(&spec.instance, "eks", other.to_string()),
            })
    }

    async fn delete(&self, spec: &InfraSpec, inventory: Option<Value>) -> Result<()> {
        let inventory = match inventory {
            Some(value) => serde_json::from_value::<EksInventory>(value).map_err(|e| {
                Error::serialization_for_kind("eks inventory", e.to_string())
            })?,
            None => EksInventory {
                cluster_name: spec.cluster_name(),
                region: spec.region(ProviderKind::Eks)?.to_string(),
                stacks: Vec::new(),
            },
        };

        info!(
            cluster = %inventory.cluster_name,
            region = %inventory.region,
            stacks = inventory.stacks.len(),
            "deleting EKS cluster"
        );
        let result = run_capture(
            &self.eksctl,
            &[
                "delete",
                "cluster",
                "--name",
                &inventory.cluster_name,
                "--region",
                &inventory.region,
                "--wait",
            ],
        )
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_missing_cluster(&e) => {
                if inventory.stacks.is_empty() {
                    warn!(cluster = %inventory.cluster_name, "EKS cluster already gone");
                    return Ok(());
                }
                warn!(
                    cluster = %inventory.cluster_name,
                    stacks = inventory.stacks.len(),
                    "EKS cluster not found, deleting recorded stacks"
                );
                self.delete_stacks(spec, &inventory).await
            }
            Err(e) => Err(Error::infra(&spec.instance, "eks", e.to_string())),
        }
    }

    async fn refresh_connection(&self, spec: &InfraSpec) -> Result<RuntimeConnectionInfo> {
        self.connection(spec).await
    }

    fn exposes_public_endpoint(&self) -> bool {
        true
    }
}

#[async_trait]
impl ConnectionRefresher for EksProvider {
    async fn refresh_connection(
        &self,
        definition: &KubernetesRuntimeDefinition,
    ) -> Result<RuntimeConnectionInfo> {
        self.connection(&InfraSpec::from_definition(definition)).await
    }
}
