//! Up command - provision a control-plane instance
//!
//! Usage: keel up --name prod --provider eks --aws-account-id 123456789012 --aws-region us-east-1

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::info;

use keel_common::{ProviderKind, ProviderSettings};
use keel_provision::{keel_dir, ProvisionRequest, ProvisioningSaga, RcgenGenerator, STEPS};

use super::{providers, saga_context, watch_for_interrupt};
use crate::Result;

/// Provision a control-plane instance
#[derive(Args, Debug)]
pub struct UpArgs {
    /// Instance name
    #[arg(short = 'n', long, default_value = "default")]
    pub name: String,

    /// Infrastructure provider (kind, eks)
    #[arg(short = 'p', long, default_value = "kind")]
    pub provider: ProviderKind,

    /// Require client certificates on the control-plane API
    /// (default: on for every provider except kind)
    #[arg(long, conflicts_with = "no_auth")]
    pub auth_enabled: bool,

    /// Serve the control-plane API without client certificates
    #[arg(long)]
    pub no_auth: bool,

    /// Replace an existing instance record with the same name
    #[arg(long = "force-overwrite-config")]
    pub force_overwrite: bool,

    /// Cloud account the runtime is created in
    #[arg(long, env = "KEEL_AWS_ACCOUNT_ID")]
    pub aws_account_id: Option<String>,

    /// Cloud region the runtime is created in
    #[arg(long, env = "AWS_REGION")]
    pub aws_region: Option<String>,

    /// Worker node count
    #[arg(long)]
    pub node_count: Option<u32>,

    /// Cluster name (default: keel-<name>)
    #[arg(long)]
    pub cluster_name: Option<String>,

    /// Directory holding one YAML file per control-plane component
    #[arg(long, env = "KEEL_MANIFESTS_DIR", default_value = "manifests")]
    pub manifests_dir: PathBuf,

    /// keel home directory (default: ~/.keel)
    #[arg(long, env = "KEEL_HOME")]
    pub keel_home: Option<PathBuf>,

    /// Validate flags and print the planned steps without provisioning
    #[arg(long)]
    pub dry_run: bool,
}

impl UpArgs {
    fn auth_enabled(&self) -> bool {
        if self.auth_enabled {
            true
        } else if self.no_auth {
            false
        } else {
            !self.provider.is_default()
        }
    }

    pub fn request(&self) -> ProvisionRequest {
        ProvisionRequest {
            name: self.name.clone(),
            provider: self.provider,
            auth_enabled: self.auth_enabled(),
            force_overwrite: self.force_overwrite,
            settings: ProviderSettings {
                cluster_name: self.cluster_name.clone(),
                region: self.aws_region.clone(),
                account_id: self.aws_account_id.clone(),
                node_count: self.node_count,
            },
        }
    }
}

/// Step banners a run of `request` would print
fn plan(request: &ProvisionRequest) -> Result<Vec<String>> {
    request.validate(&providers())?;
    Ok(STEPS
        .iter()
        .enumerate()
        .map(|(i, title)| format!("[Step {}/{}] {}", i + 1, STEPS.len(), title))
        .collect())
}

pub async fn run(args: UpArgs) -> Result<()> {
    let request = args.request();

    if args.dry_run {
        for line in plan(&request)? {
            println!("{}", line);
        }
        return Ok(());
    }

    let home = keel_dir(args.keel_home.as_deref())?;
    let context = saga_context(&home, &args.manifests_dir);
    let cancel = CancellationToken::new();
    let watcher = watch_for_interrupt(cancel.clone());

    let result = ProvisioningSaga::new(context, Arc::new(RcgenGenerator), cancel)
        .run(&request)
        .await;
    watcher.abort();
    let config = result?;

    info!(instance = %config.name, "control plane ready");
    println!(
        "Control plane '{}' is ready at {}",
        config.name, config.api_server_address
    );
    Ok(())
}
