//! Down command - delete a control-plane instance and its infrastructure

use std::path::PathBuf;

use clap::Args;

use keel_provision::{keel_dir, ConfigStore, DeprovisioningSaga, FileConfigStore};

use super::saga_context;
use crate::{Error, Result};

/// Delete a control-plane instance
#[derive(Args, Debug)]
pub struct DownArgs {
    /// Instance name (default: the current instance)
    #[arg(short = 'n', long)]
    pub name: Option<String>,

    /// Directory holding one YAML file per control-plane component
    #[arg(long, env = "KEEL_MANIFESTS_DIR", default_value = "manifests")]
    pub manifests_dir: PathBuf,

    /// keel home directory (default: ~/.keel)
    #[arg(long, env = "KEEL_HOME")]
    pub keel_home: Option<PathBuf>,
}

/// The instance to delete: `--name`, else the current instance
fn target(name: Option<String>, store: &dyn ConfigStore) -> Result<String> {
    match name {
        Some(name) => Ok(name),
        None => store.current()?.ok_or(Error::NoInstance),
    }
}

pub async fn run(args: DownArgs) -> Result<()> {
    let home = keel_dir(args.keel_home.as_deref())?;
    let name = target(args.name, &FileConfigStore::in_dir(&home))?;

    DeprovisioningSaga::new(saga_context(&home, &args.manifests_dir))
        .run(&name)
        .await?;
    println!("Control plane '{}' deleted", name);
    Ok(())
}
