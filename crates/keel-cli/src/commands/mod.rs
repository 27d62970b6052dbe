//! CLI commands

use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use keel_common::ProviderKind;
use keel_kube::RuntimeClientFactory;
use keel_provision::{
    DirectoryManifests, EksProvider, FileConfigStore, HttpApiConnector, KindProvider,
    ProviderRegistry, SagaContext, SagaOptions,
};

pub mod down;
pub mod up;

/// Every provider the CLI can drive
pub fn providers() -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    registry
        .register(Arc::new(KindProvider::new()))
        .register(Arc::new(EksProvider::new()));
    registry
}

/// Saga collaborators rooted at the keel home `home`
pub fn saga_context(home: &Path, manifests_dir: &Path) -> SagaContext {
    let factory =
        RuntimeClientFactory::new().with_refresher(ProviderKind::Eks, Arc::new(EksProvider::new()));
    SagaContext {
        store: Arc::new(FileConfigStore::in_dir(home)),
        providers: providers(),
        connector: Arc::new(factory),
        api_connector: Arc::new(HttpApiConnector),
        manifests: Arc::new(DirectoryManifests::new(manifests_dir)),
        keel_dir: home.to_path_buf(),
        options: SagaOptions::default(),
    }
}

/// Cancel `token` on Ctrl-C or SIGTERM
pub fn watch_for_interrupt(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("interrupt received, stopping after the current step and rolling back");
        token.cancel();
    })
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM, only Ctrl-C will interrupt");
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            return;
        }
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "cannot listen for Ctrl-C");
                terminate.recv().await;
            }
        }
        _ = terminate.recv() => info!("received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_registers_kind_and_eks() {
        let registry = providers();
        for kind in ProviderKind::ALL {
            assert!(registry.contains(kind), "{} missing", kind);
        }
    }

    #[test]
    fn context_keeps_inventory_in_the_keel_home() {
        let home = tempfile::tempdir().expect("tempdir");
        let context = saga_context(home.path(), Path::new("manifests"));
        assert_eq!(
            context.inventory_file("prod").path(),
            home.path().join("inventory-prod.json")
        );
    }
}
