//! Provisioning and teardown of keel control-plane instances
//!
//! The [`ProvisioningSaga`] creates a runtime through an [`InfraProvisioner`],
//! installs the control plane onto it and registers it with the control
//! plane's own API. The [`DeprovisioningSaga`] reverses that. Both sagas get
//! their collaborators through a [`SagaContext`], so every side effect can be
//! swapped out in tests.

pub mod events;
pub mod installer;
pub mod inventory;
pub mod manifests;
pub mod pki;
pub mod provider;
pub mod store;

mod deprovision;
mod provision;
mod saga;

pub use deprovision::DeprovisioningSaga;
pub use events::{EventListeners, ProvisionEvents};
pub use installer::ControlPlaneInstaller;
pub use inventory::InventoryFile;
pub use manifests::{Component, DirectoryManifests, ManifestSource};
pub use pki::{CertificateGenerator, RcgenGenerator};
pub use provider::{EksProvider, InfraProvisioner, InfraSpec, KindProvider, ProviderRegistry};
pub use provision::{ProvisionRequest, ProvisioningSaga, STEPS};
pub use saga::{ApiConnector, HttpApiConnector, SagaContext, SagaOptions};
pub use store::{keel_dir, ConfigStore, FileConfigStore};
