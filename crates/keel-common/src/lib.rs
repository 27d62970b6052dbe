//! Common types for keel: data model, errors, retries and the control-plane API

pub mod api;
pub mod error;
pub mod retry;
pub mod types;

pub use api::{ControlPlaneApi, HttpControlPlaneApi};
pub use error::Error;
pub use types::*;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace the control plane's own services are installed into
pub const CONTROL_PLANE_NAMESPACE: &str = "keel-system";

/// Label marking objects installed by keel
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`] on keel-installed objects
pub const MANAGED_BY_VALUE: &str = "keel";

/// Name of the Service fronting the control-plane API
pub const API_SERVER_SERVICE: &str = "keel-api-server";

/// Port the control-plane API listens on
pub const API_SERVER_PORT: u16 = 1323;
