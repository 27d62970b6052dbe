//! Kubernetes access for keel: runtime clients, dynamic reconciliation and
//! namespace assignment

pub mod client;
pub mod mapper;
pub mod namespace;
pub mod reconciler;

pub use client::{ConnectionRefresher, RuntimeClient, RuntimeClientFactory, RuntimeConnector};
pub use mapper::{gvk_of, DiscoveryMapper, RestMapper, RestMapping};
pub use namespace::{assign_namespace, AssignmentFailure};
pub use reconciler::{Reconcile, ResourceReconciler};
