//! Idempotent create/update/delete of arbitrary Kubernetes objects
//!
//! Objects are [`DynamicObject`]s whose kind is only known at runtime. Every
//! operation resolves the REST mapping from the object's own
//! group/version/kind through the [`RestMapper`]; nothing is cached.

use std::sync::Arc;

use async_trait::async_trait;
use keel_common::{Error, Result};
use kube::api::{Api, DeleteParams, DynamicObject, GroupVersionKind, PostParams};
use kube::Client;
use tracing::{debug, trace};

use crate::mapper::{display_gvk, gvk_of, RestMapper};

/// Create/update/delete operations on dynamically typed objects
#[async_trait]
pub trait Reconcile: Send + Sync {
    /// Fetch an object; an empty namespace addresses cluster-scoped kinds
    async fn get(&self, gvk: &GroupVersionKind, namespace: &str, name: &str)
        -> Result<DynamicObject>;

    /// Create an object, returning the input unchanged if it already exists
    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Replace an existing object
    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Create an object, or replace the live copy if it already exists
    async fn create_or_update(&self, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Delete an object; a missing object is not an error
    async fn delete(&self, obj: &DynamicObject) -> Result<()>;
}

/// [`Reconcile`] against a live API server
#[derive(Clone)]
pub struct ResourceReconciler {
    client: Client,
    mapper: Arc<dyn RestMapper>,
}

impl ResourceReconciler {
    pub fn new(client: Client, mapper: Arc<dyn RestMapper>) -> Self {
        Self { client, mapper }
    }

    fn api_for(&self, gvk: &GroupVersionKind, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let mapping = self.mapper.rest_mapping(gvk)?;
        let api = if !mapping.is_namespaced() {
            Api::all_with(self.client.clone(), &mapping.resource)
        } else {
            match namespace.filter(|ns| !ns.is_empty()) {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &mapping.resource),
                None => Api::default_namespaced_with(self.client.clone(), &mapping.resource),
            }
        };
        Ok(api)
    }

    fn api_for_object(&self, obj: &DynamicObject) -> Result<(Api<DynamicObject>, GroupVersionKind, String)> {
        let gvk = gvk_of(obj)?;
        let name = object_name(obj)?;
        let api = self.api_for(&gvk, obj.metadata.namespace.as_deref())?;
        Ok((api, gvk, name))
    }
}

fn object_name(obj: &DynamicObject) -> Result<String> {
    obj.metadata
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::serialization("object has no metadata.name"))
}

fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// A Service whose allocated ports changed is rejected as invalid on create
/// rather than reported as existing.
fn is_invalid_service(gvk: &GroupVersionKind, err: &kube::Error) -> bool {
    gvk.kind == "Service"
        && matches!(err, kube::Error::Api(ae) if ae.code == 422 || ae.reason == "Invalid")
}

#[async_trait]
impl Reconcile for ResourceReconciler {
    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject> {
        let api = self.api_for(gvk, Some(namespace))?;
        api.get(name).await.map_err(|e| {
            if is_not_found(&e) {
                Error::not_found(display_gvk(gvk), name)
            } else {
                Error::from(e)
            }
        })
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let (api, gvk, name) = self.api_for_object(obj)?;
        match api.create(&PostParams::default(), obj).await {
            Ok(created) => {
                trace!(kind = %gvk.kind, name = %name, "created");
                Ok(created)
            }
            Err(e) if is_already_exists(&e) => {
                debug!(kind = %gvk.kind, name = %name, "already exists, leaving as is");
                Ok(obj.clone())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let (api, gvk, name) = self.api_for_object(obj)?;
        let updated = api.replace(&name, &PostParams::default(), obj).await?;
        trace!(kind = %gvk.kind, name = %name, "updated");
        Ok(updated)
    }

    async fn create_or_update(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let (api, gvk, name) = self.api_for_object(obj)?;
        match api.create(&PostParams::default(), obj).await {
            Ok(created) => {
                trace!(kind = %gvk.kind, name = %name, "created");
                Ok(created)
            }
            Err(e) if is_already_exists(&e) || is_invalid_service(&gvk, &e) => {
                debug!(kind = %gvk.kind, name = %name, error = %e, "exists, updating live object");
                let live = api.get(&name).await?;
                let mut desired = obj.clone();
                desired.metadata.resource_version = live.metadata.resource_version;
                let updated = api
                    .replace(&name, &PostParams::default(), &desired)
                    .await?;
                trace!(kind = %gvk.kind, name = %name, "updated");
                Ok(updated)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, obj: &DynamicObject) -> Result<()> {
        let (api, gvk, name) = self.api_for_object(obj)?;
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {
                trace!(kind = %gvk.kind, name = %name, "deleted");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                debug!(kind = %gvk.kind, name = %name, "already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
