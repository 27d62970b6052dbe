//! Component manifests installed onto a control-plane runtime
//!
//! Each [`Component`] is one multi-document YAML file in a manifests
//! directory. Documents are decoded into [`DynamicObject`]s and ordered so
//! that foundational kinds (namespaces, CRDs, RBAC) are applied before the
//! workloads that need them.

use std::fmt;
use std::path::{Path, PathBuf};

use kube::api::DynamicObject;
use serde::Deserialize;
use serde_json::Value;

use keel_common::{Error, Result};

/// An installable piece of the control plane
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Component {
    /// Database and message broker
    Dependencies,
    ApiServer,
    Controllers,
    Agent,
    Crds,
    SupportServicesOperator,
}

impl Component {
    /// Components installed once the API server is healthy, in order
    pub const POST_API: [Component; 4] = [
        Component::Controllers,
        Component::Agent,
        Component::Crds,
        Component::SupportServicesOperator,
    ];

    /// File holding this component's manifests
    pub fn file_name(&self) -> &'static str {
        match self {
            Component::Dependencies => "dependencies.yaml",
            Component::ApiServer => "api-server.yaml",
            Component::Controllers => "controllers.yaml",
            Component::Agent => "agent.yaml",
            Component::Crds => "crds.yaml",
            Component::SupportServicesOperator => "support-services-operator.yaml",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Component::Dependencies => "dependencies",
            Component::ApiServer => "api-server",
            Component::Controllers => "controllers",
            Component::Agent => "agent",
            Component::Crds => "crds",
            Component::SupportServicesOperator => "support-services-operator",
        };
        f.write_str(name)
    }
}

/// Where component manifests come from
pub trait ManifestSource: Send + Sync {
    /// Objects making up `component`, in apply order
    fn objects(&self, component: Component) -> Result<Vec<DynamicObject>>;
}

/// Reads `<dir>/<component>.yaml`
#[derive(Clone, Debug)]
pub struct DirectoryManifests {
    dir: PathBuf,
}

impl DirectoryManifests {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ManifestSource for DirectoryManifests {
    fn objects(&self, component: Component) -> Result<Vec<DynamicObject>> {
        let path = self.dir.join(component.file_name());
        let yaml = std::fs::read_to_string(&path)
            .map_err(|e| Error::io(format!("read {}", path.display()), e))?;
        parse_manifests(&yaml)
    }
}

/// Apply order for a kind; lower goes first
pub fn kind_priority(kind: &str) -> u8 {
    match kind {
        "Namespace" => 0,
        "CustomResourceDefinition" => 1,
        "ServiceAccount" => 2,
        "ClusterRole" | "Role" => 3,
        "ClusterRoleBinding" | "RoleBinding" => 4,
        "ConfigMap" | "Secret" => 5,
        "PersistentVolumeClaim" => 6,
        "Service" => 7,
        "Deployment" | "DaemonSet" | "StatefulSet" => 8,
        _ => 10,
    }
}

fn object_kind(obj: &DynamicObject) -> &str {
    obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("")
}

/// Decode a multi-document YAML string into objects sorted by [`kind_priority`]
///
/// Empty documents are skipped. Every remaining document must carry
/// `apiVersion` and `kind`.
pub fn parse_manifests(yaml: &str) -> Result<Vec<DynamicObject>> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(yaml) {
        let value = Value::deserialize(document)
            .map_err(|e| Error::serialization(format!("invalid manifest YAML: {}", e)))?;
        if value.is_null() {
            continue;
        }
        let obj: DynamicObject = serde_json::from_value(value)
            .map_err(|e| Error::serialization(format!("invalid manifest: {}", e)))?;
        if object_kind(&obj).is_empty() {
            return Err(Error::serialization(format!(
                "manifest {} has no apiVersion/kind",
                obj.metadata.name.as_deref().unwrap_or("<unnamed>")
            )));
        }
        objects.push(obj);
    }
    objects.sort_by_key(|obj| kind_priority(object_kind(obj)));
    Ok(objects)
}
