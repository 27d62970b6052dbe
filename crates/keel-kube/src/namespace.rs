//! Namespace placement for a workload's resource set
//!
//! A workload instance ships its desired objects as a list of JSON
//! definitions. Unless the caller already provides a `Namespace` object (in
//! which case that namespace is used as is), every namespaced member is moved
//! into a freshly named namespace, and the Namespace object for it is put at
//! the front of the list so it is created first.

use keel_common::{Error, WorkloadResourceInstance};
use rand::Rng;
use serde_json::{json, Value};
use tracing::debug;

use crate::mapper::{gvk_from_value, RestMapper};

/// Length of the random suffix appended to synthesized namespace names
pub const NAMESPACE_SUFFIX_LEN: usize = 10;

const SUFFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Assignment aborted part-way through
///
/// `processed` holds the members handled before the failure. It is returned
/// for diagnostics only and must not be applied.
#[derive(Debug)]
pub struct AssignmentFailure {
    pub processed: Vec<WorkloadResourceInstance>,
    pub error: Error,
}

impl std::fmt::Display for AssignmentFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "namespace assignment failed after {} resource(s): {}",
            self.processed.len(),
            self.error
        )
    }
}

impl std::error::Error for AssignmentFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl From<AssignmentFailure> for Error {
    fn from(failure: AssignmentFailure) -> Self {
        failure.error
    }
}

/// Generate `{instance_name}-{random suffix}`
pub fn synthesize_namespace_name(instance_name: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..NAMESPACE_SUFFIX_LEN)
        .map(|_| SUFFIX_CHARSET[rng.gen_range(0..SUFFIX_CHARSET.len())] as char)
        .collect();
    format!("{}-{}", instance_name, suffix)
}

/// Place every namespaced member of `resources` into one namespace
///
/// Cluster-scoped members pass through unchanged. A Namespace object is
/// synthesized only when the set has no Namespace of its own and at least one
/// member is namespaced.
pub fn assign_namespace(
    resources: &[WorkloadResourceInstance],
    instance_name: &str,
    instance_id: u64,
    mapper: &dyn RestMapper,
) -> Result<Vec<WorkloadResourceInstance>, AssignmentFailure> {
    let mut processed = Vec::with_capacity(resources.len() + 1);

    let decoded: Vec<Value> = match resources
        .iter()
        .map(|r| decode(&r.json_definition))
        .collect::<Result<_, _>>()
    {
        Ok(values) => values,
        Err(error) => return Err(AssignmentFailure { processed, error }),
    };

    let client_namespace = decoded.iter().find_map(|value| {
        (value.get("kind").and_then(Value::as_str) == Some("Namespace"))
            .then(|| value.pointer("/metadata/name").and_then(Value::as_str))
            .flatten()
            .map(str::to_string)
    });

    let namespace = match &client_namespace {
        Some(ns) => ns.clone(),
        None => synthesize_namespace_name(instance_name),
    };

    let mut namespaced_members = 0usize;
    for (resource, mut value) in resources.iter().zip(decoded) {
        let mapping = match gvk_from_value(&value).and_then(|gvk| mapper.rest_mapping(&gvk)) {
            Ok(mapping) => mapping,
            Err(error) => return Err(AssignmentFailure { processed, error }),
        };

        if !mapping.is_namespaced() {
            processed.push(resource.clone());
            continue;
        }

        namespaced_members += 1;
        set_namespace(&mut value, &namespace);
        let json_definition = match serde_json::to_string(&value) {
            Ok(json) => json,
            Err(e) => {
                return Err(AssignmentFailure {
                    processed,
                    error: Error::serialization(e.to_string()),
                })
            }
        };
        processed.push(WorkloadResourceInstance {
            json_definition,
            ..resource.clone()
        });
    }

    if namespaced_members > 0 && client_namespace.is_none() {
        debug!(
            instance = %instance_name,
            namespace = %namespace,
            resources = namespaced_members,
            "synthesized namespace for workload"
        );
        processed.insert(
            0,
            WorkloadResourceInstance {
                json_definition: namespace_definition(&namespace),
                workload_instance_id: instance_id,
                reconciled: false,
            },
        );
    }

    Ok(processed)
}

fn decode(json_definition: &str) -> Result<Value, Error> {
    let value: Value = serde_json::from_str(json_definition)
        .map_err(|e| Error::serialization(format!("invalid resource definition: {}", e)))?;
    if !value.is_object() {
        return Err(Error::serialization(
            "resource definition is not a JSON object",
        ));
    }
    Ok(value)
}

fn set_namespace(value: &mut Value, namespace: &str) {
    if !value.get("metadata").is_some_and(Value::is_object) {
        value["metadata"] = json!({});
    }
    value["metadata"]["namespace"] = Value::String(namespace.to_string());
}

fn namespace_definition(name: &str) -> String {
    json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": {"name": name}
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::testing::StaticMapper;
    use crate::mapper::MockRestMapper;

    fn resource(value: Value) -> WorkloadResourceInstance {
        WorkloadResourceInstance {
            json_definition: value.to_string(),
            workload_instance_id: 7,
            reconciled: false,
        }
    }

    fn deployment() -> WorkloadResourceInstance {
        resource(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web"},
            "spec": {"replicas": 2}
        }))
    }

    fn service() -> WorkloadResourceInstance {
        resource(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "web", "namespace": "ignored"}
        }))
    }

    fn decoded(r: &WorkloadResourceInstance) -> Value {
        serde_json::from_str(&r.json_definition).expect("json")
    }

    fn namespace_of(r: &WorkloadResourceInstance) -> Option<String> {
        decoded(r)
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Story: a Deployment and a Service for workload "web" (id 7) land in a
    /// new namespace that is created before them
    #[test]
    fn story_deployment_and_service_get_a_synthesized_namespace() {
        let out = assign_namespace(&[deployment(), service()], "web", 7, &StaticMapper)
            .expect("assignment");

        assert_eq!(out.len(), 3);
        let ns = decoded(&out[0]);
        assert_eq!(ns["kind"], "Namespace");
        assert_eq!(out[0].workload_instance_id, 7);

        let name = ns["metadata"]["name"].as_str().expect("name").to_string();
        let suffix = name.strip_prefix("web-").expect("prefixed with instance name");
        assert_eq!(suffix.len(), NAMESPACE_SUFFIX_LEN);
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));

        assert_eq!(decoded(&out[1])["kind"], "Deployment");
        assert_eq!(decoded(&out[2])["kind"], "Service");
        assert_eq!(namespace_of(&out[1]).as_deref(), Some(name.as_str()));
        assert_eq!(namespace_of(&out[2]).as_deref(), Some(name.as_str()));
        assert_eq!(decoded(&out[1])["spec"]["replicas"], 2);
    }

    #[test]
    fn client_supplied_namespace_is_used_and_nothing_is_synthesized() {
        let ns = resource(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": "team-a"}
        }));
        let out = assign_namespace(&[deployment(), ns, service()], "web", 7, &StaticMapper)
            .expect("assignment");

        assert_eq!(out.len(), 3);
        let namespaces = out
            .iter()
            .filter(|r| decoded(r)["kind"] == "Namespace")
            .count();
        assert_eq!(namespaces, 1);
        assert_eq!(namespace_of(&out[0]).as_deref(), Some("team-a"));
        assert_eq!(decoded(&out[1])["kind"], "Namespace");
        assert_eq!(namespace_of(&out[1]), None);
        assert_eq!(namespace_of(&out[2]).as_deref(), Some("team-a"));
    }

    #[test]
    fn cluster_scoped_only_sets_get_no_namespace() {
        let role = resource(json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRole",
            "metadata": {"name": "reader"}
        }));
        let out = assign_namespace(std::slice::from_ref(&role), "web", 7, &StaticMapper)
            .expect("assignment");
        assert_eq!(out, vec![role]);
    }

    #[test]
    fn empty_set_stays_empty() {
        let out = assign_namespace(&[], "web", 7, &StaticMapper).expect("assignment");
        assert!(out.is_empty());
    }

    #[test]
    fn malformed_json_aborts() {
        let broken = WorkloadResourceInstance {
            json_definition: "{not json".to_string(),
            workload_instance_id: 7,
            reconciled: false,
        };
        let failure =
            assign_namespace(&[deployment(), broken], "web", 7, &StaticMapper).unwrap_err();
        assert!(failure.processed.is_empty());
        assert!(matches!(failure.error, Error::Serialization { .. }));
    }

    #[test]
    fn discovery_failure_returns_partial_result() {
        let mut mapper = MockRestMapper::new();
        let mut calls = 0;
        mapper.expect_rest_mapping().returning(move |gvk| {
            calls += 1;
            if calls == 1 {
                StaticMapper.rest_mapping(gvk)
            } else {
                Err(Error::kube_client("rest-mapping", "discovery unavailable"))
            }
        });

        let failure =
            assign_namespace(&[deployment(), service()], "web", 7, &mapper).unwrap_err();
        assert_eq!(failure.processed.len(), 1);
        assert!(failure.to_string().contains("discovery unavailable"));
    }

    #[test]
    fn synthesized_names_differ() {
        assert_ne!(synthesize_namespace_name("web"), synthesize_namespace_name("web"));
    }
}
