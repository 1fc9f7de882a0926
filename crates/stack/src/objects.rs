//! Helpers for building Kubernetes objects.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{Namespace, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{DynamicObject, ObjectMeta};
use serde::Serialize;

/// Convert a typed object into a [`DynamicObject`] for applying.
///
/// The object must serialize its own `apiVersion` and `kind`, which
/// `k8s-openapi` types and `CustomResource` derives both do.
pub fn to_dynamic<T: Serialize>(object: &T) -> Result<DynamicObject> {
    let value = serde_json::to_value(object).context("failed to serialize object")?;
    let dynamic: DynamicObject =
        serde_json::from_value(value).context("failed to convert object")?;
    if dynamic.types.is_none() {
        anyhow::bail!("object is missing apiVersion or kind");
    }
    Ok(dynamic)
}

/// Build a label map from pairs.
#[must_use]
pub fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

/// CPU and memory limits and requests.
#[must_use]
pub fn resources(
    limit_cpu: &str,
    limit_memory: &str,
    request_cpu: &str,
    request_memory: &str,
) -> ResourceRequirements {
    let quantities = |cpu: &str, memory: &str| {
        BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ])
    };
    ResourceRequirements {
        limits: Some(quantities(limit_cpu, limit_memory)),
        requests: Some(quantities(request_cpu, request_memory)),
        ..ResourceRequirements::default()
    }
}

/// Namespace with optional labels.
#[must_use]
pub fn namespace(name: &str, ns_labels: BTreeMap<String, String>) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: (!ns_labels.is_empty()).then_some(ns_labels),
            ..ObjectMeta::default()
        },
        ..Namespace::default()
    }
}

/// Metadata for a namespaced object.
#[must_use]
pub fn meta(name: &str, namespace: &str, object_labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: (!object_labels.is_empty()).then_some(object_labels),
        ..ObjectMeta::default()
    }
}

/// `kind namespace/name` (or `kind name`), for logs and plans.
#[must_use]
pub fn describe(object: &DynamicObject) -> String {
    let kind = object
        .types
        .as_ref()
        .map_or("Unknown", |t| t.kind.as_str());
    let name = object.metadata.name.as_deref().unwrap_or("<unnamed>");
    match object.metadata.namespace.as_deref() {
        Some(ns) => format!("{kind} {ns}/{name}"),
        None => format!("{kind} {name}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_to_dynamic() {
        let ns = namespace(
            "longhorn-system",
            labels(&[("istio.io/dataplane-mode", "ambient")]),
        );
        let object = to_dynamic(&ns).unwrap();
        let types = object.types.as_ref().unwrap();
        assert_eq!(types.api_version, "v1");
        assert_eq!(types.kind, "Namespace");
        assert_eq!(describe(&object), "Namespace longhorn-system");
        assert_eq!(
            object.metadata.labels.unwrap()["istio.io/dataplane-mode"],
            "ambient"
        );
    }

    #[test]
    fn test_untyped_value_is_rejected() {
        let value = serde_json::json!({"metadata": {"name": "x"}});
        assert!(to_dynamic(&value).is_err());
    }

    #[test]
    fn test_resources() {
        let r = resources("100m", "128Mi", "20m", "64Mi");
        assert_eq!(r.limits.as_ref().unwrap()["cpu"].0, "100m");
        assert_eq!(r.requests.as_ref().unwrap()["memory"].0, "64Mi");
    }
}
