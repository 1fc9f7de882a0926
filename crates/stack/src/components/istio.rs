//! Istio in ambient mode, tuned for K3s on small nodes.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use crate::component::{Component, Rendered, Step};
use crate::config::StackContext;
use crate::helm::HelmRelease;
use crate::objects::{labels, namespace};

pub const ISTIO_NAMESPACE: &str = "istio-system";
pub const ISTIO_REPO: &str = "https://istio-release.storage.googleapis.com/charts";

/// K3s keeps its CNI configuration and binaries outside the usual paths.
const K3S_CNI_CONF_DIR: &str = "/var/lib/rancher/k3s/agent/etc/cni/net.d";
const K3S_CNI_BIN_DIR: &str = "/var/lib/rancher/k3s/data/cni";

/// Ingress gateway release name; the `istio=ingressgateway` selector depends on it.
pub const INGRESS_RELEASE: &str = "istio-ingressgateway";

fn release(name: &str, chart: &str, version: &str) -> HelmRelease {
    HelmRelease::new(name, chart, ISTIO_REPO, ISTIO_NAMESPACE).version(version)
}

/// Control plane and data plane: base CRDs, istiod, CNI node agent, ztunnel.
pub struct Istio;

#[async_trait]
impl Component for Istio {
    fn name(&self) -> &'static str {
        "istio"
    }

    fn description(&self) -> &'static str {
        "Istio service mesh (ambient)"
    }

    async fn render(&self, ctx: &StackContext) -> Result<Rendered> {
        let version = &ctx.stack.istio.version;
        let mut rendered = Rendered::new();
        rendered.apply(&namespace(ISTIO_NAMESPACE, labels(&[])))?;
        rendered
            .push(Step::Helm(release("istio-base", "base", version)))
            .push(Step::Helm(release("istiod", "istiod", version).values(istiod_values())))
            .push(Step::Helm(release("istio-cni", "cni", version).values(cni_values())))
            .push(Step::Helm(release("ztunnel", "ztunnel", version).values(ztunnel_values())))
            .output("namespace", ISTIO_NAMESPACE)
            .output("version", version.clone());
        Ok(rendered)
    }
}

#[must_use]
pub fn istiod_values() -> serde_json::Value {
    json!({
        "profile": "ambient",
        "pilot": {
            "resources": {
                "limits": { "cpu": "200m", "memory": "128Mi" },
                "requests": { "cpu": "20m", "memory": "64Mi" }
            }
        },
        "meshConfig": { "accessLogFile": "/dev/stdout" }
    })
}

#[must_use]
pub fn cni_values() -> serde_json::Value {
    json!({
        "profile": "ambient",
        "global": { "platform": "k3s" },
        "cni": {
            "cniConfDir": K3S_CNI_CONF_DIR,
            "cniBinDir": K3S_CNI_BIN_DIR,
            "resources": {
                "limits": { "cpu": "100m", "memory": "64Mi" },
                "requests": { "cpu": "10m", "memory": "32Mi" }
            }
        }
    })
}

#[must_use]
pub fn ztunnel_values() -> serde_json::Value {
    json!({
        "resources": {
            "limits": { "cpu": "200m", "memory": "128Mi" },
            "requests": { "cpu": "20m", "memory": "96Mi" }
        }
    })
}

/// Ingress gateway. ClusterIP only: traffic arrives through the tunnel.
pub struct IstioIngress;

#[async_trait]
impl Component for IstioIngress {
    fn name(&self) -> &'static str {
        "istio-ingress"
    }

    fn description(&self) -> &'static str {
        "Istio ingress gateway"
    }

    async fn render(&self, ctx: &StackContext) -> Result<Rendered> {
        let gateway = release(INGRESS_RELEASE, "gateway", &ctx.stack.istio.version)
            .values(json!({ "service": { "type": "ClusterIP" } }));
        let mut rendered = Rendered::new();
        rendered
            .push(Step::Helm(gateway))
            .output("service", service_host());
        Ok(rendered)
    }
}

/// In-cluster DNS name of the ingress gateway service.
#[must_use]
pub fn service_host() -> String {
    format!("{INGRESS_RELEASE}.{ISTIO_NAMESPACE}.svc.cluster.local")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn helm_releases(rendered: &Rendered) -> Vec<&HelmRelease> {
        rendered
            .steps
            .iter()
            .filter_map(|s| match s {
                Step::Helm(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_istio_releases_in_order() {
        let ctx = StackContext::for_vip("10.0.0.1");
        let rendered = Istio.render(&ctx).await.unwrap();
        assert!(matches!(rendered.steps[0], Step::Apply(_)));

        let releases = helm_releases(&rendered);
        let charts: Vec<_> = releases.iter().map(|r| r.chart.as_str()).collect();
        assert_eq!(charts, vec!["base", "istiod", "cni", "ztunnel"]);
        assert!(releases
            .iter()
            .all(|r| r.version.as_deref() == Some("1.28.2") && r.namespace == ISTIO_NAMESPACE));
        assert!(!releases[0].has_values());
    }

    #[test]
    fn test_cni_values_for_k3s() {
        let values = cni_values();
        assert_eq!(values["global"]["platform"], "k3s");
        assert_eq!(values["cni"]["cniBinDir"], "/var/lib/rancher/k3s/data/cni");
        assert_eq!(values["profile"], "ambient");
    }

    #[test]
    fn test_istiod_values() {
        let values = istiod_values();
        assert_eq!(values["pilot"]["resources"]["requests"]["memory"], "64Mi");
        assert_eq!(values["meshConfig"]["accessLogFile"], "/dev/stdout");
    }

    #[tokio::test]
    async fn test_ingress_is_cluster_ip() {
        let ctx = StackContext::for_vip("10.0.0.1");
        let rendered = IstioIngress.render(&ctx).await.unwrap();
        let releases = helm_releases(&rendered);
        assert_eq!(releases.len(), 1);
        assert_eq!(releases[0].name, "istio-ingressgateway");
        assert_eq!(releases[0].values["service"]["type"], "ClusterIP");
        assert_eq!(
            rendered.outputs["service"],
            "istio-ingressgateway.istio-system.svc.cluster.local"
        );
    }
}
