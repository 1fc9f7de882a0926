//! kube-vip: a floating control-plane address announced over ARP.
//!
//! Runs as a host-network DaemonSet on control-plane nodes. The leader
//! (elected through a coordination lease) answers ARP for the VIP, so the
//! API server stays reachable on one address while nodes come and go.

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EnvVar, PodSpec, PodTemplateSpec, SecurityContext, ServiceAccount,
    Toleration,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;

use crate::component::{Component, Rendered};
use crate::config::StackContext;
use crate::objects::{labels, meta, resources};

pub const NAME: &str = "kube-vip";
pub const NAMESPACE: &str = "kube-system";
pub const IMAGE: &str = "ghcr.io/kube-vip/kube-vip";
pub const API_SERVER_PORT: u16 = 6443;

const CONTROL_PLANE_LABEL: &str = "node-role.kubernetes.io/control-plane";
const MASTER_LABEL: &str = "node-role.kubernetes.io/master";

pub struct KubeVip;

#[async_trait]
impl Component for KubeVip {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Control-plane virtual IP"
    }

    async fn render(&self, ctx: &StackContext) -> Result<Rendered> {
        let vip = ctx
            .vip
            .as_deref()
            .context("cluster.vip is required to deploy kube-vip")?;
        let version = &ctx.kubevip.version;

        let mut rendered = Rendered::new();
        rendered
            .apply(&service_account())?
            .apply(&cluster_role())?
            .apply(&cluster_role_binding())?
            .apply(&daemon_set(vip, version, &ctx.kubevip.interface))?;
        rendered.output("vip", vip);
        Ok(rendered)
    }
}

#[must_use]
pub fn service_account() -> ServiceAccount {
    ServiceAccount {
        metadata: meta(NAME, NAMESPACE, labels(&[])),
        ..ServiceAccount::default()
    }
}

fn rule(group: &str, resources: &[&str], verbs: &[&str]) -> PolicyRule {
    let strings = |items: &[&str]| items.iter().map(|s| (*s).to_string()).collect::<Vec<_>>();
    PolicyRule {
        api_groups: Some(vec![group.to_string()]),
        resources: Some(strings(resources)),
        verbs: strings(verbs),
        ..PolicyRule::default()
    }
}

#[must_use]
pub fn cluster_role() -> ClusterRole {
    let manage = ["list", "get", "watch", "create", "update"];
    ClusterRole {
        metadata: ObjectMeta {
            name: Some(NAME.to_string()),
            ..ObjectMeta::default()
        },
        rules: Some(vec![
            rule("", &["services", "endpoints", "nodes"], &["list", "get", "watch"]),
            rule("", &["configmaps"], &manage),
            rule("coordination.k8s.io", &["leases"], &manage),
        ]),
        ..ClusterRole::default()
    }
}

#[must_use]
pub fn cluster_role_binding() -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(NAME.to_string()),
            ..ObjectMeta::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: NAME.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: NAME.to_string(),
            namespace: Some(NAMESPACE.to_string()),
            ..Subject::default()
        }]),
    }
}

/// Environment understood by `kube-vip manager`.
#[must_use]
pub fn env(vip: &str, interface: &str) -> Vec<EnvVar> {
    let port = API_SERVER_PORT.to_string();
    [
        ("vip_arp", "true"),
        ("port", port.as_str()),
        ("vip_interface", interface),
        ("vip_cidr", "32"),
        ("cp_enable", "true"),
        ("cp_namespace", NAMESPACE),
        ("vip_ddns", "false"),
        ("svc_enable", "false"),
        ("vip_leaderelection", "true"),
        ("vip_leaseduration", "5"),
        ("vip_renewdeadline", "3"),
        ("vip_retryperiod", "1"),
        ("address", vip),
        ("prometheus_server", ":2112"),
    ]
    .into_iter()
    .map(|(name, value)| EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..EnvVar::default()
    })
    .collect()
}

fn no_schedule_toleration(key: &str) -> Toleration {
    Toleration {
        key: Some(key.to_string()),
        operator: Some("Exists".to_string()),
        effect: Some("NoSchedule".to_string()),
        ..Toleration::default()
    }
}

#[must_use]
pub fn daemon_set(vip: &str, version: &str, interface: &str) -> DaemonSet {
    let pod_labels = labels(&[
        ("app.kubernetes.io/name", NAME),
        ("app.kubernetes.io/version", version),
    ]);

    let container = Container {
        name: NAME.to_string(),
        image: Some(format!("{IMAGE}:{version}")),
        image_pull_policy: Some("IfNotPresent".to_string()),
        args: Some(vec!["manager".to_string()]),
        env: Some(env(vip, interface)),
        security_context: Some(SecurityContext {
            capabilities: Some(Capabilities {
                add: Some(vec!["NET_ADMIN".to_string(), "NET_RAW".to_string()]),
                ..Capabilities::default()
            }),
            ..SecurityContext::default()
        }),
        resources: Some(resources("100m", "128Mi", "50m", "64Mi")),
        ..Container::default()
    };

    DaemonSet {
        metadata: meta(NAME, NAMESPACE, pod_labels.clone()),
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels(&[("app.kubernetes.io/name", NAME)])),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    host_network: Some(true),
                    service_account_name: Some(NAME.to_string()),
                    node_selector: Some(labels(&[(CONTROL_PLANE_LABEL, "true")])),
                    tolerations: Some(vec![
                        no_schedule_toleration(CONTROL_PLANE_LABEL),
                        no_schedule_toleration(MASTER_LABEL),
                    ]),
                    containers: vec![container],
                    ..PodSpec::default()
                }),
            },
            ..DaemonSetSpec::default()
        }),
        ..DaemonSet::default()
    }
}
