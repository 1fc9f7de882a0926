//! Istio `Gateway` bound to the ingress gateway, plus a health-check route.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::istio::ISTIO_NAMESPACE;
use crate::component::{Component, Rendered};
use crate::config::StackContext;

/// Body returned by the health-check route.
pub const HEALTH_BODY: &str = "OK - Cloudflare Tunnel → Istio Gateway → Health Check\n";

const HEALTH_CHECK_NAME: &str = "health-check";

/// `networking.istio.io/v1beta1` Gateway (the subset we use).
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "networking.istio.io",
    version = "v1beta1",
    kind = "Gateway",
    namespaced
)]
pub struct GatewaySpec {
    pub selector: BTreeMap<String, String>,
    pub servers: Vec<Server>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct Server {
    pub port: Port,
    pub hosts: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct Port {
    pub number: u32,
    pub name: String,
    pub protocol: String,
}

/// `networking.istio.io/v1beta1` VirtualService (the subset we use).
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "networking.istio.io",
    version = "v1beta1",
    kind = "VirtualService",
    namespaced
)]
pub struct VirtualServiceSpec {
    pub hosts: Vec<String>,
    pub gateways: Vec<String>,
    pub http: Vec<HttpRoute>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpRoute {
    #[serde(rename = "match", default, skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<HttpMatchRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct_response: Option<DirectResponse>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct HttpMatchRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<StringMatch>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct StringMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exact: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct DirectResponse {
    pub status: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<DirectResponseBody>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct DirectResponseBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string: Option<String>,
}

pub struct GatewayComponent;

#[async_trait]
impl Component for GatewayComponent {
    fn name(&self) -> &'static str {
        "gateway"
    }

    fn description(&self) -> &'static str {
        "Istio Gateway and health check"
    }

    async fn render(&self, ctx: &StackContext) -> Result<Rendered> {
        let name = &ctx.stack.gateway.name;
        let host = health_host(ctx);

        let mut rendered = Rendered::new();
        rendered
            .apply(&gateway(name))?
            .apply(&health_check(name, &host))?;
        rendered
            .output("gateway", format!("{ISTIO_NAMESPACE}/{name}"))
            .output("healthHost", host);
        Ok(rendered)
    }
}

/// `health.<domain>` when a tunnel domain is configured, otherwise any host.
fn health_host(ctx: &StackContext) -> String {
    ctx.stack
        .cloudflare
        .as_ref()
        .map(|c| c.tunnel.domain.as_str())
        .filter(|d| !d.is_empty())
        .map_or_else(|| "*".to_string(), |domain| format!("health.{domain}"))
}

/// HTTP on port 80 for every host, served by the ingress gateway pods.
#[must_use]
pub fn gateway(name: &str) -> Gateway {
    let mut gateway = Gateway::new(
        name,
        GatewaySpec {
            selector: BTreeMap::from([("istio".to_string(), "ingressgateway".to_string())]),
            servers: vec![Server {
                port: Port {
                    number: 80,
                    name: "http".to_string(),
                    protocol: "HTTP".to_string(),
                },
                hosts: vec!["*".to_string()],
            }],
        },
    );
    gateway.metadata.namespace = Some(ISTIO_NAMESPACE.to_string());
    gateway
}

/// Direct 200 response on `/` for `host`, attached to `gateway_name`.
#[must_use]
pub fn health_check(gateway_name: &str, host: &str) -> VirtualService {
    let mut vs = VirtualService::new(
        HEALTH_CHECK_NAME,
        VirtualServiceSpec {
            hosts: vec![host.to_string()],
            gateways: vec![gateway_name.to_string()],
            http: vec![HttpRoute {
                matches: vec![HttpMatchRequest {
                    uri: Some(StringMatch {
                        prefix: Some("/".to_string()),
                        exact: None,
                    }),
                }],
                direct_response: Some(DirectResponse {
                    status: 200,
                    body: Some(DirectResponseBody {
                        string: Some(HEALTH_BODY.to_string()),
                    }),
                }),
            }],
        },
    );
    vs.metadata.namespace = Some(ISTIO_NAMESPACE.to_string());
    vs
}
