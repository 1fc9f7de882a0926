//! Cloudflare Tunnel in front of the Istio ingress gateway.
//!
//! Rendering talks to the Cloudflare API: it creates (or reuses) a
//! remotely-managed tunnel, points its ingress at the gateway service,
//! upserts the proxied CNAME, and fetches the run token. The in-cluster half
//! is a `cloudflared` Deployment running with that token.
//!
//! In dry-run mode no API calls are made and placeholders stand in for the
//! values Cloudflare would return.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, HTTPGetAction, PodSpec, PodTemplateSpec, Probe, Secret,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use tracing::{info, warn};

use super::istio::service_host;
use crate::cloudflare::{
    cname_for, pet_name, tunnel_secret, Cloudflare, TunnelConfiguration, TunnelState,
};
use crate::component::{Component, Rendered};
use crate::config::{CloudflareConfig, StackContext};
use crate::objects::{labels, meta, namespace, resources};

pub const NAMESPACE: &str = "cloudflare-tunnel";
pub const CREDENTIALS_SECRET: &str = "tunnel-credentials";
pub const DEPLOYMENT: &str = "cloudflared";
pub const IMAGE: &str = "cloudflare/cloudflared:latest";

const METRICS_PORT: i32 = 2000;
const REPLICAS: i32 = 2;

/// What the cluster side needs to know about the tunnel.
#[derive(Clone)]
pub struct TunnelIdentity {
    pub account_id: String,
    pub tunnel_id: String,
    pub secret: String,
    pub token: String,
}

#[derive(Debug, Default)]
pub struct CloudflareTunnel {
    /// Overrides the Cloudflare API endpoint.
    api_base: Option<String>,
}

impl CloudflareTunnel {
    #[must_use]
    pub fn with_api_base(api_base: impl Into<String>) -> Self {
        Self {
            api_base: Some(api_base.into()),
        }
    }

    fn client(&self, config: &CloudflareConfig) -> Result<Cloudflare> {
        let client = Cloudflare::new(config.api_token.clone())?;
        Ok(match &self.api_base {
            Some(base) => client.with_base_url(base.clone()),
            None => client,
        })
    }

    /// Create or reuse the tunnel, route it, and publish DNS.
    async fn converge(&self, ctx: &StackContext, config: &CloudflareConfig) -> Result<TunnelIdentity> {
        let cf = self.client(config)?;
        let account = config.account_id.as_str();
        let hostname = config.tunnel.hostname();

        let stored = TunnelState::load(&ctx.state_dir)?.filter(|s| s.matches_account(account));
        let mut reused = None;
        if let Some(state) = stored {
            match cf.get_tunnel(account, &state.tunnel_id).await? {
                Some(tunnel) if !tunnel.is_deleted() => {
                    info!(tunnel_id = %tunnel.id, name = %tunnel.name, "Reusing Cloudflare tunnel");
                    reused = Some(state);
                }
                _ => warn!(tunnel_id = %state.tunnel_id, "Stored tunnel no longer exists, creating a new one"),
            }
        }

        let state = match reused {
            Some(state) => state,
            None => {
                let name = format!("{}-{}", config.tunnel.name, pet_name());
                let secret = tunnel_secret();
                let tunnel = cf
                    .create_tunnel(account, &name, &secret)
                    .await
                    .context("failed to create Cloudflare tunnel")?;
                let mut state = TunnelState::new(account, tunnel.id, tunnel.name, secret);
                state.save(&ctx.state_dir)?;
                state
            }
        };

        let service = format!("http://{}", service_host());
        cf.configure_tunnel(
            account,
            &state.tunnel_id,
            &TunnelConfiguration::route(&hostname, &service),
        )
        .await
        .context("failed to configure tunnel ingress")?;

        let zone = cf
            .find_zone(account, &config.tunnel.domain)
            .await
            .with_context(|| format!("failed to look up zone {}", config.tunnel.domain))?;
        cf.upsert_cname(&zone.id, &hostname, &cname_for(&state.tunnel_id))
            .await
            .with_context(|| format!("failed to publish DNS record {hostname}"))?;

        let token = cf
            .tunnel_token(account, &state.tunnel_id)
            .await
            .context("failed to fetch tunnel token")?;

        Ok(TunnelIdentity {
            account_id: account.to_string(),
            tunnel_id: state.tunnel_id,
            secret: state.secret,
            token,
        })
    }
}

/// Placeholders for dry runs, using stored state where it exists.
fn planned(ctx: &StackContext, config: &CloudflareConfig) -> Result<TunnelIdentity> {
    let stored = TunnelState::load(&ctx.state_dir)?.filter(|s| s.matches_account(&config.account_id));
    let tunnel_id = stored.map_or_else(|| "<tunnel-id>".to_string(), |s| s.tunnel_id);
    Ok(TunnelIdentity {
        account_id: config.account_id.clone(),
        tunnel_id,
        secret: "<tunnel-secret>".to_string(),
        token: "<tunnel-token>".to_string(),
    })
}

#[async_trait]
impl Component for CloudflareTunnel {
    fn name(&self) -> &'static str {
        "cloudflare-tunnel"
    }

    fn description(&self) -> &'static str {
        "Cloudflare Tunnel to the ingress gateway"
    }

    fn enabled(&self, ctx: &StackContext) -> bool {
        ctx.stack.cloudflare.is_some()
    }

    async fn render(&self, ctx: &StackContext) -> Result<Rendered> {
        let config = ctx
            .stack
            .cloudflare
            .as_ref()
            .context("stack.cloudflare is not configured")?;
        let identity = if ctx.dry_run {
            planned(ctx, config)?
        } else {
            self.converge(ctx, config).await?
        };

        let mut rendered = Rendered::new();
        rendered
            .apply(&namespace(NAMESPACE, labels(&[])))?
            .apply(&credentials_secret(&identity)?)?
            .apply(&deployment(&identity.token))?;
        rendered
            .output("tunnelId", identity.tunnel_id.clone())
            .output("tunnelCname", cname_for(&identity.tunnel_id))
            .output("dnsRecord", config.tunnel.hostname())
            .output("namespace", NAMESPACE)
            .output("deployment", DEPLOYMENT);
        Ok(rendered)
    }
}

/// `credentials.json` in the format `cloudflared` expects.
pub fn credentials_secret(identity: &TunnelIdentity) -> Result<Secret> {
    let credentials = serde_json::to_string(&serde_json::json!({
        "AccountTag": identity.account_id,
        "TunnelID": identity.tunnel_id,
        "TunnelSecret": identity.secret,
    }))
    .context("failed to encode tunnel credentials")?;

    Ok(Secret {
        metadata: meta(CREDENTIALS_SECRET, NAMESPACE, labels(&[])),
        type_: Some("Opaque".to_string()),
        string_data: Some(BTreeMap::from([("credentials.json".to_string(), credentials)])),
        ..Secret::default()
    })
}

#[must_use]
pub fn deployment(token: &str) -> Deployment {
    let app = labels(&[("app", DEPLOYMENT)]);
    let args = [
        "tunnel",
        "--no-autoupdate",
        "--metrics",
        "0.0.0.0:2000",
        "run",
        "--token",
        token,
    ];

    let container = Container {
        name: DEPLOYMENT.to_string(),
        image: Some(IMAGE.to_string()),
        args: Some(args.iter().map(|a| (*a).to_string()).collect()),
        liveness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/ready".to_string()),
                port: IntOrString::Int(METRICS_PORT),
                ..HTTPGetAction::default()
            }),
            initial_delay_seconds: Some(10),
            period_seconds: Some(10),
            ..Probe::default()
        }),
        resources: Some(resources("100m", "128Mi", "20m", "64Mi")),
        ..Container::default()
    };

    Deployment {
        metadata: meta(DEPLOYMENT, NAMESPACE, app.clone()),
        spec: Some(DeploymentSpec {
            replicas: Some(REPLICAS),
            selector: LabelSelector {
                match_labels: Some(app.clone()),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(app),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    ..PodSpec::default()
                }),
            },
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    }
}
