use anyhow::Result;
use async_trait::async_trait;

use crate::component::{Component, Rendered, Step};
use crate::config::StackContext;

const RELEASE_URL: &str = "https://github.com/kubernetes-sigs/gateway-api/releases/download";

/// Gateway API standard-channel CRDs.
pub struct GatewayApi;

/// URL of the standard install manifest for `version` (with or without a leading `v`).
#[must_use]
pub fn manifest_url(version: &str) -> String {
    let version = version.trim_start_matches('v');
    format!("{RELEASE_URL}/v{version}/standard-install.yaml")
}

#[async_trait]
impl Component for GatewayApi {
    fn name(&self) -> &'static str {
        "gateway-api"
    }

    fn description(&self) -> &'static str {
        "Gateway API CRDs"
    }

    async fn render(&self, ctx: &StackContext) -> Result<Rendered> {
        let version = &ctx.stack.gatewayapi.version;
        let mut rendered = Rendered::new();
        rendered
            .push(Step::ApplyUrl(manifest_url(version)))
            .output("version", version.clone());
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_url() {
        let expected = "https://github.com/kubernetes-sigs/gateway-api/releases/download/v1.2.0/standard-install.yaml";
        assert_eq!(manifest_url("1.2.0"), expected);
        assert_eq!(manifest_url("v1.2.0"), expected);
    }

    #[tokio::test]
    async fn test_render_uses_configured_version() {
        let mut ctx = StackContext::for_vip("10.0.0.1");
        ctx.stack.gatewayapi.version = "1.3.0".into();
        let rendered = GatewayApi.render(&ctx).await.unwrap();
        assert_eq!(rendered.steps.len(), 1);
        assert!(matches!(&rendered.steps[0], Step::ApplyUrl(url) if url.contains("/v1.3.0/")));
    }
}
