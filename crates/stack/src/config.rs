//! The `stack:` section of `infra.yaml`.

use std::path::PathBuf;

use homelab_metal::inventory::{InfraConfig, KubeVipConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default Gateway API release.
pub const DEFAULT_GATEWAY_API_VERSION: &str = "1.2.0";

/// Default Istio chart version.
pub const DEFAULT_ISTIO_VERSION: &str = "1.28.2";

/// Environment variable overriding `stack.cloudflare.accountId`.
pub const ENV_CLOUDFLARE_ACCOUNT_ID: &str = "HOMELAB_CLOUDFLARE_ACCOUNT_ID";

/// Environment variable overriding `stack.cloudflare.apiToken`.
pub const ENV_CLOUDFLARE_API_TOKEN: &str = "HOMELAB_CLOUDFLARE_API_TOKEN";

/// Stack configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid stack configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("{0} is required")]
    Missing(&'static str),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackConfig {
    #[serde(default)]
    pub gatewayapi: GatewayApiConfig,
    #[serde(default)]
    pub istio: IstioConfig,
    #[serde(default)]
    pub longhorn: LonghornConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloudflare: Option<CloudflareConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayApiConfig {
    #[serde(default = "default_gateway_api_version")]
    pub version: String,
}

impl Default for GatewayApiConfig {
    fn default() -> Self {
        Self {
            version: default_gateway_api_version(),
        }
    }
}

fn default_gateway_api_version() -> String {
    DEFAULT_GATEWAY_API_VERSION.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IstioConfig {
    #[serde(default = "default_istio_version")]
    pub version: String,
}

impl Default for IstioConfig {
    fn default() -> Self {
        Self {
            version: default_istio_version(),
        }
    }
}

fn default_istio_version() -> String {
    DEFAULT_ISTIO_VERSION.to_string()
}

/// Longhorn has no default: chart upgrades need a deliberate version bump.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LonghornConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_name")]
    pub name: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            name: default_gateway_name(),
        }
    }
}

fn default_gateway_name() -> String {
    "gateway".to_string()
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudflareConfig {
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub api_token: String,
    #[serde(default)]
    pub tunnel: TunnelConfig,
}

impl std::fmt::Debug for CloudflareConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudflareConfig")
            .field("account_id", &self.account_id)
            .field("api_token", &if self.api_token.is_empty() { "" } else { "<set>" })
            .field("tunnel", &self.tunnel)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Tunnel name prefix; a random suffix is appended on creation.
    #[serde(default = "default_tunnel_name")]
    pub name: String,
    /// Zone the DNS record is created in, e.g. `example.com`.
    #[serde(default)]
    pub domain: String,
    /// Record name within the zone; `*` routes every subdomain.
    #[serde(default = "default_subdomain")]
    pub subdomain: String,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            name: default_tunnel_name(),
            domain: String::new(),
            subdomain: default_subdomain(),
        }
    }
}

fn default_tunnel_name() -> String {
    "homelab".to_string()
}

fn default_subdomain() -> String {
    "*".to_string()
}

impl TunnelConfig {
    /// Fully qualified hostname routed through the tunnel.
    #[must_use]
    pub fn hostname(&self) -> String {
        format!("{}.{}", self.subdomain, self.domain)
    }
}

impl StackConfig {
    /// Parse the raw `stack:` value. A missing section yields defaults.
    pub fn from_value(value: &serde_yaml::Value) -> Result<Self, ConfigError> {
        if value.is_null() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_value(value.clone())?)
    }

    /// Apply Cloudflare credential overrides.
    ///
    /// `lookup` is normally `std::env::var(..).ok()`. Overrides only fill in
    /// an existing `cloudflare` section.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(cloudflare) = self.cloudflare.as_mut() else {
            return;
        };
        if let Some(account) = lookup(ENV_CLOUDFLARE_ACCOUNT_ID).filter(|v| !v.is_empty()) {
            cloudflare.account_id = account;
        }
        if let Some(token) = lookup(ENV_CLOUDFLARE_API_TOKEN).filter(|v| !v.is_empty()) {
            cloudflare.api_token = token;
        }
    }

    /// Check the Cloudflare section, if present, is complete.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(cloudflare) = &self.cloudflare {
            if cloudflare.account_id.is_empty() {
                return Err(ConfigError::Missing("stack.cloudflare.accountId"));
            }
            if cloudflare.api_token.is_empty() {
                return Err(ConfigError::Missing("stack.cloudflare.apiToken"));
            }
            if cloudflare.tunnel.domain.is_empty() {
                return Err(ConfigError::Missing("stack.cloudflare.tunnel.domain"));
            }
        }
        Ok(())
    }
}

/// Everything a component needs to render.
#[derive(Debug, Clone)]
pub struct StackContext {
    /// Control-plane VIP from `cluster.vip`.
    pub vip: Option<String>,
    pub kubevip: KubeVipConfig,
    pub stack: StackConfig,
    /// Where tunnel identity is persisted between runs.
    pub state_dir: PathBuf,
    /// Render only; never call external APIs.
    pub dry_run: bool,
}

impl StackContext {
    /// Build the context from the inventory, applying environment overrides.
    pub fn from_infra(infra: &InfraConfig, state_dir: PathBuf) -> Result<Self, ConfigError> {
        let mut stack = StackConfig::from_value(&infra.stack)?;
        stack.apply_env(|key| std::env::var(key).ok());
        stack.validate()?;

        Ok(Self {
            vip: infra.vip().map(str::to_string),
            kubevip: infra.kubevip.clone(),
            stack,
            state_dir,
            dry_run: false,
        })
    }

    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Minimal context, used by tests.
    #[must_use]
    pub fn for_vip(vip: &str) -> Self {
        Self {
            vip: Some(vip.to_string()),
            kubevip: KubeVipConfig::default(),
            stack: StackConfig::default(),
            state_dir: std::env::temp_dir(),
            dry_run: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn parse(yaml: &str) -> StackConfig {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        StackConfig::from_value(&value).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = StackConfig::from_value(&serde_yaml::Value::Null).unwrap();
        assert_eq!(config.gatewayapi.version, "1.2.0");
        assert_eq!(config.istio.version, "1.28.2");
        assert!(config.longhorn.version.is_none());
        assert_eq!(config.gateway.name, "gateway");
        assert!(config.cloudflare.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_section() {
        let config = parse(
            r#"
gatewayapi: { version: 1.3.0 }
istio: { version: 1.27.0 }
longhorn: { version: 1.8.1 }
cloudflare:
  accountId: acc-123
  apiToken: tok
  tunnel:
    domain: example.com
"#,
        );
        assert_eq!(config.gatewayapi.version, "1.3.0");
        assert_eq!(config.longhorn.version.as_deref(), Some("1.8.1"));
        let cloudflare = config.cloudflare.as_ref().unwrap();
        assert_eq!(cloudflare.tunnel.name, "homelab");
        assert_eq!(cloudflare.tunnel.hostname(), "*.example.com");
        assert!(config.validate().is_ok());
        assert!(!format!("{cloudflare:?}").contains("tok\""));
    }

    #[test]
    fn test_env_overrides_fill_credentials() {
        let mut config = parse("cloudflare:\n  tunnel:\n    domain: example.com\n");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("stack.cloudflare.accountId"))
        ));

        let env = HashMap::from([
            (ENV_CLOUDFLARE_ACCOUNT_ID, "acc-env"),
            (ENV_CLOUDFLARE_API_TOKEN, "tok-env"),
        ]);
        config.apply_env(|key| env.get(key).map(ToString::to_string));

        let cloudflare = config.cloudflare.as_ref().unwrap();
        assert_eq!(cloudflare.account_id, "acc-env");
        assert_eq!(cloudflare.api_token, "tok-env");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_without_section_is_ignored() {
        let mut config = StackConfig::default();
        config.apply_env(|_| Some("value".to_string()));
        assert!(config.cloudflare.is_none());
    }

    #[test]
    fn test_missing_domain() {
        let config = parse("cloudflare: { accountId: a, apiToken: t }\n");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("stack.cloudflare.tunnel.domain"))
        ));
    }
}
