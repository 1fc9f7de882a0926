//! Cloudflare v4 request and response models.

use serde::{Deserialize, Serialize};

// ============================================================================
// Envelope
// ============================================================================

/// Every v4 response is wrapped in this envelope.
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub errors: Vec<ApiMessage>,
    pub result: Option<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiMessage {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

impl<T> Envelope<T> {
    /// Error messages joined for display, e.g. `1003: Invalid tunnel`.
    #[must_use]
    pub fn error_message(&self) -> String {
        self.errors
            .iter()
            .map(|e| format!("{}: {}", e.code, e.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

// ============================================================================
// Tunnels
// ============================================================================

/// A `cfd_tunnel`.
#[derive(Debug, Clone, Deserialize)]
pub struct Tunnel {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub deleted_at: Option<String>,
}

impl Tunnel {
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// CNAME target that routes to this tunnel.
    #[must_use]
    pub fn cname(&self) -> String {
        cname_for(&self.id)
    }
}

/// CNAME target for a tunnel id.
#[must_use]
pub fn cname_for(tunnel_id: &str) -> String {
    format!("{tunnel_id}.cfargotunnel.com")
}

#[derive(Debug, Serialize)]
pub struct CreateTunnelBody<'a> {
    pub name: &'a str,
    /// Base64 of 32 random bytes.
    pub tunnel_secret: &'a str,
    /// `cloudflare` makes the ingress rules remotely managed.
    pub config_src: &'a str,
}

#[derive(Debug, Serialize)]
pub struct TunnelConfigurationBody {
    pub config: TunnelConfiguration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfiguration {
    pub ingress: Vec<IngressRule>,
}

/// One ingress rule. The last rule must have no hostname.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub service: String,
}

impl TunnelConfiguration {
    /// Route `hostname` to `service` and return 404 for everything else.
    #[must_use]
    pub fn route(hostname: &str, service: &str) -> Self {
        Self {
            ingress: vec![
                IngressRule {
                    hostname: Some(hostname.to_string()),
                    service: service.to_string(),
                },
                IngressRule {
                    hostname: None,
                    service: "http_status:404".to_string(),
                },
            ],
        }
    }
}

// ============================================================================
// Zones and DNS
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct Zone {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub content: String,
    #[serde(default)]
    pub proxied: bool,
}

#[derive(Debug, Serialize)]
pub struct DnsRecordBody<'a> {
    #[serde(rename = "type")]
    pub record_type: &'a str,
    pub name: &'a str,
    pub content: &'a str,
    pub proxied: bool,
    /// 1 means automatic.
    pub ttl: u32,
    pub comment: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_has_catch_all_last() {
        let config = TunnelConfiguration::route("*.example.com", "http://gw:80");
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["ingress"][0]["hostname"], "*.example.com");
        assert_eq!(value["ingress"][1]["service"], "http_status:404");
        assert!(value["ingress"][1].get("hostname").is_none());
    }

    #[test]
    fn test_envelope_errors() {
        let envelope: Envelope<Tunnel> = serde_json::from_str(
            r#"{"success":false,"errors":[{"code":1003,"message":"bad"},{"code":7,"message":"worse"}],"result":null}"#,
        )
        .unwrap();
        assert!(envelope.result.is_none());
        assert_eq!(envelope.error_message(), "1003: bad; 7: worse");
    }

    #[test]
    fn test_tunnel_cname() {
        let tunnel: Tunnel =
            serde_json::from_str(r#"{"id":"abc","name":"homelab-x","deleted_at":null}"#).unwrap();
        assert!(!tunnel.is_deleted());
        assert_eq!(tunnel.cname(), "abc.cfargotunnel.com");
    }
}
