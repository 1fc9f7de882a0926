//! Cloudflare v4 API client implementation.

use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::models::{
    CreateTunnelBody, DnsRecord, DnsRecordBody, Envelope, Tunnel, TunnelConfiguration,
    TunnelConfigurationBody, Zone,
};
use super::CloudflareError;

/// Base URL for the Cloudflare API.
const API_BASE_URL: &str = "https://api.cloudflare.com/client/v4";

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Comment recorded on managed DNS records.
pub const DNS_COMMENT: &str = "Managed by homelab - Cloudflare Tunnel for Istio Gateway";

/// Cloudflare API client authenticated with an API token.
#[derive(Clone)]
pub struct Cloudflare {
    client: Client,
    api_token: String,
    base_url: String,
}

impl std::fmt::Debug for Cloudflare {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cloudflare")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl Cloudflare {
    /// Create a client for the public API.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(api_token: impl Into<String>) -> Result<Self, CloudflareError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            api_token: api_token.into(),
            base_url: API_BASE_URL.to_string(),
        })
    }

    /// Point the client at another endpoint, e.g. a mock server.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&B>,
    ) -> Result<T, CloudflareError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = format!("{}{path}", self.base_url);
        debug!(method = %method, url = %url, "Cloudflare request");

        let mut request = self
            .client
            .request(method, &url)
            .bearer_auth(&self.api_token);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        Self::handle_response(path, response).await
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, CloudflareError> {
        self.request::<T, ()>(Method::GET, path, query, None).await
    }

    async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, CloudflareError> {
        self.request(Method::POST, path, &[], Some(body)).await
    }

    async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, CloudflareError> {
        self.request(Method::PUT, path, &[], Some(body)).await
    }

    /// Unwrap the v4 envelope, mapping failures to [`CloudflareError`].
    async fn handle_response<T: DeserializeOwned>(
        path: &str,
        response: reqwest::Response,
    ) -> Result<T, CloudflareError> {
        let status = response.status();
        let text = response.text().await?;

        let envelope = match serde_json::from_str::<Envelope<T>>(&text) {
            Ok(envelope) => envelope,
            Err(e) if status.is_success() => {
                warn!(error = %e, body = %text, "Failed to parse response");
                return Err(CloudflareError::Serialization(e));
            }
            Err(_) => {
                return Err(error_for(status, text));
            }
        };

        if !status.is_success() {
            let message = if envelope.errors.is_empty() {
                text
            } else {
                envelope.error_message()
            };
            return Err(error_for(status, message));
        }
        if !envelope.success {
            return Err(CloudflareError::Api {
                status: status.as_u16(),
                message: envelope.error_message(),
            });
        }
        envelope
            .result
            .ok_or_else(|| CloudflareError::MissingResult(path.to_string()))
    }

    // ------------------------------------------------------------------
    // Tunnels
    // ------------------------------------------------------------------

    /// Fetch a tunnel, or `None` if it does not exist.
    pub async fn get_tunnel(
        &self,
        account_id: &str,
        tunnel_id: &str,
    ) -> Result<Option<Tunnel>, CloudflareError> {
        let path = format!("/accounts/{account_id}/cfd_tunnel/{tunnel_id}");
        match self.get(&path, &[]).await {
            Ok(tunnel) => Ok(Some(tunnel)),
            Err(CloudflareError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Create a remotely-managed tunnel.
    pub async fn create_tunnel(
        &self,
        account_id: &str,
        name: &str,
        secret: &str,
    ) -> Result<Tunnel, CloudflareError> {
        let path = format!("/accounts/{account_id}/cfd_tunnel");
        let body = CreateTunnelBody {
            name,
            tunnel_secret: secret,
            config_src: "cloudflare",
        };
        let tunnel: Tunnel = self.post(&path, &body).await?;
        info!(tunnel_id = %tunnel.id, name = %tunnel.name, "Created Cloudflare tunnel");
        Ok(tunnel)
    }

    /// Replace the tunnel's ingress configuration.
    pub async fn configure_tunnel(
        &self,
        account_id: &str,
        tunnel_id: &str,
        config: &TunnelConfiguration,
    ) -> Result<(), CloudflareError> {
        let path = format!("/accounts/{account_id}/cfd_tunnel/{tunnel_id}/configurations");
        let body = TunnelConfigurationBody {
            config: config.clone(),
        };
        let _: serde_json::Value = self.put(&path, &body).await?;
        debug!(tunnel_id = %tunnel_id, rules = config.ingress.len(), "Configured tunnel ingress");
        Ok(())
    }

    /// Token passed to `cloudflared tunnel run --token`.
    pub async fn tunnel_token(
        &self,
        account_id: &str,
        tunnel_id: &str,
    ) -> Result<String, CloudflareError> {
        let path = format!("/accounts/{account_id}/cfd_tunnel/{tunnel_id}/token");
        self.get(&path, &[]).await
    }

    // ------------------------------------------------------------------
    // Zones and DNS
    // ------------------------------------------------------------------

    /// Look up the zone for `domain` within the account.
    pub async fn find_zone(&self, account_id: &str, domain: &str) -> Result<Zone, CloudflareError> {
        let zones: Vec<Zone> = self
            .get("/zones", &[("name", domain), ("account.id", account_id)])
            .await?;
        zones
            .into_iter()
            .find(|z| z.name == domain)
            .ok_or_else(|| CloudflareError::NotFound(format!("zone {domain}")))
    }

    /// Create or update a proxied CNAME record.
    pub async fn upsert_cname(
        &self,
        zone_id: &str,
        name: &str,
        target: &str,
    ) -> Result<DnsRecord, CloudflareError> {
        let path = format!("/zones/{zone_id}/dns_records");
        let existing: Vec<DnsRecord> = self
            .get(&path, &[("type", "CNAME"), ("name", name)])
            .await?;

        let body = DnsRecordBody {
            record_type: "CNAME",
            name,
            content: target,
            proxied: true,
            ttl: 1,
            comment: DNS_COMMENT,
        };

        let record: DnsRecord = match existing.first() {
            Some(record) if record.content == target && record.proxied => {
                debug!(name = %name, "DNS record already up to date");
                return Ok(record.clone());
            }
            Some(record) => self.put(&format!("{path}/{}", record.id), &body).await?,
            None => self.post(&path, &body).await?,
        };
        info!(name = %record.name, target = %target, "Upserted DNS record");
        Ok(record)
    }
}

fn error_for(status: StatusCode, message: String) -> CloudflareError {
    if status == StatusCode::NOT_FOUND {
        CloudflareError::NotFound(message)
    } else {
        CloudflareError::Api {
            status: status.as_u16(),
            message,
        }
    }
}
