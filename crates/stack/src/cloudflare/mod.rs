//! Cloudflare API client for tunnels and DNS.
//!
//! Covers the small slice of the v4 API the tunnel component needs:
//! remotely-managed tunnels, their ingress configuration and run token,
//! zone lookup, and CNAME records.

mod client;
mod models;
mod names;
mod state;

pub use client::Cloudflare;
pub use models::*;
pub use names::{pet_name, tunnel_secret};
pub use state::TunnelState;

use thiserror::Error;

/// Errors returned by the Cloudflare client.
#[derive(Error, Debug)]
pub enum CloudflareError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("Cloudflare API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Response body could not be parsed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Successful response without a `result`.
    #[error("Cloudflare returned no result for {0}")]
    MissingResult(String),
}
