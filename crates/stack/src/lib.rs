//! In-cluster platform stack for the homelab.
//!
//! Each [`Component`] renders itself into an ordered list of [`Step`]s:
//! objects applied with server-side apply, Helm releases, and remote
//! manifests. The [`deploy`] module runs the components in dependency order
//! through an [`Applier`], or prints them in dry-run mode.
//!
//! Components, in deploy order:
//!
//! | name | what |
//! |------|------|
//! | `kube-vip` | control-plane VIP (ARP, leader election) |
//! | `gateway-api` | Gateway API CRDs |
//! | `istio` | Istio ambient: base, istiod, CNI, ztunnel |
//! | `istio-ingress` | Istio ingress gateway (ClusterIP) |
//! | `gateway` | Istio `Gateway` and health-check route |
//! | `longhorn` | Longhorn distributed block storage |
//! | `cloudflare-tunnel` | Cloudflare Tunnel in front of the ingress gateway |

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod apply;
pub mod cloudflare;
pub mod component;
pub mod components;
pub mod config;
pub mod deploy;
pub mod helm;
pub mod objects;

pub use apply::Applier;
pub use component::{Component, Rendered, Step};
pub use config::{StackConfig, StackContext};
pub use helm::HelmRelease;
