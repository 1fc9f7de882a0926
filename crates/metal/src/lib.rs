//! Node provisioning for the homelab.
//!
//! This crate talks to Raspberry Pi nodes over SSH: it prepares the boot
//! configuration, installs K3s, and pulls the cluster token and kubeconfig
//! back to the operator's machine.
//!
//! # Example
//!
//! ```rust,ignore
//! use homelab_metal::raspberry::Provisioner;
//! use homelab_metal::ssh::{Auth, SshClient};
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut client = SshClient::new("192.168.1.51", "pi", Auth::Password("raspberry".into()));
//!     client.connect()?;
//!
//!     Provisioner::new(&mut client).provision()?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod inventory;
pub mod k3s;
pub mod raspberry;
pub mod remote;
pub mod retry;
pub mod ssh;

pub use inventory::{InfraConfig, NodeConfig};
pub use remote::{CommandOutput, Remote};
pub use ssh::{Auth, RebootPolicy, SshClient, SshError};
