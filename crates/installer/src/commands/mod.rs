//! Subcommand implementations.

pub mod bootstrap;
pub mod clustertoken;
pub mod deploy;
pub mod k3s;
pub mod kubeconfig;

use std::path::PathBuf;

use anyhow::{Context, Result};
use homelab_metal::inventory::InfraConfig;
use homelab_metal::ssh::SshClient;
use tracing::{error, info};

use crate::config::{self, ConnectionArgs, Target};

/// Options shared by every subcommand.
#[derive(Debug, Clone, Default)]
pub struct Globals {
    /// Explicit `--config` path; discovered when `None`.
    pub config: Option<PathBuf>,
}

impl Globals {
    /// Load the inventory if one is configured or discoverable.
    pub fn inventory(&self) -> Result<Option<InfraConfig>> {
        Ok(config::load_inventory(self.config.as_deref())?.map(|(_, infra)| infra))
    }
}

/// Resolve the target node and open an SSH session to it.
pub(crate) fn connect(
    args: &ConnectionArgs,
    infra: Option<&InfraConfig>,
) -> Result<(Target, SshClient)> {
    let target = Target::resolve(args, infra, &config::process_env)?;
    let auth = target.auth(&config::process_env, config::prompt_password)?;

    info!(
        node = %target.display(),
        user = %target.user,
        port = target.port,
        auth_method = auth.method(),
        "Creating SSH connection"
    );

    let mut client = SshClient::new(target.host.clone(), target.user.clone(), auth)
        .with_port(target.port);
    if let Err(e) = client.connect() {
        error!(node = %target.display(), user = %target.user, error = %e, "SSH connection failed");
        return Err(e).with_context(|| format!("failed to connect to {}", target.display()));
    }

    info!(node = %target.display(), "Successfully connected to node");
    Ok((target, client))
}
