use anyhow::{Context, Result};
use clap::Args;
use homelab_metal::k3s::{write_kubeconfig, InstallMode, Installer};
use tracing::info;

use super::{connect, Globals};
use crate::config::{self, ConnectionArgs, K3sArgs, K3sSettings};
use crate::ui;

/// Install K3s on a node.
///
/// The node should be provisioned first with `bootstrap`.
///
/// Examples:
///
///   homelab k3s --node pi-0 --cluster-init
///
///   homelab k3s --node pi-1 --server https://192.168.1.51:6443 --token K10xxx...
#[derive(Args, Debug)]
pub struct K3sCommand {
    #[command(flatten)]
    connection: ConnectionArgs,

    #[command(flatten)]
    k3s: K3sArgs,
}

impl K3sCommand {
    pub fn run(&self, globals: &Globals) -> Result<()> {
        let infra = globals.inventory()?;
        // Validate before prompting for a password.
        let settings = K3sSettings::resolve(&self.k3s, infra.as_ref(), &config::process_env)?;
        let (target, mut client) = connect(&self.connection, infra.as_ref())?;

        ui::print_section(&format!("☸ Installing K3s on {}", target.display()));
        match &settings.mode {
            InstallMode::ClusterInit => ui::print_kv("mode", "cluster-init"),
            InstallMode::Join { server, .. } => ui::print_kv("joining", server),
        }
        if !settings.sans.is_empty() {
            ui::print_kv("tls-san", &settings.sans.join(", "));
        }

        let mut installer =
            Installer::new(&mut client, settings.sans.clone()).with_node_labels(target.labels.clone());

        let spinner = ui::spinner("Running the K3s install script");
        let installed = installer.install(&settings.mode);
        spinner.finish_and_clear();
        installed?;
        ui::print_success("K3s installed");

        ui::print_step("Extracting kubeconfig");
        let kubeconfig = installer.kubeconfig()?;
        write_kubeconfig(&kubeconfig, &settings.output_kubeconfig).with_context(|| {
            format!(
                "Failed to write kubeconfig to {}",
                settings.output_kubeconfig.display()
            )
        })?;
        ui::print_kv("kubeconfig", &settings.output_kubeconfig.display().to_string());

        client.close()?;
        info!(node = %target.display(), "K3s installation complete");
        if settings.mode == InstallMode::ClusterInit {
            ui::print_info("Run `homelab clustertoken` to get the token for joining nodes");
        }
        Ok(())
    }
}
