use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use homelab_metal::k3s::{
    default_kubeconfig_path, extract_kubeconfig, merge_kubeconfig, rename_kubeconfig,
    write_kubeconfig,
};
use homelab_metal::Remote;
use tracing::info;

use super::{connect, Globals};
use crate::config::ConnectionArgs;
use crate::ui;

/// Extract the kubeconfig from a K3s node.
///
/// Prints to stdout unless `--output` or `--merge` is given.
#[derive(Args, Debug)]
pub struct KubeconfigCommand {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Path to write the kubeconfig (default: stdout).
    #[arg(long, value_name = "PATH", conflicts_with = "merge")]
    output: Option<PathBuf>,

    /// Merge into ~/.kube/config instead of printing.
    #[arg(long)]
    merge: bool,

    /// Cluster, user and context name used when merging.
    #[arg(long, value_name = "NAME", default_value = "homelab")]
    context: String,
}

impl KubeconfigCommand {
    pub fn run(&self, globals: &Globals) -> Result<()> {
        let infra = globals.inventory()?;
        let (target, mut client) = connect(&self.connection, infra.as_ref())?;

        info!(node = %target.display(), "Extracting kubeconfig");
        let address = client.address().to_string();
        let kubeconfig = extract_kubeconfig(&mut client, &address)?;
        client.close()?;

        if self.merge {
            let path = default_kubeconfig_path().context("Could not determine home directory")?;
            let renamed = rename_kubeconfig(&kubeconfig, &self.context)?;
            let existing = match std::fs::read_to_string(&path) {
                Ok(existing) => existing,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to read {}", path.display()))
                }
            };
            let merged = merge_kubeconfig(&existing, &renamed)?;
            write_kubeconfig(&merged, &path)?;
            ui::print_success(&format!(
                "Merged context '{}' into {}",
                self.context,
                path.display()
            ));
        } else if let Some(output) = &self.output {
            write_kubeconfig(&kubeconfig, output)?;
            ui::print_success(&format!("Kubeconfig saved to: {}", output.display()));
        } else {
            print!("{kubeconfig}");
        }
        Ok(())
    }
}
