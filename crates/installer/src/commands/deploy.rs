use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use homelab_stack::deploy::{self, Progress};
use homelab_stack::{components, Applier, StackContext};
use tracing::info;

use super::Globals;
use crate::config;
use crate::ui;

/// Directory, next to infra.yaml, holding state such as the tunnel identity.
const STATE_DIR: &str = ".homelab";

/// Deploy the in-cluster platform stack.
///
/// Components run in order: kube-vip, gateway-api, istio, istio-ingress,
/// gateway, longhorn, cloudflare-tunnel. The Cloudflare tunnel is skipped
/// when `stack.cloudflare` is not configured.
#[derive(Args, Debug)]
pub struct DeployCommand {
    /// Kubeconfig to use (default: standard kubeconfig resolution).
    #[arg(long, value_name = "PATH")]
    kubeconfig: Option<PathBuf>,

    /// Only deploy these components (comma separated).
    #[arg(long, value_delimiter = ',', value_name = "COMPONENT")]
    only: Vec<String>,

    /// Print the rendered steps as YAML without touching the cluster or Cloudflare.
    #[arg(long)]
    dry_run: bool,

    /// Where deploy state is kept (default: .homelab next to infra.yaml).
    #[arg(long, value_name = "DIR")]
    state_dir: Option<PathBuf>,
}

impl DeployCommand {
    pub async fn run(&self, globals: &Globals) -> Result<()> {
        let (path, infra) = config::load_inventory(globals.config.as_deref())?
            .context("infra.yaml not found (use --config)")?;
        let state_dir = self
            .state_dir
            .clone()
            .unwrap_or_else(|| default_state_dir(&path));

        let ctx = StackContext::from_infra(&infra, state_dir)?.with_dry_run(self.dry_run);
        let selected = deploy::select(components::all(), &self.only)?;

        if self.dry_run {
            let plans = deploy::plan(&ctx, &selected).await?;
            print!("{}", deploy::to_yaml(&plans)?);
            return Ok(());
        }

        ui::print_banner();
        ui::print_section("🚀 Deploying homelab stack");
        let mut applier = Applier::from_kubeconfig(self.kubeconfig.as_deref()).await?;
        info!(components = selected.len(), "Connected to cluster");

        let outputs = deploy::deploy(&ctx, &mut applier, &selected, |progress| match progress {
            Progress::Component { name, description } => ui::print_component(name, description),
            Progress::Skipped { name } => ui::print_warning(&format!("{name}: skipped (not configured)")),
            Progress::Step { step, .. } => ui::print_progress(&step.describe()),
            Progress::Done { name, .. } => ui::print_success(&format!("{name} deployed")),
        })
        .await?;

        ui::print_section("Outputs");
        for (component, values) in &outputs {
            if values.is_empty() {
                continue;
            }
            ui::print_step(component);
            for (key, value) in values {
                ui::print_kv(key, value);
            }
        }
        Ok(())
    }
}

fn default_state_dir(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .map_or_else(|| PathBuf::from(STATE_DIR), |dir| dir.join(STATE_DIR))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state_dir() {
        assert_eq!(
            default_state_dir(Path::new("/srv/lab/infra.yaml")),
            PathBuf::from("/srv/lab/.homelab")
        );
        assert_eq!(
            default_state_dir(Path::new("infra.yaml")),
            PathBuf::from(".homelab")
        );
    }
}
