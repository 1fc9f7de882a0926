use anyhow::Result;
use clap::Args;
use homelab_metal::raspberry::{Provisioner, Step};
use indicatif::ProgressBar;
use tracing::info;

use super::{connect, Globals};
use crate::config::ConnectionArgs;
use crate::ui;

/// Provision a Raspberry Pi node.
///
/// Copies the boot firmware configuration, applies the EEPROM settings,
/// enables memory cgroups, installs storage packages, then reboots and waits
/// for the node to come back.
#[derive(Args, Debug)]
pub struct BootstrapCommand {
    #[command(flatten)]
    connection: ConnectionArgs,
}

impl BootstrapCommand {
    pub fn run(&self, globals: &Globals) -> Result<()> {
        let infra = globals.inventory()?;
        let (target, mut client) = connect(&self.connection, infra.as_ref())?;

        ui::print_section(&format!("🍓 Provisioning {}", target.display()));

        let total = Step::ALL.len();
        let mut spinner: Option<ProgressBar> = None;
        let result = Provisioner::new(&mut client).provision_with(|step| {
            let index = Step::ALL.iter().position(|s| *s == step).unwrap_or(0) + 1;
            if step == Step::Reboot {
                spinner = Some(ui::spinner("Rebooting and waiting for SSH"));
            } else {
                ui::print_progress_step(index, total, step.description());
            }
        });

        if let Some(spinner) = spinner {
            spinner.finish_and_clear();
        }
        result?;

        client.close()?;
        info!(node = %target.display(), "Raspberry Pi provisioning complete");
        ui::print_success(&format!("{} is provisioned", target.display()));
        ui::print_info("Next: homelab k3s --node <name> --cluster-init");
        Ok(())
    }
}
