use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info};

use super::{paths, CONFIG_TXT, EEPROM_CONF, PACKAGES};
use crate::remote::Remote;

/// How long to wait for the node after the final reboot.
pub const REBOOT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const CGROUP_PARAMS: [&str; 2] = ["cgroup_memory=1", "cgroup_enable=memory"];

/// Provisioning steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    ConfigTxt,
    Eeprom,
    Cmdline,
    Packages,
    Reboot,
}

impl Step {
    pub const ALL: [Step; 5] = [
        Step::ConfigTxt,
        Step::Eeprom,
        Step::Cmdline,
        Step::Packages,
        Step::Reboot,
    ];

    /// Human-readable description used in logs and errors.
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Step::ConfigTxt => "copy config.txt",
            Step::Eeprom => "apply eeprom.conf",
            Step::Cmdline => "update cmdline.txt",
            Step::Packages => "install packages",
            Step::Reboot => "reboot",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

/// Append the memory cgroup parameters to a kernel command line.
///
/// The result is a single trimmed line. Applying it twice changes nothing.
#[must_use]
pub fn update_cmdline(current: &str) -> String {
    let mut cmdline = current.trim().to_string();
    for param in CGROUP_PARAMS {
        if !cmdline.contains(param) {
            if !cmdline.is_empty() {
                cmdline.push(' ');
            }
            cmdline.push_str(param);
        }
    }
    cmdline
}

/// Prepares a freshly imaged Raspberry Pi for K3s.
pub struct Provisioner<R: Remote> {
    remote: R,
    reboot_timeout: Duration,
}

impl<R: Remote> Provisioner<R> {
    pub fn new(remote: R) -> Self {
        Self {
            remote,
            reboot_timeout: REBOOT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_reboot_timeout(mut self, timeout: Duration) -> Self {
        self.reboot_timeout = timeout;
        self
    }

    /// Run every step in order, stopping at the first failure.
    ///
    /// # Errors
    /// Returns the failing step's error, annotated with the step.
    pub fn provision(&mut self) -> Result<()> {
        self.provision_with(|_| {})
    }

    /// Like [`Provisioner::provision`], calling `on_step` before each step.
    ///
    /// # Errors
    /// Returns the failing step's error, annotated with the step.
    pub fn provision_with<F: FnMut(Step)>(&mut self, mut on_step: F) -> Result<()> {
        info!(address = self.remote.address(), "Starting Raspberry Pi provisioning");

        for step in Step::ALL {
            on_step(step);
            self.run_step(step)
                .with_context(|| format!("failed to {step}"))?;
        }

        info!(address = self.remote.address(), "Node successfully provisioned");
        Ok(())
    }

    fn run_step(&mut self, step: Step) -> Result<()> {
        match step {
            Step::ConfigTxt => {
                info!("Copying config.txt");
                self.remote
                    .write_file(paths::CONFIG_TXT, CONFIG_TXT, true)?;
            }
            Step::Eeprom => {
                info!("Copying and applying eeprom.conf");
                self.remote
                    .write_file(paths::EEPROM_CONF, EEPROM_CONF, true)?;
                self.remote
                    .execute_sudo(&format!("rpi-eeprom-config --apply {}", paths::EEPROM_CONF))?;
            }
            Step::Cmdline => {
                info!("Updating cmdline.txt with cgroup parameters");
                let current = self.remote.read_file(paths::CMDLINE_TXT, true)?;
                let updated = update_cmdline(&current);
                if updated == current.trim() {
                    info!("cmdline.txt already has required cgroup parameters");
                } else {
                    self.remote
                        .write_file(paths::CMDLINE_TXT, &updated, true)?;
                    info!("Updated cmdline.txt with cgroup parameters");
                }
            }
            Step::Packages => {
                let packages = PACKAGES.join(" ");
                info!(packages = %packages, "Installing required packages");
                let cmd = format!(
                    "sh -c 'DEBIAN_FRONTEND=noninteractive apt-get update && \
                     DEBIAN_FRONTEND=noninteractive apt-get install -y {packages}'"
                );
                if let Err(e) = self.remote.execute_sudo(&cmd) {
                    error!(output = e.output().unwrap_or_default(), "Package installation failed");
                    return Err(e.into());
                }
            }
            Step::Reboot => {
                info!("Rebooting node");
                self.remote.reboot()?;
                info!(timeout = ?self.reboot_timeout, "Waiting for node to reboot");
                self.remote.wait_for_reboot(self.reboot_timeout)?;
                info!("Node successfully rebooted");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::fake::FakeRemote;

    const CMDLINE: &str =
        "console=serial0,115200 console=tty1 root=PARTUUID=abcd-02 rootfstype=ext4 fsck.repair=yes rootwait\n";

    #[test]
    fn test_update_cmdline_appends_params() {
        let updated = update_cmdline(CMDLINE);
        assert!(updated.ends_with("rootwait cgroup_memory=1 cgroup_enable=memory"));
        assert!(!updated.contains('\n'));
    }

    #[test]
    fn test_update_cmdline_is_idempotent() {
        let once = update_cmdline(CMDLINE);
        assert_eq!(update_cmdline(&once), once);
    }

    #[test]
    fn test_update_cmdline_partial() {
        let updated = update_cmdline("root=/dev/nvme0n1p2 cgroup_enable=memory");
        assert_eq!(
            updated,
            "root=/dev/nvme0n1p2 cgroup_enable=memory cgroup_memory=1"
        );
        assert_eq!(update_cmdline(""), "cgroup_memory=1 cgroup_enable=memory");
    }

    #[test]
    fn test_provision_runs_all_steps() {
        let mut remote = FakeRemote::new("192.168.1.51").with_file(paths::CMDLINE_TXT, CMDLINE);
        let mut seen = Vec::new();
        Provisioner::new(&mut remote)
            .provision_with(|step| seen.push(step))
            .unwrap();

        assert_eq!(seen, Step::ALL.to_vec());
        assert_eq!(remote.files[paths::CONFIG_TXT], CONFIG_TXT);
        assert_eq!(remote.files[paths::EEPROM_CONF], EEPROM_CONF);
        assert!(remote.files[paths::CMDLINE_TXT].ends_with("cgroup_enable=memory"));
        assert!(remote.writes.iter().all(|(_, sudo)| *sudo));
        assert!(remote
            .commands
            .iter()
            .any(|c| c == "sudo rpi-eeprom-config --apply /boot/firmware/eeprom.conf"));
        assert!(remote
            .commands
            .iter()
            .any(|c| c.contains("apt-get install -y open-iscsi nfs-common")));
        assert_eq!(remote.reboots, 1);
        assert_eq!(remote.waited, Some(REBOOT_TIMEOUT));
    }

    #[test]
    fn test_provision_skips_unchanged_cmdline() {
        let cmdline = update_cmdline(CMDLINE);
        let mut remote = FakeRemote::new("192.168.1.51").with_file(paths::CMDLINE_TXT, &cmdline);
        Provisioner::new(&mut remote).provision().unwrap();
        assert!(!remote
            .writes
            .iter()
            .any(|(path, _)| path == paths::CMDLINE_TXT));
    }

    #[test]
    fn test_provision_stops_on_failure() {
        let mut remote = FakeRemote::new("192.168.1.51").with_file(paths::CMDLINE_TXT, CMDLINE);
        remote.fail_on = Some("rpi-eeprom-config".into());
        let err = Provisioner::new(&mut remote).provision().unwrap_err();
        assert!(err.to_string().contains("apply eeprom.conf"));
        assert_eq!(remote.reboots, 0);
        assert!(!remote.commands.iter().any(|c| c.contains("apt-get")));
    }

    #[test]
    fn test_missing_cmdline_fails() {
        let mut remote = FakeRemote::new("192.168.1.51");
        let err = Provisioner::new(&mut remote).provision().unwrap_err();
        assert!(format!("{err:#}").contains("cmdline.txt"));
    }
}
