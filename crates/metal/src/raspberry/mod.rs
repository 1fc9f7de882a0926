//! Raspberry Pi 5 node preparation.
//!
//! Writes the boot firmware configuration, sets the EEPROM boot order,
//! enables the memory cgroup on the kernel command line, installs the
//! packages Longhorn needs, and reboots.

mod provisioner;

pub use provisioner::{update_cmdline, Provisioner, Step, REBOOT_TIMEOUT};

/// Embedded `/boot/firmware/config.txt`.
pub const CONFIG_TXT: &str = include_str!("assets/config.txt");

/// Embedded EEPROM configuration.
pub const EEPROM_CONF: &str = include_str!("assets/eeprom.conf");

/// Boot firmware paths on Raspberry Pi OS (bookworm and later).
pub mod paths {
    pub const CONFIG_TXT: &str = "/boot/firmware/config.txt";
    pub const EEPROM_CONF: &str = "/boot/firmware/eeprom.conf";
    pub const CMDLINE_TXT: &str = "/boot/firmware/cmdline.txt";
}

/// Packages required by Longhorn (iSCSI initiator, NFS client for RWX).
pub const PACKAGES: [&str; 2] = ["open-iscsi", "nfs-common"];
