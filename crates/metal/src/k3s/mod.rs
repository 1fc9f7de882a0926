//! K3s server installation.
//!
//! Nodes are always installed as servers (embedded etcd). The first node
//! initialises the cluster, later nodes join it with the server URL and the
//! cluster token.

mod kubeconfig;

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::remote::Remote;

pub use kubeconfig::{
    default_kubeconfig_path, extract_kubeconfig, merge_kubeconfig, rename_kubeconfig,
    write_kubeconfig, DEFAULT_NAME,
};

/// Install script endpoint.
pub const INSTALL_SCRIPT_URL: &str = "https://get.k3s.io";

/// Where K3s stores the cluster join token.
pub const TOKEN_PATH: &str = "/var/lib/rancher/k3s/server/token";

/// Where K3s writes the admin kubeconfig.
pub const KUBECONFIG_PATH: &str = "/etc/rancher/k3s/k3s.yaml";

/// Bundled components replaced by the stack (Istio ingress, kube-vip).
/// The default for [`Installer::with_disabled`].
pub const DISABLED_COMPONENTS: [&str; 2] = ["traefik", "servicelb"];

/// How a server joins the cluster.
#[derive(Clone, PartialEq, Eq)]
pub enum InstallMode {
    /// First server; bootstraps embedded etcd.
    ClusterInit,
    /// Additional server joining an existing cluster.
    Join { server: String, token: String },
}

impl std::fmt::Debug for InstallMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClusterInit => write!(f, "ClusterInit"),
            Self::Join { server, .. } => f
                .debug_struct("Join")
                .field("server", server)
                .field("token", &"<redacted>")
                .finish(),
        }
    }
}

/// Build the install command line.
///
/// Labels are emitted sorted by key so the command is stable.
#[must_use]
pub fn build_install_command<S: AsRef<str>>(
    mode: &InstallMode,
    sans: &[String],
    disable: &[S],
    node_labels: &BTreeMap<String, String>,
) -> String {
    let mut cmd = format!("curl -sfL {INSTALL_SCRIPT_URL} | sh -s - server");
    for component in disable.iter().map(AsRef::as_ref) {
        cmd.push_str(&format!(" --disable={component}"));
    }

    for san in sans.iter().filter(|s| !s.is_empty()) {
        cmd.push_str(&format!(" --tls-san {san}"));
    }

    for (key, value) in node_labels {
        cmd.push_str(&format!(" --node-label {key}={value}"));
    }

    match mode {
        InstallMode::ClusterInit => cmd.push_str(" --cluster-init"),
        InstallMode::Join { server, token } => {
            cmd.push_str(&format!(" --server {server} --token {token}"));
        }
    }

    cmd
}

/// Installs K3s and reads back cluster credentials from a node.
pub struct Installer<R: Remote> {
    remote: R,
    sans: Vec<String>,
    disable: Vec<String>,
    node_labels: BTreeMap<String, String>,
}

impl<R: Remote> Installer<R> {
    /// Create an installer for the node behind `remote`.
    pub fn new(remote: R, sans: Vec<String>) -> Self {
        Self {
            remote,
            sans,
            disable: DISABLED_COMPONENTS.iter().map(|c| (*c).to_string()).collect(),
            node_labels: BTreeMap::new(),
        }
    }

    /// Bundled K3s components to switch off.
    #[must_use]
    pub fn with_disabled(mut self, components: Vec<String>) -> Self {
        self.disable = components;
        self
    }

    /// Labels applied to the node at registration.
    #[must_use]
    pub fn with_node_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.node_labels = labels;
        self
    }

    /// Run the install script.
    ///
    /// # Errors
    /// Returns an error carrying the script output if the install fails.
    pub fn install(&mut self, mode: &InstallMode) -> Result<()> {
        info!(
            address = self.remote.address(),
            cluster_init = matches!(mode, InstallMode::ClusterInit),
            sans = ?self.sans,
            "Running K3s install script"
        );

        let cmd = build_install_command(mode, &self.sans, &self.disable, &self.node_labels);
        if let Err(e) = self.remote.execute(&cmd) {
            error!(error = %e, output = e.output().unwrap_or_default(), "K3s installation failed");
            let output = e.output().unwrap_or_default().trim().to_string();
            return Err(anyhow::Error::new(e).context(format!("failed to install K3s: {output}")));
        }

        info!("K3s installation completed successfully");
        Ok(())
    }

    /// Read the cluster join token.
    ///
    /// # Errors
    /// Returns an error if the token file cannot be read.
    pub fn cluster_token(&mut self) -> Result<String> {
        let token = self
            .remote
            .read_file(TOKEN_PATH, true)
            .context("failed to read cluster token")?;
        Ok(token.trim().to_string())
    }

    /// Read the admin kubeconfig with the server pointed at this node.
    ///
    /// # Errors
    /// Returns an error if the kubeconfig cannot be read or parsed.
    pub fn kubeconfig(&mut self) -> Result<String> {
        let address = self.remote.address().to_string();
        extract_kubeconfig(&mut self.remote, &address)
    }
}
