//! `infra.yaml` inventory.
//!
//! Describes the cluster (VIP, SANs, join token), default SSH settings, the
//! nodes, and the `stack:` section consumed by the component deployer.

use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::ssh::DEFAULT_SSH_PORT;

/// Files searched, in order, when no config path is given.
pub const SEARCH_PATHS: [&str; 4] = [
    "./infra.yaml",
    "./infra.yml",
    "../infra.yaml",
    "../infra.yml",
];

/// Inventory loading and validation errors.
#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("at least one node must be defined in infra.yaml")]
    NoNodes,

    #[error("duplicate node name: {0}")]
    DuplicateNode(String),

    #[error("invalid cluster VIP: {0}")]
    InvalidVip(String),
}

/// The complete `infra.yaml` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfraConfig {
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub kubevip: KubeVipConfig,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    /// Raw `stack:` section, interpreted by the stack crate.
    #[serde(default, skip_serializing_if = "serde_yaml::Value::is_null")]
    pub stack: serde_yaml::Value,
}

/// Cluster-wide K3s settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vip: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sans: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// SSH settings, global or per node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Private key path; selects key authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<PathBuf>,
}

/// kube-vip settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubeVipConfig {
    #[serde(default = "default_kubevip_version")]
    pub version: String,
    #[serde(default = "default_kubevip_interface")]
    pub interface: String,
}

impl Default for KubeVipConfig {
    fn default() -> Self {
        Self {
            version: default_kubevip_version(),
            interface: default_kubevip_interface(),
        }
    }
}

fn default_kubevip_version() -> String {
    "v0.8.7".to_string()
}

fn default_kubevip_interface() -> String {
    "eth0".to_string()
}

/// A single node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<SshConfig>,
}

impl InfraConfig {
    /// Parse and validate an inventory from YAML text.
    ///
    /// # Errors
    /// Returns an error if the YAML is malformed or validation fails.
    pub fn from_yaml(yaml: &str, path: &Path) -> Result<Self, InventoryError> {
        let mut config: Self =
            serde_yaml::from_str(yaml).map_err(|source| InventoryError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    /// Load and validate `path`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self, InventoryError> {
        debug!(path = %path.display(), "Loading inventory");
        let yaml = std::fs::read_to_string(path).map_err(|source| InventoryError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&yaml, path)
    }

    /// Find the first inventory file in [`SEARCH_PATHS`] relative to `base`.
    #[must_use]
    pub fn discover(base: &Path) -> Option<PathBuf> {
        SEARCH_PATHS
            .iter()
            .map(|candidate| base.join(candidate))
            .find(|path| path.is_file())
    }

    fn apply_defaults(&mut self) {
        if self.ssh.port.is_none() {
            self.ssh.port = Some(DEFAULT_SSH_PORT);
        }
    }

    /// Check structural rules.
    ///
    /// # Errors
    /// Returns the first violated rule.
    pub fn validate(&self) -> Result<(), InventoryError> {
        if self.nodes.is_empty() {
            return Err(InventoryError::NoNodes);
        }

        let mut names = HashSet::new();
        for node in &self.nodes {
            if !names.insert(node.name.as_str()) {
                return Err(InventoryError::DuplicateNode(node.name.clone()));
            }
        }

        if let Some(vip) = self.cluster.vip.as_deref().filter(|v| !v.is_empty()) {
            if vip.parse::<IpAddr>().is_err() {
                return Err(InventoryError::InvalidVip(vip.to_string()));
            }
        }

        Ok(())
    }

    /// Look up a node by name.
    #[must_use]
    pub fn find_node(&self, name: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// The cluster VIP, if one is configured.
    #[must_use]
    pub fn vip(&self) -> Option<&str> {
        self.cluster.vip.as_deref().filter(|v| !v.is_empty())
    }
}

impl NodeConfig {
    /// Node-level SSH user, if set.
    #[must_use]
    pub fn ssh_user(&self) -> Option<&str> {
        self.ssh
            .as_ref()
            .and_then(|s| s.user.as_deref())
            .filter(|u| !u.is_empty())
    }

    /// Node-level SSH port, if set.
    #[must_use]
    pub fn ssh_port(&self) -> Option<u16> {
        self.ssh.as_ref().and_then(|s| s.port)
    }

    /// Node-level SSH key, if set.
    #[must_use]
    pub fn ssh_key(&self) -> Option<&Path> {
        self.ssh.as_ref().and_then(|s| s.key.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
cluster:
  vip: 192.168.1.50
  sans: [k8s.home.arpa, 192.168.1.50]
  token: K10secret
ssh:
  user: pi
kubevip:
  version: v0.8.9
nodes:
  - name: pi-0
    address: 192.168.1.51
    labels:
      topology.kubernetes.io/zone: rack-a
  - name: pi-1
    address: 192.168.1.52
    ssh:
      user: admin
      port: 2222
stack:
  istio:
    version: 1.28.2
"#;

    fn parse(yaml: &str) -> Result<InfraConfig, InventoryError> {
        InfraConfig::from_yaml(yaml, Path::new("infra.yaml"))
    }

    #[test]
    fn test_parse_sample() {
        let config = parse(SAMPLE).unwrap();
        assert_eq!(config.vip(), Some("192.168.1.50"));
        assert_eq!(config.cluster.sans.len(), 2);
        assert_eq!(config.ssh.user.as_deref(), Some("pi"));
        assert_eq!(config.ssh.port, Some(22));
        assert_eq!(config.kubevip.version, "v0.8.9");
        assert_eq!(config.kubevip.interface, "eth0");
        assert!(config.stack.get("istio").is_some());

        let node = config.find_node("pi-1").unwrap();
        assert_eq!(node.ssh_user(), Some("admin"));
        assert_eq!(node.ssh_port(), Some(2222));
        assert!(config.find_node("pi-9").is_none());
    }

    #[test]
    fn test_requires_nodes() {
        let err = parse("cluster:\n  vip: 10.0.0.1\n").unwrap_err();
        assert!(matches!(err, InventoryError::NoNodes));
    }

    #[test]
    fn test_duplicate_names() {
        let yaml = "nodes:\n  - {name: a, address: 10.0.0.1}\n  - {name: a, address: 10.0.0.2}\n";
        let err = parse(yaml).unwrap_err();
        assert!(matches!(err, InventoryError::DuplicateNode(name) if name == "a"));
    }

    #[test]
    fn test_invalid_vip() {
        let yaml = "cluster:\n  vip: not-an-ip\nnodes:\n  - {name: a, address: 10.0.0.1}\n";
        let err = parse(yaml).unwrap_err();
        assert!(matches!(err, InventoryError::InvalidVip(_)));

        let yaml = "cluster:\n  vip: ''\nnodes:\n  - {name: a, address: 10.0.0.1}\n";
        assert!(parse(yaml).unwrap().vip().is_none());
    }

    #[test]
    fn test_discover_order() {
        let root = tempfile::tempdir().unwrap();
        let work = root.path().join("work");
        std::fs::create_dir(&work).unwrap();

        assert!(InfraConfig::discover(&work).is_none());

        std::fs::write(root.path().join("infra.yml"), "nodes: []").unwrap();
        assert_eq!(
            InfraConfig::discover(&work),
            Some(work.join("../infra.yml"))
        );

        std::fs::write(work.join("infra.yml"), "nodes: []").unwrap();
        assert_eq!(InfraConfig::discover(&work), Some(work.join("infra.yml")));

        std::fs::write(work.join("infra.yaml"), "nodes: []").unwrap();
        assert_eq!(InfraConfig::discover(&work), Some(work.join("infra.yaml")));
    }

    #[test]
    fn test_load_missing_file() {
        let err = InfraConfig::load(Path::new("/nonexistent/infra.yaml")).unwrap_err();
        assert!(matches!(err, InventoryError::Read { .. }));
    }
}
