//! Command configuration resolution.
//!
//! Every SSH-based command resolves its settings with the same precedence:
//! CLI flag, then the node's entry in `infra.yaml`, then the global
//! `infra.yaml` settings, then `HOMELAB_*` environment variables.
//!
//! Environment access goes through a lookup closure so resolution can be
//! tested without touching the process environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use homelab_metal::inventory::InfraConfig;
use homelab_metal::k3s::InstallMode;
use homelab_metal::ssh::{Auth, DEFAULT_SSH_PORT};
use tracing::{debug, info};

pub const ENV_CONFIG: &str = "HOMELAB_CONFIG";
pub const ENV_NODE: &str = "HOMELAB_NODE";
pub const ENV_SSH_USER: &str = "HOMELAB_SSH_USER";
pub const ENV_SSH_PASSWORD: &str = "HOMELAB_SSH_PASSWORD";
pub const ENV_K3S_SANS: &str = "HOMELAB_K3S_SANS";
pub const ENV_K3S_TOKEN: &str = "HOMELAB_K3S_TOKEN";

/// Default path for the extracted kubeconfig.
pub const DEFAULT_KUBECONFIG_OUTPUT: &str = "./kubeconfig";

/// Lookup used for environment variables.
pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Reads the process environment, treating empty values as unset.
#[must_use]
pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Load the inventory from `path`, or discover it from the working directory.
///
/// Returns `None` when no path was given and nothing was found.
pub fn load_inventory(path: Option<&Path>) -> Result<Option<(PathBuf, InfraConfig)>> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => {
            let cwd = std::env::current_dir().context("Failed to read current directory")?;
            match InfraConfig::discover(&cwd) {
                Some(found) => found,
                None => {
                    debug!("No infra.yaml found");
                    return Ok(None);
                }
            }
        }
    };

    let infra = InfraConfig::load(&path)?;
    info!(path = %path.display(), nodes = infra.nodes.len(), "Loaded inventory");
    Ok(Some((path, infra)))
}

/// Flags shared by every command that connects to a node.
#[derive(Args, Debug, Clone, Default)]
pub struct ConnectionArgs {
    /// Node name from infra.yaml, or `host`, `user@host`, `user@host:port`
    /// when no inventory is used.
    #[arg(long, value_name = "NODE")]
    pub node: Option<String>,

    /// SSH username (optional if defined in infra.yaml).
    #[arg(long, value_name = "USER")]
    pub ssh_user: Option<String>,

    /// Private key for SSH authentication instead of a password.
    #[arg(long, value_name = "PATH")]
    pub ssh_key: Option<PathBuf>,
}

/// A node spec given on the command line without an inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

/// Parse `host`, `user@host`, or `user@host:port`.
pub fn parse_node_spec(spec: &str) -> Result<NodeSpec> {
    let (user, rest) = match spec.split_once('@') {
        Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
        Some(_) => anyhow::bail!("invalid node '{spec}': empty user"),
        None => (None, spec),
    };

    let (host, port) = match rest.rsplit_once(':') {
        // A bare IPv6 address has several colons and no port.
        Some((host, port)) if !host.contains(':') => {
            let port = port
                .parse::<u16>()
                .with_context(|| format!("invalid port in node '{spec}'"))?;
            (host, Some(port))
        }
        _ => (rest, None),
    };

    if host.is_empty() {
        anyhow::bail!("invalid node '{spec}': empty host");
    }
    Ok(NodeSpec {
        user,
        host: host.to_string(),
        port,
    })
}

/// Where and as whom to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Inventory name, when the node came from infra.yaml.
    pub name: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key: Option<PathBuf>,
    pub labels: BTreeMap<String, String>,
}

impl Target {
    /// Resolve the target node and SSH settings.
    pub fn resolve(
        args: &ConnectionArgs,
        infra: Option<&InfraConfig>,
        env: EnvLookup<'_>,
    ) -> Result<Self> {
        let global = infra.map(|i| &i.ssh);
        // Only --node names an inventory node; HOMELAB_NODE is always an address.
        let (name, host, spec_user, spec_port, node) = match (args.node.as_deref(), infra) {
            (Some(node_arg), Some(infra)) => {
                let node = infra.find_node(node_arg).with_context(|| {
                    format!("node '{node_arg}' not found in config file")
                })?;
                (Some(node.name.clone()), node.address.clone(), None, None, Some(node))
            }
            (Some(node_arg), None) => {
                let spec = parse_node_spec(node_arg)?;
                (None, spec.host, spec.user, spec.port, None)
            }
            (None, _) => {
                let Some(node_env) = env(ENV_NODE) else {
                    anyhow::bail!("node is required (use --node with node name from infra.yaml)");
                };
                let spec = parse_node_spec(&node_env)?;
                (None, spec.host, spec.user, spec.port, None)
            }
        };

        let user = args
            .ssh_user
            .clone()
            .or(spec_user)
            .or_else(|| node.and_then(|n| n.ssh_user()).map(str::to_string))
            .or_else(|| global.and_then(|g| g.user.clone()))
            .or_else(|| env(ENV_SSH_USER))
            .context("SSH user is required (use --ssh-user or define in infra.yaml)")?;

        let port = spec_port
            .or_else(|| node.and_then(|n| n.ssh_port()))
            .or_else(|| global.and_then(|g| g.port))
            .unwrap_or(DEFAULT_SSH_PORT);

        let key = args
            .ssh_key
            .clone()
            .or_else(|| node.and_then(|n| n.ssh_key()).map(Path::to_path_buf))
            .or_else(|| global.and_then(|g| g.key.clone()));

        Ok(Self {
            name,
            host,
            port,
            user,
            key,
            labels: node.map(|n| n.labels.clone()).unwrap_or_default(),
        })
    }

    /// `name (host)` or just the host.
    #[must_use]
    pub fn display(&self) -> String {
        match &self.name {
            Some(name) => format!("{name} ({})", self.host),
            None => self.host.clone(),
        }
    }

    /// Key auth when a key is configured, else a password from the
    /// environment or `prompt`.
    pub fn auth<P>(&self, env: EnvLookup<'_>, prompt: P) -> Result<Auth>
    where
        P: FnOnce(&str) -> Result<String>,
    {
        if let Some(path) = &self.key {
            return Ok(Auth::KeyFile {
                path: path.clone(),
                passphrase: None,
            });
        }
        if let Some(password) = env(ENV_SSH_PASSWORD) {
            return Ok(Auth::Password(password));
        }
        let password = prompt(&format!("SSH password for {}@{}", self.user, self.host))?;
        Ok(Auth::Password(password))
    }
}

/// Interactive password prompt.
pub fn prompt_password(prompt: &str) -> Result<String> {
    dialoguer::Password::new()
        .with_prompt(prompt)
        .interact()
        .context("Failed to read password")
}

/// Flags for `homelab k3s`.
#[derive(Args, Debug, Clone, Default)]
pub struct K3sArgs {
    /// Additional TLS SANs for the API server (comma separated).
    #[arg(long, value_delimiter = ',', value_name = "SAN")]
    pub sans: Vec<String>,

    /// Initialize a new cluster.
    #[arg(long)]
    pub cluster_init: bool,

    /// K3s server to join, e.g. https://192.168.1.51:6443.
    #[arg(long, value_name = "URL")]
    pub server: Option<String>,

    /// K3s cluster token.
    #[arg(long, value_name = "TOKEN")]
    pub token: Option<String>,

    /// Path to write the kubeconfig.
    #[arg(long, value_name = "PATH", default_value = DEFAULT_KUBECONFIG_OUTPUT)]
    pub output_kubeconfig: PathBuf,
}

/// Resolved K3s settings.
#[derive(Debug, Clone)]
pub struct K3sSettings {
    pub mode: InstallMode,
    pub sans: Vec<String>,
    pub output_kubeconfig: PathBuf,
}

impl K3sSettings {
    pub fn resolve(
        args: &K3sArgs,
        infra: Option<&InfraConfig>,
        env: EnvLookup<'_>,
    ) -> Result<Self> {
        let cluster = infra.map(|i| &i.cluster);

        let sans = if !args.sans.is_empty() {
            args.sans.clone()
        } else if let Some(sans) = cluster.map(|c| &c.sans).filter(|s| !s.is_empty()) {
            sans.clone()
        } else {
            env(ENV_K3S_SANS)
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };

        let token = args
            .token
            .clone()
            .or_else(|| cluster.and_then(|c| c.token.clone()))
            .or_else(|| env(ENV_K3S_TOKEN))
            .filter(|t| !t.is_empty());
        let server = args.server.clone().filter(|s| !s.is_empty());

        let mode = if args.cluster_init {
            if server.is_some() || args.token.is_some() {
                anyhow::bail!("--cluster-init cannot be used with --server or --token");
            }
            InstallMode::ClusterInit
        } else {
            let server =
                server.context("server URL required for joining nodes (use --server)")?;
            let token =
                token.context("cluster token required for joining nodes (use --token)")?;
            InstallMode::Join { server, token }
        };

        Ok(Self {
            mode,
            sans,
            output_kubeconfig: args.output_kubeconfig.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const INFRA: &str = r"
cluster:
  vip: 192.168.1.50
  sans: [192.168.1.50, k8s.home]
  token: K10yaml
ssh:
  user: pi
nodes:
  - name: pi-0
    address: 192.168.1.51
    labels: { role: storage }
  - name: pi-1
    address: 192.168.1.52
    ssh: { user: admin, port: 2222, key: /keys/pi-1 }
";

    fn infra() -> InfraConfig {
        InfraConfig::from_yaml(INFRA, Path::new("infra.yaml")).unwrap()
    }

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn node(name: &str) -> ConnectionArgs {
        ConnectionArgs {
            node: Some(name.to_string()),
            ..ConnectionArgs::default()
        }
    }

    #[test]
    fn test_parse_node_spec() {
        assert_eq!(
            parse_node_spec("pi@10.0.0.5:2222").unwrap(),
            NodeSpec {
                user: Some("pi".into()),
                host: "10.0.0.5".into(),
                port: Some(2222)
            }
        );
        assert_eq!(parse_node_spec("10.0.0.5").unwrap().user, None);
        assert_eq!(parse_node_spec("fe80::1").unwrap().host, "fe80::1");
        assert!(parse_node_spec("pi@").is_err());
        assert!(parse_node_spec("@host").is_err());
        assert!(parse_node_spec("host:ssh").is_err());
    }

    #[test]
    fn test_node_from_inventory_uses_global_user() {
        let infra = infra();
        let env = env_of(&[(ENV_SSH_USER, "envuser")]);
        let target = Target::resolve(&node("pi-0"), Some(&infra), &env).unwrap();
        assert_eq!(target.host, "192.168.1.51");
        assert_eq!(target.user, "pi");
        assert_eq!(target.port, 22);
        assert_eq!(target.labels["role"], "storage");
        assert_eq!(target.display(), "pi-0 (192.168.1.51)");
    }

    #[test]
    fn test_node_settings_override_global() {
        let infra = infra();
        let target = Target::resolve(&node("pi-1"), Some(&infra), &env_of(&[])).unwrap();
        assert_eq!(target.user, "admin");
        assert_eq!(target.port, 2222);
        assert_eq!(target.key.as_deref(), Some(Path::new("/keys/pi-1")));
    }

    #[test]
    fn test_flag_overrides_everything() {
        let infra = infra();
        let args = ConnectionArgs {
            ssh_user: Some("root".into()),
            ..node("pi-1")
        };
        let target = Target::resolve(&args, Some(&infra), &env_of(&[])).unwrap();
        assert_eq!(target.user, "root");
    }

    #[test]
    fn test_unknown_node() {
        let infra = infra();
        let err = Target::resolve(&node("pi-9"), Some(&infra), &env_of(&[])).unwrap_err();
        assert!(err.to_string().contains("node 'pi-9' not found"));
    }

    #[test]
    fn test_without_inventory_uses_env() {
        let env = env_of(&[(ENV_NODE, "10.0.0.5"), (ENV_SSH_USER, "ubuntu")]);
        let target = Target::resolve(&ConnectionArgs::default(), None, &env).unwrap();
        assert_eq!(target.host, "10.0.0.5");
        assert_eq!(target.user, "ubuntu");
        assert!(target.name.is_none());
    }

    #[test]
    fn test_env_node_with_inventory_is_an_address() {
        let infra = infra();
        let env = env_of(&[(ENV_NODE, "10.0.0.99")]);
        let target = Target::resolve(&ConnectionArgs::default(), Some(&infra), &env).unwrap();
        assert_eq!(target.host, "10.0.0.99");
        assert!(target.name.is_none());
        assert!(target.labels.is_empty());
        assert_eq!(target.user, "pi");
    }

    #[test]
    fn test_flag_node_wins_over_env() {
        let infra = infra();
        let env = env_of(&[(ENV_NODE, "10.0.0.99")]);
        let target = Target::resolve(&node("pi-0"), Some(&infra), &env).unwrap();
        assert_eq!(target.name.as_deref(), Some("pi-0"));
    }

    #[test]
    fn test_missing_node_and_user() {
        assert!(Target::resolve(&ConnectionArgs::default(), None, &env_of(&[])).is_err());
        let err = Target::resolve(&node("10.0.0.5"), None, &env_of(&[])).unwrap_err();
        assert!(err.to_string().contains("SSH user is required"));
    }

    #[test]
    fn test_auth_precedence() {
        let infra = infra();
        let keyed = Target::resolve(&node("pi-1"), Some(&infra), &env_of(&[])).unwrap();
        let auth = keyed
            .auth(&env_of(&[(ENV_SSH_PASSWORD, "pw")]), |_| unreachable!())
            .unwrap();
        assert_eq!(auth.method(), "key");

        let target = Target::resolve(&node("pi-0"), Some(&infra), &env_of(&[])).unwrap();
        let auth = target
            .auth(&env_of(&[(ENV_SSH_PASSWORD, "pw")]), |_| unreachable!())
            .unwrap();
        assert!(matches!(auth, Auth::Password(p) if p == "pw"));

        let mut asked = String::new();
        let auth = target
            .auth(&env_of(&[]), |prompt| {
                asked = prompt.to_string();
                Ok("typed".into())
            })
            .unwrap();
        assert!(matches!(auth, Auth::Password(p) if p == "typed"));
        assert_eq!(asked, "SSH password for pi@192.168.1.51");
    }

    #[test]
    fn test_k3s_join_from_inventory() {
        let infra = infra();
        let args = K3sArgs {
            server: Some("https://192.168.1.51:6443".into()),
            output_kubeconfig: DEFAULT_KUBECONFIG_OUTPUT.into(),
            ..K3sArgs::default()
        };
        let settings = K3sSettings::resolve(&args, Some(&infra), &env_of(&[])).unwrap();
        assert_eq!(settings.sans, vec!["192.168.1.50", "k8s.home"]);
        assert_eq!(
            settings.mode,
            InstallMode::Join {
                server: "https://192.168.1.51:6443".into(),
                token: "K10yaml".into()
            }
        );
    }

    #[test]
    fn test_k3s_env_fallbacks() {
        let env = env_of(&[(ENV_K3S_SANS, "a.home, b.home"), (ENV_K3S_TOKEN, "K10env")]);
        let args = K3sArgs {
            server: Some("https://10.0.0.1:6443".into()),
            ..K3sArgs::default()
        };
        let settings = K3sSettings::resolve(&args, None, &env).unwrap();
        assert_eq!(settings.sans, vec!["a.home", "b.home"]);
        assert!(matches!(settings.mode, InstallMode::Join { token, .. } if token == "K10env"));
    }

    #[test]
    fn test_k3s_validation() {
        let join_without_server = K3sArgs::default();
        let err = K3sSettings::resolve(&join_without_server, None, &env_of(&[])).unwrap_err();
        assert!(err.to_string().contains("server URL required"));

        let join_without_token = K3sArgs {
            server: Some("https://10.0.0.1:6443".into()),
            ..K3sArgs::default()
        };
        let err = K3sSettings::resolve(&join_without_token, None, &env_of(&[])).unwrap_err();
        assert!(err.to_string().contains("cluster token required"));

        let conflicting = K3sArgs {
            cluster_init: true,
            server: Some("https://10.0.0.1:6443".into()),
            ..K3sArgs::default()
        };
        assert!(K3sSettings::resolve(&conflicting, None, &env_of(&[])).is_err());
    }

    #[test]
    fn test_cluster_init_ignores_inventory_token() {
        let infra = infra();
        let args = K3sArgs {
            cluster_init: true,
            ..K3sArgs::default()
        };
        let settings = K3sSettings::resolve(&args, Some(&infra), &env_of(&[])).unwrap();
        assert_eq!(settings.mode, InstallMode::ClusterInit);
    }

    #[test]
    fn test_load_explicit_inventory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("infra.yaml");
        std::fs::write(&path, INFRA).unwrap();
        let (found, infra) = load_inventory(Some(&path)).unwrap().unwrap();
        assert_eq!(found, path);
        assert_eq!(infra.nodes.len(), 2);
    }
}
