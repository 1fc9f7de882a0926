//! Admin kubeconfig extraction and merging.
//!
//! Kubeconfigs are handled as plain YAML so that fields we don't know about
//! (extensions, exec plugins) survive a round trip untouched.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_yaml::{Mapping, Value};
use tracing::{debug, info};

use super::KUBECONFIG_PATH;
use crate::remote::Remote;

/// Name K3s gives its cluster, user and context.
pub const DEFAULT_NAME: &str = "default";

const SECTIONS: [&str; 3] = ["clusters", "users", "contexts"];

/// `~/.kube/config`.
#[must_use]
pub fn default_kubeconfig_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".kube").join("config"))
}

/// Read the K3s admin kubeconfig and point its server at `node_addr`.
///
/// # Errors
/// Returns an error if the file cannot be read or is not valid YAML.
pub fn extract_kubeconfig<R: Remote + ?Sized>(remote: &mut R, node_addr: &str) -> Result<String> {
    let raw = remote
        .read_file(KUBECONFIG_PATH, true)
        .context("failed to read kubeconfig")?;
    let mut config = parse(&raw)?;

    if let Some(clusters) = config.get_mut("clusters").and_then(Value::as_sequence_mut) {
        for cluster in clusters {
            let Some(server) = cluster
                .get_mut("cluster")
                .and_then(|c| c.get_mut("server"))
            else {
                continue;
            };
            if let Some(url) = server.as_str() {
                let rewritten = url.replacen("127.0.0.1", node_addr, 1);
                debug!(server = %rewritten, "Rewrote kubeconfig server");
                *server = Value::String(rewritten);
            }
        }
    }

    serde_yaml::to_string(&config).context("failed to marshal kubeconfig")
}

/// Rename the K3s `default` cluster, user and context to `name`.
///
/// References from contexts and `current-context` are renamed too.
///
/// # Errors
/// Returns an error if `kubeconfig` is not valid YAML.
pub fn rename_kubeconfig(kubeconfig: &str, name: &str) -> Result<String> {
    let mut config = parse(kubeconfig)?;

    for section in SECTIONS {
        let Some(entries) = config.get_mut(section).and_then(Value::as_sequence_mut) else {
            continue;
        };
        for entry in entries {
            rename_field(entry, "name", name);
            if section == "contexts" {
                if let Some(context) = entry.get_mut("context") {
                    rename_field(context, "cluster", name);
                    rename_field(context, "user", name);
                }
            }
        }
    }
    rename_field(&mut config, "current-context", name);

    serde_yaml::to_string(&config).context("failed to marshal kubeconfig")
}

fn rename_field(value: &mut Value, key: &str, name: &str) {
    if let Some(field) = value.get_mut(key) {
        if field.as_str() == Some(DEFAULT_NAME) {
            *field = Value::String(name.to_string());
        }
    }
}

/// Merge `incoming` into `existing`.
///
/// Clusters, users and contexts are upserted by name; the current context
/// becomes the incoming one. An empty `existing` yields `incoming`.
///
/// # Errors
/// Returns an error if either document is not valid YAML.
pub fn merge_kubeconfig(existing: &str, incoming: &str) -> Result<String> {
    if existing.trim().is_empty() {
        return Ok(incoming.to_string());
    }

    let mut target = parse(existing).context("existing kubeconfig is invalid")?;
    let source = parse(incoming).context("new kubeconfig is invalid")?;

    let Some(target_map) = target.as_mapping_mut() else {
        anyhow::bail!("existing kubeconfig is not a mapping");
    };

    for section in SECTIONS {
        let incoming_entries = source
            .get(section)
            .and_then(Value::as_sequence)
            .cloned()
            .unwrap_or_default();

        let entries = target_map
            .entry(Value::String(section.to_string()))
            .or_insert_with(|| Value::Sequence(Vec::new()));
        if !entries.is_sequence() {
            *entries = Value::Sequence(Vec::new());
        }
        let Some(entries) = entries.as_sequence_mut() else {
            continue;
        };

        for entry in incoming_entries {
            let name = entry.get("name").and_then(Value::as_str).map(str::to_string);
            match entries
                .iter_mut()
                .find(|e| e.get("name").and_then(Value::as_str) == name.as_deref())
            {
                Some(slot) => *slot = entry,
                None => entries.push(entry),
            }
        }
    }

    if let Some(current) = source.get("current-context").cloned() {
        target_map.insert(Value::String("current-context".to_string()), current);
    }

    serde_yaml::to_string(&target).context("failed to marshal merged kubeconfig")
}

/// Write a kubeconfig readable only by the owner, creating parent directories.
///
/// # Errors
/// Returns an error if the directory or file cannot be written.
pub fn write_kubeconfig(kubeconfig: &str, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options
        .open(path)
        .with_context(|| format!("failed to write kubeconfig to {}", path.display()))?;

    // `mode` only applies when the file is created.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    file.write_all(kubeconfig.as_bytes())
        .with_context(|| format!("failed to write kubeconfig to {}", path.display()))?;

    info!(path = %path.display(), "Kubeconfig written successfully");
    Ok(())
}

fn parse(yaml: &str) -> Result<Value> {
    let value: Value = serde_yaml::from_str(yaml).context("failed to parse kubeconfig")?;
    if value.is_null() {
        return Ok(Value::Mapping(Mapping::new()));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::fake::FakeRemote;

    const K3S_YAML: &str = r"apiVersion: v1
clusters:
- cluster:
    certificate-authority-data: LS0tLS1CRUdJTg==
    server: https://127.0.0.1:6443
  name: default
contexts:
- context:
    cluster: default
    user: default
  name: default
current-context: default
kind: Config
preferences: {}
users:
- name: default
  user:
    client-certificate-data: Y2VydA==
    client-key-data: a2V5
";

    #[test]
    fn test_extract_rewrites_server() {
        let mut remote = FakeRemote::new("192.168.1.51").with_file(KUBECONFIG_PATH, K3S_YAML);
        let config = extract_kubeconfig(&mut remote, "192.168.1.51").unwrap();
        assert!(config.contains("server: https://192.168.1.51:6443"));
        assert!(!config.contains("127.0.0.1"));
        assert!(config.contains("client-key-data: a2V5"));
    }

    #[test]
    fn test_extract_missing_file() {
        let mut remote = FakeRemote::new("192.168.1.51");
        assert!(extract_kubeconfig(&mut remote, "192.168.1.51").is_err());
    }

    #[test]
    fn test_rename() {
        let renamed = rename_kubeconfig(K3S_YAML, "homelab").unwrap();
        let value: Value = serde_yaml::from_str(&renamed).unwrap();
        assert_eq!(value["clusters"][0]["name"], "homelab");
        assert_eq!(value["users"][0]["name"], "homelab");
        assert_eq!(value["contexts"][0]["name"], "homelab");
        assert_eq!(value["contexts"][0]["context"]["cluster"], "homelab");
        assert_eq!(value["contexts"][0]["context"]["user"], "homelab");
        assert_eq!(value["current-context"], "homelab");
    }

    #[test]
    fn test_merge_upserts_and_switches_context() {
        let existing = r"apiVersion: v1
kind: Config
clusters:
- name: work
  cluster: {server: https://work.example:6443}
- name: homelab
  cluster: {server: https://old:6443}
contexts:
- name: work
  context: {cluster: work, user: work}
users:
- name: work
  user: {token: abc}
current-context: work
";
        let incoming = rename_kubeconfig(K3S_YAML, "homelab").unwrap();
        let merged = merge_kubeconfig(existing, &incoming).unwrap();
        let value: Value = serde_yaml::from_str(&merged).unwrap();

        let clusters = value["clusters"].as_sequence().unwrap();
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0]["name"], "work");
        assert_eq!(clusters[1]["cluster"]["server"], "https://127.0.0.1:6443");
        assert_eq!(value["users"].as_sequence().unwrap().len(), 2);
        assert_eq!(value["contexts"].as_sequence().unwrap().len(), 2);
        assert_eq!(value["current-context"], "homelab");
    }

    #[test]
    fn test_merge_into_empty() {
        assert_eq!(merge_kubeconfig("", K3S_YAML).unwrap(), K3S_YAML);
    }

    #[test]
    fn test_write_creates_dirs_with_private_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("kubeconfig");
        write_kubeconfig(K3S_YAML, &path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), K3S_YAML);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
