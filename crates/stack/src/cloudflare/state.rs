//! Tunnel identity persisted between deploys.
//!
//! The tunnel secret only exists at creation time, so it is kept next to the
//! tunnel id to rebuild the credentials Secret on later runs.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Clone, Serialize, Deserialize)]
pub struct TunnelState {
    pub account_id: String,
    pub tunnel_id: String,
    pub tunnel_name: String,
    /// Base64 tunnel secret.
    pub secret: String,
    pub updated_at: String,
}

impl std::fmt::Debug for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelState")
            .field("account_id", &self.account_id)
            .field("tunnel_id", &self.tunnel_id)
            .field("tunnel_name", &self.tunnel_name)
            .field("updated_at", &self.updated_at)
            .finish_non_exhaustive()
    }
}

impl TunnelState {
    #[must_use]
    pub fn new(
        account_id: impl Into<String>,
        tunnel_id: impl Into<String>,
        tunnel_name: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            tunnel_id: tunnel_id.into(),
            tunnel_name: tunnel_name.into(),
            secret: secret.into(),
            updated_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Get the state file path.
    #[must_use]
    pub fn state_file(state_dir: &Path) -> PathBuf {
        state_dir.join("cloudflare-tunnel.json")
    }

    /// Load state from `state_dir`, if any.
    pub fn load(state_dir: &Path) -> Result<Option<Self>> {
        let path = Self::state_file(state_dir);
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read tunnel state {}", path.display()))?;
        let state: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse tunnel state {}", path.display()))?;

        info!(tunnel_id = %state.tunnel_id, "Loaded tunnel state");
        Ok(Some(state))
    }

    /// Save state to `state_dir`. The file holds the tunnel secret, so it is
    /// only readable by the owner.
    pub fn save(&mut self, state_dir: &Path) -> Result<()> {
        self.updated_at = chrono::Utc::now().to_rfc3339();

        std::fs::create_dir_all(state_dir).context("Failed to create state directory")?;
        let path = Self::state_file(state_dir);
        let content = serde_json::to_string_pretty(self).context("Failed to serialize state")?;

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(&path)
            .with_context(|| format!("Failed to open tunnel state {}", path.display()))?;

        // `mode` only applies when the file is created.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))
                .context("Failed to restrict tunnel state permissions")?;
        }

        file.write_all(content.as_bytes())
            .context("Failed to write tunnel state")?;
        Ok(())
    }

    /// Whether this state belongs to `account_id`.
    #[must_use]
    pub fn matches_account(&self, account_id: &str) -> bool {
        self.account_id == account_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(TunnelState::load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("nested");
        let mut state = TunnelState::new("acc", "t-1", "homelab-swift-otter", "c2VjcmV0");
        state.save(&state_dir).unwrap();

        let loaded = TunnelState::load(&state_dir).unwrap().unwrap();
        assert_eq!(loaded.tunnel_id, "t-1");
        assert_eq!(loaded.secret, "c2VjcmV0");
        assert!(loaded.matches_account("acc"));
        assert!(!loaded.matches_account("other"));
        assert!(!format!("{loaded:?}").contains("c2VjcmV0"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(TunnelState::state_file(&state_dir))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_save_restricts_existing_file() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = TunnelState::state_file(dir.path());
        std::fs::write(&path, "{}").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        TunnelState::new("acc", "t-2", "homelab-brave-heron", "c2VjcmV0")
            .save(dir.path())
            .unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(TunnelState::load(dir.path()).unwrap().unwrap().tunnel_id, "t-2");
    }

    #[test]
    fn test_corrupt_state_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(TunnelState::state_file(dir.path()), "{").unwrap();
        assert!(TunnelState::load(dir.path()).is_err());
    }
}
