use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use homelab_metal::k3s::Installer;
use tracing::info;

use super::{connect, Globals};
use crate::config::ConnectionArgs;
use crate::ui;

/// Extract the cluster join token from a K3s server.
#[derive(Args, Debug)]
pub struct ClusterTokenCommand {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Path to write the cluster token.
    #[arg(long, value_name = "PATH", default_value = "./cluster-token")]
    output: PathBuf,
}

impl ClusterTokenCommand {
    pub fn run(&self, globals: &Globals) -> Result<()> {
        let infra = globals.inventory()?;
        let (target, mut client) = connect(&self.connection, infra.as_ref())?;

        info!(node = %target.display(), "Extracting cluster token");
        let token = Installer::new(&mut client, Vec::new()).cluster_token()?;
        client.close()?;

        write_token(&token, &self.output)?;
        ui::print_success(&format!("Cluster token saved to: {}", self.output.display()));
        Ok(())
    }
}

/// Write the token readable only by the owner.
fn write_token(token: &str, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
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
        .with_context(|| format!("Failed to write {}", path.display()))?;

    // An existing file keeps its mode on open.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }

    writeln!(file, "{token}").with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets/cluster-token");
        write_token("K10abc::server:xyz", &path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "K10abc::server:xyz\n");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_write_token_tightens_existing_file() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster-token");
        std::fs::write(&path, "old token that is longer\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        write_token("K10new", &path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "K10new\n");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
