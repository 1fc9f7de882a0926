//! Helm releases, installed with the `helm` CLI.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info};

/// Default `--timeout` for `--wait`.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// A chart installed with `helm upgrade --install`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmRelease {
    pub name: String,
    pub chart: String,
    pub repo: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub namespace: String,
    pub create_namespace: bool,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub values: serde_json::Value,
    pub wait: bool,
    #[serde(skip)]
    pub timeout: Duration,
}

impl HelmRelease {
    pub fn new(name: &str, chart: &str, repo: &str, namespace: &str) -> Self {
        Self {
            name: name.to_string(),
            chart: chart.to_string(),
            repo: repo.to_string(),
            version: None,
            namespace: namespace.to_string(),
            create_namespace: false,
            values: serde_json::Value::Null,
            wait: true,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }

    #[must_use]
    pub fn values(mut self, values: serde_json::Value) -> Self {
        self.values = values;
        self
    }

    #[must_use]
    pub fn create_namespace(mut self) -> Self {
        self.create_namespace = true;
        self
    }

    /// Arguments passed to `helm`.
    #[must_use]
    pub fn args(&self, values_file: Option<&Path>) -> Vec<String> {
        let mut args = vec![
            "upgrade".to_string(),
            "--install".to_string(),
            self.name.clone(),
            self.chart.clone(),
            "--repo".to_string(),
            self.repo.clone(),
        ];
        if let Some(version) = &self.version {
            args.extend(["--version".to_string(), version.clone()]);
        }
        args.extend(["--namespace".to_string(), self.namespace.clone()]);
        if self.create_namespace {
            args.push("--create-namespace".to_string());
        }
        if let Some(path) = values_file {
            args.extend(["-f".to_string(), path.display().to_string()]);
        }
        if self.wait {
            args.extend([
                "--wait".to_string(),
                "--timeout".to_string(),
                format!("{}s", self.timeout.as_secs()),
            ]);
        }
        args
    }

    /// Whether any values were set.
    #[must_use]
    pub fn has_values(&self) -> bool {
        match &self.values {
            serde_json::Value::Null => false,
            serde_json::Value::Object(map) => !map.is_empty(),
            _ => true,
        }
    }

    /// Install or upgrade the release.
    ///
    /// Values are passed through a temporary file that is removed afterwards.
    pub async fn install(&self, kubeconfig: Option<&Path>) -> Result<String> {
        let values_file = if self.has_values() {
            let yaml = serde_yaml::to_string(&self.values)
                .with_context(|| format!("failed to render values for {}", self.name))?;
            let mut file = tempfile::Builder::new()
                .prefix(&format!("homelab-{}-", self.name))
                .suffix(".yaml")
                .tempfile()
                .context("failed to create values file")?;
            file.write_all(yaml.as_bytes())
                .context("failed to write values file")?;
            Some(file)
        } else {
            None
        };

        let args = self.args(values_file.as_ref().map(tempfile::NamedTempFile::path));
        info!(
            release = %self.name,
            chart = %self.chart,
            version = self.version.as_deref().unwrap_or("latest"),
            namespace = %self.namespace,
            "Installing Helm release"
        );
        debug!(args = ?args, "helm");

        let mut command = Command::new("helm");
        if let Some(path) = kubeconfig {
            command.env("KUBECONFIG", path);
        }
        let output = command
            .args(&args)
            .output()
            .await
            .context("Failed to execute helm")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("helm failed for release {}: {}", self.name, stderr.trim());
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}
