//! Executes rendered steps against a cluster.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::GroupVersionKind;
use kube::discovery::{ApiCapabilities, ApiResource, Discovery, Scope};
use kube::{Client, Config};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::component::Step;
use crate::objects;

/// Field manager recorded on every applied object.
pub const FIELD_MANAGER: &str = "homelab";

/// Annotation marking the cluster default StorageClass.
pub const DEFAULT_CLASS_ANNOTATION: &str = "storageclass.kubernetes.io/is-default-class";

const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Applies steps with server-side apply and the Helm CLI.
pub struct Applier {
    client: Client,
    discovery: Discovery,
    kubeconfig: Option<PathBuf>,
    http: reqwest::Client,
}

impl Applier {
    /// Connect using `path`, or the default kubeconfig resolution when `None`.
    pub async fn from_kubeconfig(path: Option<&Path>) -> Result<Self> {
        let client = match path {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).with_context(|| {
                    format!("Failed to read kubeconfig from {}", path.display())
                })?;
                let config =
                    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                        .await
                        .context("Failed to create Kubernetes config from kubeconfig")?;
                Client::try_from(config).context("Failed to create Kubernetes client")?
            }
            None => Client::try_default()
                .await
                .context("Failed to create Kubernetes client")?,
        };

        let discovery = Discovery::new(client.clone())
            .run()
            .await
            .context("API discovery failed")?;

        Ok(Self {
            client,
            discovery,
            kubeconfig: path.map(Path::to_path_buf),
            http: reqwest::Client::new(),
        })
    }

    /// Run a single step.
    pub async fn execute(&mut self, step: &Step) -> Result<()> {
        match step {
            Step::Apply(object) => self.apply(object).await,
            Step::Helm(release) => {
                release.install(self.kubeconfig.as_deref()).await?;
                // Charts may install CRDs used by later steps.
                self.refresh_discovery().await
            }
            Step::ApplyUrl(url) => {
                let count = self.apply_url(url).await?;
                info!(url = %url, objects = count, "Applied remote manifest");
                self.refresh_discovery().await
            }
            Step::WaitForStorageClass { name, timeout } => {
                let default = self.wait_for_storage_class(name, *timeout).await?;
                info!(storage_class = %name, default, "StorageClass is available");
                Ok(())
            }
        }
    }

    /// Server-side apply one object.
    pub async fn apply(&mut self, object: &DynamicObject) -> Result<()> {
        let description = objects::describe(object);
        let name = object
            .metadata
            .name
            .as_deref()
            .with_context(|| format!("{description} has no name"))?;
        let types = object
            .types
            .as_ref()
            .with_context(|| format!("{description} has no apiVersion/kind"))?;
        let gvk = GroupVersionKind::try_from(types)
            .with_context(|| format!("invalid apiVersion on {description}"))?;

        let (resource, caps) = self.resolve(&gvk).await?;
        let api: Api<DynamicObject> = if caps.scope == Scope::Namespaced {
            let namespace = object.metadata.namespace.as_deref().unwrap_or("default");
            Api::namespaced_with(self.client.clone(), namespace, &resource)
        } else {
            Api::all_with(self.client.clone(), &resource)
        };

        debug!(object = %description, "Applying");
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(object),
        )
        .await
        .with_context(|| format!("failed to apply {description}"))?;
        Ok(())
    }

    async fn resolve(&mut self, gvk: &GroupVersionKind) -> Result<(ApiResource, ApiCapabilities)> {
        if let Some(found) = self.discovery.resolve_gvk(gvk) {
            return Ok(found);
        }
        // The CRD may have been registered since the last discovery run.
        self.refresh_discovery().await?;
        self.discovery
            .resolve_gvk(gvk)
            .with_context(|| format!("cluster does not serve {}/{} {}", gvk.group, gvk.version, gvk.kind))
    }

    async fn refresh_discovery(&mut self) -> Result<()> {
        self.discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .context("API discovery failed")?;
        Ok(())
    }

    /// Fetch a manifest and apply each object in it. Returns the object count.
    pub async fn apply_url(&mut self, url: &str) -> Result<usize> {
        debug!(url = %url, "Fetching manifest");
        let manifest = self
            .http
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .with_context(|| format!("Failed to fetch {url}"))?
            .text()
            .await
            .with_context(|| format!("Failed to read body of {url}"))?;

        let documents = parse_manifest(&manifest)?;
        // CRDs go first so that custom objects in the same file resolve.
        let (crds, rest): (Vec<_>, Vec<_>) = documents.into_iter().partition(|o| {
            o.types
                .as_ref()
                .is_some_and(|t| t.kind == "CustomResourceDefinition")
        });
        let has_crds = !crds.is_empty();
        let count = crds.len() + rest.len();

        for object in &crds {
            self.apply(object).await?;
        }
        if has_crds {
            self.refresh_discovery().await?;
        }
        for object in &rest {
            self.apply(object).await?;
        }
        Ok(count)
    }

    /// Poll until the StorageClass exists. Returns whether it is the default class.
    pub async fn wait_for_storage_class(&self, name: &str, timeout: Duration) -> Result<bool> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        let start = Instant::now();

        loop {
            match api.get_opt(name).await {
                Ok(Some(class)) => return Ok(is_default_class(&class)),
                Ok(None) => debug!(storage_class = %name, "StorageClass not found yet"),
                Err(e) => warn!(storage_class = %name, error = %e, "Failed to get StorageClass"),
            }

            if start.elapsed() >= timeout {
                anyhow::bail!(
                    "StorageClass {name} did not appear within {}s",
                    timeout.as_secs()
                );
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Whether `class` carries the default-class annotation.
#[must_use]
pub fn is_default_class(class: &StorageClass) -> bool {
    class
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(DEFAULT_CLASS_ANNOTATION))
        .is_some_and(|v| v == "true")
}

/// Split a multi-document YAML manifest into objects, skipping empty documents.
pub fn parse_manifest(manifest: &str) -> Result<Vec<DynamicObject>> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(manifest) {
        let value = serde_yaml::Value::deserialize(document).context("invalid YAML document")?;
        if value.is_null() {
            continue;
        }
        let object: DynamicObject =
            serde_yaml::from_value(value).context("document is not a Kubernetes object")?;
        if object.types.is_none() {
            anyhow::bail!("document without apiVersion/kind in manifest");
        }
        objects.push(object);
    }
    Ok(objects)
}
