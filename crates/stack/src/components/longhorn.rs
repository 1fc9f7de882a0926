//! Longhorn distributed block storage, enrolled in the ambient mesh.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::component::{Component, Rendered, Step};
use crate::config::StackContext;
use crate::helm::HelmRelease;
use crate::objects::{labels, namespace};

pub const NAMESPACE: &str = "longhorn-system";
pub const REPO: &str = "https://charts.longhorn.io";
pub const STORAGE_CLASS: &str = "longhorn";

const AMBIENT_LABEL: (&str, &str) = ("istio.io/dataplane-mode", "ambient");
const STORAGE_CLASS_TIMEOUT: Duration = Duration::from_secs(300);

pub struct Longhorn;

#[async_trait]
impl Component for Longhorn {
    fn name(&self) -> &'static str {
        "longhorn"
    }

    fn description(&self) -> &'static str {
        "Longhorn distributed storage"
    }

    async fn render(&self, ctx: &StackContext) -> Result<Rendered> {
        let version = ctx
            .stack
            .longhorn
            .version
            .as_deref()
            .filter(|v| !v.is_empty())
            .context("stack.longhorn.version is required")?;

        // Chart defaults only.
        let chart = HelmRelease::new("longhorn", "longhorn", REPO, NAMESPACE).version(version);

        let mut rendered = Rendered::new();
        rendered.apply(&namespace(NAMESPACE, labels(&[AMBIENT_LABEL])))?;
        rendered
            .push(Step::Helm(chart))
            .push(Step::WaitForStorageClass {
                name: STORAGE_CLASS.to_string(),
                timeout: STORAGE_CLASS_TIMEOUT,
            })
            .output("namespace", NAMESPACE)
            .output("defaultStorageClass", STORAGE_CLASS);
        Ok(rendered)
    }
}
