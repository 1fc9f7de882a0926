//! The component abstraction.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use kube::api::DynamicObject;

use crate::config::StackContext;
use crate::helm::HelmRelease;
use crate::objects;

/// A unit of work produced by rendering a component.
#[derive(Debug, Clone)]
pub enum Step {
    /// Server-side apply a single object.
    Apply(Box<DynamicObject>),
    /// `helm upgrade --install`.
    Helm(HelmRelease),
    /// Fetch a multi-document manifest and apply every object in it.
    ApplyUrl(String),
    /// Poll until a StorageClass exists.
    WaitForStorageClass { name: String, timeout: Duration },
}

impl Step {
    /// Wrap a typed object.
    pub fn apply<T: serde::Serialize>(object: &T) -> Result<Self> {
        Ok(Self::Apply(Box::new(objects::to_dynamic(object)?)))
    }

    /// One-line description.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Apply(object) => format!("apply {}", objects::describe(object)),
            Self::Helm(release) => format!(
                "helm {} ({} {}) in {}",
                release.name,
                release.chart,
                release.version.as_deref().unwrap_or("latest"),
                release.namespace
            ),
            Self::ApplyUrl(url) => format!("apply {url}"),
            Self::WaitForStorageClass { name, .. } => format!("wait for StorageClass {name}"),
        }
    }

    /// YAML rendering for dry runs.
    pub fn to_yaml(&self) -> Result<String> {
        match self {
            Self::Apply(object) => {
                serde_yaml::to_string(object.as_ref()).context("failed to render object")
            }
            Self::Helm(release) => {
                serde_yaml::to_string(release).context("failed to render Helm release")
            }
            Self::ApplyUrl(url) => Ok(format!("# remote manifest\n# {url}\n")),
            Self::WaitForStorageClass { name, timeout } => Ok(format!(
                "# wait up to {}s for StorageClass {name}\n",
                timeout.as_secs()
            )),
        }
    }
}

/// Output of [`Component::render`].
#[derive(Debug, Clone, Default)]
pub struct Rendered {
    pub steps: Vec<Step>,
    /// Values reported after deploy (tunnel id, hostname, ...).
    pub outputs: BTreeMap<String, String>,
}

impl Rendered {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a typed object as an apply step.
    pub fn apply<T: serde::Serialize>(&mut self, object: &T) -> Result<&mut Self> {
        self.steps.push(Step::apply(object)?);
        Ok(self)
    }

    pub fn push(&mut self, step: Step) -> &mut Self {
        self.steps.push(step);
        self
    }

    pub fn output(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.outputs.insert(key.to_string(), value.into());
        self
    }
}

/// A deployable piece of the platform.
#[async_trait]
pub trait Component: Send + Sync {
    /// Stable name, used by `--only`.
    fn name(&self) -> &'static str;

    /// Short description for the UI.
    fn description(&self) -> &'static str;

    /// Whether the component should run for this context.
    fn enabled(&self, _ctx: &StackContext) -> bool {
        true
    }

    /// Produce the steps needed to converge the component.
    async fn render(&self, ctx: &StackContext) -> Result<Rendered>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{labels, namespace};

    #[test]
    fn test_step_descriptions() {
        let ns = Step::apply(&namespace("istio-system", labels(&[]))).unwrap();
        assert_eq!(ns.describe(), "apply Namespace istio-system");

        let helm = Step::Helm(
            HelmRelease::new("base", "base", "https://example.com", "istio-system").version("1.28.2"),
        );
        assert_eq!(helm.describe(), "helm base (base 1.28.2) in istio-system");

        let wait = Step::WaitForStorageClass {
            name: "longhorn".into(),
            timeout: Duration::from_secs(300),
        };
        assert_eq!(wait.describe(), "wait for StorageClass longhorn");
        assert!(wait.to_yaml().unwrap().contains("300s"));
    }

    #[test]
    fn test_object_yaml() {
        let ns = Step::apply(&namespace("istio-system", labels(&[]))).unwrap();
        let yaml = ns.to_yaml().unwrap();
        assert!(yaml.contains("kind: Namespace"));
        assert!(yaml.contains("name: istio-system"));
    }
}
