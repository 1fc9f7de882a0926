//! Runs components in order: select, render, then execute or print.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::apply::Applier;
use crate::component::{Component, Rendered, Step};
use crate::config::StackContext;

/// Something that can carry out a [`Step`].
#[async_trait]
pub trait Executor: Send {
    async fn execute(&mut self, step: &Step) -> Result<()>;
}

#[async_trait]
impl Executor for Applier {
    async fn execute(&mut self, step: &Step) -> Result<()> {
        Applier::execute(self, step).await
    }
}

/// Progress notifications for the UI.
#[derive(Debug)]
pub enum Progress<'a> {
    Component { name: &'a str, description: &'a str },
    Skipped { name: &'a str },
    Step { name: &'a str, step: &'a Step },
    Done { name: &'a str, outputs: &'a BTreeMap<String, String> },
}

/// A component's rendered steps.
#[derive(Debug)]
pub struct Plan {
    pub name: &'static str,
    pub rendered: Rendered,
}

/// Keep only the components named in `only`, preserving deploy order.
/// An empty list keeps everything.
pub fn select(
    components: Vec<Box<dyn Component>>,
    only: &[String],
) -> Result<Vec<Box<dyn Component>>> {
    if only.is_empty() {
        return Ok(components);
    }

    let known: Vec<&str> = components.iter().map(|c| c.name()).collect();
    if let Some(unknown) = only.iter().find(|n| !known.contains(&n.as_str())) {
        anyhow::bail!(
            "unknown component '{unknown}' (expected one of: {})",
            known.join(", ")
        );
    }

    Ok(components
        .into_iter()
        .filter(|c| only.iter().any(|n| n == c.name()))
        .collect())
}

/// Render every enabled component.
pub async fn plan(ctx: &StackContext, components: &[Box<dyn Component>]) -> Result<Vec<Plan>> {
    let mut plans = Vec::with_capacity(components.len());
    for component in components {
        if !component.enabled(ctx) {
            info!(component = component.name(), "Skipping disabled component");
            continue;
        }
        let rendered = component
            .render(ctx)
            .await
            .with_context(|| format!("failed to render {}", component.name()))?;
        plans.push(Plan {
            name: component.name(),
            rendered,
        });
    }
    Ok(plans)
}

/// Multi-document YAML of every step, for dry runs.
pub fn to_yaml(plans: &[Plan]) -> Result<String> {
    let mut out = String::new();
    for plan in plans {
        for step in &plan.rendered.steps {
            out.push_str("---\n");
            out.push_str(&format!("# {}: {}\n", plan.name, step.describe()));
            out.push_str(&step.to_yaml()?);
        }
    }
    Ok(out)
}

/// Render and execute components one at a time. Returns outputs per component.
///
/// Each component renders right before it runs so that it sees the effects
/// of the ones before it.
pub async fn deploy<E, F>(
    ctx: &StackContext,
    executor: &mut E,
    components: &[Box<dyn Component>],
    mut on_progress: F,
) -> Result<BTreeMap<&'static str, BTreeMap<String, String>>>
where
    E: Executor + ?Sized,
    F: FnMut(Progress<'_>),
{
    let mut outputs = BTreeMap::new();

    for component in components {
        let name = component.name();
        if !component.enabled(ctx) {
            on_progress(Progress::Skipped { name });
            continue;
        }
        on_progress(Progress::Component {
            name,
            description: component.description(),
        });

        let rendered = component
            .render(ctx)
            .await
            .with_context(|| format!("failed to render {name}"))?;

        for step in &rendered.steps {
            on_progress(Progress::Step { name, step });
            if let Err(e) = executor.execute(step).await {
                warn!(component = name, step = %step.describe(), error = %e, "Step failed");
                return Err(e.context(format!("{name}: {}", step.describe())));
            }
        }

        info!(component = name, steps = rendered.steps.len(), "Component deployed");
        on_progress(Progress::Done {
            name,
            outputs: &rendered.outputs,
        });
        outputs.insert(name, rendered.outputs);
    }

    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components;
    use crate::config::{CloudflareConfig, TunnelConfig};

    #[derive(Default)]
    struct Recorder {
        steps: Vec<String>,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl Executor for Recorder {
        async fn execute(&mut self, step: &Step) -> Result<()> {
            let description = step.describe();
            if self.fail_on.as_deref().is_some_and(|f| description.contains(f)) {
                anyhow::bail!("boom");
            }
            self.steps.push(description);
            Ok(())
        }
    }

    fn names(components: &[Box<dyn Component>]) -> Vec<&'static str> {
        components.iter().map(|c| c.name()).collect()
    }

    fn context() -> StackContext {
        let mut ctx = StackContext::for_vip("10.0.0.1");
        ctx.stack.longhorn.version = Some("1.8.1".into());
        ctx
    }

    #[test]
    fn test_select_keeps_deploy_order() {
        let only = vec!["longhorn".to_string(), "kube-vip".to_string()];
        let selected = select(components::all(), &only).unwrap();
        assert_eq!(names(&selected), vec!["kube-vip", "longhorn"]);
    }

    #[test]
    fn test_select_all_when_empty() {
        assert_eq!(select(components::all(), &[]).unwrap().len(), 7);
    }

    #[test]
    fn test_select_unknown() {
        let err = select(components::all(), &["traefik".to_string()]).err().unwrap();
        assert!(err.to_string().contains("unknown component 'traefik'"));
    }

    #[tokio::test]
    async fn test_plan_skips_disabled_tunnel() {
        let ctx = context();
        let plans = plan(&ctx, &components::all()).await.unwrap();
        let names: Vec<_> = plans.iter().map(|p| p.name).collect();
        assert!(!names.contains(&"cloudflare-tunnel"));
        assert_eq!(names.len(), 6);

        let yaml = to_yaml(&plans).unwrap();
        assert!(yaml.contains("# kube-vip: apply DaemonSet kube-system/kube-vip"));
        assert!(yaml.contains("kind: Gateway"));
    }

    #[tokio::test]
    async fn test_deploy_runs_steps_in_order() {
        // Dry-run keeps the tunnel component off the Cloudflare API.
        let mut ctx = context().with_dry_run(true);
        let dir = tempfile::tempdir().unwrap();
        ctx.state_dir = dir.path().to_path_buf();
        ctx.stack.cloudflare = Some(CloudflareConfig {
            account_id: "acc".into(),
            api_token: "tok".into(),
            tunnel: TunnelConfig {
                domain: "example.com".into(),
                ..TunnelConfig::default()
            },
        });

        let mut recorder = Recorder::default();
        let mut events = Vec::new();
        let outputs = deploy(&ctx, &mut recorder, &components::all(), |p| {
            if let Progress::Done { name, .. } = p {
                events.push(name.to_string());
            }
        })
        .await
        .unwrap();

        assert_eq!(recorder.steps[0], "apply ServiceAccount kube-system/kube-vip");
        assert_eq!(
            recorder.steps.last().unwrap(),
            "apply Deployment cloudflare-tunnel/cloudflared"
        );
        assert_eq!(events.len(), 7);
        assert_eq!(outputs["longhorn"]["defaultStorageClass"], "longhorn");
        assert_eq!(outputs["cloudflare-tunnel"]["tunnelId"], "<tunnel-id>");
    }

    #[tokio::test]
    async fn test_deploy_stops_at_first_failure() {
        let ctx = context();
        let mut recorder = Recorder {
            fail_on: Some("istiod".into()),
            ..Recorder::default()
        };
        let err = deploy(&ctx, &mut recorder, &components::all(), |_| {})
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("istio: helm istiod"));
        assert!(!recorder.steps.iter().any(|s| s.contains("ztunnel")));
    }
}
