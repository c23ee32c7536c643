// `taskdeck snapshot` — fetch the initial board state over HTTP and print it.

use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use tracing::warn;

use taskdeck_sync::hydration::{HttpSnapshotSource, HydrationScope, Reconciler};
use taskdeck_sync::{AppState, ClientConfig, Store};

use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct SnapshotArgs {
    /// Workspace to load (defaults to the configured one).
    #[arg(long)]
    pub workspace: Option<String>,

    /// Workflow whose board should be loaded.
    #[arg(long)]
    pub workflow: Option<String>,

    /// Print the full state instead of a summary.
    #[arg(long)]
    pub full: bool,
}

/// Counts per slice, printed by `snapshot` and on every `watch` update.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BoardSummary {
    pub connection: String,
    pub workspace: Option<String>,
    pub workflow: Option<String>,
    pub workflows: usize,
    pub steps: usize,
    pub tasks: usize,
    pub sessions: usize,
    pub executors: usize,
    pub secrets: usize,
    pub plans: usize,
}

impl BoardSummary {
    pub fn of(state: &AppState) -> Self {
        Self {
            connection: format!("{:?}", state.connection.status).to_lowercase(),
            workspace: state.workspace.active_id.clone(),
            workflow: state.workflows.active_id.clone(),
            workflows: state.workflows.items.len(),
            steps: state.kanban.steps.len(),
            tasks: state.kanban.tasks.items.len(),
            sessions: state.sessions.len(),
            executors: state.executors.items.len(),
            secrets: state.secrets.items.len(),
            plans: state.plans.by_task.values().filter(|plan| plan.is_some()).count(),
        }
    }
}

pub fn format_summary(summary: &BoardSummary) -> String {
    format!(
        "[{}] workspace={} workflow={} workflows={} steps={} tasks={} sessions={} executors={} secrets={} plans={}",
        summary.connection,
        summary.workspace.as_deref().unwrap_or("-"),
        summary.workflow.as_deref().unwrap_or("-"),
        summary.workflows,
        summary.steps,
        summary.tasks,
        summary.sessions,
        summary.executors,
        summary.secrets,
        summary.plans,
    )
}

pub fn scope(config: &ClientConfig, workspace: Option<String>, workflow: Option<String>) -> HydrationScope {
    HydrationScope { workspace_id: workspace.or_else(|| config.workspace_id.clone()), workflow_id: workflow }
}

pub async fn run(args: SnapshotArgs, config: ClientConfig, format: OutputFormat) -> Result<()> {
    let scope = scope(&config, args.workspace, args.workflow);
    let source = HttpSnapshotSource::from_config(&config)?;
    let store = Arc::new(Store::new());
    if scope.workspace_id.is_some() {
        store.switch_workspace(scope.workspace_id.clone());
    }

    let reconciler = Reconciler::new(source, Arc::clone(&store));
    if let Some(report) = reconciler.mount(&scope).await {
        for (slice, error) in &report.failed {
            warn!(slice = slice.as_str(), error = %error, "slice could not be loaded");
        }
    }

    let state = store.snapshot();
    if args.full {
        output::print_output(format, &*state, |state| {
            serde_json::to_string_pretty(state).unwrap_or_else(|error| format!("<unprintable state: {error}>"))
        })?;
    } else {
        output::print_output(format, &BoardSummary::of(&state), format_summary)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_of_empty_state() {
        let summary = BoardSummary::of(&AppState::default());
        assert_eq!(summary.connection, "disconnected");
        assert_eq!(summary.tasks, 0);
        assert_eq!(
            format_summary(&summary),
            "[disconnected] workspace=- workflow=- workflows=0 steps=0 tasks=0 sessions=0 executors=0 secrets=0 plans=0"
        );
    }

    #[test]
    fn scope_falls_back_to_configured_workspace() {
        let config = ClientConfig { workspace_id: Some("ws1".into()), ..ClientConfig::default() };
        let scope = scope(&config, None, Some("w1".into()));
        assert_eq!(scope.workspace_id.as_deref(), Some("ws1"));
        assert_eq!(scope.workflow_id.as_deref(), Some("w1"));

        let scope = super::scope(&config, Some("ws2".into()), None);
        assert_eq!(scope.workspace_id.as_deref(), Some("ws2"));
    }
}
