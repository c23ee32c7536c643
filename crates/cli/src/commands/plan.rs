// `taskdeck plan` — read or edit a task's plan over the sync socket.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;

use taskdeck_common::types::Plan;
use taskdeck_sync::hydration::HydrationScope;
use taskdeck_sync::rpc::plans::PlanDraft;
use taskdeck_sync::{ClientConfig, SyncClient};

use super::wait_connected;
use crate::output::{self, OutputFormat};

#[derive(Debug, Subcommand)]
pub enum PlanCommand {
    /// Show the plan for a task
    Get(TaskArg),
    /// Create a plan for a task
    Create(PlanEdit),
    /// Replace a task's plan
    Update(PlanEdit),
    /// Delete a task's plan
    Delete(TaskArg),
}

#[derive(Debug, Args)]
pub struct TaskArg {
    /// Task ID.
    pub task_id: String,
}

#[derive(Debug, Args)]
pub struct PlanEdit {
    /// Task ID.
    pub task_id: String,

    #[arg(long)]
    pub title: Option<String>,

    /// Plan body (markdown).
    #[arg(long)]
    pub content: String,
}

impl PlanEdit {
    fn draft(&self) -> PlanDraft {
        PlanDraft { title: self.title.clone(), content: self.content.clone() }
    }
}

#[derive(Debug, Serialize)]
struct PlanResult {
    task_id: String,
    plan: Option<Plan>,
}

#[derive(Debug, Serialize)]
struct DeleteResult {
    task_id: String,
    deleted: bool,
}

pub async fn run(command: PlanCommand, config: ClientConfig, format: OutputFormat) -> Result<()> {
    let client = SyncClient::from_config(config)?;
    let session = client.start(HydrationScope::default())?;
    let outcome = async {
        wait_connected(client.store()).await?;
        execute(&client, command, format).await
    }
    .await;
    session.close().await;
    outcome
}

async fn execute(client: &SyncClient, command: PlanCommand, format: OutputFormat) -> Result<()> {
    match command {
        PlanCommand::Get(TaskArg { task_id }) => {
            let plan = client.get_task_plan(&task_id).await.context("failed to fetch plan")?;
            print_plan(format, task_id, plan)
        }
        PlanCommand::Create(edit) => {
            let plan =
                client.create_task_plan(&edit.task_id, &edit.draft()).await.context("failed to create plan")?;
            print_plan(format, edit.task_id, plan)
        }
        PlanCommand::Update(edit) => {
            let plan =
                client.update_task_plan(&edit.task_id, &edit.draft()).await.context("failed to update plan")?;
            print_plan(format, edit.task_id, plan)
        }
        PlanCommand::Delete(TaskArg { task_id }) => {
            client.delete_task_plan(&task_id).await.context("failed to delete plan")?;
            let result = DeleteResult { task_id, deleted: true };
            output::print_output(format, &result, |r| format!("Deleted plan for {}", r.task_id))?;
            Ok(())
        }
    }
}

fn print_plan(format: OutputFormat, task_id: String, plan: Option<Plan>) -> Result<()> {
    output::print_output(format, &PlanResult { task_id, plan }, format_human)?;
    Ok(())
}

fn format_human(result: &PlanResult) -> String {
    match &result.plan {
        None => format!("Task {} has no plan.", result.task_id),
        Some(plan) => {
            let title = plan.title.as_deref().unwrap_or("(untitled)");
            format!("{title}\n\n{}", plan.content.trim_end())
        }
    }
}
