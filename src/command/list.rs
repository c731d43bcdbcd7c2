use anyhow::Result;
use tabled::{
    Table, Tabled,
    settings::{Padding, Style, object::Columns},
};

use crate::command::Context;
use crate::tasks::{TaskManager, TaskSummary};

#[derive(Tabled)]
struct TaskRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "MODE")]
    mode: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "PORT")]
    port: String,
    #[tabled(rename = "RESET")]
    reset: String,
    #[tabled(rename = "CREATED")]
    created: String,
}

impl From<&TaskSummary> for TaskRow {
    fn from(t: &TaskSummary) -> Self {
        Self {
            id: t.task_id.clone(),
            mode: t.mode.map_or_else(|| "-".to_string(), |m| m.to_string()),
            status: t.status.to_string(),
            port: t.web_port.map_or_else(|| "-".to_string(), |p| p.to_string()),
            reset: if t.pending_reset { "●" } else { "-" }.to_string(),
            created: t.created_at.format("%Y-%m-%d %H:%M").to_string(),
        }
    }
}

pub fn run(ctx: &Context, project_id: &str) -> Result<()> {
    let project = ctx.project(project_id)?;
    let git = ctx.git_for(&project);
    let manager = TaskManager::new(&ctx.engine, &git, &ctx.settings);
    let tasks = manager.list(&project)?;

    if tasks.is_empty() {
        println!("No tasks for project {}", project.id);
        return Ok(());
    }

    let rows: Vec<TaskRow> = tasks.iter().map(TaskRow::from).collect();
    let mut table = Table::new(rows);
    table
        .with(Style::blank())
        .modify(Columns::new(0..6), Padding::new(0, 1, 0, 0));

    println!("{table}");
    Ok(())
}
