use std::time::Duration;

use anyhow::{Result, bail};
use console::style;

use crate::command::Context;
use crate::command::gate::short;
use crate::error::TaskError;
use crate::readiness::ReadyVia;
use crate::sync::SyncAction;
use crate::sync::gate::GateStaleness;
use crate::tasks::{
    EffectiveStatus, StartOptions, StartOutcome, StartReport, TaskManager, TaskMode, TaskPhase,
};

fn print_log_line(line: &str) {
    println!("  {}", style(line).dim());
}

/// `NotRunning` and `AlreadyRunning` are reported and leave the exit code at 0.
fn settle<T>(result: Result<T, TaskError>) -> Result<Option<T>, TaskError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_state_mismatch() => {
            println!("{}", style(err.to_string()).yellow());
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

fn phase_label(phase: TaskPhase) -> &'static str {
    match phase {
        TaskPhase::NoContainer => "no container",
        TaskPhase::Stopped => "stopped",
        TaskPhase::Running => "running",
    }
}

fn gate_line(staleness: &GateStaleness) -> String {
    if let Some(error) = &staleness.error {
        return format!("gate check failed: {error}");
    }
    let mut line = format!(
        "gate {} at {}, upstream at {}",
        staleness.branch,
        short(staleness.gate_head.as_deref()),
        short(staleness.upstream_head.as_deref())
    );
    if staleness.is_stale {
        line.push_str(" (behind)");
    }
    line
}

fn print_start_report(report: &StartReport) {
    if let Some(sync) = &report.sync {
        let action = match &sync.action {
            SyncAction::Cloned { branch } => format!("cloned {branch} from {}", sync.from),
            SyncAction::MarkerReset { branch } => {
                format!("reset to {}/{branch} (new task)", sync.from)
            }
            SyncAction::Fetched { reset } => format!("fetched from {} (reset: {reset:?})", sync.from),
        };
        println!("Workspace {action}");
        if let Some(staleness) = &sync.gate_staleness {
            println!("  {}", style(gate_line(staleness)).dim());
        }
        for warning in &sync.warnings {
            println!("{}", style(format!("warning: {warning}")).yellow());
        }
    }

    match report.outcome {
        StartOutcome::AlreadyRunning => {
            println!("Task {} already running ({})", report.task_id, report.container_name);
        }
        StartOutcome::Resumed => {
            println!("✓ Resumed {}", style(&report.container_name).cyan());
        }
        StartOutcome::Created => {
            println!("✓ Started {}", style(&report.container_name).cyan());
        }
    }

    if let Some(readiness) = &report.readiness {
        let secs = readiness.elapsed.as_secs();
        if readiness.is_ready() {
            println!("  ready after {secs}s");
        } else if readiness.ready_via == ReadyVia::Timeout {
            println!(
                "{}",
                style(format!("  no ready marker after {secs}s; the container keeps running"))
                    .yellow()
            );
        } else {
            println!(
                "{}",
                style("  log stream ended before the ready marker").yellow()
            );
        }
    }

    if let Some(port) = report.web_port {
        println!("  web UI: http://127.0.0.1:{port}");
    }
    if report.mode == TaskMode::Headless && report.outcome == StartOutcome::Created {
        println!("  agent running detached in {}", report.container_name);
    }
}

pub fn new(ctx: &Context, project_id: &str) -> Result<()> {
    let project = ctx.project(project_id)?;
    let git = ctx.git_for(&project);
    let manager = TaskManager::new(&ctx.engine, &git, &ctx.settings);
    let task = manager.create_task(&project)?;
    println!(
        "✓ Created task {} in {}",
        style(&task.task_id).cyan(),
        task.workspace.display()
    );
    Ok(())
}

pub fn start(
    ctx: &Context,
    project_id: &str,
    task_id: &str,
    mode: TaskMode,
    options: StartOptions,
) -> Result<()> {
    let project = ctx.project(project_id)?;
    let git = ctx.git_for(&project);
    let manager = TaskManager::new(&ctx.engine, &git, &ctx.settings);
    let report = settle(manager.start(&project, task_id, mode, &options, &mut |line| {
        print_log_line(line)
    }))?;
    if let Some(report) = report {
        print_start_report(&report);
    }
    Ok(())
}

pub fn stop(ctx: &Context, project_id: &str, task_id: &str, timeout: Option<u64>) -> Result<()> {
    let project = ctx.project(project_id)?;
    let git = ctx.git_for(&project);
    let manager = TaskManager::new(&ctx.engine, &git, &ctx.settings);
    if settle(manager.stop(&project, task_id, timeout.map(Duration::from_secs)))?.is_some() {
        println!("✓ Stopped task {task_id}");
    }
    Ok(())
}

pub fn restart(ctx: &Context, project_id: &str, task_id: &str) -> Result<()> {
    let project = ctx.project(project_id)?;
    let git = ctx.git_for(&project);
    let manager = TaskManager::new(&ctx.engine, &git, &ctx.settings);
    let report = manager.restart(&project, task_id, &mut |line| print_log_line(line))?;
    print_start_report(&report);
    Ok(())
}

pub fn delete(ctx: &Context, project_id: &str, task_id: &str) -> Result<()> {
    let project = ctx.project(project_id)?;
    let git = ctx.git_for(&project);
    let manager = TaskManager::new(&ctx.engine, &git, &ctx.settings);
    let report = manager.delete(&project, task_id)?;
    let task_id = &report.task_id;

    for name in &report.removed_containers {
        println!("  removed container {name}");
    }
    if report.workspace_removed {
        println!("  removed workspace");
    }
    if report.is_clean() {
        println!("✓ Deleted task {task_id}");
        return Ok(());
    }
    for failure in &report.failures {
        eprintln!("{}", style(format!("  {failure}")).red());
    }
    bail!(
        "task {task_id} partially deleted ({} step(s) failed)",
        report.failures.len()
    )
}

pub fn status(ctx: &Context, project_id: &str, task_id: &str) -> Result<()> {
    let project = ctx.project(project_id)?;
    let git = ctx.git_for(&project);
    let manager = TaskManager::new(&ctx.engine, &git, &ctx.settings);
    let report = manager.status(&project, task_id)?;

    let or_dash = |v: Option<String>| v.unwrap_or_else(|| "-".to_string());
    println!("task:       {}/{}", project.id, report.task.task_id);
    println!("workspace:  {}", report.task.workspace.display());
    println!(
        "mode:       {}",
        or_dash(report.task.mode.map(|m| m.to_string()))
    );
    let status = match report.effective_status {
        EffectiveStatus::Running | EffectiveStatus::Completed => {
            style(report.effective_status.to_string()).green()
        }
        EffectiveStatus::Failed | EffectiveStatus::NotFound => {
            style(report.effective_status.to_string()).red()
        }
        EffectiveStatus::Created | EffectiveStatus::Stopped => {
            style(report.effective_status.to_string())
        }
    };
    println!("status:     {status}");
    println!("phase:      {}", phase_label(report.phase));
    println!("container:  {}", or_dash(report.container_name.clone()));
    println!(
        "state:      {}",
        or_dash(report.container_state.as_ref().map(|s| s.to_string()))
    );
    println!("image:      {}", or_dash(report.image_id.clone()));
    let stale = match report.image_stale {
        Some(true) => style("stale, rebuild or recreate the container".to_string()).yellow(),
        Some(false) => style("current".to_string()),
        None => style("unknown".to_string()).dim(),
    };
    println!("image age:  {stale}");
    if let Some(port) = report.task.web_port {
        println!("web:        http://127.0.0.1:{port}");
    }
    if report.pending_reset {
        println!(
            "{}",
            style("pending:    workspace will be reset to the latest branch on next start")
                .yellow()
        );
    }
    Ok(())
}

pub fn exec(ctx: &Context, project_id: &str, task_id: &str, command: &[String]) -> Result<()> {
    let project = ctx.project(project_id)?;
    let git = ctx.git_for(&project);
    let manager = TaskManager::new(&ctx.engine, &git, &ctx.settings);
    let output = manager.exec(&project, task_id, command)?;
    print!("{output}");
    Ok(())
}
