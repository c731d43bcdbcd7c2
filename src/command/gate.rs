use anyhow::Result;
use console::style;

use crate::command::Context;
use crate::config;
use crate::spinner::with_spinner;
use crate::sync::gate;

pub(super) fn short(sha: Option<&str>) -> String {
    sha.map_or_else(|| "-".to_string(), |s| s.chars().take(12).collect())
}

pub fn sync(ctx: &Context, project_id: &str, force: bool) -> Result<()> {
    let project = ctx.project(project_id)?;
    gate::check_shared_gate(&project, &config::list_projects(&ctx.settings))?;

    let git = ctx.git_for(&project);
    let verb = if force { "Re-cloning" } else { "Syncing" };
    let result = with_spinner(&format!("{verb} gate {}", project.gate_path.display()), || {
        gate::sync_gate(&git, &project, force)
    })?;

    println!(
        "{} {} at {}",
        if result.created { "Created mirror of" } else { "Updated mirror of" },
        result.upstream_url,
        short(result.head.as_deref())
    );
    println!("  gate: {}", result.path.display());
    Ok(())
}

pub fn status(ctx: &Context, project_id: &str) -> Result<()> {
    let project = ctx.project(project_id)?;
    let git = ctx.git_for(&project);
    let staleness = gate::compare_gate_vs_upstream(&git, &project);

    println!("branch:    {}", staleness.branch);
    println!("gate:      {}", short(staleness.gate_head.as_deref()));
    println!("upstream:  {}", short(staleness.upstream_head.as_deref()));
    if let Some(record) = gate::load_record(&project) {
        println!(
            "synced:    {}",
            record.synced_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if let Some(error) = &staleness.error {
        println!("{}", style(format!("error:     {error}")).red());
    } else if staleness.is_stale {
        println!(
            "{}",
            style(format!("Gate is behind upstream; run `gatebox gate-sync {}`", project.id))
                .yellow()
        );
    } else {
        println!("{}", style("Gate is up to date").green());
    }
    Ok(())
}
