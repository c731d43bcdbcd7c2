use anyhow::Result;
use console::style;

use crate::command::Context;
use crate::images::{self, BuildOptions, BuildScope};

pub fn run(ctx: &Context, project_id: &str, scope: BuildScope, include_dev: bool) -> Result<()> {
    let project = ctx.project(project_id)?;
    let options = BuildOptions { scope, include_dev };

    let report = images::build(&ctx.engine, &project, options, &mut |step| {
        println!(
            "{} {} {} {}",
            style(format!("[{}]", step.layer)).bold(),
            style(&step.request.tag).cyan(),
            style("from").dim(),
            step.from
        );
    })?;

    if report.promoted {
        println!(
            "{}",
            style("Base layers were missing and have been built as well").yellow()
        );
    }
    println!("✓ Built {} image(s)", report.built.len());
    Ok(())
}
