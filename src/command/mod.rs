pub mod build;
pub mod gate;
pub mod list;
pub mod task;

use anyhow::{Result, bail};

use crate::config::{self, Settings};
use crate::engine::CliEngine;
use crate::git::CliGit;
use crate::project::Project;
use crate::sync::gate::ssh_command;

/// Everything a command needs: resolved settings and the container runtime.
pub struct Context {
    pub settings: Settings,
    pub engine: CliEngine,
}

impl Context {
    pub fn load() -> Result<Self> {
        let settings = Settings::load()?;
        let engine = CliEngine::new(settings.runtime);
        if !engine.is_available() {
            bail!(
                "container runtime '{}' not found on PATH",
                settings.runtime.binary()
            );
        }
        Ok(Self { settings, engine })
    }

    pub fn project(&self, id: &str) -> Result<Project> {
        Ok(config::load_project(&self.settings, id)?)
    }

    /// Git client carrying the project's ssh configuration.
    pub fn git_for(&self, project: &Project) -> CliGit {
        CliGit::new(self.settings.network_timeout).with_ssh_command(ssh_command(project))
    }
}
