//! Container engine adapter.
//!
//! The rest of the crate talks to podman/docker only through the
//! [`ContainerEngine`] trait. [`CliEngine`] shells out to the runtime binary;
//! tests use the in-memory fake in `engine::fake`.

mod cli;
#[cfg(test)]
pub mod fake;

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use std::process::Child;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, EngineError};

pub use cli::CliEngine;

/// Container runtime binary. Default: podman
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    #[default]
    Podman,
    Docker,
}

impl Runtime {
    pub fn binary(&self) -> &'static str {
        match self {
            Runtime::Podman => "podman",
            Runtime::Docker => "docker",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

/// SELinux relabel flag on a bind mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relabel {
    None,
    /// `z`: content shared between containers.
    Shared,
    /// `Z`: content private to this container.
    Private,
}

/// A host path bind-mounted into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub access: Access,
    pub relabel: Relabel,
}

impl Mount {
    pub fn new(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            access: Access::ReadWrite,
            relabel: Relabel::None,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.access = Access::ReadOnly;
        self
    }

    pub fn relabel(mut self, relabel: Relabel) -> Self {
        self.relabel = relabel;
        self
    }

    /// Parse `host:container[:opt[,opt]]` where opts are `ro`, `rw`, `z`, `Z`.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidMount {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = spec.splitn(3, ':');
        let host = parts.next().filter(|s| !s.is_empty());
        let container = parts.next().filter(|s| !s.is_empty());
        let (Some(host), Some(container)) = (host, container) else {
            return Err(invalid("expected host:container"));
        };
        if !host.starts_with('/') && !host.starts_with('~') {
            return Err(invalid("host path must be absolute"));
        }
        if !container.starts_with('/') {
            return Err(invalid("container path must be absolute"));
        }

        let host = if host == "~" || host.starts_with("~/") {
            let rest = host.trim_start_matches('~').trim_start_matches('/');
            let home = home::home_dir().ok_or_else(|| invalid("cannot resolve home directory"))?;
            if rest.is_empty() { home } else { home.join(rest) }
        } else if host.starts_with('~') {
            return Err(invalid("only ~/ is expanded, not ~user"));
        } else {
            PathBuf::from(host)
        };

        let mut mount = Mount::new(host, container);
        if let Some(opts) = parts.next() {
            for opt in opts.split(',') {
                match opt {
                    "ro" => mount.access = Access::ReadOnly,
                    "rw" => mount.access = Access::ReadWrite,
                    "z" => mount.relabel = Relabel::Shared,
                    "Z" => mount.relabel = Relabel::Private,
                    other => return Err(invalid(&format!("unknown option '{}'", other))),
                }
            }
        }
        Ok(mount)
    }

    /// Render as the value of a `-v` flag.
    pub fn volume_arg(&self) -> String {
        let mut opts = Vec::new();
        match self.relabel {
            Relabel::Shared => opts.push("z"),
            Relabel::Private => opts.push("Z"),
            Relabel::None => {}
        }
        if self.access == Access::ReadOnly {
            opts.push("ro");
        }
        let base = format!("{}:{}", self.host.display(), self.container);
        if opts.is_empty() {
            base
        } else {
            format!("{}:{}", base, opts.join(","))
        }
    }
}

/// Host port published to a container port on the loopback interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
}

/// Everything needed to create and start a detached, named container.
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    pub mounts: Vec<Mount>,
    pub env: BTreeMap<String, String>,
    pub ports: Vec<PortMapping>,
    pub labels: BTreeMap<String, String>,
    pub gpu: bool,
    pub workdir: Option<String>,
    pub command: Vec<String>,
}

/// One `build` invocation for a single image layer.
#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    pub dockerfile: PathBuf,
    pub context: PathBuf,
    pub tag: String,
    pub build_args: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub no_cache: bool,
    pub pull_always: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Paused,
    Created,
    Exited,
    Other(String),
}

impl ContainerState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "running" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "created" | "configured" | "initialized" => ContainerState::Created,
            "exited" | "stopped" | "dead" => ContainerState::Exited,
            other => ContainerState::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerState::Running => f.write_str("running"),
            ContainerState::Paused => f.write_str("paused"),
            ContainerState::Created => f.write_str("created"),
            ContainerState::Exited => f.write_str("exited"),
            ContainerState::Other(s) => f.write_str(s),
        }
    }
}

/// Live view of a container, queried from the engine and never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRecord {
    pub name: String,
    pub state: ContainerState,
    pub image_id: Option<String>,
    pub exit_code: Option<i32>,
}

impl ContainerRecord {
    pub fn is_running(&self) -> bool {
        self.state == ContainerState::Running
    }
}

/// A followed log stream: one or more byte sources plus the follower process.
///
/// Dropping the value terminates the follower; the container itself is not
/// affected.
pub struct LogFollow {
    pub sources: Vec<Box<dyn Read + Send>>,
    child: Option<Child>,
}

impl LogFollow {
    pub fn new(sources: Vec<Box<dyn Read + Send>>, child: Option<Child>) -> Self {
        Self { sources, child }
    }

    /// Detach the byte sources, keeping the follower alive until `self` drops.
    pub fn take_sources(&mut self) -> Vec<Box<dyn Read + Send>> {
        std::mem::take(&mut self.sources)
    }
}

impl Drop for LogFollow {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Synchronous interface to a container engine.
pub trait ContainerEngine {
    fn name(&self) -> &str;

    fn build(&self, request: &BuildRequest) -> Result<(), EngineError>;

    fn image_exists(&self, image: &str) -> Result<bool, EngineError>;

    /// Local image id for a tag, `None` when the tag does not exist.
    fn image_id(&self, image: &str) -> Result<Option<String>, EngineError>;

    fn image_label(&self, image: &str, key: &str) -> Result<Option<String>, EngineError>;

    /// Create and start a detached container.
    fn run(&self, spec: &RunSpec) -> Result<(), EngineError>;

    /// Start an existing stopped container.
    fn start(&self, name: &str) -> Result<(), EngineError>;

    fn stop(&self, name: &str, timeout: Duration) -> Result<(), EngineError>;

    /// Force-remove a container.
    fn remove(&self, name: &str) -> Result<(), EngineError>;

    /// `None` when no container with this name exists.
    fn inspect(&self, name: &str) -> Result<Option<ContainerRecord>, EngineError>;

    /// All containers whose name starts with `prefix`, in one query.
    fn list(&self, prefix: &str) -> Result<Vec<ContainerRecord>, EngineError>;

    fn exec(&self, name: &str, command: &[String]) -> Result<String, EngineError>;

    /// Stream the container's output. With `since`, output written before
    /// that instant (an earlier run of the same container) is skipped.
    fn follow_logs(
        &self,
        name: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<LogFollow, EngineError>;
}
