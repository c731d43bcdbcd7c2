//! Error taxonomy shared by the lifecycle, sync and build layers.
//!
//! Lower layers return these typed errors; the task manager decides per call
//! site whether a condition is fatal or only a warning.

use std::path::PathBuf;

use thiserror::Error;

use crate::cmd::CmdError;

/// Malformed or missing configuration. Fatal, never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("project file not found: {0}")]
    MissingProject(PathBuf),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error(
        "invalid project id '{0}': must start with a letter or digit, followed by letters, digits, hyphens or underscores"
    )]
    InvalidProjectId(String),

    #[error("unknown security mode '{0}' (expected 'online' or 'gatekeeping')")]
    UnknownSecurityMode(String),

    #[error("invalid mount spec '{spec}': {reason}")]
    InvalidMount { spec: String, reason: String },

    #[error("project '{0}' uses gatekeeping but has no git.upstream_url")]
    MissingUpstream(String),

    #[error("git gate missing for project '{project}' at {path}; run `gatebox gate-sync {project}`")]
    GateMissing { project: String, path: PathBuf },

    #[error("task {task_id} already ran in mode '{existing}', cannot run in '{requested}'")]
    ModeMismatch {
        task_id: String,
        existing: String,
        requested: String,
    },

    #[error("unknown task {task_id} in project '{project}'")]
    UnknownTask { project: String, task_id: String },

    #[error(
        "gate {path} is shared with project '{other}' which has a different upstream ({other_url})"
    )]
    GateConflict {
        path: PathBuf,
        other: String,
        other_url: String,
    },

    #[error("Dockerfiles missing in {0}")]
    MissingDockerfiles(PathBuf),

    #[error("invalid readiness marker '{pattern}': {source}")]
    InvalidMarker {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Failure reported by the container engine. Not retried; task metadata is
/// left untouched so the operation can simply be invoked again.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Command(#[from] CmdError),

    #[error("container {name} is not running after start (state: {state})")]
    ExitedEarly { name: String, state: String },

    #[error("base image {image} for {target} does not exist")]
    MissingBaseImage { image: String, target: String },

    #[error("unexpected engine output: {0}")]
    Parse(String),

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of a git operation while reconciling a workspace or the gate.
#[derive(Debug, Error)]
pub enum GitSyncError {
    #[error("git {operation} failed: {source}")]
    Command {
        operation: &'static str,
        #[source]
        source: CmdError,
    },

    #[error("filesystem error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no upstream URL configured for project '{0}'")]
    NoUpstream(String),

    #[error("workspace {0} has files but no .git; refusing to clone over them")]
    WorkspaceNotEmpty(PathBuf),
}

impl GitSyncError {
    pub fn command(operation: &'static str, source: CmdError) -> Self {
        GitSyncError::Command { operation, source }
    }
}

/// Failure of an image build run.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Errors surfaced by task lifecycle operations.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task {task_id} is not running")]
    NotRunning { task_id: String },

    #[error("task {task_id} is already running")]
    AlreadyRunning { task_id: String },

    #[error("task {task_id} has never been started (no mode set)")]
    NeverStarted { task_id: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    GitSync(#[from] GitSyncError),

    #[error("failed to persist task metadata at {path}: {reason}")]
    Metadata { path: PathBuf, reason: String },

    #[error("filesystem error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no free web port in {first}..{last}")]
    NoFreePort { first: u16, last: u16 },
}

impl TaskError {
    /// State-mismatch conditions are signals, not failures of the system.
    pub fn is_state_mismatch(&self) -> bool {
        matches!(
            self,
            TaskError::NotRunning { .. } | TaskError::AlreadyRunning { .. }
        )
    }
}
