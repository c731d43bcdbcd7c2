use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::engine::{ContainerRecord, ContainerState};
use crate::readiness::ReadinessOutcome;
use crate::sync::SyncResult;

/// How a task container is driven once it is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TaskMode {
    /// Idle container the operator attaches to.
    Cli,
    /// Agent web UI published on a loopback port.
    Web,
    /// Agent runs unattended; the caller detaches immediately.
    Headless,
}

impl TaskMode {
    pub const ALL: [TaskMode; 3] = [TaskMode::Cli, TaskMode::Web, TaskMode::Headless];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskMode::Cli => "cli",
            TaskMode::Web => "web",
            TaskMode::Headless => "headless",
        }
    }

    fn from_name(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == s)
    }
}

impl fmt::Display for TaskMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{project_id}-{mode}-{task_id}`.
pub fn container_name(project_id: &str, mode: TaskMode, task_id: &str) -> String {
    format!("{}-{}-{}", project_id, mode, task_id)
}

/// Inverse of [`container_name`]. Splits from the right, so project ids
/// containing `-` parse back unambiguously.
pub fn parse_container_name(name: &str) -> Option<(String, TaskMode, String)> {
    let (rest, task_id) = name.rsplit_once('-')?;
    if task_id.is_empty() || !task_id.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let (project_id, mode) = rest.rsplit_once('-')?;
    let mode = TaskMode::from_name(mode)?;
    if project_id.is_empty() {
        return None;
    }
    Some((project_id.to_string(), mode, task_id.to_string()))
}

/// Persisted task metadata, one YAML file per task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub project_id: String,
    pub task_id: String,
    pub workspace: PathBuf,
    /// Unset until the first start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<TaskMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_port: Option<u16>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_state: LastState,
    /// Mirrors the workspace marker file for display.
    #[serde(default)]
    pub pending_reset: bool,
}

impl Task {
    /// Container name for the recorded mode.
    pub fn container_name(&self) -> Option<String> {
        self.mode
            .map(|mode| container_name(&self.project_id, mode, &self.task_id))
    }

    /// Every name a container of this task could have had.
    pub fn all_container_names(&self) -> Vec<String> {
        TaskMode::ALL
            .into_iter()
            .map(|mode| container_name(&self.project_id, mode, &self.task_id))
            .collect()
    }
}

/// Last lifecycle transition this process observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LastState {
    #[default]
    Created,
    Running,
    Stopped,
}

/// Container presence as seen by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    NoContainer,
    Stopped,
    Running,
}

impl TaskPhase {
    pub fn of(container: Option<&ContainerRecord>) -> Self {
        match container {
            None => TaskPhase::NoContainer,
            Some(c) if c.is_running() => TaskPhase::Running,
            Some(_) => TaskPhase::Stopped,
        }
    }
}

/// Status shown to the operator, derived from metadata and the live container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectiveStatus {
    /// Never started.
    Created,
    Running,
    /// Stopped with unknown exit code.
    Stopped,
    Completed,
    Failed,
    /// Started before, but the container is gone.
    NotFound,
}

impl EffectiveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EffectiveStatus::Created => "created",
            EffectiveStatus::Running => "running",
            EffectiveStatus::Stopped => "stopped",
            EffectiveStatus::Completed => "completed",
            EffectiveStatus::Failed => "failed",
            EffectiveStatus::NotFound => "not found",
        }
    }
}

impl fmt::Display for EffectiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn effective_status(task: &Task, container: Option<&ContainerRecord>) -> EffectiveStatus {
    match container {
        Some(c) if c.is_running() => EffectiveStatus::Running,
        Some(c) => match (c.state.clone(), c.exit_code) {
            (ContainerState::Exited, Some(0)) => EffectiveStatus::Completed,
            (ContainerState::Exited, Some(_)) => EffectiveStatus::Failed,
            _ => EffectiveStatus::Stopped,
        },
        None if task.mode.is_none() => EffectiveStatus::Created,
        None => EffectiveStatus::NotFound,
    }
}

/// Per-call knobs for `start`.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub preset: Option<String>,
    /// Agent backend for web mode.
    pub backend: Option<String>,
    /// Prompt handed to a headless agent.
    pub prompt: Option<String>,
    /// Overrides the configured reset mode for this start.
    pub reset_mode: Option<crate::sync::GitResetMode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new container was created.
    Created,
    /// An existing stopped container was started again.
    Resumed,
    /// Nothing to do.
    AlreadyRunning,
}

#[derive(Debug)]
pub struct StartReport {
    pub task_id: String,
    pub container_name: String,
    pub mode: TaskMode,
    pub outcome: StartOutcome,
    /// Present only when a container was created.
    pub sync: Option<SyncResult>,
    pub readiness: Option<ReadinessOutcome>,
    pub web_port: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub task: Task,
    pub container_name: Option<String>,
    pub phase: TaskPhase,
    pub effective_status: EffectiveStatus,
    pub container_state: Option<ContainerState>,
    pub image_id: Option<String>,
    /// `None` when it could not be determined.
    pub image_stale: Option<bool>,
    pub pending_reset: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteReport {
    pub task_id: String,
    pub removed_containers: Vec<String>,
    pub workspace_removed: bool,
    pub metadata_removed: bool,
    pub failures: Vec<String>,
}

impl DeleteReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct TaskSummary {
    pub task_id: String,
    pub mode: Option<TaskMode>,
    pub status: EffectiveStatus,
    pub web_port: Option<u16>,
    pub pending_reset: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(mode: Option<TaskMode>) -> Task {
        Task {
            project_id: "demo".to_string(),
            task_id: "3".to_string(),
            workspace: PathBuf::from("/tmp/ws"),
            mode,
            preset: None,
            backend: None,
            web_port: None,
            created_at: Utc::now(),
            last_state: LastState::Created,
            pending_reset: true,
        }
    }

    fn record(state: ContainerState, exit_code: Option<i32>) -> ContainerRecord {
        ContainerRecord {
            name: "demo-cli-3".to_string(),
            state,
            image_id: None,
            exit_code,
        }
    }

    #[test]
    fn test_container_name_parses_back() {
        for project in ["demo", "my-proj", "a-cli-1", "x_y-web"] {
            for mode in TaskMode::ALL {
                for id in ["1", "42", "1007"] {
                    let name = container_name(project, mode, id);
                    assert_eq!(
                        parse_container_name(&name),
                        Some((project.to_string(), mode, id.to_string())),
                        "{}",
                        name
                    );
                }
            }
        }
    }

    #[test]
    fn test_parse_container_name_rejects_foreign_names() {
        assert_eq!(parse_container_name("demo-cli-abc"), None);
        assert_eq!(parse_container_name("demo-shell-1"), None);
        assert_eq!(parse_container_name("-cli-1"), None);
        assert_eq!(parse_container_name("cli-1"), None);
    }

    #[test]
    fn test_effective_status() {
        let fresh = task(None);
        assert_eq!(effective_status(&fresh, None), EffectiveStatus::Created);

        let started = task(Some(TaskMode::Cli));
        assert_eq!(effective_status(&started, None), EffectiveStatus::NotFound);
        assert_eq!(
            effective_status(&started, Some(&record(ContainerState::Running, None))),
            EffectiveStatus::Running
        );
        assert_eq!(
            effective_status(&started, Some(&record(ContainerState::Exited, Some(0)))),
            EffectiveStatus::Completed
        );
        assert_eq!(
            effective_status(&started, Some(&record(ContainerState::Exited, Some(2)))),
            EffectiveStatus::Failed
        );
        assert_eq!(
            effective_status(&started, Some(&record(ContainerState::Exited, None))),
            EffectiveStatus::Stopped
        );
    }

    #[test]
    fn test_task_yaml_omits_unset_fields() {
        let original = task(None);
        let yaml = serde_yaml::to_string(&original).unwrap();
        assert!(!yaml.contains("mode:"));
        assert!(yaml.contains("pending_reset: true"));
        let back: Task = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, original);
    }
}
