//! Resolved, immutable project definition.
//!
//! Built once per invocation by [`crate::config::load_project`] and threaded
//! explicitly through every lifecycle, sync and build call.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::engine::Mount;
use crate::error::ConfigError;

/// Trust model governing what a task sandbox may reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    /// The sandbox may reach upstream directly; the gate is only a cache.
    Online,
    /// The sandbox may only reach the host-local gate mirror.
    Gatekeeping,
}

impl SecurityMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityMode::Online => "online",
            SecurityMode::Gatekeeping => "gatekeeping",
        }
    }
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "online" => Ok(SecurityMode::Online),
            "gatekeeping" => Ok(SecurityMode::Gatekeeping),
            other => Err(ConfigError::UnknownSecurityMode(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Project {
    pub id: String,
    pub security_mode: SecurityMode,
    pub upstream_url: Option<String>,
    pub default_branch: String,
    pub ssh_key_name: Option<String>,
    pub gpu_enabled: bool,
    pub base_image: String,

    /// Parent directory of all task workspaces.
    pub tasks_root: PathBuf,
    /// Bare mirror clone of upstream.
    pub gate_path: PathBuf,
    /// Directory holding the rendered Dockerfiles.
    pub build_dir: PathBuf,
    /// Per-project state (task metadata, gate record).
    pub state_dir: PathBuf,

    pub ssh_host_dir: Option<PathBuf>,
    pub ssh_mount_in_online: bool,
    pub ssh_mount_in_gatekeeping: bool,
    pub expose_external_remote: bool,
    pub human_name: String,
    pub human_email: String,
    pub shutdown_timeout_secs: u64,
    pub default_agent: Option<String>,
    pub extra_mounts: Vec<Mount>,
}

impl Project {
    pub fn is_gatekeeping(&self) -> bool {
        self.security_mode == SecurityMode::Gatekeeping
    }

    /// Directory containing one YAML metadata file per task.
    pub fn tasks_meta_dir(&self) -> PathBuf {
        self.state_dir.join("tasks")
    }

    /// Host directory of a task (workspace lives inside it).
    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.tasks_root.join(task_id)
    }

    pub fn workspace_dir(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join("workspace")
    }

    /// Whether the SSH directory should be mounted for this security mode.
    pub fn mounts_ssh(&self) -> bool {
        match self.security_mode {
            SecurityMode::Online => self.ssh_mount_in_online,
            SecurityMode::Gatekeeping => self.ssh_mount_in_gatekeeping,
        }
    }

    /// SSH key file name, derived from the project id when not configured.
    pub fn effective_ssh_key_name(&self) -> String {
        self.ssh_key_name
            .clone()
            .unwrap_or_else(|| format!("id_ed25519_{}", self.id))
    }
}

/// Check that a project id is safe as a directory name and container name prefix.
pub fn validate_project_id(id: &str) -> Result<(), ConfigError> {
    let mut chars = id.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidProjectId(id.to_string()))
    }
}
