//! Host-side mirror of upstream shared by all tasks of a project.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ConfigError, GitSyncError};
use crate::git::GitClient;
use crate::project::Project;

const RECORD_FILE: &str = "gate.yaml";

#[derive(Debug, Clone)]
pub struct GateSyncResult {
    pub path: PathBuf,
    pub upstream_url: String,
    pub created: bool,
    /// Head of the default branch in the mirror after syncing.
    pub head: Option<String>,
}

/// Gate vs upstream comparison. Query failures land in `error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateStaleness {
    pub branch: String,
    pub gate_head: Option<String>,
    pub upstream_head: Option<String>,
    pub is_stale: bool,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Persisted after every successful gate sync.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateRecord {
    pub upstream_url: String,
    pub branch: String,
    pub last_synced_upstream_ref: Option<String>,
    pub synced_at: DateTime<Utc>,
}

fn record_path(project: &Project) -> PathBuf {
    project.state_dir.join(RECORD_FILE)
}

fn path_url(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// The gate as a remote URL (a local path).
pub fn gate_url(project: &Project) -> String {
    path_url(&project.gate_path)
}

pub fn load_record(project: &Project) -> Option<GateRecord> {
    let content = fs::read_to_string(record_path(project)).ok()?;
    serde_yaml::from_str(&content).ok()
}

fn save_record(project: &Project, record: &GateRecord) -> Result<(), GitSyncError> {
    let path = record_path(project);
    let io_err = |source| GitSyncError::Io {
        path: path.clone(),
        source,
    };
    fs::create_dir_all(&project.state_dir).map_err(io_err)?;
    let yaml = serde_yaml::to_string(record)
        .map_err(|e| io_err(std::io::Error::other(e.to_string())))?;
    fs::write(&path, yaml).map_err(io_err)?;
    Ok(())
}

/// `GIT_SSH_COMMAND` restricted to the project's ssh config, when one exists.
pub fn ssh_command(project: &Project) -> Option<String> {
    let dir = project.ssh_host_dir.as_ref()?;
    let config = dir.join("config");
    if !config.is_file() {
        return None;
    }
    let mut cmd = format!(
        "ssh -F {} -o IdentitiesOnly=yes",
        quote(&config)
    );
    let key = dir.join(project.effective_ssh_key_name());
    if key.is_file() {
        cmd.push_str(&format!(
            " -o IdentityFile={}",
            quote(&key)
        ));
    }
    Some(cmd)
}

/// Single-quote a path for the shell that git runs `GIT_SSH_COMMAND` in.
fn quote(path: &Path) -> String {
    let raw = path.to_string_lossy();
    if raw
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./".contains(c))
    {
        raw.into_owned()
    } else {
        format!("'{}'", raw.replace('\'', "'\\''"))
    }
}

/// Refuse to sync a gate that another project mirrors from a different upstream.
pub fn check_shared_gate(project: &Project, others: &[Project]) -> Result<(), ConfigError> {
    for other in others.iter().filter(|o| o.id != project.id) {
        if other.gate_path == project.gate_path && other.upstream_url != project.upstream_url {
            return Err(ConfigError::GateConflict {
                path: project.gate_path.clone(),
                other: other.id.clone(),
                other_url: other.upstream_url.clone().unwrap_or_default(),
            });
        }
    }
    Ok(())
}

/// Create the mirror, or update it in place.
///
/// With `force_reinit` an existing mirror is removed and cloned again.
pub fn sync_gate(
    git: &dyn GitClient,
    project: &Project,
    force_reinit: bool,
) -> Result<GateSyncResult, GitSyncError> {
    let upstream = project
        .upstream_url
        .clone()
        .ok_or_else(|| GitSyncError::NoUpstream(project.id.clone()))?;
    let gate = &project.gate_path;

    if force_reinit && gate.exists() {
        info!(path = %gate.display(), "gate: removing for reinit");
        if let Err(e) = fs::remove_dir_all(gate) {
            warn!(path = %gate.display(), error = %e, "gate: failed to remove");
        }
    }

    let created = if gate.exists() {
        info!(path = %gate.display(), "gate: remote update");
        git.remote_update(gate)?;
        false
    } else {
        if let Some(parent) = gate.parent() {
            fs::create_dir_all(parent).map_err(|source| GitSyncError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        info!(path = %gate.display(), upstream = %upstream, "gate: clone --mirror");
        git.clone_mirror(&upstream, gate)?;
        true
    };

    let head = git
        .ls_remote_head(&gate_url(project), &project.default_branch)
        .unwrap_or_else(|e| {
            warn!(error = %e, "gate: could not read head");
            None
        });

    save_record(
        project,
        &GateRecord {
            upstream_url: upstream.clone(),
            branch: project.default_branch.clone(),
            last_synced_upstream_ref: head.clone(),
            synced_at: Utc::now(),
        },
    )?;

    Ok(GateSyncResult {
        path: gate.clone(),
        upstream_url: upstream,
        created,
        head,
    })
}

/// Compare the gate's branch head with upstream's via `ls-remote` on both sides.
pub fn compare_gate_vs_upstream(git: &dyn GitClient, project: &Project) -> GateStaleness {
    let branch = project.default_branch.clone();
    let mut result = GateStaleness {
        branch: branch.clone(),
        gate_head: None,
        upstream_head: None,
        is_stale: false,
        error: None,
        checked_at: Utc::now(),
    };

    if !project.gate_path.exists() {
        result.error = Some("gate not initialized".to_string());
        return result;
    }
    match git.ls_remote_head(&gate_url(project), &branch) {
        Ok(head) => result.gate_head = head,
        Err(e) => {
            result.error = Some(format!("could not read gate: {}", e));
            return result;
        }
    }

    let Some(upstream) = project.upstream_url.as_deref() else {
        result.error = Some("no upstream configured".to_string());
        return result;
    };
    match git.ls_remote_head(upstream, &branch) {
        Ok(Some(head)) => {
            result.is_stale = result.gate_head.as_deref() != Some(head.as_str());
            result.upstream_head = Some(head);
        }
        Ok(None) => result.error = Some(format!("branch {} not found upstream", branch)),
        Err(e) => result.error = Some(format!("could not reach upstream: {}", e)),
    }
    result
}
