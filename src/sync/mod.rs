//! Workspace reconciliation against the upstream / gate / workspace topology.
//!
//! A workspace is in one of three situations when a task container is about
//! to be created:
//!
//! 1. No `.git`: fresh clone, seeded from the gate when one is usable.
//! 2. `.git` plus the new-task marker: hard reset to the latest remote head,
//!    then the marker is cleared. A failed reset leaves the marker in place
//!    so the next start retries.
//! 3. `.git` without marker: resumed task. Fetch only; local work is never
//!    discarded unless the operator opted into a reset mode.
//!
//! In gatekeeping mode `origin` is pointed back at the gate before any other
//! git operation on every sync.

pub mod gate;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ConfigError, GitSyncError, TaskError};
use crate::git::{GitClient, ResetKind};
use crate::project::Project;

pub use gate::GateStaleness;

pub const MARKER_FILE: &str = ".new-task-marker";
const EXTERNAL_REMOTE: &str = "external";

const MARKER_TEXT: &str = "\
# Reset this workspace to the latest remote head on the next start.
# Removed automatically once the reset succeeds.
";

/// What a resumed (marker-less) sync does after fetching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum GitResetMode {
    /// Fetch only.
    #[default]
    None,
    /// Move HEAD to `origin/<branch>`, keeping index and working tree.
    Soft,
    /// Discard local changes and match `origin/<branch>`.
    Hard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSource {
    Gate,
    Upstream,
}

impl fmt::Display for SyncSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncSource::Gate => f.write_str("gate"),
            SyncSource::Upstream => f.write_str("upstream"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    Cloned { branch: String },
    MarkerReset { branch: String },
    Fetched { reset: GitResetMode },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    pub reset_mode: GitResetMode,
}

#[derive(Debug, Clone)]
pub struct SyncResult {
    pub from: SyncSource,
    pub action: SyncAction,
    pub warnings: Vec<String>,
    pub gate_staleness: Option<GateStaleness>,
}

pub fn marker_path(workspace: &Path) -> PathBuf {
    workspace.join(MARKER_FILE)
}

pub fn has_marker(workspace: &Path) -> bool {
    marker_path(workspace).is_file()
}

pub fn write_marker(workspace: &Path) -> std::io::Result<()> {
    fs::write(marker_path(workspace), MARKER_TEXT)
}

fn clear_marker(workspace: &Path) -> Result<(), GitSyncError> {
    let path = marker_path(workspace);
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(GitSyncError::Io { path, source }),
    }
}

/// Reconciles one task workspace. Holds no state besides the git seam.
pub struct Synchronizer<'a> {
    git: &'a dyn GitClient,
}

impl<'a> Synchronizer<'a> {
    pub fn new(git: &'a dyn GitClient) -> Self {
        Self { git }
    }

    pub fn sync(
        &self,
        project: &Project,
        workspace: &Path,
        options: SyncOptions,
    ) -> Result<SyncResult, TaskError> {
        let gate_exists = project.gate_path.exists();
        if project.is_gatekeeping() && !gate_exists {
            return Err(ConfigError::GateMissing {
                project: project.id.clone(),
                path: project.gate_path.clone(),
            }
            .into());
        }

        let mut warnings = Vec::new();
        let (from, action) = if !workspace.join(".git").exists() {
            self.fresh_clone(project, workspace, gate_exists, &mut warnings)?
        } else {
            if project.is_gatekeeping() {
                self.ensure_origin_is_gate(project, workspace, &mut warnings)?;
            }
            let from = if project.is_gatekeeping() {
                SyncSource::Gate
            } else {
                SyncSource::Upstream
            };
            let action = if has_marker(workspace) {
                self.marker_reset(project, workspace)?
            } else {
                self.resume(project, workspace, options.reset_mode, &mut warnings)
            };
            (from, action)
        };

        let mut gate_staleness = None;
        if project.is_gatekeeping() {
            self.reconcile_external_remote(project, workspace, &mut warnings);
            let staleness = gate::compare_gate_vs_upstream(self.git, project);
            if staleness.is_stale {
                warnings.push(format!(
                    "gate is behind upstream on '{}'; run `gatebox gate-sync {}`",
                    staleness.branch, project.id
                ));
            }
            gate_staleness = Some(staleness);
        }

        info!(
            project = %project.id,
            workspace = %workspace.display(),
            from = %from,
            action = ?action,
            warnings = warnings.len(),
            "sync: done"
        );
        Ok(SyncResult {
            from,
            action,
            warnings,
            gate_staleness,
        })
    }

    /// Pick the branch to check out: the configured one when the remote has
    /// it, else whatever the remote's HEAD points to.
    fn resolve_branch(&self, url: &str, wanted: &str, warnings: &mut Vec<String>) -> Option<String> {
        match self.git.ls_remote_head(url, wanted) {
            Ok(Some(_)) => Some(wanted.to_string()),
            Ok(None) => match self.git.remote_default_branch(url) {
                Ok(Some(fallback)) => {
                    warnings.push(format!(
                        "branch '{}' not found on {}; using remote default '{}'",
                        wanted, url, fallback
                    ));
                    Some(fallback)
                }
                _ => {
                    warnings.push(format!(
                        "branch '{}' not found on {}; using remote HEAD",
                        wanted, url
                    ));
                    None
                }
            },
            // Unknown; let the clone itself report reachability problems.
            Err(_) => Some(wanted.to_string()),
        }
    }

    fn fresh_clone(
        &self,
        project: &Project,
        workspace: &Path,
        gate_exists: bool,
        warnings: &mut Vec<String>,
    ) -> Result<(SyncSource, SyncAction), TaskError> {
        let (from, url) = if project.is_gatekeeping() || gate_exists {
            (SyncSource::Gate, gate::gate_url(project))
        } else {
            let url = project
                .upstream_url
                .clone()
                .ok_or_else(|| GitSyncError::NoUpstream(project.id.clone()))?;
            (SyncSource::Upstream, url)
        };

        check_clone_target(workspace)?;
        let branch = self.resolve_branch(&url, &project.default_branch, warnings);
        info!(workspace = %workspace.display(), from = %from, ?branch, "sync: fresh clone");

        // Clone next to the workspace; the marker stays until the clone has landed.
        let parent = workspace.parent().unwrap_or_else(|| Path::new("."));
        let staging = tempfile::Builder::new()
            .prefix(".clone-")
            .tempdir_in(parent)
            .map_err(|source| GitSyncError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        let staged = staging.path().join("repo");
        self.git.clone_repo(&url, &staged, branch.as_deref())?;
        move_clone_into(&staged, workspace)?;
        drop(staging);

        let branch = branch.unwrap_or_else(|| project.default_branch.clone());

        if from == SyncSource::Gate
            && !project.is_gatekeeping()
            && let Some(upstream) = project.upstream_url.as_deref()
        {
            // Seeded from the local cache; work against upstream from now on.
            self.git.set_remote_url(workspace, "origin", upstream)?;
            let origin_branch = format!("origin/{}", branch);
            match self.git.fetch(workspace, Some("origin")) {
                Ok(()) => {
                    if let Err(e) = self.git.reset(workspace, ResetKind::Hard, &origin_branch) {
                        warnings.push(format!("could not advance to {}: {}", origin_branch, e));
                    }
                }
                Err(e) => warnings.push(format!("fetch from upstream failed: {}", e)),
            }
        }

        clear_marker(workspace)?;
        Ok((from, SyncAction::Cloned { branch }))
    }

    fn marker_reset(&self, project: &Project, workspace: &Path) -> Result<SyncAction, TaskError> {
        let origin = self
            .git
            .remote_url(workspace, "origin")?
            .or_else(|| project.upstream_url.clone())
            .ok_or_else(|| GitSyncError::NoUpstream(project.id.clone()))?;

        self.git.fetch(workspace, None)?;
        let mut ignored = Vec::new();
        let branch = self
            .resolve_branch(&origin, &project.default_branch, &mut ignored)
            .unwrap_or_else(|| project.default_branch.clone());
        let start = format!("origin/{}", branch);
        info!(workspace = %workspace.display(), branch = %branch, "sync: marker reset");

        self.git.checkout_branch(workspace, &branch, &start)?;
        self.git.reset(workspace, ResetKind::Hard, &start)?;
        clear_marker(workspace)?;
        Ok(SyncAction::MarkerReset { branch })
    }

    /// Branch the workspace follows: the configured one, or the remote
    /// default the clone fell back to when the remote lacks it.
    fn tracked_branch(&self, project: &Project, workspace: &Path) -> String {
        let origin = self
            .git
            .remote_url(workspace, "origin")
            .ok()
            .flatten()
            .or_else(|| project.upstream_url.clone());
        let mut ignored = Vec::new();
        origin
            .and_then(|url| self.resolve_branch(&url, &project.default_branch, &mut ignored))
            .unwrap_or_else(|| project.default_branch.clone())
    }

    fn resume(
        &self,
        project: &Project,
        workspace: &Path,
        reset_mode: GitResetMode,
        warnings: &mut Vec<String>,
    ) -> SyncAction {
        if let Err(e) = self.git.fetch(workspace, None) {
            warn!(workspace = %workspace.display(), error = %e, "sync: fetch failed");
            warnings.push(format!("fetch failed, continuing with local state: {}", e));
            return SyncAction::Fetched {
                reset: GitResetMode::None,
            };
        }

        let kind = match reset_mode {
            GitResetMode::None => {
                return SyncAction::Fetched {
                    reset: GitResetMode::None,
                };
            }
            GitResetMode::Soft => ResetKind::Soft,
            GitResetMode::Hard => ResetKind::Hard,
        };
        let target = format!("origin/{}", self.tracked_branch(project, workspace));
        match self.git.reset(workspace, kind, &target) {
            Ok(()) => SyncAction::Fetched { reset: reset_mode },
            Err(e) => {
                warnings.push(format!("reset to {} failed: {}", target, e));
                SyncAction::Fetched {
                    reset: GitResetMode::None,
                }
            }
        }
    }

    fn ensure_origin_is_gate(
        &self,
        project: &Project,
        workspace: &Path,
        warnings: &mut Vec<String>,
    ) -> Result<(), GitSyncError> {
        let gate = gate::gate_url(project);
        match self.git.remote_url(workspace, "origin")? {
            Some(current) if current == gate => Ok(()),
            Some(current) => {
                warn!(from = %current, to = %gate, "sync: origin drifted, repointing to gate");
                warnings.push(format!("origin pointed at {}; reset to the gate", current));
                self.git.set_remote_url(workspace, "origin", &gate)
            }
            None => {
                warnings.push("origin was missing; added the gate".to_string());
                self.git.add_remote(workspace, "origin", &gate)
            }
        }
    }

    /// Keep the `external` remote in line with `expose_external_remote`.
    /// Failures only produce warnings.
    fn reconcile_external_remote(
        &self,
        project: &Project,
        workspace: &Path,
        warnings: &mut Vec<String>,
    ) {
        let current = match self.git.remote_url(workspace, EXTERNAL_REMOTE) {
            Ok(current) => current,
            Err(e) => {
                warnings.push(format!("could not inspect external remote: {}", e));
                return;
            }
        };
        let wanted = project
            .upstream_url
            .as_deref()
            .filter(|_| project.expose_external_remote);

        let result = match (current.as_deref(), wanted) {
            (Some(c), Some(w)) if c == w => Ok(()),
            (Some(_), Some(w)) => self
                .git
                .remove_remote(workspace, EXTERNAL_REMOTE)
                .and_then(|_| {
                    self.git
                        .add_remote_without_fetch(workspace, EXTERNAL_REMOTE, w)
                }),
            (None, Some(w)) => self
                .git
                .add_remote_without_fetch(workspace, EXTERNAL_REMOTE, w),
            (Some(_), None) => self.git.remove_remote(workspace, EXTERNAL_REMOTE),
            (None, None) => Ok(()),
        };
        if let Err(e) = result {
            warnings.push(format!("could not update external remote: {}", e));
        }
    }
}

/// A clone target may only contain the marker.
fn check_clone_target(workspace: &Path) -> Result<(), GitSyncError> {
    let io_err = |source| GitSyncError::Io {
        path: workspace.to_path_buf(),
        source,
    };
    fs::create_dir_all(workspace).map_err(io_err)?;
    for entry in fs::read_dir(workspace).map_err(io_err)? {
        if entry.map_err(io_err)?.file_name() != MARKER_FILE {
            return Err(GitSyncError::WorkspaceNotEmpty(workspace.to_path_buf()));
        }
    }
    Ok(())
}

/// Move a finished clone into the workspace, `.git` first: if this is cut
/// short, the marker is still there and the next start resets the checkout.
fn move_clone_into(staged: &Path, workspace: &Path) -> Result<(), GitSyncError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| GitSyncError::Io { path, source }
    };
    fs::rename(staged.join(".git"), workspace.join(".git")).map_err(io_err(staged))?;
    for entry in fs::read_dir(staged).map_err(io_err(staged))? {
        let entry = entry.map_err(io_err(staged))?;
        let target = workspace.join(entry.file_name());
        fs::rename(entry.path(), &target).map_err(io_err(&target))?;
    }
    Ok(())
}
