//! Scriptable in-memory git used by synchronizer and lifecycle tests.
//!
//! Repositories are tracked by the path they were cloned to. `clone_repo`
//! also creates `dest/.git` on disk, with an id file inside, because the
//! synchronizer inspects and moves working copies directly.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::cmd::CmdError;
use crate::error::GitSyncError;

use super::{GitClient, ResetKind};

/// Names the path a working copy was cloned to; survives moving `.git`.
const REPO_ID_FILE: &str = "fake-repo-id";

#[derive(Debug, Clone, Default)]
pub struct FakeRepo {
    pub remotes: BTreeMap<String, String>,
    pub branch: Option<String>,
    pub head: Option<String>,
}

#[derive(Default)]
struct State {
    repos: HashMap<PathBuf, FakeRepo>,
    /// url -> branch -> sha
    remote_heads: HashMap<String, BTreeMap<String, String>>,
    remote_defaults: HashMap<String, String>,
    calls: Vec<String>,
    fail_on: Vec<String>,
}

#[derive(Default)]
pub struct FakeGit {
    state: Mutex<State>,
}

impl FakeGit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a reachable remote with one branch at `sha`, also its HEAD.
    pub fn add_remote_repo(&self, url: &str, branch: &str, sha: &str) -> &Self {
        self.with(|s| {
            s.remote_heads
                .entry(url.to_string())
                .or_default()
                .insert(branch.to_string(), sha.to_string());
            s.remote_defaults
                .entry(url.to_string())
                .or_insert_with(|| branch.to_string());
        });
        self
    }

    pub fn set_remote_default(&self, url: &str, branch: &str) {
        self.with(|s| {
            s.remote_defaults
                .insert(url.to_string(), branch.to_string());
        });
    }

    /// Make calls whose log entry starts with `prefix` fail.
    pub fn fail_on(&self, prefix: &str) {
        self.with(|s| s.fail_on.push(prefix.to_string()));
    }

    pub fn clear_failures(&self) {
        self.with(|s| s.fail_on.clear());
    }

    /// Register an existing working copy (e.g. one cloned by a previous run).
    pub fn insert_repo(&self, path: &Path, remotes: &[(&str, &str)], branch: &str) {
        fs::create_dir_all(path.join(".git")).unwrap();
        self.with(|s| {
            s.repos.insert(
                path.to_path_buf(),
                FakeRepo {
                    remotes: remotes
                        .iter()
                        .map(|(n, u)| (n.to_string(), u.to_string()))
                        .collect(),
                    branch: Some(branch.to_string()),
                    head: None,
                },
            );
        });
    }

    pub fn repo(&self, path: &Path) -> Option<FakeRepo> {
        let key = Self::key(path);
        self.with(|s| s.repos.get(&key).cloned())
    }

    pub fn calls(&self) -> Vec<String> {
        self.with(|s| s.calls.clone())
    }

    /// Recorded calls whose entry starts with `prefix`.
    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.with(|s| {
            s.calls
                .iter()
                .filter(|c| c.starts_with(prefix))
                .cloned()
                .collect()
        })
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    fn record(&self, operation: &'static str, entry: String) -> Result<(), GitSyncError> {
        self.with(|s| {
            let fail = s.fail_on.iter().any(|p| entry.starts_with(p.as_str()));
            s.calls.push(entry.clone());
            if fail {
                Err(GitSyncError::command(
                    operation,
                    CmdError::Failed {
                        command: format!("git {}", entry),
                        status: "exit code 128".to_string(),
                        stderr: "fatal: injected failure".to_string(),
                    },
                ))
            } else {
                Ok(())
            }
        })
    }

    fn missing(operation: &'static str, what: String) -> GitSyncError {
        GitSyncError::command(
            operation,
            CmdError::Failed {
                command: format!("git {}", operation),
                status: "exit code 128".to_string(),
                stderr: format!("fatal: {}", what),
            },
        )
    }

    /// Identity of the working copy at `repo`.
    fn key(repo: &Path) -> PathBuf {
        fs::read_to_string(repo.join(".git").join(REPO_ID_FILE))
            .map(PathBuf::from)
            .unwrap_or_else(|_| repo.to_path_buf())
    }

    /// Remote url behind a remote name of a repo.
    fn resolve(s: &State, repo: &Path, remote: &str) -> Option<String> {
        s.repos.get(&Self::key(repo))?.remotes.get(remote).cloned()
    }
}

impl GitClient for FakeGit {
    fn clone_repo(&self, url: &str, dest: &Path, branch: Option<&str>) -> Result<(), GitSyncError> {
        self.record(
            "clone",
            format!("clone {} {} {}", url, dest.display(), branch.unwrap_or("-")),
        )?;
        self.with(|s| {
            let heads = s
                .remote_heads
                .get(url)
                .ok_or_else(|| Self::missing("clone", format!("repository '{}' not found", url)))?;
            let branch = match branch {
                Some(b) if heads.contains_key(b) => b.to_string(),
                Some(b) => {
                    return Err(Self::missing(
                        "clone",
                        format!("Remote branch {} not found in upstream origin", b),
                    ));
                }
                None => s
                    .remote_defaults
                    .get(url)
                    .cloned()
                    .unwrap_or_else(|| "main".to_string()),
            };
            let head = heads.get(&branch).cloned();
            let mut remotes = BTreeMap::new();
            remotes.insert("origin".to_string(), url.to_string());
            s.repos.insert(
                dest.to_path_buf(),
                FakeRepo {
                    remotes,
                    branch: Some(branch),
                    head,
                },
            );
            Ok(())
        })?;
        let io_err = |source| GitSyncError::Io {
            path: dest.to_path_buf(),
            source,
        };
        fs::create_dir_all(dest.join(".git")).map_err(io_err)?;
        fs::write(
            dest.join(".git").join(REPO_ID_FILE),
            dest.to_string_lossy().as_bytes(),
        )
        .map_err(io_err)
    }

    fn clone_mirror(&self, url: &str, dest: &Path) -> Result<(), GitSyncError> {
        self.record("clone --mirror", format!("clone-mirror {} {}", url, dest.display()))?;
        self.with(|s| {
            let heads = s.remote_heads.get(url).cloned().ok_or_else(|| {
                Self::missing("clone --mirror", format!("repository '{}' not found", url))
            })?;
            let default = s.remote_defaults.get(url).cloned();
            let key = dest.to_string_lossy().to_string();
            s.remote_heads.insert(key.clone(), heads);
            if let Some(default) = default {
                s.remote_defaults.insert(key, default);
            }
            let mut remotes = BTreeMap::new();
            remotes.insert("origin".to_string(), url.to_string());
            s.repos.insert(
                dest.to_path_buf(),
                FakeRepo {
                    remotes,
                    ..Default::default()
                },
            );
            Ok(())
        })?;
        fs::create_dir_all(dest).map_err(|source| GitSyncError::Io {
            path: dest.to_path_buf(),
            source,
        })
    }

    fn remote_update(&self, repo: &Path) -> Result<(), GitSyncError> {
        self.record("remote update", format!("remote-update {}", repo.display()))?;
        self.with(|s| {
            let upstream = Self::resolve(s, repo, "origin")
                .ok_or_else(|| Self::missing("remote update", "no origin".to_string()))?;
            let heads = s.remote_heads.get(&upstream).cloned().unwrap_or_default();
            s.remote_heads
                .insert(repo.to_string_lossy().to_string(), heads);
            Ok(())
        })
    }

    fn fetch(&self, repo: &Path, remote: Option<&str>) -> Result<(), GitSyncError> {
        self.record(
            "fetch",
            format!("fetch {} {}", repo.display(), remote.unwrap_or("--all")),
        )
    }

    fn checkout_branch(
        &self,
        repo: &Path,
        branch: &str,
        start_point: &str,
    ) -> Result<(), GitSyncError> {
        self.record(
            "checkout",
            format!("checkout {} {} {}", repo.display(), branch, start_point),
        )?;
        self.with(|s| {
            let entry = s.repos.entry(Self::key(repo)).or_default();
            entry.branch = Some(branch.to_string());
        });
        Ok(())
    }

    fn reset(&self, repo: &Path, kind: ResetKind, rev: &str) -> Result<(), GitSyncError> {
        self.record(
            "reset",
            format!("reset {} {} {}", repo.display(), kind.flag(), rev),
        )?;
        self.with(|s| {
            let head = rev.split_once('/').and_then(|(remote, branch)| {
                let url = Self::resolve(s, repo, remote)?;
                s.remote_heads.get(&url)?.get(branch).cloned()
            });
            let entry = s.repos.entry(Self::key(repo)).or_default();
            entry.head = head;
        });
        Ok(())
    }

    fn remote_url(&self, repo: &Path, name: &str) -> Result<Option<String>, GitSyncError> {
        Ok(self.with(|s| Self::resolve(s, repo, name)))
    }

    fn set_remote_url(&self, repo: &Path, name: &str, url: &str) -> Result<(), GitSyncError> {
        self.record(
            "remote set-url",
            format!("set-url {} {} {}", repo.display(), name, url),
        )?;
        self.with(|s| {
            s.repos
                .entry(Self::key(repo))
                .or_default()
                .remotes
                .insert(name.to_string(), url.to_string());
        });
        Ok(())
    }

    fn add_remote(&self, repo: &Path, name: &str, url: &str) -> Result<(), GitSyncError> {
        self.record(
            "remote add",
            format!("add-remote {} {} {}", repo.display(), name, url),
        )?;
        self.with(|s| {
            s.repos
                .entry(Self::key(repo))
                .or_default()
                .remotes
                .insert(name.to_string(), url.to_string());
        });
        Ok(())
    }

    fn add_remote_without_fetch(
        &self,
        repo: &Path,
        name: &str,
        url: &str,
    ) -> Result<(), GitSyncError> {
        self.record(
            "remote add",
            format!("add-remote-nofetch {} {} {}", repo.display(), name, url),
        )?;
        self.with(|s| {
            s.repos
                .entry(Self::key(repo))
                .or_default()
                .remotes
                .insert(name.to_string(), url.to_string());
        });
        Ok(())
    }

    fn remove_remote(&self, repo: &Path, name: &str) -> Result<(), GitSyncError> {
        self.record(
            "remote remove",
            format!("remove-remote {} {}", repo.display(), name),
        )?;
        self.with(|s| {
            if let Some(r) = s.repos.get_mut(&Self::key(repo)) {
                r.remotes.remove(name);
            }
        });
        Ok(())
    }

    fn ls_remote_head(&self, url: &str, branch: &str) -> Result<Option<String>, GitSyncError> {
        self.record("ls-remote", format!("ls-remote {} {}", url, branch))?;
        Ok(self.with(|s| s.remote_heads.get(url).and_then(|h| h.get(branch).cloned())))
    }

    fn remote_default_branch(&self, url: &str) -> Result<Option<String>, GitSyncError> {
        self.record("ls-remote", format!("ls-remote-symref {}", url))?;
        Ok(self.with(|s| s.remote_defaults.get(url).cloned()))
    }
}
