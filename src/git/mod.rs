//! Git operator used by the synchronizer and the gate mirror.
//!
//! Everything goes through the `git` binary; [`GitClient`] is the seam that
//! lets sync logic run against `git::fake::FakeGit` in tests.

#[cfg(test)]
pub mod fake;

use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::cmd::{Cmd, CmdError};
use crate::error::GitSyncError;

/// Default limit for network-bound queries (`ls-remote`).
pub const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    Soft,
    Hard,
}

impl ResetKind {
    fn flag(&self) -> &'static str {
        match self {
            ResetKind::Soft => "--soft",
            ResetKind::Hard => "--hard",
        }
    }
}

pub trait GitClient {
    /// Clone `url` into `dest`, checking out `branch` when given.
    fn clone_repo(&self, url: &str, dest: &Path, branch: Option<&str>) -> Result<(), GitSyncError>;

    /// Create a bare mirror clone.
    fn clone_mirror(&self, url: &str, dest: &Path) -> Result<(), GitSyncError>;

    /// `git remote update --prune` inside a mirror.
    fn remote_update(&self, repo: &Path) -> Result<(), GitSyncError>;

    /// Fetch one remote, or every remote when `remote` is `None`, pruning
    /// deleted refs.
    fn fetch(&self, repo: &Path, remote: Option<&str>) -> Result<(), GitSyncError>;

    /// `git checkout -f -B branch start_point`.
    fn checkout_branch(&self, repo: &Path, branch: &str, start_point: &str)
    -> Result<(), GitSyncError>;

    fn reset(&self, repo: &Path, kind: ResetKind, rev: &str) -> Result<(), GitSyncError>;

    /// Configured URL of a remote, `None` when the remote does not exist.
    fn remote_url(&self, repo: &Path, name: &str) -> Result<Option<String>, GitSyncError>;

    fn set_remote_url(&self, repo: &Path, name: &str, url: &str) -> Result<(), GitSyncError>;

    fn add_remote(&self, repo: &Path, name: &str, url: &str) -> Result<(), GitSyncError>;

    /// Add a remote without a fetch refspec, so `fetch --all` never touches it.
    fn add_remote_without_fetch(&self, repo: &Path, name: &str, url: &str)
    -> Result<(), GitSyncError>;

    fn remove_remote(&self, repo: &Path, name: &str) -> Result<(), GitSyncError>;

    /// Commit id of `refs/heads/{branch}` on a remote, `None` when absent.
    fn ls_remote_head(&self, url: &str, branch: &str) -> Result<Option<String>, GitSyncError>;

    /// Branch the remote's HEAD points to, if it advertises one.
    fn remote_default_branch(&self, url: &str) -> Result<Option<String>, GitSyncError>;
}

/// [`GitClient`] backed by the `git` command line.
pub struct CliGit {
    network_timeout: Duration,
    ssh_command: Option<String>,
}

impl Default for CliGit {
    fn default() -> Self {
        Self::new(DEFAULT_NETWORK_TIMEOUT)
    }
}

impl CliGit {
    pub fn new(network_timeout: Duration) -> Self {
        Self {
            network_timeout,
            ssh_command: None,
        }
    }

    /// Route ssh transport through a specific `GIT_SSH_COMMAND`.
    pub fn with_ssh_command(mut self, command: Option<String>) -> Self {
        self.ssh_command = command;
        self
    }

    fn git<'a>(&self) -> Cmd<'a> {
        // Never block on a credential prompt.
        let cmd = Cmd::new("git").env("GIT_TERMINAL_PROMPT", "0");
        match &self.ssh_command {
            Some(ssh) => cmd.env("GIT_SSH_COMMAND", ssh).env("SSH_AUTH_SOCK", ""),
            None => cmd,
        }
    }

    fn in_repo<'a>(&self, repo: &'a Path) -> Cmd<'a> {
        self.git().workdir(repo)
    }
}

fn run(operation: &'static str, cmd: Cmd<'_>) -> Result<String, GitSyncError> {
    cmd.run_and_capture_stdout()
        .map_err(|e| GitSyncError::command(operation, e))
}

/// Parse `ls-remote` output into the commit id of the first line.
fn first_sha(output: &str) -> Option<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .find(|sha| !sha.is_empty())
        .map(str::to_string)
}

/// Parse `ls-remote --symref <url> HEAD` output.
fn parse_symref_head(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let rest = line.strip_prefix("ref:")?;
        let (target, head) = rest.trim().split_once(char::is_whitespace)?;
        (head.trim() == "HEAD")
            .then(|| target.strip_prefix("refs/heads/"))
            .flatten()
            .map(str::to_string)
    })
}

impl GitClient for CliGit {
    fn clone_repo(&self, url: &str, dest: &Path, branch: Option<&str>) -> Result<(), GitSyncError> {
        debug!(url, dest = %dest.display(), ?branch, "git:clone");
        let mut cmd = self.git().arg("clone");
        if let Some(branch) = branch {
            cmd = cmd.args(["--branch", branch]);
        }
        run("clone", cmd.arg(url).arg(dest.as_os_str()))?;
        Ok(())
    }

    fn clone_mirror(&self, url: &str, dest: &Path) -> Result<(), GitSyncError> {
        debug!(url, dest = %dest.display(), "git:clone --mirror");
        run(
            "clone --mirror",
            self.git()
                .args(["clone", "--mirror", url])
                .arg(dest.as_os_str()),
        )?;
        Ok(())
    }

    fn remote_update(&self, repo: &Path) -> Result<(), GitSyncError> {
        run(
            "remote update",
            self.in_repo(repo).args(["remote", "update", "--prune"]),
        )?;
        Ok(())
    }

    fn fetch(&self, repo: &Path, remote: Option<&str>) -> Result<(), GitSyncError> {
        let cmd = self.in_repo(repo).args(["fetch", "--prune"]);
        let cmd = match remote {
            Some(name) => cmd.arg(name),
            None => cmd.arg("--all"),
        };
        run("fetch", cmd)?;
        Ok(())
    }

    fn checkout_branch(
        &self,
        repo: &Path,
        branch: &str,
        start_point: &str,
    ) -> Result<(), GitSyncError> {
        run(
            "checkout",
            self.in_repo(repo)
                .args(["checkout", "-f", "-B", branch, start_point]),
        )?;
        Ok(())
    }

    fn reset(&self, repo: &Path, kind: ResetKind, rev: &str) -> Result<(), GitSyncError> {
        run("reset", self.in_repo(repo).args(["reset", kind.flag(), rev]))?;
        Ok(())
    }

    fn remote_url(&self, repo: &Path, name: &str) -> Result<Option<String>, GitSyncError> {
        // Raw config value, not the insteadOf-resolved URL.
        match self
            .in_repo(repo)
            .args(["config", "--get", &format!("remote.{}.url", name)])
            .run_and_capture_stdout()
        {
            Ok(url) if url.is_empty() => Ok(None),
            Ok(url) => Ok(Some(url)),
            // `git config --get` exits 1 when the key is unset.
            Err(CmdError::Failed { status, .. }) if status == "exit code 1" => Ok(None),
            Err(e) => Err(GitSyncError::command("config", e)),
        }
    }

    fn set_remote_url(&self, repo: &Path, name: &str, url: &str) -> Result<(), GitSyncError> {
        run(
            "remote set-url",
            self.in_repo(repo).args(["remote", "set-url", name, url]),
        )?;
        Ok(())
    }

    fn add_remote(&self, repo: &Path, name: &str, url: &str) -> Result<(), GitSyncError> {
        run(
            "remote add",
            self.in_repo(repo).args(["remote", "add", name, url]),
        )?;
        Ok(())
    }

    fn add_remote_without_fetch(
        &self,
        repo: &Path,
        name: &str,
        url: &str,
    ) -> Result<(), GitSyncError> {
        self.add_remote(repo, name, url)?;
        run(
            "config",
            self.in_repo(repo)
                .args(["config", "--unset-all", &format!("remote.{}.fetch", name)]),
        )?;
        Ok(())
    }

    fn remove_remote(&self, repo: &Path, name: &str) -> Result<(), GitSyncError> {
        run("remote remove", self.in_repo(repo).args(["remote", "remove", name]))?;
        Ok(())
    }

    fn ls_remote_head(&self, url: &str, branch: &str) -> Result<Option<String>, GitSyncError> {
        let refname = format!("refs/heads/{}", branch);
        let out = self
            .git()
            .args(["ls-remote", url, &refname])
            .run_with_timeout(self.network_timeout)
            .map_err(|e| GitSyncError::command("ls-remote", e))?;
        Ok(first_sha(&out))
    }

    fn remote_default_branch(&self, url: &str) -> Result<Option<String>, GitSyncError> {
        let out = self
            .git()
            .args(["ls-remote", "--symref", url, "HEAD"])
            .run_with_timeout(self.network_timeout)
            .map_err(|e| GitSyncError::command("ls-remote", e))?;
        Ok(parse_symref_head(&out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_first_sha() {
        let out = "3f2a1b\trefs/heads/main\n";
        assert_eq!(first_sha(out).as_deref(), Some("3f2a1b"));
        assert_eq!(first_sha(""), None);
    }

    #[test]
    fn test_parse_symref_head() {
        let out = "ref: refs/heads/trunk\tHEAD\nabc123\tHEAD\n";
        assert_eq!(parse_symref_head(out).as_deref(), Some("trunk"));
        assert_eq!(parse_symref_head("abc123\tHEAD\n"), None);
    }

    fn git_available() -> bool {
        which::which("git").is_ok()
    }

    fn init_upstream(dir: &Path) {
        let run = |args: &[&str]| {
            Cmd::new("git")
                .args(args)
                .workdir(dir)
                .env("GIT_AUTHOR_NAME", "t")
                .env("GIT_AUTHOR_EMAIL", "t@t")
                .env("GIT_COMMITTER_NAME", "t")
                .env("GIT_COMMITTER_EMAIL", "t@t")
                .run()
                .unwrap();
        };
        run(&["init", "-q", "-b", "main"]);
        fs::write(dir.join("README"), "hi").unwrap();
        run(&["add", "README"]);
        run(&["commit", "-q", "-m", "init"]);
    }

    #[test]
    fn test_cli_git_roundtrip_against_local_repo() {
        if !git_available() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let upstream = tmp.path().join("upstream");
        fs::create_dir(&upstream).unwrap();
        init_upstream(&upstream);
        let url = upstream.to_string_lossy().to_string();

        let git = CliGit::default();
        assert!(git.ls_remote_head(&url, "main").unwrap().is_some());
        assert_eq!(git.ls_remote_head(&url, "nope").unwrap(), None);
        assert_eq!(git.remote_default_branch(&url).unwrap().as_deref(), Some("main"));

        let mirror = tmp.path().join("gate.git");
        git.clone_mirror(&url, &mirror).unwrap();
        git.remote_update(&mirror).unwrap();

        let ws = tmp.path().join("ws");
        git.clone_repo(&mirror.to_string_lossy(), &ws, Some("main"))
            .unwrap();
        assert!(ws.join(".git").is_dir());
        assert_eq!(
            git.remote_url(&ws, "origin").unwrap().as_deref(),
            Some(mirror.to_string_lossy().as_ref())
        );
        assert_eq!(git.remote_url(&ws, "external").unwrap(), None);

        git.add_remote_without_fetch(&ws, "external", &url).unwrap();
        assert_eq!(git.remote_url(&ws, "external").unwrap().as_deref(), Some(url.as_str()));
        git.fetch(&ws, None).unwrap();
        git.checkout_branch(&ws, "main", "origin/main").unwrap();
        git.reset(&ws, ResetKind::Hard, "origin/main").unwrap();
        git.remove_remote(&ws, "external").unwrap();
    }
}
