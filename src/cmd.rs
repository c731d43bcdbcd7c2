use std::ffi::OsString;
use std::io::Read;
use std::path::Path;
use std::process::{Command, ExitStatus, Output, Stdio};
use std::time::Duration;

use tracing::{debug, trace};
use wait_timeout::ChildExt;

/// Failure of an external tool invocation.
///
/// The stderr text is kept verbatim so callers can surface the tool's own
/// diagnostic to the user.
#[derive(Debug, thiserror::Error)]
pub enum CmdError {
    #[error("failed to execute `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` failed ({status}):\n{stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("`{command}` timed out after {}s", timeout.as_secs())]
    TimedOut { command: String, timeout: Duration },
}

impl CmdError {
    /// The raw stderr of a failed command, if any.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            CmdError::Failed { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

fn describe_status(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}

/// A builder for executing external commands with unified error handling
pub struct Cmd<'a> {
    command: &'a str,
    args: Vec<OsString>,
    envs: Vec<(String, String)>,
    workdir: Option<&'a Path>,
}

impl<'a> Cmd<'a> {
    /// Create a new command builder
    pub fn new(command: &'a str) -> Self {
        Self {
            command,
            args: Vec::new(),
            envs: Vec::new(),
            workdir: None,
        }
    }

    /// Add a single argument
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the child process
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.envs.push((key.to_string(), value.to_string()));
        self
    }

    /// Set the working directory for the command
    pub fn workdir(mut self, path: &'a Path) -> Self {
        self.workdir = Some(path);
        self
    }

    /// Human readable command line, used in logs and error messages.
    pub fn display(&self) -> String {
        let mut parts = vec![self.command.to_string()];
        parts.extend(self.args.iter().map(|a| a.to_string_lossy().into_owned()));
        parts.join(" ")
    }

    fn build(&self) -> Command {
        let mut cmd = Command::new(self.command);
        cmd.args(&self.args);
        if let Some(dir) = self.workdir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        cmd
    }

    /// Execute the command and return the output
    /// Returns an error if the command fails (non-zero exit code)
    pub fn run(self) -> Result<Output, CmdError> {
        let line = self.display();
        let workdir_display = self.workdir.map(|p| p.display().to_string());
        trace!(command = %line, workdir = ?workdir_display, "cmd:run start");

        let output = self.build().output().map_err(|source| CmdError::Spawn {
            command: line.clone(),
            source,
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            debug!(
                command = %line,
                status = ?output.status.code(),
                stderr = %stderr,
                "cmd:run failure"
            );
            return Err(CmdError::Failed {
                command: line,
                status: describe_status(&output.status),
                stderr,
            });
        }
        trace!(command = %line, "cmd:run success");
        Ok(output)
    }

    /// Execute the command and return stdout as a trimmed string
    pub fn run_and_capture_stdout(self) -> Result<String, CmdError> {
        let output = self.run()?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Execute the command, returning Ok(true) if it succeeds, Ok(false) if it fails
    /// This is useful for commands that are used as checks (e.g., git rev-parse --verify)
    pub fn run_as_check(self) -> Result<bool, CmdError> {
        let line = self.display();
        trace!(command = %line, "cmd:check start");

        let output = self
            .build()
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|source| CmdError::Spawn {
                command: line.clone(),
                source,
            })?;

        let success = output.success();
        trace!(command = %line, success, "cmd:check result");
        Ok(success)
    }

    /// Execute the command with a wall-clock limit, killing it on expiry.
    ///
    /// Used for network-bound queries where a hung remote must not block the
    /// caller indefinitely.
    pub fn run_with_timeout(self, timeout: Duration) -> Result<String, CmdError> {
        let line = self.display();
        trace!(command = %line, timeout_secs = timeout.as_secs(), "cmd:timed start");

        let mut child = self
            .build()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| CmdError::Spawn {
                command: line.clone(),
                source,
            })?;

        // Drain pipes on helper threads so a chatty child cannot block on a full pipe.
        let stdout_reader = child.stdout.take().map(spawn_drain);
        let stderr_reader = child.stderr.take().map(spawn_drain);

        let status = match child.wait_timeout(timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                debug!(command = %line, "cmd:timed expired");
                return Err(CmdError::TimedOut {
                    command: line,
                    timeout,
                });
            }
            Err(source) => {
                return Err(CmdError::Spawn {
                    command: line,
                    source,
                });
            }
        };

        let stdout = stdout_reader
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        let stderr = stderr_reader
            .and_then(|h| h.join().ok())
            .unwrap_or_default();

        if !status.success() {
            return Err(CmdError::Failed {
                command: line,
                status: describe_status(&status),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(stdout.trim().to_string())
    }
}

fn spawn_drain<R: Read + Send + 'static>(mut reader: R) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}
