use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::engine::{Mount, Runtime};
use crate::error::ConfigError;
use crate::git::DEFAULT_NETWORK_TIMEOUT;
use crate::project::{Project, SecurityMode, validate_project_id};
use crate::readiness::ReadinessProfile;
use crate::sync::GitResetMode;
use crate::tasks::TaskMode;

/// Points at an alternative global config file.
pub const CONFIG_FILE_ENV: &str = "GATEBOX_CONFIG_FILE";
/// Overrides the state directory from the config file.
pub const STATE_DIR_ENV: &str = "GATEBOX_STATE_DIR";

const APP_DIR: &str = "gatebox";
const PROJECT_FILES: [&str; 2] = ["project.yaml", "project.yml"];

const DEFAULT_BRANCH: &str = "main";
const DEFAULT_BASE_IMAGE: &str = "ubuntu:24.04";
const DEFAULT_HUMAN_NAME: &str = "Nobody";
const DEFAULT_HUMAN_EMAIL: &str = "nobody@localhost";
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 10;

/// Readiness settings for one task mode.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct ModeReadiness {
    /// Regular expressions matched against each log line.
    pub markers: Option<Vec<String>>,
    /// Seconds to wait for a marker. `0` waits indefinitely.
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct ReadinessConfig {
    #[serde(default)]
    pub cli: ModeReadiness,
    #[serde(default)]
    pub web: ModeReadiness,
    #[serde(default)]
    pub headless: ModeReadiness,
}

impl ReadinessConfig {
    fn for_mode(&self, mode: TaskMode) -> &ModeReadiness {
        match mode {
            TaskMode::Cli => &self.cli,
            TaskMode::Web => &self.web,
            TaskMode::Headless => &self.headless,
        }
    }
}

fn default_markers(mode: TaskMode) -> Vec<String> {
    let markers: &[&str] = match mode {
        TaskMode::Cli => &["__CLI_READY__", ">> init complete"],
        TaskMode::Web => &["LuskUI started"],
        TaskMode::Headless => &[],
    };
    markers.iter().map(|m| m.to_string()).collect()
}

fn default_timeout_secs(mode: TaskMode) -> u64 {
    match mode {
        TaskMode::Cli => 60,
        TaskMode::Web | TaskMode::Headless => 0,
    }
}

/// Global configuration file (`~/.config/gatebox/config.yaml`). All optional.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct GlobalConfig {
    /// Container runtime binary. Default: podman
    pub runtime: Option<Runtime>,
    pub state_dir: Option<PathBuf>,
    pub projects_dir: Option<PathBuf>,
    /// Shared agent config directories mounted into every task.
    pub envs_dir: Option<PathBuf>,
    /// Parent of per-project Dockerfile directories.
    pub build_dir: Option<PathBuf>,
    /// What a resumed task does after fetching. Default: none
    pub git_reset_mode: Option<GitResetMode>,
    #[serde(default)]
    pub readiness: ReadinessConfig,
    /// Host environment variables copied into task containers.
    pub env_passthrough: Option<Vec<String>>,
    pub human_name: Option<String>,
    pub human_email: Option<String>,
    pub default_agent: Option<String>,
    pub network_timeout_secs: Option<u64>,
}

impl GlobalConfig {
    fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = %path.display(), "config:reading file");
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// XDG base directories, resolved once from the environment.
#[derive(Debug, Clone)]
pub struct BaseDirs {
    pub config_home: PathBuf,
    pub state_home: PathBuf,
    pub data_home: PathBuf,
}

impl BaseDirs {
    pub fn from_env() -> Self {
        let home = home::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
        let xdg = |var: &str, fallback: &str| {
            env::var_os(var)
                .map(PathBuf::from)
                .filter(|p| p.is_absolute())
                .unwrap_or_else(|| home.join(fallback))
        };
        Self {
            config_home: xdg("XDG_CONFIG_HOME", ".config"),
            state_home: xdg("XDG_STATE_HOME", ".local/state"),
            data_home: xdg("XDG_DATA_HOME", ".local/share"),
        }
    }

    /// `$XDG_STATE_HOME/gatebox`: logs and default state.
    pub fn app_state_dir(&self) -> PathBuf {
        self.state_home.join(APP_DIR)
    }
}

/// Resolved global settings, threaded through every operation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub runtime: Runtime,
    pub state_dir: PathBuf,
    pub projects_dir: PathBuf,
    pub envs_dir: PathBuf,
    pub build_dir: PathBuf,
    pub git_reset_mode: GitResetMode,
    pub readiness: ReadinessConfig,
    pub env_passthrough: Vec<String>,
    pub human_name: Option<String>,
    pub human_email: Option<String>,
    pub default_agent: Option<String>,
    pub network_timeout: Duration,
    /// File the settings were read from, if any.
    pub source: Option<PathBuf>,
}

impl Settings {
    /// Read the global config from `GATEBOX_CONFIG_FILE` or the XDG location.
    /// A missing default file yields built-in defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let dirs = BaseDirs::from_env();
        let (config, source) = match env::var_os(CONFIG_FILE_ENV) {
            Some(path) => {
                let path = PathBuf::from(path);
                (GlobalConfig::load_from_path(&path)?, Some(path))
            }
            None => {
                let dir = dirs.config_home.join(APP_DIR);
                match ["config.yaml", "config.yml"]
                    .iter()
                    .map(|name| dir.join(name))
                    .find(|p| p.is_file())
                {
                    Some(path) => (GlobalConfig::load_from_path(&path)?, Some(path)),
                    None => (GlobalConfig::default(), None),
                }
            }
        };
        let state_override = env::var_os(STATE_DIR_ENV).map(PathBuf::from);
        let mut settings = Self::resolve(config, &dirs, state_override);
        settings.source = source;
        debug!(
            state_dir = %settings.state_dir.display(),
            projects_dir = %settings.projects_dir.display(),
            runtime = settings.runtime.binary(),
            "config:resolved"
        );
        Ok(settings)
    }

    pub fn resolve(config: GlobalConfig, dirs: &BaseDirs, state_override: Option<PathBuf>) -> Self {
        let state_dir = state_override
            .or(config.state_dir.map(|p| expand_home(&p)))
            .unwrap_or_else(|| dirs.app_state_dir());
        Self {
            runtime: config.runtime.unwrap_or_default(),
            projects_dir: config
                .projects_dir
                .map(|p| expand_home(&p))
                .unwrap_or_else(|| dirs.config_home.join(APP_DIR).join("projects")),
            envs_dir: config
                .envs_dir
                .map(|p| expand_home(&p))
                .unwrap_or_else(|| dirs.data_home.join(APP_DIR).join("envs")),
            build_dir: config
                .build_dir
                .map(|p| expand_home(&p))
                .unwrap_or_else(|| state_dir.join("build")),
            state_dir,
            git_reset_mode: config.git_reset_mode.unwrap_or_default(),
            readiness: config.readiness,
            env_passthrough: config.env_passthrough.unwrap_or_default(),
            human_name: config.human_name,
            human_email: config.human_email,
            default_agent: config.default_agent,
            network_timeout: config
                .network_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_NETWORK_TIMEOUT),
            source: None,
        }
    }

    /// Parent of every project's state directory.
    pub fn projects_state_dir(&self) -> PathBuf {
        self.state_dir.join("projects")
    }

    /// Markers and deadline for `mode`, config over built-in defaults.
    pub fn readiness_profile(&self, mode: TaskMode) -> Result<ReadinessProfile, ConfigError> {
        let configured = self.readiness.for_mode(mode);
        let markers = configured
            .markers
            .clone()
            .unwrap_or_else(|| default_markers(mode));
        if markers.is_empty() {
            return Ok(ReadinessProfile::detached());
        }
        let secs = configured
            .timeout_secs
            .unwrap_or_else(|| default_timeout_secs(mode));
        let timeout = (secs > 0).then(|| Duration::from_secs(secs));
        ReadinessProfile::new(markers.as_slice(), timeout)
    }

    #[cfg(test)]
    pub fn rooted_at(root: &Path) -> Self {
        let dirs = BaseDirs {
            config_home: root.join("config"),
            state_home: root.join("state-home"),
            data_home: root.join("data"),
        };
        Self::resolve(GlobalConfig::default(), &dirs, Some(root.join("state")))
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home::home_dir()
            .map(|h| h.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

/// Absolute path from a project file value: `~` expanded, relative paths
/// taken from the project directory.
fn project_path(value: &str, project_root: &Path) -> PathBuf {
    let expanded = expand_home(Path::new(value));
    if expanded.is_absolute() {
        expanded
    } else {
        project_root.join(expanded)
    }
}

#[derive(Debug, Deserialize, Default)]
struct RawProjectSection {
    id: Option<String>,
    security_class: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawGit {
    upstream_url: Option<String>,
    default_branch: Option<String>,
    human_name: Option<String>,
    human_email: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawSsh {
    key_name: Option<String>,
    host_dir: Option<String>,
    mount_in_online: Option<bool>,
    mount_in_gatekeeping: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct RawGate {
    path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawGatekeeping {
    expose_external_remote: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct RawTasks {
    root: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawDocker {
    base_image: Option<String>,
    build_dir: Option<String>,
}

/// `gpus: all` or `gpus: true`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GpuSetting {
    Flag(bool),
    Named(String),
}

impl GpuSetting {
    fn enabled(&self) -> bool {
        match self {
            GpuSetting::Flag(on) => *on,
            GpuSetting::Named(name) => {
                matches!(name.trim().to_ascii_lowercase().as_str(), "all" | "true" | "yes")
            }
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RawRun {
    gpus: Option<GpuSetting>,
    shutdown_timeout: Option<u64>,
}

/// `project.yaml` as written by the user.
#[derive(Debug, Deserialize, Default)]
struct RawProjectFile {
    #[serde(default)]
    project: RawProjectSection,
    #[serde(default)]
    git: RawGit,
    #[serde(default)]
    ssh: RawSsh,
    #[serde(default)]
    gate: RawGate,
    #[serde(default)]
    gatekeeping: RawGatekeeping,
    #[serde(default)]
    tasks: RawTasks,
    #[serde(default)]
    docker: RawDocker,
    #[serde(default)]
    run: RawRun,
    default_agent: Option<String>,
    #[serde(default)]
    extra_mounts: Vec<String>,
}

fn find_project_file(dir: &Path) -> Option<PathBuf> {
    PROJECT_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.is_file())
}

/// Load and validate `{projects_dir}/{id}/project.yaml`.
pub fn load_project(settings: &Settings, id: &str) -> Result<Project, ConfigError> {
    validate_project_id(id)?;
    let root = settings.projects_dir.join(id);
    let path = find_project_file(&root)
        .ok_or_else(|| ConfigError::MissingProject(root.join(PROJECT_FILES[0])))?;
    let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    let raw: RawProjectFile = if contents.trim().is_empty() {
        RawProjectFile::default()
    } else {
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?
    };
    let project = validate(raw, id, root, settings)?;
    debug!(project = %project.id, mode = %project.security_mode, "config:project loaded");
    Ok(project)
}

fn validate(
    raw: RawProjectFile,
    dir_name: &str,
    root: PathBuf,
    settings: &Settings,
) -> Result<Project, ConfigError> {
    let id = raw.project.id.unwrap_or_else(|| dir_name.to_string());
    validate_project_id(&id)?;

    let security_mode = match raw.project.security_class.as_deref() {
        Some(s) => s.parse::<SecurityMode>()?,
        None => SecurityMode::Online,
    };
    let upstream_url = raw.git.upstream_url.filter(|u| !u.trim().is_empty());
    if security_mode == SecurityMode::Gatekeeping && upstream_url.is_none() {
        return Err(ConfigError::MissingUpstream(id));
    }

    let extra_mounts = raw
        .extra_mounts
        .iter()
        .map(|spec| Mount::parse(spec))
        .collect::<Result<Vec<_>, _>>()?;

    let path_or = |value: Option<String>, default: PathBuf| {
        value
            .map(|v| project_path(&v, &root))
            .unwrap_or(default)
    };
    let tasks_root = path_or(raw.tasks.root, settings.state_dir.join("tasks").join(&id));
    let gate_path = path_or(
        raw.gate.path,
        settings.state_dir.join("gate").join(format!("{}.git", id)),
    );
    let build_dir = path_or(raw.docker.build_dir, settings.build_dir.join(&id));
    let ssh_host_dir = raw.ssh.host_dir.map(|v| project_path(&v, &root));

    Ok(Project {
        security_mode,
        upstream_url,
        default_branch: raw
            .git
            .default_branch
            .unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
        ssh_key_name: raw.ssh.key_name,
        gpu_enabled: raw.run.gpus.as_ref().is_some_and(GpuSetting::enabled),
        base_image: raw
            .docker
            .base_image
            .unwrap_or_else(|| DEFAULT_BASE_IMAGE.to_string()),
        tasks_root,
        gate_path,
        build_dir,
        state_dir: settings.projects_state_dir().join(&id),
        ssh_host_dir,
        ssh_mount_in_online: raw.ssh.mount_in_online.unwrap_or(true),
        ssh_mount_in_gatekeeping: raw.ssh.mount_in_gatekeeping.unwrap_or(false),
        expose_external_remote: raw.gatekeeping.expose_external_remote.unwrap_or(false),
        human_name: raw
            .git
            .human_name
            .or_else(|| settings.human_name.clone())
            .unwrap_or_else(|| DEFAULT_HUMAN_NAME.to_string()),
        human_email: raw
            .git
            .human_email
            .or_else(|| settings.human_email.clone())
            .unwrap_or_else(|| DEFAULT_HUMAN_EMAIL.to_string()),
        shutdown_timeout_secs: raw
            .run
            .shutdown_timeout
            .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        default_agent: raw.default_agent.or_else(|| settings.default_agent.clone()),
        extra_mounts,
        id,
    })
}

/// Every loadable project. Broken project files are logged and skipped.
pub fn list_projects(settings: &Settings) -> Vec<Project> {
    let Ok(entries) = fs::read_dir(&settings.projects_dir) else {
        return Vec::new();
    };
    let mut ids: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| find_project_file(&e.path()).is_some())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .collect();
    ids.sort();

    ids.iter()
        .filter_map(|id| match load_project(settings, id) {
            Ok(project) => Some(project),
            Err(e) => {
                warn!(project = %id, error = %e, "config:skipping project");
                None
            }
        })
        .collect()
}
