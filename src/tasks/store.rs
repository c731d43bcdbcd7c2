//! YAML task metadata, one `{task_id}.yml` per task under the project state dir.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{ConfigError, TaskError};
use crate::project::Project;

use super::types::Task;

const EXTENSION: &str = "yml";

pub struct TaskStore {
    project_id: String,
    dir: PathBuf,
}

impl TaskStore {
    pub fn for_project(project: &Project) -> Self {
        Self {
            project_id: project.id.clone(),
            dir: project.tasks_meta_dir(),
        }
    }

    pub fn path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", task_id, EXTENSION))
    }

    pub fn load(&self, task_id: &str) -> Result<Task, TaskError> {
        let path = self.path(task_id);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::UnknownTask {
                    project: self.project_id.clone(),
                    task_id: task_id.to_string(),
                }
                .into());
            }
            Err(source) => return Err(ConfigError::Read { path, source }.into()),
        };
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse { path, source }.into())
    }

    /// Write via a temp file in the same directory, then rename.
    pub fn save(&self, task: &Task) -> Result<(), TaskError> {
        let path = self.path(&task.task_id);
        let fail = |reason: String| TaskError::Metadata {
            path: path.clone(),
            reason,
        };
        fs::create_dir_all(&self.dir).map_err(|e| fail(e.to_string()))?;
        let yaml = serde_yaml::to_string(task).map_err(|e| fail(e.to_string()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(|e| fail(e.to_string()))?;
        tmp.write_all(yaml.as_bytes())
            .map_err(|e| fail(e.to_string()))?;
        tmp.persist(&path).map_err(|e| fail(e.error.to_string()))?;
        debug!(path = %path.display(), "task metadata saved");
        Ok(())
    }

    /// Remove the metadata file. Missing is not an error.
    pub fn remove(&self, task_id: &str) -> std::io::Result<()> {
        match fs::remove_file(self.path(task_id)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// All tasks, sorted numerically by id. Unreadable files are skipped.
    pub fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = task_files(&self.dir)
            .into_iter()
            .filter_map(|path| match read_task(&path) {
                Some(task) => Some(task),
                None => {
                    warn!(path = %path.display(), "skipping unreadable task metadata");
                    None
                }
            })
            .collect();
        tasks.sort_by_key(|t| (numeric_id(&t.task_id).unwrap_or(u64::MAX), t.task_id.clone()));
        tasks
    }

    /// One past the highest numeric id on disk, starting at 1.
    pub fn next_id(&self) -> String {
        let max = task_files(&self.dir)
            .iter()
            .filter_map(|p| p.file_stem()?.to_str().and_then(numeric_id))
            .max()
            .unwrap_or(0);
        (max + 1).to_string()
    }
}

fn numeric_id(id: &str) -> Option<u64> {
    id.parse().ok()
}

fn task_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == EXTENSION))
        .collect()
}

fn read_task(path: &Path) -> Option<Task> {
    let content = fs::read_to_string(path).ok()?;
    serde_yaml::from_str(&content).ok()
}

/// Web ports recorded by any task of any project under `projects_state_dir`.
pub fn used_web_ports(projects_state_dir: &Path) -> Vec<u16> {
    let Ok(projects) = fs::read_dir(projects_state_dir) else {
        return Vec::new();
    };
    projects
        .filter_map(|e| e.ok())
        .flat_map(|e| task_files(&e.path().join("tasks")))
        .filter_map(|p| read_task(&p)?.web_port)
        .collect()
}
