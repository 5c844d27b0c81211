//! Workspace layout and `.taskloop/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use crate::io::config::{RunConfig, write_config};

/// Canonical paths within `.taskloop/` for a workspace root.
#[derive(Debug, Clone)]
pub struct TaskloopPaths {
    pub root: PathBuf,
    pub taskloop_dir: PathBuf,
    pub state_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub attempts_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub run_state_path: PathBuf,
    pub health_path: PathBuf,
    pub telemetry_path: PathBuf,
}

impl TaskloopPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let taskloop_dir = root.join(".taskloop");
        let state_dir = taskloop_dir.join("state");
        let logs_dir = taskloop_dir.join("logs");
        Self {
            root: root.clone(),
            taskloop_dir: taskloop_dir.clone(),
            state_dir: state_dir.clone(),
            logs_dir: logs_dir.clone(),
            attempts_dir: taskloop_dir.join("attempts"),
            gitignore_path: taskloop_dir.join(".gitignore"),
            config_path: taskloop_dir.join("config.toml"),
            run_state_path: state_dir.join("run_state.json"),
            health_path: state_dir.join("backend_health.json"),
            telemetry_path: logs_dir.join("attempts.jsonl"),
        }
    }

    /// `.taskloop/attempts/<run_id>/<task_id>/<n>/`
    pub fn attempt_dir(&self, run_id: &str, task_id: &str, n: u32) -> PathBuf {
        self.attempts_dir
            .join(path_component(run_id))
            .join(path_component(task_id))
            .join(n.to_string())
    }
}

/// Make an id safe to use as a single path component.
fn path_component(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => format!("_{cleaned}"),
        _ => cleaned,
    }
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Overwrite an existing config.
    pub force: bool,
}

/// Create `.taskloop/` with a default config and `.gitignore`.
///
/// Fails if the config already exists unless `options.force` is set.
pub fn init_workspace(root: &Path, options: &InitOptions) -> Result<TaskloopPaths> {
    let paths = TaskloopPaths::new(root);
    if paths.taskloop_dir.exists() && !paths.taskloop_dir.is_dir() {
        return Err(anyhow!("taskloop init: .taskloop exists but is not a directory"));
    }
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "taskloop init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }

    for dir in [&paths.state_dir, &paths.logs_dir, &paths.attempts_dir] {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    }
    fs::write(&paths.gitignore_path, GITIGNORE)
        .with_context(|| format!("write {}", paths.gitignore_path.display()))?;
    write_config(&paths.config_path, &RunConfig::default())?;
    Ok(paths)
}

const GITIGNORE: &str = "state/\nlogs/\nattempts/\n";
