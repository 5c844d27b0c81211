//! I/O helpers for taskloop commands.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

pub mod backend;
pub mod config;
pub mod dod;
pub mod escalation;
pub mod fallback;
pub mod init;
pub mod interrupt;
pub mod invoker;
pub mod process;
pub mod prompt;
pub mod retry;
pub mod run_state;
pub mod telemetry;
pub mod todo;

/// Write `contents` to `path` via a sibling temp file and rename.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
