//! Workspace file tools offered to chat-completion models.
//!
//! The router backend has no agent of its own, so the model edits the
//! workspace through these function-calling tools. Every path is resolved
//! relative to the workspace root; absolute paths and `..` are refused.

use std::ffi::OsStr;
use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

/// Directories never listed or touched.
const HIDDEN_DIRS: [&str; 2] = [".git", ".taskloop"];

/// A tool call requested by the model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments; may arrive empty for argument-less calls.
    #[serde(default)]
    pub arguments: String,
}

fn function_type() -> String {
    "function".to_string()
}

/// `tools` array for the chat-completions request.
pub fn definitions() -> Value {
    json!([
        {
            "type": "function",
            "function": {
                "name": "read_file",
                "description": "Read a text file from the workspace.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "path": { "type": "string", "description": "Path relative to the workspace root." }
                    },
                    "required": ["path"]
                }
            }
        },
        {
            "type": "function",
            "function": {
                "name": "write_file",
                "description": "Create or overwrite a workspace file. Parent directories are created.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "path": { "type": "string", "description": "Path relative to the workspace root." },
                        "content": { "type": "string", "description": "Complete new file content." }
                    },
                    "required": ["path", "content"]
                }
            }
        },
        {
            "type": "function",
            "function": {
                "name": "replace_in_file",
                "description": "Replace exactly one occurrence of `old` with `new` in a workspace file.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "path": { "type": "string", "description": "Path relative to the workspace root." },
                        "old": { "type": "string", "description": "Text to replace; must occur exactly once." },
                        "new": { "type": "string", "description": "Replacement text." }
                    },
                    "required": ["path", "old", "new"]
                }
            }
        },
        {
            "type": "function",
            "function": {
                "name": "list_files",
                "description": "List entries of a workspace directory. Directories end with '/'.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "path": { "type": "string", "description": "Directory relative to the workspace root; defaults to the root." }
                    }
                }
            }
        }
    ])
}

/// Executes tool calls against one workspace and tracks what changed.
pub struct WorkspaceTools {
    root: PathBuf,
    output_limit_bytes: usize,
    changed: Vec<String>,
}

impl WorkspaceTools {
    pub fn new(root: &Path, output_limit_bytes: usize) -> Self {
        Self {
            root: root.to_path_buf(),
            output_limit_bytes,
            changed: Vec::new(),
        }
    }

    /// Workspace-relative paths written so far, in first-write order.
    pub fn changed(&self) -> &[String] {
        &self.changed
    }

    /// Run one call. Tool failures are reported to the model as text, never
    /// as `Err`, so a bad path does not abort the whole backend call.
    pub fn execute(&mut self, call: &FunctionCall) -> String {
        match self.dispatch(call) {
            Ok(output) => output,
            Err(err) => {
                debug!(tool = %call.name, err = %format!("{err:#}"), "tool call failed");
                format!("error: {err:#}")
            }
        }
    }

    fn dispatch(&mut self, call: &FunctionCall) -> Result<String> {
        let args: Value = if call.arguments.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(&call.arguments).context("arguments are not valid JSON")?
        };
        match call.name.as_str() {
            "read_file" => {
                let path = self.resolve(str_arg(&args, "path")?)?;
                let content = fs::read_to_string(&path)
                    .with_context(|| format!("read {}", self.display(&path)))?;
                Ok(head(&content, self.output_limit_bytes))
            }
            "write_file" => {
                let relative = str_arg(&args, "path")?;
                let path = self.resolve(relative)?;
                let content = str_arg(&args, "content")?;
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("create {}", self.display(parent)))?;
                }
                fs::write(&path, content).with_context(|| format!("write {relative}"))?;
                self.note_change(relative);
                Ok(format!("wrote {} bytes to {relative}", content.len()))
            }
            "replace_in_file" => {
                let relative = str_arg(&args, "path")?;
                let path = self.resolve(relative)?;
                let old = str_arg(&args, "old")?;
                let new = str_arg(&args, "new")?;
                if old.is_empty() {
                    bail!("`old` must not be empty");
                }
                let content =
                    fs::read_to_string(&path).with_context(|| format!("read {relative}"))?;
                match content.matches(old).count() {
                    1 => {}
                    0 => bail!("`old` was not found in {relative}"),
                    n => bail!("`old` occurs {n} times in {relative}; make it unique"),
                }
                fs::write(&path, content.replacen(old, new, 1))
                    .with_context(|| format!("write {relative}"))?;
                self.note_change(relative);
                Ok(format!("updated {relative}"))
            }
            "list_files" => {
                let relative = args.get("path").and_then(Value::as_str).unwrap_or(".");
                let dir = self.resolve(relative)?;
                let mut entries = Vec::new();
                for entry in fs::read_dir(&dir).with_context(|| format!("list {relative}"))? {
                    let entry = entry.with_context(|| format!("list {relative}"))?;
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if HIDDEN_DIRS.contains(&name.as_str()) {
                        continue;
                    }
                    if entry.file_type().is_ok_and(|t| t.is_dir()) {
                        entries.push(format!("{name}/"));
                    } else {
                        entries.push(name);
                    }
                }
                entries.sort();
                Ok(entries.join("\n"))
            }
            other => Err(anyhow!("unknown tool `{other}`")),
        }
    }

    /// Join `relative` onto the root, refusing anything that could leave it.
    fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let candidate = Path::new(relative);
        let mut resolved = self.root.clone();
        for component in candidate.components() {
            match component {
                Component::Normal(part) => {
                    if resolved == self.root && HIDDEN_DIRS.iter().any(|h| part == OsStr::new(h)) {
                        bail!("{relative} is reserved");
                    }
                    resolved.push(part);
                }
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    bail!("{relative} is outside the workspace");
                }
            }
        }
        Ok(resolved)
    }

    fn display(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .display()
            .to_string()
    }

    fn note_change(&mut self, relative: &str) {
        let relative = relative.trim_start_matches("./").to_string();
        if !self.changed.contains(&relative) {
            self.changed.push(relative);
        }
    }
}

/// First `max` bytes of `text` with a truncation note.
fn head(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n[truncated {} bytes]", &text[..cut], text.len() - cut)
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing string argument `{key}`"))
}
