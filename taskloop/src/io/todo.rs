//! Markdown TODO file: task extraction and in-place completion write-back.
//!
//! Headings set the current section. Checkbox items (`- [ ]`, `- [x]`),
//! numbered items (`1.`, `1)`) and plain bullets are tasks; nesting depth is
//! indent / 2. Lines inside fenced code blocks are ignored.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use tracing::{debug, instrument};

use crate::core::task::{Task, TaskBudget};
use crate::io::write_atomic;
use crate::looping::RunHalt;

static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#{1,6}\s+(.+?)\s*#*\s*$").expect("heading regex"));
static CHECKBOX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<indent>[ \t]*)[-*+]\s+\[(?P<mark>[ xX])\]\s+(?P<text>.*\S)\s*$")
        .expect("checkbox regex")
});
static NUMBERED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<indent>[ \t]*)\d+[.)]\s+(?P<text>.*\S)\s*$").expect("numbered regex")
});
static BULLET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<indent>[ \t]*)[-*+]\s+(?P<text>.*\S)\s*$").expect("bullet regex")
});
static ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\*\*\s*(\d+(?:\.\d+)*)\s*:").expect("id regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Checkbox,
    Numbered,
    Bullet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TodoItem {
    pub id: String,
    pub description: String,
    pub section: Option<String>,
    /// Description of the enclosing list item, if nested.
    pub parent: Option<String>,
    pub depth: usize,
    /// 1-based.
    pub line_number: usize,
    pub kind: ItemKind,
    pub checked: bool,
}

impl TodoItem {
    pub fn to_task(&self, position: usize, budget: TaskBudget) -> Task {
        let mut task = Task::new(self.id.clone(), self.description.clone(), budget);
        task.section = self.section.clone();
        task.parent = self.parent.clone();
        task.position = position;
        task.line_number = self.line_number;
        task
    }
}

struct ParsedLine<'a> {
    indent: &'a str,
    text: &'a str,
    kind: ItemKind,
    checked: bool,
}

fn parse_item(line: &str) -> Option<ParsedLine<'_>> {
    if let Some(caps) = CHECKBOX_RE.captures(line) {
        return Some(ParsedLine {
            indent: caps.name("indent")?.as_str(),
            text: caps.name("text")?.as_str(),
            kind: ItemKind::Checkbox,
            checked: caps.name("mark")?.as_str() != " ",
        });
    }
    if let Some(caps) = NUMBERED_RE.captures(line) {
        return Some(ParsedLine {
            indent: caps.name("indent")?.as_str(),
            text: caps.name("text")?.as_str(),
            kind: ItemKind::Numbered,
            checked: false,
        });
    }
    let caps = BULLET_RE.captures(line)?;
    Some(ParsedLine {
        indent: caps.name("indent")?.as_str(),
        text: caps.name("text")?.as_str(),
        kind: ItemKind::Bullet,
        checked: false,
    })
}

fn indent_width(indent: &str) -> usize {
    indent.chars().map(|c| if c == '\t' { 4 } else { 1 }).sum()
}

fn is_fence(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("```") || trimmed.starts_with("~~~")
}

/// Parse TODO markdown into items in document order.
pub fn parse_todo(text: &str) -> Result<Vec<TodoItem>> {
    let mut items = Vec::new();
    let mut section: Option<String> = None;
    let mut ancestors: Vec<(usize, String)> = Vec::new();
    let mut in_fence = false;
    let mut seen = HashSet::new();

    for (idx, line) in text.lines().enumerate() {
        let line_number = idx + 1;
        if is_fence(line) {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if let Some(caps) = HEADING_RE.captures(line) {
            section = caps.get(1).map(|m| m.as_str().to_string());
            ancestors.clear();
            continue;
        }
        let Some(parsed) = parse_item(line) else {
            continue;
        };

        let depth = indent_width(parsed.indent) / 2;
        while ancestors.last().is_some_and(|(d, _)| *d >= depth) {
            ancestors.pop();
        }
        let parent = ancestors.last().map(|(_, desc)| desc.clone());
        let description = parsed.text.to_string();
        let id = ID_RE
            .captures(&description)
            .and_then(|caps| caps.get(1))
            .map_or_else(|| format!("L{line_number}"), |m| m.as_str().to_string());
        if !seen.insert(id.clone()) {
            bail!("duplicate task id {id} at line {line_number}");
        }

        ancestors.push((depth, description.clone()));
        items.push(TodoItem {
            id,
            description,
            section: section.clone(),
            parent,
            depth,
            line_number,
            kind: parsed.kind,
            checked: parsed.checked,
        });
    }
    Ok(items)
}

/// Load and parse the TODO file. Problems are configuration errors.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_todo(path: &Path) -> Result<Vec<TodoItem>> {
    if path.as_os_str().is_empty() {
        return Err(RunHalt::Configuration("TODO file path is empty".to_string()).into());
    }
    let text = fs::read_to_string(path).map_err(|err| {
        RunHalt::Configuration(format!("read TODO file {}: {err}", path.display()))
    })?;
    let items = parse_todo(&text)
        .map_err(|err| RunHalt::Configuration(format!("{}: {err:#}", path.display())))?;
    debug!(items = items.len(), "parsed TODO file");
    Ok(items)
}

/// Check the item off: rewrite its line as `- [x] ...`, keeping indentation.
pub fn mark_done(path: &Path, line_number: usize, description: &str) -> Result<()> {
    rewrite_item(path, line_number, description, |item| {
        Some(format!("{}- [x] {}", item.indent, item.text))
    })
    .map(|_| ())
}

/// Undo a check mark the agent set itself. Returns `true` if the line changed.
pub fn ensure_pending(path: &Path, line_number: usize, description: &str) -> Result<bool> {
    rewrite_item(path, line_number, description, |item| {
        (item.kind == ItemKind::Checkbox && item.checked)
            .then(|| format!("{}- [ ] {}", item.indent, item.text))
    })
}

/// Rewrite one item line in place. The item is found at `line_number` or,
/// if the file shifted, at the first item line with the same description.
/// Every other byte of the file is preserved.
fn rewrite_item(
    path: &Path,
    line_number: usize,
    description: &str,
    render: impl Fn(&ParsedLine<'_>) -> Option<String>,
) -> Result<bool> {
    let text =
        fs::read_to_string(path).with_context(|| format!("read TODO file {}", path.display()))?;
    let mut lines: Vec<&str> = text.split_inclusive('\n').collect();

    let matches_at = |idx: usize| {
        lines
            .get(idx)
            .and_then(|line| parse_item(strip_eol(line)))
            .is_some_and(|item| item.text == description)
    };
    let idx = if line_number > 0 && matches_at(line_number - 1) {
        line_number - 1
    } else {
        (0..lines.len())
            .find(|&idx| matches_at(idx))
            .ok_or_else(|| {
                anyhow!(
                    "task '{description}' not found in {} (expected line {line_number})",
                    path.display()
                )
            })?
    };

    let original = lines[idx];
    let body = strip_eol(original);
    let eol = &original[body.len()..];
    let Some(item) = parse_item(body) else {
        bail!("line {} is not a list item", idx + 1);
    };
    let Some(mut replacement) = render(&item) else {
        return Ok(false);
    };
    if replacement == body {
        return Ok(false);
    }
    replacement.push_str(eol);
    lines[idx] = &replacement;
    let updated: String = lines.concat();
    write_atomic(path, &updated)?;
    debug!(line = idx + 1, "rewrote TODO line");
    Ok(true)
}

fn strip_eol(line: &str) -> &str {
    line.strip_suffix('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TODO: &str = "\
# Project

## Setup
- [ ] **1.1: Create the crate**
- [x] **1.2: Add CI**
  - [ ] wire up caching
1. Write docs
2) Publish

```sh
- [ ] not a task
```

## Later
- plain bullet
";

    /// Verifies sections, ids, nesting and kinds are extracted.
    #[test]
    fn parses_items_with_sections_and_parents() {
        let items = parse_todo(TODO).expect("parse");
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, ["1.1", "1.2", "L6", "L7", "L8", "L15"]);

        assert_eq!(items[0].section.as_deref(), Some("Setup"));
        assert_eq!(items[0].kind, ItemKind::Checkbox);
        assert!(!items[0].checked);
        assert!(items[1].checked);

        let nested = &items[2];
        assert_eq!(nested.depth, 1);
        assert_eq!(nested.parent.as_deref(), Some("**1.2: Add CI**"));
        assert_eq!(items[3].kind, ItemKind::Numbered);
        assert_eq!(items[3].parent, None);
        assert_eq!(items[4].description, "Publish");
        assert_eq!(items[5].kind, ItemKind::Bullet);
        assert_eq!(items[5].section.as_deref(), Some("Later"));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let err = parse_todo("- [ ] **2.1: a**\n- [ ] **2.1: b**\n").unwrap_err();
        assert!(err.to_string().contains("duplicate task id 2.1"));
    }

    #[test]
    fn missing_file_is_a_configuration_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = load_todo(&temp.path().join("TODO.md")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RunHalt>(),
            Some(RunHalt::Configuration(_))
        ));
    }

    /// Marking done normalizes to a checked checkbox and touches nothing else.
    #[test]
    fn mark_done_rewrites_only_the_target_line() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("TODO.md");
        let original = "# T\r\n- [ ] first\r\n  1. second\r\ntrailing text";
        fs::write(&path, original).expect("write");

        mark_done(&path, 3, "second").expect("mark");
        let updated = fs::read_to_string(&path).expect("read");
        assert_eq!(updated, "# T\r\n- [ ] first\r\n  - [x] second\r\ntrailing text");

        mark_done(&path, 2, "first").expect("mark");
        let items = parse_todo(&fs::read_to_string(&path).expect("read")).expect("parse");
        assert!(items.iter().all(|i| i.checked));
    }

    /// A shifted file is handled by falling back to a description match.
    #[test]
    fn mark_done_follows_shifted_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("TODO.md");
        fs::write(&path, "# Notes added by agent\n\n- [ ] target\n").expect("write");
        mark_done(&path, 1, "target").expect("mark");
        assert_eq!(
            fs::read_to_string(&path).expect("read"),
            "# Notes added by agent\n\n- [x] target\n"
        );
        assert!(mark_done(&path, 1, "gone").is_err());
    }

    #[test]
    fn ensure_pending_unchecks_agent_marks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("TODO.md");
        fs::write(&path, "- [x] done by agent\n- [ ] other\n").expect("write");

        assert!(ensure_pending(&path, 1, "done by agent").expect("reset"));
        assert!(!ensure_pending(&path, 1, "done by agent").expect("noop"));
        assert_eq!(
            fs::read_to_string(&path).expect("read"),
            "- [ ] done by agent\n- [ ] other\n"
        );
    }
}
