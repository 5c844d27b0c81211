//! Instruction payload builder.
//!
//! The template marks sections with `<!-- section:KEY required|droppable -->`.
//! When the rendered payload exceeds the byte budget, droppable sections are
//! removed in a fixed order before anything is truncated.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::task::Task;

const TASK_TEMPLATE: &str = include_str!("prompts/task.md");

/// Sections dropped first when over budget.
const DROP_ORDER: [&str; 3] = ["dod", "failure", "approach"];

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("section regex")
});

#[derive(Debug, Clone, Serialize)]
struct TaskContext<'a> {
    description: &'a str,
    line_number: usize,
    section: Option<&'a str>,
    parent: Option<&'a str>,
    attempt: u32,
}

/// Everything the task template needs.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub task: &'a Task,
    /// TODO path as shown to the agent.
    pub todo_file: &'a str,
    /// Diagnostics from the previous failed attempt.
    pub failure: Option<&'a str>,
    /// Definition-of-Done criteria text.
    pub dod: Option<&'a str>,
}

#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<Section> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(Section {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn total_len(sections: &[Section]) -> usize {
    sections.iter().map(|s| s.content.len()).sum()
}

fn apply_budget(sections: &mut Vec<Section>, budget: usize) {
    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    let total = total_len(sections);
    if total <= budget {
        return;
    }
    let Some(last) = sections.last_mut() else {
        return;
    };
    let others = total - last.content.len();
    let allowed = budget.saturating_sub(others);
    let marker = "\n[truncated]";
    let mut cut = allowed.saturating_sub(marker.len());
    while !last.content.is_char_boundary(cut) {
        cut -= 1;
    }
    debug!(
        section = %last.key,
        before = last.content.len(),
        after = cut,
        "truncated section for budget"
    );
    last.content.truncate(cut);
    last.content.push_str(marker);
}

/// Builds the task payload within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
    max_approaches: u32,
    max_attempts: u32,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize, max_approaches: u32, max_attempts: u32) -> Self {
        Self {
            budget_bytes,
            max_approaches,
            max_attempts,
        }
    }

    pub fn build(&self, input: &PromptInputs<'_>) -> Result<String> {
        let mut env = Environment::new();
        env.add_template("task", TASK_TEMPLATE)
            .context("register task template")?;
        let task = TaskContext {
            description: &input.task.description,
            line_number: input.task.line_number,
            section: input.task.section.as_deref(),
            parent: input.task.parent.as_deref(),
            attempt: input.task.attempt,
        };
        let rendered = env
            .get_template("task")
            .and_then(|template| {
                template.render(context! {
                    task => task,
                    todo_file => input.todo_file,
                    approach => input.task.approach,
                    max_approaches => self.max_approaches,
                    max_attempts => self.max_attempts,
                    failure => input.failure.map(str::trim).filter(|s| !s.is_empty()),
                    dod => input.dod.map(str::trim).filter(|s| !s.is_empty()),
                })
            })
            .context("render task template")?;

        let mut sections = parse_sections(&rendered);
        apply_budget(&mut sections, self.budget_bytes);
        let mut out = sections
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        out.push('\n');
        Ok(out)
    }
}
