//! Definition-of-Done gate.
//!
//! The [`Validator`] trait decouples the loop from how completion is judged.
//! [`CommandValidator`] runs every configured check (no short-circuit) and an
//! optional criteria-file check, then writes a combined `dod.log`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::core::classify::tail;
use crate::core::types::ValidationResult;
use crate::io::config::{DodCheck, DodConfig};
use crate::io::interrupt::{CallGuard, CancelToken};
use crate::io::process::{CommandOutput, RunOptions, SpawnError, run_guarded};
use crate::looping::RunHalt;

/// Name of the check that verifies the criteria file.
pub const CRITERIA_CHECK: &str = "DoD Criteria Loaded";

/// Locations searched for a criteria file when none is configured.
pub const CRITERIA_CANDIDATES: [&str; 3] = [
    "docs/definition-of-done.md",
    ".taskloop/definition-of-done.md",
    "definition-of-done.md",
];

const DIAGNOSTIC_TAIL: usize = 2_000;

#[derive(Debug, Clone)]
pub struct ValidationRequest<'a> {
    pub workdir: &'a Path,
    pub task_id: &'a str,
    /// Backend whose completion is being judged.
    pub backend: &'a str,
    pub log_path: &'a Path,
    pub token: &'a CancelToken,
}

pub trait Validator {
    /// Judge a completion. An operator interrupt surfaces as `Err(RunHalt::Interrupted)`.
    fn validate(&self, request: &ValidationRequest<'_>) -> Result<ValidationResult>;
}

/// Parsed criteria file: `## ` headings with `- ` items beneath them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Criteria {
    pub path: PathBuf,
    pub text: String,
    pub item_count: usize,
}

/// Resolve the criteria file: the configured one, else the first candidate that exists.
pub fn criteria_path(root: &Path, config: &DodConfig) -> Option<PathBuf> {
    if let Some(path) = &config.criteria_file {
        return Some(root.join(path));
    }
    CRITERIA_CANDIDATES
        .iter()
        .map(|candidate| root.join(candidate))
        .find(|path| path.is_file())
}

/// Read and parse a criteria file. A missing file reads as `None`.
pub fn load_criteria(path: &Path) -> Result<Option<Criteria>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(path)
        .with_context(|| format!("read criteria file {}", path.display()))?;
    let item_count = count_criteria_items(&text);
    Ok(Some(Criteria {
        path: path.to_path_buf(),
        text,
        item_count,
    }))
}

/// Count `- ` items that sit under a `## ` heading.
pub fn count_criteria_items(text: &str) -> usize {
    static HEADING_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^##\s+\S").expect("heading regex"));
    static ITEM_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^\s*-\s+\S").expect("item regex"));

    let mut in_section = false;
    let mut count = 0;
    for line in text.lines() {
        if HEADING_RE.is_match(line) {
            in_section = true;
        } else if line.starts_with('#') {
            in_section = false;
        } else if in_section && ITEM_RE.is_match(line) {
            count += 1;
        }
    }
    count
}

/// Runs configured checks as external commands in the workspace.
#[derive(Debug, Clone)]
pub struct CommandValidator {
    checks: Vec<DodCheck>,
    criteria_file: Option<PathBuf>,
    output_limit_bytes: usize,
}

impl CommandValidator {
    pub fn new(root: &Path, config: &DodConfig, output_limit_bytes: usize) -> Self {
        Self {
            checks: config.checks.clone(),
            criteria_file: criteria_path(root, config),
            output_limit_bytes,
        }
    }
}

impl Validator for CommandValidator {
    #[instrument(skip_all, fields(task_id = request.task_id, backend = request.backend))]
    fn validate(&self, request: &ValidationRequest<'_>) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();
        let mut log = String::new();

        if let Some(path) = &self.criteria_file {
            result.checks_run.push(CRITERIA_CHECK.to_string());
            let problem = match load_criteria(path)? {
                None => Some(format!("criteria file {} not found", path.display())),
                Some(criteria) if criteria.item_count == 0 => Some(format!(
                    "criteria file {} has no `- ` items under `## ` headings",
                    criteria.path.display()
                )),
                Some(_) => None,
            };
            log.push_str(&format!("=== {CRITERIA_CHECK} ===\n"));
            match problem {
                Some(diag) => {
                    log.push_str(&format!("FAIL: {diag}\n\n"));
                    result.failed.push(CRITERIA_CHECK.to_string());
                    result.diagnostics.push(diag);
                    result.suggestions.push(
                        "Ensure definition-of-done.md exists and has checklist items".to_string(),
                    );
                }
                None => log.push_str(&format!("PASS: {}\n\n", path.display())),
            }
        }

        for check in &self.checks {
            result.checks_run.push(check.name.clone());
            let verdict = run_check(check, request, self.output_limit_bytes)?;
            log.push_str(&format!("=== {} ===\n$ {}\n", check.name, check.command.join(" ")));
            log.push_str(&verdict.log);
            log.push('\n');
            if let Some(diag) = verdict.failure {
                warn!(check = %check.name, "dod check failed");
                result.failed.push(check.name.clone());
                result.diagnostics.push(diag);
                if let Some(suggestion) = &check.suggestion {
                    result.suggestions.push(suggestion.clone());
                }
            } else {
                debug!(check = %check.name, "dod check passed");
            }
        }

        result.passed = result.failed.is_empty();
        write_dod_log(request.log_path, &log, self.output_limit_bytes)?;
        info!(
            passed = result.passed,
            checks = result.checks_run.len(),
            failed = result.failed.len(),
            "validation finished"
        );
        Ok(result)
    }
}

struct CheckVerdict {
    failure: Option<String>,
    log: String,
}

fn run_check(
    check: &DodCheck,
    request: &ValidationRequest<'_>,
    output_limit_bytes: usize,
) -> Result<CheckVerdict> {
    let Some((program, args)) = check.command.split_first() else {
        return Ok(CheckVerdict {
            failure: Some(format!("{}: empty command", check.name)),
            log: "empty command\n".to_string(),
        });
    };
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(request.workdir);
    let timeout = Duration::from_secs(check.timeout_secs);
    let guard = CallGuard::new(request.token.clone(), timeout);

    let output = match run_guarded(cmd, RunOptions::capture(output_limit_bytes), &guard) {
        Ok(output) => output,
        Err(err) => {
            let Some(spawn) = err.downcast_ref::<SpawnError>() else {
                return Err(err.context(format!("run dod check {}", check.name)));
            };
            let diag = format!("{}: {spawn}", check.name);
            return Ok(CheckVerdict {
                log: format!("{diag}\n"),
                failure: Some(diag),
            });
        }
    };

    if output.interrupted() {
        return Err(RunHalt::Interrupted {
            task_id: request.task_id.to_string(),
        }
        .into());
    }

    let combined = combined_output(&output);
    let failure = if output.timed_out() {
        Some(format!(
            "{}: timed out after {}s\n{}",
            check.name,
            timeout.as_secs(),
            tail(&combined, DIAGNOSTIC_TAIL).trim()
        ))
    } else if output.status.success() {
        None
    } else {
        Some(format!(
            "{}: exit status {:?}\n{}",
            check.name,
            output.status.code(),
            tail(&combined, DIAGNOSTIC_TAIL).trim()
        ))
    };
    let status_line = match (&failure, output.timed_out()) {
        (None, _) => "PASS\n".to_string(),
        (Some(_), true) => "FAIL (timed out)\n".to_string(),
        (Some(_), false) => format!("FAIL (exit {:?})\n", output.status.code()),
    };
    Ok(CheckVerdict {
        failure,
        log: format!("{combined}\n{status_line}"),
    })
}

fn combined_output(output: &CommandOutput) -> String {
    let mut text = output.stdout_lossy();
    text.push_str(&output.stdout_truncated_notice("check"));
    let stderr = output.stderr_lossy();
    if !stderr.is_empty() {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&stderr);
    }
    text.push_str(&output.stderr_truncated_notice("check"));
    text
}

fn write_dod_log(path: &Path, log: &str, limit: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create dod log dir {}", parent.display()))?;
    }
    let contents = if log.len() > limit {
        let mut cut = limit;
        while !log.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}\n[truncated {} bytes]\n", &log[..cut], log.len() - cut)
    } else {
        log.to_string()
    };
    fs::write(path, contents).with_context(|| format!("write dod log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(name: &str, script: &str) -> DodCheck {
        DodCheck {
            name: name.to_string(),
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            timeout_secs: 5,
            suggestion: Some(format!("fix {name}")),
        }
    }

    fn validator(root: &Path, checks: Vec<DodCheck>, criteria: Option<&str>) -> CommandValidator {
        CommandValidator::new(
            root,
            &DodConfig {
                criteria_file: criteria.map(PathBuf::from),
                checks,
            },
            10_000,
        )
    }

    fn validate(root: &Path, v: &CommandValidator) -> Result<ValidationResult> {
        let token = CancelToken::new();
        let log_path = root.join("attempt").join("dod.log");
        v.validate(&ValidationRequest {
            workdir: root,
            task_id: "1.1",
            backend: "codex",
            log_path: &log_path,
            token: &token,
        })
    }

    /// Verifies every check runs even after one fails, in order.
    #[test]
    fn all_checks_run_without_short_circuit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let v = validator(
            temp.path(),
            vec![
                check("lint", "echo lint broke >&2; exit 1"),
                check("tests", "echo ok"),
                check("fmt", "exit 3"),
            ],
            None,
        );

        let result = validate(temp.path(), &v).expect("validate");
        assert!(!result.passed);
        assert_eq!(result.checks_run, ["lint", "tests", "fmt"]);
        assert_eq!(result.failed, ["lint", "fmt"]);
        assert!(result.diagnostics[0].contains("lint broke"));
        assert_eq!(result.suggestions, ["fix lint", "fix fmt"]);

        let log = fs::read_to_string(temp.path().join("attempt").join("dod.log")).expect("log");
        assert!(log.contains("=== tests ==="));
        assert!(log.contains("FAIL (exit Some(3))"));
    }

    #[test]
    fn passing_checks_pass() {
        let temp = tempfile::tempdir().expect("tempdir");
        let v = validator(temp.path(), vec![check("tests", "true")], None);
        let result = validate(temp.path(), &v).expect("validate");
        assert!(result.passed);
        assert!(result.diagnostics.is_empty());
    }

    /// A check that outlives its timeout fails regardless of output.
    #[test]
    fn timed_out_check_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut slow = check("slow", "echo started; sleep 30");
        slow.timeout_secs = 1;
        let v = validator(temp.path(), vec![slow], None);
        let result = validate(temp.path(), &v).expect("validate");
        assert_eq!(result.failed, ["slow"]);
        assert!(result.diagnostics[0].contains("timed out after 1s"));
    }

    #[test]
    fn missing_check_program_fails_the_check() {
        let temp = tempfile::tempdir().expect("tempdir");
        let v = validator(
            temp.path(),
            vec![DodCheck {
                name: "ghost".to_string(),
                command: vec!["taskloop-no-such-check-xyz".to_string()],
                timeout_secs: 5,
                suggestion: None,
            }],
            None,
        );
        let result = validate(temp.path(), &v).expect("validate");
        assert_eq!(result.failed, ["ghost"]);
        assert!(result.suggestions.is_empty());
    }

    /// Verifies the criteria file needs items under `## ` headings.
    #[test]
    fn criteria_file_must_have_items_under_headings() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("dod.md"), "# Title\n- stray item\n").expect("write");
        let v = validator(temp.path(), Vec::new(), Some("dod.md"));
        let result = validate(temp.path(), &v).expect("validate");
        assert_eq!(result.failed, [CRITERIA_CHECK]);

        fs::write(
            temp.path().join("dod.md"),
            "# Title\n\n## Quality\n- tests pass\n- docs updated\n",
        )
        .expect("write");
        let result = validate(temp.path(), &v).expect("validate");
        assert!(result.passed);
        assert_eq!(result.checks_run, [CRITERIA_CHECK]);
    }

    #[test]
    fn configured_missing_criteria_file_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let v = validator(temp.path(), Vec::new(), Some("nope.md"));
        let result = validate(temp.path(), &v).expect("validate");
        assert!(!result.passed);
        assert!(result.diagnostics[0].contains("not found"));
    }

    #[test]
    fn criteria_candidates_are_searched() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert_eq!(criteria_path(temp.path(), &DodConfig::default()), None);
        fs::create_dir_all(temp.path().join("docs")).expect("mkdir");
        fs::write(
            temp.path().join("docs").join("definition-of-done.md"),
            "## Done\n- shipped\n",
        )
        .expect("write");
        assert_eq!(
            criteria_path(temp.path(), &DodConfig::default()),
            Some(temp.path().join("docs").join("definition-of-done.md"))
        );
    }

    #[test]
    fn items_after_a_top_level_heading_do_not_count() {
        let text = "## A\n- one\n  - nested\n# B\n- outside\n## C\n-not an item\n";
        assert_eq!(count_criteria_items(text), 2);
    }

    /// An interrupt during a check propagates as a halt.
    #[test]
    fn interrupt_during_check_halts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let v = validator(temp.path(), vec![check("slow", "sleep 30")], None);
        let token = CancelToken::new();
        token.cancel();
        let log_path = temp.path().join("dod.log");
        let err = v
            .validate(&ValidationRequest {
                workdir: temp.path(),
                task_id: "7",
                backend: "codex",
                log_path: &log_path,
                token: &token,
            })
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RunHalt>(),
            Some(RunHalt::Interrupted { task_id }) if task_id == "7"
        ));
    }
}
