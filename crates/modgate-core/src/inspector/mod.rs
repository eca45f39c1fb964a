//! Static inspection of candidate source.
//!
//! Each `.py` file of a candidate is tokenized and walked; imports, dotted
//! references and call sites are compared against the fixed rule table in
//! [`rules`]. A candidate passes only when nothing reaches the failure
//! threshold and the required entry points are defined at module level.

pub mod analysis;
pub mod lexer;
pub mod rules;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::domain::candidate::list_relative_files;
use analysis::{analyze, Analysis, ArgValue};
use lexer::tokenize;
pub use rules::IssueCategory;

/// Entry points every candidate must define.
pub const REQUIRED_ENTRY_POINTS: [&str; 3] = ["init", "execute", "cleanup"];

/// Issues at or above this severity always fail inspection.
pub const HARD_FAIL_SEVERITY: u8 = 7;
const STRICT_FAIL_SEVERITY: u8 = 5;
const COMPLEXITY_LIMIT: usize = 20;

#[derive(Debug, Error)]
pub enum InspectError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no source files under {0}")]
    NoSources(PathBuf),
}

pub type InspectResult<T> = std::result::Result<T, InspectError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectionIssue {
    pub rule: String,
    pub severity: u8,
    pub category: IssueCategory,
    pub file: String,
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl fmt::Display for InspectionIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}: [{} severity {}] {}",
            self.file, self.line, self.column, self.rule, self.severity, self.message
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectionMetrics {
    pub lines: usize,
    pub functions: usize,
    pub imports: usize,
    pub classes: usize,
    pub max_depth: usize,
    pub complexity: usize,
}

impl InspectionMetrics {
    fn absorb(&mut self, other: &InspectionMetrics) {
        self.lines += other.lines;
        self.functions += other.functions;
        self.imports += other.imports;
        self.classes += other.classes;
        self.max_depth = self.max_depth.max(other.max_depth);
        self.complexity += other.complexity;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectionReport {
    pub ok: bool,
    pub issues: Vec<InspectionIssue>,
    pub metrics: InspectionMetrics,
    /// Required entry point name to the file defining it.
    pub entry_points: BTreeMap<String, String>,
    pub max_severity: u8,
    /// Quality score in `0..=100`.
    pub score: f64,
    pub files: Vec<String>,
}

impl InspectionReport {
    pub fn issue_messages(&self) -> Vec<String> {
        self.issues.iter().map(ToString::to_string).collect()
    }

    pub fn has_syntax_error(&self) -> bool {
        self.issues.iter().any(|i| i.category == IssueCategory::Syntax)
    }

    /// File that defines `execute`, used as the sandbox entry file.
    pub fn entry_file(&self) -> Option<&str> {
        self.entry_points.get("execute").map(String::as_str)
    }
}

/// Per-file result before aggregation.
#[derive(Debug, Clone, Default)]
pub struct FileReport {
    pub issues: Vec<InspectionIssue>,
    pub metrics: InspectionMetrics,
    pub top_level_functions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectorConfig {
    /// Failure threshold; clamped so severity 7 always fails.
    pub fail_threshold: u8,
    pub strict: bool,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            fail_threshold: HARD_FAIL_SEVERITY,
            strict: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Inspector {
    config: InspectorConfig,
}

impl Inspector {
    pub fn new(config: InspectorConfig) -> Self {
        Self { config }
    }

    pub fn strict() -> Self {
        Self::new(InspectorConfig {
            strict: true,
            ..InspectorConfig::default()
        })
    }

    pub fn threshold(&self) -> u8 {
        let base = self.config.fail_threshold.clamp(1, HARD_FAIL_SEVERITY);
        if self.config.strict {
            base.min(STRICT_FAIL_SEVERITY)
        } else {
            base
        }
    }

    /// Inspect a candidate directory (every `.py` file, sorted) or one file.
    pub fn inspect(&self, candidate: &Path) -> InspectResult<InspectionReport> {
        let io_err = |source| InspectError::Io {
            path: candidate.to_path_buf(),
            source,
        };
        let sources: Vec<(String, PathBuf)> = if candidate.is_dir() {
            list_relative_files(candidate)
                .map_err(io_err)?
                .into_iter()
                .filter(|p| p.ends_with(".py"))
                .map(|p| {
                    let full = candidate.join(&p);
                    (p, full)
                })
                .collect()
        } else if candidate.is_file() {
            let name = candidate
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            vec![(name, candidate.to_path_buf())]
        } else {
            return Err(io_err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "candidate path does not exist",
            )));
        };
        if sources.is_empty() {
            return Err(InspectError::NoSources(candidate.to_path_buf()));
        }

        let mut files = Vec::with_capacity(sources.len());
        for (name, path) in sources {
            let bytes = std::fs::read(&path).map_err(|source| InspectError::Io {
                path: path.clone(),
                source,
            })?;
            files.push((name, String::from_utf8_lossy(&bytes).into_owned()));
        }
        Ok(self.inspect_sources(&files))
    }

    /// Inspect in-memory `(file name, source)` pairs.
    pub fn inspect_sources(&self, files: &[(String, String)]) -> InspectionReport {
        let mut issues = Vec::new();
        let mut metrics = InspectionMetrics::default();
        let mut entry_points = BTreeMap::new();

        for (name, source) in files {
            let report = inspect_file(name, source);
            metrics.absorb(&report.metrics);
            for func in &report.top_level_functions {
                if REQUIRED_ENTRY_POINTS.contains(&func.as_str()) {
                    entry_points
                        .entry(func.clone())
                        .or_insert_with(|| name.clone());
                }
            }
            issues.extend(report.issues);
        }

        let syntax_failed = issues.iter().any(|i| i.category == IssueCategory::Syntax);
        if !syntax_failed {
            for required in REQUIRED_ENTRY_POINTS {
                if !entry_points.contains_key(required) {
                    issues.push(InspectionIssue {
                        rule: "missing_entry_point".into(),
                        severity: rules::MISSING_ENTRY_POINT_SEVERITY,
                        category: IssueCategory::Structure,
                        file: String::new(),
                        line: 0,
                        column: 0,
                        message: format!("required entry point `{required}` is not defined"),
                    });
                }
            }
        }

        issues.sort_by(|a, b| {
            (&a.file, a.line, a.column, &a.rule).cmp(&(&b.file, b.line, b.column, &b.rule))
        });

        let max_severity = issues.iter().map(|i| i.severity).max().unwrap_or(0);
        let all_entry_points = REQUIRED_ENTRY_POINTS
            .iter()
            .all(|e| entry_points.contains_key(*e));
        let ok = !syntax_failed && all_entry_points && max_severity < self.threshold();
        let score = quality_score(&issues, &metrics);

        debug!(
            files = files.len(),
            issues = issues.len(),
            max_severity,
            ok,
            "inspection finished"
        );

        InspectionReport {
            ok,
            issues,
            metrics,
            entry_points,
            max_severity,
            score,
            files: files.iter().map(|(n, _)| n.clone()).collect(),
        }
    }
}

/// Inspect one file. Syntax errors become a severity-10 issue.
pub fn inspect_file(name: &str, source: &str) -> FileReport {
    let mut report = FileReport {
        metrics: InspectionMetrics {
            lines: source.lines().count(),
            ..InspectionMetrics::default()
        },
        ..FileReport::default()
    };

    let analysis = match tokenize(source).and_then(|tokens| analyze(&tokens)) {
        Ok(a) => a,
        Err(err) => {
            report.issues.push(InspectionIssue {
                rule: "syntax_error".into(),
                severity: rules::SYNTAX_ERROR_SEVERITY,
                category: IssueCategory::Syntax,
                file: name.to_string(),
                line: err.line,
                column: err.col,
                message: format!("syntax error: {}", err.message),
            });
            return report;
        }
    };

    report.metrics.functions = analysis.functions.len();
    report.metrics.imports = analysis.imports.len();
    report.metrics.classes = analysis.classes;
    report.metrics.max_depth = analysis.max_depth;
    report.metrics.complexity = analysis.complexity;
    report.top_level_functions = analysis.top_level_functions().map(String::from).collect();
    report.issues = rule_issues(name, &analysis);
    report
}

fn rule_issues(file: &str, analysis: &Analysis) -> Vec<InspectionIssue> {
    let mut issues = Vec::new();
    let mut push = |rule: &str, severity, category: IssueCategory, line, column, message: String| {
        issues.push(InspectionIssue {
            rule: rule.to_string(),
            severity,
            category,
            file: file.to_string(),
            line,
            column,
            message,
        })
    };

    for import in &analysis.imports {
        if let Some(rule) = rules::match_import(&import.module) {
            push(
                rule.id,
                rule.severity,
                rule.category,
                import.line,
                import.col,
                format!("import of `{}` ({})", import.module, rule.category.label()),
            );
        }
    }

    for reference in &analysis.references {
        let open_mode = rules::open_mode_position(&reference.target).filter(|_| reference.is_call);
        if let Some(position) = open_mode {
            // A mode computed at runtime may be a writing one.
            let writes = match reference.mode_kwarg.as_ref().or(reference.positional.get(position)) {
                Some(ArgValue::Literal(mode)) => rules::is_write_mode(mode),
                Some(ArgValue::Dynamic) => true,
                None => false,
            };
            let (rule, severity, what) = if writes {
                ("open_write", rules::OPEN_WRITE_SEVERITY, "write mode")
            } else {
                ("open_read", rules::OPEN_READ_SEVERITY, "read mode")
            };
            push(
                rule,
                severity,
                IssueCategory::Filesystem,
                reference.line,
                reference.col,
                format!("call to `{}` in {what} (filesystem access)", reference.target),
            );
            continue;
        }
        if let Some(rule) = rules::match_reference(&reference.target, reference.is_call) {
            let verb = if reference.is_call { "call to" } else { "reference to" };
            push(
                rule.id,
                rule.severity,
                rule.category,
                reference.line,
                reference.col,
                format!("{verb} `{}` ({})", reference.target, rule.category.label()),
            );
        }
    }

    for marker in &analysis.bare_excepts {
        push(
            "bare_except",
            rules::BARE_EXCEPT_SEVERITY,
            IssueCategory::Quality,
            marker.line,
            marker.col,
            "bare `except:` swallows every exception".into(),
        );
    }
    for marker in &analysis.secrets {
        push(
            "hardcoded_secret",
            rules::HARDCODED_SECRET_SEVERITY,
            IssueCategory::Secret,
            marker.line,
            marker.col,
            format!("`{}` is assigned a literal secret", marker.text),
        );
    }
    if analysis.complexity > COMPLEXITY_LIMIT {
        push(
            "high_complexity",
            rules::HIGH_COMPLEXITY_SEVERITY,
            IssueCategory::Quality,
            1,
            1,
            format!(
                "branch complexity {} exceeds {COMPLEXITY_LIMIT}",
                analysis.complexity
            ),
        );
    }
    issues
}

fn quality_score(issues: &[InspectionIssue], metrics: &InspectionMetrics) -> f64 {
    let mut score = 100.0;
    for issue in issues {
        score -= match issue.severity {
            9..=10 => 20.0,
            7..=8 => 10.0,
            5..=6 => 5.0,
            3..=4 => 2.0,
            _ => 1.0,
        };
    }
    if metrics.complexity > COMPLEXITY_LIMIT {
        score -= (metrics.complexity - COMPLEXITY_LIMIT) as f64 * 0.5;
    }
    f64::clamp(score, 0.0, 100.0)
}
