//! Advisory source checks. Diagnostics are reported but never fail a build.

use std::fmt;
use std::fs;
use std::sync::LazyLock;

use camino::{Utf8Path, Utf8PathBuf};
use console::style;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub path: Utf8PathBuf,
    /// One based.
    pub line: usize,
    /// One based, in characters.
    pub column: usize,
    pub rule: &'static str,
    pub message: String,
    pub severity: Severity,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = match self.severity {
            Severity::Warning => style(self.rule).yellow(),
            Severity::Error => style(self.rule).red(),
        };
        write!(
            f,
            "{}:{}:{} {} {}",
            self.path, self.line, self.column, rule, self.message
        )
    }
}

/// A set of rules applied to one file at a time.
pub trait Checker: Send + Sync {
    fn name(&self) -> &'static str;

    fn check_text(&self, path: &Utf8Path, text: &str, out: &mut Vec<Diagnostic>);
}

/// Runs `checker` over `paths` (relative to `root`) in parallel. Files that
/// can't be read are reported as diagnostics too.
pub fn check(root: &Utf8Path, paths: &[Utf8PathBuf], checker: &dyn Checker) -> Vec<Diagnostic> {
    let mut diagnostics: Vec<Diagnostic> = paths
        .par_iter()
        .flat_map_iter(|path| {
            let mut out = vec![];
            match fs::read_to_string(root.join(path)) {
                Ok(text) => checker.check_text(path, &text, &mut out),
                Err(e) => out.push(Diagnostic {
                    path: path.clone(),
                    line: 0,
                    column: 0,
                    rule: "unreadable",
                    message: e.to_string(),
                    severity: Severity::Error,
                }),
            }
            out
        })
        .collect();

    diagnostics.sort_by(|a, b| (&a.path, a.line, a.column).cmp(&(&b.path, b.line, b.column)));
    diagnostics
}

static DEBUGGER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bdebugger\b").expect("valid debugger pattern"));

static CONSOLE_LOG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bconsole\.log\s*\(").expect("valid console pattern"));

static LOOSE_EQ: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^=!<>])(==|!=)(?:[^=]|$)").expect("valid equality pattern")
});

/// Suspicious code: leftover `debugger` statements, `console.log` calls and
/// loose equality.
#[derive(Debug, Default, Clone, Copy)]
pub struct Lint;

impl Checker for Lint {
    fn name(&self) -> &'static str {
        "lint"
    }

    fn check_text(&self, path: &Utf8Path, text: &str, out: &mut Vec<Diagnostic>) {
        for (index, line) in text.lines().enumerate() {
            let code = strip_line_comment(line);
            let mut push = |start: usize, rule, message: &str, severity| {
                out.push(Diagnostic {
                    path: path.to_path_buf(),
                    line: index + 1,
                    column: line[..start].chars().count() + 1,
                    rule,
                    message: message.to_string(),
                    severity,
                })
            };

            if let Some(m) = DEBUGGER.find(code) {
                push(m.start(), "no-debugger", "unexpected 'debugger' statement", Severity::Error);
            }
            if let Some(m) = CONSOLE_LOG.find(code) {
                push(m.start(), "no-console", "unexpected 'console.log' call", Severity::Warning);
            }
            for caps in LOOSE_EQ.captures_iter(code) {
                if let Some(op) = caps.get(1) {
                    let message = format!("expected '{}=' and instead saw '{}'", op.as_str(), op.as_str());
                    push(op.start(), "eqeqeq", &message, Severity::Warning);
                }
            }
        }
    }
}

/// Formatting: trailing whitespace, tab indentation, overlong lines and a
/// missing final newline.
#[derive(Debug, Clone, Copy)]
pub struct Checkstyle {
    pub max_line_length: usize,
}

impl Default for Checkstyle {
    fn default() -> Self {
        Self {
            max_line_length: 120,
        }
    }
}

impl Checker for Checkstyle {
    fn name(&self) -> &'static str {
        "checkstyle"
    }

    fn check_text(&self, path: &Utf8Path, text: &str, out: &mut Vec<Diagnostic>) {
        let mut push = |line: usize, column: usize, rule, message: String| {
            out.push(Diagnostic {
                path: path.to_path_buf(),
                line,
                column,
                rule,
                message,
                severity: Severity::Warning,
            })
        };

        let mut last = 0;
        for (index, line) in text.lines().enumerate() {
            last = index + 1;

            let trimmed = line.trim_end();
            if trimmed.len() != line.len() {
                push(
                    last,
                    trimmed.chars().count() + 1,
                    "no-trailing-whitespace",
                    "trailing whitespace".into(),
                );
            }

            let indent = &line[..line.len() - line.trim_start().len()];
            if indent.contains('\t') {
                push(last, 1, "no-tabs", "indentation uses tabs".into());
            }

            let length = line.chars().count();
            if length > self.max_line_length {
                push(
                    last,
                    self.max_line_length + 1,
                    "max-line-length",
                    format!("line is {length} characters long, limit is {}", self.max_line_length),
                );
            }
        }

        if !text.is_empty() && !text.ends_with('\n') {
            push(last, 1, "eol-last", "missing newline at end of file".into());
        }
    }
}

/// Cuts a `//` comment off a line, ignoring slashes inside string literals.
fn strip_line_comment(line: &str) -> &str {
    let mut quote = None;
    let mut escaped = false;
    let mut prev = '\0';

    for (i, c) in line.char_indices() {
        match quote {
            Some(q) => {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                }
            }
            None => {
                if c == '/' && prev == '/' {
                    return &line[..i - 1];
                }
                if matches!(c, '\'' | '"' | '`') {
                    quote = Some(c);
                }
            }
        }
        prev = c;
    }

    line
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(checker: &dyn Checker, text: &str) -> Vec<(usize, usize, &'static str)> {
        let mut out = vec![];
        checker.check_text(Utf8Path::new("app.js"), text, &mut out);
        out.into_iter().map(|d| (d.line, d.column, d.rule)).collect()
    }

    #[test]
    fn lint_flags_suspicious_code() {
        let text = "if (a == b) {\n  debugger;\n  console.log(a);\n}\nif (a === b && c !== d) {}\n";
        assert_eq!(
            run(&Lint, text),
            vec![(1, 7, "eqeqeq"), (2, 3, "no-debugger"), (3, 3, "no-console")]
        );
    }

    #[test]
    fn lint_ignores_comments() {
        let text = "var url = 'http://x'; // debugger\n// console.log(x)\n";
        assert!(run(&Lint, text).is_empty());
    }

    #[test]
    fn checkstyle_flags_formatting() {
        let checker = Checkstyle { max_line_length: 12 };
        let text = "var a = 1;  \n\tvar b;\nvar long_name = 1;\nend";
        assert_eq!(
            run(&checker, text),
            vec![
                (1, 11, "no-trailing-whitespace"),
                (2, 1, "no-tabs"),
                (3, 13, "max-line-length"),
                (4, 1, "eol-last"),
            ]
        );
    }

    #[test]
    fn check_reads_files_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        fs::write(root.join("b.js"), "debugger;\n").unwrap();
        fs::write(root.join("a.js"), "x == y;\n").unwrap();

        let paths: Vec<Utf8PathBuf> = vec!["b.js".into(), "a.js".into(), "missing.js".into()];
        let diagnostics = check(&root, &paths, &Lint);

        let summary: Vec<_> = diagnostics
            .iter()
            .map(|d| (d.path.as_str(), d.rule))
            .collect();
        assert_eq!(
            summary,
            vec![("a.js", "eqeqeq"), ("b.js", "no-debugger"), ("missing.js", "unreadable")]
        );
    }
}
