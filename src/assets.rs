//! Filesystem helpers for the copy, clean and vendor tasks.

use std::fs;
use std::io;
use std::sync::LazyLock;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;

use crate::utils::as_overhead;

fn invalid_pattern(e: glob::PatternError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, e)
}

/// The part of a glob before the first component holding a wildcard.
///
/// `js/app/**/*.js` gives `js/app`; a glob without wildcards is its own
/// base.
pub fn glob_base(pattern: &str) -> Utf8PathBuf {
    let path = Utf8Path::new(pattern.strip_prefix("./").unwrap_or(pattern));

    path.components()
        .take_while(|c| !c.as_str().contains(['*', '?', '[']))
        .collect()
}

/// Expands project-relative globs below `root` into a sorted list of
/// project-relative files. A file matching any of `exclude` is left out.
pub fn expand(root: &Utf8Path, include: &[String], exclude: &[String]) -> io::Result<Vec<Utf8PathBuf>> {
    let exclude = exclude
        .iter()
        .map(|p| Pattern::new(p.strip_prefix("./").unwrap_or(p)))
        .collect::<Result<Vec<_>, _>>()
        .map_err(invalid_pattern)?;

    let mut found = vec![];

    for pattern in include {
        let pattern = pattern.strip_prefix("./").unwrap_or(pattern);
        let full = root.join(pattern);
        let paths = glob::glob(full.as_str()).map_err(invalid_pattern)?;

        for path in paths {
            let path = path.map_err(glob::GlobError::into_error)?;
            let Ok(path) = Utf8PathBuf::try_from(path) else {
                continue;
            };
            if !path.is_file() {
                continue;
            }

            let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
            if exclude.iter().any(|p| p.matches_path(relative.as_std_path())) {
                continue;
            }
            found.push(relative);
        }
    }

    found.sort();
    found.dedup();
    Ok(found)
}

/// Copies every file matched by `pattern` into `dest`, keeping the directory
/// layout below the pattern's static base. Returns the number of files
/// copied.
pub fn copy(root: &Utf8Path, pattern: &str, dest: &Utf8Path) -> io::Result<usize> {
    let s = Instant::now();
    let base = glob_base(pattern);
    let files = expand(root, &[pattern.to_string()], &[])?;

    for file in &files {
        let relative = match file.strip_prefix(&base) {
            Ok(rel) if !rel.as_str().is_empty() => rel,
            _ => Utf8Path::new(file.file_name().unwrap_or(file.as_str())),
        };
        let target = dest.join(relative);

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(root.join(file), &target)?;
    }

    tracing::debug!(pattern, %dest, count = files.len(), "copied {}", as_overhead(s));
    Ok(files.len())
}

/// Removes the entries directly inside `dir` whose names match any of
/// `remove` and none of `keep`. Returns the number of removed entries. A
/// missing directory counts as clean.
pub fn clean(dir: &Utf8Path, remove: &[&str], keep: &[&str]) -> io::Result<usize> {
    let compile = |patterns: &[&str]| {
        patterns
            .iter()
            .map(|p| Pattern::new(p))
            .collect::<Result<Vec<_>, _>>()
            .map_err(invalid_pattern)
    };
    let remove = compile(remove)?;
    let keep = compile(keep)?;

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };

        if !remove.iter().any(|p| p.matches(name)) || keep.iter().any(|p| p.matches(name)) {
            continue;
        }

        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
        removed += 1;
    }

    Ok(removed)
}

/// Deletes a directory with everything in it, if it exists.
pub fn remove_dir(dir: &Utf8Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

static SOURCE_MAP_COMMENT: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?m)^//# sourceMappingURL=.*$\n?").expect("valid source map pattern")
});

/// Concatenates third-party scripts in the given order. Each script is
/// closed with a `;` so that files without a trailing semicolon can't run
/// into the next one, and stale `sourceMappingURL` comments are dropped.
pub fn concat_scripts(root: &Utf8Path, sources: &[Utf8PathBuf]) -> io::Result<String> {
    let mut out = String::new();

    for source in sources {
        let path = root.join(source);
        let text = fs::read_to_string(&path)
            .map_err(|e| io::Error::new(e.kind(), format!("{path}: {e}")))?;

        out.push_str(&format!("/* {source} */\n"));
        out.push_str(&SOURCE_MAP_COMMENT.replace_all(&text, ""));
        if !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(";\n");
    }

    Ok(out)
}
