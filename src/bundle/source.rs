//! Where module text comes from and how import specifiers are resolved.

use std::collections::HashMap;
use std::sync::{LazyLock, RwLock};
use std::{fs, io};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use regex::Regex;

/// Provides module source text by project-relative path.
pub trait ModuleSource: Send + Sync {
    fn read(&self, path: &Utf8Path) -> io::Result<Vec<u8>>;

    fn exists(&self, path: &Utf8Path) -> bool;
}

/// Reads modules from disk below a root directory.
#[derive(Debug, Clone)]
pub struct FsSource {
    root: Utf8PathBuf,
}

impl FsSource {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ModuleSource for FsSource {
    fn read(&self, path: &Utf8Path) -> io::Result<Vec<u8>> {
        fs::read(self.root.join(path))
    }

    fn exists(&self, path: &Utf8Path) -> bool {
        self.root.join(path).is_file()
    }
}

/// An in-memory file tree. Handy for tests and for feeding generated modules
/// to the bundler.
#[derive(Debug, Default)]
pub struct MemorySource {
    files: RwLock<HashMap<Utf8PathBuf, Vec<u8>>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<I, P, T>(files: I) -> Self
    where
        I: IntoIterator<Item = (P, T)>,
        P: Into<Utf8PathBuf>,
        T: Into<Vec<u8>>,
    {
        let source = Self::new();
        for (path, text) in files {
            source.write(path, text);
        }
        source
    }

    pub fn write(&self, path: impl Into<Utf8PathBuf>, text: impl Into<Vec<u8>>) {
        let path = normalize_path(&path.into());
        self.files.write().unwrap().insert(path, text.into());
    }

    pub fn remove(&self, path: impl AsRef<Utf8Path>) {
        self.files.write().unwrap().remove(path.as_ref());
    }
}

impl ModuleSource for MemorySource {
    fn read(&self, path: &Utf8Path) -> io::Result<Vec<u8>> {
        self.files
            .read()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no such module: {path}")))
    }

    fn exists(&self, path: &Utf8Path) -> bool {
        self.files.read().unwrap().contains_key(path)
    }
}

impl<T: ModuleSource + ?Sized> ModuleSource for std::sync::Arc<T> {
    fn read(&self, path: &Utf8Path) -> io::Result<Vec<u8>> {
        (**self).read(path)
    }

    fn exists(&self, path: &Utf8Path) -> bool {
        (**self).exists(path)
    }
}

/// One import found in a module, in source order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    /// The specifier exactly as written.
    pub specifier: String,
    /// Resolved module path, `None` for bare (external) specifiers.
    pub resolved: Option<Utf8PathBuf>,
}

static REQUIRE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\brequire\s*\(\s*['"]([^'"\n]+)['"]\s*\)"#).expect("valid require pattern")
});

static IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*(?:import|export)\s+(?:[\w*{}\s,$]+\s+from\s+)?['"]([^'"\n]+)['"]"#)
        .expect("valid import pattern")
});

/// Whether the module kind can import other modules. Templates can't.
pub fn is_script(path: &Utf8Path) -> bool {
    matches!(path.extension(), Some("js" | "mjs" | "cjs"))
}

/// Finds every import specifier in a script, in order of first appearance.
/// Repeated specifiers are reported once.
pub fn scan_imports(text: &str) -> Vec<String> {
    let mut found: Vec<(usize, &str)> = REQUIRE
        .captures_iter(text)
        .chain(IMPORT.captures_iter(text))
        .filter_map(|caps| caps.get(1))
        .map(|m| (m.start(), m.as_str()))
        .collect();

    found.sort_by_key(|(start, _)| *start);

    let mut specifiers: Vec<String> = Vec::with_capacity(found.len());
    for (_, specifier) in found {
        if !specifiers.iter().any(|s| s == specifier) {
            specifiers.push(specifier.to_string());
        }
    }

    specifiers
}

/// Relative specifiers start with `./` or `../`; everything else is a bare
/// package name resolved outside the bundle.
pub fn is_relative(specifier: &str) -> bool {
    specifier.starts_with("./") || specifier.starts_with("../")
}

/// Resolves a relative specifier against the importing module.
///
/// Tries the specifier as written, then with `.js` and `.html` appended, then
/// as a directory containing `index.js`. Returns `None` when nothing on the
/// candidate list exists. Bare specifiers never resolve, check
/// [`is_relative`] first.
pub fn resolve_specifier(
    source: &dyn ModuleSource,
    importer: &Utf8Path,
    specifier: &str,
) -> Option<Utf8PathBuf> {
    if !is_relative(specifier) {
        return None;
    }

    let base = importer.parent().unwrap_or(Utf8Path::new(""));
    let joined = normalize_path(&base.join(specifier));

    let candidates = [
        joined.clone(),
        Utf8PathBuf::from(format!("{joined}.js")),
        Utf8PathBuf::from(format!("{joined}.html")),
        joined.join("index.js"),
    ];

    candidates
        .into_iter()
        .find(|candidate| source.exists(candidate))
}

/// Normalize a path, removing things like `.` and `..`.
///
/// CAUTION: This does not resolve symlinks (unlike [`std::fs::canonicalize`]).
/// Module keys only ever need to be compared with each other, never with the
/// real location on disk.
pub fn normalize_path(path: &Utf8Path) -> Utf8PathBuf {
    let mut components = path.components().peekable();
    let mut ret = if let Some(c @ Utf8Component::Prefix(..)) = components.peek().cloned() {
        components.next();
        Utf8PathBuf::from(c.as_str())
    } else {
        Utf8PathBuf::new()
    };

    for component in components {
        match component {
            Utf8Component::Prefix(..) => unreachable!(),
            Utf8Component::RootDir => {
                ret.push(Utf8Component::RootDir);
            }
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                if ret.ends_with(Utf8Component::ParentDir) {
                    ret.push(Utf8Component::ParentDir);
                } else {
                    let popped = ret.pop();
                    if !popped && !ret.has_root() {
                        ret.push(Utf8Component::ParentDir);
                    }
                }
            }
            Utf8Component::Normal(c) => {
                ret.push(c);
            }
        }
    }
    ret
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_require_and_import_in_source_order() {
        let text = r#"
import { a } from './a';
var b = require("./b");
export * from "./c";
import './side-effect';
var again = require('./a');
var lib = require('lodash');
"#;
        assert_eq!(
            scan_imports(text),
            vec!["./a", "./b", "./c", "./side-effect", "lodash"]
        );
    }

    #[test]
    fn import_keyword_inside_identifiers_is_ignored() {
        let text = "var reimport = 1;\nvar x = myrequire('./nope');\n";
        assert!(scan_imports(text).is_empty());
    }

    #[test]
    fn resolves_extensions_and_index() {
        let source = MemorySource::with([
            ("js/app/app.js", ""),
            ("js/app/util.js", ""),
            ("js/app/view.html", ""),
            ("js/app/widgets/index.js", ""),
        ]);
        let importer = Utf8Path::new("js/app/app.js");

        assert_eq!(
            resolve_specifier(&source, importer, "./util"),
            Some("js/app/util.js".into())
        );
        assert_eq!(
            resolve_specifier(&source, importer, "./view.html"),
            Some("js/app/view.html".into())
        );
        assert_eq!(
            resolve_specifier(&source, importer, "./view"),
            Some("js/app/view.html".into())
        );
        assert_eq!(
            resolve_specifier(&source, importer, "./widgets"),
            Some("js/app/widgets/index.js".into())
        );
        assert_eq!(resolve_specifier(&source, importer, "angular"), None);
        assert_eq!(resolve_specifier(&source, importer, "./missing"), None);
    }

    #[test]
    fn resolves_parent_directories() {
        let source = MemorySource::with([("js/shared/log.js", "")]);
        assert_eq!(
            resolve_specifier(&source, Utf8Path::new("js/app/app.js"), "../shared/log"),
            Some("js/shared/log.js".into())
        );
    }

    #[test]
    fn normalize_removes_dots() {
        assert_eq!(normalize_path(Utf8Path::new("a/./b/../c.js")), "a/c.js");
        assert_eq!(normalize_path(Utf8Path::new("../x")), "../x");
    }
}
