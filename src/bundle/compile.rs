//! Turning a single module into a bundle fragment.

use std::collections::BTreeMap;

use camino::Utf8Path;

use crate::bundle::source::{Import, is_script};

/// A module as the compiler sees it.
pub struct SourceModule<'a> {
    pub path: &'a Utf8Path,
    pub text: &'a str,
    pub imports: &'a [Import],
}

/// Fragments of already-compiled dependencies.
///
/// A dependency that hasn't been compiled yet (the back edge of an import
/// cycle) has no fragment.
pub trait Fragments {
    fn fragment(&self, path: &Utf8Path) -> Option<&str>;
}

/// Output of compiling one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledModule {
    pub code: String,
    /// Line of `code` where the module's source starts, if the source is
    /// embedded line for line. Used to emit source map entries.
    pub source_line: Option<u32>,
}

/// Compiles one module into a fragment of the final bundle.
///
/// A compiler may embed the output of the module's dependencies (inlined
/// constants, for example); the bundler guarantees that every dependency
/// listed in `module.imports` that is visible through `deps` is up to date.
pub trait Compiler: Send + Sync {
    fn compile(
        &self,
        module: &SourceModule<'_>,
        deps: &dyn Fragments,
    ) -> anyhow::Result<CompiledModule>;

    /// Code placed before the first module.
    fn prelude(&self) -> String {
        String::new()
    }

    /// Code placed after the last module, given the entry modules.
    fn epilogue(&self, _entries: &[&Utf8Path]) -> String {
        String::new()
    }
}

/// Wraps each module in a registry call, the way browserify-style bundlers
/// do, so that `require` works unchanged in the browser.
///
/// Scripts keep their source line for line; `.html` templates become modules
/// exporting their markup as a string.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommonJsCompiler;

const PRELUDE: &str = r#"(function (global) {
var defs = {}, cache = {};
global.__tsumiki_define = function (id, map, fn) { defs[id] = { map: map, fn: fn }; };
global.__tsumiki_require = function load(id) {
  if (cache[id]) return cache[id].exports;
  var def = defs[id];
  if (!def) return global.require ? global.require(id) : undefined;
  var module = cache[id] = { exports: {} };
  def.fn.call(module.exports, function (id) { return load(def.map[id] || id); }, module, module.exports);
  return module.exports;
};
})(this);
"#;

impl Compiler for CommonJsCompiler {
    fn compile(
        &self,
        module: &SourceModule<'_>,
        _: &dyn Fragments,
    ) -> anyhow::Result<CompiledModule> {
        let id = serde_json::to_string(module.path.as_str())?;

        if !is_script(module.path) {
            let body = serde_json::to_string(module.text)?;
            return Ok(CompiledModule {
                code: format!(
                    "__tsumiki_define({id}, {{}}, function (require, module, exports) {{\nmodule.exports = {body};\n}});\n"
                ),
                source_line: None,
            });
        }

        let map = module
            .imports
            .iter()
            .filter_map(|import| {
                import
                    .resolved
                    .as_ref()
                    .map(|path| (import.specifier.clone(), path.to_string()))
            })
            .collect::<BTreeMap<String, String>>();
        let map = serde_json::to_string(&map)?;

        let mut code = format!("__tsumiki_define({id}, {map}, function (require, module, exports) {{\n");
        code.push_str(module.text);
        if !module.text.ends_with('\n') {
            code.push('\n');
        }
        code.push_str("});\n");

        Ok(CompiledModule {
            code,
            source_line: Some(1),
        })
    }

    fn prelude(&self) -> String {
        PRELUDE.to_string()
    }

    fn epilogue(&self, entries: &[&Utf8Path]) -> String {
        entries
            .iter()
            .map(|entry| {
                let id = serde_json::to_string(entry.as_str()).unwrap_or_default();
                format!("__tsumiki_require({id});\n")
            })
            .collect()
    }
}

/// A whitespace-level minifier for production bundles.
///
/// Strips indentation, trailing whitespace, blank lines and whole-line `//`
/// comments. It never rewrites code inside a line, but it does work line by
/// line without tokenizing: a multi-line template literal or string loses
/// its indentation, its blank lines and any of its lines that start with
/// `//`. Only use it on scripts without multi-line literals.
pub fn minify(code: &str) -> String {
    let mut out = String::with_capacity(code.len());

    for line in code.lines() {
        let line = line.trim();
        if line.is_empty() || (line.starts_with("//") && !line.starts_with("//#")) {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }

    out
}
