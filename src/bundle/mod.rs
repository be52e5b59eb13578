//! Incremental JavaScript bundling.
//!
//! The [`Bundler`] owns a [`ModuleGraphCache`] that survives between builds.
//! A full build walks the import graph from the entry modules and compiles
//! everything; afterwards a single changed file only costs recompiling that
//! file and the importers that depend on it.
//!
//! Modules are concatenated in a stable topological order: every module comes
//! after all of its dependencies, and ties are broken by the order in which
//! the imports were first discovered from the entries. Identical sources
//! always produce a byte-identical artifact.

mod cache;
mod compile;
mod source;
mod sourcemap;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::Hash32;
use crate::error::{BundleCause, BundleError};

pub use cache::{ModuleGraphCache, ModuleRecord};
pub use compile::{CommonJsCompiler, CompiledModule, Compiler, Fragments, SourceModule, minify};
pub use source::{
    FsSource, Import, MemorySource, ModuleSource, is_relative, is_script, normalize_path,
    resolve_specifier, scan_imports,
};
pub use sourcemap::{SourceMap, SourceMapBuilder, encode_vlq};

/// Which importers get recompiled when a module changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InvalidationPolicy {
    /// Recompile every transitive importer of the changed module.
    #[default]
    Conservative,
    /// Recompile an importer only when the fragment of one of its
    /// dependencies actually changed.
    ContentAware,
}

/// The assembled bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildArtifact {
    pub code: String,
    pub source_map: Option<SourceMap>,
    /// Modules in the order they appear in `code`.
    pub modules: Vec<Utf8PathBuf>,
    pub hash: Hash32,
}

/// A module that has been read and scanned, but not compiled yet.
struct Parsed {
    fingerprint: Hash32,
    source: Arc<str>,
    imports: Vec<Import>,
    dependencies: Vec<Utf8PathBuf>,
}

pub struct Bundler {
    entries: Vec<Utf8PathBuf>,
    source: Box<dyn ModuleSource>,
    compiler: Box<dyn Compiler>,
    policy: InvalidationPolicy,
    output_name: String,
    cache: ModuleGraphCache,
    order: Vec<Utf8PathBuf>,
    artifact: Option<Arc<BuildArtifact>>,
    last_compiled: Vec<Utf8PathBuf>,
    /// The previous pass failed, so the cache may miss modules that the
    /// sources on disk now reference.
    stale: bool,
}

impl Bundler {
    pub fn new<I, P>(entries: I, source: impl ModuleSource + 'static) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Utf8PathBuf>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|entry| normalize_path(&entry.into()))
                .collect(),
            source: Box::new(source),
            compiler: Box::new(CommonJsCompiler),
            policy: InvalidationPolicy::default(),
            output_name: "bundle.js".into(),
            cache: ModuleGraphCache::new(),
            order: vec![],
            artifact: None,
            last_compiled: vec![],
            stale: false,
        }
    }

    pub fn with_compiler(mut self, compiler: impl Compiler + 'static) -> Self {
        self.compiler = Box::new(compiler);
        self
    }

    pub fn with_policy(mut self, policy: InvalidationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// File name recorded in the source map.
    pub fn with_output_name(mut self, name: impl Into<String>) -> Self {
        self.output_name = name.into();
        self
    }

    pub fn entries(&self) -> &[Utf8PathBuf] {
        &self.entries
    }

    pub fn policy(&self) -> InvalidationPolicy {
        self.policy
    }

    pub fn cache(&self) -> &ModuleGraphCache {
        &self.cache
    }

    /// The last artifact that was built successfully.
    pub fn artifact(&self) -> Option<Arc<BuildArtifact>> {
        self.artifact.clone()
    }

    /// Modules compiled by the last rebuild, in compilation order.
    pub fn last_compiled(&self) -> &[Utf8PathBuf] {
        &self.last_compiled
    }

    /// Rebuilds the bundle.
    ///
    /// `None` resolves the whole graph from the entries. `Some(path)` treats
    /// `path` as edited and only recompiles what depends on it; a path outside
    /// of the graph leaves everything as it is.
    ///
    /// On error the cache and the last artifact are left untouched.
    pub fn rebuild(&mut self, changed: Option<&Utf8Path>) -> Result<Arc<BuildArtifact>, BundleError> {
        let result = match (changed, self.artifact.clone()) {
            (Some(path), Some(current)) if !self.stale => {
                self.rebuild_module(&normalize_path(path), current)
            }
            _ => self.rebuild_full(),
        };

        self.stale = result.is_err();
        result
    }

    /// One full resolve followed by minification, for production output.
    /// The minified artifact carries no source map.
    pub fn bundle_once(&mut self) -> Result<BuildArtifact, BundleError> {
        let artifact = self.rebuild(None)?;
        let code = minify(&artifact.code);

        Ok(BuildArtifact {
            hash: Hash32::hash(&code),
            code,
            source_map: None,
            modules: artifact.modules.clone(),
        })
    }

    fn rebuild_full(&mut self) -> Result<Arc<BuildArtifact>, BundleError> {
        let mut parsed = HashMap::new();
        self.collect(self.entries.clone(), &mut parsed, |_| false)?;

        let order = module_order(&self.entries, |path| {
            parsed.get(path).map(|module| module.dependencies.as_slice())
        });

        let (staged, compiled) = self.compile_pass(&order, &parsed, false, |_, _, _| true)?;

        self.cache.replace_all(staged.into_values());
        self.order = order;
        self.last_compiled = compiled;

        Ok(self.publish())
    }

    fn rebuild_module(
        &mut self,
        path: &Utf8Path,
        current: Arc<BuildArtifact>,
    ) -> Result<Arc<BuildArtifact>, BundleError> {
        let Some(previous) = self.cache.get(path).map(|record| record.fingerprint) else {
            tracing::debug!(%path, "not part of the module graph");
            self.last_compiled.clear();
            return Ok(current);
        };

        let module = self.parse(path)?;
        if module.fingerprint == previous {
            tracing::debug!(%path, "fingerprint unchanged");
            self.last_compiled.clear();
            return Ok(current);
        }

        let discovered: Vec<_> = module
            .dependencies
            .iter()
            .filter(|dep| !self.cache.contains(dep))
            .cloned()
            .collect();

        let mut parsed = HashMap::from([(path.to_path_buf(), module)]);
        self.collect(discovered, &mut parsed, |dep| self.cache.contains(dep))?;

        let order = module_order(&self.entries, |module| {
            parsed
                .get(module)
                .map(|parsed| parsed.dependencies.as_slice())
                .or_else(|| {
                    self.cache
                        .get(module)
                        .map(|record| record.dependencies.as_slice())
                })
        });

        let importers = match self.policy {
            InvalidationPolicy::Conservative => self.cache.dependents_closure(path),
            InvalidationPolicy::ContentAware => Default::default(),
        };
        let policy = self.policy;

        let (staged, compiled) =
            self.compile_pass(&order, &parsed, true, |module, deps, changed| {
                parsed.contains_key(module)
                    || match policy {
                        InvalidationPolicy::Conservative => importers.contains(module),
                        InvalidationPolicy::ContentAware => {
                            deps.iter().any(|dep| changed.contains(dep))
                        }
                    }
            })?;

        let reachable: HashSet<&Utf8Path> = order.iter().map(Utf8PathBuf::as_path).collect();
        let unreachable: Vec<Utf8PathBuf> = self
            .cache
            .paths()
            .filter(|path| !reachable.contains(path))
            .map(Utf8Path::to_path_buf)
            .collect();

        for record in staged.into_values() {
            self.cache.insert(record);
        }
        for path in &unreachable {
            self.cache.remove(path);
        }
        if !unreachable.is_empty() {
            tracing::debug!(count = unreachable.len(), "dropped unreachable modules");
        }

        self.order = order;
        self.last_compiled = compiled;

        Ok(self.publish())
    }

    /// Reads and scans every module reachable from `roots`, skipping the
    /// ones already parsed or accepted by `skip`.
    fn collect(
        &self,
        roots: Vec<Utf8PathBuf>,
        parsed: &mut HashMap<Utf8PathBuf, Parsed>,
        skip: impl Fn(&Utf8Path) -> bool,
    ) -> Result<(), BundleError> {
        let mut stack: Vec<Utf8PathBuf> = roots.into_iter().rev().collect();

        while let Some(path) = stack.pop() {
            if parsed.contains_key(&path) || skip(&path) {
                continue;
            }

            let module = self.parse(&path)?;
            stack.extend(module.dependencies.iter().rev().cloned());
            parsed.insert(path, module);
        }

        Ok(())
    }

    fn parse(&self, path: &Utf8Path) -> Result<Parsed, BundleError> {
        let bytes = self
            .source
            .read(path)
            .map_err(|e| BundleError::new(path, e))?;
        let fingerprint = Hash32::hash(&bytes);
        let text = String::from_utf8(bytes).map_err(|_| BundleError::new(path, BundleCause::Encoding))?;

        let mut imports = vec![];
        let mut dependencies = vec![];

        if is_script(path) {
            for specifier in scan_imports(&text) {
                if !is_relative(&specifier) {
                    imports.push(Import {
                        specifier,
                        resolved: None,
                    });
                    continue;
                }

                let resolved = resolve_specifier(&*self.source, path, &specifier)
                    .ok_or_else(|| BundleError::new(path, BundleCause::Resolve(specifier.clone())))?;

                if !dependencies.contains(&resolved) {
                    dependencies.push(resolved.clone());
                }
                imports.push(Import {
                    specifier,
                    resolved: Some(resolved),
                });
            }
        }

        Ok(Parsed {
            fingerprint,
            source: Arc::from(text),
            imports,
            dependencies,
        })
    }

    /// Compiles the modules selected by `dirty` in `order`. Each module sees
    /// the fragments of the modules before it, exactly as in a full build.
    fn compile_pass(
        &self,
        order: &[Utf8PathBuf],
        parsed: &HashMap<Utf8PathBuf, Parsed>,
        use_cache: bool,
        dirty: impl Fn(&Utf8Path, &[Utf8PathBuf], &HashSet<Utf8PathBuf>) -> bool,
    ) -> Result<(HashMap<Utf8PathBuf, ModuleRecord>, Vec<Utf8PathBuf>), BundleError> {
        let cache = use_cache.then_some(&self.cache);

        let mut staged: HashMap<Utf8PathBuf, ModuleRecord> = HashMap::new();
        let mut compiled = vec![];
        let mut changed: HashSet<Utf8PathBuf> = HashSet::new();
        let mut visible: HashSet<Utf8PathBuf> = HashSet::new();

        for path in order {
            let (fingerprint, source, imports, dependencies) = match parsed.get(path) {
                Some(module) => (
                    module.fingerprint,
                    module.source.clone(),
                    &module.imports,
                    &module.dependencies,
                ),
                None => match cache.and_then(|cache| cache.get(path)) {
                    Some(record) => (
                        record.fingerprint,
                        record.source.clone(),
                        &record.imports,
                        &record.dependencies,
                    ),
                    None => continue,
                },
            };

            if dirty(path, dependencies.as_slice(), &changed) {
                let view = View {
                    staged: &staged,
                    cache,
                    visible: &visible,
                };
                let module = SourceModule {
                    path,
                    text: &source,
                    imports,
                };
                let output = self
                    .compiler
                    .compile(&module, &view)
                    .map_err(|e| BundleError::new(path, BundleCause::Compile(e)))?;

                let fragment_hash = Hash32::hash(&output.code);
                let previous = cache
                    .and_then(|cache| cache.get(path))
                    .map(|record| record.fragment_hash);
                if previous != Some(fragment_hash) {
                    changed.insert(path.clone());
                }

                let record = ModuleRecord {
                    path: path.clone(),
                    fingerprint,
                    imports: imports.clone(),
                    dependencies: dependencies.clone(),
                    source,
                    fragment: Arc::from(output.code),
                    fragment_hash,
                    source_line: output.source_line,
                };

                staged.insert(path.clone(), record);
                compiled.push(path.clone());
            }

            visible.insert(path.clone());
        }

        Ok((staged, compiled))
    }

    /// Assembles the artifact from the committed cache and makes it current.
    fn publish(&mut self) -> Arc<BuildArtifact> {
        let mut code = self.compiler.prelude();
        let mut map = SourceMapBuilder::new(self.output_name.clone());
        map.skip_lines(code.lines().count());

        for record in self.order.iter().filter_map(|path| self.cache.get(path)) {
            let fragment_lines = record.fragment.lines().count();

            match record.source_line {
                Some(offset) => {
                    let index = map.add_source(record.path.as_str(), &*record.source);
                    let source_lines = record.source.lines().count();
                    let offset = offset as usize;

                    map.skip_lines(offset);
                    for line in 0..source_lines {
                        map.map_line(index, line as u32);
                    }
                    map.skip_lines(fragment_lines.saturating_sub(offset + source_lines));
                }
                None => map.skip_lines(fragment_lines),
            }

            code.push_str(&record.fragment);
            if !record.fragment.ends_with('\n') {
                code.push('\n');
            }
        }

        let entries: Vec<&Utf8Path> = self.entries.iter().map(Utf8PathBuf::as_path).collect();
        code.push_str(&self.compiler.epilogue(&entries));

        let artifact = Arc::new(BuildArtifact {
            hash: Hash32::hash(&code),
            code,
            source_map: Some(map.build()),
            modules: self.order.clone(),
        });

        tracing::info!(
            modules = artifact.modules.len(),
            compiled = self.last_compiled.len(),
            hash = %artifact.hash,
            "bundle assembled"
        );

        self.artifact = Some(artifact.clone());
        artifact
    }
}

/// Fragments visible to a module while it is being compiled: only those of
/// modules placed before it.
struct View<'a> {
    staged: &'a HashMap<Utf8PathBuf, ModuleRecord>,
    cache: Option<&'a ModuleGraphCache>,
    visible: &'a HashSet<Utf8PathBuf>,
}

impl Fragments for View<'_> {
    fn fragment(&self, path: &Utf8Path) -> Option<&str> {
        if !self.visible.contains(path) {
            return None;
        }

        self.staged
            .get(path)
            .or_else(|| self.cache.and_then(|cache| cache.get(path)))
            .map(|record| &*record.fragment)
    }
}

/// Depth-first post-order from the entries. A module is marked visited as
/// soon as it is entered, which breaks import cycles at the first back edge.
fn module_order<'a, F>(entries: &'a [Utf8PathBuf], dependencies: F) -> Vec<Utf8PathBuf>
where
    F: Fn(&Utf8Path) -> Option<&'a [Utf8PathBuf]>,
{
    let mut order = Vec::new();
    let mut visited: HashSet<&'a Utf8Path> = HashSet::new();
    let mut stack: Vec<(&'a Utf8Path, &'a [Utf8PathBuf], usize)> = Vec::new();

    for entry in entries {
        if !visited.insert(entry.as_path()) {
            continue;
        }
        stack.push((entry.as_path(), dependencies(entry).unwrap_or_default(), 0));

        while let Some(top) = stack.last_mut() {
            let (path, deps) = (top.0, top.1);
            let next = deps.get(top.2);
            top.2 += 1;

            match next {
                Some(dep) => {
                    if visited.insert(dep.as_path()) {
                        stack.push((dep.as_path(), dependencies(dep).unwrap_or_default(), 0));
                    }
                }
                None => {
                    order.push(path.to_path_buf());
                    stack.pop();
                }
            }
        }
    }

    order
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> Arc<MemorySource> {
        Arc::new(MemorySource::with([
            ("a.js", "var b = require('./b');\nmodule.exports = 'a' + b;\n"),
            ("b.js", "var c = require('./c');\nmodule.exports = 'b' + c;\n"),
            ("c.js", "module.exports = 1;\n"),
        ]))
    }

    fn paths(items: &[&str]) -> Vec<Utf8PathBuf> {
        items.iter().map(|item| Utf8PathBuf::from(*item)).collect()
    }

    #[test]
    fn full_build_orders_dependencies_first() {
        let mut bundler = Bundler::new(["a.js"], chain());
        let artifact = bundler.rebuild(None).unwrap();

        assert_eq!(artifact.modules, paths(&["c.js", "b.js", "a.js"]));
        assert_eq!(bundler.last_compiled(), paths(&["c.js", "b.js", "a.js"]));
        assert_eq!(bundler.cache().len(), 3);
        assert!(bundler.cache().is_coherent());

        let c = artifact.code.find("\"c.js\"").unwrap();
        let a = artifact.code.find("\"a.js\"").unwrap();
        assert!(c < a);
    }

    #[test]
    fn editing_a_leaf_recompiles_its_importers_in_order() {
        let source = chain();
        let mut bundler = Bundler::new(["a.js"], source.clone());
        bundler.rebuild(None).unwrap();

        source.write("c.js", "module.exports = 2;\n");
        let artifact = bundler.rebuild(Some(Utf8Path::new("c.js"))).unwrap();

        assert_eq!(bundler.last_compiled(), paths(&["c.js", "b.js", "a.js"]));
        assert_eq!(artifact.modules, paths(&["c.js", "b.js", "a.js"]));
        assert!(artifact.code.contains("module.exports = 2;"));
        assert!(!artifact.code.contains("module.exports = 1;"));
    }

    #[test]
    fn content_aware_policy_stops_at_unchanged_fragments() {
        let source = chain();
        let mut bundler =
            Bundler::new(["a.js"], source.clone()).with_policy(InvalidationPolicy::ContentAware);
        bundler.rebuild(None).unwrap();

        source.write("c.js", "module.exports = 2;\n");
        bundler.rebuild(Some(Utf8Path::new("c.js"))).unwrap();

        // b's fragment doesn't embed c, so a is left alone
        assert_eq!(bundler.last_compiled(), paths(&["c.js", "b.js"]));
    }

    #[test]
    fn incremental_matches_full_build() {
        let source = chain();
        let mut incremental = Bundler::new(["a.js"], source.clone());
        incremental.rebuild(None).unwrap();

        source.write("b.js", "var c = require('./c');\nvar d = require('./d');\nmodule.exports = c + d;\n");
        source.write("d.js", "module.exports = 'd';\n");
        let patched = incremental.rebuild(Some(Utf8Path::new("b.js"))).unwrap();

        let mut fresh = Bundler::new(["a.js"], source.clone());
        let full = fresh.rebuild(None).unwrap();

        assert_eq!(patched.code, full.code);
        assert_eq!(patched.source_map, full.source_map);
        assert_eq!(patched.modules, paths(&["c.js", "d.js", "b.js", "a.js"]));
        assert!(incremental.cache().is_coherent());
    }

    #[test]
    fn identical_sources_give_identical_bytes() {
        let first = Bundler::new(["a.js"], chain()).rebuild(None).unwrap();
        let second = Bundler::new(["a.js"], chain()).rebuild(None).unwrap();

        assert_eq!(first.code, second.code);
        assert_eq!(first.hash, second.hash);
    }

    #[test]
    fn dropped_imports_are_pruned_from_the_cache() {
        let source = chain();
        let mut bundler = Bundler::new(["a.js"], source.clone());
        bundler.rebuild(None).unwrap();

        source.write("a.js", "var d = require('./d');\n");
        source.write("d.js", "module.exports = 'd';\n");
        let artifact = bundler.rebuild(Some(Utf8Path::new("a.js"))).unwrap();

        assert_eq!(artifact.modules, paths(&["d.js", "a.js"]));
        assert!(!bundler.cache().contains(Utf8Path::new("b.js")));
        assert!(!bundler.cache().contains(Utf8Path::new("c.js")));
        assert!(bundler.cache().is_coherent());
    }

    #[test]
    fn broken_module_keeps_last_good_state() {
        let source = chain();
        let mut bundler = Bundler::new(["a.js"], source.clone());
        let good = bundler.rebuild(None).unwrap();
        let generation = bundler.cache().generation();

        source.write("b.js", "var x = require('./missing');\n");
        let err = bundler.rebuild(Some(Utf8Path::new("b.js"))).unwrap_err();

        assert_eq!(err.module, "b.js");
        assert!(matches!(err.cause, BundleCause::Resolve(ref s) if s == "./missing"));
        assert_eq!(bundler.artifact().unwrap().code, good.code);
        assert_eq!(bundler.cache().generation(), generation);
        assert!(bundler.cache().is_coherent());

        source.write("b.js", "module.exports = 'fixed';\n");
        let fixed = bundler.rebuild(Some(Utf8Path::new("b.js"))).unwrap();
        assert_eq!(fixed.modules, paths(&["b.js", "a.js"]));
    }

    #[test]
    fn failing_compiler_reports_the_module() {
        struct Picky;

        impl Compiler for Picky {
            fn compile(
                &self,
                module: &SourceModule<'_>,
                _: &dyn Fragments,
            ) -> anyhow::Result<CompiledModule> {
                anyhow::ensure!(!module.text.contains("syntax error"), "unexpected token");
                Ok(CompiledModule {
                    code: module.text.to_string(),
                    source_line: Some(0),
                })
            }
        }

        let source = chain();
        source.write("c.js", "syntax error\n");
        let mut bundler = Bundler::new(["a.js"], source).with_compiler(Picky);

        let err = bundler.rebuild(None).unwrap_err();
        assert_eq!(err.module, "c.js");
        assert!(matches!(err.cause, BundleCause::Compile(_)));
        assert!(bundler.artifact().is_none());
        assert!(bundler.cache().is_empty());
    }

    #[test]
    fn paths_outside_the_graph_are_a_no_op() {
        let source = chain();
        source.write("unused.js", "module.exports = 0;\n");
        let mut bundler = Bundler::new(["a.js"], source);
        let before = bundler.rebuild(None).unwrap();
        let generation = bundler.cache().generation();

        let after = bundler.rebuild(Some(Utf8Path::new("unused.js"))).unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(bundler.cache().generation(), generation);

        let again = bundler.rebuild(Some(Utf8Path::new("./c.js"))).unwrap();
        assert!(Arc::ptr_eq(&before, &again));
        assert!(bundler.last_compiled().is_empty());
    }

    #[test]
    fn import_cycles_are_broken_in_discovery_order() {
        let source = MemorySource::with([
            ("x.js", "require('./y');\n"),
            ("y.js", "require('./x');\n"),
        ]);
        let artifact = Bundler::new(["x.js"], source).rebuild(None).unwrap();
        assert_eq!(artifact.modules, paths(&["y.js", "x.js"]));
    }

    #[test]
    fn templates_and_bare_imports() {
        let source = MemorySource::with([
            ("app.js", "var angular = require('angular');\nvar tpl = require('./view.html');\n"),
            ("view.html", "<p>hi</p>"),
        ]);
        let artifact = Bundler::new(["app.js"], source).rebuild(None).unwrap();

        assert_eq!(artifact.modules, paths(&["view.html", "app.js"]));
        assert!(artifact.code.contains(r#"module.exports = "<p>hi</p>";"#));
        assert!(artifact.code.ends_with("__tsumiki_require(\"app.js\");\n"));
    }

    #[test]
    fn source_map_points_back_to_modules() {
        let artifact = Bundler::new(["a.js"], chain()).rebuild(None).unwrap();
        let map = artifact.source_map.as_ref().unwrap();

        assert_eq!(map.sources, vec!["c.js", "b.js", "a.js"]);
        assert_eq!(map.sources_content[0], "module.exports = 1;\n");
        assert_eq!(map.file, "bundle.js");
        assert!(!map.mappings.is_empty());
    }

    #[test]
    fn production_bundle_is_minified() {
        let source = MemorySource::with([("a.js", "    // greeting\n    var x = 1;\n\n")]);
        let artifact = Bundler::new(["a.js"], source).bundle_once().unwrap();

        assert!(artifact.source_map.is_none());
        assert!(artifact.code.contains("\nvar x = 1;\n"));
        assert!(!artifact.code.contains("greeting"));
        assert!(!artifact.code.contains("\n\n"));
    }
}
